//! The reconciliation store: owns [`MonitorState`], wires the transports into
//! it and runs the connect / failover lifecycle.
//!
//! Each initialization and each teardown starts a new session epoch.
//! Transport callbacks capture the epoch they were registered under and are
//! dropped once it is stale, so a late WebSocket event or HTTP response from a
//! torn-down session can never touch state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::config::{ConnectionType, MonitorConfig};
use crate::error::{MonitorError, TransportError};
use crate::events::{ConnectionStatus, EventKind, HandlerId, WsEvent};
use crate::poller::{PollErrorCallback, Poller};
use crate::protocol::TelemetryMessage;
use crate::state::MonitorState;
use crate::types::{Module, Snapshot};
use crate::ws::{ErrorCallback, WsClient, WsSettings};

const MODULE_CONNECTION_FAILED: &str = "connection failed";

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

struct StoreInner {
    config: MonitorConfig,
    state: watch::Sender<MonitorState>,
    ws: WsClient,
    poller: Poller,
    epoch: AtomicU64,
    listeners: Mutex<Vec<(EventKind, HandlerId)>>,
    pending_init: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.pending_init).take() {
            task.abort();
        }
        self.poller.stop_polling();
        self.ws.disconnect();
    }
}

/// Handle to the store. Clones share the same state and transports.
#[derive(Clone)]
pub struct MonitorStore {
    inner: Arc<StoreInner>,
}

impl MonitorStore {
    pub fn new(config: MonitorConfig) -> Result<Self, MonitorError> {
        config.validate()?;
        let api = ApiClient::new(&config)?;
        let poller = Poller::new(api, &config);
        let ws = WsClient::new(WsSettings::from_config(&config));
        let (state, _) = watch::channel(MonitorState::new(config.initial_transport));
        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                state,
                ws,
                poller,
                epoch: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                pending_init: Mutex::new(None),
            }),
        })
    }

    fn from_weak(weak: &Weak<StoreInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn api(&self) -> &ApiClient {
        self.inner.poller.api()
    }

    /// Current state, cloned.
    pub fn state(&self) -> MonitorState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that is notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.inner.state.subscribe()
    }

    pub fn ingest(&self, snap: Snapshot) {
        if snap.is_empty() {
            return;
        }
        let now = now_millis();
        self.inner.state.send_modify(|s| s.ingest_at(snap, now));
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.state.send_modify(|s| s.connection.connected = connected);
    }

    pub fn set_loading(&self, loading: bool) {
        self.inner.state.send_modify(|s| s.connection.loading = loading);
    }

    pub fn set_error(&self, error: Option<String>) {
        self.inner.state.send_modify(|s| s.connection.error = error);
    }

    pub fn set_module_loading(&self, module: Module, loading: bool) {
        self.inner.state.send_modify(|s| s.set_module_loading(module, loading));
    }

    pub fn set_module_error(&self, module: Module, error: Option<String>) {
        self.inner.state.send_modify(|s| s.set_module_error(module, error));
    }

    fn current_epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.current_epoch() == epoch
    }

    /// Start a new epoch and apply `f`, atomically with respect to `apply`.
    fn advance_epoch<F: FnOnce(&mut MonitorState)>(&self, f: F) -> u64 {
        let mut epoch = 0;
        self.inner.state.send_modify(|s| {
            epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            f(s);
        });
        epoch
    }

    /// Apply `f` only while `epoch` is still the current session.
    fn apply<F: FnOnce(&mut MonitorState)>(&self, epoch: u64, f: F) -> bool {
        let applied = self.inner.state.send_if_modified(|s| {
            if !self.is_current(epoch) {
                return false;
            }
            f(s);
            true
        });
        if !applied {
            debug!(epoch, current = self.current_epoch(), "dropping callback from stale session");
        }
        applied
    }

    fn ingest_for(&self, epoch: u64, snap: Snapshot) {
        let now = now_millis();
        self.apply(epoch, |s| s.ingest_at(snap, now));
    }

    /// Connect using the current connection type. Does nothing when already
    /// connected. Failures end up in the state, never in a returned error.
    pub async fn initialize_connection(&self) {
        let connection = self.state().connection;
        if connection.connected {
            debug!("already connected; skipping initialization");
            return;
        }
        let epoch = self.advance_epoch(MonitorState::begin_loading);
        info!(transport = %connection.connection_type, epoch, "initializing connection");

        match connection.connection_type {
            ConnectionType::WebSocket => self.init_websocket(epoch),
            ConnectionType::Http => self.init_http(epoch).await,
            ConnectionType::None => {
                info!("transport disabled");
                self.apply(epoch, |s| {
                    s.connection.loading = false;
                    for loading in s.module_loading.values_mut() {
                        *loading = false;
                    }
                });
            }
        }
    }

    fn init_websocket(&self, epoch: u64) {
        self.register_listeners(epoch);

        if self.inner.ws.is_connected() {
            self.apply(epoch, |s| {
                s.connection.connected = true;
                s.connection.loading = false;
            });
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let on_error: ErrorCallback = Box::new(move |err: &TransportError| {
            if let Some(store) = MonitorStore::from_weak(&weak) {
                store.websocket_failed(epoch, err);
            }
        });
        self.inner.ws.connect(None, Some(on_error));
    }

    // Re-registering replaces the previous session's handlers.
    fn register_listeners(&self, epoch: u64) {
        self.unregister_listeners();
        let ws = &self.inner.ws;
        let mut ids = Vec::with_capacity(3);

        for kind in [EventKind::MonitorData, EventKind::ModuleData] {
            let weak = Arc::downgrade(&self.inner);
            let id = ws.on(kind, move |ev| {
                if let (Some(store), WsEvent::Telemetry(msg)) = (MonitorStore::from_weak(&weak), ev) {
                    store.ingest_for(epoch, msg.clone().into_snapshot());
                }
            });
            ids.push((kind, id));
        }

        let weak = Arc::downgrade(&self.inner);
        let id = ws.on(EventKind::Connection, move |ev| {
            if let (Some(store), WsEvent::Connection(status)) = (MonitorStore::from_weak(&weak), ev) {
                store.connection_changed(epoch, status);
            }
        });
        ids.push((EventKind::Connection, id));

        *lock(&self.inner.listeners) = ids;
    }

    fn unregister_listeners(&self) {
        let ids = std::mem::take(&mut *lock(&self.inner.listeners));
        for (kind, id) in ids {
            self.inner.ws.off(kind, Some(id));
        }
    }

    fn connection_changed(&self, epoch: u64, status: &ConnectionStatus) {
        match status {
            ConnectionStatus::Connected => {
                self.apply(epoch, |s| {
                    s.connection.connected = true;
                    s.connection.loading = false;
                    s.connection.error = None;
                });
            }
            ConnectionStatus::Disconnected { .. } => {
                self.apply(epoch, |s| s.connection.connected = false);
            }
            ConnectionStatus::Error { message } => {
                let message = message.clone();
                self.apply(epoch, |s| {
                    s.connection.connected = false;
                    s.connection.error = Some(message);
                });
            }
            ConnectionStatus::Failed => {
                let attempts = self.inner.config.max_reconnect_attempts;
                let err = MonitorError::ConnectionExhausted(format!(
                    "connection failed after {attempts} reconnect attempts"
                ));
                self.apply(epoch, |s| {
                    s.connection.connected = false;
                    s.connection.loading = false;
                    s.connection.error = Some(err.to_string());
                });
            }
        }
    }

    // Connect-time failure of the WebSocket: record it and fall back to HTTP.
    // The HTTP path never falls back again.
    fn websocket_failed(&self, epoch: u64, err: &TransportError) {
        let message = err.to_string();
        let applied = self.apply(epoch, |s| {
            s.connection.connected = false;
            s.connection.loading = false;
            s.connection.error = Some(message);
        });
        if applied {
            warn!(error = %err, "websocket connection failed; falling back to HTTP polling");
            self.switch_connection_type(ConnectionType::Http);
        }
    }

    async fn init_http(&self, epoch: u64) {
        let api = self.inner.poller.api();
        info!(url = %api.base_url(), "testing HTTP API");
        if !api.test_connection().await {
            let err = MonitorError::ConnectionExhausted(format!(
                "HTTP API at {} is not reachable",
                api.base_url()
            ));
            self.apply(epoch, |s| {
                s.connection.connected = false;
                s.connection.loading = false;
                s.connection.error = Some(err.to_string());
                s.fail_all_modules(MODULE_CONNECTION_FAILED);
            });
            return;
        }
        if !self.is_current(epoch) {
            debug!("initialization superseded during API probe");
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let on_data = move |msg: TelemetryMessage| {
            if let Some(store) = MonitorStore::from_weak(&weak) {
                store.ingest_for(epoch, msg.into_snapshot());
            }
        };
        let weak = Arc::downgrade(&self.inner);
        let on_error: PollErrorCallback = Arc::new(move |err: MonitorError| {
            if let Some(store) = MonitorStore::from_weak(&weak) {
                store.poll_failed(epoch, err);
            }
        });

        // a running session still delivers under its own, older epoch
        if self.inner.poller.is_polling() {
            debug!("replacing polling session from an earlier epoch");
            self.inner.poller.stop_polling();
        }
        match self.inner.poller.start_polling(on_data, Some(on_error)) {
            // a teardown may have slipped in after the check above
            Some(handle) if !self.is_current(epoch) => handle.stop(),
            Some(_) => {}
            None => {
                debug!("polling restarted by a newer initialization");
                return;
            }
        }
        self.apply(epoch, |s| {
            s.connection.connected = true;
            s.connection.loading = false;
            s.connection.error = None;
        });
    }

    fn poll_failed(&self, epoch: u64, err: MonitorError) {
        match err {
            MonitorError::ModuleFetch { module, source } => {
                let message = source.to_string();
                self.apply(epoch, |s| {
                    s.set_module_error(module, Some(message));
                    s.set_module_loading(module, false);
                });
            }
            // polling carries on; the next ingest clears the error
            other => {
                let message = other.to_string();
                self.apply(epoch, |s| s.connection.error = Some(message));
            }
        }
    }

    // Stop every transport and invalidate outstanding callbacks.
    fn teardown(&self) {
        if let Some(task) = lock(&self.inner.pending_init).take() {
            task.abort();
        }
        self.unregister_listeners();
        self.inner.ws.disconnect();
        self.inner.poller.stop_polling();
        self.advance_epoch(|s| s.connection.connected = false);
    }

    /// Tear down the active transport. Data and history are kept.
    pub fn disconnect(&self) {
        info!("disconnecting");
        self.teardown();
        self.inner.state.send_modify(|s| s.connection.loading = false);
    }

    /// Reconnect from scratch after the debounce. Does nothing when connected.
    pub fn retry_connection(&self) {
        if self.state().connection.connected {
            debug!("already connected; retry skipped");
            return;
        }
        info!("retrying connection");
        self.teardown();
        self.inner.ws.reset_reconnect_attempts();
        self.inner.state.send_modify(|s| {
            s.connection.loading = true;
            s.connection.error = None;
        });
        self.schedule_initialize();
    }

    /// Switch transports and reconnect after the debounce. Switching to the
    /// type already in use does nothing.
    pub fn switch_connection_type(&self, connection_type: ConnectionType) {
        if self.state().connection.connection_type == connection_type {
            debug!(%connection_type, "connection type unchanged");
            return;
        }
        info!(%connection_type, "switching connection type");
        self.teardown();
        self.inner.state.send_modify(|s| {
            s.connection.connection_type = connection_type;
            s.connection.connected = false;
            s.connection.loading = true;
            s.connection.error = None;
        });
        self.schedule_initialize();
    }

    fn schedule_initialize(&self) {
        let delay = self.inner.config.reinit_debounce();
        let store = self.clone();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            store.initialize_connection().await;
        });
        if let Some(previous) = lock(&self.inner.pending_init).replace(task) {
            previous.abort();
        }
    }

    /// Whether a debounced re-initialization is still waiting to run.
    pub fn has_pending_initialize(&self) -> bool {
        lock(&self.inner.pending_init)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

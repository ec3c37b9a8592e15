//! WebSocket transport: keeps one connection to the monitoring service,
//! re-emits inbound frames as typed events and reconnects with linear backoff.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::{ProtocolError, TransportError};
use crate::events::{ConnectionStatus, EventBus, EventKind, HandlerId, WsEvent};
use crate::protocol::TelemetryMessage;

pub const NORMAL_CLOSURE: u16 = 1000;
pub const NO_STATUS_RECEIVED: u16 = 1005;
pub const ABNORMAL_CLOSURE: u16 = 1006;

pub type OpenCallback = Box<dyn FnOnce() + Send>;
pub type ErrorCallback = Box<dyn FnOnce(&TransportError) + Send>;

/// Only a normal closure is final; anything else goes through the
/// reconnect policy.
pub fn should_reconnect(close_code: u16) -> bool {
    close_code != NORMAL_CLOSURE
}

#[derive(Debug, Clone)]
pub struct WsSettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

impl WsSettings {
    pub fn from_config(cfg: &MonitorConfig) -> Self {
        Self {
            url: cfg.ws_base_url.clone(),
            connect_timeout: cfg.connect_timeout(),
            reconnect_interval: cfg.reconnect_interval(),
            max_reconnect_attempts: cfg.max_reconnect_attempts,
        }
    }
}

/// Bounded linear backoff: attempt `n` waits `interval * n`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    interval: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            attempts: 0,
        }
    }

    /// Count one more attempt and return its delay, or `None` once the
    /// ceiling has been reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.interval * self.attempts)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Open,
}

struct WsState {
    phase: Phase,
    // bumped by every connect/disconnect; tasks from older sessions stand down
    session: u64,
    cancel: Option<CancellationToken>,
    reconnect_timer: Option<JoinHandle<()>>,
    policy: ReconnectPolicy,
    // callbacks of the attempt in flight
    on_open: Option<OpenCallback>,
    on_error: Option<ErrorCallback>,
}

struct WsInner {
    settings: WsSettings,
    bus: EventBus,
    state: Mutex<WsState>,
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct WsClient {
    inner: Arc<WsInner>,
}

impl WsClient {
    pub fn new(settings: WsSettings) -> Self {
        let policy = ReconnectPolicy::new(settings.reconnect_interval, settings.max_reconnect_attempts);
        Self {
            inner: Arc::new(WsInner {
                settings,
                bus: EventBus::new(),
                state: Mutex::new(WsState {
                    phase: Phase::Idle,
                    session: 0,
                    cancel: None,
                    reconnect_timer: None,
                    policy,
                    on_open: None,
                    on_error: None,
                }),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.settings.url
    }

    fn state(&self) -> MutexGuard<'_, WsState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&WsEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: Option<HandlerId>) {
        self.inner.bus.off(kind, id)
    }

    pub fn is_connected(&self) -> bool {
        self.state().phase == Phase::Open
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.state().policy.attempts()
    }

    pub fn reset_reconnect_attempts(&self) {
        self.state().policy.reset();
    }

    /// Open the connection unless one is already open or in flight. When
    /// already open, `on_open` runs immediately. When an attempt is in
    /// flight, the given callbacks replace that attempt's callbacks.
    pub fn connect(&self, on_open: Option<OpenCallback>, on_error: Option<ErrorCallback>) {
        let (session, token) = {
            let mut st = self.state();
            let phase = st.phase;
            match phase {
                Phase::Open => {
                    drop(st);
                    debug!("websocket already open");
                    if let Some(cb) = on_open {
                        cb();
                    }
                    return;
                }
                Phase::Connecting => {
                    debug!("websocket connect already in flight");
                    if on_open.is_some() {
                        st.on_open = on_open;
                    }
                    if on_error.is_some() {
                        st.on_error = on_error;
                    }
                    return;
                }
                Phase::Idle => {}
            }
            st.phase = Phase::Connecting;
            st.on_open = on_open;
            st.on_error = on_error;
            st.session += 1;
            let token = CancellationToken::new();
            st.cancel = Some(token.clone());
            (st.session, token)
        };

        let client = self.clone();
        tokio::spawn(async move {
            client.run_session(session, token).await;
        });
    }

    /// Close with a normal closure and cancel any pending reconnect.
    pub fn disconnect(&self) {
        let mut st = self.state();
        st.session += 1;
        if let Some(token) = st.cancel.take() {
            token.cancel();
        }
        if let Some(timer) = st.reconnect_timer.take() {
            timer.abort();
        }
        st.policy.reset();
        st.phase = Phase::Idle;
        st.on_open = None;
        st.on_error = None;
        info!("websocket disconnected");
    }

    async fn run_session(self, session: u64, token: CancellationToken) {
        let settings = &self.inner.settings;
        let started = Instant::now();
        info!(url = %settings.url, "connecting websocket");

        let attempt = tokio::select! {
            _ = token.cancelled() => {
                debug!("websocket connect cancelled");
                return;
            }
            res = timeout(settings.connect_timeout, connect_async(settings.url.as_str())) => res,
        };
        let ws = match attempt {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                self.fail_connect(session, TransportError::WebSocket(e));
                return;
            }
            Err(_) => {
                let err = TransportError::ConnectTimeout(settings.connect_timeout);
                self.fail_connect(session, err);
                return;
            }
        };

        let on_open = {
            let mut st = self.state();
            if st.session != session {
                debug!("websocket session superseded; dropping socket");
                return;
            }
            st.phase = Phase::Open;
            st.policy.reset();
            st.on_error = None;
            st.on_open.take()
        };
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "websocket connected");
        if let Some(cb) = on_open {
            cb();
        }
        self.inner.bus.emit(&WsEvent::Connection(ConnectionStatus::Connected));

        let (mut sink, mut stream) = ws.split();
        let (code, reason) = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    break (NORMAL_CLOSURE, "client disconnect".to_string());
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.dispatch(text),
                        Err(_) => warn!(error = %ProtocolError::NotText, "dropping websocket frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    }
                    // ping/pong are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read failed");
                        self.inner.bus.emit(&WsEvent::Connection(ConnectionStatus::Error {
                            message: e.to_string(),
                        }));
                        break (ABNORMAL_CLOSURE, e.to_string());
                    }
                    None => break (ABNORMAL_CLOSURE, "stream ended".to_string()),
                }
            }
        };

        let intentional = token.is_cancelled();
        {
            let mut st = self.state();
            if st.session == session {
                st.phase = Phase::Idle;
                st.cancel = None;
            }
        }
        info!(code, %reason, "websocket closed");
        self.inner
            .bus
            .emit(&WsEvent::Connection(ConnectionStatus::Disconnected { code, reason }));
        if !intentional && should_reconnect(code) {
            self.schedule_reconnect(session);
        }
    }

    fn fail_connect(&self, session: u64, err: TransportError) {
        let on_error = {
            let mut st = self.state();
            if st.session != session {
                debug!(error = %err, "ignoring connect failure of a superseded session");
                return;
            }
            st.phase = Phase::Idle;
            st.cancel = None;
            st.on_open = None;
            st.on_error.take()
        };
        warn!(error = %err, "websocket connect failed");
        if let Some(cb) = on_error {
            cb(&err);
        }
        self.inner.bus.emit(&WsEvent::Connection(ConnectionStatus::Error {
            message: err.to_string(),
        }));
        // on_error may have called disconnect(); the session check covers it
        self.schedule_reconnect(session);
    }

    fn schedule_reconnect(&self, session: u64) {
        let mut st = self.state();
        if st.session != session {
            debug!("session changed; not reconnecting");
            return;
        }
        if let Some(timer) = st.reconnect_timer.take() {
            timer.abort();
        }
        match st.policy.next_delay() {
            Some(delay) => {
                info!(
                    attempt = st.policy.attempts(),
                    max = st.policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling websocket reconnect"
                );
                let client = self.clone();
                st.reconnect_timer = Some(tokio::spawn(async move {
                    sleep(delay).await;
                    client.connect(None, None);
                }));
            }
            None => {
                drop(st);
                error!("websocket reconnect attempts exhausted");
                self.inner.bus.emit(&WsEvent::Connection(ConnectionStatus::Failed));
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match TelemetryMessage::parse(text) {
            Ok(msg) => {
                let event = WsEvent::Telemetry(msg);
                debug!(kind = ?event.kind(), "websocket frame");
                self.inner.bus.emit(&event);
            }
            Err(e) => warn!(error = %e, "dropping websocket frame"),
        }
    }
}

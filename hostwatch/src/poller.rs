//! Interval-driven HTTP polling with a per-module cadence.
//!
//! Every tick starts a poll cycle that fetches the modules due on that poll
//! number, each in its own task, and hands every result to the caller as soon
//! as it arrives. A [`PollGate`] keeps cycles from overlapping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::protocol::TelemetryMessage;
use crate::types::Module;

const MIN_DELAY: Duration = Duration::from_millis(1);

pub type DataCallback = Arc<dyn Fn(TelemetryMessage) + Send + Sync>;
pub type PollErrorCallback = Arc<dyn Fn(MonitorError) + Send + Sync>;

/// Modules due on poll number `n` (the first, immediate poll is `n == 1`).
///
/// system/cpu/memory change fast and are cheap, so they go out every poll;
/// disk, network and processes every 2nd, 3rd and 5th poll.
pub fn modules_for_poll(n: u64) -> Vec<Module> {
    let mut due = vec![Module::System, Module::Cpu, Module::Memory];
    if n % 2 == 0 {
        due.push(Module::Disk);
    }
    if n % 3 == 0 {
        due.push(Module::Network);
    }
    if n % 5 == 0 {
        due.push(Module::Processes);
    }
    due
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Polling {
        cycle: u64,
        started: Instant,
        outstanding: usize,
    },
}

/// Guards against overlapping poll cycles.
///
/// A cycle holds the gate until all its requests settle. Requests that never
/// settle cannot stall polling: once `window` has elapsed the next tick takes
/// the gate anyway.
#[derive(Debug)]
pub struct PollGate {
    state: CycleState,
    window: Duration,
}

impl PollGate {
    pub fn new(window: Duration) -> Self {
        Self {
            state: CycleState::Idle,
            window,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Try to start `cycle` with `requests` outstanding requests.
    pub fn try_begin(&mut self, cycle: u64, now: Instant, requests: usize) -> bool {
        if let CycleState::Polling {
            cycle: prev,
            started,
            outstanding,
        } = self.state
        {
            if now.saturating_duration_since(started) < self.window {
                return false;
            }
            warn!(cycle = prev, outstanding, "poll cycle exceeded its window; releasing gate");
        }
        self.state = if requests == 0 {
            CycleState::Idle
        } else {
            CycleState::Polling {
                cycle,
                started: now,
                outstanding: requests,
            }
        };
        true
    }

    /// Record one settled request. Completions from an abandoned cycle are ignored.
    pub fn complete(&mut self, cycle: u64) {
        if let CycleState::Polling {
            cycle: current,
            started,
            outstanding,
        } = self.state
        {
            if current != cycle {
                return;
            }
            let left = outstanding.saturating_sub(1);
            self.state = if left == 0 {
                CycleState::Idle
            } else {
                CycleState::Polling {
                    cycle,
                    started,
                    outstanding: left,
                }
            };
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

struct Session {
    id: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
    on_data: DataCallback,
    on_error: Option<PollErrorCallback>,
}

struct PollerState {
    delay: Duration,
    next_id: u64,
    session: Option<Session>,
}

#[derive(Clone)]
pub struct Poller {
    api: ApiClient,
    window: Duration,
    state: Arc<Mutex<PollerState>>,
}

/// Stops the polling session it was returned for (and nothing newer).
pub struct StopHandle {
    poller: Poller,
    session: u64,
}

impl StopHandle {
    pub fn stop(self) {
        self.poller.stop_session(Some(self.session));
    }
}

impl Poller {
    pub fn new(api: ApiClient, cfg: &MonitorConfig) -> Self {
        Self {
            api,
            window: cfg.pending_window(),
            state: Arc::new(Mutex::new(PollerState {
                delay: cfg.polling_interval().max(MIN_DELAY),
                next_id: 0,
                session: None,
            })),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.state).session.is_some()
    }

    pub fn polling_delay(&self) -> Duration {
        lock(&self.state).delay
    }

    /// Start polling immediately and then every polling delay. Returns `None`
    /// (and changes nothing) when polling is already active.
    pub fn start_polling<F>(&self, on_data: F, on_error: Option<PollErrorCallback>) -> Option<StopHandle>
    where
        F: Fn(TelemetryMessage) + Send + Sync + 'static,
    {
        let mut st = lock(&self.state);
        if st.session.is_some() {
            debug!("polling already active");
            return None;
        }
        let id = self.spawn_session(&mut st, Arc::new(on_data), on_error);
        Some(StopHandle {
            poller: self.clone(),
            session: id,
        })
    }

    pub fn stop_polling(&self) {
        self.stop_session(None);
    }

    fn stop_session(&self, only: Option<u64>) {
        let mut st = lock(&self.state);
        let matches = match (&st.session, only) {
            (Some(s), Some(id)) => s.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return;
        }
        if let Some(session) = st.session.take() {
            session.token.cancel();
            session.task.abort();
            info!("HTTP polling stopped");
        }
    }

    /// Change the tick interval. An active session restarts with the new
    /// delay and the same callbacks.
    pub fn set_polling_delay(&self, delay: Duration) {
        let mut st = lock(&self.state);
        st.delay = delay.max(MIN_DELAY);
        if let Some(session) = st.session.take() {
            session.token.cancel();
            session.task.abort();
            info!(delay_ms = st.delay.as_millis() as u64, "restarting HTTP polling with new delay");
            self.spawn_session(&mut st, session.on_data, session.on_error);
        }
    }

    fn spawn_session(
        &self,
        st: &mut PollerState,
        on_data: DataCallback,
        on_error: Option<PollErrorCallback>,
    ) -> u64 {
        st.next_id += 1;
        let id = st.next_id;
        let token = CancellationToken::new();
        info!(delay_ms = st.delay.as_millis() as u64, "starting HTTP polling");
        let task = tokio::spawn(run_polling(
            self.api.clone(),
            st.delay,
            self.window,
            token.clone(),
            on_data.clone(),
            on_error.clone(),
        ));
        st.session = Some(Session {
            id,
            token,
            task,
            on_data,
            on_error,
        });
        id
    }
}

// Outcome counts for one cycle's requests.
struct CycleTally {
    due: usize,
    settled: AtomicUsize,
    failed: AtomicUsize,
}

impl CycleTally {
    fn new(due: usize) -> Self {
        Self {
            due,
            settled: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    /// Record one settled request. True for the last one of a cycle in
    /// which every request failed.
    fn settle(&self, ok: bool) -> bool {
        if !ok {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        let settled = self.settled.fetch_add(1, Ordering::SeqCst) + 1;
        settled == self.due && self.failed.load(Ordering::SeqCst) == self.due
    }
}

async fn run_polling(
    api: ApiClient,
    delay: Duration,
    window: Duration,
    token: CancellationToken,
    on_data: DataCallback,
    on_error: Option<PollErrorCallback>,
) {
    let gate = Arc::new(Mutex::new(PollGate::new(window)));
    let mut ticker = interval(delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut count: u64 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let n = count + 1;
        let due = modules_for_poll(n);
        if !lock(&gate).try_begin(n, Instant::now(), due.len()) {
            debug!(poll = n, "previous cycle still pending; skipping tick");
            continue;
        }
        count = n;
        debug!(poll = n, modules = ?due, "poll cycle started");

        let tally = Arc::new(CycleTally::new(due.len()));
        for module in due {
            let api = api.clone();
            let tally = tally.clone();
            let gate = gate.clone();
            let token = token.clone();
            let on_data = on_data.clone();
            let on_error = on_error.clone();
            tokio::spawn(async move {
                let res = tokio::select! {
                    _ = token.cancelled() => return,
                    res = api.fetch_module(module) => res,
                };
                lock(&gate).complete(n);
                if token.is_cancelled() {
                    debug!(%module, "polling stopped; discarding late result");
                    return;
                }
                let outage = tally.settle(res.is_ok());
                match res {
                    Ok(payload) => {
                        debug!(%module, "module data received");
                        on_data(TelemetryMessage::ModuleData(payload));
                    }
                    Err(e) => {
                        warn!(%module, error = %e, "module fetch failed");
                        if let Some(cb) = &on_error {
                            cb(e);
                        }
                    }
                }
                if outage {
                    warn!(poll = n, "every request of the poll cycle failed");
                    if let Some(cb) = &on_error {
                        cb(MonitorError::PollCycleFailed(tally.due));
                    }
                }
            });
        }
    }
    debug!("polling loop exited");
}

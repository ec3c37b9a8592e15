//! Subscriber registry used by the WebSocket client to fan out events.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::error;

use crate::protocol::TelemetryMessage;

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected { code: u16, reason: String },
    Error { message: String },
    /// Reconnect attempts exhausted; terminal until `connect()` is called again.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    Connection(ConnectionStatus),
    Telemetry(TelemetryMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connection,
    MonitorData,
    ModuleData,
}

impl WsEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WsEvent::Connection(_) => EventKind::Connection,
            WsEvent::Telemetry(TelemetryMessage::MonitorData(_)) => EventKind::MonitorData,
            WsEvent::Telemetry(TelemetryMessage::ModuleData(_)) => EventKind::ModuleData,
        }
    }
}

pub type Handler = Arc<dyn Fn(&WsEvent) + Send + Sync>;

/// Returned by [`EventBus::on`]; pass to [`EventBus::off`] to remove one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<(HandlerId, Handler)>>> {
        // A handler never runs under this lock, so poisoning only means a
        // panic elsewhere; the map itself is still consistent.
        self.handlers.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&WsEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one handler, or every handler for `kind` when `id` is `None`.
    pub fn off(&self, kind: EventKind, id: Option<HandlerId>) {
        let mut map = self.handlers();
        match id {
            Some(id) => {
                if let Some(list) = map.get_mut(&kind) {
                    list.retain(|(h, _)| *h != id);
                }
            }
            None => {
                map.remove(&kind);
            }
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers().get(&kind).map_or(0, Vec::len)
    }

    /// Invoke every handler registered for the event's kind, in registration
    /// order. A panicking handler is logged and does not stop the others.
    pub fn emit(&self, event: &WsEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = match self.handlers().get(&kind) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(?kind, "event handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn connected() -> WsEvent {
        WsEvent::Connection(ConnectionStatus::Connected)
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.on(EventKind::Connection, |_| panic!("handler bug"));
        let h = hits.clone();
        bus.on(EventKind::Connection, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&connected());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_one_or_all() {
        let bus = EventBus::new();
        let a = bus.on(EventKind::Connection, |_| {});
        bus.on(EventKind::Connection, |_| {});
        bus.on(EventKind::MonitorData, |_| {});

        bus.off(EventKind::Connection, Some(a));
        assert_eq!(bus.handler_count(EventKind::Connection), 1);

        bus.off(EventKind::Connection, None);
        assert_eq!(bus.handler_count(EventKind::Connection), 0);
        assert_eq!(bus.handler_count(EventKind::MonitorData), 1);
    }

    #[test]
    fn events_reach_only_their_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.on(EventKind::MonitorData, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&connected());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}

//! Live Linux host telemetry client.
//!
//! Telemetry computed by a remote monitoring service reaches a single
//! [`MonitorStore`] over one of two transports: a WebSocket stream
//! ([`ws::WsClient`]) or, as a fallback, per-module HTTP polling
//! ([`poller::Poller`]). The store merges every update into a composite
//! [`Snapshot`], keeps short chart histories and tracks connection and
//! per-module loading/error state. Consumers watch it through
//! [`MonitorStore::subscribe`].

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod poller;
pub mod profiles;
pub mod protocol;
pub mod state;
pub mod store;
pub mod types;
pub mod ws;

pub use config::{ConnectionType, MonitorConfig};
pub use error::{ConfigError, MonitorError, ProtocolError, TransportError};
pub use protocol::TelemetryMessage;
pub use state::{ConnectionState, MonitorState};
pub use store::MonitorStore;
pub use types::{Module, ModulePayload, Snapshot};

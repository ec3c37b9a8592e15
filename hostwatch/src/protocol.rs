//! Wire formats: WebSocket frames and HTTP response envelopes.
//!
//! Frames are validated here, at the transport boundary, so the store only
//! ever sees typed [`TelemetryMessage`] values.

use serde::Deserialize;

use crate::error::{ProtocolError, TransportError};
use crate::types::{Module, ModulePayload, Snapshot};

/// Frame type carrying a full (possibly partial) snapshot.
pub const MONITOR_DATA: &str = "monitor_data";

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryMessage {
    /// `monitor_data`: several slots at once.
    MonitorData(Snapshot),
    /// A single module's data (`module_data` from the poller, or a frame
    /// whose type is a module name).
    ModuleData(ModulePayload),
}

impl TelemetryMessage {
    /// Parse a `{type, data}` text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame: Frame = serde_json::from_str(text)?;
        if frame.kind == MONITOR_DATA {
            let snap: Snapshot = serde_json::from_value(frame.data)?;
            return Ok(TelemetryMessage::MonitorData(snap));
        }
        let module: Module = frame
            .kind
            .parse()
            .map_err(|_| ProtocolError::UnknownType(frame.kind.clone()))?;
        ModulePayload::from_value(module, frame.data)
            .map(TelemetryMessage::ModuleData)
            .map_err(|source| ProtocolError::Payload { module, source })
    }

    pub fn into_snapshot(self) -> Snapshot {
        match self {
            TelemetryMessage::MonitorData(s) => s,
            TelemetryMessage::ModuleData(p) => p.into_snapshot(),
        }
    }
}

/// `{success, data, error?}` envelope returned by every HTTP endpoint.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn into_result(self, endpoint: &str) -> Result<T, TransportError> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(TransportError::Api {
                endpoint: endpoint.to_string(),
                message: "response carried no data".into(),
            }),
            (false, _) => Err(TransportError::Api {
                endpoint: endpoint.to_string(),
                message: self.error.unwrap_or_else(|| "API call failed".into()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_monitor_data_with_subset_of_slots() {
        let msg = TelemetryMessage::parse(
            r#"{"type":"monitor_data","data":{"cpu":{"usage":12.5,"cores":[10.0,15.0]}}}"#,
        )
        .unwrap();
        let snap = msg.into_snapshot();
        assert_eq!(snap.modules(), vec![Module::Cpu]);
        assert_eq!(snap.cpu.unwrap().usage, 12.5);
    }

    #[test]
    fn parses_module_keyed_frame() {
        let msg = TelemetryMessage::parse(r#"{"type":"memory","data":{"percent":42.0}}"#).unwrap();
        match msg {
            TelemetryMessage::ModuleData(ModulePayload::Memory(m)) => assert_eq!(m.percent, 42.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_and_malformed_frames() {
        assert!(matches!(
            TelemetryMessage::parse(r#"{"type":"pong","data":null}"#),
            Err(ProtocolError::UnknownType(t)) if t == "pong"
        ));
        assert!(matches!(
            TelemetryMessage::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            TelemetryMessage::parse(r#"{"type":"processes","data":{"pid":1}}"#),
            Err(ProtocolError::Payload { module: Module::Processes, .. })
        ));
    }

    #[test]
    fn api_envelope_maps_failure_to_error() {
        let ok: ApiResponse<u32> = serde_json::from_str(r#"{"success":true,"data":7}"#).unwrap();
        assert_eq!(ok.into_result("/x").unwrap(), 7);

        let bad: ApiResponse<u32> =
            serde_json::from_str(r#"{"success":false,"data":null,"error":"boom"}"#).unwrap();
        let err = bad.into_result("/x").unwrap_err();
        assert_eq!(err.to_string(), "/x reported failure: boom");
    }
}

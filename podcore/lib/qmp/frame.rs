use serde::Serialize;
use serde_json::Value;

use crate::{PodcoreError, PodcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One inbound frame on the monitor connection, classified.
///
/// The wire carries line-delimited JSON objects; each is a greeting, a
/// command result, a command error, or an unsolicited event notification.
#[derive(Debug)]
pub enum MonitorFrame {
    /// The connection greeting, sent by the hypervisor before the handshake.
    Greeting(Value),

    /// A successful command result.
    Return(Value),

    /// An error response to a command.
    Error {
        /// The error class, e.g. "GenericError".
        class: String,

        /// The human-readable error description.
        desc: String,
    },

    /// An unsolicited event notification.
    Event {
        /// The event's name, e.g. "SHUTDOWN".
        name: String,

        /// The event's data object.
        data: Value,
    },
}

/// One outbound command line on the monitor connection.
#[derive(Debug, Serialize)]
pub struct MonitorRequest<'a> {
    /// The command name.
    pub execute: &'a str,

    /// The command arguments, omitted when empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<&'a Value>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses one monitor line into a classified frame.
pub fn parse_monitor_frame(line: &str) -> PodcoreResult<MonitorFrame> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| PodcoreError::MonitorProtocol(format!("not a JSON object: {}", e)))?;

    let object = value
        .as_object()
        .ok_or_else(|| PodcoreError::MonitorProtocol(format!("not a JSON object: {}", line)))?;

    if let Some(greeting) = object.get("QMP") {
        return crate::Ok(MonitorFrame::Greeting(greeting.clone()));
    }

    if let Some(result) = object.get("return") {
        return crate::Ok(MonitorFrame::Return(result.clone()));
    }

    if let Some(error) = object.get("error") {
        let class = error
            .get("class")
            .and_then(Value::as_str)
            .unwrap_or("GenericError")
            .to_string();
        let desc = error
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return crate::Ok(MonitorFrame::Error { class, desc });
    }

    if let Some(name) = object.get("event").and_then(Value::as_str) {
        let data = object.get("data").cloned().unwrap_or(Value::Null);
        return crate::Ok(MonitorFrame::Event {
            name: name.to_string(),
            data,
        });
    }

    Err(PodcoreError::MonitorProtocol(format!(
        "unclassifiable frame: {}",
        line
    )))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_classification() -> anyhow::Result<()> {
        assert!(matches!(
            parse_monitor_frame(r#"{"QMP": {"version": {}, "capabilities": []}}"#)?,
            MonitorFrame::Greeting(_)
        ));
        assert!(matches!(
            parse_monitor_frame(r#"{"return": {}}"#)?,
            MonitorFrame::Return(_)
        ));

        match parse_monitor_frame(
            r#"{"error": {"class": "GenericError", "desc": "device not found"}}"#,
        )? {
            MonitorFrame::Error { class, desc } => {
                assert_eq!(class, "GenericError");
                assert_eq!(desc, "device not found");
            }
            other => panic!("expected Error, got {:?}", other),
        }

        match parse_monitor_frame(
            r#"{"event": "SHUTDOWN", "timestamp": {"seconds": 1}, "data": {"guest": true}}"#,
        )? {
            MonitorFrame::Event { name, data } => {
                assert_eq!(name, "SHUTDOWN");
                assert_eq!(data["guest"], true);
            }
            other => panic!("expected Event, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_malformed_lines_are_protocol_errors() {
        assert!(matches!(
            parse_monitor_frame("not json"),
            Err(PodcoreError::MonitorProtocol(_))
        ));
        assert!(matches!(
            parse_monitor_frame(r#"{"unexpected": 1}"#),
            Err(PodcoreError::MonitorProtocol(_))
        ));
    }

    #[test]
    fn test_request_serialization_omits_empty_arguments() -> anyhow::Result<()> {
        let line = serde_json::to_string(&MonitorRequest {
            execute: "qmp_capabilities",
            arguments: None,
        })?;
        assert_eq!(line, r#"{"execute":"qmp_capabilities"}"#);
        Ok(())
    }
}

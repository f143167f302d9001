//! Upstream worker event-stream message kinds (§6.1). The orchestrator is
//! tolerant of unknown message kinds; `WorkerEvent::parse` discards them.
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Progress {
        prompt_id: String,
        value: u32,
        max: u32,
    },
    Executed {
        prompt_id: String,
        output: Value,
    },
    Status {
        queue_remaining: u32,
    },
    Heartbeat,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl WorkerEvent {
    /// Parses one raw upstream message. Returns `None` for unrecognized
    /// kinds or malformed payloads rather than erroring the connection.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let envelope: Envelope = serde_json::from_str(raw).ok()?;
        match envelope.kind.as_str() {
            "progress" => Some(WorkerEvent::Progress {
                prompt_id: envelope.data.get("prompt_id")?.as_str()?.to_string(),
                value: envelope.data.get("value")?.as_u64()? as u32,
                max: envelope.data.get("max")?.as_u64()? as u32,
            }),
            "executed" => Some(WorkerEvent::Executed {
                prompt_id: envelope.data.get("prompt_id")?.as_str()?.to_string(),
                output: envelope.data.get("output").cloned().unwrap_or(Value::Null),
            }),
            "status" => Some(WorkerEvent::Status {
                queue_remaining: envelope.data.get("queue_remaining")?.as_u64()? as u32,
            }),
            "ping" | "heartbeat" => Some(WorkerEvent::Heartbeat),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_event() {
        let raw = r#"{"type":"progress","data":{"prompt_id":"abc","value":3,"max":20}}"#;
        let event = WorkerEvent::parse(raw).expect("should parse");
        assert_eq!(
            event,
            WorkerEvent::Progress {
                prompt_id: "abc".into(),
                value: 3,
                max: 20
            }
        );
    }

    #[test]
    fn discards_unknown_kind() {
        let raw = r#"{"type":"totally_unknown","data":{}}"#;
        assert!(WorkerEvent::parse(raw).is_none());
    }

    #[test]
    fn discards_malformed_payload() {
        assert!(WorkerEvent::parse("not json").is_none());
    }
}

//! Envelope: attaches `workspace_id` and a monotonic `event_id` to every
//! `StreamEvent` crossing the wire, so a client can detect gaps and order
//! events from multiple workspaces on one connection.

use serde_json::Value;

use crate::event::StreamEvent;

/// Per-workspace envelope state: tracks the next `event_id` to stamp.
pub struct EnvelopeState {
    pub workspace_id: String,
    pub next_event_id: u64,
}

impl EnvelopeState {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            next_event_id: 1,
        }
    }

    /// Serializes `event` and stamps `workspace_id` + `event_id`, advancing state.
    pub fn to_json(&mut self, event: &StreamEvent) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(event)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "workspace_id".to_string(),
                Value::String(self.workspace_id.clone()),
            );
            obj.insert(
                "event_id".to_string(),
                Value::Number(serde_json::Number::from(self.next_event_id)),
            );
        }
        self.next_event_id += 1;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_workspace_id_and_increasing_event_id() {
        let mut state = EnvelopeState::new("ws-1");
        let e1 = state
            .to_json(&StreamEvent::StreamStart {
                message_id: "m1".into(),
                replay: false,
            })
            .unwrap();
        let e2 = state
            .to_json(&StreamEvent::StreamEnd {
                message_id: "m1".into(),
                ttft_ms: None,
            })
            .unwrap();
        assert_eq!(e1["workspace_id"], "ws-1");
        assert_eq!(e1["event_id"], 1);
        assert_eq!(e2["event_id"], 2);
    }
}

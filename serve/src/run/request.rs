//! Turns a [`loom::agent_session::AgentSession::send_message`] outcome into
//! the wire response for a `run` request.

use loom::agent_session::SendMessageOutcome;

use crate::protocol::{CompactionDeferredResponse, RunStartedResponse, ServerResponse};

pub(super) fn outcome_response(request_id: String, outcome: SendMessageOutcome) -> ServerResponse {
    match outcome {
        SendMessageOutcome::Started { message_id, compaction_warning } => {
            ServerResponse::RunStarted(RunStartedResponse {
                id: request_id,
                message_id,
                compaction_warning,
            })
        }
        SendMessageOutcome::CompactionDeferred { compaction_request_message_id } => {
            ServerResponse::CompactionDeferred(CompactionDeferredResponse {
                id: request_id,
                compaction_request_message_id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_outcome_maps_to_run_started() {
        let outcome = SendMessageOutcome::Started { message_id: "m1".into(), compaction_warning: Some(0.9) };
        let resp = outcome_response("req-1".into(), outcome);
        match resp {
            ServerResponse::RunStarted(r) => {
                assert_eq!(r.id, "req-1");
                assert_eq!(r.message_id, "m1");
                assert_eq!(r.compaction_warning, Some(0.9));
            }
            _ => panic!("expected RunStarted"),
        }
    }

    #[test]
    fn compaction_deferred_outcome_maps_to_compaction_deferred() {
        let outcome = SendMessageOutcome::CompactionDeferred { compaction_request_message_id: "c1".into() };
        let resp = outcome_response("req-2".into(), outcome);
        match resp {
            ServerResponse::CompactionDeferred(r) => {
                assert_eq!(r.id, "req-2");
                assert_eq!(r.compaction_request_message_id, "c1");
            }
            _ => panic!("expected CompactionDeferred"),
        }
    }
}

//! Handle a `run` request: start a message on a workspace, then stream its
//! events back to the client.
//!
//! Flow: `agent_session.send_message` (append + maybe start a stream) →
//! send `RunStarted`/`CompactionDeferred` → forward the live stream, if one
//! was started, until it ends.
//!
//! The forwarding step runs as a detached background task: nothing in this
//! process ever drives a started stream to completion on its own (that's an
//! external driver publishing through `StreamManager::process_event`), so
//! awaiting it inline here would tie up this connection's read loop for the
//! life of the stream.

mod delivery;
mod request;
mod stream;

use std::sync::Arc;

use loom::agent_session::SendMessageOptions;

use crate::app::AppState;
use crate::protocol::{ErrorResponse, RunRequest, ServerResponse};
use crate::response::{send_response, ResponseSink};

use delivery::SinkRunSender;

pub(crate) async fn handle_run(
    r: RunRequest,
    sink: &ResponseSink,
    state: &Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let request_id = r.id.clone();
    let opts = SendMessageOptions { file_mentions: r.file_mentions, hide_follow_up_sentinel: false };

    let outcome = match state
        .agent_session
        .send_message(&r.workspace_id, &r.message, opts, &state.providers_config)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            let resp = ServerResponse::Error(ErrorResponse { id: Some(request_id), error: e.to_string() });
            send_response(sink, &resp).await?;
            return Ok(());
        }
    };

    let started = matches!(outcome, loom::agent_session::SendMessageOutcome::Started { .. });
    let resp = request::outcome_response(request_id.clone(), outcome);
    send_response(sink, &resp).await?;

    if !started {
        return Ok(());
    }

    let state = state.clone();
    let sink = sink.clone();
    let workspace_id = r.workspace_id.clone();
    tokio::spawn(async move {
        let mut sender = SinkRunSender(sink);
        if let Err(e) = stream::stream_run(&state, &workspace_id, &request_id, &mut sender).await {
            tracing::warn!("stream forwarding for {} failed: {}", workspace_id, e);
        }
    });

    Ok(())
}

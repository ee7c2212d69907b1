//! Subscribes to a workspace's live stream and drives it to the client.

use std::sync::Arc;

use stream_event::EnvelopeState;

use crate::app::AppState;

use super::delivery::{forward_stream, RunStreamSender};

/// Subscribes to `workspace_id`'s stream and forwards every event to
/// `sender` until the stream ends. A `None` subscription (nothing currently
/// streaming for this workspace) is a silent no-op: the `run` response
/// already told the client a message_id was appended.
pub(super) async fn stream_run<S>(
    state: &Arc<AppState>,
    workspace_id: &str,
    request_id: &str,
    sender: &mut S,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: RunStreamSender,
{
    let Some(rx) = state.stream_manager.subscribe(workspace_id) else { return Ok(()) };
    let mut envelope = EnvelopeState::new(workspace_id);
    forward_stream(request_id, rx, &mut envelope, sender).await
}

//! Delivering a workspace's live stream to the client: the `RunStreamSender`
//! abstraction and the forwarding loop itself.

use async_trait::async_trait;
use stream_event::{EnvelopeState, StreamEvent};
use tokio::sync::broadcast;

use crate::protocol::{ServerResponse, StreamEventResponse};
use crate::response::{send_response, ResponseSink};

/// Abstraction for sending server responses for one run's stream, so the
/// forwarding loop can be tested with a mock instead of a real socket.
#[async_trait]
pub(crate) trait RunStreamSender: Send {
    async fn send_response(
        &mut self,
        response: &ServerResponse,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

pub(super) struct SinkRunSender(pub(super) ResponseSink);

#[async_trait]
impl RunStreamSender for SinkRunSender {
    async fn send_response(
        &mut self,
        response: &ServerResponse,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        send_response(&self.0, response).await
    }
}

fn is_terminal(event: &StreamEvent) -> bool {
    matches!(
        event,
        StreamEvent::StreamEnd { .. } | StreamEvent::StreamAbort { .. } | StreamEvent::StreamError { .. }
    )
}

/// Drains a workspace's broadcast channel, stamping each event through
/// `envelope` and forwarding it as a `StreamEventResponse`. Returns once a
/// terminal event (`stream-end`/`stream-abort`/`stream-error`) is seen, the
/// channel closes, or `sender` fails.
pub(super) async fn forward_stream<S>(
    request_id: &str,
    mut rx: broadcast::Receiver<StreamEvent>,
    envelope: &mut EnvelopeState,
    sender: &mut S,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: RunStreamSender,
{
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "stream receiver lagged, continuing");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        };

        let terminal = is_terminal(&event);
        let value = envelope.to_json(&event)?;
        sender
            .send_response(&ServerResponse::StreamEvent(StreamEventResponse {
                id: request_id.to_string(),
                envelope: value,
            }))
            .await?;

        if terminal {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockRunStreamSender {
        sent: Vec<ServerResponse>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl RunStreamSender for MockRunStreamSender {
        async fn send_response(
            &mut self,
            response: &ServerResponse,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.sent.push(response.clone());
            if let Some(n) = self.fail_after {
                if self.sent.len() >= n {
                    return Err("mock send failure".into());
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn forward_stream_stops_on_stream_end() {
        let (tx, rx) = broadcast::channel(8);
        tx.send(StreamEvent::StreamStart { message_id: "m1".into(), replay: false }).unwrap();
        tx.send(StreamEvent::TextDelta { message_id: "m1".into(), delta: "hi".into() }).unwrap();
        tx.send(StreamEvent::StreamEnd { message_id: "m1".into(), ttft_ms: None }).unwrap();

        let mut envelope = EnvelopeState::new("ws-1");
        let mut sender = MockRunStreamSender { sent: vec![], fail_after: None };
        forward_stream("req-1", rx, &mut envelope, &mut sender).await.unwrap();
        assert_eq!(sender.sent.len(), 3);
    }

    #[tokio::test]
    async fn forward_stream_returns_ok_when_channel_closes_without_terminal_event() {
        let (tx, rx) = broadcast::channel(8);
        tx.send(StreamEvent::StreamStart { message_id: "m1".into(), replay: false }).unwrap();
        drop(tx);

        let mut envelope = EnvelopeState::new("ws-1");
        let mut sender = MockRunStreamSender { sent: vec![], fail_after: None };
        forward_stream("req-1", rx, &mut envelope, &mut sender).await.unwrap();
        assert_eq!(sender.sent.len(), 1);
    }

    #[tokio::test]
    async fn forward_stream_propagates_sender_failure() {
        let (tx, rx) = broadcast::channel(8);
        tx.send(StreamEvent::StreamStart { message_id: "m1".into(), replay: false }).unwrap();

        let mut envelope = EnvelopeState::new("ws-1");
        let mut sender = MockRunStreamSender { sent: vec![], fail_after: Some(1) };
        let result = forward_stream("req-1", rx, &mut envelope, &mut sender).await;
        assert!(result.is_err());
    }
}

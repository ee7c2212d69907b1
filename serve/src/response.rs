//! Send a single `ServerResponse` as JSON over the WebSocket.
//!
//! The sink is shared (`Arc<Mutex<..>>`) because a `run` request hands its
//! stream-forwarding loop off to a background task (§6.1) while the
//! connection's read loop keeps accepting further requests on the same
//! socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::Mutex;

use super::protocol::{ErrorResponse, ServerResponse};

pub(crate) type ResponseSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

pub(crate) async fn send_response(
    sink: &ResponseSink,
    response: &ServerResponse,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let json = serde_json::to_string(response).unwrap_or_else(|_| {
        serde_json::to_string(&ServerResponse::Error(ErrorResponse {
            id: None,
            error: "serialization error".to_string(),
        }))
        .unwrap()
    });
    sink.lock().await.send(Message::Text(json)).await?;
    Ok(())
}

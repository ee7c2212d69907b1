//! WebSocket connection lifecycle: recv loop and request dispatch.
//!
//! The write half is split off and shared (see [`ResponseSink`]) because a
//! `run` request hands its stream-forwarding loop off to a background task
//! while this read loop keeps accepting further requests on the same
//! connection.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use tokio::sync::{oneshot, Mutex};

use super::app::AppState;
use super::protocol::{ClientRequest, ErrorResponse, PongResponse, ServerResponse};
use super::response::{send_response, ResponseSink};
use super::run::handle_run;
use super::tools::{handle_tool_show, handle_tools_list};

pub(crate) async fn handle_socket(
    socket: WebSocket,
    shutdown_tx: Option<oneshot::Sender<()>>,
    state: Arc<AppState>,
) {
    let (sink, mut stream) = socket.split();
    let sink: ResponseSink = Arc::new(Mutex::new(sink));

    while let Some(res) = stream.next().await {
        let msg = match res {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("read error (client closed?): {}", e);
                break;
            }
        };
        let text = match &msg {
            Message::Text(t) => t.clone(),
            Message::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };

        if let Err(e) = handle_request_and_send(&text, &sink, &state).await {
            tracing::warn!("handle_request error: {}", e);
            break;
        }
    }
    if let Some(tx) = shutdown_tx {
        let _ = tx.send(());
    }
}

async fn handle_request_and_send(
    text: &str,
    sink: &ResponseSink,
    state: &Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let req: ClientRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            let resp = ServerResponse::Error(ErrorResponse {
                id: None,
                error: format!("parse error: {}", e),
            });
            send_response(sink, &resp).await?;
            return Ok(());
        }
    };

    match req {
        ClientRequest::Run(r) => {
            handle_run(r, sink, state).await?;
        }
        ClientRequest::ToolsList(r) => {
            send_response(sink, &handle_tools_list(r, state).await).await?;
        }
        ClientRequest::ToolShow(r) => {
            send_response(sink, &handle_tool_show(r, state).await).await?;
        }
        ClientRequest::Ping(r) => {
            send_response(sink, &ServerResponse::Pong(PongResponse { id: r.id })).await?;
        }
    }
    Ok(())
}

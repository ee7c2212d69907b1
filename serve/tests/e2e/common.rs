//! Shared helpers for e2e tests. Talks the raw wire JSON (the protocol DTOs
//! are crate-private to `serve`), so these double as a check on the actual
//! bytes a client would see. Received responses are logged with
//! `[e2e] received: ...`; run with `--nocapture` to see them.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Bind to a random port and spawn the server in once mode. Returns (ws_url, server_handle).
pub async fn spawn_server_once() -> (
    String,
    tokio::task::JoinHandle<Result<(), Box<dyn std::error::Error + Send + Sync>>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{}", addr);
    let server_handle = tokio::spawn(serve::run_serve_on_listener(listener, true));
    (url, server_handle)
}

/// Sends one request and returns the parsed JSON response.
pub async fn send_and_recv<W, R>(
    write: &mut W,
    read: &mut R,
    req: &Value,
) -> Result<Value, Box<dyn std::error::Error + Send + Sync>>
where
    W: SinkExt<Message> + Unpin,
    W::Error: std::error::Error + Send + Sync + 'static,
    R: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let json = serde_json::to_string(req)?;
    write.send(Message::Text(json)).await?;
    let read_timeout = Duration::from_secs(10);
    let opt = timeout(read_timeout, read.next()).await.map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout waiting for response")
    })?;
    let msg = opt.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "no message"))??;
    let text = msg.to_text().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    eprintln!("[e2e] received: {}", text);
    Ok(serde_json::from_str(text)?)
}

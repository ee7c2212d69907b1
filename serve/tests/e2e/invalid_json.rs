use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::common;

#[tokio::test]
async fn e2e_invalid_json_returns_error() {
    let (url, server_handle) = common::spawn_server_once().await;

    let (ws, _) = connect_async(&url).await.unwrap();
    let (mut write, mut read) = ws.split();

    write.send(Message::Text("not valid json".to_string())).await.unwrap();
    let read_timeout = Duration::from_secs(5);
    let opt = timeout(read_timeout, read.next()).await.unwrap();
    let msg = opt.expect("expected one response").expect("ws message");
    let text = msg.to_text().unwrap_or("");
    eprintln!("[e2e] received: {}", text);

    let resp: serde_json::Value = serde_json::from_str(text).unwrap();
    assert_eq!(resp["type"], "error");
    let error = resp["error"].as_str().unwrap_or("");
    assert!(error.contains("parse") || error.contains("json"), "error message: {}", error);

    drop(write);
    drop(read);
    let _ = timeout(Duration::from_secs(5), server_handle).await;
}

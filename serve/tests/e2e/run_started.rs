//! A `run` request appends the message and starts a stream; since no LLM
//! provider is wired into this server, the stream itself never produces
//! events, but the initial `run_started` acknowledgement should arrive
//! immediately.

use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;

use super::common;

#[tokio::test]
async fn e2e_run_started() {
    let (url, server_handle) = common::spawn_server_once().await;

    let (ws, _) = connect_async(&url).await.unwrap();
    let (mut write, mut read) = ws.split();

    let req = json!({
        "type": "run",
        "id": "run-1",
        "workspace_id": "ws-run-1",
        "message": "hello there",
    });
    let resp = common::send_and_recv(&mut write, &mut read, &req).await.unwrap();

    assert_eq!(resp["type"], "run_started");
    assert_eq!(resp["id"], "run-1");
    assert!(resp["message_id"].as_str().is_some());

    drop(write);
    drop(read);
    let _ = timeout(Duration::from_secs(5), server_handle).await;
}

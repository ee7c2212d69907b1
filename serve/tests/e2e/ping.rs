use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;

use super::common;

#[tokio::test]
async fn e2e_ping() {
    let (url, server_handle) = common::spawn_server_once().await;

    let (ws, _) = connect_async(&url).await.unwrap();
    let (mut write, mut read) = ws.split();

    let req = json!({"type": "ping", "id": "ping-1"});
    let resp = common::send_and_recv(&mut write, &mut read, &req).await.unwrap();

    assert_eq!(resp["type"], "pong");
    assert_eq!(resp["id"], "ping-1");

    drop(write);
    drop(read);
    let _ = timeout(Duration::from_secs(5), server_handle).await;
}

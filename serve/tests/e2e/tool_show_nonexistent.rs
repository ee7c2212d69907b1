use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;

use super::common;

#[tokio::test]
async fn e2e_tool_show_nonexistent() {
    let (url, server_handle) = common::spawn_server_once().await;

    let (ws, _) = connect_async(&url).await.unwrap();
    let (mut write, mut read) = ws.split();

    let req = json!({
        "type": "tool_show",
        "id": "tool-show-err-1",
        "workspace_id": "ws-1",
        "name": "nonexistent_tool_xyz_123",
    });
    let resp = common::send_and_recv(&mut write, &mut read, &req).await.unwrap();

    assert_eq!(resp["type"], "error");
    assert_eq!(resp["id"], "tool-show-err-1");
    let error = resp["error"].as_str().unwrap_or("");
    assert!(error.contains("not found"), "error message: {}", error);

    drop(write);
    drop(read);
    let _ = timeout(Duration::from_secs(5), server_handle).await;
}

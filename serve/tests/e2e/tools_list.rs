use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;

use super::common;

#[tokio::test]
async fn e2e_tools_list_with_no_servers_is_empty() {
    let (url, server_handle) = common::spawn_server_once().await;

    let (ws, _) = connect_async(&url).await.unwrap();
    let (mut write, mut read) = ws.split();

    let req = json!({"type": "tools_list", "id": "tools-list-1", "workspace_id": "ws-1"});
    let resp = common::send_and_recv(&mut write, &mut read, &req).await.unwrap();

    assert_eq!(resp["type"], "tools_list");
    assert_eq!(resp["id"], "tools-list-1");
    assert_eq!(resp["tools"].as_array().unwrap().len(), 0);

    drop(write);
    drop(read);
    let _ = timeout(Duration::from_secs(5), server_handle).await;
}

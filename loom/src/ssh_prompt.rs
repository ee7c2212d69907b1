//! `SSHPromptService`: request/response bus for host-key and credential
//! prompts, with dedupe and timeouts (spec §4.11).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub request_id: String,
    pub dedupe_key: Option<String>,
    pub prompt_text: String,
    pub is_host_key: bool,
}

#[derive(Debug, Clone)]
pub enum PromptEvent {
    Requested(PromptRequest),
    Removed { request_id: String },
}

struct PendingPrompt {
    waiters: Vec<tokio::sync::oneshot::Sender<String>>,
    dedupe_key: Option<String>,
    is_host_key: bool,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, PendingPrompt>,
    responders: usize,
}

pub struct SshPromptService {
    state: Mutex<State>,
    events: broadcast::Sender<PromptEvent>,
    timeout: Duration,
}

impl SshPromptService {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self { state: Mutex::new(State::default()), events, timeout }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PromptEvent> {
        self.events.subscribe()
    }

    pub async fn register_responder(&self) {
        self.state.lock().await.responders += 1;
    }

    pub async fn unregister_responder(&self) {
        let mut state = self.state.lock().await;
        state.responders = state.responders.saturating_sub(1);
    }

    /// Returns immediately with `""` if no responders are registered.
    /// Credential requests (non-host-key) never dedupe.
    pub async fn request_prompt(
        self: &Arc<Self>,
        prompt_text: String,
        dedupe_key: Option<String>,
        is_host_key: bool,
    ) -> String {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let request_id;
        {
            let mut state = self.state.lock().await;
            if state.responders == 0 {
                return String::new();
            }

            let existing = if is_host_key {
                dedupe_key.as_ref().and_then(|key| {
                    state
                        .pending
                        .iter()
                        .find(|(_, p)| p.is_host_key && p.dedupe_key.as_deref() == Some(key.as_str()))
                        .map(|(id, _)| id.clone())
                })
            } else {
                None
            };

            if let Some(id) = existing {
                state.pending.get_mut(&id).unwrap().waiters.push(tx);
                request_id = id;
            } else {
                request_id = Uuid::new_v4().to_string();
                state.pending.insert(
                    request_id.clone(),
                    PendingPrompt { waiters: vec![tx], dedupe_key: dedupe_key.clone(), is_host_key },
                );
                let _ = self.events.send(PromptEvent::Requested(PromptRequest {
                    request_id: request_id.clone(),
                    dedupe_key,
                    prompt_text,
                    is_host_key,
                }));
            }
        }

        match timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            _ => {
                let mut state = self.state.lock().await;
                state.pending.remove(&request_id);
                let _ = self.events.send(PromptEvent::Removed { request_id });
                String::new()
            }
        }
    }

    /// Resolves all joined waiters for `request_id`. A late response after
    /// the request has already timed out / been answered is a no-op.
    pub async fn respond(&self, request_id: &str, response: String) {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending.remove(request_id) {
            for waiter in pending.waiters {
                let _ = waiter.send(response.clone());
            }
        }
    }
}

impl Default for SshPromptService {
    fn default() -> Self {
        Self::new()
    }
}

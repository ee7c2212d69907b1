//! Concrete end-to-end scenarios seeded against `AgentSession`, `StreamManager`,
//! and `TaskService` together (spec §8 "Concrete scenarios").

use std::sync::Arc;
use std::time::Duration;

use loom::agent_session::{AgentSession, AgentSessionDeps, SendMessageOptions, SendMessageOutcome};
use loom::history::HistoryStore;
use loom::locks::WorkspaceLocks;
use loom::message::{Message, MuxEventType, Part, Role, Usage};
use loom::partial::PartialStore;
use loom::stream_manager::StreamManager;
use loom::task::{AgentDefinition, AgentRegistry, CreateOutcome, CreateTaskRequest, TaskRuntime, TaskService, TaskServiceDeps};
use loom_workspace::Store;
use model_spec_core::ProvidersConfig;
use stream_event::StreamEvent;

fn session(
    threshold: f64,
    compact_model_string: Option<String>,
) -> (AgentSession, Arc<HistoryStore>, Arc<StreamManager>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let locks = Arc::new(WorkspaceLocks::new());
    let history = Arc::new(HistoryStore::new(dir.path(), locks.clone()));
    let partial = Arc::new(PartialStore::new(dir.path(), locks.clone(), history.clone()));
    let stream_manager = Arc::new(StreamManager::new(dir.path().join("tmp"), locks, history.clone(), partial));
    let session = AgentSession::new(AgentSessionDeps {
        history: history.clone(),
        stream_manager: stream_manager.clone(),
        compaction_threshold: threshold,
        compact_model_string,
        use_1m_context: false,
    });
    (session, history, stream_manager, dir)
}

async fn seed_assistant_usage(history: &HistoryStore, workspace_id: &str, input_tokens: u64) {
    let mut msg = Message::new(uuid::Uuid::new_v4().to_string(), Role::Assistant, vec![Part::text("hi")]);
    msg.metadata.model = Some("anthropic:claude-sonnet-4-5".into());
    msg.metadata.usage = Some(Usage { input_tokens, output_tokens: 1, total_tokens: input_tokens + 1, cached_input_tokens: None });
    history.append(workspace_id, msg).await.unwrap();
}

/// **Scenario S1** — pre-send force compaction defers the snapshot: a
/// `@file`-mentioning send lands on a workspace already over the force-compact
/// buffer, so no `@foo.ts` snapshot ever reaches history or a stream start.
#[tokio::test]
async fn s1_pre_send_force_compaction_defers_snapshot() {
    let (session, history, stream_manager, _dir) = session(0.85, None);
    seed_assistant_usage(&history, "ws-s1", 191_000).await; // 95.5% > 85+10 force buffer

    let providers = ProvidersConfig::default();
    let opts = SendMessageOptions { file_mentions: vec!["foo.ts".into()], hide_follow_up_sentinel: false };
    let outcome = session.send_message("ws-s1", "please inspect @foo.ts", opts, &providers).await.unwrap();

    let deferred_id = match outcome {
        SendMessageOutcome::CompactionDeferred { compaction_request_message_id } => compaction_request_message_id,
        other => panic!("expected CompactionDeferred, got {other:?}"),
    };

    let history = history.get_history("ws-s1").await.unwrap();
    assert_eq!(history.len(), 2, "seeded assistant message + compaction request only");
    assert!(history.iter().find(|m| m.id == deferred_id).unwrap().metadata.mux_metadata.as_ref().unwrap().kind == Some(MuxEventType::CompactionRequest));
    assert!(history.iter().all(|m| m.metadata.file_at_mention_snapshot.is_none()), "no @foo.ts snapshot persisted");
    assert!(
        history.iter().all(|m| !m.parts.iter().any(|p| matches!(p, Part::Text { text } if text.contains("inspect @foo.ts")))),
        "the deferred user text never reaches history"
    );
    assert!(!stream_manager.is_streaming("ws-s1"), "no stream was started");
}

/// **Scenario S2** — a threshold-only warning still sends the user's message
/// this turn, with a compaction-request preamble riding along.
#[tokio::test]
async fn s2_threshold_only_warning_still_injects_preamble() {
    let (session, history, _stream_manager, _dir) = session(0.70, None);
    seed_assistant_usage(&history, "ws-s2", 144_000).await; // 72% >= 70% warn, < 80% force

    let providers = ProvidersConfig::default();
    let outcome = session.send_message("ws-s2", "keep going", SendMessageOptions::default(), &providers).await.unwrap();

    match outcome {
        SendMessageOutcome::Started { compaction_warning: Some(pct), .. } => assert!((pct - 72.0).abs() < 0.01),
        other => panic!("expected Started with a warning, got {other:?}"),
    }

    let history = history.get_history("ws-s2").await.unwrap();
    assert!(history.iter().any(|m| m.metadata.mux_metadata.as_ref().map(|mm| mm.kind) == Some(Some(MuxEventType::CompactionRequest))));
    assert!(history.iter().any(|m| m.parts.iter().any(|p| matches!(p, Part::Text { text } if text == "keep going"))), "user message is persisted");
}

/// **Scenario S3** — a configured preferred compaction model wins over the
/// model the user's in-flight request names.
#[tokio::test]
async fn s3_preferred_compaction_model_wins() {
    let (session, history, _stream_manager, _dir) = session(0.85, Some("openai:gpt-4o-mini".into()));
    seed_assistant_usage(&history, "ws-s3", 191_000).await;

    let providers = ProvidersConfig::default();
    let outcome = session
        .send_message("ws-s3", "anthropic:claude-sonnet-4-5", SendMessageOptions::default(), &providers)
        .await
        .unwrap();
    let SendMessageOutcome::CompactionDeferred { compaction_request_message_id } = outcome else {
        panic!("expected CompactionDeferred")
    };

    let history = history.get_history("ws-s3").await.unwrap();
    let request = history.iter().find(|m| m.id == compaction_request_message_id).unwrap();
    assert_eq!(
        request.metadata.mux_metadata.as_ref().unwrap().requested_model.as_deref(),
        Some("openai:gpt-4o-mini")
    );
}

/// **Scenario S4** — usage seeded for `checkBeforeSend` comes only from the
/// active epoch; a pre-boundary assistant message's usage must not leak past
/// a compaction boundary.
#[tokio::test]
async fn s4_on_send_usage_seeded_from_active_epoch_only() {
    let (session, history, _stream_manager, _dir) = session(0.85, None);
    seed_assistant_usage(&history, "ws-s4", 95_100).await; // pre-boundary, would be ~47.5% alone

    let mut boundary = Message::new(uuid::Uuid::new_v4().to_string(), Role::Assistant, vec![]);
    boundary.metadata.compaction_boundary = true;
    boundary.metadata.compacted = Some(loom::message::CompactedBy::User);
    boundary.metadata.compaction_epoch = Some(7);
    history.append("ws-s4", boundary).await.unwrap();

    history
        .append("ws-s4", Message::new(uuid::Uuid::new_v4().to_string(), Role::User, vec![Part::text("post-boundary")]))
        .await
        .unwrap();

    let providers = ProvidersConfig::default();
    let outcome = session.send_message("ws-s4", "another message", SendMessageOptions::default(), &providers).await.unwrap();
    assert!(matches!(outcome, SendMessageOutcome::Started { compaction_warning: None, .. }), "no usage in the active epoch means no warning or force compact");
}

/// **Scenario S5** — a mid-stream compaction dispatch that fails to persist
/// its compaction-request message still stops the stream exactly once, and
/// the failure surfaces as an `Err` rather than being silently swallowed.
#[tokio::test]
async fn s5_mid_stream_compaction_dispatch_failure_stops_stream_once() {
    let (session, history, stream_manager, dir) = session(0.85, None);
    seed_assistant_usage(&history, "ws-s5", 191_000).await;
    stream_manager.start_stream("ws-s5", false).await.unwrap();

    let mut rx = stream_manager.subscribe("ws-s5").unwrap();

    // Sabotage the next history write: HistoryStore's atomic write goes
    // through a `chat.jsonl.tmp` sibling before the rename. Replacing it with
    // a directory makes the write fail deterministically, independent of the
    // running user's permissions.
    let tmp_path = dir.path().join("ws-s5").join("chat.jsonl.tmp");
    std::fs::create_dir_all(&tmp_path).unwrap();

    let providers = ProvidersConfig::default();
    let result = session.check_mid_stream_and_maybe_compact("ws-s5", &providers).await;
    assert!(result.is_err(), "dispatch failure must surface, not be swallowed");

    let mut aborts = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, StreamEvent::StreamAbort { .. }) {
            aborts += 1;
        }
    }
    assert_eq!(aborts, 1, "stop_stream ran exactly once before the failed redispatch");

    // The original seeded message survives untouched; the failed write never
    // renamed a torn file over it.
    std::fs::remove_dir_all(&tmp_path).unwrap();
    let history = history.get_history("ws-s5").await.unwrap();
    assert_eq!(history.len(), 1);
}

struct FakeRuntime {
    head_sha: String,
}

impl TaskRuntime for FakeRuntime {
    fn create_worktree(&self, parent_project_path: &str, task_id: &str, _trunk_branch: Option<&str>) -> std::io::Result<std::path::PathBuf> {
        Ok(std::path::Path::new(parent_project_path).join(".mux-worktrees").join(task_id))
    }
    fn remove_worktree(&self, _project_path: &str) -> std::io::Result<()> {
        Ok(())
    }
    fn run_init_hook(&self, _project_path: &str) -> std::io::Result<()> {
        Ok(())
    }
    fn head_commit_sha(&self, _project_path: &str) -> std::io::Result<String> {
        Ok(self.head_sha.clone())
    }
}

async fn task_service(max_parallel_agent_tasks: usize) -> (Arc<TaskService>, Arc<Store>, String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::new(dir.path().join("workspaces.db")).unwrap());
    let root_id = store.create_workspace(Some("root".into())).await.unwrap();
    let project_path = dir.path().join("project");
    std::fs::create_dir_all(&project_path).unwrap();
    store.set_project_path(&root_id, &project_path.to_string_lossy()).await.unwrap();

    let locks = Arc::new(WorkspaceLocks::new());
    let history = Arc::new(HistoryStore::new(dir.path(), locks.clone()));
    let partial = Arc::new(PartialStore::new(dir.path(), locks.clone(), history.clone()));
    let stream_manager = Arc::new(StreamManager::new(dir.path().join("tmp"), locks, history.clone(), partial));
    let agent_session = Arc::new(AgentSession::new(AgentSessionDeps {
        history: history.clone(),
        stream_manager: stream_manager.clone(),
        compaction_threshold: 1.0,
        compact_model_string: None,
        use_1m_context: false,
    }));
    let agents = Arc::new(AgentRegistry::new(vec![AgentDefinition {
        agent_id: "explorer".into(),
        runnable: true,
        skip_init_hook: true,
        default_model: None,
    }]));

    let service = Arc::new(TaskService::new(TaskServiceDeps {
        store: store.clone(),
        history,
        stream_manager,
        agent_session,
        runtime: Arc::new(FakeRuntime { head_sha: "deadbeef".into() }),
        agents,
        max_parallel_agent_tasks,
        max_task_nesting_depth: 8,
    }));
    (service, store, root_id, dir)
}

fn request(parent_id: &str, prompt: &str) -> CreateTaskRequest {
    CreateTaskRequest {
        parent_workspace_id: parent_id.to_string(),
        agent_id: "explorer".to_string(),
        prompt: prompt.to_string(),
        explicit_model: None,
        parent_per_agent_model: None,
        workspace_default_model: None,
        global_default_model: None,
    }
}

/// **Scenario S6** — task queue + foreground-await: with
/// `maxParallelAgentTasks=1`, a parent spawning child A which itself spawns
/// and foreground-awaits child B must not deadlock; B's slot opens up while A
/// is parked awaiting it.
#[tokio::test]
async fn s6_task_queue_foreground_await() {
    let (service, store, root_id, _dir) = task_service(1).await;

    let outcome_a = service.create(request(&root_id, "do the work")).await.unwrap();
    let CreateOutcome::Running { task_id: a_id } = outcome_a else { panic!("expected A to run immediately") };

    // A is now the sole occupant of the single parallelism slot. A spawning
    // and foreground-awaiting B must not block B from running.
    service.register_foreground_await(&a_id).await;
    let outcome_b = service.create(request(&a_id, "help with a subtask")).await.unwrap();
    let CreateOutcome::Running { task_id: b_id } = outcome_b else {
        panic!("expected B to run while A is foreground-awaiting, not queue behind it")
    };

    // While A awaits B, A does not count against the cap, so a third task
    // spawned directly off the root would still have to queue.
    let outcome_c = service.create(request(&root_id, "unrelated work")).await.unwrap();
    assert!(matches!(outcome_c, CreateOutcome::Queued { .. }), "root is still occupied by A awaiting B, cap is 1");

    // B reports; A resumes and is no longer foreground-awaiting.
    service.deliver_agent_report(&b_id, Some("B done".into()), "b report".into()).await.unwrap();
    service.unregister_foreground_await(&a_id).await;

    // A reports; its slot frees, and the previously queued C can now start.
    service.deliver_agent_report(&a_id, Some("A done".into()), "a report".into()).await.unwrap();
    service.maybe_start_queued_tasks().await.unwrap();

    let CreateOutcome::Queued { task_id: c_id } = outcome_c else { unreachable!() };
    let c_entry = store.get_workspace(&c_id).await.unwrap().unwrap();
    assert_eq!(c_entry.task_status, Some(loom_workspace::TaskStatus::Running), "C starts once A's slot frees");

    tokio::time::sleep(Duration::from_millis(1)).await;
}

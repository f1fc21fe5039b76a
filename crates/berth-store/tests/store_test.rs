use berth_core::{
    fifo_key_session, now_millis, Agent, CommitStatus, EventKind, JobKind, JobStatus, Project,
    Session, SessionStatus, SourceType, User, Workspace, WorkspaceStatus,
};
use berth_store::{Driver, EnqueueOutcome, Store};
use std::path::Path;
use uuid::Uuid;

async fn test_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let dsn = format!("sqlite://{}?mode=rwc", dir.path().join("berth.db").display());
    let store = Store::connect(&dsn, Driver::Sqlite).await.unwrap();
    (store, dir)
}

struct Seed {
    project: Project,
    workspace: Workspace,
    session: Session,
}

async fn seed(store: &Store) -> Seed {
    let now = now_millis();
    let user = User {
        id: Uuid::new_v4(),
        email: format!("{}@example.com", Uuid::new_v4()),
        display_name: None,
        created_at: now,
    };
    store.accounts().create_user(&user).await.unwrap();

    let project = Project {
        id: Uuid::new_v4(),
        owner_id: user.id,
        name: "demo".into(),
        created_at: now,
    };
    store.accounts().create_project(&project).await.unwrap();

    let workspace = Workspace {
        id: Uuid::new_v4(),
        project_id: project.id,
        path: None,
        source_type: SourceType::Git,
        source: "https://example.com/repo.git".into(),
        display_name: None,
        status: WorkspaceStatus::Initializing,
        commit: None,
        branches: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };
    store.workspaces().create(&workspace).await.unwrap();

    let session = Session {
        id: Uuid::new_v4(),
        project_id: project.id,
        workspace_id: workspace.id,
        agent_id: None,
        name: "session-1".into(),
        display_name: None,
        status: SessionStatus::Initializing,
        workspace_path: None,
        workspace_commit: None,
        base_commit: None,
        applied_commit: None,
        commit_status: CommitStatus::None,
        commit_error: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };
    store.sessions().create(&session).await.unwrap();

    Seed {
        project,
        workspace,
        session,
    }
}

// ── Job queue ──

#[tokio::test]
async fn enqueue_is_deduplicated_while_non_terminal() {
    let (store, _dir) = test_store().await;
    let key = fifo_key_session(Uuid::new_v4());

    let first = store
        .jobs()
        .enqueue(JobKind::SessionInit, &key, "{}", 3)
        .await
        .unwrap();
    assert!(matches!(first, EnqueueOutcome::Enqueued(_)));

    let second = store
        .jobs()
        .enqueue(JobKind::SessionInit, &key, "{}", 3)
        .await
        .unwrap();
    assert_eq!(second, EnqueueOutcome::AlreadyPending);

    // A different kind on the same key is separate work.
    let commit = store
        .jobs()
        .enqueue(JobKind::SessionCommit, &key, "{}", 3)
        .await
        .unwrap();
    assert!(matches!(commit, EnqueueOutcome::Enqueued(_)));
}

#[tokio::test]
async fn claim_respects_fifo_key_exclusivity() {
    let (store, _dir) = test_store().await;
    let key_a = fifo_key_session(Uuid::new_v4());
    let key_b = fifo_key_session(Uuid::new_v4());

    store
        .jobs()
        .enqueue(JobKind::SessionInit, &key_a, "{}", 3)
        .await
        .unwrap();
    store
        .jobs()
        .enqueue(JobKind::SessionCommit, &key_a, "{}", 3)
        .await
        .unwrap();
    store
        .jobs()
        .enqueue(JobKind::SessionInit, &key_b, "{}", 3)
        .await
        .unwrap();

    let first = store.jobs().claim_ready("w1", 30_000).await.unwrap().unwrap();
    assert_eq!(first.fifo_key, key_a);
    assert_eq!(first.kind, JobKind::SessionInit);

    // key_a's second job is blocked by the lease; key_b is free.
    let second = store.jobs().claim_ready("w2", 30_000).await.unwrap().unwrap();
    assert_eq!(second.fifo_key, key_b);

    assert!(store.jobs().claim_ready("w3", 30_000).await.unwrap().is_none());
}

#[tokio::test]
async fn completing_a_job_unblocks_its_fifo_key() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;
    let key = fifo_key_session(seed.session.id);

    store
        .jobs()
        .enqueue(JobKind::SessionInit, &key, "{}", 3)
        .await
        .unwrap();
    store
        .jobs()
        .enqueue(JobKind::SessionCommit, &key, "{}", 3)
        .await
        .unwrap();

    let first = store.jobs().claim_ready("w1", 30_000).await.unwrap().unwrap();
    store
        .jobs()
        .complete(
            first.id,
            JobStatus::Completed,
            None,
            seed.project.id,
            first.kind,
            &seed.session.id.to_string(),
        )
        .await
        .unwrap();

    let next = store.jobs().claim_ready("w1", 30_000).await.unwrap().unwrap();
    assert_eq!(next.kind, JobKind::SessionCommit);
}

#[tokio::test]
async fn heartbeat_fails_once_job_is_terminal() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;
    let key = fifo_key_session(seed.session.id);

    store
        .jobs()
        .enqueue(JobKind::SessionInit, &key, "{}", 3)
        .await
        .unwrap();
    let job = store.jobs().claim_ready("w1", 30_000).await.unwrap().unwrap();

    assert!(store.jobs().heartbeat(job.id, 30_000).await.unwrap());

    store
        .jobs()
        .complete(
            job.id,
            JobStatus::Completed,
            None,
            seed.project.id,
            job.kind,
            &seed.session.id.to_string(),
        )
        .await
        .unwrap();

    assert!(!store.jobs().heartbeat(job.id, 30_000).await.unwrap());
}

#[tokio::test]
async fn expired_leases_are_stolen_and_reclaimable() {
    let (store, _dir) = test_store().await;
    let key = fifo_key_session(Uuid::new_v4());

    store
        .jobs()
        .enqueue(JobKind::SessionInit, &key, "{}", 3)
        .await
        .unwrap();
    // Lease already expired at claim time.
    let job = store.jobs().claim_ready("dead-worker", -1000).await.unwrap().unwrap();

    let stolen = store.jobs().steal_expired(now_millis()).await.unwrap();
    assert_eq!(stolen, 1);

    let reclaimed = store.jobs().claim_ready("w2", 30_000).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.lease_owner.as_deref(), Some("w2"));
}

#[tokio::test]
async fn retry_bumps_attempt_and_delays() {
    let (store, _dir) = test_store().await;
    let key = fifo_key_session(Uuid::new_v4());

    store
        .jobs()
        .enqueue(JobKind::SessionInit, &key, "{}", 3)
        .await
        .unwrap();
    let job = store.jobs().claim_ready("w1", 30_000).await.unwrap().unwrap();
    assert_eq!(job.attempt, 0);

    store
        .jobs()
        .retry(job.id, now_millis() + 60_000, "transient: boom")
        .await
        .unwrap();

    let row = store.jobs().get(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Queued);
    assert_eq!(row.attempt, 1);
    assert_eq!(row.last_error.as_deref(), Some("transient: boom"));

    // not_before is in the future, so the job is not yet ready.
    assert!(store.jobs().claim_ready("w1", 30_000).await.unwrap().is_none());
}

#[tokio::test]
async fn release_does_not_charge_an_attempt() {
    let (store, _dir) = test_store().await;
    let key = fifo_key_session(Uuid::new_v4());

    store
        .jobs()
        .enqueue(JobKind::SessionInit, &key, "{}", 3)
        .await
        .unwrap();
    let job = store.jobs().claim_ready("w1", 30_000).await.unwrap().unwrap();
    store.jobs().release(job.id).await.unwrap();

    let row = store.jobs().get(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Queued);
    assert_eq!(row.attempt, 0);
}

// ── Events ──

#[tokio::test]
async fn job_completion_emits_one_event_with_job_kind() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;
    let key = fifo_key_session(seed.session.id);

    store
        .jobs()
        .enqueue(JobKind::SessionInit, &key, "{}", 3)
        .await
        .unwrap();
    let job = store.jobs().claim_ready("w1", 30_000).await.unwrap().unwrap();
    store
        .jobs()
        .complete(
            job.id,
            JobStatus::Failed,
            Some("no default agent is configured"),
            seed.project.id,
            JobKind::SessionInit,
            &seed.session.id.to_string(),
        )
        .await
        .unwrap();

    let events = store.events().list_after(0, 100).await.unwrap();
    let completions: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::JobCompleted)
        .collect();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].job_kind.as_deref(), Some("session_init"));
    assert_eq!(completions[0].status.as_deref(), Some("failed"));
    assert_eq!(
        completions[0].message.as_deref(),
        Some("no default agent is configured")
    );
}

#[tokio::test]
async fn status_transitions_emit_events_with_increasing_sequence() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;

    for status in [
        SessionStatus::Cloning,
        SessionStatus::PullingImage,
        SessionStatus::CreatingSandbox,
        SessionStatus::Ready,
    ] {
        store
            .sessions()
            .update_status(seed.session.id, status, None)
            .await
            .unwrap();
    }

    let events = store
        .events()
        .list_project_after(seed.project.id, 0)
        .await
        .unwrap();
    assert_eq!(events.len(), 4);
    for pair in events.windows(2) {
        assert!(pair[1].sequence > pair[0].sequence);
    }
    assert_eq!(events[3].status.as_deref(), Some("ready"));
}

#[tokio::test]
async fn poller_cursor_round_trips() {
    let (store, _dir) = test_store().await;
    assert_eq!(store.events().poller_cursor().await.unwrap(), 0);
    store.events().set_poller_cursor(42).await.unwrap();
    assert_eq!(store.events().poller_cursor().await.unwrap(), 42);
    store.events().set_poller_cursor(43).await.unwrap();
    assert_eq!(store.events().poller_cursor().await.unwrap(), 43);
}

// ── Sessions ──

#[tokio::test]
async fn workspace_binding_is_frozen_after_first_write() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;

    let bound = store
        .sessions()
        .bind_workspace(seed.session.id, Path::new("/work/ws/sessions/a"), Some("c0ffee"))
        .await
        .unwrap();
    assert!(bound);

    // Reinit must not overwrite the frozen binding.
    let rebound = store
        .sessions()
        .bind_workspace(seed.session.id, Path::new("/work/other"), Some("deadbeef"))
        .await
        .unwrap();
    assert!(!rebound);

    let session = store.sessions().get(seed.session.id).await.unwrap().unwrap();
    assert_eq!(
        session.workspace_path.as_deref(),
        Some(Path::new("/work/ws/sessions/a"))
    );
    assert_eq!(session.workspace_commit.as_deref(), Some("c0ffee"));
}

#[tokio::test]
async fn commit_request_conflicts_while_in_flight() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;

    store
        .sessions()
        .request_commit(seed.session.id, "c0")
        .await
        .unwrap();
    let err = store
        .sessions()
        .request_commit(seed.session.id, "c0")
        .await
        .unwrap_err();
    assert!(matches!(err, berth_core::Error::Conflict(_)));

    assert!(store.sessions().begin_committing(seed.session.id).await.unwrap());
    // Second executor pass sees committing, not pending.
    assert!(!store.sessions().begin_committing(seed.session.id).await.unwrap());

    store
        .sessions()
        .complete_commit(seed.session.id, "c1")
        .await
        .unwrap();
    let session = store.sessions().get(seed.session.id).await.unwrap().unwrap();
    assert_eq!(session.commit_status, CommitStatus::Completed);
    assert_eq!(session.applied_commit.as_deref(), Some("c1"));

    // Once terminal, a new commit may be requested.
    store
        .sessions()
        .request_commit(seed.session.id, "c1")
        .await
        .unwrap();
}

#[tokio::test]
async fn list_by_statuses_filters() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;

    store
        .sessions()
        .update_status(seed.session.id, SessionStatus::Ready, None)
        .await
        .unwrap();

    let hits = store
        .sessions()
        .list_by_statuses(&[SessionStatus::Ready, SessionStatus::Running])
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);

    let misses = store
        .sessions()
        .list_by_statuses(&[SessionStatus::Error])
        .await
        .unwrap();
    assert!(misses.is_empty());
}

// ── Workspaces ──

#[tokio::test]
async fn workspace_delete_refused_while_sessions_in_flight() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;

    // Seeded session is `initializing` — not settled.
    let err = store.workspaces().delete(seed.workspace.id).await.unwrap_err();
    assert!(matches!(err, berth_core::Error::Conflict(_)));

    store
        .sessions()
        .update_status(seed.session.id, SessionStatus::Stopped, None)
        .await
        .unwrap();
    store.workspaces().delete(seed.workspace.id).await.unwrap();
    assert!(store.workspaces().get(seed.workspace.id).await.unwrap().is_none());
}

// ── Agents ──

#[tokio::test]
async fn default_agent_is_exclusive_and_delete_nulls_references() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;
    let now = now_millis();

    let mk = |name: &str, is_default: bool| Agent {
        id: Uuid::new_v4(),
        project_id: seed.project.id,
        name: name.into(),
        agent_type: "claude".into(),
        prompt: None,
        model: None,
        model_options: None,
        is_default,
        created_at: now,
        updated_at: now,
    };

    let first = mk("first", true);
    let second = mk("second", true);
    store.agents().create(&first).await.unwrap();
    store.agents().create(&second).await.unwrap();

    let default = store.agents().get_default(seed.project.id).await.unwrap().unwrap();
    assert_eq!(default.id, second.id);
    assert!(!store.agents().get(first.id).await.unwrap().unwrap().is_default);

    store
        .sessions()
        .set_agent(seed.session.id, Some(second.id))
        .await
        .unwrap();
    store.agents().delete(second.id).await.unwrap();

    let session = store.sessions().get(seed.session.id).await.unwrap().unwrap();
    assert!(session.agent_id.is_none());
    assert!(store.agents().get_default(seed.project.id).await.unwrap().is_none());
}

// ── Accounts ──

#[tokio::test]
async fn preferences_upsert_and_list() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;
    let user = seed.project.owner_id;

    store
        .accounts()
        .set_user_preference(user, "theme", &serde_json::json!("dark"))
        .await
        .unwrap();
    store
        .accounts()
        .set_user_preference(user, "theme", &serde_json::json!("light"))
        .await
        .unwrap();
    store
        .accounts()
        .set_user_preference(user, "editor", &serde_json::json!({"tabSize": 4}))
        .await
        .unwrap();

    let prefs = store.accounts().list_user_preferences(user).await.unwrap();
    assert_eq!(prefs.len(), 2);
    assert_eq!(prefs[0].key, "editor");
    assert_eq!(prefs[1].value, serde_json::json!("light"));
}

#[tokio::test]
async fn credentials_upsert_replaces_sealed_secret() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;
    let user = seed.project.owner_id;

    let mut cred = berth_store::accounts::Credential {
        id: Uuid::new_v4(),
        user_id: user,
        provider: "github".into(),
        secret: "sealed-v1".into(),
        created_at: now_millis(),
        updated_at: now_millis(),
    };
    store.accounts().put_credential(&cred).await.unwrap();

    cred.secret = "sealed-v2".into();
    store.accounts().put_credential(&cred).await.unwrap();

    let loaded = store
        .accounts()
        .get_credential(user, "github")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.secret, "sealed-v2");

    store.accounts().delete_credential(user, "github").await.unwrap();
    assert!(store
        .accounts()
        .get_credential(user, "github")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn expired_user_sessions_are_invisible_and_purgeable() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;
    let user = seed.project.owner_id;

    let live = berth_store::accounts::UserSession {
        token: "live-token".into(),
        user_id: user,
        expires_at: now_millis() + 60_000,
        created_at: now_millis(),
    };
    let dead = berth_store::accounts::UserSession {
        token: "dead-token".into(),
        user_id: user,
        expires_at: now_millis() - 1,
        created_at: now_millis(),
    };
    store.accounts().create_user_session(&live).await.unwrap();
    store.accounts().create_user_session(&dead).await.unwrap();

    assert!(store
        .accounts()
        .get_user_session("live-token")
        .await
        .unwrap()
        .is_some());
    assert!(store
        .accounts()
        .get_user_session("dead-token")
        .await
        .unwrap()
        .is_none());

    assert_eq!(store.accounts().purge_expired_user_sessions().await.unwrap(), 1);
    store.accounts().delete_user_session("live-token").await.unwrap();
}

#[tokio::test]
async fn messages_and_terminal_history_round_trip() {
    let (store, _dir) = test_store().await;
    let seed = seed(&store).await;

    store
        .accounts()
        .append_message(seed.session.id, "user", &serde_json::json!("hello"))
        .await
        .unwrap();
    store
        .accounts()
        .append_message(
            seed.session.id,
            "assistant",
            &serde_json::json!({"text": "hi there"}),
        )
        .await
        .unwrap();

    let messages = store.accounts().list_messages(seed.session.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[1].content["text"], "hi there");

    for chunk in ["$ ls\n", "src\n", "$ cargo test\n"] {
        store
            .accounts()
            .append_terminal_chunk(seed.session.id, chunk)
            .await
            .unwrap();
    }
    let tail = store
        .accounts()
        .list_terminal_history(seed.session.id, 2)
        .await
        .unwrap();
    assert_eq!(tail, vec!["src\n", "$ cargo test\n"]);
}

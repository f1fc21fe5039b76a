use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use berth_core::{
    fifo_key_session, now_millis, Error, EventKind, JobKind, JobStatus, Result,
    SessionInitPayload,
};
use berth_queue::{parse_payload, Dispatcher, DispatcherConfig, JobContext, JobExecutor};
use berth_store::{Driver, EnqueueOutcome, Store};
use uuid::Uuid;

async fn test_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let dsn = format!("sqlite://{}?mode=rwc", dir.path().join("berth.db").display());
    let store = Store::connect(&dsn, Driver::Sqlite).await.unwrap();
    (store, dir)
}

fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        workers: 2,
        poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(20),
        lease_duration: Duration::from_millis(200),
        job_timeout: Duration::from_millis(500),
        stale_grace: Duration::from_millis(50),
        max_attempts: 3,
    }
}

fn payload(session_id: Uuid) -> SessionInitPayload {
    SessionInitPayload {
        project_id: Uuid::new_v4(),
        session_id,
        workspace_id: Uuid::new_v4(),
        agent_id: None,
    }
}

/// Executor whose per-call behaviour is scripted: `fail_times` transient
/// failures, then success (or a fatal error when `fatal` is set).
struct ScriptedExecutor {
    kind: JobKind,
    calls: AtomicUsize,
    fail_times: usize,
    fatal: bool,
    seen_sessions: Mutex<Vec<Uuid>>,
}

impl ScriptedExecutor {
    fn new(kind: JobKind, fail_times: usize, fatal: bool) -> Self {
        Self {
            kind,
            calls: AtomicUsize::new(0),
            fail_times,
            fatal,
            seen_sessions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn execute(&self, ctx: JobContext) -> Result<()> {
        let payload: SessionInitPayload = parse_payload(&ctx.job)?;
        self.seen_sessions.lock().unwrap().push(payload.session_id);

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            return Err(Error::Fatal("no default agent is configured".into()));
        }
        if call < self.fail_times {
            return Err(Error::Transient("flaky backend".into()));
        }
        Ok(())
    }
}

async fn drain(dispatcher: &Dispatcher, owner: &str) -> usize {
    let mut processed = 0;
    while dispatcher.tick(owner).await.unwrap() {
        processed += 1;
    }
    processed
}

#[tokio::test]
async fn successful_job_completes_with_one_event() {
    let (store, _dir) = test_store().await;
    let mut dispatcher = Dispatcher::new(store.clone(), test_config());
    let executor = Arc::new(ScriptedExecutor::new(JobKind::SessionInit, 0, false));
    dispatcher.register(executor.clone());

    let session_id = Uuid::new_v4();
    let outcome = dispatcher
        .client()
        .enqueue(
            JobKind::SessionInit,
            &fifo_key_session(session_id),
            &payload(session_id),
        )
        .await
        .unwrap();
    let EnqueueOutcome::Enqueued(job_id) = outcome else {
        panic!("expected fresh enqueue");
    };

    assert_eq!(drain(&dispatcher, "w1").await, 1);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

    let job = store.jobs().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let completions: Vec<_> = store
        .events()
        .list_after(0, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EventKind::JobCompleted)
        .collect();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].status.as_deref(), Some("completed"));
    assert_eq!(completions[0].target_id, session_id.to_string());
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let (store, _dir) = test_store().await;
    let mut dispatcher = Dispatcher::new(store.clone(), test_config());
    let executor = Arc::new(ScriptedExecutor::new(JobKind::SessionInit, 2, false));
    dispatcher.register(executor.clone());

    let session_id = Uuid::new_v4();
    dispatcher
        .client()
        .enqueue(
            JobKind::SessionInit,
            &fifo_key_session(session_id),
            &payload(session_id),
        )
        .await
        .unwrap();

    // Attempt 0 fails; the retry is delayed by backoff, so poll until the
    // job comes ready again, attempt by attempt.
    let deadline = now_millis() + 30_000;
    loop {
        drain(&dispatcher, "w1").await;
        if executor.calls.load(Ordering::SeqCst) >= 3 {
            break;
        }
        assert!(now_millis() < deadline, "retries did not complete in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Exactly one terminal event despite three executions.
    let completions: Vec<_> = store
        .events()
        .list_after(0, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EventKind::JobCompleted)
        .collect();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].status.as_deref(), Some("completed"));
}

#[tokio::test]
async fn fatal_errors_fail_without_retries() {
    let (store, _dir) = test_store().await;
    let mut dispatcher = Dispatcher::new(store.clone(), test_config());
    let executor = Arc::new(ScriptedExecutor::new(JobKind::SessionInit, 0, true));
    dispatcher.register(executor.clone());

    let session_id = Uuid::new_v4();
    let EnqueueOutcome::Enqueued(job_id) = dispatcher
        .client()
        .enqueue(
            JobKind::SessionInit,
            &fifo_key_session(session_id),
            &payload(session_id),
        )
        .await
        .unwrap()
    else {
        panic!("expected fresh enqueue");
    };

    drain(&dispatcher, "w1").await;

    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    let job = store.jobs().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.last_error.as_deref(),
        Some("no default agent is configured")
    );
}

#[tokio::test]
async fn same_fifo_key_executes_in_enqueue_order() {
    let (store, _dir) = test_store().await;

    let order = Arc::new(Mutex::new(Vec::new()));
    struct Recorder {
        kind: JobKind,
        order: Arc<Mutex<Vec<JobKind>>>,
    }
    #[async_trait]
    impl JobExecutor for Recorder {
        fn kind(&self) -> JobKind {
            self.kind
        }
        async fn execute(&self, _ctx: JobContext) -> Result<()> {
            self.order.lock().unwrap().push(self.kind);
            Ok(())
        }
    }

    let mut dispatcher = Dispatcher::new(store.clone(), test_config());
    for kind in [JobKind::SessionInit, JobKind::SessionCommit] {
        dispatcher.register(Arc::new(Recorder {
            kind,
            order: order.clone(),
        }));
    }

    let session_id = Uuid::new_v4();
    let key = fifo_key_session(session_id);
    let client = dispatcher.client();

    client
        .enqueue(JobKind::SessionInit, &key, &payload(session_id))
        .await
        .unwrap();
    client
        .enqueue(JobKind::SessionCommit, &key, &payload(session_id))
        .await
        .unwrap();

    let other = Uuid::new_v4();
    client
        .enqueue(JobKind::SessionInit, &fifo_key_session(other), &payload(other))
        .await
        .unwrap();

    assert_eq!(drain(&dispatcher, "w1").await, 3);

    let seen = order.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    let init_pos = seen.iter().position(|k| *k == JobKind::SessionInit).unwrap();
    let commit_pos = seen.iter().position(|k| *k == JobKind::SessionCommit).unwrap();
    assert!(init_pos < commit_pos, "same-key jobs ran out of order: {seen:?}");
}

#[tokio::test]
async fn crashed_worker_job_is_stolen_and_completed_once() {
    let (store, _dir) = test_store().await;
    let mut dispatcher = Dispatcher::new(store.clone(), test_config());
    let executor = Arc::new(ScriptedExecutor::new(JobKind::SessionInit, 0, false));
    dispatcher.register(executor.clone());

    let session_id = Uuid::new_v4();
    dispatcher
        .client()
        .enqueue(
            JobKind::SessionInit,
            &fifo_key_session(session_id),
            &payload(session_id),
        )
        .await
        .unwrap();

    // A worker claims the job and dies: lease taken directly on the store,
    // no heartbeat will ever extend it.
    let job = store
        .jobs()
        .claim_ready("crashed-worker", -1000)
        .await
        .unwrap()
        .unwrap();

    // Nothing to claim while the (expired) lease still sits there.
    assert!(!dispatcher.tick("w2").await.unwrap());

    // The startup sweep resets it, then a live worker finishes the work.
    let stolen = dispatcher.reap_stale_leases().await.unwrap();
    assert_eq!(stolen, 1);
    assert!(dispatcher.tick("w2").await.unwrap());

    let row = store.jobs().get(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Completed);

    let completions: Vec<_> = store
        .events()
        .list_after(0, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EventKind::JobCompleted)
        .collect();
    assert_eq!(completions.len(), 1, "exactly one terminal event");
}

#[tokio::test]
async fn timed_out_job_is_released_without_attempt_charge() {
    let (store, _dir) = test_store().await;
    let mut config = test_config();
    config.job_timeout = Duration::from_millis(30);
    let mut dispatcher = Dispatcher::new(store.clone(), config);

    struct Hanger;
    #[async_trait]
    impl JobExecutor for Hanger {
        fn kind(&self) -> JobKind {
            JobKind::SessionInit
        }
        async fn execute(&self, _ctx: JobContext) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }
    dispatcher.register(Arc::new(Hanger));

    let session_id = Uuid::new_v4();
    let EnqueueOutcome::Enqueued(job_id) = dispatcher
        .client()
        .enqueue(
            JobKind::SessionInit,
            &fifo_key_session(session_id),
            &payload(session_id),
        )
        .await
        .unwrap()
    else {
        panic!("expected fresh enqueue");
    };

    assert!(dispatcher.tick("w1").await.unwrap());

    let job = store.jobs().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 0);
    assert!(job.lease_owner.is_none());
}

#[tokio::test]
async fn unregistered_kind_fails_cleanly() {
    let (store, _dir) = test_store().await;
    let dispatcher = Dispatcher::new(store.clone(), test_config());

    let session_id = Uuid::new_v4();
    let EnqueueOutcome::Enqueued(job_id) = dispatcher
        .client()
        .enqueue(
            JobKind::SessionDelete,
            &fifo_key_session(session_id),
            &payload(session_id),
        )
        .await
        .unwrap()
    else {
        panic!("expected fresh enqueue");
    };

    drain(&dispatcher, "w1").await;
    let job = store.jobs().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("no executor registered"));
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use berth_core::{now_millis, Error, ErrorClass, Job, JobKind, JobStatus, ProjectId, Result};
use berth_store::{EnqueueOutcome, Store};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::retry_backoff;
use crate::executor::{JobContext, JobExecutor};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    /// Fallback wakeup when no `NotifyNewJob` arrives.
    pub poll_interval: Duration,
    /// How often a held lease is extended.
    pub heartbeat_interval: Duration,
    /// Lease length granted on claim and on each heartbeat.
    pub lease_duration: Duration,
    /// Hard deadline for one executor run.
    pub job_timeout: Duration,
    /// Extra slack past lease expiry before the reaper steals a job.
    pub stale_grace: Duration,
    pub max_attempts: i32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            lease_duration: Duration::from_secs(15),
            job_timeout: Duration::from_secs(300),
            stale_grace: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

/// Cheap handle for enqueueing work and waking the dispatcher. This is what
/// the service layer holds.
#[derive(Clone)]
pub struct QueueClient {
    store: Store,
    notify: Arc<Notify>,
    max_attempts: i32,
}

impl QueueClient {
    /// Serialize `payload`, enqueue under `(kind, fifo_key)`, and wake a
    /// worker. Duplicate pending work is a no-op (`AlreadyPending`).
    pub async fn enqueue<P: Serialize>(
        &self,
        kind: JobKind,
        fifo_key: &str,
        payload: &P,
    ) -> Result<EnqueueOutcome> {
        let encoded = serde_json::to_string(payload)
            .map_err(|e| Error::Internal(format!("encode {kind} payload: {e}")))?;
        let outcome = self
            .store
            .jobs()
            .enqueue(kind, fifo_key, &encoded, self.max_attempts)
            .await?;
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Wake a worker without enqueueing (used after out-of-band queue
    /// changes).
    pub fn notify_new_job(&self) {
        self.notify.notify_one();
    }
}

/// The dispatcher: N worker loops plus a lease reaper over one shared
/// store-backed queue.
pub struct Dispatcher {
    store: Store,
    config: DispatcherConfig,
    notify: Arc<Notify>,
    executors: HashMap<JobKind, Arc<dyn JobExecutor>>,
}

impl Dispatcher {
    pub fn new(store: Store, config: DispatcherConfig) -> Self {
        Self {
            store,
            config,
            notify: Arc::new(Notify::new()),
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, executor: Arc<dyn JobExecutor>) {
        let kind = executor.kind();
        if self.executors.insert(kind, executor).is_some() {
            warn!(%kind, "replacing registered executor");
        }
    }

    pub fn client(&self) -> QueueClient {
        QueueClient {
            store: self.store.clone(),
            notify: self.notify.clone(),
            max_attempts: self.config.max_attempts,
        }
    }

    /// Spawn the reaper and worker tasks. Abort the handles to stop.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.workers + 1);

        let reaper = self.clone();
        handles.push(tokio::spawn(async move { reaper.run_reaper().await }));

        for worker_id in 0..self.config.workers {
            let worker = self.clone();
            handles.push(tokio::spawn(async move {
                worker.run_worker(worker_id).await;
            }));
        }
        handles
    }

    /// Reset expired leases so jobs orphaned by a crashed worker restart
    /// promptly. Runs once immediately, then on the poll interval.
    pub async fn run_reaper(&self) {
        loop {
            match self.reap_stale_leases().await {
                Ok(stolen) if stolen > 0 => {
                    info!(stolen, "reset expired job leases");
                    self.notify.notify_one();
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "lease reaper sweep failed"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One reaper sweep.
    pub async fn reap_stale_leases(&self) -> Result<u64> {
        let cutoff = now_millis() - self.config.stale_grace.as_millis() as i64;
        self.store.jobs().steal_expired(cutoff).await
    }

    async fn run_worker(&self, worker_id: usize) {
        let owner = format!("worker-{}/{}", std::process::id(), worker_id);
        info!(%owner, "dispatcher worker started");

        loop {
            match self.tick(&owner).await {
                // Processed something: try again immediately, more work may
                // have become ready behind the same fifo key.
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(%owner, error = %e, "worker iteration failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Claim and process at most one job. Returns whether a job was
    /// processed. Public so tests can drive workers deterministically.
    pub async fn tick(&self, owner: &str) -> Result<bool> {
        let lease_ms = self.config.lease_duration.as_millis() as i64;
        let Some(job) = self.store.jobs().claim_ready(owner, lease_ms).await? else {
            return Ok(false);
        };

        debug!(job = %job.id, kind = %job.kind, attempt = job.attempt, "claimed job");
        self.process(job).await;
        Ok(true)
    }

    async fn process(&self, job: Job) {
        let (project_id, target_id) = match job_target(&job) {
            Ok(pair) => pair,
            Err(e) => {
                self.finalise(&job, None, JobStatus::Failed, Some(&e.to_string()))
                    .await;
                return;
            }
        };

        let Some(executor) = self.executors.get(&job.kind).cloned() else {
            self.finalise(
                &job,
                Some((project_id, &target_id)),
                JobStatus::Failed,
                Some(&format!("no executor registered for {}", job.kind)),
            )
            .await;
            return;
        };

        let heartbeat = self.spawn_heartbeat(job.id);

        let ctx = JobContext {
            job: job.clone(),
            attempt: job.attempt,
        };
        let outcome = tokio::time::timeout(self.config.job_timeout, executor.execute(ctx)).await;

        heartbeat.abort();

        match outcome {
            Ok(Ok(())) => {
                self.finalise(&job, Some((project_id, &target_id)), JobStatus::Completed, None)
                    .await;
                self.notify.notify_one();
            }
            Ok(Err(e)) => {
                let retriable = e.class() == ErrorClass::Transient
                    && job.attempt + 1 < job.max_attempts;
                if retriable {
                    let delay = retry_backoff(job.attempt, self.config.job_timeout);
                    let not_before = now_millis() + delay.as_millis() as i64;
                    warn!(
                        job = %job.id, kind = %job.kind, attempt = job.attempt,
                        delay_ms = delay.as_millis() as u64, error = %e,
                        "job failed, retrying"
                    );
                    if let Err(retry_err) =
                        self.store.jobs().retry(job.id, not_before, &e.to_string()).await
                    {
                        warn!(job = %job.id, error = %retry_err, "retry scheduling failed");
                    }
                } else {
                    self.finalise(
                        &job,
                        Some((project_id, &target_id)),
                        JobStatus::Failed,
                        Some(&e.to_string()),
                    )
                    .await;
                }
                self.notify.notify_one();
            }
            Err(_) => {
                // Deadline hit: put the job back without charging an
                // attempt. The poll ticker picks it up again.
                warn!(job = %job.id, kind = %job.kind, "job timed out, releasing lease");
                if let Err(e) = self.store.jobs().release(job.id).await {
                    warn!(job = %job.id, error = %e, "lease release failed");
                }
            }
        }
    }

    async fn finalise(
        &self,
        job: &Job,
        event_target: Option<(ProjectId, &str)>,
        status: JobStatus,
        error_msg: Option<&str>,
    ) {
        let result = match event_target {
            Some((project_id, target_id)) => {
                self.store
                    .jobs()
                    .complete(job.id, status, error_msg, project_id, job.kind, target_id)
                    .await
            }
            // Without a parseable payload there is no event to address;
            // mark the row terminal against a nil project.
            None => {
                self.store
                    .jobs()
                    .complete(
                        job.id,
                        status,
                        error_msg,
                        ProjectId::nil(),
                        job.kind,
                        "unknown",
                    )
                    .await
            }
        };

        match result {
            Ok(()) => {
                debug!(job = %job.id, %status, "job finalised");
            }
            // The lease was stolen while we ran; the other copy owns the
            // terminal transition and its event.
            Err(Error::Conflict(msg)) => {
                warn!(job = %job.id, %msg, "job finalisation lost to another worker");
            }
            Err(e) => {
                error!(job = %job.id, error = %e, "job finalisation failed");
            }
        }
    }

    fn spawn_heartbeat(&self, job_id: berth_core::JobId) -> JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.config.heartbeat_interval;
        let lease_ms = self.config.lease_duration.as_millis() as i64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick is a no-op extension
            loop {
                ticker.tick().await;
                match store.jobs().heartbeat(job_id, lease_ms).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job = %job_id, "lease lost during execution");
                        break;
                    }
                    Err(e) => {
                        warn!(job = %job_id, error = %e, "heartbeat failed");
                    }
                }
            }
        })
    }
}

/// Extract `(project_id, target_id)` from a job payload. All payloads carry
/// `project_id`; the target is the workspace for workspace jobs and the
/// session otherwise.
fn job_target(job: &Job) -> Result<(ProjectId, String)> {
    let value: serde_json::Value = serde_json::from_str(&job.payload)
        .map_err(|e| Error::Fatal(format!("malformed {} payload: {e}", job.kind)))?;

    let project_id = value
        .get("project_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Fatal(format!("{} payload has no project_id", job.kind)))?;

    let target_field = match job.kind {
        JobKind::WorkspaceInit => "workspace_id",
        JobKind::SessionInit | JobKind::SessionCommit | JobKind::SessionDelete => "session_id",
    };
    let target_id = value
        .get(target_field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Fatal(format!("{} payload has no {target_field}", job.kind)))?
        .to_string();

    Ok((project_id, target_id))
}

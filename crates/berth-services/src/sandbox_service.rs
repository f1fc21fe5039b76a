use std::sync::Arc;

use berth_core::{
    fifo_key_session, Error, JobKind, JobStatus, Result, Session, SessionId, SessionInitPayload,
    SessionStatus,
};
use berth_events::{wait_for_job_completion, Broker};
use berth_queue::QueueClient;
use berth_sandbox::{SandboxProvider, SandboxStatus, VolumePolicy};
use berth_store::Store;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::activity::ActivityTracker;
use crate::client::{sidecar_for, SessionClient};
use crate::ServiceConfig;

/// Session states reconciliation considers live enough to check against
/// the provider.
const NON_TERMINAL: &[SessionStatus] = &[
    SessionStatus::Initializing,
    SessionStatus::Reinitializing,
    SessionStatus::Cloning,
    SessionStatus::PullingImage,
    SessionStatus::CreatingSandbox,
    SessionStatus::Ready,
    SessionStatus::Running,
];

/// The gatekeeper between callers and in-sandbox agents, plus the
/// reconciliation loops that bring live sandbox state back in line with
/// the database.
pub struct SandboxService {
    store: Store,
    provider: Arc<dyn SandboxProvider>,
    queue: QueueClient,
    broker: Broker,
    tracker: Arc<ActivityTracker>,
    config: ServiceConfig,
}

impl SandboxService {
    pub fn new(
        store: Store,
        provider: Arc<dyn SandboxProvider>,
        queue: QueueClient,
        broker: Broker,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            provider,
            queue,
            broker,
            tracker: Arc::new(ActivityTracker::new()),
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<ActivityTracker> {
        &self.tracker
    }

    /// The only supported path to the in-sandbox agent: guarantees a
    /// running sandbox first, driving `stopped`/`error` sessions back
    /// through init when needed.
    #[instrument(skip(self), fields(session = %session_id))]
    pub async fn get_client(&self, session_id: SessionId) -> Result<SessionClient> {
        let session = self.store.sessions().must_get(session_id).await?;

        match session.status {
            SessionStatus::Ready | SessionStatus::Running => {
                // Cheap liveness check: the DB may not have noticed a dead
                // sandbox yet.
                match self.provider.get(session_id).await {
                    Ok(info) if info.status == SandboxStatus::Running => {
                        self.make_client(session_id).await
                    }
                    _ => self.init_and_wait(&session).await,
                }
            }
            SessionStatus::Stopped | SessionStatus::Error => self.init_and_wait(&session).await,
            SessionStatus::Removing => Err(Error::Conflict(format!(
                "session {session_id} is being removed"
            ))),
            _ => self.poll_then_init(session).await,
        }
    }

    /// Intermediate init states: poll the DB until ready (another worker is
    /// already doing the work), then fall back to forcing an init.
    async fn poll_then_init(&self, mut session: Session) -> Result<SessionClient> {
        let deadline = tokio::time::Instant::now() + self.config.ready_max_wait;

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.config.ready_poll_interval).await;
            session = self.store.sessions().must_get(session.id).await?;
            match session.status {
                SessionStatus::Ready | SessionStatus::Running => {
                    match self.provider.get(session.id).await {
                        Ok(info) if info.status == SandboxStatus::Running => {
                            return self.make_client(session.id).await;
                        }
                        _ => return self.init_and_wait(&session).await,
                    }
                }
                SessionStatus::Stopped | SessionStatus::Error => {
                    return self.init_and_wait(&session).await;
                }
                SessionStatus::Removing => {
                    return Err(Error::Conflict(format!(
                        "session {} is being removed",
                        session.id
                    )));
                }
                _ => {}
            }
        }

        self.init_and_wait(&session).await
    }

    /// Enqueue `session_init` and wait for its completion event. The
    /// subscription is taken before the enqueue so a fast completion
    /// cannot slip past.
    async fn init_and_wait(&self, session: &Session) -> Result<SessionClient> {
        let mut rx = self.broker.subscribe(session.project_id);

        self.queue
            .enqueue(
                JobKind::SessionInit,
                &fifo_key_session(session.id),
                &SessionInitPayload {
                    project_id: session.project_id,
                    session_id: session.id,
                    workspace_id: session.workspace_id,
                    agent_id: session.agent_id,
                },
            )
            .await?;

        let completion = wait_for_job_completion(
            &mut rx,
            JobKind::SessionInit,
            &session.id.to_string(),
            self.config.wait_timeout,
        )
        .await?;

        match completion.status {
            JobStatus::Completed => self.make_client(session.id).await,
            _ => Err(Error::Fatal(
                completion
                    .error
                    .unwrap_or_else(|| "session init failed".to_string()),
            )),
        }
    }

    async fn make_client(&self, session_id: SessionId) -> Result<SessionClient> {
        let sidecar = sidecar_for(self.provider.as_ref(), session_id).await?;
        self.tracker.touch(session_id);
        Ok(SessionClient::new(
            session_id,
            sidecar,
            self.tracker.clone(),
        ))
    }

    // ── Reconciliation ──

    /// Bring provider-listed sandboxes in line with the database: outdated
    /// images are replaced (volumes preserved) and orphans removed.
    pub async fn reconcile_sandboxes(&self) -> Result<()> {
        for info in self.provider.list().await? {
            let session = self.store.sessions().get(info.session_id).await?;

            match session {
                None => {
                    info!(session = %info.session_id, "removing orphaned sandbox");
                    match self
                        .provider
                        .remove(info.session_id, VolumePolicy::Preserve)
                        .await
                    {
                        Ok(()) | Err(Error::NotFound(_)) => {}
                        Err(e) => {
                            warn!(session = %info.session_id, error = %e, "orphan removal failed")
                        }
                    }
                    self.tracker.forget(info.session_id);
                }
                Some(session) if info.image != self.provider.image() => {
                    info!(
                        session = %session.id,
                        old_image = %info.image,
                        new_image = %self.provider.image(),
                        "replacing sandbox with outdated image"
                    );
                    match self
                        .provider
                        .remove(session.id, VolumePolicy::Preserve)
                        .await
                    {
                        Ok(()) | Err(Error::NotFound(_)) => {}
                        Err(e) => {
                            warn!(session = %session.id, error = %e, "sandbox replacement failed");
                            continue;
                        }
                    }
                    self.queue
                        .enqueue(
                            JobKind::SessionInit,
                            &fifo_key_session(session.id),
                            &SessionInitPayload {
                                project_id: session.project_id,
                                session_id: session.id,
                                workspace_id: session.workspace_id,
                                agent_id: session.agent_id,
                            },
                        )
                        .await?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Bring session rows in line with live sandbox state: sessions whose
    /// sandbox is gone go to `stopped`, failed sandboxes to `error`, and a
    /// `running` session with no active chat back to `ready`.
    pub async fn reconcile_session_states(&self) -> Result<()> {
        let sessions = self
            .store
            .sessions()
            .list_by_statuses(NON_TERMINAL)
            .await?;

        for session in sessions {
            let observed = match self.provider.get(session.id).await {
                Ok(info) => Some(info),
                Err(Error::NotFound(_)) => None,
                Err(e) => {
                    warn!(session = %session.id, error = %e, "provider check failed");
                    continue;
                }
            };

            let new_status = match observed {
                None => Some((SessionStatus::Stopped, None)),
                Some(info) => match info.status {
                    SandboxStatus::Stopped | SandboxStatus::Created => {
                        Some((SessionStatus::Stopped, None))
                    }
                    SandboxStatus::Failed => Some((
                        SessionStatus::Error,
                        Some(info.error.unwrap_or_else(|| "sandbox failed".to_string())),
                    )),
                    SandboxStatus::Running => {
                        if session.status == SessionStatus::Running {
                            self.downgrade_if_chat_idle(&session).await
                        } else if session.status != SessionStatus::Ready {
                            Some((SessionStatus::Ready, None))
                        } else {
                            None
                        }
                    }
                },
            };

            if let Some((status, message)) = new_status {
                if status != session.status {
                    info!(
                        session = %session.id,
                        from = %session.status,
                        to = %status,
                        "reconciled session state"
                    );
                    self.store
                        .sessions()
                        .update_status(session.id, status, message.as_deref())
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// A `running` session with a running sandbox: only flip to `ready`
    /// when the agent reports no active chat.
    async fn downgrade_if_chat_idle(
        &self,
        session: &Session,
    ) -> Option<(SessionStatus, Option<String>)> {
        match sidecar_for(self.provider.as_ref(), session.id).await {
            Ok(sidecar) => match sidecar.get_chat_status().await {
                Ok(status) if !status.is_running => Some((SessionStatus::Ready, None)),
                Ok(_) => None,
                Err(e) => {
                    warn!(session = %session.id, error = %e, "chat status check failed");
                    None
                }
            },
            Err(e) => {
                warn!(session = %session.id, error = %e, "sidecar unreachable during reconcile");
                None
            }
        }
    }

    // ── Idle eviction ──

    /// Stop sandboxes whose sessions have been idle past the configured
    /// timeout. Returns the sessions evicted.
    pub async fn evict_idle_once(&self) -> Result<Vec<SessionId>> {
        let mut evicted = Vec::new();

        for session_id in self.tracker.idle_sessions(self.config.idle_timeout) {
            let Some(session) = self.store.sessions().get(session_id).await? else {
                self.tracker.forget(session_id);
                continue;
            };
            if session.status != SessionStatus::Ready {
                continue;
            }

            info!(session = %session_id, "stopping idle session");
            match self.provider.stop(session_id, self.config.stop_grace).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => {
                    warn!(session = %session_id, error = %e, "idle stop failed");
                    continue;
                }
            }
            self.store
                .sessions()
                .update_status(session_id, SessionStatus::Stopped, None)
                .await?;
            self.tracker.forget(session_id);
            evicted.push(session_id);
        }

        Ok(evicted)
    }

    /// Spawn the periodic idle-eviction loop.
    pub fn spawn_idle_eviction(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.idle_timeout / 4;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(std::time::Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.evict_idle_once().await {
                    warn!(error = %e, "idle eviction sweep failed");
                }
            }
        })
    }
}

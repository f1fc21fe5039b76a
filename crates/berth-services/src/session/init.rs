use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use berth_core::{
    Error, JobKind, Result, Session, SessionInitPayload, SessionStatus, SourceType,
};
use berth_queue::{parse_payload, JobContext, JobExecutor};
use berth_sandbox::{CreateOpts, Resources, SandboxStatus, VolumePolicy};
use rand::RngCore;
use tracing::{info, instrument, warn};

use super::SessionService;

impl SessionService {
    /// The `session_init` job body.
    ///
    /// Drives `initializing → cloning → pulling_image → creating_sandbox →
    /// ready`, emitting `session_updated` at each step. Idempotent: a
    /// healthy sandbox with the expected image short-circuits to `ready`,
    /// and the frozen workspace binding is never overwritten.
    #[instrument(skip(self, payload), fields(session = %payload.session_id))]
    pub async fn run_init(&self, payload: SessionInitPayload) -> Result<()> {
        let session_id = payload.session_id;

        let result = self.init_inner(&payload).await;
        if let Err(e) = &result {
            self.store
                .sessions()
                .update_status(session_id, SessionStatus::Error, Some(&e.to_string()))
                .await?;
        }
        result
    }

    async fn init_inner(&self, payload: &SessionInitPayload) -> Result<()> {
        let session_id = payload.session_id;
        let mut session = self.store.sessions().must_get(session_id).await?;

        if session.status == SessionStatus::Removing {
            // Deletion won the race; nothing to initialise.
            return Ok(());
        }

        self.resolve_agent(&mut session, payload).await?;

        let first_init = session.workspace_path.is_none();

        // Reconcile fast path: an already-bound session with a healthy
        // sandbox of the expected image needs no recreation.
        if !first_init {
            if let Ok(info) = self.sandbox.get(session_id).await {
                if info.status == SandboxStatus::Running && info.image == self.sandbox.image() {
                    self.store
                        .sessions()
                        .update_status(session_id, SessionStatus::Ready, None)
                        .await?;
                    return Ok(());
                }
            }
        }

        self.store
            .sessions()
            .update_status(session_id, SessionStatus::Cloning, None)
            .await?;
        if first_init {
            let workspace = self
                .store
                .workspaces()
                .get(session.workspace_id)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!("workspace {}", session.workspace_id))
                })?;

            // Make sure the shared clone exists and snapshot the commit the
            // session is born at. Frozen from here on.
            let checkout = self
                .git
                .ensure_workspace(
                    workspace.id,
                    workspace.source_type,
                    &workspace.source,
                    None,
                )
                .await?;
            let workspace_commit = match workspace.source_type {
                SourceType::Git => checkout.head.clone(),
                SourceType::Local => None,
            };

            let session_dir = self
                .git
                .acquire_session_dir(workspace.id, session_id)
                .await?;

            let frozen = self
                .store
                .sessions()
                .bind_workspace(session_id, &session_dir, workspace_commit.as_deref())
                .await?;
            if frozen {
                session.workspace_path = Some(session_dir);
                session.workspace_commit = workspace_commit;
            } else {
                // Someone bound it between our load and now; re-read the
                // frozen values rather than trusting ours.
                session = self.store.sessions().must_get(session_id).await?;
            }
        }

        self.store
            .sessions()
            .update_status(session_id, SessionStatus::PullingImage, None)
            .await?;
        self.store
            .sessions()
            .update_status(session_id, SessionStatus::CreatingSandbox, None)
            .await?;

        let workspace_path = session
            .workspace_path
            .clone()
            .ok_or_else(|| Error::Internal("session has no workspace path after init".into()))?;

        let workspace_source = self
            .store
            .workspaces()
            .get(session.workspace_id)
            .await?
            .map(|w| w.source);

        let opts = CreateOpts {
            shared_secret: generate_shared_secret(),
            labels: HashMap::from([
                ("berth.project".to_string(), session.project_id.to_string()),
                ("berth.workspace".to_string(), session.workspace_id.to_string()),
            ]),
            workspace_path,
            workspace_source,
            workspace_commit: session.workspace_commit.clone(),
            resources: Resources {
                timeout: Some(self.config.idle_timeout),
            },
        };

        match self.sandbox.create(session_id, opts.clone()).await {
            Ok(()) => {}
            Err(Error::Conflict(_)) => {
                // A stale sandbox (stopped, failed, or wrong image) holds
                // the name. Replace it, preserving volumes.
                warn!(session = %session_id, "replacing existing sandbox");
                match self.sandbox.remove(session_id, VolumePolicy::Preserve).await {
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                self.sandbox.create(session_id, opts).await?;
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.sandbox.start(session_id).await {
            match self.sandbox.remove(session_id, VolumePolicy::Preserve).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(remove_err) => {
                    warn!(session = %session_id, error = %remove_err, "cleanup after failed start");
                }
            }
            return Err(e);
        }

        self.store
            .sessions()
            .update_status(session_id, SessionStatus::Ready, None)
            .await?;
        info!(session = %session_id, "session ready");
        Ok(())
    }

    /// Resolve a null `agent_id` to the project default and persist it.
    async fn resolve_agent(
        &self,
        session: &mut Session,
        payload: &SessionInitPayload,
    ) -> Result<()> {
        if session.agent_id.is_some() {
            return Ok(());
        }

        let agent_id = match payload.agent_id {
            Some(agent_id) => agent_id,
            None => {
                self.store
                    .agents()
                    .get_default(session.project_id)
                    .await?
                    .ok_or_else(|| Error::Fatal("no default agent is configured".into()))?
                    .id
            }
        };

        self.store
            .sessions()
            .set_agent(session.id, Some(agent_id))
            .await?;
        session.agent_id = Some(agent_id);
        Ok(())
    }
}

/// 32 cryptographically random bytes, hex-encoded.
fn generate_shared_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct SessionInitExecutor {
    service: Arc<SessionService>,
}

impl SessionInitExecutor {
    pub fn new(service: Arc<SessionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl JobExecutor for SessionInitExecutor {
    fn kind(&self) -> JobKind {
        JobKind::SessionInit
    }

    async fn execute(&self, ctx: JobContext) -> Result<()> {
        let payload: SessionInitPayload = parse_payload(&ctx.job)?;
        self.service.run_init(payload).await
    }
}

mod commit;
mod delete;
mod init;

pub use commit::SessionCommitExecutor;
pub use delete::SessionDeleteExecutor;
pub use init::SessionInitExecutor;

use std::sync::Arc;

use berth_core::{
    fifo_key_session, now_millis, AgentId, CommitStatus, Error, JobKind, ProjectId, Result,
    Session, SessionCommitPayload, SessionDeletePayload, SessionId, SessionInitPayload,
    SessionStatus, WorkspaceId,
};
use berth_git::GitProvider;
use berth_queue::QueueClient;
use berth_sandbox::SandboxProvider;
use berth_store::Store;
use uuid::Uuid;

use crate::ServiceConfig;

/// Owns the session state machine: synchronous helpers for handlers plus
/// the three executor bodies (`run_init`, `run_commit`, `run_delete`) the
/// dispatcher invokes. All long-running work goes through the queue under
/// the session's FIFO key, so init, commit and delete never interleave for
/// one session.
pub struct SessionService {
    pub(crate) store: Store,
    pub(crate) git: GitProvider,
    pub(crate) sandbox: Arc<dyn SandboxProvider>,
    pub(crate) queue: QueueClient,
    pub(crate) config: ServiceConfig,
}

impl SessionService {
    pub fn new(
        store: Store,
        git: GitProvider,
        sandbox: Arc<dyn SandboxProvider>,
        queue: QueueClient,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            git,
            sandbox,
            queue,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Insert a session row and enqueue its init job. `agent_id` of `None`
    /// is resolved to the project default during init.
    pub async fn create_session(
        &self,
        project_id: ProjectId,
        workspace_id: WorkspaceId,
        agent_id: Option<AgentId>,
        name: String,
        display_name: Option<String>,
    ) -> Result<Session> {
        let now = now_millis();
        let session = Session {
            id: Uuid::new_v4(),
            project_id,
            workspace_id,
            agent_id,
            name,
            display_name,
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
        self.store.sessions().create(&session).await?;
        self.enqueue_init(&session).await?;
        Ok(session)
    }

    /// Enqueue (or re-enqueue) init for a session. A no-op while an init is
    /// already pending.
    pub async fn enqueue_init(&self, session: &Session) -> Result<()> {
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
        Ok(())
    }

    /// Mark a commit as requested and enqueue the commit job. The base the
    /// agent sees is the last applied base, falling back to the frozen
    /// init-time commit, then to the workspace's current HEAD.
    pub async fn request_commit(&self, session_id: SessionId) -> Result<()> {
        let session = self.store.sessions().must_get(session_id).await?;

        let base = match session.base_commit.or(session.workspace_commit) {
            Some(base) => base,
            None => self
                .git
                .head(session.workspace_id)
                .await?
                .ok_or_else(|| Error::Conflict("workspace has no commits to base on".into()))?,
        };

        self.store.sessions().request_commit(session_id, &base).await?;
        self.queue
            .enqueue(
                JobKind::SessionCommit,
                &fifo_key_session(session_id),
                &SessionCommitPayload {
                    project_id: session.project_id,
                    session_id,
                },
            )
            .await?;
        Ok(())
    }

    /// Enqueue deletion. The executor tears down the sandbox (volumes
    /// deleted), releases the working directory, and removes the row.
    pub async fn delete_session(&self, session_id: SessionId) -> Result<()> {
        let session = self.store.sessions().must_get(session_id).await?;
        self.queue
            .enqueue(
                JobKind::SessionDelete,
                &fifo_key_session(session_id),
                &SessionDeletePayload {
                    project_id: session.project_id,
                    session_id,
                },
            )
            .await?;
        Ok(())
    }

    /// Stop a session's sandbox and mark it stopped. The gatekeeper will
    /// re-init it on the next agent call.
    pub async fn stop_session(&self, session_id: SessionId) -> Result<()> {
        let session = self.store.sessions().must_get(session_id).await?;
        match self.sandbox.stop(session.id, self.config.stop_grace).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.store
            .sessions()
            .update_status(session_id, SessionStatus::Stopped, None)
            .await
    }

    /// Force a fresh init pass (used by "reinitialize" in the UI).
    /// Preserves the frozen workspace binding.
    pub async fn reinitialize_session(&self, session_id: SessionId) -> Result<()> {
        let session = self.store.sessions().must_get(session_id).await?;
        self.store
            .sessions()
            .update_status(session_id, SessionStatus::Reinitializing, None)
            .await?;
        self.enqueue_init(&session).await
    }

    pub async fn rename_session(
        &self,
        session_id: SessionId,
        display_name: Option<&str>,
    ) -> Result<()> {
        self.store.sessions().rename(session_id, display_name).await
    }
}

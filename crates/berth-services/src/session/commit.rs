use std::sync::Arc;

use async_trait::async_trait;
use berth_core::{
    CommitStatus, Error, JobKind, Result, SessionCommitPayload, SessionId,
};
use berth_queue::{parse_payload, JobContext, JobExecutor};
use berth_sidecar::{PostChatRequest, SidecarClient};
use tracing::{debug, info, instrument};

use super::SessionService;
use crate::client::sidecar_for;

impl SessionService {
    /// The `session_commit` job body: capture the agent's staged work as
    /// git commits in the shared workspace, applied at most once.
    ///
    /// The FIFO key guarantees no init or delete runs concurrently with
    /// this for the same session. `last_attempt` tells us a transient
    /// failure will not be retried, so the commit must be finalised as
    /// failed rather than left `committing`.
    #[instrument(skip(self, payload), fields(session = %payload.session_id))]
    pub async fn run_commit(
        &self,
        payload: SessionCommitPayload,
        last_attempt: bool,
    ) -> Result<()> {
        let session_id = payload.session_id;
        let session = self.store.sessions().must_get(session_id).await?;

        // Idempotency gate.
        match session.commit_status {
            CommitStatus::Completed => return Ok(()),
            CommitStatus::Pending => {
                self.store.sessions().begin_committing(session_id).await?;
            }
            // A retry after a mid-flight crash resumes from `committing`.
            CommitStatus::Committing => {}
            CommitStatus::None | CommitStatus::Failed => {
                debug!(status = %session.commit_status, "no commit requested; skipping");
                return Ok(());
            }
        }

        let base = session.base_commit.clone().ok_or_else(|| {
            Error::Fatal("commit requested without a base commit".into())
        })?;

        let result = self.commit_inner(session_id, session.workspace_id, &base).await;
        match &result {
            Ok(applied) => {
                info!(session = %session_id, applied = %applied, "commit pipeline completed");
            }
            Err(e) if e.is_transient() && !last_attempt => {
                // Leave commit_status at `committing`; the retry resumes.
                debug!(session = %session_id, error = %e, "commit pipeline will retry");
            }
            Err(e) => {
                let reason = match e {
                    Error::PatchConflict(_) => "patch conflict".to_string(),
                    other => other.to_string(),
                };
                self.store.sessions().fail_commit(session_id, &reason).await?;
                self.emit_session_event(session_id).await?;
            }
        }
        result.map(|_| ())
    }

    async fn commit_inner(
        &self,
        session_id: SessionId,
        workspace_id: berth_core::WorkspaceId,
        base: &str,
    ) -> Result<String> {
        let sidecar = sidecar_for(self.sandbox.as_ref(), session_id).await?;

        let head = self
            .git
            .head(workspace_id)
            .await?
            .ok_or_else(|| Error::Fatal("workspace has no commits".into()))?;

        // Optimistic patch check: the agent may already hold commits
        // parented at our recorded base, in which case they apply directly
        // — even when the workspace has advanced past that base.
        let mut effective_base = base.to_string();

        let response = match sidecar.get_commits(&effective_base).await {
            Ok(response) if response.commit_count > 0 => {
                debug!(session = %session_id, "optimistic patch check hit");
                response
            }
            Ok(_) | Err(Error::ParentMismatch(_)) => {
                // No usable patches yet: prompt the agent to commit its
                // work onto the current workspace HEAD, wait for the
                // completion to finish, then fetch against that head.
                self.prompt_commit(&sidecar, &head).await?;
                self.store
                    .sessions()
                    .advance_base_commit(session_id, &head)
                    .await?;
                effective_base = head.clone();

                match sidecar.get_commits(&effective_base).await {
                    Ok(response) => response,
                    // The agent base moved again under us; retry the job.
                    Err(Error::ParentMismatch(detail)) => {
                        return Err(Error::Transient(format!(
                            "agent base moved after commit prompt: {detail}"
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        if response.commit_count == 0 {
            // Even after prompting the agent has nothing staged. Zero work
            // is a success: the applied commit is the base itself.
            self.store
                .sessions()
                .complete_commit(session_id, &effective_base)
                .await?;
            self.finish_commit(session_id, &head, &effective_base).await?;
            return Ok(effective_base);
        }

        let applied = self
            .git
            .apply_mbox(workspace_id, session_id, &effective_base, response.patches.as_bytes())
            .await?;

        self.store
            .sessions()
            .complete_commit(session_id, &applied)
            .await?;
        self.finish_commit(session_id, &head, &effective_base).await?;
        Ok(applied)
    }

    /// Ask the agent to commit (or rebase) its staged work onto the given
    /// workspace HEAD and wait for the completion stream to end.
    async fn prompt_commit(&self, sidecar: &SidecarClient, new_head: &str) -> Result<()> {
        let prompt = format!("/{}-commit {new_head}", self.config.prompt_namespace);
        sidecar
            .post_chat(&PostChatRequest::user_prompt(prompt))
            .await?;
        sidecar.stream_chat().await?.drain().await
    }

    /// Post-completion bookkeeping: record the workspace head the session
    /// is now based on, and surface the terminal state on the event bus.
    async fn finish_commit(
        &self,
        session_id: SessionId,
        head: &str,
        effective_base: &str,
    ) -> Result<()> {
        if head != effective_base {
            // Patches were applied against an older base while the
            // workspace had advanced; record the workspace head so the next
            // cycle starts from it.
            self.store
                .sessions()
                .advance_base_commit(session_id, head)
                .await?;
        }
        self.emit_session_event(session_id).await
    }

    /// Re-emit the session's current status so subscribers refetch the
    /// commit fields. Every terminal commit outcome ends with one of these
    /// plus the dispatcher's `job_completed`.
    pub(crate) async fn emit_session_event(&self, session_id: SessionId) -> Result<()> {
        let session = self.store.sessions().must_get(session_id).await?;
        self.store
            .sessions()
            .update_status(session_id, session.status, session.error_message.as_deref())
            .await
    }
}

pub struct SessionCommitExecutor {
    service: Arc<SessionService>,
}

impl SessionCommitExecutor {
    pub fn new(service: Arc<SessionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl JobExecutor for SessionCommitExecutor {
    fn kind(&self) -> JobKind {
        JobKind::SessionCommit
    }

    async fn execute(&self, ctx: JobContext) -> Result<()> {
        let payload: SessionCommitPayload = parse_payload(&ctx.job)?;
        let last_attempt = ctx.attempt + 1 >= ctx.job.max_attempts;
        self.service.run_commit(payload, last_attempt).await
    }
}

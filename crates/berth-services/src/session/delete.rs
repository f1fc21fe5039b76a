use std::sync::Arc;

use async_trait::async_trait;
use berth_core::{Error, JobKind, Result, SessionDeletePayload, SessionStatus};
use berth_queue::{parse_payload, JobContext, JobExecutor};
use berth_sandbox::VolumePolicy;
use tracing::{info, instrument, warn};

use super::SessionService;

impl SessionService {
    /// The `session_delete` job body: tear down the sandbox (volumes
    /// deleted — this is the one place that deletes them), release the
    /// per-session working directory, and drop the row.
    #[instrument(skip(self, payload), fields(session = %payload.session_id))]
    pub async fn run_delete(&self, payload: SessionDeletePayload) -> Result<()> {
        let session_id = payload.session_id;
        let Some(session) = self.store.sessions().get(session_id).await? else {
            // Already gone; deletion is idempotent.
            return Ok(());
        };

        self.store
            .sessions()
            .update_status(session_id, SessionStatus::Removing, None)
            .await?;

        match self.sandbox.stop(session_id, self.config.stop_grace).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => warn!(session = %session_id, error = %e, "sandbox stop before removal failed"),
        }
        match self.sandbox.remove(session_id, VolumePolicy::Delete).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.git
            .release_session_dir(session.workspace_id, session_id)
            .await?;

        self.store.sessions().delete(session_id).await?;
        info!(session = %session_id, "session deleted");
        Ok(())
    }
}

pub struct SessionDeleteExecutor {
    service: Arc<SessionService>,
}

impl SessionDeleteExecutor {
    pub fn new(service: Arc<SessionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl JobExecutor for SessionDeleteExecutor {
    fn kind(&self) -> JobKind {
        JobKind::SessionDelete
    }

    async fn execute(&self, ctx: JobContext) -> Result<()> {
        let payload: SessionDeletePayload = parse_payload(&ctx.job)?;
        self.service.run_delete(payload).await
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use berth_core::{
    fifo_key_workspace, now_millis, JobKind, ProjectId, Result, SourceType, Workspace,
    WorkspaceId, WorkspaceInitPayload, WorkspaceStatus,
};
use berth_git::GitProvider;
use berth_queue::{parse_payload, JobContext, JobExecutor, QueueClient};
use berth_store::Store;
use tracing::{info, instrument};
use uuid::Uuid;

/// Owns workspace lifecycle: creation enqueues a `workspace_init` job, and
/// the executor below performs the clone/fetch and status transition.
pub struct WorkspaceService {
    store: Store,
    git: GitProvider,
    queue: QueueClient,
}

impl WorkspaceService {
    pub fn new(store: Store, git: GitProvider, queue: QueueClient) -> Self {
        Self { store, git, queue }
    }

    /// Insert the workspace row and enqueue its init job.
    pub async fn create_workspace(
        &self,
        project_id: ProjectId,
        source_type: SourceType,
        source: String,
        display_name: Option<String>,
    ) -> Result<Workspace> {
        let now = now_millis();
        let workspace = Workspace {
            id: Uuid::new_v4(),
            project_id,
            path: None,
            source_type,
            source,
            display_name,
            status: WorkspaceStatus::Initializing,
            commit: None,
            branches: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.store.workspaces().create(&workspace).await?;
        self.enqueue_init(project_id, workspace.id).await?;
        Ok(workspace)
    }

    /// (Re-)enqueue init for an existing workspace. Terminal states
    /// re-enter `initializing` through the executor.
    pub async fn enqueue_init(
        &self,
        project_id: ProjectId,
        workspace_id: WorkspaceId,
    ) -> Result<()> {
        self.queue
            .enqueue(
                JobKind::WorkspaceInit,
                &fifo_key_workspace(workspace_id),
                &WorkspaceInitPayload {
                    project_id,
                    workspace_id,
                },
            )
            .await?;
        Ok(())
    }

    /// The `workspace_init` job body. Idempotent: re-running against a
    /// ready workspace refreshes `commit` and `branches` from the clone.
    #[instrument(skip(self), fields(workspace = %payload.workspace_id))]
    pub async fn run_init(&self, payload: WorkspaceInitPayload) -> Result<()> {
        let workspace_id = payload.workspace_id;

        let result = self.init_inner(workspace_id).await;
        if let Err(e) = &result {
            self.store
                .workspaces()
                .update_status(workspace_id, WorkspaceStatus::Error, Some(&e.to_string()))
                .await?;
        }
        result
    }

    async fn init_inner(&self, workspace_id: WorkspaceId) -> Result<()> {
        let workspace = self
            .store
            .workspaces()
            .get(workspace_id)
            .await?
            .ok_or_else(|| berth_core::Error::NotFound(format!("workspace {workspace_id}")))?;

        if workspace.status != WorkspaceStatus::Initializing {
            self.store
                .workspaces()
                .update_status(workspace_id, WorkspaceStatus::Initializing, None)
                .await?;
        }

        let checkout = self
            .git
            .ensure_workspace(workspace_id, workspace.source_type, &workspace.source, None)
            .await?;

        // A ready workspace records the clone's HEAD only for git sources.
        let commit = match workspace.source_type {
            SourceType::Git => checkout.head.as_deref(),
            SourceType::Local => None,
        };
        self.store
            .workspaces()
            .set_ready(workspace_id, &checkout.path, commit, &checkout.branches)
            .await?;

        info!(workspace = %workspace_id, head = ?checkout.head, "workspace ready");
        Ok(())
    }
}

pub struct WorkspaceInitExecutor {
    service: Arc<WorkspaceService>,
}

impl WorkspaceInitExecutor {
    pub fn new(service: Arc<WorkspaceService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl JobExecutor for WorkspaceInitExecutor {
    fn kind(&self) -> JobKind {
        JobKind::WorkspaceInit
    }

    async fn execute(&self, ctx: JobContext) -> Result<()> {
        let payload: WorkspaceInitPayload = parse_payload(&ctx.job)?;
        self.service.run_init(payload).await
    }
}

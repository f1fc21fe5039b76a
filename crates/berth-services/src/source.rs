use async_trait::async_trait;
use berth_core::{Error, Result, SourceType, WorkspaceId};
use berth_git::WorkspaceSource;
use berth_store::Store;

/// Store-backed [`WorkspaceSource`]: resolves a workspace id to its
/// configured source so callers of the git provider need not carry it.
pub struct StoreWorkspaceSource {
    store: Store,
}

impl StoreWorkspaceSource {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl WorkspaceSource for StoreWorkspaceSource {
    async fn resolve(&self, workspace_id: WorkspaceId) -> Result<(SourceType, String)> {
        let workspace = self
            .store
            .workspaces()
            .get(workspace_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workspace {workspace_id}")))?;
        Ok((workspace.source_type, workspace.source))
    }
}

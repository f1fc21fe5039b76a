//! Git provider: one shared clone per workspace, one worktree per session.
//!
//! The shared clone under `<root>/<workspace>/repo` is touched only for
//! fetches and commit application; sessions get their own worktrees under
//! `<root>/<workspace>/sessions/<session>` so uncommitted edits never
//! collide. Only commits flow back to the shared repo.

mod cmd;
mod provider;
mod repository;

pub use provider::{CommitInfo, GitProvider, StatusEntry, WorkspaceCheckout};
pub use repository::GitRepository;

use async_trait::async_trait;
use berth_core::{Result, SourceType, WorkspaceId};

/// Translates a `workspace_id` into its source when callers don't carry it.
/// Implemented by the store-backed lookup in the service layer.
#[async_trait]
pub trait WorkspaceSource: Send + Sync + 'static {
    async fn resolve(&self, workspace_id: WorkspaceId) -> Result<(SourceType, String)>;
}

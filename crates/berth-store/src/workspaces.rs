use std::path::Path;

use berth_core::{
    now_millis, Error, EventKind, Result, Workspace, WorkspaceId, WorkspaceStatus,
};
use sqlx::AnyPool;
use sqlx::Connection;

use crate::events::append_tx;
use crate::row::{workspace_from_row, WorkspaceRow, WORKSPACE_COLS};

#[derive(Clone)]
pub struct WorkspaceStore {
    db: AnyPool,
}

impl WorkspaceStore {
    pub fn new(db: AnyPool) -> Self {
        Self { db }
    }

    pub async fn create(&self, ws: &Workspace) -> Result<()> {
        sqlx::query(
            "INSERT INTO workspaces (id, project_id, path, source_type, source, display_name,
                 status, commit_sha, branches, error_message, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(ws.id.to_string())
        .bind(ws.project_id.to_string())
        .bind(ws.path.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(ws.source_type.to_string())
        .bind(&ws.source)
        .bind(&ws.display_name)
        .bind(ws.status.to_string())
        .bind(&ws.commit)
        .bind(
            ws.branches
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| Error::Internal(format!("encode branches: {e}")))?,
        )
        .bind(&ws.error_message)
        .bind(ws.created_at)
        .bind(ws.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: WorkspaceId) -> Result<Option<Workspace>> {
        let row: Option<WorkspaceRow> = sqlx::query_as(&format!(
            "SELECT {WORKSPACE_COLS} FROM workspaces WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.db)
        .await?;

        row.map(workspace_from_row).transpose()
    }

    pub async fn list_by_project(
        &self,
        project_id: berth_core::ProjectId,
    ) -> Result<Vec<Workspace>> {
        let rows: Vec<WorkspaceRow> = sqlx::query_as(&format!(
            "SELECT {WORKSPACE_COLS} FROM workspaces WHERE project_id = $1 ORDER BY created_at"
        ))
        .bind(project_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(workspace_from_row).collect()
    }

    /// Transition workspace status and write the matching `workspace_updated`
    /// event in one transaction.
    pub async fn update_status(
        &self,
        id: WorkspaceId,
        status: WorkspaceStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        let mut tx = conn.begin().await?;

        // Placeholders are kept in first-occurrence order; the sqlite driver
        // binds positionally.
        let row: Option<(String,)> = sqlx::query_as(
            "UPDATE workspaces SET status = $1, error_message = $2, updated_at = $3
             WHERE id = $4 RETURNING project_id",
        )
        .bind(status.to_string())
        .bind(error_message)
        .bind(now_millis())
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let (project_id,) =
            row.ok_or_else(|| Error::NotFound(format!("workspace {id}")))?;
        let project_id = crate::row::parse_uuid(&project_id)?;

        append_tx(
            &mut tx,
            project_id,
            EventKind::WorkspaceUpdated,
            &id.to_string(),
            None,
            Some(&status.to_string()),
            error_message,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark a workspace ready with its resolved path, HEAD and branch list.
    /// Emits `workspace_updated(ready)`.
    pub async fn set_ready(
        &self,
        id: WorkspaceId,
        path: &Path,
        commit: Option<&str>,
        branches: &[String],
    ) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        let mut tx = conn.begin().await?;

        let branches_json = serde_json::to_string(branches)
            .map_err(|e| Error::Internal(format!("encode branches: {e}")))?;

        let row: Option<(String,)> = sqlx::query_as(
            "UPDATE workspaces SET status = $1, path = $2, commit_sha = $3, branches = $4,
                 error_message = NULL, updated_at = $5
             WHERE id = $6 RETURNING project_id",
        )
        .bind(WorkspaceStatus::Ready.to_string())
        .bind(path.to_string_lossy().to_string())
        .bind(commit)
        .bind(branches_json)
        .bind(now_millis())
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let (project_id,) =
            row.ok_or_else(|| Error::NotFound(format!("workspace {id}")))?;
        let project_id = crate::row::parse_uuid(&project_id)?;

        append_tx(
            &mut tx,
            project_id,
            EventKind::WorkspaceUpdated,
            &id.to_string(),
            None,
            Some("ready"),
            None,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete a workspace. Refused while any session under it is not settled
    /// (spec: no deletion with in-flight sessions).
    pub async fn delete(&self, id: WorkspaceId) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        let mut tx = conn.begin().await?;

        let (busy,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sessions
             WHERE workspace_id = $1 AND status NOT IN ('ready', 'stopped', 'error')",
        )
        .bind(id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        if busy > 0 {
            return Err(Error::Conflict(format!(
                "workspace {id} has {busy} session(s) with work in flight"
            )));
        }

        sqlx::query("DELETE FROM sessions WHERE workspace_id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM workspaces WHERE id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(Error::NotFound(format!("workspace {id}")));
        }

        tx.commit().await?;
        Ok(())
    }
}

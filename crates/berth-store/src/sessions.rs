use std::path::Path;

use berth_core::{
    now_millis, AgentId, CommitStatus, Error, EventKind, ProjectId, Result, Session, SessionId,
    SessionStatus, WorkspaceId,
};
use sqlx::AnyPool;
use sqlx::Connection;

use crate::events::append_tx;
use crate::row::{parse_uuid, session_from_row, SessionRow, SESSION_COLS};

#[derive(Clone)]
pub struct SessionStore {
    db: AnyPool,
}

impl SessionStore {
    pub fn new(db: AnyPool) -> Self {
        Self { db }
    }

    pub async fn create(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, project_id, workspace_id, agent_id, name, display_name,
                 status, workspace_path, workspace_commit, base_commit, applied_commit,
                 commit_status, commit_error, error_message, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(session.id.to_string())
        .bind(session.project_id.to_string())
        .bind(session.workspace_id.to_string())
        .bind(session.agent_id.map(|a| a.to_string()))
        .bind(&session.name)
        .bind(&session.display_name)
        .bind(session.status.to_string())
        .bind(
            session
                .workspace_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        )
        .bind(&session.workspace_commit)
        .bind(&session.base_commit)
        .bind(&session.applied_commit)
        .bind(session.commit_status.to_string())
        .bind(&session.commit_error)
        .bind(&session.error_message)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: SessionId) -> Result<Option<Session>> {
        let row: Option<SessionRow> =
            sqlx::query_as(&format!("SELECT {SESSION_COLS} FROM sessions WHERE id = $1"))
                .bind(id.to_string())
                .fetch_optional(&self.db)
                .await?;

        row.map(session_from_row).transpose()
    }

    /// Load-or-fail variant used by the executors.
    pub async fn must_get(&self, id: SessionId) -> Result<Session> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {id}")))
    }

    pub async fn list_by_project(&self, project_id: ProjectId) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLS} FROM sessions WHERE project_id = $1 ORDER BY created_at"
        ))
        .bind(project_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(session_from_row).collect()
    }

    pub async fn list_by_workspace(&self, workspace_id: WorkspaceId) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLS} FROM sessions WHERE workspace_id = $1 ORDER BY created_at"
        ))
        .bind(workspace_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(session_from_row).collect()
    }

    /// Sessions currently in any of the given statuses. Reconciliation uses
    /// this to find rows that claim live sandboxes.
    pub async fn list_by_statuses(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> =
            (1..=statuses.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "SELECT {SESSION_COLS} FROM sessions WHERE status IN ({}) ORDER BY created_at",
            placeholders.join(", ")
        );

        let mut query = sqlx::query_as::<_, SessionRow>(&sql);
        for status in statuses {
            query = query.bind(status.to_string());
        }
        let rows = query.fetch_all(&self.db).await?;

        rows.into_iter().map(session_from_row).collect()
    }

    /// Transition session status and write the matching `session_updated`
    /// event in one transaction.
    pub async fn update_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        let mut tx = conn.begin().await?;

        let row: Option<(String,)> = sqlx::query_as(
            "UPDATE sessions SET status = $1, error_message = $2, updated_at = $3
             WHERE id = $4 RETURNING project_id",
        )
        .bind(status.to_string())
        .bind(error_message)
        .bind(now_millis())
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let (project_id,) = row.ok_or_else(|| Error::NotFound(format!("session {id}")))?;
        let project_id = parse_uuid(&project_id)?;

        append_tx(
            &mut tx,
            project_id,
            EventKind::SessionUpdated,
            &id.to_string(),
            None,
            Some(&status.to_string()),
            error_message,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Persist the resolved agent (project default lookup happens in the
    /// session service).
    pub async fn set_agent(&self, id: SessionId, agent_id: Option<AgentId>) -> Result<()> {
        sqlx::query("UPDATE sessions SET agent_id = $1, updated_at = $2 WHERE id = $3")
            .bind(agent_id.map(|a| a.to_string()))
            .bind(now_millis())
            .bind(id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Freeze the per-session working copy binding. Writes only when
    /// `workspace_path` is still unset; reinit never overwrites it.
    ///
    /// Returns `true` when this call performed the (first) write.
    pub async fn bind_workspace(
        &self,
        id: SessionId,
        path: &Path,
        commit: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET workspace_path = $1, workspace_commit = $2, updated_at = $3
             WHERE id = $4 AND workspace_path IS NULL",
        )
        .bind(path.to_string_lossy().to_string())
        .bind(commit)
        .bind(now_millis())
        .bind(id.to_string())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Request a commit: `none|completed|failed → pending` with the base the
    /// agent currently sees. A commit already pending or committing is a
    /// conflict ("commit in progress").
    pub async fn request_commit(&self, id: SessionId, base_commit: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sessions SET commit_status = $1, base_commit = $2, commit_error = NULL,
                 updated_at = $3
             WHERE id = $4 AND commit_status NOT IN ($5, $6)",
        )
        .bind(CommitStatus::Pending.to_string())
        .bind(base_commit)
        .bind(now_millis())
        .bind(id.to_string())
        .bind(CommitStatus::Pending.to_string())
        .bind(CommitStatus::Committing.to_string())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            // Either the row is missing or a commit is already in flight.
            if self.get(id).await?.is_none() {
                return Err(Error::NotFound(format!("session {id}")));
            }
            return Err(Error::Conflict(format!("commit in progress for session {id}")));
        }
        Ok(())
    }

    /// `pending → committing`. Returns `false` when the session is no longer
    /// pending (idempotent re-execution).
    pub async fn begin_committing(&self, id: SessionId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET commit_status = $1, updated_at = $2
             WHERE id = $3 AND commit_status = $4",
        )
        .bind(CommitStatus::Committing.to_string())
        .bind(now_millis())
        .bind(id.to_string())
        .bind(CommitStatus::Pending.to_string())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move the base forward after the agent rebased onto a new workspace
    /// HEAD.
    pub async fn advance_base_commit(&self, id: SessionId, commit: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET base_commit = $1, updated_at = $2 WHERE id = $3")
            .bind(commit)
            .bind(now_millis())
            .bind(id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Terminal commit success: records the applied SHA.
    pub async fn complete_commit(&self, id: SessionId, applied_commit: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET commit_status = $1, applied_commit = $2, commit_error = NULL,
                 updated_at = $3
             WHERE id = $4",
        )
        .bind(CommitStatus::Completed.to_string())
        .bind(applied_commit)
        .bind(now_millis())
        .bind(id.to_string())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Terminal commit failure with a human-readable reason.
    pub async fn fail_commit(&self, id: SessionId, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET commit_status = $1, commit_error = $2, updated_at = $3
             WHERE id = $4",
        )
        .bind(CommitStatus::Failed.to_string())
        .bind(error)
        .bind(now_millis())
        .bind(id.to_string())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn rename(&self, id: SessionId, display_name: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE sessions SET display_name = $1, updated_at = $2 WHERE id = $3")
            .bind(display_name)
            .bind(now_millis())
            .bind(id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Hard delete; the delete executor calls this after sandbox teardown.
    /// Child rows (messages, terminal history) go first.
    pub async fn delete(&self, id: SessionId) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        let mut tx = conn.begin().await?;

        sqlx::query("DELETE FROM messages WHERE session_id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM terminal_history WHERE session_id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

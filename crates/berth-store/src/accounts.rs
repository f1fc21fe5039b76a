//! Ancillary entities: users, projects, membership, preferences,
//! credentials, chat messages. These constrain the core (agent resolution,
//! SSE scoping) but carry no lifecycle of their own.

use berth_core::{
    now_millis, Error, Message, Project, ProjectId, Result, SessionId, User, UserId,
    UserPreference,
};
use sqlx::AnyPool;
use uuid::Uuid;

use crate::row::parse_uuid;

/// A stored credential. `secret` is already sealed by the caller; the store
/// never sees plaintext.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: Uuid,
    pub user_id: UserId,
    pub provider: String,
    pub secret: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// An authenticated browser session (the HTTP layer's cookie token).
#[derive(Debug, Clone)]
pub struct UserSession {
    pub token: String,
    pub user_id: UserId,
    pub expires_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct ProjectInvitation {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub email: String,
    pub role: String,
    pub token: String,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct AccountStore {
    db: AnyPool,
}

impl AccountStore {
    pub fn new(db: AnyPool) -> Self {
        Self { db }
    }

    // ── Users ──

    pub async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, email, display_name, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(user.id.to_string())
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row: Option<(String, String, Option<String>, i64)> =
            sqlx::query_as("SELECT id, email, display_name, created_at FROM users WHERE id = $1")
                .bind(id.to_string())
                .fetch_optional(&self.db)
                .await?;

        row.map(|(id, email, display_name, created_at)| {
            Ok(User {
                id: parse_uuid(&id)?,
                email,
                display_name,
                created_at,
            })
        })
        .transpose()
    }

    // ── Projects ──

    pub async fn create_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, owner_id, name, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(project.id.to_string())
        .bind(project.owner_id.to_string())
        .bind(&project.name)
        .bind(project.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
        let row: Option<(String, String, String, i64)> =
            sqlx::query_as("SELECT id, owner_id, name, created_at FROM projects WHERE id = $1")
                .bind(id.to_string())
                .fetch_optional(&self.db)
                .await?;

        row.map(|(id, owner_id, name, created_at)| {
            Ok(Project {
                id: parse_uuid(&id)?,
                owner_id: parse_uuid(&owner_id)?,
                name,
                created_at,
            })
        })
        .transpose()
    }

    pub async fn add_member(&self, project_id: ProjectId, user_id: UserId, role: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO project_members (project_id, user_id, role) VALUES ($1, $2, $3)
             ON CONFLICT (project_id, user_id) DO UPDATE SET role = $4",
        )
        .bind(project_id.to_string())
        .bind(user_id.to_string())
        .bind(role)
        .bind(role)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn list_members(&self, project_id: ProjectId) -> Result<Vec<(UserId, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT user_id, role FROM project_members WHERE project_id = $1 ORDER BY user_id",
        )
        .bind(project_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(user_id, role)| Ok((parse_uuid(&user_id)?, role)))
            .collect()
    }

    // ── Invitations ──

    pub async fn create_invitation(&self, invitation: &ProjectInvitation) -> Result<()> {
        sqlx::query(
            "INSERT INTO project_invitations (id, project_id, email, role, token, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(invitation.id.to_string())
        .bind(invitation.project_id.to_string())
        .bind(&invitation.email)
        .bind(&invitation.role)
        .bind(&invitation.token)
        .bind(invitation.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get_invitation_by_token(&self, token: &str) -> Result<Option<ProjectInvitation>> {
        let row: Option<(String, String, String, String, String, i64)> = sqlx::query_as(
            "SELECT id, project_id, email, role, token, created_at FROM project_invitations
             WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await?;

        row.map(|(id, project_id, email, role, token, created_at)| {
            Ok(ProjectInvitation {
                id: parse_uuid(&id)?,
                project_id: parse_uuid(&project_id)?,
                email,
                role,
                token,
                created_at,
            })
        })
        .transpose()
    }

    pub async fn delete_invitation(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM project_invitations WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    // ── User sessions (auth tokens) ──

    pub async fn create_user_session(&self, session: &UserSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_sessions (token, user_id, expires_at, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&session.token)
        .bind(session.user_id.to_string())
        .bind(session.expires_at)
        .bind(session.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Look up a live (unexpired) auth token.
    pub async fn get_user_session(&self, token: &str) -> Result<Option<UserSession>> {
        let row: Option<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT token, user_id, expires_at, created_at FROM user_sessions
             WHERE token = $1 AND expires_at > $2",
        )
        .bind(token)
        .bind(now_millis())
        .fetch_optional(&self.db)
        .await?;

        row.map(|(token, user_id, expires_at, created_at)| {
            Ok(UserSession {
                token,
                user_id: parse_uuid(&user_id)?,
                expires_at,
                created_at,
            })
        })
        .transpose()
    }

    pub async fn delete_user_session(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM user_sessions WHERE token = $1")
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Drop expired tokens. Returns how many were removed.
    pub async fn purge_expired_user_sessions(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at <= $1")
            .bind(now_millis())
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    // ── Preferences ──

    pub async fn list_user_preferences(&self, user_id: UserId) -> Result<Vec<UserPreference>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT user_id, key, value FROM user_preferences WHERE user_id = $1 ORDER BY key",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(user_id, key, value)| {
                Ok(UserPreference {
                    user_id: parse_uuid(&user_id)?,
                    key,
                    value: serde_json::from_str(&value)
                        .map_err(|e| Error::Internal(format!("corrupt preference value: {e}")))?,
                })
            })
            .collect()
    }

    pub async fn set_user_preference(
        &self,
        user_id: UserId,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let encoded = serde_json::to_string(value)
            .map_err(|e| Error::Internal(format!("encode preference value: {e}")))?;
        sqlx::query(
            "INSERT INTO user_preferences (user_id, key, value) VALUES ($1, $2, $3)
             ON CONFLICT (user_id, key) DO UPDATE SET value = $4",
        )
        .bind(user_id.to_string())
        .bind(key)
        .bind(&encoded)
        .bind(&encoded)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    // ── Credentials ──

    pub async fn put_credential(&self, cred: &Credential) -> Result<()> {
        sqlx::query(
            "INSERT INTO credentials (id, user_id, provider, secret, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (user_id, provider)
                 DO UPDATE SET secret = $7, updated_at = $8",
        )
        .bind(cred.id.to_string())
        .bind(cred.user_id.to_string())
        .bind(&cred.provider)
        .bind(&cred.secret)
        .bind(cred.created_at)
        .bind(cred.updated_at)
        .bind(&cred.secret)
        .bind(cred.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get_credential(
        &self,
        user_id: UserId,
        provider: &str,
    ) -> Result<Option<Credential>> {
        let row: Option<(String, String, String, String, i64, i64)> = sqlx::query_as(
            "SELECT id, user_id, provider, secret, created_at, updated_at FROM credentials
             WHERE user_id = $1 AND provider = $2",
        )
        .bind(user_id.to_string())
        .bind(provider)
        .fetch_optional(&self.db)
        .await?;

        row.map(|(id, user_id, provider, secret, created_at, updated_at)| {
            Ok(Credential {
                id: parse_uuid(&id)?,
                user_id: parse_uuid(&user_id)?,
                provider,
                secret,
                created_at,
                updated_at,
            })
        })
        .transpose()
    }

    pub async fn delete_credential(&self, user_id: UserId, provider: &str) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE user_id = $1 AND provider = $2")
            .bind(user_id.to_string())
            .bind(provider)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    // ── Messages ──

    pub async fn append_message(
        &self,
        session_id: SessionId,
        role: &str,
        content: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (session_id, role, content, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(session_id.to_string())
        .bind(role)
        .bind(
            serde_json::to_string(content)
                .map_err(|e| Error::Internal(format!("encode message content: {e}")))?,
        )
        .bind(now_millis())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    // ── Terminal history ──

    /// Append a PTY output chunk. Written by the terminal adapter; read
    /// back on session reload.
    pub async fn append_terminal_chunk(&self, session_id: SessionId, chunk: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO terminal_history (session_id, chunk, created_at) VALUES ($1, $2, $3)",
        )
        .bind(session_id.to_string())
        .bind(chunk)
        .bind(now_millis())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// The most recent `limit` chunks, oldest first.
    pub async fn list_terminal_history(
        &self,
        session_id: SessionId,
        limit: i64,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT chunk FROM (
                 SELECT id, chunk FROM terminal_history
                 WHERE session_id = $1 ORDER BY id DESC LIMIT $2
             ) recent ORDER BY id",
        )
        .bind(session_id.to_string())
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(|(chunk,)| chunk).collect())
    }

    pub async fn list_messages(&self, session_id: SessionId) -> Result<Vec<Message>> {
        let rows: Vec<(i64, String, String, String, i64)> = sqlx::query_as(
            "SELECT id, session_id, role, content, created_at FROM messages
             WHERE session_id = $1 ORDER BY id",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(id, session_id, role, content, created_at)| {
                Ok(Message {
                    id,
                    session_id: parse_uuid(&session_id)?,
                    role,
                    content: serde_json::from_str(&content)
                        .map_err(|e| Error::Internal(format!("corrupt message content: {e}")))?,
                    created_at,
                })
            })
            .collect()
    }
}

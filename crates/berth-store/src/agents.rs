use berth_core::{now_millis, Agent, AgentId, Error, ProjectId, Result};
use sqlx::AnyPool;
use sqlx::Connection;
use uuid::Uuid;

use crate::row::{agent_from_row, AgentRow, AGENT_COLS};

/// An MCP server attached to an agent recipe.
#[derive(Debug, Clone)]
pub struct AgentMcpServer {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub name: String,
    pub url: String,
    pub headers: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct AgentStore {
    db: AnyPool,
}

impl AgentStore {
    pub fn new(db: AnyPool) -> Self {
        Self { db }
    }

    /// Insert an agent. When `is_default` is set, the previous project
    /// default is cleared in the same transaction.
    pub async fn create(&self, agent: &Agent) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        let mut tx = conn.begin().await?;

        if agent.is_default {
            sqlx::query("UPDATE agents SET is_default = 0, updated_at = $1 WHERE project_id = $2")
                .bind(now_millis())
                .bind(agent.project_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO agents (id, project_id, name, agent_type, prompt, model,
                 model_options, is_default, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(agent.id.to_string())
        .bind(agent.project_id.to_string())
        .bind(&agent.name)
        .bind(&agent.agent_type)
        .bind(&agent.prompt)
        .bind(&agent.model)
        .bind(
            agent
                .model_options
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| Error::Internal(format!("encode model_options: {e}")))?,
        )
        .bind(if agent.is_default { 1i64 } else { 0i64 })
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, id: AgentId) -> Result<Option<Agent>> {
        let row: Option<AgentRow> =
            sqlx::query_as(&format!("SELECT {AGENT_COLS} FROM agents WHERE id = $1"))
                .bind(id.to_string())
                .fetch_optional(&self.db)
                .await?;

        row.map(agent_from_row).transpose()
    }

    pub async fn list_by_project(&self, project_id: ProjectId) -> Result<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as(&format!(
            "SELECT {AGENT_COLS} FROM agents WHERE project_id = $1 ORDER BY created_at"
        ))
        .bind(project_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(agent_from_row).collect()
    }

    /// The project's default agent, used when a session is created without
    /// an explicit `agent_id`.
    pub async fn get_default(&self, project_id: ProjectId) -> Result<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as(&format!(
            "SELECT {AGENT_COLS} FROM agents WHERE project_id = $1 AND is_default = 1"
        ))
        .bind(project_id.to_string())
        .fetch_optional(&self.db)
        .await?;

        row.map(agent_from_row).transpose()
    }

    /// Swap the project default atomically.
    pub async fn set_default(&self, project_id: ProjectId, agent_id: AgentId) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        let mut tx = conn.begin().await?;

        sqlx::query("UPDATE agents SET is_default = 0, updated_at = $1 WHERE project_id = $2")
            .bind(now_millis())
            .bind(project_id.to_string())
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            "UPDATE agents SET is_default = 1, updated_at = $1
             WHERE id = $2 AND project_id = $3",
        )
        .bind(now_millis())
        .bind(agent_id.to_string())
        .bind(project_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "agent {agent_id} in project {project_id}"
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete an agent, cascading its MCP servers and nulling `agent_id` on
    /// sessions that reference it.
    pub async fn delete(&self, id: AgentId) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        let mut tx = conn.begin().await?;

        sqlx::query("UPDATE sessions SET agent_id = NULL, updated_at = $1 WHERE agent_id = $2")
            .bind(now_millis())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM agent_mcp_servers WHERE agent_id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("agent {id}")));
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn add_mcp_server(&self, server: &AgentMcpServer) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_mcp_servers (id, agent_id, name, url, headers)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(server.id.to_string())
        .bind(server.agent_id.to_string())
        .bind(&server.name)
        .bind(&server.url)
        .bind(
            server
                .headers
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| Error::Internal(format!("encode headers: {e}")))?,
        )
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn list_mcp_servers(&self, agent_id: AgentId) -> Result<Vec<AgentMcpServer>> {
        let rows: Vec<(String, String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT id, agent_id, name, url, headers FROM agent_mcp_servers
             WHERE agent_id = $1 ORDER BY name",
        )
        .bind(agent_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(id, agent_id, name, url, headers)| {
                let headers = headers
                    .map(|h| serde_json::from_str(&h))
                    .transpose()
                    .map_err(|e| Error::Internal(format!("corrupt headers column: {e}")))?;
                Ok(AgentMcpServer {
                    id: crate::row::parse_uuid(&id)?,
                    agent_id: crate::row::parse_uuid(&agent_id)?,
                    name,
                    url,
                    headers,
                })
            })
            .collect()
    }
}

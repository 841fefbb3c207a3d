//! PostgreSQL implementation of AgentRepository.

use async_trait::async_trait;
use chrono::Utc;
use gantry_core::agent::{
    Agent, AgentAction, AgentActionRecord, AgentStatus, EnvVar, HeartbeatCommit, Node, NodeStatus,
    Os,
};
use gantry_core::ids::{AgentId, NodeId, ProjectId};
use gantry_core::ports::AgentRepository;
use gantry_core::{Error, Result};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

const AGENT_COLUMNS: &str = "id, project_id, node_id, status, os, secret_key, ip, hostname, master_version, version, parallel_task_count, install_path, started_user, gateway, file_gateway, envs, created_user, created_at, updated_at, start_remote_ip";
const NODE_COLUMNS: &str =
    "id, project_id, node_string_id, display_name, ip, os, status, created_user, created_at";

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn parse_os(s: &str) -> Result<Os> {
    Os::parse(s).ok_or_else(|| Error::Serialization(format!("unknown os: {s}")))
}

fn row_to_agent(r: &PgRow) -> Result<Agent> {
    let status: String = r.get("status");
    Ok(Agent {
        id: AgentId::from_uuid(r.get("id")),
        project_id: ProjectId::new(r.get::<String, _>("project_id")),
        node_id: r.get::<Option<uuid::Uuid>, _>("node_id").map(NodeId::from_uuid),
        status: AgentStatus::parse(&status)
            .ok_or_else(|| Error::Serialization(format!("unknown agent status: {status}")))?,
        os: parse_os(r.get("os"))?,
        secret_key: r.get("secret_key"),
        ip: r.get("ip"),
        start_remote_ip: r.get("start_remote_ip"),
        hostname: r.get("hostname"),
        master_version: r.get("master_version"),
        version: r.get("version"),
        parallel_task_count: r
            .get::<Option<i32>, _>("parallel_task_count")
            .map(|v| v as u32),
        install_path: r.get("install_path"),
        started_user: r.get("started_user"),
        gateway: r.get("gateway"),
        file_gateway: r.get("file_gateway"),
        envs: r.get::<Json<Vec<EnvVar>>, _>("envs").0,
        created_user: r.get("created_user"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn row_to_node(r: &PgRow) -> Result<Node> {
    let status: String = r.get("status");
    Ok(Node {
        id: NodeId::from_uuid(r.get("id")),
        project_id: ProjectId::new(r.get::<String, _>("project_id")),
        node_string_id: r.get("node_string_id"),
        display_name: r.get("display_name"),
        ip: r.get("ip"),
        os: parse_os(r.get("os"))?,
        status: NodeStatus::parse(&status)
            .ok_or_else(|| Error::Serialization(format!("unknown node status: {status}")))?,
        created_user: r.get("created_user"),
        created_at: r.get("created_at"),
    })
}

pub struct PgAgentRepository {
    pool: PgPool,
}

impl PgAgentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentRepository for PgAgentRepository {
    async fn insert(&self, agent: &Agent) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO agents ({AGENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        ))
        .bind(agent.id.as_uuid())
        .bind(agent.project_id.as_str())
        .bind(agent.node_id.map(|n| *n.as_uuid()))
        .bind(agent.status.as_str())
        .bind(agent.os.as_str())
        .bind(&agent.secret_key)
        .bind(&agent.ip)
        .bind(&agent.hostname)
        .bind(&agent.master_version)
        .bind(&agent.version)
        .bind(agent.parallel_task_count.map(|v| v as i32))
        .bind(&agent.install_path)
        .bind(&agent.started_user)
        .bind(&agent.gateway)
        .bind(&agent.file_gateway)
        .bind(Json(&agent.envs))
        .bind(&agent.created_user)
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .bind(&agent.start_remote_ip)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, project_id: &ProjectId, agent_id: AgentId) -> Result<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE project_id = $1 AND id = $2"
        ))
        .bind(project_id.as_str())
        .bind(agent_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn get_by_node(&self, project_id: &ProjectId, node_id: NodeId) -> Result<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE project_id = $1 AND node_id = $2 LIMIT 1"
        ))
        .bind(project_id.as_str())
        .bind(node_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn find_unimported(
        &self,
        project_id: &ProjectId,
        user: &str,
        os: Os,
    ) -> Result<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE project_id = $1 AND created_user = $2 AND os = $3 AND node_id IS NULL AND status IN ($4, $5) ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(project_id.as_str())
        .bind(user)
        .bind(os.as_str())
        .bind(AgentStatus::UnImport.as_str())
        .bind(AgentStatus::UnImportOk.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn get_node(&self, project_id: &ProjectId, node_id: NodeId) -> Result<Option<Node>> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE project_id = $1 AND id = $2"
        ))
        .bind(project_id.as_str())
        .bind(node_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_node).transpose()
    }

    async fn update(&self, agent: &Agent) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE agents SET
                node_id = $2, status = $3, ip = $4, hostname = $5, master_version = $6,
                version = $7, parallel_task_count = $8, install_path = $9, started_user = $10,
                gateway = $11, file_gateway = $12, envs = $13, start_remote_ip = $14,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(agent.id.as_uuid())
        .bind(agent.node_id.map(|n| *n.as_uuid()))
        .bind(agent.status.as_str())
        .bind(&agent.ip)
        .bind(&agent.hostname)
        .bind(&agent.master_version)
        .bind(&agent.version)
        .bind(agent.parallel_task_count.map(|v| v as i32))
        .bind(&agent.install_path)
        .bind(&agent.started_user)
        .bind(&agent.gateway)
        .bind(&agent.file_gateway)
        .bind(Json(&agent.envs))
        .bind(&agent.start_remote_ip)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::AgentNotFound(agent.id.to_string()));
        }
        Ok(())
    }

    async fn commit_heartbeat(&self, commit: &HeartbeatCommit) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE id = $1 FOR UPDATE"
        ))
        .bind(commit.agent_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(false);
        };
        let mut agent = row_to_agent(&row)?;
        if agent.status != commit.expected_status {
            return Ok(false);
        }
        commit.fields.apply_to(&mut agent);
        if let Some(status) = commit.status {
            agent.status = status;
        }

        sqlx::query(
            r#"
            UPDATE agents SET
                status = $2, ip = $3, hostname = $4, master_version = $5, version = $6,
                parallel_task_count = $7, install_path = $8, started_user = $9,
                start_remote_ip = $10, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(agent.id.as_uuid())
        .bind(agent.status.as_str())
        .bind(&agent.ip)
        .bind(&agent.hostname)
        .bind(&agent.master_version)
        .bind(&agent.version)
        .bind(agent.parallel_task_count.map(|v| v as i32))
        .bind(&agent.install_path)
        .bind(&agent.started_user)
        .bind(&agent.start_remote_ip)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(action) = commit.action {
            sqlx::query("INSERT INTO agent_actions (agent_id, project_id, action) VALUES ($1, $2, $3)")
                .bind(commit.agent_id.as_uuid())
                .bind(commit.project_id.as_str())
                .bind(action.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        if let Some(node) = &commit.node {
            sqlx::query("UPDATE nodes SET status = $2, ip = $3 WHERE id = $1")
                .bind(node.node_id.as_uuid())
                .bind(node.status.as_str())
                .bind(&node.ip)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn import(&self, project_id: &ProjectId, agent_id: AgentId, node: &Node) -> Result<Node> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Serialize string id allocation within the project.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 1))")
            .bind(project_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM nodes WHERE project_id = $1")
            .bind(project_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .get("n");
        let stored = Node {
            node_string_id: format!("{}_{}", node.node_string_id, count + 1),
            ..node.clone()
        };

        sqlx::query(&format!(
            "INSERT INTO nodes ({NODE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(stored.id.as_uuid())
        .bind(stored.project_id.as_str())
        .bind(&stored.node_string_id)
        .bind(&stored.display_name)
        .bind(&stored.ip)
        .bind(stored.os.as_str())
        .bind(stored.status.as_str())
        .bind(&stored.created_user)
        .bind(stored.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let result = sqlx::query(
            "UPDATE agents SET node_id = $3, status = $4, updated_at = NOW() WHERE project_id = $1 AND id = $2",
        )
        .bind(project_id.as_str())
        .bind(agent_id.as_uuid())
        .bind(stored.id.as_uuid())
        .bind(AgentStatus::ImportOk.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::AgentNotFound(agent_id.to_string()));
        }

        tx.commit().await.map_err(db_err)?;
        Ok(stored)
    }

    async fn mark_deleted(&self, project_id: &ProjectId, node_id: NodeId) -> Result<Option<Agent>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE project_id = $1 AND node_id = $2 LIMIT 1 FOR UPDATE"
        ))
        .bind(project_id.as_str())
        .bind(node_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let before = row_to_agent(&row)?;

        sqlx::query("UPDATE agents SET status = $2, node_id = NULL, updated_at = $3 WHERE id = $1")
            .bind(before.id.as_uuid())
            .bind(AgentStatus::Delete.as_str())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE nodes SET status = $2 WHERE id = $1")
            .bind(node_id.as_uuid())
            .bind(NodeStatus::Deleted.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(before))
    }

    async fn list_actions(
        &self,
        project_id: &ProjectId,
        agent_id: AgentId,
    ) -> Result<Vec<AgentActionRecord>> {
        let rows = sqlx::query(
            "SELECT agent_id, project_id, action, recorded_at FROM agent_actions WHERE project_id = $1 AND agent_id = $2 ORDER BY id",
        )
        .bind(project_id.as_str())
        .bind(agent_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| {
                let action = match r.get::<String, _>("action").as_str() {
                    "ONLINE" => AgentAction::Online,
                    "OFFLINE" => AgentAction::Offline,
                    other => {
                        return Err(Error::Serialization(format!("unknown agent action: {other}")));
                    }
                };
                Ok(AgentActionRecord {
                    agent_id: AgentId::from_uuid(r.get("agent_id")),
                    project_id: ProjectId::new(r.get::<String, _>("project_id")),
                    action,
                    recorded_at: r.get("recorded_at"),
                })
            })
            .collect()
    }
}

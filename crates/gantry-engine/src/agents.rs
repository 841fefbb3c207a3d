//! Third-party agent registration, heartbeat and lifecycle.
//!
//! ```text
//! UN_IMPORT --heartbeat--> UN_IMPORT_OK --import--> IMPORT_OK <--> IMPORT_EXCEPTION
//!     any state --delete--> DELETE
//! ```

use crate::config::AgentsConfig;
use crate::secret::{generate_secret, SecretCipher};
use chrono::Utc;
use gantry_cache::keys;
use gantry_core::agent::{
    Agent, AgentAction, AgentFieldUpdate, AgentStatus, EnvVar, HeartbeatCommit, HeartbeatInfo,
    HeartbeatResponse, Node, NodeStatus, NodeUpdate, Os,
};
use gantry_core::events::{Event, NodeChangedPayload};
use gantry_core::ids::{AgentId, NodeId, ProjectId};
use gantry_core::ports::{
    AgentPackageSource, AgentRepository, AuthAction, AuthResource, EventBus, KvCache,
    PermissionService,
};
use gantry_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Rounds a heartbeat is recomputed when the agent row changed under it.
const HEARTBEAT_ATTEMPTS: usize = 3;

/// Where to fetch and install a generated agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLink {
    pub agent_id: AgentId,
    /// Download URL on Windows, an install command elsewhere.
    pub link: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeCheck {
    pub status: AgentStatus,
    pub upgrade: bool,
}

/// Owns the agent state machine and the heartbeat protocol.
pub struct AgentLifecycleManager {
    repo: Arc<dyn AgentRepository>,
    cache: Arc<dyn KvCache>,
    permissions: Arc<dyn PermissionService>,
    events: Arc<dyn EventBus>,
    packages: Arc<dyn AgentPackageSource>,
    cipher: SecretCipher,
    config: AgentsConfig,
}

impl AgentLifecycleManager {
    pub fn new(
        repo: Arc<dyn AgentRepository>,
        cache: Arc<dyn KvCache>,
        permissions: Arc<dyn PermissionService>,
        events: Arc<dyn EventBus>,
        packages: Arc<dyn AgentPackageSource>,
        cipher: SecretCipher,
        config: AgentsConfig,
    ) -> Self {
        Self {
            repo,
            cache,
            permissions,
            events,
            packages,
            cipher,
            config,
        }
    }

    /// Create an agent for `user`, or reuse one they generated for the same
    /// OS and never imported.
    pub async fn generate_agent(
        &self,
        user: &str,
        project_id: &ProjectId,
        os: Os,
        zone: Option<&str>,
    ) -> Result<AgentLink> {
        let gateway = self.config.gateway_for(zone).to_string();
        let file_gateway = self.config.file_gateway.clone();

        let agent = match self.repo.find_unimported(project_id, user, os).await? {
            Some(mut agent) => {
                info!(agent_id = %agent.id, "Reusing un-imported agent");
                if agent.gateway.as_deref() != Some(gateway.as_str()) {
                    agent.gateway = Some(gateway.clone());
                    agent.file_gateway = file_gateway;
                    agent.updated_at = Utc::now();
                    self.repo.update(&agent).await?;
                }
                agent
            }
            None => {
                let now = Utc::now();
                let agent = Agent {
                    id: AgentId::new(),
                    project_id: project_id.clone(),
                    node_id: None,
                    status: AgentStatus::UnImport,
                    os,
                    secret_key: self.cipher.encrypt(&generate_secret())?,
                    ip: String::new(),
                    start_remote_ip: None,
                    hostname: String::new(),
                    master_version: None,
                    version: None,
                    parallel_task_count: None,
                    install_path: None,
                    started_user: None,
                    gateway: Some(gateway.clone()),
                    file_gateway,
                    envs: Vec::new(),
                    created_user: user.to_string(),
                    created_at: now,
                    updated_at: now,
                };
                self.repo.insert(&agent).await?;
                info!(agent_id = %agent.id, project_id = %project_id, os = os.as_str(), user, "Agent generated");
                agent
            }
        };

        let link = install_link(&gateway, agent.id, os)?;
        Ok(AgentLink {
            agent_id: agent.id,
            link,
        })
    }

    /// Turn a reporting agent into a node of the project.
    pub async fn import_agent(&self, user: &str, project_id: &ProjectId, agent_id: AgentId) -> Result<Node> {
        let agent = self
            .repo
            .get(project_id, agent_id)
            .await?
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;
        if !agent.status.is_importable() {
            return Err(Error::AgentStatusException {
                agent_id: agent_id.to_string(),
                status: agent.status.to_string(),
            });
        }
        if !self
            .permissions
            .check_permission(user, project_id, &AuthResource::Project, AuthAction::Create)
            .await?
        {
            return Err(Error::PermissionDenied(format!(
                "{user} cannot create nodes in project {project_id}"
            )));
        }

        if agent.status == AgentStatus::ImportOk
            && let Some(node_id) = agent.node_id
            && let Some(node) = self.repo.get_node(project_id, node_id).await?
            && node.status != NodeStatus::Deleted
        {
            debug!(agent_id = %agent_id, node = %node.node_string_id, "Agent already imported");
            return Ok(node);
        }

        let node = Node {
            id: NodeId::new(),
            project_id: project_id.clone(),
            node_string_id: format!("BUILD_{}", agent.id.short()),
            display_name: agent.hostname.clone(),
            ip: agent.ip.clone(),
            os: agent.os,
            status: NodeStatus::Normal,
            created_user: user.to_string(),
            created_at: Utc::now(),
        };
        let node = self.repo.import(project_id, agent_id, &node).await?;
        self.permissions.grant_node(user, project_id, &node).await?;
        info!(agent_id = %agent_id, node = %node.node_string_id, user, "Agent imported");

        self.notify(project_id, user, Some(node.id)).await;
        Ok(node)
    }

    /// Delete the node and its agent.
    pub async fn delete_agent(&self, user: &str, project_id: &ProjectId, node_id: NodeId) -> Result<()> {
        let Some(agent) = self.repo.mark_deleted(project_id, node_id).await? else {
            warn!(node_id = %node_id, project_id = %project_id, "No agent backs this node");
            return Err(Error::NodeNotFound(node_id.to_string()));
        };
        if let Err(e) = self.permissions.revoke_node(project_id, node_id).await {
            warn!(node_id = %node_id, error = %e, "Failed to revoke node permissions");
        }
        info!(agent_id = %agent.id, node_id = %node_id, user, "Agent deleted");
        self.notify(project_id, user, Some(node_id)).await;
        Ok(())
    }

    /// Ingest one heartbeat.
    ///
    /// An unknown or deleted agent gets a DELETE response so it registers
    /// again. A wrong secret is [`Error::Unauthorized`].
    pub async fn heartbeat(
        &self,
        project_id: &ProjectId,
        agent_id: AgentId,
        secret: &str,
        info: &HeartbeatInfo,
    ) -> Result<HeartbeatResponse> {
        for attempt in 1..=HEARTBEAT_ATTEMPTS {
            let Some(agent) = self.authenticated(project_id, agent_id, secret).await? else {
                warn!(agent_id = %agent_id, project_id = %project_id, "Heartbeat from unknown agent");
                return Ok(deleted_response());
            };

            let mut commit = HeartbeatCommit {
                project_id: project_id.clone(),
                agent_id,
                expected_status: agent.status,
                fields: self.changed_fields(&agent, info),
                status: None,
                action: None,
                node: None,
            };

            let status = match agent.status {
                AgentStatus::UnImport => {
                    commit.status = Some(AgentStatus::UnImportOk);
                    AgentStatus::UnImportOk
                }
                AgentStatus::UnImportOk => AgentStatus::UnImportOk,
                AgentStatus::ImportOk | AgentStatus::ImportException => {
                    let Some(node) = self.live_node(project_id, &agent).await? else {
                        warn!(agent_id = %agent_id, "Node of imported agent is gone");
                        return Ok(deleted_response());
                    };
                    if agent.status == AgentStatus::ImportException {
                        commit.status = Some(AgentStatus::ImportOk);
                        commit.action = Some(AgentAction::Online);
                    }
                    let ip = info
                        .agent_ip
                        .as_deref()
                        .map(|ip| self.cap(ip))
                        .unwrap_or_else(|| node.ip.clone());
                    if node.ip != ip || node.status == NodeStatus::Abnormal {
                        commit.node = Some(NodeUpdate {
                            node_id: node.id,
                            status: NodeStatus::Normal,
                            ip,
                        });
                    }
                    AgentStatus::ImportOk
                }
                AgentStatus::Delete => return Ok(deleted_response()),
            };

            if !commit.is_empty() && !self.repo.commit_heartbeat(&commit).await? {
                debug!(agent_id = %agent_id, attempt, "Agent changed during heartbeat, recomputing");
                continue;
            }
            if commit.action == Some(AgentAction::Online) {
                info!(agent_id = %agent_id, "Agent back online");
            }

            self.mark_alive(agent_id).await;
            if let Some(node) = &commit.node {
                self.notify(project_id, "", Some(node.node_id)).await;
            }

            let mut merged = agent.clone();
            commit.fields.apply_to(&mut merged);
            return Ok(HeartbeatResponse {
                master_version: self.packages.agent_version().await?,
                worker_version: self.packages.worker_version().await?,
                agent_status: status,
                parallel_task_count: merged.parallel_task_count.map(i64::from).unwrap_or(0),
                envs: env_map(&merged.envs),
                gateway: merged.gateway,
                file_gateway: merged.file_gateway,
            });
        }
        Err(Error::Conflict(format!(
            "heartbeat of agent {agent_id} lost {HEARTBEAT_ATTEMPTS} races"
        )))
    }

    /// An agent process started. Brings it online like a heartbeat and
    /// records the ONLINE action when it was not online before.
    ///
    /// An imported agent is bound to the host it last started from; a start
    /// from any other host answers DELETE so a copied install cannot reuse
    /// the agent's identity.
    pub async fn agent_startup(
        &self,
        project_id: &ProjectId,
        agent_id: AgentId,
        secret: &str,
        info: &HeartbeatInfo,
    ) -> Result<AgentStatus> {
        for _ in 0..HEARTBEAT_ATTEMPTS {
            let Some(agent) = self.authenticated(project_id, agent_id, secret).await? else {
                return Ok(AgentStatus::Delete);
            };
            let (status, action) = match agent.status {
                AgentStatus::UnImport => (AgentStatus::UnImportOk, Some(AgentAction::Online)),
                AgentStatus::ImportException => (AgentStatus::ImportOk, Some(AgentAction::Online)),
                AgentStatus::Delete => return Ok(AgentStatus::Delete),
                other => (other, None),
            };

            let host = info.agent_ip.as_deref().map(|ip| self.cap(ip));
            if let Some(bound) = agent.start_remote_ip.as_deref().filter(|ip| !ip.is_empty())
                && !matches!(
                    agent.status,
                    AgentStatus::UnImport | AgentStatus::UnImportOk | AgentStatus::ImportException
                )
                && host.as_deref() != Some(bound)
            {
                warn!(agent_id = %agent_id, bound, host = ?host, "Agent started from another host");
                return Ok(AgentStatus::Delete);
            }

            let mut commit = HeartbeatCommit {
                project_id: project_id.clone(),
                agent_id,
                expected_status: agent.status,
                fields: self.changed_fields(&agent, info),
                status: (status != agent.status).then_some(status),
                action,
                node: None,
            };
            commit.fields.start_remote_ip = host
                .clone()
                .filter(|ip| agent.start_remote_ip.as_deref() != Some(ip.as_str()));
            if let Some(node) = self.live_node(project_id, &agent).await?
                && let Some(ip) = host.clone()
                && (node.ip != ip || node.status == NodeStatus::Abnormal)
            {
                commit.node = Some(NodeUpdate {
                    node_id: node.id,
                    status: NodeStatus::Normal,
                    ip,
                });
            }

            if !commit.is_empty() && !self.repo.commit_heartbeat(&commit).await? {
                continue;
            }
            info!(agent_id = %agent_id, status = %status, "Agent started");
            if let Some(node) = &commit.node {
                self.notify(project_id, "", Some(node.node_id)).await;
            }
            return Ok(status);
        }
        Err(Error::Conflict(format!(
            "startup of agent {agent_id} lost {HEARTBEAT_ATTEMPTS} races"
        )))
    }

    pub async fn agent_shutdown(
        &self,
        project_id: &ProjectId,
        agent_id: AgentId,
        secret: &str,
        normal: bool,
    ) -> Result<AgentStatus> {
        let status = self.agent_status(project_id, agent_id, secret).await?;
        if normal {
            info!(agent_id = %agent_id, "Agent shut down");
        } else {
            warn!(agent_id = %agent_id, "Agent shut down abnormally");
        }
        Ok(status)
    }

    pub async fn agent_status(
        &self,
        project_id: &ProjectId,
        agent_id: AgentId,
        secret: &str,
    ) -> Result<AgentStatus> {
        Ok(self
            .authenticated(project_id, agent_id, secret)
            .await?
            .map_or(AgentStatus::Delete, |a| a.status))
    }

    /// Whether the agent should download the current distributable.
    ///
    /// `tag` is the digest of the package the agent runs.
    pub async fn check_upgrade(
        &self,
        project_id: &ProjectId,
        agent_id: AgentId,
        secret: &str,
        tag: &str,
    ) -> Result<UpgradeCheck> {
        let Some(agent) = self.authenticated(project_id, agent_id, secret).await? else {
            return Ok(UpgradeCheck {
                status: AgentStatus::Delete,
                upgrade: false,
            });
        };
        if agent.status != AgentStatus::ImportOk {
            return Ok(UpgradeCheck {
                status: agent.status,
                upgrade: false,
            });
        }
        let digest = self.packages.package_digest(agent.os).await?;
        let upgrade = !digest.eq_ignore_ascii_case(tag);
        if upgrade {
            info!(agent_id = %agent_id, "Agent can upgrade");
        }
        Ok(UpgradeCheck {
            status: agent.status,
            upgrade,
        })
    }

    pub async fn save_agent_envs(
        &self,
        user: &str,
        project_id: &ProjectId,
        node_id: NodeId,
        envs: Vec<EnvVar>,
    ) -> Result<()> {
        let mut agent = self.editable_agent(user, project_id, node_id).await?;
        agent.envs = envs;
        agent.updated_at = Utc::now();
        self.repo.update(&agent).await
    }

    pub async fn agent_envs(&self, project_id: &ProjectId, node_id: NodeId) -> Result<Vec<EnvVar>> {
        let agent = self
            .repo
            .get_by_node(project_id, node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        Ok(agent.envs)
    }

    pub async fn set_parallel_task_count(
        &self,
        user: &str,
        project_id: &ProjectId,
        node_id: NodeId,
        count: u32,
    ) -> Result<()> {
        let mut agent = self.editable_agent(user, project_id, node_id).await?;
        agent.parallel_task_count = Some(count);
        agent.updated_at = Utc::now();
        self.repo.update(&agent).await
    }

    /// Mark an imported agent offline when its heartbeat marker expired.
    ///
    /// Cache failures leave the agent as it is.
    pub async fn check_liveness(&self, project_id: &ProjectId, agent_id: AgentId) -> Result<AgentStatus> {
        let Some(agent) = self.repo.get(project_id, agent_id).await? else {
            return Ok(AgentStatus::Delete);
        };
        if agent.status != AgentStatus::ImportOk {
            return Ok(agent.status);
        }
        match self.cache.get(&keys::agent_heartbeat(agent_id)).await {
            Ok(Some(_)) => return Ok(agent.status),
            Ok(None) => {}
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Heartbeat marker unavailable");
                return Ok(agent.status);
            }
        }

        let node = self.live_node(project_id, &agent).await?;
        let commit = HeartbeatCommit {
            project_id: project_id.clone(),
            agent_id,
            expected_status: AgentStatus::ImportOk,
            fields: AgentFieldUpdate::default(),
            status: Some(AgentStatus::ImportException),
            action: Some(AgentAction::Offline),
            node: node.as_ref().map(|n| NodeUpdate {
                node_id: n.id,
                status: NodeStatus::Abnormal,
                ip: n.ip.clone(),
            }),
        };
        if !self.repo.commit_heartbeat(&commit).await? {
            debug!(agent_id = %agent_id, "Agent changed during liveness check");
            return Ok(self
                .repo
                .get(project_id, agent_id)
                .await?
                .map_or(AgentStatus::Delete, |a| a.status));
        }
        warn!(agent_id = %agent_id, "Agent went offline");
        if let Some(node) = node {
            self.notify(project_id, "", Some(node.id)).await;
        }
        Ok(AgentStatus::ImportException)
    }

    /// The agent if it exists and is not deleted, after checking `secret`.
    async fn authenticated(
        &self,
        project_id: &ProjectId,
        agent_id: AgentId,
        secret: &str,
    ) -> Result<Option<Agent>> {
        let Some(agent) = self.repo.get(project_id, agent_id).await? else {
            return Ok(None);
        };
        if agent.status == AgentStatus::Delete {
            return Ok(None);
        }
        if !self.cipher.matches(&agent.secret_key, secret)? {
            warn!(agent_id = %agent_id, project_id = %project_id, "Agent secret mismatch");
            return Err(Error::Unauthorized(format!("agent {agent_id}")));
        }
        Ok(Some(agent))
    }

    async fn editable_agent(&self, user: &str, project_id: &ProjectId, node_id: NodeId) -> Result<Agent> {
        if !self
            .permissions
            .check_permission(user, project_id, &AuthResource::Node(node_id), AuthAction::Edit)
            .await?
        {
            return Err(Error::PermissionDenied(format!("{user} cannot edit node {node_id}")));
        }
        self.repo
            .get_by_node(project_id, node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))
    }

    /// The linked node unless it is missing or deleted.
    async fn live_node(&self, project_id: &ProjectId, agent: &Agent) -> Result<Option<Node>> {
        let Some(node_id) = agent.node_id else {
            return Ok(None);
        };
        Ok(self
            .repo
            .get_node(project_id, node_id)
            .await?
            .filter(|n| n.status != NodeStatus::Deleted))
    }

    fn cap(&self, value: &str) -> String {
        value.chars().take(self.config.field_max_len).collect()
    }

    /// Reported fields that differ from the stored ones.
    fn changed_fields(&self, agent: &Agent, info: &HeartbeatInfo) -> AgentFieldUpdate {
        let changed = |reported: &Option<String>, stored: Option<&str>| {
            reported
                .as_deref()
                .map(|v| self.cap(v))
                .filter(|v| Some(v.as_str()) != stored)
        };
        AgentFieldUpdate {
            master_version: changed(&info.master_version, agent.master_version.as_deref()),
            version: changed(&info.version, agent.version.as_deref()),
            ip: changed(&info.agent_ip, Some(agent.ip.as_str())),
            start_remote_ip: None,
            hostname: changed(&info.hostname, Some(agent.hostname.as_str())),
            parallel_task_count: agent
                .parallel_task_count
                .is_none()
                .then_some(info.parallel_task_count)
                .flatten(),
            install_path: changed(&info.install_path, agent.install_path.as_deref()),
            started_user: changed(&info.started_user, agent.started_user.as_deref()),
        }
    }

    async fn mark_alive(&self, agent_id: AgentId) {
        let key = keys::agent_heartbeat(agent_id);
        let now = Utc::now().timestamp_millis().to_string();
        if let Err(e) = self.cache.set(&key, &now, self.config.heartbeat_ttl()).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to refresh heartbeat marker");
        }
    }

    async fn notify(&self, project_id: &ProjectId, user: &str, node_id: Option<NodeId>) {
        let event = Event::NodeChanged(NodeChangedPayload {
            project_id: project_id.clone(),
            user_id: user.to_string(),
            node_id,
            emitted_at: Utc::now(),
        });
        if let Err(e) = self.events.publish(event).await {
            warn!(project_id = %project_id, error = %e, "Failed to notify node viewers");
        }
    }
}

fn deleted_response() -> HeartbeatResponse {
    HeartbeatResponse {
        master_version: String::new(),
        worker_version: String::new(),
        agent_status: AgentStatus::Delete,
        parallel_task_count: -1,
        envs: HashMap::new(),
        gateway: None,
        file_gateway: None,
    }
}

fn env_map(envs: &[EnvVar]) -> HashMap<String, String> {
    envs.iter().map(|e| (e.name.clone(), e.value.clone())).collect()
}

/// Download link on Windows, install command elsewhere.
fn install_link(gateway: &str, agent_id: AgentId, os: Os) -> Result<String> {
    let base = Url::parse(gateway)
        .map_err(|e| Error::Internal(format!("invalid gateway {gateway}: {e}")))?;
    let join = |path: String| {
        base.join(&path)
            .map_err(|e| Error::Internal(format!("invalid agent link {path}: {e}")))
    };
    Ok(match os {
        Os::Windows => join(format!("agents/{agent_id}/agent.zip"))?.to_string(),
        Os::Linux | Os::Macos => {
            let url = join(format!("agents/{agent_id}/install.sh"))?;
            format!("curl -sSL {url} | bash")
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_link_per_os() {
        let id = AgentId::new();
        let windows = install_link("http://gw.example", id, Os::Windows).unwrap();
        assert_eq!(windows, format!("http://gw.example/agents/{id}/agent.zip"));

        let linux = install_link("http://gw.example", id, Os::Linux).unwrap();
        assert_eq!(linux, format!("curl -sSL http://gw.example/agents/{id}/install.sh | bash"));

        assert!(install_link("not a url", id, Os::Linux).is_err());
    }

    #[test]
    fn test_deleted_response_stops_work() {
        let response = deleted_response();
        assert_eq!(response.agent_status, AgentStatus::Delete);
        assert_eq!(response.parallel_task_count, -1);
    }
}

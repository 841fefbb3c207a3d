use super::poisoned;
use async_trait::async_trait;
use chrono::Utc;
use gantry_core::agent::{
    Agent, AgentAction, AgentActionRecord, AgentStatus, HeartbeatCommit, Node, NodeStatus, Os,
};
use gantry_core::ids::{AgentId, NodeId, ProjectId};
use gantry_core::ports::AgentRepository;
use gantry_core::{Error, Result};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Tables {
    agents: HashMap<AgentId, Agent>,
    nodes: HashMap<NodeId, Node>,
    actions: Vec<AgentActionRecord>,
}

impl Tables {
    fn record_action(&mut self, project_id: &ProjectId, agent_id: AgentId, action: AgentAction) {
        self.actions.push(AgentActionRecord {
            agent_id,
            project_id: project_id.clone(),
            action,
            recorded_at: Utc::now(),
        });
    }
}

/// In-memory [`AgentRepository`].
#[derive(Default)]
pub struct MemoryAgentRepository {
    tables: RwLock<Tables>,
}

impl MemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(poisoned)
    }

    /// Insert or replace a node directly.
    pub fn put_node(&self, node: Node) -> Result<()> {
        self.write()?.nodes.insert(node.id, node);
        Ok(())
    }

    /// Remove a node row as background cleanup would.
    pub fn remove_node(&self, node_id: NodeId) -> Result<()> {
        self.write()?.nodes.remove(&node_id);
        Ok(())
    }
}

#[async_trait]
impl AgentRepository for MemoryAgentRepository {
    async fn insert(&self, agent: &Agent) -> Result<()> {
        self.write()?.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get(&self, project_id: &ProjectId, agent_id: AgentId) -> Result<Option<Agent>> {
        Ok(self
            .read()?
            .agents
            .get(&agent_id)
            .filter(|a| &a.project_id == project_id)
            .cloned())
    }

    async fn get_by_node(&self, project_id: &ProjectId, node_id: NodeId) -> Result<Option<Agent>> {
        Ok(self
            .read()?
            .agents
            .values()
            .find(|a| &a.project_id == project_id && a.node_id == Some(node_id))
            .cloned())
    }

    async fn find_unimported(
        &self,
        project_id: &ProjectId,
        user: &str,
        os: Os,
    ) -> Result<Option<Agent>> {
        Ok(self
            .read()?
            .agents
            .values()
            .filter(|a| {
                &a.project_id == project_id
                    && a.created_user == user
                    && a.os == os
                    && a.node_id.is_none()
                    && matches!(a.status, AgentStatus::UnImport | AgentStatus::UnImportOk)
            })
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn get_node(&self, project_id: &ProjectId, node_id: NodeId) -> Result<Option<Node>> {
        Ok(self
            .read()?
            .nodes
            .get(&node_id)
            .filter(|n| &n.project_id == project_id)
            .cloned())
    }

    async fn update(&self, agent: &Agent) -> Result<()> {
        let mut t = self.write()?;
        let Some(existing) = t.agents.get_mut(&agent.id) else {
            return Err(Error::AgentNotFound(agent.id.to_string()));
        };
        *existing = Agent {
            updated_at: Utc::now(),
            ..agent.clone()
        };
        Ok(())
    }

    async fn commit_heartbeat(&self, commit: &HeartbeatCommit) -> Result<bool> {
        let mut t = self.write()?;
        let Some(agent) = t.agents.get_mut(&commit.agent_id) else {
            return Ok(false);
        };
        if agent.status != commit.expected_status {
            return Ok(false);
        }
        commit.fields.apply_to(agent);
        if let Some(status) = commit.status {
            agent.status = status;
        }
        agent.updated_at = Utc::now();

        if let Some(action) = commit.action {
            t.record_action(&commit.project_id, commit.agent_id, action);
        }
        if let Some(update) = &commit.node
            && let Some(node) = t.nodes.get_mut(&update.node_id)
        {
            node.status = update.status;
            node.ip = update.ip.clone();
        }
        Ok(true)
    }

    async fn import(&self, project_id: &ProjectId, agent_id: AgentId, node: &Node) -> Result<Node> {
        let mut t = self.write()?;
        if !t.agents.contains_key(&agent_id) {
            return Err(Error::AgentNotFound(agent_id.to_string()));
        }
        let seq = t
            .nodes
            .values()
            .filter(|n| &n.project_id == project_id)
            .count()
            + 1;
        let stored = Node {
            node_string_id: format!("{}_{seq}", node.node_string_id),
            ..node.clone()
        };
        t.nodes.insert(stored.id, stored.clone());
        if let Some(agent) = t.agents.get_mut(&agent_id) {
            agent.node_id = Some(stored.id);
            agent.status = AgentStatus::ImportOk;
            agent.updated_at = Utc::now();
        }
        Ok(stored)
    }

    async fn mark_deleted(&self, project_id: &ProjectId, node_id: NodeId) -> Result<Option<Agent>> {
        let mut t = self.write()?;
        let Some(agent) = t
            .agents
            .values_mut()
            .find(|a| &a.project_id == project_id && a.node_id == Some(node_id))
        else {
            return Ok(None);
        };
        let before = agent.clone();
        agent.status = AgentStatus::Delete;
        agent.node_id = None;
        agent.updated_at = Utc::now();
        if let Some(node) = t.nodes.get_mut(&node_id) {
            node.status = NodeStatus::Deleted;
        }
        Ok(Some(before))
    }

    async fn list_actions(
        &self,
        project_id: &ProjectId,
        agent_id: AgentId,
    ) -> Result<Vec<AgentActionRecord>> {
        Ok(self
            .read()?
            .actions
            .iter()
            .filter(|a| &a.project_id == project_id && a.agent_id == agent_id)
            .cloned()
            .collect())
    }
}

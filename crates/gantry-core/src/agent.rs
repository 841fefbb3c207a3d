//! Third-party build agents and the nodes they back.

use crate::ids::{AgentId, NodeId, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub project_id: ProjectId,
    pub node_id: Option<NodeId>,
    pub status: AgentStatus,
    pub os: Os,
    /// AES-GCM encrypted, base64 encoded.
    pub secret_key: String,
    pub ip: String,
    /// Host the agent last started from. Once imported, the agent may only
    /// start again from this host.
    pub start_remote_ip: Option<String>,
    pub hostname: String,
    pub master_version: Option<String>,
    pub version: Option<String>,
    pub parallel_task_count: Option<u32>,
    pub install_path: Option<String>,
    pub started_user: Option<String>,
    pub gateway: Option<String>,
    pub file_gateway: Option<String>,
    pub envs: Vec<EnvVar>,
    pub created_user: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Os {
    Linux,
    Macos,
    Windows,
}

impl Os {
    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Macos => "macos",
            Os::Windows => "windows",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "linux" => Some(Os::Linux),
            "macos" => Some(Os::Macos),
            "windows" => Some(Os::Windows),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    UnImport,
    UnImportOk,
    ImportOk,
    ImportException,
    Delete,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::UnImport => "UN_IMPORT",
            AgentStatus::UnImportOk => "UN_IMPORT_OK",
            AgentStatus::ImportOk => "IMPORT_OK",
            AgentStatus::ImportException => "IMPORT_EXCEPTION",
            AgentStatus::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UN_IMPORT" => Some(AgentStatus::UnImport),
            "UN_IMPORT_OK" => Some(AgentStatus::UnImportOk),
            "IMPORT_OK" => Some(AgentStatus::ImportOk),
            "IMPORT_EXCEPTION" => Some(AgentStatus::ImportException),
            "DELETE" => Some(AgentStatus::Delete),
            _ => None,
        }
    }

    /// Whether an operator may import the agent as a node.
    pub fn is_importable(&self) -> bool {
        matches!(self, AgentStatus::UnImportOk | AgentStatus::ImportOk)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub secure: bool,
}

/// The build-resource entry that permission checks are made against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub project_id: ProjectId,
    /// Human-facing id such as `BUILD_1a2b3c4d_3`.
    pub node_string_id: String,
    pub display_name: String,
    pub ip: String,
    pub os: Os,
    pub status: NodeStatus,
    pub created_user: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Normal,
    Abnormal,
    Deleted,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Normal => "NORMAL",
            NodeStatus::Abnormal => "ABNORMAL",
            NodeStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NORMAL" => Some(NodeStatus::Normal),
            "ABNORMAL" => Some(NodeStatus::Abnormal),
            "DELETED" => Some(NodeStatus::Deleted),
            _ => None,
        }
    }
}

/// Lifecycle actions kept as an audit trail per agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentAction {
    Online,
    Offline,
}

impl AgentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentAction::Online => "ONLINE",
            AgentAction::Offline => "OFFLINE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentActionRecord {
    pub agent_id: AgentId,
    pub project_id: ProjectId,
    pub action: AgentAction,
    pub recorded_at: DateTime<Utc>,
}

/// Descriptive fields reported by an agent on every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatInfo {
    pub master_version: Option<String>,
    pub version: Option<String>,
    pub agent_ip: Option<String>,
    pub hostname: Option<String>,
    pub parallel_task_count: Option<u32>,
    pub install_path: Option<String>,
    pub started_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub master_version: String,
    pub worker_version: String,
    pub agent_status: AgentStatus,
    /// `-1` when the agent must stop taking work.
    pub parallel_task_count: i64,
    pub envs: HashMap<String, String>,
    pub gateway: Option<String>,
    pub file_gateway: Option<String>,
}

/// Field changes detected on a heartbeat, written only when non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentFieldUpdate {
    pub master_version: Option<String>,
    pub version: Option<String>,
    pub ip: Option<String>,
    pub start_remote_ip: Option<String>,
    pub hostname: Option<String>,
    pub parallel_task_count: Option<u32>,
    pub install_path: Option<String>,
    pub started_user: Option<String>,
}

impl AgentFieldUpdate {
    pub fn is_empty(&self) -> bool {
        *self == AgentFieldUpdate::default()
    }

    pub fn apply_to(&self, agent: &mut Agent) {
        if let Some(v) = &self.master_version {
            agent.master_version = Some(v.clone());
        }
        if let Some(v) = &self.version {
            agent.version = Some(v.clone());
        }
        if let Some(v) = &self.ip {
            agent.ip = v.clone();
        }
        if let Some(v) = &self.start_remote_ip {
            agent.start_remote_ip = Some(v.clone());
        }
        if let Some(v) = &self.hostname {
            agent.hostname = v.clone();
        }
        if let Some(v) = self.parallel_task_count {
            agent.parallel_task_count = Some(v);
        }
        if let Some(v) = &self.install_path {
            agent.install_path = Some(v.clone());
        }
        if let Some(v) = &self.started_user {
            agent.started_user = Some(v.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUpdate {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub ip: String,
}

/// One heartbeat's durable writes, committed in a single transaction.
///
/// `expected_status` makes the commit conditional on the agent row still
/// holding the status the transition was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatCommit {
    pub project_id: ProjectId,
    pub agent_id: AgentId,
    pub expected_status: AgentStatus,
    pub fields: AgentFieldUpdate,
    pub status: Option<AgentStatus>,
    pub action: Option<AgentAction>,
    pub node: Option<NodeUpdate>,
}

impl HeartbeatCommit {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.status.is_none() && self.action.is_none() && self.node.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            AgentStatus::UnImport,
            AgentStatus::UnImportOk,
            AgentStatus::ImportOk,
            AgentStatus::ImportException,
            AgentStatus::Delete,
        ] {
            assert_eq!(AgentStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_importable_states() {
        assert!(AgentStatus::UnImportOk.is_importable());
        assert!(!AgentStatus::UnImport.is_importable());
        assert!(!AgentStatus::ImportException.is_importable());
    }

    #[test]
    fn test_field_update_empty() {
        assert!(AgentFieldUpdate::default().is_empty());
        let update = AgentFieldUpdate {
            ip: Some("10.0.0.2".into()),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}

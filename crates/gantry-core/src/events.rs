//! Events published on the event bus.

use crate::ids::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Asks the scheduler to re-admit a job.
    ContainerRefresh(ContainerRefreshPayload),
    /// A line for the build log viewer.
    BuildLog(BuildLogPayload),
    /// Node list of a project changed; live viewers should reload.
    NodeChanged(NodeChangedPayload),
}

impl Event {
    /// Returns the NATS subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::ContainerRefresh(p) => {
                format!("build.{}.container.{}.refresh", p.build_id, p.container_id)
            }
            Event::BuildLog(p) => format!("build.{}.log", p.build_id),
            Event::NodeChanged(p) => format!("project.{}.nodes.changed", p.project_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerAction {
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRefreshPayload {
    pub source: String,
    pub project_id: ProjectId,
    pub pipeline_id: PipelineId,
    pub build_id: BuildId,
    pub stage_id: StageId,
    pub container_id: ContainerId,
    pub user_id: String,
    pub execute_count: u32,
    pub action: ContainerAction,
    pub emitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogColor {
    Plain,
    Yellow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLogPayload {
    pub build_id: BuildId,
    pub container_id: Option<ContainerId>,
    pub task_id: Option<TaskId>,
    pub execute_count: u32,
    pub color: LogColor,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeChangedPayload {
    pub project_id: ProjectId,
    pub user_id: String,
    pub node_id: Option<NodeId>,
    pub emitted_at: DateTime<Utc>,
}

//! Containerized executors: job containers and debug builders.

use crate::ids::{BuildId, PipelineId, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Maximum ephemeral job containers a single build may create per selector.
pub const MAX_JOBS_PER_BUILD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchType {
    Kubernetes,
    Bcs,
}

impl DispatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchType::Kubernetes => "kubernetes",
            DispatchType::Bcs => "bcs",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "kubernetes" => Some(DispatchType::Kubernetes),
            "bcs" => Some(DispatchType::Bcs),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live status of a builder as reported by the executor platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderDebugStatus {
    /// Shut down and able to be started again.
    CanRestart,
    Running,
    Starting,
    Stopping,
    Deleting,
    Failed(String),
}

impl BuilderDebugStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BuilderDebugStatus::CanRestart => "can_restart",
            BuilderDebugStatus::Running => "running",
            BuilderDebugStatus::Starting => "starting",
            BuilderDebugStatus::Stopping => "stopping",
            BuilderDebugStatus::Deleting => "deleting",
            BuilderDebugStatus::Failed(_) => "failed",
        }
    }
}

/// Which builder served a job slot of a given build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildHistory {
    pub dispatch_type: DispatchType,
    pub project_id: ProjectId,
    pub pipeline_id: PipelineId,
    pub build_id: BuildId,
    pub vm_seq_id: String,
    pub container_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderStatus {
    Idle,
    Busy,
}

impl BuilderStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            BuilderStatus::Idle => 0,
            BuilderStatus::Busy => 1,
        }
    }

    pub fn from_i16(v: i16) -> Self {
        if v == 0 {
            BuilderStatus::Idle
        } else {
            BuilderStatus::Busy
        }
    }
}

/// Persisted state of a reusable builder in the pool of a job slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderState {
    pub dispatch_type: DispatchType,
    pub project_id: ProjectId,
    pub pipeline_id: PipelineId,
    pub vm_seq_id: String,
    pub pool_no: u32,
    pub builder_name: String,
    pub status: BuilderStatus,
    pub debug_status: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BuilderOperation {
    StartSleep { env: HashMap<String, String> },
    Stop,
    Delete,
}

impl BuilderOperation {
    pub fn name(&self) -> &'static str {
        match self {
            BuilderOperation::StartSleep { .. } => "start_sleep",
            BuilderOperation::Stop => "stop",
            BuilderOperation::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformTaskStatus {
    Waiting,
    Running,
    Succeeded,
    Failed,
    Timeout,
}

impl PlatformTaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            PlatformTaskStatus::Succeeded | PlatformTaskStatus::Failed | PlatformTaskStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformTaskResult {
    pub status: PlatformTaskStatus,
    pub message: Option<String>,
}

/// Request for one ephemeral job container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub project_id: ProjectId,
    pub build_id: BuildId,
    pub pod_name_selector: String,
    pub job_name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub active_deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTask {
    pub job_name: String,
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugSession {
    pub websocket_url: String,
    pub container_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopDebugOutcome {
    Stopped,
    /// The stop failed and the builder was deleted instead.
    Deleted,
    /// The builder is busy or was not in debug; only the flag was cleared.
    NotInDebug,
    NotFound,
}

//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external adapters.

use crate::agent::{Agent, AgentActionRecord, HeartbeatCommit, Node, Os};
use crate::build::{BuildContainer, BuildGraph};
use crate::dispatch::{
    BuildHistory, BuilderDebugStatus, BuilderOperation, BuilderState, DispatchType, JobRequest,
    JobTask, PlatformTaskResult,
};
use crate::events::Event;
use crate::expression::ExpressionError;
use crate::ids::*;
use crate::record::{
    ContainerRecord, ContainerStatusUpdate, RetryPlan, StageStatusUpdate, TaskRecord,
    TaskStatusUpdate, TaskUpdateOutcome,
};
use crate::task::BuildTask;
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event. Delivery is at-least-once.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `build.*.log`, `project.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Evaluates custom-condition expressions against a variable map.
pub trait ExpressionEngine: Send + Sync {
    /// Empty or malformed input is an error, never `false`.
    fn evaluate(
        &self,
        expression: &str,
        variables: &HashMap<String, String>,
    ) -> std::result::Result<bool, ExpressionError>;
}

/// Durable build state: live tasks, containers and per-attempt records.
///
/// Every mutating call is atomic with respect to other mutations of the
/// same build.
#[async_trait]
pub trait BuildRecordRepository: Send + Sync {
    /// Store a freshly triggered build.
    async fn save_build(&self, graph: &BuildGraph) -> Result<()>;

    /// Build-level variables used for template expansion.
    async fn build_variables(&self, build_id: BuildId) -> Result<HashMap<String, String>>;

    async fn get_task(&self, build_id: BuildId, task_id: &TaskId) -> Result<Option<BuildTask>>;

    async fn get_task_by_step(&self, build_id: BuildId, step_id: &str) -> Result<Option<BuildTask>>;

    /// Tasks of one container ordered by `task_seq`.
    async fn list_container_tasks(
        &self,
        build_id: BuildId,
        container_id: &ContainerId,
    ) -> Result<Vec<BuildTask>>;

    async fn get_container(
        &self,
        build_id: BuildId,
        container_id: &ContainerId,
    ) -> Result<Option<BuildContainer>>;

    async fn get_task_record(
        &self,
        build_id: BuildId,
        task_id: &TaskId,
        execute_count: u32,
    ) -> Result<Option<TaskRecord>>;

    /// Records of one task across all attempts, oldest first.
    async fn list_task_records(&self, build_id: BuildId, task_id: &TaskId) -> Result<Vec<TaskRecord>>;

    async fn get_container_record(
        &self,
        build_id: BuildId,
        container_id: &ContainerId,
        execute_count: u32,
    ) -> Result<Option<ContainerRecord>>;

    /// Apply a task status update and, on cancellation, mark the tasks that
    /// can no longer run as UNEXEC. The live task follows the record when
    /// the update targets its current attempt.
    async fn update_task_status(&self, update: &TaskStatusUpdate) -> Result<TaskUpdateOutcome>;

    /// Returns `false` when no row matched or the change was a regression.
    async fn update_container_status(&self, update: &ContainerStatusUpdate) -> Result<bool>;

    /// Returns `false` when no row matched or the change was a regression.
    async fn update_stage_status(&self, update: &StageStatusUpdate) -> Result<bool>;

    /// Write every reset of a task retry in one transaction.
    async fn apply_retry(&self, plan: &RetryPlan) -> Result<()>;
}

/// Agents, the nodes they back, and their action history.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn insert(&self, agent: &Agent) -> Result<()>;

    async fn get(&self, project_id: &ProjectId, agent_id: AgentId) -> Result<Option<Agent>>;

    async fn get_by_node(&self, project_id: &ProjectId, node_id: NodeId) -> Result<Option<Agent>>;

    /// An agent created by `user` for `os` that was never imported.
    async fn find_unimported(
        &self,
        project_id: &ProjectId,
        user: &str,
        os: Os,
    ) -> Result<Option<Agent>>;

    async fn get_node(&self, project_id: &ProjectId, node_id: NodeId) -> Result<Option<Node>>;

    /// Overwrite the mutable fields of an agent.
    async fn update(&self, agent: &Agent) -> Result<()>;

    /// Commit one heartbeat. Returns `false` without writing when the agent
    /// status no longer equals `commit.expected_status`.
    async fn commit_heartbeat(&self, commit: &HeartbeatCommit) -> Result<bool>;

    /// Create the node for `agent_id` and mark the agent IMPORT_OK, in one
    /// transaction. The node string id suffix is allocated inside it.
    async fn import(&self, project_id: &ProjectId, agent_id: AgentId, node: &Node) -> Result<Node>;

    /// Mark the agent DELETE, unlink it and mark its node DELETED, in one
    /// transaction. Returns the agent as it was before deletion.
    async fn mark_deleted(&self, project_id: &ProjectId, node_id: NodeId) -> Result<Option<Agent>>;

    async fn list_actions(
        &self,
        project_id: &ProjectId,
        agent_id: AgentId,
    ) -> Result<Vec<AgentActionRecord>>;
}

/// Builder pools and build history of the container dispatchers.
#[async_trait]
pub trait DispatchBuildRepository: Send + Sync {
    async fn record_history(&self, history: &BuildHistory) -> Result<()>;

    async fn history_for_build(
        &self,
        dispatch_type: DispatchType,
        build_id: BuildId,
        vm_seq_id: &str,
    ) -> Result<Option<BuildHistory>>;

    async fn latest_history(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
    ) -> Result<Option<BuildHistory>>;

    async fn save_builder(&self, builder: &BuilderState) -> Result<()>;

    async fn get_builder(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        builder_name: &str,
    ) -> Result<Option<BuilderState>>;

    /// The builder of a job slot currently flagged as in debug.
    async fn find_debugging_builder(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
    ) -> Result<Option<BuilderState>>;

    async fn set_debug_status(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        builder_name: &str,
        debug: bool,
    ) -> Result<()>;

    /// Clear a builder's debug flag and return the state it had before,
    /// read and written in one transaction.
    async fn clear_debug_status(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        builder_name: &str,
    ) -> Result<Option<BuilderState>>;

    async fn delete_builder(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        pool_no: u32,
    ) -> Result<()>;
}

/// Low-latency shared key/value store. Expiry is per key.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Atomically increment and return the new value. A new counter starts
    /// at 1 and expires after `ttl`.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Store `value` only when the key is absent or expired.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Remove the key only when it still holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResource {
    Project,
    Pipeline(PipelineId),
    Node(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    /// Elevated operator permission on a project.
    ApiOperate,
    Create,
    Edit,
    Delete,
}

#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn check_permission(
        &self,
        user: &str,
        project_id: &ProjectId,
        resource: &AuthResource,
        action: AuthAction,
    ) -> Result<bool>;

    /// Register a new node so that permissions can be granted on it.
    async fn grant_node(&self, user: &str, project_id: &ProjectId, node: &Node) -> Result<()>;

    async fn revoke_node(&self, project_id: &ProjectId, node_id: NodeId) -> Result<()>;
}

/// Container orchestrator behind one dispatch type.
#[async_trait]
pub trait ExecutorPlatform: Send + Sync {
    async fn create_job(&self, user: &str, request: &JobRequest) -> Result<JobTask>;

    async fn job_status(&self, user: &str, job_name: &str) -> Result<PlatformTaskResult>;

    async fn debug_status(&self, user: &str, builder: &str) -> Result<BuilderDebugStatus>;

    /// Start an operation; returns the platform task id to wait on.
    async fn operate_builder(
        &self,
        user: &str,
        builder: &str,
        operation: &BuilderOperation,
    ) -> Result<String>;

    async fn task_status(&self, user: &str, task_id: &str) -> Result<PlatformTaskResult>;

    /// Environment handed to a builder started for debugging.
    fn worker_env(&self) -> String;

    fn websocket_url(
        &self,
        project_id: &ProjectId,
        pipeline_id: &PipelineId,
        user: &str,
        builder: &str,
    ) -> String;
}

/// The agent distribution currently offered for self-upgrade.
#[async_trait]
pub trait AgentPackageSource: Send + Sync {
    async fn agent_version(&self) -> Result<String>;

    async fn worker_version(&self) -> Result<String>;

    /// Content digest of the distributable for `os`.
    async fn package_digest(&self, os: Os) -> Result<String>;
}

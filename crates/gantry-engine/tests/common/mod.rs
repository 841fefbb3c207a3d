//! Fakes for the engine's outbound ports.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use gantry_core::agent::{Node, Os};
use gantry_core::build::{Build, BuildContainer, BuildGraph, BuildStage, JobControlOptions, StageControlOptions};
use gantry_core::dispatch::{
    BuilderDebugStatus, BuilderOperation, JobRequest, JobTask, PlatformTaskResult, PlatformTaskStatus,
};
use gantry_core::events::Event;
use gantry_core::ids::*;
use gantry_core::ports::{
    AgentPackageSource, AuthAction, AuthResource, EventBus, EventStream, ExecutorPlatform,
    PermissionService,
};
use gantry_core::task::{infra, BuildTask, TaskKind, TaskOptions};
use gantry_core::{BuildStatus, Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const CONTAINER: &str = "c-1";

/// Route engine logs to the test harness (once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,gantry_engine=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn task(build_id: BuildId, id: &str, name: &str, seq: u32) -> BuildTask {
    BuildTask {
        project_id: ProjectId::new("proj"),
        pipeline_id: PipelineId::new("p-1"),
        build_id,
        stage_id: StageId::new("s-1"),
        container_id: ContainerId::new(CONTAINER),
        task_id: TaskId::new(id),
        step_id: None,
        task_name: name.to_string(),
        task_seq: seq,
        kind: TaskKind::Normal,
        status: BuildStatus::Queue,
        execute_count: 1,
        options: TaskOptions::default(),
        post_info: None,
        start_time: None,
        end_time: None,
    }
}

/// One stage, one job: prepare VM, three user tasks, clean VM, wait.
pub fn simple_graph(tasks_of: impl FnOnce(BuildId) -> Vec<BuildTask>) -> BuildGraph {
    let build_id = BuildId::new();
    BuildGraph {
        build: Build {
            project_id: ProjectId::new("proj"),
            pipeline_id: PipelineId::new("p-1"),
            build_id,
            execute_count: 1,
            status: BuildStatus::Running,
            variables: HashMap::from([
                ("approver".to_string(), "alice".to_string()),
                ("branch".to_string(), "main".to_string()),
            ]),
            start_time: Some(Utc::now()),
            end_time: None,
        },
        stages: vec![BuildStage {
            build_id,
            stage_id: StageId::new("s-1"),
            seq: 1,
            status: BuildStatus::Running,
            execute_count: 1,
            options: StageControlOptions::default(),
            start_time: None,
            end_time: None,
        }],
        containers: vec![BuildContainer {
            build_id,
            stage_id: StageId::new("s-1"),
            container_id: ContainerId::new(CONTAINER),
            seq: 1,
            status: BuildStatus::Running,
            execute_count: 1,
            contains_post_tasks: false,
            options: JobControlOptions::default(),
            start_time: None,
            end_time: None,
        }],
        tasks: tasks_of(build_id),
    }
}

pub fn default_tasks(build_id: BuildId) -> Vec<BuildTask> {
    vec![
        task(build_id, &format!("{}1", infra::START_VM_ID_PREFIX), &format!("{}1", infra::PREPARE_VM_NAME_PREFIX), 1),
        task(build_id, "t-1", "compile", 2),
        task(build_id, "t-2", "test", 3),
        task(build_id, "t-3", "package", 4),
        task(build_id, &format!("{}1", infra::STOP_VM_ID_PREFIX), &format!("{}1", infra::CLEAN_VM_NAME_PREFIX), 5),
        task(build_id, &format!("{}1", infra::END_ID_PREFIX), &format!("{}1", infra::WAIT_NAME_PREFIX), 6),
    ]
}

/// Grants everything or nothing, and remembers node registrations.
#[derive(Default)]
pub struct FakePermissions {
    pub deny: bool,
    pub fail: bool,
    pub checks: Mutex<Vec<(String, AuthResource, AuthAction)>>,
    pub granted: Mutex<Vec<NodeId>>,
    pub revoked: Mutex<Vec<NodeId>>,
}

impl FakePermissions {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn deny_all() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl PermissionService for FakePermissions {
    async fn check_permission(
        &self,
        user: &str,
        _project_id: &ProjectId,
        resource: &AuthResource,
        action: AuthAction,
    ) -> Result<bool> {
        if self.fail {
            return Err(Error::Platform("auth service down".to_string()));
        }
        self.checks
            .lock()
            .unwrap()
            .push((user.to_string(), resource.clone(), action));
        Ok(!self.deny)
    }

    async fn grant_node(&self, _user: &str, _project_id: &ProjectId, node: &Node) -> Result<()> {
        self.granted.lock().unwrap().push(node.id);
        Ok(())
    }

    async fn revoke_node(&self, _project_id: &ProjectId, node_id: NodeId) -> Result<()> {
        self.revoked.lock().unwrap().push(node_id);
        Ok(())
    }
}

/// Keeps every published event.
#[derive(Default)]
pub struct RecordingBus {
    pub events: Mutex<Vec<Event>>,
    pub fail: bool,
}

impl RecordingBus {
    pub fn published(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn publish(&self, event: Event) -> Result<()> {
        if self.fail {
            return Err(Error::EventBus("bus down".to_string()));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn subscribe(&self, _pattern: &str) -> Result<EventStream> {
        Ok(Box::pin(futures::stream::empty()))
    }
}

/// Scripted executor platform.
///
/// `debug_statuses` is consumed one entry per status query; the last entry
/// repeats. Operation results are looked up by operation name.
pub struct FakePlatform {
    pub debug_statuses: Mutex<VecDeque<BuilderDebugStatus>>,
    pub operation_results: Mutex<HashMap<&'static str, PlatformTaskResult>>,
    pub operations: Mutex<Vec<(String, &'static str)>>,
    pub jobs: Mutex<Vec<String>>,
}

impl FakePlatform {
    pub fn new(statuses: Vec<BuilderDebugStatus>) -> Self {
        Self {
            debug_statuses: Mutex::new(statuses.into()),
            operation_results: Mutex::new(HashMap::new()),
            operations: Mutex::new(Vec::new()),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_result(self, operation: &'static str, status: PlatformTaskStatus, message: Option<&str>) -> Self {
        self.operation_results.lock().unwrap().insert(
            operation,
            PlatformTaskResult {
                status,
                message: message.map(str::to_string),
            },
        );
        self
    }

    pub fn operation_names(&self) -> Vec<&'static str> {
        self.operations.lock().unwrap().iter().map(|(_, op)| *op).collect()
    }
}

#[async_trait]
impl ExecutorPlatform for FakePlatform {
    async fn create_job(&self, _user: &str, request: &JobRequest) -> Result<JobTask> {
        self.jobs.lock().unwrap().push(request.job_name.clone());
        Ok(JobTask {
            job_name: request.job_name.clone(),
            task_id: format!("task-{}", request.job_name),
        })
    }

    async fn job_status(&self, _user: &str, _job_name: &str) -> Result<PlatformTaskResult> {
        Ok(PlatformTaskResult {
            status: PlatformTaskStatus::Running,
            message: None,
        })
    }

    async fn debug_status(&self, _user: &str, _builder: &str) -> Result<BuilderDebugStatus> {
        let mut statuses = self.debug_statuses.lock().unwrap();
        if statuses.len() > 1 {
            Ok(statuses.pop_front().unwrap())
        } else {
            statuses
                .front()
                .cloned()
                .ok_or_else(|| Error::Platform("no status scripted".to_string()))
        }
    }

    async fn operate_builder(&self, _user: &str, builder: &str, operation: &BuilderOperation) -> Result<String> {
        self.operations
            .lock()
            .unwrap()
            .push((builder.to_string(), operation.name()));
        Ok(operation.name().to_string())
    }

    async fn task_status(&self, _user: &str, task_id: &str) -> Result<PlatformTaskResult> {
        Ok(self
            .operation_results
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or(PlatformTaskResult {
                status: PlatformTaskStatus::Succeeded,
                message: None,
            }))
    }

    fn worker_env(&self) -> String {
        "prod".to_string()
    }

    fn websocket_url(&self, project_id: &ProjectId, pipeline_id: &PipelineId, user: &str, builder: &str) -> String {
        format!("wss://console.example/{project_id}/{pipeline_id}/{builder}?user={user}")
    }
}

pub struct FakePackages {
    pub digest: String,
}

#[async_trait]
impl AgentPackageSource for FakePackages {
    async fn agent_version(&self) -> Result<String> {
        Ok("v2.0.0".to_string())
    }

    async fn worker_version(&self) -> Result<String> {
        Ok("w1.4.0".to_string())
    }

    async fn package_digest(&self, _os: Os) -> Result<String> {
        Ok(self.digest.clone())
    }
}

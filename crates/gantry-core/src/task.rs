//! Task definitions, run conditions and live task state.

use crate::ids::*;
use crate::status::BuildStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lower bound for the configured automatic retry count.
pub const TASK_RETRY_MIN_COUNT: u32 = 1;
/// Upper bound for the configured automatic retry count.
pub const TASK_RETRY_MAX_COUNT: u32 = 5;

/// Behavioural kind of a task, resolved when the pipeline model is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Normal,
    /// Waits for one of the listed users to approve. Entries may contain
    /// `${var}` templates and comma-separated lists.
    ManualReview { review_users: Vec<String> },
    QualityGate { position: GatePosition },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePosition {
    In,
    Out,
}

impl TaskKind {
    /// Whether starting this task enters REVIEWING instead of RUNNING.
    pub fn requires_review(&self) -> bool {
        !matches!(self, TaskKind::Normal)
    }

    /// The status a task of this kind enters when it starts.
    pub fn start_status(&self) -> BuildStatus {
        if self.requires_review() {
            BuildStatus::Reviewing
        } else {
            BuildStatus::Running
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunCondition {
    #[default]
    PreTaskSuccess,
    OnlyIfPriorFailed,
    RunEvenIfFailedUnlessCancelled,
    RunEvenIfFailedOrCancelled,
    /// Run only when every custom variable matches.
    CustomVariableMatch,
    /// Skip when every custom variable matches.
    CustomVariableMatchNotRun,
    CustomConditionMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameAndValue {
    pub key: String,
    pub value: String,
}

impl NameAndValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Per-task control options configured on the pipeline model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    pub enable: bool,
    pub continue_when_failed: bool,
    pub manual_skip: bool,
    pub manual_retry: bool,
    pub retry_when_failed: bool,
    pub retry_count: u32,
    pub run_condition: TaskRunCondition,
    pub custom_variables: Vec<NameAndValue>,
    pub custom_condition: Option<String>,
    pub pause_before_exec: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            enable: true,
            continue_when_failed: false,
            manual_skip: false,
            manual_retry: true,
            retry_when_failed: false,
            retry_count: 0,
            run_condition: TaskRunCondition::default(),
            custom_variables: Vec::new(),
            custom_condition: None,
            pause_before_exec: false,
        }
    }
}

/// Links an always-run post task to the task that registered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostTaskInfo {
    pub parent_task_id: TaskId,
    pub parent_element_job_index: u32,
}

impl PostTaskInfo {
    /// Sequence number of the parent inside the container. Job indexes are
    /// zero-based and the start-VM task occupies sequence 1.
    pub fn parent_task_seq(&self) -> u32 {
        self.parent_element_job_index + 2
    }
}

/// Executor bracketing tasks inserted around the user tasks of a container.
pub mod infra {
    pub const START_VM_ID_PREFIX: &str = "startVM-";
    pub const STOP_VM_ID_PREFIX: &str = "stopVM-";
    pub const END_ID_PREFIX: &str = "end-";
    pub const PREPARE_VM_NAME_PREFIX: &str = "Prepare_Job#";
    pub const CLEAN_VM_NAME_PREFIX: &str = "Clean_Job#";
    pub const WAIT_NAME_PREFIX: &str = "Wait_Finish_Job#";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfraRole {
    PrepareVm,
    CleanVm,
    Wait,
}

/// Live execution state of one task inside a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTask {
    pub project_id: ProjectId,
    pub pipeline_id: PipelineId,
    pub build_id: BuildId,
    pub stage_id: StageId,
    pub container_id: ContainerId,
    pub task_id: TaskId,
    pub step_id: Option<String>,
    pub task_name: String,
    pub task_seq: u32,
    pub kind: TaskKind,
    pub status: BuildStatus,
    pub execute_count: u32,
    pub options: TaskOptions,
    pub post_info: Option<PostTaskInfo>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl BuildTask {
    pub fn is_post_task(&self) -> bool {
        self.post_info.is_some()
    }

    /// Identifies executor bracketing tasks by their name and id prefixes.
    pub fn infra_role(&self) -> Option<InfraRole> {
        let id = self.task_id.as_str();
        let name = self.task_name.as_str();
        if name.starts_with(infra::CLEAN_VM_NAME_PREFIX) && id.starts_with(infra::STOP_VM_ID_PREFIX)
        {
            Some(InfraRole::CleanVm)
        } else if name.starts_with(infra::PREPARE_VM_NAME_PREFIX)
            && id.starts_with(infra::START_VM_ID_PREFIX)
        {
            Some(InfraRole::PrepareVm)
        } else if name.starts_with(infra::WAIT_NAME_PREFIX) && id.starts_with(infra::END_ID_PREFIX)
        {
            Some(InfraRole::Wait)
        } else {
            None
        }
    }

    pub fn is_stop_vm(&self) -> bool {
        self.task_id.as_str().starts_with(infra::STOP_VM_ID_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, name: &str) -> BuildTask {
        BuildTask {
            project_id: "proj".into(),
            pipeline_id: "p-1".into(),
            build_id: BuildId::new(),
            stage_id: "stage-1".into(),
            container_id: "1".into(),
            task_id: id.into(),
            step_id: None,
            task_name: name.to_string(),
            task_seq: 1,
            kind: TaskKind::Normal,
            status: BuildStatus::Queue,
            execute_count: 1,
            options: TaskOptions::default(),
            post_info: None,
            start_time: None,
            end_time: None,
        }
    }

    #[test]
    fn test_infra_roles_need_both_prefixes() {
        assert_eq!(task("startVM-1", "Prepare_Job#1").infra_role(), Some(InfraRole::PrepareVm));
        assert_eq!(task("stopVM-1", "Clean_Job#1").infra_role(), Some(InfraRole::CleanVm));
        assert_eq!(task("end-1", "Wait_Finish_Job#1").infra_role(), Some(InfraRole::Wait));
        assert_eq!(task("startVM-1", "compile").infra_role(), None);
        assert_eq!(task("e-123", "Prepare_Job#1").infra_role(), None);
    }

    #[test]
    fn test_review_kinds_start_reviewing() {
        assert_eq!(TaskKind::Normal.start_status(), BuildStatus::Running);
        let review = TaskKind::ManualReview { review_users: vec!["alice".into()] };
        assert_eq!(review.start_status(), BuildStatus::Reviewing);
        let gate = TaskKind::QualityGate { position: GatePosition::Out };
        assert_eq!(gate.start_status(), BuildStatus::Reviewing);
    }

    #[test]
    fn test_options_default_enabled() {
        let opts: TaskOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.enable);
        assert_eq!(opts.run_condition, TaskRunCondition::PreTaskSuccess);
    }

    #[test]
    fn test_post_parent_seq() {
        let info = PostTaskInfo {
            parent_task_id: "e-1".into(),
            parent_element_job_index: 0,
        };
        assert_eq!(info.parent_task_seq(), 2);
    }
}

//! Build, stage and container (job) state.

use crate::ids::*;
use crate::status::BuildStatus;
use crate::task::{BuildTask, NameAndValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub project_id: ProjectId,
    pub pipeline_id: PipelineId,
    pub build_id: BuildId,
    pub execute_count: u32,
    pub status: BuildStatus,
    pub variables: HashMap<String, String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobRunCondition {
    #[default]
    StageRunning,
    CustomVariableMatch,
    CustomVariableMatchNotRun,
    CustomConditionMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageRunCondition {
    #[default]
    AfterLastFinished,
    CustomVariableMatch,
    CustomVariableMatchNotRun,
    CustomConditionMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobControlOptions {
    pub enable: bool,
    pub run_condition: JobRunCondition,
    pub custom_variables: Vec<NameAndValue>,
    pub custom_condition: Option<String>,
}

impl Default for JobControlOptions {
    fn default() -> Self {
        Self {
            enable: true,
            run_condition: JobRunCondition::default(),
            custom_variables: Vec::new(),
            custom_condition: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageControlOptions {
    pub enable: bool,
    pub run_condition: StageRunCondition,
    pub custom_variables: Vec<NameAndValue>,
    pub custom_condition: Option<String>,
}

impl Default for StageControlOptions {
    fn default() -> Self {
        Self {
            enable: true,
            run_condition: StageRunCondition::default(),
            custom_variables: Vec::new(),
            custom_condition: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStage {
    pub build_id: BuildId,
    pub stage_id: StageId,
    pub seq: u32,
    pub status: BuildStatus,
    pub execute_count: u32,
    pub options: StageControlOptions,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// A job: the unit of parallel execution hosted on one executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildContainer {
    pub build_id: BuildId,
    pub stage_id: StageId,
    pub container_id: ContainerId,
    pub seq: u32,
    pub status: BuildStatus,
    pub execute_count: u32,
    /// Whether the job registers always-run post tasks.
    pub contains_post_tasks: bool,
    pub options: JobControlOptions,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Everything the scheduler creates when a build is triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildGraph {
    pub build: Build,
    pub stages: Vec<BuildStage>,
    pub containers: Vec<BuildContainer>,
    pub tasks: Vec<BuildTask>,
}

//! Status and timing writes for tasks, jobs and stages.

use chrono::Utc;
use gantry_core::ids::{BuildId, ContainerId, StageId, TaskId};
use gantry_core::interpolation::expand_list;
use gantry_core::ports::BuildRecordRepository;
use gantry_core::record::{
    vars, ContainerStatusUpdate, RecordTimestamp, StageStatusUpdate, TaskStatusInfo,
    TaskStatusUpdate, TaskUpdateOutcome, TimestampType,
};
use gantry_core::task::{BuildTask, TaskKind};
use gantry_core::{BuildStatus, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome details of a finished task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskEnd {
    pub error_type: Option<String>,
    pub error_code: Option<i32>,
    pub error_msg: Option<String>,
    /// Version of the plugin that ran the task.
    pub atom_version: Option<String>,
}

/// The single writer of task, job and stage status.
///
/// Task updates are applied by the repository in one transaction per call.
/// Job and stage updates are separate calls and are never nested inside a
/// task update.
#[derive(Clone)]
pub struct BuildRecordService {
    repo: Arc<dyn BuildRecordRepository>,
}

impl BuildRecordService {
    pub fn new(repo: Arc<dyn BuildRecordRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<dyn BuildRecordRepository> {
        &self.repo
    }

    /// Apply an update and return the sibling tasks it turned UNEXEC or
    /// SKIP. A missing record or a status regression is logged and yields
    /// no impact.
    pub async fn update_task_status(&self, update: TaskStatusUpdate) -> Result<Vec<TaskStatusInfo>> {
        match self.repo.update_task_status(&update).await? {
            TaskUpdateOutcome::Missing => {
                warn!(
                    build_id = %update.build_id,
                    task_id = %update.task_id,
                    execute_count = update.execute_count,
                    "No task record for this attempt, update ignored"
                );
                Ok(Vec::new())
            }
            TaskUpdateOutcome::Rejected(regression) => {
                warn!(
                    build_id = %update.build_id,
                    task_id = %update.task_id,
                    from = %regression.from,
                    to = %regression.to,
                    "Refused to move a finished task back"
                );
                Ok(Vec::new())
            }
            TaskUpdateOutcome::Applied {
                transition,
                impacted,
                ..
            } => {
                debug!(
                    build_id = %update.build_id,
                    task_id = %update.task_id,
                    from = %transition.previous,
                    to = %transition.status,
                    impacted = impacted.len(),
                    "Task status updated"
                );
                Ok(impacted)
            }
        }
    }

    /// Start a task: RUNNING, or REVIEWING for review and gate tasks.
    pub async fn task_start(&self, task: &BuildTask, execute_count: u32) -> Result<BuildStatus> {
        let status = task.kind.start_status();
        let now = Utc::now();
        let mut update = TaskStatusUpdate::new(task.build_id, task.task_id.clone(), execute_count)
            .with_status(status)
            .without_variable(vars::ELAPSED)
            .without_variable(vars::ERROR_TYPE)
            .without_variable(vars::ERROR_CODE)
            .without_variable(vars::ERROR_MSG);

        let record = self
            .repo
            .get_task_record(task.build_id, &task.task_id, execute_count)
            .await?;
        if record.is_some_and(|r| !r.variables.contains_key(vars::START_EPOCH)) {
            update = update.with_variable(vars::START_EPOCH, json!(now.timestamp_millis()));
        }

        if status == BuildStatus::Reviewing {
            update = update.with_timestamp(
                TimestampType::TaskReviewPauseWaiting,
                RecordTimestamp::started(now),
            );
            if let TaskKind::ManualReview { review_users } = &task.kind {
                let variables = self.repo.build_variables(task.build_id).await?;
                let users = expand_list(review_users, &variables);
                update = update.with_variable(vars::REVIEW_USERS, json!(users));
            }
        }

        self.update_task_status(update).await?;
        info!(build_id = %task.build_id, task_id = %task.task_id, status = %status, "Task started");
        Ok(status)
    }

    /// Pause a task before it executes.
    pub async fn task_pause(&self, build_id: BuildId, task_id: &TaskId, execute_count: u32) -> Result<()> {
        let update = TaskStatusUpdate::new(build_id, task_id.clone(), execute_count)
            .with_status(BuildStatus::Pause)
            .with_variable(vars::TASK_PAUSE, Value::Bool(true))
            .with_timestamp(
                TimestampType::TaskReviewPauseWaiting,
                RecordTimestamp::started(Utc::now()),
            );
        self.update_task_status(update).await?;
        Ok(())
    }

    /// Whether this attempt already paused once.
    pub async fn task_already_paused(
        &self,
        build_id: BuildId,
        task_id: &TaskId,
        execute_count: u32,
    ) -> Result<bool> {
        let record = self.repo.get_task_record(build_id, task_id, execute_count).await?;
        Ok(record
            .and_then(|r| r.variables.get(vars::TASK_PAUSE).cloned())
            .is_some_and(|v| v == Value::Bool(true)))
    }

    /// An operator cancelled a paused task.
    pub async fn task_pause_cancel(
        &self,
        build_id: BuildId,
        task_id: &TaskId,
        execute_count: u32,
    ) -> Result<Vec<TaskStatusInfo>> {
        let update = TaskStatusUpdate::new(build_id, task_id.clone(), execute_count)
            .with_status(BuildStatus::Canceled)
            .with_timestamp(
                TimestampType::TaskReviewPauseWaiting,
                RecordTimestamp::ended(Utc::now()),
            );
        self.update_task_status(update).await
    }

    /// An operator resumed a paused task. The job goes back to QUEUE first,
    /// then the task. The pause flag stays so the task does not pause again.
    pub async fn task_pause_continue(&self, task: &BuildTask, execute_count: u32) -> Result<()> {
        self.update_container_status(
            task.build_id,
            &task.container_id,
            execute_count,
            BuildStatus::Queue,
        )
        .await?;
        let update = TaskStatusUpdate::new(task.build_id, task.task_id.clone(), execute_count)
            .with_status(BuildStatus::Queue)
            .with_timestamp(
                TimestampType::TaskReviewPauseWaiting,
                RecordTimestamp::ended(Utc::now()),
            );
        self.update_task_status(update).await?;
        Ok(())
    }

    /// Finish a task.
    ///
    /// RETRY keeps the current status and only closes the attempt's timing.
    pub async fn task_end(
        &self,
        build_id: BuildId,
        task_id: &TaskId,
        execute_count: u32,
        status: BuildStatus,
        end: TaskEnd,
    ) -> Result<Vec<TaskStatusInfo>> {
        let mut update = TaskStatusUpdate::new(build_id, task_id.clone(), execute_count)
            .with_status(status)
            .without_variable(vars::TASK_PAUSE);
        if let Some(error_type) = end.error_type {
            update = update.with_variable(vars::ERROR_TYPE, json!(error_type));
        }
        if let Some(code) = end.error_code {
            update = update.with_variable(vars::ERROR_CODE, json!(code));
        }
        if let Some(msg) = end.error_msg {
            update = update.with_variable(vars::ERROR_MSG, json!(msg));
        }
        if let Some(version) = end.atom_version {
            update = update.with_variable(vars::ATOM_VERSION, json!(version));
        }
        self.update_task_status(update).await
    }

    pub async fn update_container_status(
        &self,
        build_id: BuildId,
        container_id: &ContainerId,
        execute_count: u32,
        status: BuildStatus,
    ) -> Result<bool> {
        let updated = self
            .repo
            .update_container_status(&ContainerStatusUpdate {
                build_id,
                container_id: container_id.clone(),
                execute_count,
                status,
            })
            .await?;
        if !updated {
            warn!(build_id = %build_id, container_id = %container_id, status = %status, "Job status not updated");
        }
        Ok(updated)
    }

    pub async fn update_stage_status(
        &self,
        build_id: BuildId,
        stage_id: &StageId,
        execute_count: u32,
        status: BuildStatus,
    ) -> Result<bool> {
        let updated = self
            .repo
            .update_stage_status(&StageStatusUpdate {
                build_id,
                stage_id: stage_id.clone(),
                execute_count,
                status,
            })
            .await?;
        if !updated {
            warn!(build_id = %build_id, stage_id = %stage_id, status = %status, "Stage status not updated");
        }
        Ok(updated)
    }
}

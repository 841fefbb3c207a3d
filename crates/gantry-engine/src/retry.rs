//! Operator retry and skip of a single failed task.

use crate::lock::ContainerLocks;
use chrono::Utc;
use gantry_core::build::BuildContainer;
use gantry_core::events::{
    BuildLogPayload, ContainerAction, ContainerRefreshPayload, Event, LogColor,
};
use gantry_core::ids::{BuildId, ProjectId, TaskId};
use gantry_core::ports::{
    AuthAction, AuthResource, BuildRecordRepository, EventBus, PermissionService,
};
use gantry_core::record::{ContainerRecord, RetryPlan, TaskRecord, TaskReset};
use gantry_core::task::BuildTask;
use gantry_core::{BuildStatus, Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Source tag carried by refresh events this module emits.
const REFRESH_SOURCE: &str = "task_retry";

/// Why a skip request was or was not honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    /// The task allows operators to skip it.
    ManualSkip,
    /// The user holds API-operate permission on the project.
    ApiOperate,
    /// Neither; the request is handled as a retry.
    Refused,
}

impl SkipDecision {
    pub fn allows_skip(&self) -> bool {
        !matches!(self, SkipDecision::Refused)
    }
}

/// Decide whether `user` may skip `task`. A failing permission lookup
/// counts as no permission.
pub async fn skip_decision(
    permissions: &dyn PermissionService,
    user: &str,
    project_id: &ProjectId,
    task: &BuildTask,
) -> SkipDecision {
    if task.options.manual_skip {
        return SkipDecision::ManualSkip;
    }
    match permissions
        .check_permission(user, project_id, &AuthResource::Project, AuthAction::ApiOperate)
        .await
    {
        Ok(true) => SkipDecision::ApiOperate,
        Ok(false) => SkipDecision::Refused,
        Err(e) => {
            warn!(user, project_id = %project_id, error = %e, "Permission lookup failed, skip refused");
            SkipDecision::Refused
        }
    }
}

/// An operator request to retry or skip one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRequest {
    pub project_id: ProjectId,
    pub build_id: BuildId,
    /// Task id, or the step id alias of the task.
    pub task_id: String,
    /// Attempt the operator is looking at.
    pub execute_count: u32,
    pub skip: bool,
    pub user_id: String,
}

/// What a successful retry wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    pub task_id: TaskId,
    pub execute_count: u32,
    pub skipped: bool,
}

/// Retries or skips one failed task inside a finished job.
pub struct RetryCoordinator {
    repo: Arc<dyn BuildRecordRepository>,
    permissions: Arc<dyn PermissionService>,
    events: Arc<dyn EventBus>,
    locks: ContainerLocks,
}

impl RetryCoordinator {
    pub fn new(
        repo: Arc<dyn BuildRecordRepository>,
        permissions: Arc<dyn PermissionService>,
        events: Arc<dyn EventBus>,
        locks: ContainerLocks,
    ) -> Self {
        Self {
            repo,
            permissions,
            events,
            locks,
        }
    }

    /// Returns `false` when no such task exists.
    pub async fn retry_task(&self, request: &RetryRequest) -> Result<bool> {
        Ok(self.retry(request).await?.is_some())
    }

    /// Like [`Self::retry_task`], reporting what was written.
    pub async fn retry(&self, request: &RetryRequest) -> Result<Option<RetryOutcome>> {
        let Some(task) = self.resolve_task(request).await? else {
            info!(build_id = %request.build_id, task = %request.task_id, "Retry target not found");
            return Ok(None);
        };

        let guard = self.locks.acquire(task.build_id, &task.container_id).await?;
        let reset = self.reset_locked(&task, request).await;
        guard.release().await;
        let (container, task, outcome) = reset?;

        self.events
            .publish(Event::ContainerRefresh(ContainerRefreshPayload {
                source: REFRESH_SOURCE.to_string(),
                project_id: task.project_id.clone(),
                pipeline_id: task.pipeline_id.clone(),
                build_id: task.build_id,
                stage_id: container.stage_id.clone(),
                container_id: container.container_id.clone(),
                user_id: request.user_id.clone(),
                execute_count: outcome.execute_count,
                action: ContainerAction::Refresh,
                emitted_at: Utc::now(),
            }))
            .await?;

        let message = if outcome.skipped {
            format!("{} skip the fail task [{}]", request.user_id, task.task_name)
        } else {
            format!("{} retry fail task [{}]", request.user_id, task.task_name)
        };
        let log = Event::BuildLog(BuildLogPayload {
            build_id: task.build_id,
            container_id: Some(task.container_id.clone()),
            task_id: Some(task.task_id.clone()),
            execute_count: outcome.execute_count,
            color: LogColor::Yellow,
            message,
            emitted_at: Utc::now(),
        });
        if let Err(e) = self.events.publish(log).await {
            warn!(build_id = %task.build_id, error = %e, "Failed to write retry log line");
        }

        info!(
            build_id = %task.build_id,
            task_id = %task.task_id,
            execute_count = outcome.execute_count,
            skipped = outcome.skipped,
            user = %request.user_id,
            "Task retry scheduled"
        );
        Ok(Some(outcome))
    }

    async fn resolve_task(&self, request: &RetryRequest) -> Result<Option<BuildTask>> {
        let by_id = self
            .repo
            .get_task(request.build_id, &TaskId::new(request.task_id.as_str()))
            .await?;
        match by_id {
            Some(task) => Ok(Some(task)),
            None => self.repo.get_task_by_step(request.build_id, &request.task_id).await,
        }
    }

    /// Validates and writes the reset while the container lock is held.
    ///
    /// The task is read again under the lock; the row resolved before it
    /// may already belong to a finished retry.
    async fn reset_locked(
        &self,
        resolved: &BuildTask,
        request: &RetryRequest,
    ) -> Result<(BuildContainer, BuildTask, RetryOutcome)> {
        let task = self
            .repo
            .get_task(resolved.build_id, &resolved.task_id)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!(
                    "task {} of build {} disappeared",
                    resolved.task_id, resolved.build_id
                ))
            })?;
        let container = self
            .repo
            .get_container(task.build_id, &task.container_id)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!(
                    "job {} of build {} not found",
                    task.container_id, task.build_id
                ))
            })?;

        if !container.status.is_finish() {
            return Err(Error::JobStillRunning {
                build_id: task.build_id.to_string(),
                container_id: container.container_id.to_string(),
            });
        }
        if !(task.status.is_failure() || task.status.is_cancel()) {
            return Err(Error::TaskNotRetryable {
                task_id: task.task_id.to_string(),
                status: task.status.to_string(),
            });
        }

        let skip = if request.skip {
            let decision = skip_decision(
                self.permissions.as_ref(),
                &request.user_id,
                &request.project_id,
                &task,
            )
            .await;
            if !decision.allows_skip() {
                info!(user = %request.user_id, task_id = %task.task_id, "Skip refused, retrying instead");
            }
            decision.allows_skip()
        } else {
            false
        };

        let previous_count = container.execute_count.max(request.execute_count);
        let execute_count = previous_count + 1;
        let tasks = self
            .repo
            .list_container_tasks(task.build_id, &task.container_id)
            .await?;
        let (task_resets, task_records) = plan_resets(&tasks, &task, skip, execute_count);

        let previous = self
            .repo
            .get_container_record(task.build_id, &task.container_id, previous_count.max(1))
            .await?;
        let container_record = ContainerRecord::carry_forward(
            &container,
            previous.as_ref(),
            execute_count,
            &task.task_id,
        );

        self.repo
            .apply_retry(&RetryPlan {
                build_id: task.build_id,
                container_id: task.container_id.clone(),
                execute_count,
                task_resets,
                task_records,
                container_record,
            })
            .await?;

        let outcome = RetryOutcome {
            task_id: task.task_id.clone(),
            execute_count,
            skipped: skip,
        };
        Ok((container, task, outcome))
    }
}

/// Live resets and fresh records for the next attempt of a job.
///
/// `tasks` must be ordered by sequence. The target becomes SKIP or QUEUE;
/// executor bracketing tasks and UNEXEC tasks go back to QUEUE. Only the
/// target and the UNEXEC tasks get a record for the new attempt; bracketing
/// tasks are reset live but keep the records they already have.
pub fn plan_resets(
    tasks: &[BuildTask],
    target: &BuildTask,
    skip: bool,
    execute_count: u32,
) -> (Vec<TaskReset>, Vec<TaskRecord>) {
    let mut resets = Vec::new();
    let mut records = Vec::new();
    for t in tasks {
        let (status, recorded) = if t.task_id == target.task_id {
            let status = if skip { BuildStatus::Skip } else { BuildStatus::Queue };
            (status, true)
        } else if t.infra_role().is_some() {
            (BuildStatus::Queue, false)
        } else if t.status == BuildStatus::Unexec {
            (BuildStatus::Queue, true)
        } else {
            continue;
        };
        resets.push(TaskReset {
            task_id: t.task_id.clone(),
            status,
        });
        if recorded {
            records.push(TaskRecord::snapshot(t, execute_count, status));
        }
    }
    (resets, records)
}

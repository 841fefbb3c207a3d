//! Per-attempt build records and the transition rules every storage
//! backend applies to them.
//!
//! A record is keyed by `(build, entity, execute_count)`. Retries create a
//! record for the next attempt instead of rewriting the previous one, so the
//! history of earlier attempts survives.

use crate::build::BuildContainer;
use crate::ids::*;
use crate::status::BuildStatus;
use crate::task::{BuildTask, TaskRunCondition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Well-known record variable names.
pub mod vars {
    pub const START_EPOCH: &str = "startEpoch";
    pub const ELAPSED: &str = "elapsed";
    pub const ERROR_TYPE: &str = "errorType";
    pub const ERROR_CODE: &str = "errorCode";
    pub const ERROR_MSG: &str = "errorMsg";
    pub const TASK_PAUSE: &str = "taskPause";
    pub const TIME_COST: &str = "timeCost";
    pub const REVIEW_USERS: &str = "reviewUsers";
    pub const ATOM_VERSION: &str = "version";
    pub const START_VM_STATUS: &str = "startVMStatus";
    pub const TIMELINE: &str = "timeline";
    pub const RETRY_TASK_ID: &str = "retryTaskId";
}

/// Message attached to tasks that never ran because of their run condition.
pub const UNEXEC_MESSAGE: &str = "Do not meet the run conditions, ignored.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimestampType {
    /// Time a task spent waiting for review or in a pause.
    TaskReviewPauseWaiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RecordTimestamp {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RecordTimestamp {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(at),
            end_time: None,
        }
    }

    pub fn ended(at: DateTime<Utc>) -> Self {
        Self {
            start_time: None,
            end_time: Some(at),
        }
    }

    /// Fields present on `other` replace ours.
    pub fn merge(&mut self, other: &RecordTimestamp) {
        if other.start_time.is_some() {
            self.start_time = other.start_time;
        }
        if other.end_time.is_some() {
            self.end_time = other.end_time;
        }
    }
}

pub type Timestamps = HashMap<TimestampType, RecordTimestamp>;

fn merge_timestamps(target: &mut Timestamps, deltas: &Timestamps) {
    for (kind, delta) in deltas {
        target.entry(*kind).or_default().merge(delta);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub build_id: BuildId,
    pub stage_id: StageId,
    pub container_id: ContainerId,
    pub task_id: TaskId,
    pub execute_count: u32,
    pub task_seq: u32,
    pub status: BuildStatus,
    pub variables: HashMap<String, Value>,
    pub timestamps: Timestamps,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Fresh snapshot of a live task for the given attempt.
    pub fn snapshot(task: &BuildTask, execute_count: u32, status: BuildStatus) -> Self {
        Self {
            build_id: task.build_id,
            stage_id: task.stage_id.clone(),
            container_id: task.container_id.clone(),
            task_id: task.task_id.clone(),
            execute_count,
            task_seq: task.task_seq,
            status,
            variables: HashMap::new(),
            timestamps: HashMap::new(),
            start_time: None,
            end_time: None,
        }
    }

    /// Applies a status update in place.
    ///
    /// A `Retry` or absent status leaves the status untouched. Moving from a
    /// finished status back to an unfinished one is refused; attempts are
    /// reset through [`RetryPlan`] instead.
    pub fn apply(
        &mut self,
        update: &TaskStatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<AppliedTransition, StatusRegression> {
        let previous = self.status;
        let target = update.status.filter(|s| *s != BuildStatus::Retry);

        if let Some(next) = target
            && previous.is_finish()
            && !next.is_finish()
        {
            return Err(StatusRegression {
                from: previous,
                to: next,
            });
        }

        for key in &update.remove_variables {
            self.variables.remove(key);
        }
        self.variables
            .extend(update.variables.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut ended = false;
        match target {
            Some(next) if next.is_running() => {
                if self.start_time.is_none() {
                    self.start_time = Some(now);
                }
                // Restarted inside the same attempt.
                self.end_time = None;
            }
            Some(next) if next.is_finish() => {
                if self.end_time.is_none() {
                    self.end_time = Some(now);
                    ended = true;
                }
                if matches!(previous, BuildStatus::Reviewing | BuildStatus::Pause) {
                    let waiting = self
                        .timestamps
                        .entry(TimestampType::TaskReviewPauseWaiting)
                        .or_default();
                    if waiting.end_time.is_none() {
                        waiting.end_time = Some(now);
                    }
                }
            }
            None if update.status == Some(BuildStatus::Retry) => {
                if self.end_time.is_none() {
                    self.end_time = Some(now);
                    ended = true;
                }
            }
            _ => {}
        }

        if ended && let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            let cost = (end - start).num_milliseconds().max(0);
            self.variables.insert(
                vars::TIME_COST.to_string(),
                serde_json::json!({ "totalCost": cost }),
            );
        }

        merge_timestamps(&mut self.timestamps, &update.timestamps);
        if let Some(next) = target {
            self.status = next;
        }

        Ok(AppliedTransition {
            previous,
            status: self.status,
            ended,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedTransition {
    pub previous: BuildStatus,
    pub status: BuildStatus,
    pub ended: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRegression {
    pub from: BuildStatus,
    pub to: BuildStatus,
}

/// A status change for one task record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskStatusUpdate {
    pub build_id: BuildId,
    pub task_id: TaskId,
    pub execute_count: u32,
    pub status: Option<BuildStatus>,
    pub variables: HashMap<String, Value>,
    pub remove_variables: Vec<String>,
    pub timestamps: Timestamps,
}

impl TaskStatusUpdate {
    pub fn new(build_id: BuildId, task_id: TaskId, execute_count: u32) -> Self {
        Self {
            build_id,
            task_id,
            execute_count,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: BuildStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn without_variable(mut self, key: impl Into<String>) -> Self {
        self.remove_variables.push(key.into());
        self
    }

    pub fn with_timestamp(mut self, kind: TimestampType, timestamp: RecordTimestamp) -> Self {
        self.timestamps.insert(kind, timestamp);
        self
    }
}

/// A task the scheduler must also update in its in-memory graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusInfo {
    pub task_id: TaskId,
    pub container_id: ContainerId,
    pub step_id: Option<String>,
    pub execute_count: u32,
    pub status: BuildStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdateOutcome {
    /// No record exists for this attempt.
    Missing,
    /// The update would move a finished task back to an unfinished status.
    Rejected(StatusRegression),
    Applied {
        record: TaskRecord,
        transition: AppliedTransition,
        impacted: Vec<TaskStatusInfo>,
    },
}

impl TaskUpdateOutcome {
    pub fn impacted(&self) -> &[TaskStatusInfo] {
        match self {
            TaskUpdateOutcome::Applied { impacted, .. } => impacted,
            _ => &[],
        }
    }
}

/// Tasks that can no longer run after `current` finished with `status`.
///
/// `tasks` are the container's live tasks. Only a cancellation propagates:
/// unfinished non-post tasks after `current` up to the last post task whose
/// parent already ran (when the job has post tasks), or up to the stop-VM
/// task otherwise, become UNEXEC. A cancelled post task changes nothing.
pub fn unexec_candidates<'a>(
    tasks: &'a [BuildTask],
    current: &BuildTask,
    container: &BuildContainer,
    status: BuildStatus,
) -> Vec<&'a BuildTask> {
    if !status.is_cancel()
        || current.options.run_condition == TaskRunCondition::RunEvenIfFailedOrCancelled
        || (container.contains_post_tasks && current.is_post_task())
    {
        return Vec::new();
    }

    let mut ordered: Vec<&BuildTask> = tasks.iter().collect();
    ordered.sort_by_key(|t| t.task_seq);

    let start = current.task_seq + 1;
    let stop_boundary = ordered
        .iter()
        .find(|t| t.is_stop_vm())
        .map(|t| t.task_seq.saturating_sub(1))
        .unwrap_or(u32::MAX);

    let end = if container.contains_post_tasks {
        // The last post task whose parent already ran closes the range.
        ordered
            .iter()
            .filter(|t| t.task_seq >= start)
            .filter(|t| {
                t.post_info
                    .as_ref()
                    .is_some_and(|p| p.parent_task_seq() <= current.task_seq)
            })
            .last()
            .map(|t| t.task_seq - 1)
            .unwrap_or(stop_boundary)
    } else {
        stop_boundary
    };

    ordered
        .into_iter()
        .filter(|t| t.task_seq >= start && t.task_seq <= end)
        .filter(|t| !t.status.is_finish() && !t.is_post_task())
        .collect()
}

/// Status infos the scheduler must apply after `current` finished with
/// `status`: the skipped task itself, or the tasks a cancellation turns
/// into UNEXEC.
pub fn sibling_impact(
    tasks: &[BuildTask],
    current: &BuildTask,
    container: &BuildContainer,
    status: BuildStatus,
    execute_count: u32,
) -> Vec<TaskStatusInfo> {
    if status == BuildStatus::Skip {
        return vec![TaskStatusInfo {
            task_id: current.task_id.clone(),
            container_id: current.container_id.clone(),
            step_id: current.step_id.clone(),
            execute_count,
            status,
            message: UNEXEC_MESSAGE.to_string(),
        }];
    }
    unexec_candidates(tasks, current, container, status)
        .into_iter()
        .map(|t| TaskStatusInfo {
            task_id: t.task_id.clone(),
            container_id: t.container_id.clone(),
            step_id: t.step_id.clone(),
            execute_count,
            status: BuildStatus::Unexec,
            message: UNEXEC_MESSAGE.to_string(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub build_id: BuildId,
    pub stage_id: StageId,
    pub container_id: ContainerId,
    pub execute_count: u32,
    pub status: BuildStatus,
    pub variables: HashMap<String, Value>,
    pub timestamps: Timestamps,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ContainerRecord {
    /// Builds the record for a retried attempt.
    ///
    /// Non-timing variables carry over from `previous`; cost, start-VM and
    /// timeline fields are dropped and the retried task is tagged.
    pub fn carry_forward(
        container: &BuildContainer,
        previous: Option<&ContainerRecord>,
        execute_count: u32,
        retry_task_id: &TaskId,
    ) -> Self {
        let mut variables = previous.map(|r| r.variables.clone()).unwrap_or_default();
        for key in [
            vars::TIME_COST,
            vars::START_VM_STATUS,
            vars::START_EPOCH,
            vars::TIMELINE,
        ] {
            variables.remove(key);
        }
        variables.insert(
            vars::RETRY_TASK_ID.to_string(),
            Value::String(retry_task_id.to_string()),
        );

        Self {
            build_id: container.build_id,
            stage_id: container.stage_id.clone(),
            container_id: container.container_id.clone(),
            execute_count,
            status: BuildStatus::Queue,
            variables,
            timestamps: HashMap::new(),
            start_time: None,
            end_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub build_id: BuildId,
    pub stage_id: StageId,
    pub execute_count: u32,
    pub status: BuildStatus,
    pub variables: HashMap<String, Value>,
    pub timestamps: Timestamps,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Applies the start/end timing rules shared by container and stage rows.
///
/// Returns `false` when the change would move a finished row back to an
/// unfinished status.
pub fn apply_timing(
    status: &mut BuildStatus,
    start_time: &mut Option<DateTime<Utc>>,
    end_time: &mut Option<DateTime<Utc>>,
    next: BuildStatus,
    now: DateTime<Utc>,
) -> bool {
    if status.is_finish() && !next.is_finish() {
        return false;
    }
    if next.is_running() && start_time.is_none() {
        *start_time = Some(now);
    }
    if next.is_finish() && end_time.is_none() {
        *end_time = Some(now);
    }
    *status = next;
    true
}

/// Status change for a container or stage, applied outside task transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatusUpdate {
    pub build_id: BuildId,
    pub container_id: ContainerId,
    pub execute_count: u32,
    pub status: BuildStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatusUpdate {
    pub build_id: BuildId,
    pub stage_id: StageId,
    pub execute_count: u32,
    pub status: BuildStatus,
}

/// A live task reset performed by a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReset {
    pub task_id: TaskId,
    pub status: BuildStatus,
}

/// Everything a retry writes, applied atomically by the storage backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPlan {
    pub build_id: BuildId,
    pub container_id: ContainerId,
    pub execute_count: u32,
    pub task_resets: Vec<TaskReset>,
    pub task_records: Vec<TaskRecord>,
    pub container_record: ContainerRecord,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::JobControlOptions;
    use crate::task::{PostTaskInfo, TaskKind, TaskOptions};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn record(status: BuildStatus) -> TaskRecord {
        TaskRecord {
            build_id: BuildId::new(),
            stage_id: "stage-1".into(),
            container_id: "1".into(),
            task_id: "e-1".into(),
            execute_count: 1,
            task_seq: 2,
            status,
            variables: HashMap::new(),
            timestamps: HashMap::new(),
            start_time: None,
            end_time: None,
        }
    }

    fn update(status: BuildStatus) -> TaskStatusUpdate {
        TaskStatusUpdate::new(BuildId::new(), "e-1".into(), 1).with_status(status)
    }

    fn task(id: &str, seq: u32, status: BuildStatus) -> BuildTask {
        BuildTask {
            project_id: "proj".into(),
            pipeline_id: "p-1".into(),
            build_id: BuildId::new(),
            stage_id: "stage-1".into(),
            container_id: "1".into(),
            task_id: id.into(),
            step_id: None,
            task_name: id.to_string(),
            task_seq: seq,
            kind: TaskKind::Normal,
            status,
            execute_count: 1,
            options: TaskOptions::default(),
            post_info: None,
            start_time: None,
            end_time: None,
        }
    }

    fn container(contains_post_tasks: bool) -> BuildContainer {
        BuildContainer {
            build_id: BuildId::new(),
            stage_id: "stage-1".into(),
            container_id: "1".into(),
            seq: 1,
            status: BuildStatus::Running,
            execute_count: 1,
            contains_post_tasks,
            options: JobControlOptions::default(),
            start_time: None,
            end_time: None,
        }
    }

    #[test]
    fn test_start_time_set_once() {
        let now = Utc::now();
        let mut rec = record(BuildStatus::Queue);
        rec.apply(&update(BuildStatus::Running), now).unwrap();
        rec.apply(&update(BuildStatus::Running), now + Duration::seconds(5))
            .unwrap();
        assert_eq!(rec.start_time, Some(now));
    }

    #[test]
    fn test_end_time_not_overwritten() {
        let now = Utc::now();
        let mut rec = record(BuildStatus::Running);
        rec.start_time = Some(now);
        let first = rec
            .apply(&update(BuildStatus::Failed), now + Duration::seconds(1))
            .unwrap();
        assert!(first.ended);
        let second = rec
            .apply(&update(BuildStatus::Failed), now + Duration::seconds(9))
            .unwrap();
        assert!(!second.ended);
        assert_eq!(rec.end_time, Some(now + Duration::seconds(1)));
        assert_eq!(rec.variables[vars::TIME_COST]["totalCost"], 1000);
    }

    #[test]
    fn test_restart_flushes_end_time() {
        let now = Utc::now();
        let mut rec = record(BuildStatus::Running);
        rec.apply(&update(BuildStatus::Retry), now).unwrap();
        assert_eq!(rec.status, BuildStatus::Running);
        assert!(rec.end_time.is_some());

        rec.apply(&update(BuildStatus::Running), now).unwrap();
        assert!(rec.end_time.is_none());
    }

    #[test]
    fn test_finished_cannot_regress() {
        let mut rec = record(BuildStatus::Succeed);
        let err = rec.apply(&update(BuildStatus::Running), Utc::now()).unwrap_err();
        assert_eq!(err.from, BuildStatus::Succeed);
        assert_eq!(rec.status, BuildStatus::Succeed);
    }

    #[test]
    fn test_variables_merge_new_wins() {
        let mut rec = record(BuildStatus::Running);
        rec.variables.insert("a".into(), Value::from(1));
        rec.variables.insert("b".into(), Value::from(1));
        let upd = TaskStatusUpdate::new(rec.build_id, "e-1".into(), 1)
            .with_variable("b", Value::from(2))
            .with_variable("c", Value::from(3));
        rec.apply(&upd, Utc::now()).unwrap();
        assert_eq!(rec.variables["a"], 1);
        assert_eq!(rec.variables["b"], 2);
        assert_eq!(rec.variables["c"], 3);
    }

    #[test]
    fn test_review_wait_closed_on_finish() {
        let now = Utc::now();
        let mut rec = record(BuildStatus::Reviewing);
        rec.timestamps.insert(
            TimestampType::TaskReviewPauseWaiting,
            RecordTimestamp::started(now),
        );
        rec.apply(&update(BuildStatus::Succeed), now).unwrap();
        let waiting = rec.timestamps[&TimestampType::TaskReviewPauseWaiting];
        assert_eq!(waiting, RecordTimestamp { start_time: Some(now), end_time: Some(now) });
    }

    #[test]
    fn test_cancel_unexecs_until_stop_vm() {
        let tasks = vec![
            task("startVM-1", 1, BuildStatus::Succeed),
            task("e-1", 2, BuildStatus::Canceled),
            task("e-2", 3, BuildStatus::Queue),
            task("e-3", 4, BuildStatus::Succeed),
            task("stopVM-1", 5, BuildStatus::Queue),
            task("end-1", 6, BuildStatus::Queue),
        ];
        let ids: Vec<_> = unexec_candidates(&tasks, &tasks[1], &container(false), BuildStatus::Canceled)
            .iter()
            .map(|t| t.task_id.to_string())
            .collect();
        assert_eq!(ids, vec!["e-2".to_string()]);
    }

    #[test]
    fn test_cancel_stops_at_post_boundary() {
        let mut post = task("e-post", 5, BuildStatus::Queue);
        post.post_info = Some(PostTaskInfo {
            parent_task_id: "e-1".into(),
            parent_element_job_index: 0,
        });
        let tasks = vec![
            task("startVM-1", 1, BuildStatus::Succeed),
            task("e-1", 2, BuildStatus::Succeed),
            task("e-2", 3, BuildStatus::Canceled),
            task("e-3", 4, BuildStatus::Queue),
            post,
            task("e-4", 6, BuildStatus::Queue),
            task("stopVM-1", 7, BuildStatus::Queue),
        ];
        let ids: Vec<_> = unexec_candidates(&tasks, &tasks[2], &container(true), BuildStatus::Canceled)
            .iter()
            .map(|t| t.task_id.to_string())
            .collect();
        assert_eq!(ids, vec!["e-3".to_string()]);
    }

    #[test]
    fn test_cancel_uses_last_post_boundary() {
        let mut early = task("e-post-1", 6, BuildStatus::Queue);
        early.post_info = Some(PostTaskInfo {
            parent_task_id: "e-2".into(),
            parent_element_job_index: 1,
        });
        let mut late = task("e-post-0", 8, BuildStatus::Queue);
        late.post_info = Some(PostTaskInfo {
            parent_task_id: "e-1".into(),
            parent_element_job_index: 0,
        });
        let tasks = vec![
            task("startVM-1", 1, BuildStatus::Succeed),
            task("e-1", 2, BuildStatus::Succeed),
            task("e-2", 3, BuildStatus::Succeed),
            task("e-3", 4, BuildStatus::Canceled),
            task("e-4", 5, BuildStatus::Queue),
            early,
            task("e-5", 7, BuildStatus::Queue),
            late,
            task("stopVM-1", 9, BuildStatus::Queue),
        ];
        let ids: Vec<_> = unexec_candidates(&tasks, &tasks[3], &container(true), BuildStatus::Canceled)
            .iter()
            .map(|t| t.task_id.to_string())
            .collect();
        assert_eq!(ids, vec!["e-4".to_string(), "e-5".to_string()]);
    }

    #[test]
    fn test_cancelled_post_task_does_not_propagate() {
        let mut current = task("e-post", 4, BuildStatus::Canceled);
        current.post_info = Some(PostTaskInfo {
            parent_task_id: "e-1".into(),
            parent_element_job_index: 0,
        });
        let tasks = vec![
            task("e-1", 2, BuildStatus::Succeed),
            current.clone(),
            task("e-2", 5, BuildStatus::Queue),
            task("stopVM-1", 6, BuildStatus::Queue),
        ];
        assert!(unexec_candidates(&tasks, &current, &container(true), BuildStatus::Canceled).is_empty());
    }

    #[test]
    fn test_even_cancel_and_skip_do_not_propagate() {
        let mut current = task("e-1", 2, BuildStatus::Canceled);
        let tasks = vec![current.clone(), task("e-2", 3, BuildStatus::Queue)];
        assert!(unexec_candidates(&tasks, &current, &container(false), BuildStatus::Skip).is_empty());
        current.options.run_condition = TaskRunCondition::RunEvenIfFailedOrCancelled;
        assert!(unexec_candidates(&tasks, &current, &container(false), BuildStatus::Canceled).is_empty());
    }

    #[test]
    fn test_carry_forward_drops_timing_fields() {
        let c = container(false);
        let mut previous = ContainerRecord::carry_forward(&c, None, 1, &"e-0".into());
        previous.variables.insert(vars::TIME_COST.into(), Value::from(10));
        previous.variables.insert(vars::TIMELINE.into(), Value::from("x"));
        previous.variables.insert("os".into(), Value::from("linux"));
        previous.start_time = Some(Utc::now());

        let next = ContainerRecord::carry_forward(&c, Some(&previous), 2, &"e-1".into());
        assert_eq!(next.execute_count, 2);
        assert_eq!(next.status, BuildStatus::Queue);
        assert_eq!(next.start_time, None);
        assert_eq!(next.variables.len(), 2);
        assert_eq!(next.variables["os"], "linux");
        assert_eq!(next.variables[vars::RETRY_TASK_ID], "e-1");
    }
}

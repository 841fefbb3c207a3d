//! Run-condition decisions for tasks, jobs and stages.
//!
//! Everything here is pure apart from the expression engine call.

use gantry_core::build::{JobControlOptions, JobRunCondition, StageControlOptions, StageRunCondition};
use gantry_core::expression::{ExpressionError, SimpleExpressionEngine};
use gantry_core::interpolation::interpolate;
use gantry_core::ports::ExpressionEngine;
use gantry_core::task::{
    NameAndValue, TaskOptions, TaskRunCondition, TASK_RETRY_MAX_COUNT, TASK_RETRY_MIN_COUNT,
};
use gantry_core::{BuildStatus, Result};
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

/// A skip decision and the reason shown in the build log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionOutcome {
    pub skip: bool,
    pub reason: String,
}

impl ConditionOutcome {
    fn run(reason: impl Into<String>) -> Self {
        Self {
            skip: false,
            reason: reason.into(),
        }
    }

    fn skip_if(skip: bool, reason: impl Into<String>) -> Self {
        Self {
            skip,
            reason: reason.into(),
        }
    }
}

/// State of the enclosing job a task decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext<'a> {
    pub container_status: BuildStatus,
    /// A task already failed while the job itself still reports success,
    /// e.g. one configured to continue on failure.
    pub has_failed_task: bool,
    pub variables: &'a HashMap<String, String>,
}

/// Decides whether tasks, jobs and stages run, skip, retry or pause.
#[derive(Clone)]
pub struct ConditionEvaluator {
    engine: Arc<dyn ExpressionEngine>,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new(Arc::new(SimpleExpressionEngine))
    }
}

impl ConditionEvaluator {
    pub fn new(engine: Arc<dyn ExpressionEngine>) -> Self {
        Self { engine }
    }

    pub fn is_enabled(options: &TaskOptions) -> bool {
        options.enable
    }

    /// Continue-on-failure never applies to tasks an operator may skip.
    pub fn continue_when_failure(options: &TaskOptions) -> bool {
        options.continue_when_failed && !options.manual_skip
    }

    /// Whether a failed task gets another automatic attempt.
    pub fn should_retry(options: &TaskOptions, attempts: u32) -> bool {
        if !options.enable || !options.retry_when_failed {
            return false;
        }
        let limit = options
            .retry_count
            .clamp(TASK_RETRY_MIN_COUNT, TASK_RETRY_MAX_COUNT);
        attempts < limit
    }

    /// A task pauses at most once per attempt.
    pub fn should_pause(options: &TaskOptions, already_paused: bool) -> bool {
        options.pause_before_exec && !already_paused
    }

    pub fn check_task_skip(
        &self,
        options: &TaskOptions,
        ctx: TaskContext<'_>,
    ) -> Result<ConditionOutcome> {
        if !options.enable {
            return Ok(ConditionOutcome::skip_if(true, "Task disabled"));
        }

        let container = ctx.container_status;
        let outcome = match options.run_condition {
            TaskRunCondition::OnlyIfPriorFailed => {
                let failed = container.is_failure() || ctx.has_failed_task;
                ConditionOutcome::skip_if(
                    !failed,
                    format!("Run only if a prior task failed, job status {container}"),
                )
            }
            TaskRunCondition::RunEvenIfFailedUnlessCancelled => ConditionOutcome::skip_if(
                container.is_cancel(),
                format!("Run even if failed unless cancelled, job status {container}"),
            ),
            TaskRunCondition::RunEvenIfFailedOrCancelled => {
                ConditionOutcome::run("Run even if failed or cancelled")
            }
            _ if container.is_failure() || container.is_cancel() => ConditionOutcome::skip_if(
                true,
                format!("Job is {container}, remaining tasks are skipped"),
            ),
            TaskRunCondition::CustomVariableMatch
            | TaskRunCondition::CustomVariableMatchNotRun
            | TaskRunCondition::CustomConditionMatch => self.task_custom_skip(options, ctx.variables)?,
            TaskRunCondition::PreTaskSuccess => ConditionOutcome::run("Previous tasks succeeded"),
        };
        Ok(outcome)
    }

    fn task_custom_skip(
        &self,
        options: &TaskOptions,
        variables: &HashMap<String, String>,
    ) -> Result<ConditionOutcome> {
        let mut reason = String::new();
        let variable_skip = task_variable_skip(options, variables, &mut reason);

        let condition_skip = if options.run_condition == TaskRunCondition::CustomConditionMatch {
            !self.evaluate(options.custom_condition.as_deref(), variables, &mut reason)?
        } else {
            false
        };

        Ok(ConditionOutcome::skip_if(variable_skip || condition_skip, reason))
    }

    /// Job-level decision. There is no fail-fast default at this level.
    ///
    /// Custom variables are compared after substitution. The first mismatch
    /// flips the initial decision and ends the comparison.
    pub fn check_job_skip(
        &self,
        options: &JobControlOptions,
        variables: &HashMap<String, String>,
    ) -> Result<ConditionOutcome> {
        let mut reason = String::from("Check job run condition: ");
        let skip = match options.run_condition {
            JobRunCondition::CustomVariableMatchNotRun => {
                reason.push_str("skip when all custom variables match");
                true
            }
            JobRunCondition::CustomVariableMatch => {
                reason.push_str("run when all custom variables match");
                false
            }
            JobRunCondition::CustomConditionMatch => {
                let run = self.evaluate(options.custom_condition.as_deref(), variables, &mut reason)?;
                return Ok(ConditionOutcome::skip_if(!run, reason));
            }
            JobRunCondition::StageRunning => {
                reason.push_str("run when the stage runs");
                return Ok(ConditionOutcome::run(reason));
            }
        };
        let skip = flip_on_first_mismatch(skip, &options.custom_variables, variables, true, &mut reason);
        Ok(ConditionOutcome::skip_if(skip, reason))
    }

    /// Stage-level decision. Same shape as [`Self::check_job_skip`], but
    /// the configured values are compared as written.
    pub fn check_stage_skip(
        &self,
        options: &StageControlOptions,
        variables: &HashMap<String, String>,
    ) -> Result<ConditionOutcome> {
        let mut reason = String::from("Check stage run condition: ");
        let skip = match options.run_condition {
            StageRunCondition::CustomVariableMatchNotRun => {
                reason.push_str("skip when all custom variables match");
                true
            }
            StageRunCondition::CustomVariableMatch => {
                reason.push_str("run when all custom variables match");
                false
            }
            StageRunCondition::CustomConditionMatch => {
                let run = self.evaluate(options.custom_condition.as_deref(), variables, &mut reason)?;
                return Ok(ConditionOutcome::skip_if(!run, reason));
            }
            StageRunCondition::AfterLastFinished => {
                reason.push_str("run after the previous stage finished");
                return Ok(ConditionOutcome::run(reason));
            }
        };
        let skip = flip_on_first_mismatch(skip, &options.custom_variables, variables, false, &mut reason);
        Ok(ConditionOutcome::skip_if(skip, reason))
    }

    /// Evaluates a custom condition. Blank input is an error, not `false`.
    fn evaluate(
        &self,
        expression: Option<&str>,
        variables: &HashMap<String, String>,
        reason: &mut String,
    ) -> Result<bool> {
        let expression = expression.map(str::trim).unwrap_or_default();
        if expression.is_empty() {
            return Err(ExpressionError::Empty.into());
        }
        let result = self.engine.evaluate(expression, variables)?;
        let _ = write!(reason, "Custom condition({expression}) result is {result}.");
        if !result {
            reason.push_str(" Will be skipped.");
        }
        Ok(result)
    }
}

/// Task-level custom variable rule.
///
/// "Skip when all match" skips unless some pair mismatches; "run when all
/// match" skips as soon as one pair mismatches. Without configured pairs
/// neither mode skips.
fn task_variable_skip(
    options: &TaskOptions,
    variables: &HashMap<String, String>,
    reason: &mut String,
) -> bool {
    let skip_when_all_match = match options.run_condition {
        TaskRunCondition::CustomVariableMatchNotRun => true,
        TaskRunCondition::CustomVariableMatch => false,
        _ => return false,
    };
    if options.custom_variables.is_empty() {
        return false;
    }

    for pair in &options.custom_variables {
        let expected = interpolate(&pair.value, variables);
        let actual = variables.get(&pair.key);
        if actual != Some(&expected) {
            let skip = !skip_when_all_match;
            let _ = write!(
                reason,
                "key={}, expect={expected}, actual={}, skip={skip}",
                pair.key,
                actual.map(String::as_str).unwrap_or("null")
            );
            return skip;
        }
    }
    if skip_when_all_match {
        reason.push_str("All custom variables match, skip");
    }
    skip_when_all_match
}

/// Shared job and stage variable loop: the first mismatch flips `skip` and
/// stops the comparison.
fn flip_on_first_mismatch(
    mut skip: bool,
    pairs: &[NameAndValue],
    variables: &HashMap<String, String>,
    substitute: bool,
    reason: &mut String,
) -> bool {
    for pair in pairs {
        let expected = if substitute {
            interpolate(&pair.value, variables)
        } else {
            pair.value.clone()
        };
        let actual = variables.get(&pair.key);
        if actual != Some(&expected) {
            skip = !skip;
            let _ = write!(
                reason,
                "\nkey={}, expect={expected}, actual={}, (expect!=actual)=true, skip={skip}",
                pair.key,
                actual.map(String::as_str).unwrap_or("null")
            );
            break;
        }
    }
    skip
}

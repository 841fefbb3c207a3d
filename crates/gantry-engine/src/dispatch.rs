//! Ephemeral job containers and interactive debug builders.

use crate::config::DispatchConfig;
use crate::poll::{PollPolicy, PollStep};
use gantry_cache::keys;
use gantry_core::dispatch::{
    BuilderDebugStatus, BuilderOperation, BuilderStatus, DebugSession, DispatchType, JobRequest,
    JobTask, PlatformTaskResult, PlatformTaskStatus, StopDebugOutcome,
};
use gantry_core::ids::{BuildId, PipelineId, ProjectId};
use gantry_core::ports::{
    AuthAction, AuthResource, DispatchBuildRepository, ExecutorPlatform, KvCache,
    PermissionService,
};
use gantry_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The job slot a debug session targets, as seen by one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugTarget {
    pub dispatch_type: DispatchType,
    pub user_id: String,
    pub project_id: ProjectId,
    pub pipeline_id: PipelineId,
    pub vm_seq_id: String,
}

/// Admission control for job containers and debug session lifecycle.
pub struct DispatchResourceController {
    platforms: HashMap<DispatchType, Arc<dyn ExecutorPlatform>>,
    repo: Arc<dyn DispatchBuildRepository>,
    cache: Arc<dyn KvCache>,
    permissions: Arc<dyn PermissionService>,
    config: DispatchConfig,
    poll: PollPolicy,
}

impl DispatchResourceController {
    pub fn new(
        repo: Arc<dyn DispatchBuildRepository>,
        cache: Arc<dyn KvCache>,
        permissions: Arc<dyn PermissionService>,
        config: DispatchConfig,
        poll: PollPolicy,
    ) -> Self {
        Self {
            platforms: HashMap::new(),
            repo,
            cache,
            permissions,
            config,
            poll,
        }
    }

    /// Register the platform serving `dispatch_type`.
    pub fn with_platform(mut self, dispatch_type: DispatchType, platform: Arc<dyn ExecutorPlatform>) -> Self {
        self.platforms.insert(dispatch_type, platform);
        self
    }

    fn platform(&self, dispatch_type: DispatchType) -> Result<&Arc<dyn ExecutorPlatform>> {
        self.platforms
            .get(&dispatch_type)
            .ok_or_else(|| Error::UnsupportedDispatchType(dispatch_type.to_string()))
    }

    /// Create a job container once the build is within its quota.
    ///
    /// The counter is incremented before the check, so concurrent callers
    /// never both take the last slot. A lost counter starts over.
    pub async fn create_job(
        &self,
        dispatch_type: DispatchType,
        user: &str,
        request: &JobRequest,
    ) -> Result<JobTask> {
        let platform = self.platform(dispatch_type)?;
        let key = keys::job_quota(dispatch_type, request.build_id, &request.pod_name_selector);
        let count = self
            .cache
            .incr(&key, self.config.quota_ttl())
            .await
            .map_err(|e| Error::QuotaUnavailable(e.to_string()))?;
        if count > i64::from(self.config.job_quota) {
            warn!(
                build_id = %request.build_id,
                selector = %request.pod_name_selector,
                count,
                "Job limit reached"
            );
            return Err(Error::JobQuotaExceeded {
                build_id: request.build_id.to_string(),
                limit: self.config.job_quota,
            });
        }

        let task = platform.create_job(user, request).await?;
        info!(build_id = %request.build_id, job = %task.job_name, count, "Job container requested");
        Ok(task)
    }

    pub async fn job_status(
        &self,
        dispatch_type: DispatchType,
        user: &str,
        job_name: &str,
    ) -> Result<PlatformTaskResult> {
        self.platform(dispatch_type)?.job_status(user, job_name).await
    }

    /// Open a debug session on the builder that ran the job slot.
    ///
    /// Without `build_id` the most recent build of the slot is used.
    pub async fn start_debug(
        &self,
        target: &DebugTarget,
        build_id: Option<BuildId>,
        check_permission: bool,
    ) -> Result<DebugSession> {
        let platform = self.platform(target.dispatch_type)?;
        info!(
            user = %target.user_id,
            pipeline_id = %target.pipeline_id,
            vm_seq_id = %target.vm_seq_id,
            "Starting debug session"
        );

        let history = match build_id {
            Some(build_id) => {
                self.repo
                    .history_for_build(target.dispatch_type, build_id, &target.vm_seq_id)
                    .await?
            }
            None => {
                self.repo
                    .latest_history(target.dispatch_type, &target.pipeline_id, &target.vm_seq_id)
                    .await?
            }
        };
        let builder = history
            .map(|h| h.container_name)
            .ok_or_else(|| Error::NoDebugContainer(target.pipeline_id.to_string()))?;

        if check_permission {
            self.check_edit(target).await?;
        }

        match platform.debug_status(&target.user_id, &builder).await? {
            BuilderDebugStatus::CanRestart => {
                info!(builder = %builder, "Builder is shut down, starting it");
                self.start_sleep(platform.as_ref(), target, &builder).await?;
                self.set_debug(target, &builder, true).await?;
            }
            BuilderDebugStatus::Running => {
                self.set_debug(target, &builder, true).await?;
            }
            BuilderDebugStatus::Starting => {
                let status = self.wait_running(platform.as_ref(), &target.user_id, &builder).await?;
                if status != BuilderDebugStatus::Running {
                    error!(builder = %builder, status = status.as_str(), "Builder did not come up");
                    return Err(Error::DebugStatusException(target.pipeline_id.to_string()));
                }
                self.set_debug(target, &builder, true).await?;
            }
            status => {
                error!(builder = %builder, status = status.as_str(), "Builder cannot be debugged");
                return Err(Error::DebugStatusException(target.pipeline_id.to_string()));
            }
        }

        let key = keys::debug_builder(
            target.dispatch_type,
            &target.user_id,
            &target.pipeline_id,
            &target.vm_seq_id,
        );
        if let Err(e) = self.cache.set(&key, &builder, self.config.debug_name_ttl()).await {
            warn!(builder = %builder, error = %e, "Failed to cache debug builder name");
        }

        Ok(DebugSession {
            websocket_url: platform.websocket_url(
                &target.project_id,
                &target.pipeline_id,
                &target.user_id,
                &builder,
            ),
            container_name: builder,
        })
    }

    /// Close a debug session.
    ///
    /// The in-debug flag is cleared before anything else, in the same
    /// transaction that reads the builder's state. The builder is only
    /// stopped when it was idle and in debug; a failed stop deletes it
    /// together with its pool row.
    pub async fn stop_debug(
        &self,
        target: &DebugTarget,
        builder_name: Option<&str>,
        check_permission: bool,
    ) -> Result<StopDebugOutcome> {
        let platform = self.platform(target.dispatch_type)?;
        let Some(name) = self.resolve_debug_builder(target, builder_name).await? else {
            info!(pipeline_id = %target.pipeline_id, vm_seq_id = %target.vm_seq_id, "No debug builder to stop");
            return Ok(StopDebugOutcome::NotFound);
        };

        if check_permission {
            self.check_edit(target).await?;
        }

        let Some(builder) = self
            .repo
            .clear_debug_status(target.dispatch_type, &target.pipeline_id, &target.vm_seq_id, &name)
            .await?
        else {
            info!(builder = %name, "Debug builder no longer exists");
            return Ok(StopDebugOutcome::NotFound);
        };
        if builder.status != BuilderStatus::Idle || !builder.debug_status {
            info!(builder = %name, "Builder is busy or not in debug, leaving it running");
            return Ok(StopDebugOutcome::NotInDebug);
        }

        let stopped = match platform
            .operate_builder(&target.user_id, &name, &BuilderOperation::Stop)
            .await
        {
            Ok(task_id) => self.wait_task(platform.as_ref(), &target.user_id, &task_id).await,
            Err(e) => Err(e),
        };
        match stopped {
            Ok(result) if result.status == PlatformTaskStatus::Succeeded => {
                info!(builder = %name, "Debug builder stopped");
                Ok(StopDebugOutcome::Stopped)
            }
            outcome => {
                let reason = match outcome {
                    Ok(result) => result.message.unwrap_or_default(),
                    Err(e) => e.to_string(),
                };
                warn!(builder = %name, reason = %reason, "Stop failed, deleting builder");
                platform
                    .operate_builder(&target.user_id, &name, &BuilderOperation::Delete)
                    .await?;
                self.repo
                    .delete_builder(
                        target.dispatch_type,
                        &target.pipeline_id,
                        &target.vm_seq_id,
                        builder.pool_no,
                    )
                    .await?;
                Ok(StopDebugOutcome::Deleted)
            }
        }
    }

    /// Explicit name, then the cached name, then the builder flagged in
    /// debug.
    async fn resolve_debug_builder(&self, target: &DebugTarget, explicit: Option<&str>) -> Result<Option<String>> {
        if let Some(name) = explicit.filter(|n| !n.trim().is_empty()) {
            return Ok(Some(name.to_string()));
        }
        let key = keys::debug_builder(
            target.dispatch_type,
            &target.user_id,
            &target.pipeline_id,
            &target.vm_seq_id,
        );
        match self.cache.get(&key).await {
            Ok(Some(name)) if !name.is_empty() => return Ok(Some(name)),
            Ok(_) => {}
            Err(e) => warn!(key = %key, error = %e, "Debug builder cache unavailable"),
        }
        Ok(self
            .repo
            .find_debugging_builder(target.dispatch_type, &target.pipeline_id, &target.vm_seq_id)
            .await?
            .map(|b| b.builder_name))
    }

    async fn check_edit(&self, target: &DebugTarget) -> Result<()> {
        let allowed = self
            .permissions
            .check_permission(
                &target.user_id,
                &target.project_id,
                &AuthResource::Pipeline(target.pipeline_id.clone()),
                AuthAction::Edit,
            )
            .await?;
        if allowed {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "{} cannot edit pipeline {}",
                target.user_id, target.pipeline_id
            )))
        }
    }

    async fn set_debug(&self, target: &DebugTarget, builder: &str, debug: bool) -> Result<()> {
        self.repo
            .set_debug_status(
                target.dispatch_type,
                &target.pipeline_id,
                &target.vm_seq_id,
                builder,
                debug,
            )
            .await
    }

    async fn start_sleep(&self, platform: &dyn ExecutorPlatform, target: &DebugTarget, builder: &str) -> Result<()> {
        let env = HashMap::from([
            ("GANTRY_PROJECT_ID".to_string(), target.project_id.to_string()),
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("GANTRY_WORKER_ENV".to_string(), platform.worker_env()),
        ]);
        let task_id = platform
            .operate_builder(&target.user_id, builder, &BuilderOperation::StartSleep { env })
            .await?;
        let result = self.wait_task(platform, &target.user_id, &task_id).await?;
        if result.status != PlatformTaskStatus::Succeeded {
            let message = result.message.unwrap_or_default();
            error!(builder, message = %message, "Builder start failed");
            return Err(Error::BuilderStartFailed(message));
        }

        match self.wait_running(platform, &target.user_id, builder).await? {
            BuilderDebugStatus::Running => Ok(()),
            BuilderDebugStatus::Failed(message) => Err(Error::BuilderStartFailed(message)),
            other => Err(Error::BuilderStartFailed(format!("builder is {}", other.as_str()))),
        }
    }

    /// Poll until the builder leaves STARTING.
    async fn wait_running(
        &self,
        platform: &dyn ExecutorPlatform,
        user: &str,
        builder: &str,
    ) -> Result<BuilderDebugStatus> {
        self.poll
            .run("wait for debug builder", |_| async move {
                Ok(match platform.debug_status(user, builder).await? {
                    BuilderDebugStatus::Starting => PollStep::Pending,
                    status => PollStep::Done(status),
                })
            })
            .await
    }

    async fn wait_task(
        &self,
        platform: &dyn ExecutorPlatform,
        user: &str,
        task_id: &str,
    ) -> Result<PlatformTaskResult> {
        self.poll
            .run("wait for builder operation", |_| async move {
                let result = platform.task_status(user, task_id).await?;
                Ok(if result.status.is_finished() {
                    PollStep::Done(result)
                } else {
                    PollStep::Pending
                })
            })
            .await
    }
}

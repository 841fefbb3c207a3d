use super::poisoned;
use async_trait::async_trait;
use chrono::Utc;
use gantry_core::build::{Build, BuildContainer, BuildGraph, BuildStage};
use gantry_core::ids::*;
use gantry_core::ports::BuildRecordRepository;
use gantry_core::record::{
    self, ContainerRecord, ContainerStatusUpdate, RetryPlan, StageRecord, StageStatusUpdate,
    TaskRecord, TaskStatusUpdate, TaskUpdateOutcome,
};
use gantry_core::task::BuildTask;
use gantry_core::{BuildStatus, Error, Result};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Default)]
struct Tables {
    builds: HashMap<BuildId, Build>,
    stages: HashMap<(BuildId, StageId), BuildStage>,
    containers: HashMap<(BuildId, ContainerId), BuildContainer>,
    tasks: HashMap<(BuildId, TaskId), BuildTask>,
    task_records: HashMap<(BuildId, TaskId, u32), TaskRecord>,
    container_records: HashMap<(BuildId, ContainerId, u32), ContainerRecord>,
    stage_records: HashMap<(BuildId, StageId, u32), StageRecord>,
}

impl Tables {
    fn container_tasks(&self, build_id: BuildId, container_id: &ContainerId) -> Vec<BuildTask> {
        let mut tasks: Vec<BuildTask> = self
            .tasks
            .values()
            .filter(|t| t.build_id == build_id && &t.container_id == container_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.task_seq);
        tasks
    }
}

/// In-memory [`BuildRecordRepository`].
#[derive(Default)]
pub struct MemoryBuildRecordRepository {
    tables: RwLock<Tables>,
}

impl MemoryBuildRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(poisoned)
    }

    pub fn get_build(&self, build_id: BuildId) -> Result<Option<Build>> {
        Ok(self.read()?.builds.get(&build_id).cloned())
    }
}

#[async_trait]
impl BuildRecordRepository for MemoryBuildRecordRepository {
    async fn save_build(&self, graph: &BuildGraph) -> Result<()> {
        let mut t = self.write()?;
        let build_id = graph.build.build_id;
        let count = graph.build.execute_count;
        t.builds.insert(build_id, graph.build.clone());

        for stage in &graph.stages {
            t.stage_records.insert(
                (build_id, stage.stage_id.clone(), count),
                StageRecord {
                    build_id,
                    stage_id: stage.stage_id.clone(),
                    execute_count: count,
                    status: stage.status,
                    variables: HashMap::new(),
                    timestamps: HashMap::new(),
                    start_time: None,
                    end_time: None,
                },
            );
            t.stages.insert((build_id, stage.stage_id.clone()), stage.clone());
        }
        for container in &graph.containers {
            t.container_records.insert(
                (build_id, container.container_id.clone(), count),
                ContainerRecord {
                    build_id,
                    stage_id: container.stage_id.clone(),
                    container_id: container.container_id.clone(),
                    execute_count: count,
                    status: container.status,
                    variables: HashMap::new(),
                    timestamps: HashMap::new(),
                    start_time: None,
                    end_time: None,
                },
            );
            t.containers
                .insert((build_id, container.container_id.clone()), container.clone());
        }
        for task in &graph.tasks {
            t.task_records.insert(
                (build_id, task.task_id.clone(), count),
                TaskRecord::snapshot(task, count, task.status),
            );
            t.tasks.insert((build_id, task.task_id.clone()), task.clone());
        }
        Ok(())
    }

    async fn build_variables(&self, build_id: BuildId) -> Result<HashMap<String, String>> {
        Ok(self
            .read()?
            .builds
            .get(&build_id)
            .map(|b| b.variables.clone())
            .unwrap_or_default())
    }

    async fn get_task(&self, build_id: BuildId, task_id: &TaskId) -> Result<Option<BuildTask>> {
        Ok(self.read()?.tasks.get(&(build_id, task_id.clone())).cloned())
    }

    async fn get_task_by_step(&self, build_id: BuildId, step_id: &str) -> Result<Option<BuildTask>> {
        Ok(self
            .read()?
            .tasks
            .values()
            .find(|t| t.build_id == build_id && t.step_id.as_deref() == Some(step_id))
            .cloned())
    }

    async fn list_container_tasks(
        &self,
        build_id: BuildId,
        container_id: &ContainerId,
    ) -> Result<Vec<BuildTask>> {
        Ok(self.read()?.container_tasks(build_id, container_id))
    }

    async fn get_container(
        &self,
        build_id: BuildId,
        container_id: &ContainerId,
    ) -> Result<Option<BuildContainer>> {
        Ok(self
            .read()?
            .containers
            .get(&(build_id, container_id.clone()))
            .cloned())
    }

    async fn get_task_record(
        &self,
        build_id: BuildId,
        task_id: &TaskId,
        execute_count: u32,
    ) -> Result<Option<TaskRecord>> {
        Ok(self
            .read()?
            .task_records
            .get(&(build_id, task_id.clone(), execute_count))
            .cloned())
    }

    async fn list_task_records(&self, build_id: BuildId, task_id: &TaskId) -> Result<Vec<TaskRecord>> {
        let mut records: Vec<TaskRecord> = self
            .read()?
            .task_records
            .values()
            .filter(|r| r.build_id == build_id && &r.task_id == task_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.execute_count);
        Ok(records)
    }

    async fn get_container_record(
        &self,
        build_id: BuildId,
        container_id: &ContainerId,
        execute_count: u32,
    ) -> Result<Option<ContainerRecord>> {
        Ok(self
            .read()?
            .container_records
            .get(&(build_id, container_id.clone(), execute_count))
            .cloned())
    }

    async fn update_task_status(&self, update: &TaskStatusUpdate) -> Result<TaskUpdateOutcome> {
        let mut t = self.write()?;
        let key = (update.build_id, update.task_id.clone(), update.execute_count);
        let Some(mut record) = t.task_records.get(&key).cloned() else {
            return Ok(TaskUpdateOutcome::Missing);
        };
        let transition = match record.apply(update, Utc::now()) {
            Ok(transition) => transition,
            Err(regression) => return Ok(TaskUpdateOutcome::Rejected(regression)),
        };

        let mut impacted = Vec::new();
        if let Some(status) = update.status.filter(|s| matches!(s, BuildStatus::Canceled | BuildStatus::Skip))
            && let Some(current) = t.tasks.get(&(update.build_id, update.task_id.clone())).cloned()
            && let Some(container) = t
                .containers
                .get(&(update.build_id, current.container_id.clone()))
                .cloned()
        {
            let tasks = t.container_tasks(update.build_id, &current.container_id);
            impacted = record::sibling_impact(&tasks, &current, &container, status, update.execute_count);
            for info in impacted.iter().filter(|i| i.status == BuildStatus::Unexec) {
                if let Some(sibling) = t.task_records.get_mut(&(
                    update.build_id,
                    info.task_id.clone(),
                    update.execute_count,
                )) {
                    sibling.status = BuildStatus::Unexec;
                }
                if let Some(live) = t.tasks.get_mut(&(update.build_id, info.task_id.clone())) {
                    live.status = BuildStatus::Unexec;
                }
            }
            debug!(build_id = %update.build_id, task_id = %update.task_id, impacted = impacted.len(), "Sibling impact applied");
        }

        // The live row follows the record of its current attempt only.
        if let Some(live) = t.tasks.get_mut(&(update.build_id, update.task_id.clone()))
            && live.execute_count == update.execute_count
        {
            live.status = record.status;
            live.start_time = record.start_time;
            live.end_time = record.end_time;
        }
        t.task_records.insert(key, record.clone());
        Ok(TaskUpdateOutcome::Applied {
            record,
            transition,
            impacted,
        })
    }

    async fn update_container_status(&self, update: &ContainerStatusUpdate) -> Result<bool> {
        let mut t = self.write()?;
        let now = Utc::now();
        let Some(container) = t
            .containers
            .get_mut(&(update.build_id, update.container_id.clone()))
        else {
            return Ok(false);
        };
        if !record::apply_timing(
            &mut container.status,
            &mut container.start_time,
            &mut container.end_time,
            update.status,
            now,
        ) {
            return Ok(false);
        }
        if let Some(rec) = t.container_records.get_mut(&(
            update.build_id,
            update.container_id.clone(),
            update.execute_count,
        )) {
            record::apply_timing(&mut rec.status, &mut rec.start_time, &mut rec.end_time, update.status, now);
        }
        Ok(true)
    }

    async fn update_stage_status(&self, update: &StageStatusUpdate) -> Result<bool> {
        let mut t = self.write()?;
        let now = Utc::now();
        let Some(stage) = t.stages.get_mut(&(update.build_id, update.stage_id.clone())) else {
            return Ok(false);
        };
        if !record::apply_timing(
            &mut stage.status,
            &mut stage.start_time,
            &mut stage.end_time,
            update.status,
            now,
        ) {
            return Ok(false);
        }
        if let Some(rec) = t.stage_records.get_mut(&(
            update.build_id,
            update.stage_id.clone(),
            update.execute_count,
        )) {
            record::apply_timing(&mut rec.status, &mut rec.start_time, &mut rec.end_time, update.status, now);
        }
        Ok(true)
    }

    async fn apply_retry(&self, plan: &RetryPlan) -> Result<()> {
        let mut t = self.write()?;
        let build_id = plan.build_id;

        // Validate everything before the first write.
        if !t.containers.contains_key(&(build_id, plan.container_id.clone())) {
            return Err(Error::Database(format!(
                "container {} of build {build_id} not found",
                plan.container_id
            )));
        }
        if let Some(missing) = plan
            .task_resets
            .iter()
            .find(|r| !t.tasks.contains_key(&(build_id, r.task_id.clone())))
        {
            return Err(Error::Database(format!(
                "task {} of build {build_id} not found",
                missing.task_id
            )));
        }

        for reset in &plan.task_resets {
            if let Some(task) = t.tasks.get_mut(&(build_id, reset.task_id.clone())) {
                task.status = reset.status;
                task.execute_count = plan.execute_count;
                task.start_time = None;
                task.end_time = None;
            }
        }
        for rec in &plan.task_records {
            t.task_records
                .insert((build_id, rec.task_id.clone(), rec.execute_count), rec.clone());
        }
        t.container_records.insert(
            (build_id, plan.container_id.clone(), plan.execute_count),
            plan.container_record.clone(),
        );
        if let Some(container) = t.containers.get_mut(&(build_id, plan.container_id.clone())) {
            container.status = BuildStatus::Queue;
            container.execute_count = plan.execute_count;
            container.start_time = None;
            container.end_time = None;
        }
        if let Some(build) = t.builds.get_mut(&build_id) {
            build.execute_count = build.execute_count.max(plan.execute_count);
        }
        Ok(())
    }
}

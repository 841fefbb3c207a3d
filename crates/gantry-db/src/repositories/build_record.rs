//! PostgreSQL implementation of BuildRecordRepository.
//!
//! Mutations of one build serialize on a transaction-scoped advisory lock
//! keyed by the build id; the lock and the writes commit together.

use async_trait::async_trait;
use chrono::Utc;
use gantry_core::build::{BuildContainer, BuildGraph, JobControlOptions};
use gantry_core::ids::*;
use gantry_core::ports::BuildRecordRepository;
use gantry_core::record::{
    self, ContainerRecord, ContainerStatusUpdate, RetryPlan, StageStatusUpdate, TaskRecord,
    TaskStatusUpdate, TaskUpdateOutcome, Timestamps,
};
use gantry_core::task::{BuildTask, PostTaskInfo, TaskKind, TaskOptions};
use gantry_core::{BuildStatus, Error, Result};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::HashMap;
use tracing::debug;

const TASK_COLUMNS: &str = "build_id, task_id, project_id, pipeline_id, stage_id, container_id, step_id, task_name, task_seq, kind, status, execute_count, options, post_info, start_time, end_time";
const TASK_RECORD_COLUMNS: &str = "build_id, task_id, execute_count, stage_id, container_id, task_seq, status, variables, timestamps, start_time, end_time";
const CONTAINER_COLUMNS: &str = "build_id, container_id, stage_id, seq, status, execute_count, contains_post_tasks, options, start_time, end_time";
const CONTAINER_RECORD_COLUMNS: &str = "build_id, container_id, execute_count, stage_id, status, variables, timestamps, start_time, end_time";

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn parse_status(r: &PgRow) -> Result<BuildStatus> {
    r.get::<String, _>("status").parse()
}

fn row_to_task(r: &PgRow) -> Result<BuildTask> {
    Ok(BuildTask {
        project_id: ProjectId::new(r.get::<String, _>("project_id")),
        pipeline_id: PipelineId::new(r.get::<String, _>("pipeline_id")),
        build_id: BuildId::from_uuid(r.get("build_id")),
        stage_id: StageId::new(r.get::<String, _>("stage_id")),
        container_id: ContainerId::new(r.get::<String, _>("container_id")),
        task_id: TaskId::new(r.get::<String, _>("task_id")),
        step_id: r.get("step_id"),
        task_name: r.get("task_name"),
        task_seq: r.get::<i32, _>("task_seq") as u32,
        kind: r.get::<Json<TaskKind>, _>("kind").0,
        status: parse_status(r)?,
        execute_count: r.get::<i32, _>("execute_count") as u32,
        options: r.get::<Json<TaskOptions>, _>("options").0,
        post_info: r
            .get::<Option<Json<PostTaskInfo>>, _>("post_info")
            .map(|j| j.0),
        start_time: r.get("start_time"),
        end_time: r.get("end_time"),
    })
}

fn row_to_task_record(r: &PgRow) -> Result<TaskRecord> {
    Ok(TaskRecord {
        build_id: BuildId::from_uuid(r.get("build_id")),
        stage_id: StageId::new(r.get::<String, _>("stage_id")),
        container_id: ContainerId::new(r.get::<String, _>("container_id")),
        task_id: TaskId::new(r.get::<String, _>("task_id")),
        execute_count: r.get::<i32, _>("execute_count") as u32,
        task_seq: r.get::<i32, _>("task_seq") as u32,
        status: parse_status(r)?,
        variables: r.get::<Json<HashMap<String, Value>>, _>("variables").0,
        timestamps: r.get::<Json<Timestamps>, _>("timestamps").0,
        start_time: r.get("start_time"),
        end_time: r.get("end_time"),
    })
}

fn row_to_container(r: &PgRow) -> Result<BuildContainer> {
    Ok(BuildContainer {
        build_id: BuildId::from_uuid(r.get("build_id")),
        stage_id: StageId::new(r.get::<String, _>("stage_id")),
        container_id: ContainerId::new(r.get::<String, _>("container_id")),
        seq: r.get::<i32, _>("seq") as u32,
        status: parse_status(r)?,
        execute_count: r.get::<i32, _>("execute_count") as u32,
        contains_post_tasks: r.get("contains_post_tasks"),
        options: r.get::<Json<JobControlOptions>, _>("options").0,
        start_time: r.get("start_time"),
        end_time: r.get("end_time"),
    })
}

fn row_to_container_record(r: &PgRow) -> Result<ContainerRecord> {
    Ok(ContainerRecord {
        build_id: BuildId::from_uuid(r.get("build_id")),
        stage_id: StageId::new(r.get::<String, _>("stage_id")),
        container_id: ContainerId::new(r.get::<String, _>("container_id")),
        execute_count: r.get::<i32, _>("execute_count") as u32,
        status: parse_status(r)?,
        variables: r.get::<Json<HashMap<String, Value>>, _>("variables").0,
        timestamps: r.get::<Json<Timestamps>, _>("timestamps").0,
        start_time: r.get("start_time"),
        end_time: r.get("end_time"),
    })
}

pub struct PgBuildRecordRepository {
    pool: PgPool,
}

impl PgBuildRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_build(conn: &mut PgConnection, build_id: BuildId) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(build_id.to_string())
            .execute(conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn container_tasks(
        conn: &mut PgConnection,
        build_id: BuildId,
        container_id: &ContainerId,
    ) -> Result<Vec<BuildTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM build_tasks WHERE build_id = $1 AND container_id = $2 ORDER BY task_seq"
        ))
        .bind(build_id.as_uuid())
        .bind(container_id.as_str())
        .fetch_all(conn)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn insert_task_record(conn: &mut PgConnection, rec: &TaskRecord) -> Result<()> {
        sqlx::query("INSERT INTO record_tasks (build_id, task_id, execute_count, stage_id, container_id, task_seq, status, variables, timestamps, start_time, end_time) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) ON CONFLICT (build_id, task_id, execute_count) DO UPDATE SET status = EXCLUDED.status, variables = EXCLUDED.variables, timestamps = EXCLUDED.timestamps, start_time = EXCLUDED.start_time, end_time = EXCLUDED.end_time")
            .bind(rec.build_id.as_uuid())
            .bind(rec.task_id.as_str())
            .bind(rec.execute_count as i32)
            .bind(rec.stage_id.as_str())
            .bind(rec.container_id.as_str())
            .bind(rec.task_seq as i32)
            .bind(rec.status.as_str())
            .bind(Json(&rec.variables))
            .bind(Json(&rec.timestamps))
            .bind(rec.start_time)
            .bind(rec.end_time)
            .execute(conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_container_record(conn: &mut PgConnection, rec: &ContainerRecord) -> Result<()> {
        sqlx::query("INSERT INTO record_containers (build_id, container_id, execute_count, stage_id, status, variables, timestamps, start_time, end_time) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT (build_id, container_id, execute_count) DO UPDATE SET status = EXCLUDED.status, variables = EXCLUDED.variables, timestamps = EXCLUDED.timestamps, start_time = EXCLUDED.start_time, end_time = EXCLUDED.end_time")
            .bind(rec.build_id.as_uuid())
            .bind(rec.container_id.as_str())
            .bind(rec.execute_count as i32)
            .bind(rec.stage_id.as_str())
            .bind(rec.status.as_str())
            .bind(Json(&rec.variables))
            .bind(Json(&rec.timestamps))
            .bind(rec.start_time)
            .bind(rec.end_time)
            .execute(conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl BuildRecordRepository for PgBuildRecordRepository {
    async fn save_build(&self, graph: &BuildGraph) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let build = &graph.build;
        let count = build.execute_count as i32;

        sqlx::query("INSERT INTO builds (build_id, project_id, pipeline_id, execute_count, status, variables, start_time, end_time) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)")
            .bind(build.build_id.as_uuid())
            .bind(build.project_id.as_str())
            .bind(build.pipeline_id.as_str())
            .bind(count)
            .bind(build.status.as_str())
            .bind(Json(&build.variables))
            .bind(build.start_time)
            .bind(build.end_time)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for stage in &graph.stages {
            sqlx::query("INSERT INTO build_stages (build_id, stage_id, seq, status, execute_count, options) VALUES ($1, $2, $3, $4, $5, $6)")
                .bind(stage.build_id.as_uuid())
                .bind(stage.stage_id.as_str())
                .bind(stage.seq as i32)
                .bind(stage.status.as_str())
                .bind(stage.execute_count as i32)
                .bind(Json(&stage.options))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("INSERT INTO record_stages (build_id, stage_id, execute_count, status) VALUES ($1, $2, $3, $4)")
                .bind(stage.build_id.as_uuid())
                .bind(stage.stage_id.as_str())
                .bind(count)
                .bind(stage.status.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        for container in &graph.containers {
            sqlx::query("INSERT INTO build_containers (build_id, container_id, stage_id, seq, status, execute_count, contains_post_tasks, options) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)")
                .bind(container.build_id.as_uuid())
                .bind(container.container_id.as_str())
                .bind(container.stage_id.as_str())
                .bind(container.seq as i32)
                .bind(container.status.as_str())
                .bind(container.execute_count as i32)
                .bind(container.contains_post_tasks)
                .bind(Json(&container.options))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("INSERT INTO record_containers (build_id, container_id, execute_count, stage_id, status) VALUES ($1, $2, $3, $4, $5)")
                .bind(container.build_id.as_uuid())
                .bind(container.container_id.as_str())
                .bind(count)
                .bind(container.stage_id.as_str())
                .bind(container.status.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        for task in &graph.tasks {
            sqlx::query("INSERT INTO build_tasks (build_id, task_id, project_id, pipeline_id, stage_id, container_id, step_id, task_name, task_seq, kind, status, execute_count, options, post_info) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)")
                .bind(task.build_id.as_uuid())
                .bind(task.task_id.as_str())
                .bind(task.project_id.as_str())
                .bind(task.pipeline_id.as_str())
                .bind(task.stage_id.as_str())
                .bind(task.container_id.as_str())
                .bind(&task.step_id)
                .bind(&task.task_name)
                .bind(task.task_seq as i32)
                .bind(Json(&task.kind))
                .bind(task.status.as_str())
                .bind(task.execute_count as i32)
                .bind(Json(&task.options))
                .bind(task.post_info.as_ref().map(Json))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            Self::insert_task_record(
                &mut tx,
                &TaskRecord::snapshot(task, build.execute_count, task.status),
            )
            .await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn build_variables(&self, build_id: BuildId) -> Result<HashMap<String, String>> {
        let row = sqlx::query("SELECT variables FROM builds WHERE build_id = $1")
            .bind(build_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row
            .map(|r| r.get::<Json<HashMap<String, String>>, _>("variables").0)
            .unwrap_or_default())
    }

    async fn get_task(&self, build_id: BuildId, task_id: &TaskId) -> Result<Option<BuildTask>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM build_tasks WHERE build_id = $1 AND task_id = $2"
        ))
        .bind(build_id.as_uuid())
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn get_task_by_step(&self, build_id: BuildId, step_id: &str) -> Result<Option<BuildTask>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM build_tasks WHERE build_id = $1 AND step_id = $2 LIMIT 1"
        ))
        .bind(build_id.as_uuid())
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn list_container_tasks(
        &self,
        build_id: BuildId,
        container_id: &ContainerId,
    ) -> Result<Vec<BuildTask>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        Self::container_tasks(&mut conn, build_id, container_id).await
    }

    async fn get_container(
        &self,
        build_id: BuildId,
        container_id: &ContainerId,
    ) -> Result<Option<BuildContainer>> {
        let row = sqlx::query(&format!(
            "SELECT {CONTAINER_COLUMNS} FROM build_containers WHERE build_id = $1 AND container_id = $2"
        ))
        .bind(build_id.as_uuid())
        .bind(container_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_container).transpose()
    }

    async fn get_task_record(
        &self,
        build_id: BuildId,
        task_id: &TaskId,
        execute_count: u32,
    ) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_RECORD_COLUMNS} FROM record_tasks WHERE build_id = $1 AND task_id = $2 AND execute_count = $3"
        ))
        .bind(build_id.as_uuid())
        .bind(task_id.as_str())
        .bind(execute_count as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_task_record).transpose()
    }

    async fn list_task_records(&self, build_id: BuildId, task_id: &TaskId) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_RECORD_COLUMNS} FROM record_tasks WHERE build_id = $1 AND task_id = $2 ORDER BY execute_count"
        ))
        .bind(build_id.as_uuid())
        .bind(task_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_task_record).collect()
    }

    async fn get_container_record(
        &self,
        build_id: BuildId,
        container_id: &ContainerId,
        execute_count: u32,
    ) -> Result<Option<ContainerRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {CONTAINER_RECORD_COLUMNS} FROM record_containers WHERE build_id = $1 AND container_id = $2 AND execute_count = $3"
        ))
        .bind(build_id.as_uuid())
        .bind(container_id.as_str())
        .bind(execute_count as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_container_record).transpose()
    }

    async fn update_task_status(&self, update: &TaskStatusUpdate) -> Result<TaskUpdateOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::lock_build(&mut tx, update.build_id).await?;

        let row = sqlx::query(&format!(
            "SELECT {TASK_RECORD_COLUMNS} FROM record_tasks WHERE build_id = $1 AND task_id = $2 AND execute_count = $3 FOR UPDATE"
        ))
        .bind(update.build_id.as_uuid())
        .bind(update.task_id.as_str())
        .bind(update.execute_count as i32)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(TaskUpdateOutcome::Missing);
        };
        let mut rec = row_to_task_record(&row)?;
        let transition = match rec.apply(update, Utc::now()) {
            Ok(transition) => transition,
            Err(regression) => return Ok(TaskUpdateOutcome::Rejected(regression)),
        };

        let mut impacted = Vec::new();
        if let Some(status) = update
            .status
            .filter(|s| matches!(s, BuildStatus::Canceled | BuildStatus::Skip))
        {
            let tasks = Self::container_tasks(&mut tx, update.build_id, &rec.container_id).await?;
            let container = sqlx::query(&format!(
                "SELECT {CONTAINER_COLUMNS} FROM build_containers WHERE build_id = $1 AND container_id = $2"
            ))
            .bind(update.build_id.as_uuid())
            .bind(rec.container_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            if let Some(container) = container.as_ref().map(row_to_container).transpose()?
                && let Some(current) = tasks.iter().find(|t| t.task_id == update.task_id)
            {
                impacted = record::sibling_impact(&tasks, current, &container, status, update.execute_count);
                let unexec: Vec<String> = impacted
                    .iter()
                    .filter(|i| i.status == BuildStatus::Unexec)
                    .map(|i| i.task_id.to_string())
                    .collect();
                if !unexec.is_empty() {
                    sqlx::query("UPDATE record_tasks SET status = $1 WHERE build_id = $2 AND execute_count = $3 AND task_id = ANY($4)")
                        .bind(BuildStatus::Unexec.as_str())
                        .bind(update.build_id.as_uuid())
                        .bind(update.execute_count as i32)
                        .bind(&unexec)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;
                    sqlx::query("UPDATE build_tasks SET status = $1 WHERE build_id = $2 AND execute_count = $3 AND task_id = ANY($4)")
                        .bind(BuildStatus::Unexec.as_str())
                        .bind(update.build_id.as_uuid())
                        .bind(update.execute_count as i32)
                        .bind(&unexec)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;
                }
                debug!(build_id = %update.build_id, task_id = %update.task_id, impacted = impacted.len(), "Sibling impact applied");
            }
        }

        sqlx::query("UPDATE record_tasks SET status = $4, variables = $5, timestamps = $6, start_time = $7, end_time = $8 WHERE build_id = $1 AND task_id = $2 AND execute_count = $3")
            .bind(update.build_id.as_uuid())
            .bind(update.task_id.as_str())
            .bind(update.execute_count as i32)
            .bind(rec.status.as_str())
            .bind(Json(&rec.variables))
            .bind(Json(&rec.timestamps))
            .bind(rec.start_time)
            .bind(rec.end_time)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        // The live row follows the record of its current attempt only.
        sqlx::query("UPDATE build_tasks SET status = $4, start_time = $5, end_time = $6 WHERE build_id = $1 AND task_id = $2 AND execute_count = $3")
            .bind(update.build_id.as_uuid())
            .bind(update.task_id.as_str())
            .bind(update.execute_count as i32)
            .bind(rec.status.as_str())
            .bind(rec.start_time)
            .bind(rec.end_time)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(TaskUpdateOutcome::Applied {
            record: rec,
            transition,
            impacted,
        })
    }

    async fn update_container_status(&self, update: &ContainerStatusUpdate) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::lock_build(&mut tx, update.build_id).await?;
        let now = Utc::now();

        let row = sqlx::query("SELECT status, start_time, end_time FROM build_containers WHERE build_id = $1 AND container_id = $2 FOR UPDATE")
            .bind(update.build_id.as_uuid())
            .bind(update.container_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(false);
        };
        let (mut status, mut start, mut end) = (parse_status(&row)?, row.get("start_time"), row.get("end_time"));
        if !record::apply_timing(&mut status, &mut start, &mut end, update.status, now) {
            return Ok(false);
        }
        sqlx::query("UPDATE build_containers SET status = $3, start_time = $4, end_time = $5 WHERE build_id = $1 AND container_id = $2")
            .bind(update.build_id.as_uuid())
            .bind(update.container_id.as_str())
            .bind(status.as_str())
            .bind(start)
            .bind(end)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let row = sqlx::query("SELECT status, start_time, end_time FROM record_containers WHERE build_id = $1 AND container_id = $2 AND execute_count = $3 FOR UPDATE")
            .bind(update.build_id.as_uuid())
            .bind(update.container_id.as_str())
            .bind(update.execute_count as i32)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if let Some(row) = row {
            let (mut status, mut start, mut end) = (parse_status(&row)?, row.get("start_time"), row.get("end_time"));
            if record::apply_timing(&mut status, &mut start, &mut end, update.status, now) {
                sqlx::query("UPDATE record_containers SET status = $4, start_time = $5, end_time = $6 WHERE build_id = $1 AND container_id = $2 AND execute_count = $3")
                    .bind(update.build_id.as_uuid())
                    .bind(update.container_id.as_str())
                    .bind(update.execute_count as i32)
                    .bind(status.as_str())
                    .bind(start)
                    .bind(end)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn update_stage_status(&self, update: &StageStatusUpdate) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::lock_build(&mut tx, update.build_id).await?;
        let now = Utc::now();

        let row = sqlx::query("SELECT status, start_time, end_time FROM build_stages WHERE build_id = $1 AND stage_id = $2 FOR UPDATE")
            .bind(update.build_id.as_uuid())
            .bind(update.stage_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(false);
        };
        let (mut status, mut start, mut end) = (parse_status(&row)?, row.get("start_time"), row.get("end_time"));
        if !record::apply_timing(&mut status, &mut start, &mut end, update.status, now) {
            return Ok(false);
        }
        sqlx::query("UPDATE build_stages SET status = $3, start_time = $4, end_time = $5 WHERE build_id = $1 AND stage_id = $2")
            .bind(update.build_id.as_uuid())
            .bind(update.stage_id.as_str())
            .bind(status.as_str())
            .bind(start)
            .bind(end)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE record_stages SET status = $4, start_time = COALESCE(start_time, $5), end_time = COALESCE(end_time, $6) WHERE build_id = $1 AND stage_id = $2 AND execute_count = $3")
            .bind(update.build_id.as_uuid())
            .bind(update.stage_id.as_str())
            .bind(update.execute_count as i32)
            .bind(status.as_str())
            .bind(start)
            .bind(end)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn apply_retry(&self, plan: &RetryPlan) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::lock_build(&mut tx, plan.build_id).await?;

        for reset in &plan.task_resets {
            let updated = sqlx::query("UPDATE build_tasks SET status = $3, execute_count = $4, start_time = NULL, end_time = NULL WHERE build_id = $1 AND task_id = $2")
                .bind(plan.build_id.as_uuid())
                .bind(reset.task_id.as_str())
                .bind(reset.status.as_str())
                .bind(plan.execute_count as i32)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            if updated.rows_affected() == 0 {
                // Dropping the transaction rolls back the resets done so far.
                return Err(Error::Database(format!(
                    "task {} of build {} not found",
                    reset.task_id, plan.build_id
                )));
            }
        }
        for rec in &plan.task_records {
            Self::insert_task_record(&mut tx, rec).await?;
        }
        Self::insert_container_record(&mut tx, &plan.container_record).await?;

        let updated = sqlx::query("UPDATE build_containers SET status = $3, execute_count = $4, start_time = NULL, end_time = NULL WHERE build_id = $1 AND container_id = $2")
            .bind(plan.build_id.as_uuid())
            .bind(plan.container_id.as_str())
            .bind(BuildStatus::Queue.as_str())
            .bind(plan.execute_count as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(Error::Database(format!(
                "container {} of build {} not found",
                plan.container_id, plan.build_id
            )));
        }
        sqlx::query("UPDATE builds SET execute_count = GREATEST(execute_count, $2) WHERE build_id = $1")
            .bind(plan.build_id.as_uuid())
            .bind(plan.execute_count as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

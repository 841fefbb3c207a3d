//! PostgreSQL implementation of DispatchBuildRepository.

use async_trait::async_trait;
use gantry_core::dispatch::{BuildHistory, BuilderState, BuilderStatus, DispatchType};
use gantry_core::ids::{BuildId, PipelineId, ProjectId};
use gantry_core::ports::DispatchBuildRepository;
use gantry_core::{Error, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

const HISTORY_COLUMNS: &str =
    "dispatch_type, project_id, pipeline_id, build_id, vm_seq_id, container_name, created_at";
const BUILDER_COLUMNS: &str = "dispatch_type, project_id, pipeline_id, vm_seq_id, pool_no, builder_name, status, debug_status, updated_at";

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn parse_type(r: &PgRow) -> Result<DispatchType> {
    let s: String = r.get("dispatch_type");
    DispatchType::parse(&s).ok_or_else(|| Error::UnsupportedDispatchType(s))
}

fn row_to_history(r: &PgRow) -> Result<BuildHistory> {
    Ok(BuildHistory {
        dispatch_type: parse_type(r)?,
        project_id: ProjectId::new(r.get::<String, _>("project_id")),
        pipeline_id: PipelineId::new(r.get::<String, _>("pipeline_id")),
        build_id: BuildId::from_uuid(r.get("build_id")),
        vm_seq_id: r.get("vm_seq_id"),
        container_name: r.get("container_name"),
        created_at: r.get("created_at"),
    })
}

fn row_to_builder(r: &PgRow) -> Result<BuilderState> {
    Ok(BuilderState {
        dispatch_type: parse_type(r)?,
        project_id: ProjectId::new(r.get::<String, _>("project_id")),
        pipeline_id: PipelineId::new(r.get::<String, _>("pipeline_id")),
        vm_seq_id: r.get("vm_seq_id"),
        pool_no: r.get::<i32, _>("pool_no") as u32,
        builder_name: r.get("builder_name"),
        status: BuilderStatus::from_i16(r.get("status")),
        debug_status: r.get("debug_status"),
        updated_at: r.get("updated_at"),
    })
}

pub struct PgDispatchBuildRepository {
    pool: PgPool,
}

impl PgDispatchBuildRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DispatchBuildRepository for PgDispatchBuildRepository {
    async fn record_history(&self, history: &BuildHistory) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO dispatch_build_history ({HISTORY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(history.dispatch_type.as_str())
        .bind(history.project_id.as_str())
        .bind(history.pipeline_id.as_str())
        .bind(history.build_id.as_uuid())
        .bind(&history.vm_seq_id)
        .bind(&history.container_name)
        .bind(history.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn history_for_build(
        &self,
        dispatch_type: DispatchType,
        build_id: BuildId,
        vm_seq_id: &str,
    ) -> Result<Option<BuildHistory>> {
        let row = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM dispatch_build_history WHERE dispatch_type = $1 AND build_id = $2 AND vm_seq_id = $3 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(dispatch_type.as_str())
        .bind(build_id.as_uuid())
        .bind(vm_seq_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_history).transpose()
    }

    async fn latest_history(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
    ) -> Result<Option<BuildHistory>> {
        let row = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM dispatch_build_history WHERE dispatch_type = $1 AND pipeline_id = $2 AND vm_seq_id = $3 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(dispatch_type.as_str())
        .bind(pipeline_id.as_str())
        .bind(vm_seq_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_history).transpose()
    }

    async fn save_builder(&self, builder: &BuilderState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_builders (dispatch_type, project_id, pipeline_id, vm_seq_id, pool_no, builder_name, status, debug_status, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (dispatch_type, pipeline_id, vm_seq_id, pool_no) DO UPDATE SET
                project_id = EXCLUDED.project_id,
                builder_name = EXCLUDED.builder_name,
                status = EXCLUDED.status,
                debug_status = EXCLUDED.debug_status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(builder.dispatch_type.as_str())
        .bind(builder.project_id.as_str())
        .bind(builder.pipeline_id.as_str())
        .bind(&builder.vm_seq_id)
        .bind(builder.pool_no as i32)
        .bind(&builder.builder_name)
        .bind(builder.status.as_i16())
        .bind(builder.debug_status)
        .bind(builder.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_builder(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        builder_name: &str,
    ) -> Result<Option<BuilderState>> {
        let row = sqlx::query(&format!(
            "SELECT {BUILDER_COLUMNS} FROM dispatch_builders WHERE dispatch_type = $1 AND pipeline_id = $2 AND vm_seq_id = $3 AND builder_name = $4 LIMIT 1"
        ))
        .bind(dispatch_type.as_str())
        .bind(pipeline_id.as_str())
        .bind(vm_seq_id)
        .bind(builder_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_builder).transpose()
    }

    async fn find_debugging_builder(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
    ) -> Result<Option<BuilderState>> {
        let row = sqlx::query(&format!(
            "SELECT {BUILDER_COLUMNS} FROM dispatch_builders WHERE dispatch_type = $1 AND pipeline_id = $2 AND vm_seq_id = $3 AND debug_status ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(dispatch_type.as_str())
        .bind(pipeline_id.as_str())
        .bind(vm_seq_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_builder).transpose()
    }

    async fn set_debug_status(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        builder_name: &str,
        debug: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE dispatch_builders SET debug_status = $5, updated_at = NOW() WHERE dispatch_type = $1 AND pipeline_id = $2 AND vm_seq_id = $3 AND builder_name = $4",
        )
        .bind(dispatch_type.as_str())
        .bind(pipeline_id.as_str())
        .bind(vm_seq_id)
        .bind(builder_name)
        .bind(debug)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn clear_debug_status(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        builder_name: &str,
    ) -> Result<Option<BuilderState>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(&format!(
            "SELECT {BUILDER_COLUMNS} FROM dispatch_builders WHERE dispatch_type = $1 AND pipeline_id = $2 AND vm_seq_id = $3 AND builder_name = $4 LIMIT 1 FOR UPDATE"
        ))
        .bind(dispatch_type.as_str())
        .bind(pipeline_id.as_str())
        .bind(vm_seq_id)
        .bind(builder_name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let before = row_to_builder(&row)?;

        sqlx::query(
            "UPDATE dispatch_builders SET debug_status = FALSE, updated_at = NOW() WHERE dispatch_type = $1 AND pipeline_id = $2 AND vm_seq_id = $3 AND pool_no = $4",
        )
        .bind(dispatch_type.as_str())
        .bind(pipeline_id.as_str())
        .bind(vm_seq_id)
        .bind(before.pool_no as i32)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(Some(before))
    }

    async fn delete_builder(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        pool_no: u32,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM dispatch_builders WHERE dispatch_type = $1 AND pipeline_id = $2 AND vm_seq_id = $3 AND pool_no = $4",
        )
        .bind(dispatch_type.as_str())
        .bind(pipeline_id.as_str())
        .bind(vm_seq_id)
        .bind(pool_no as i32)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

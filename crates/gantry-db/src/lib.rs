//! Storage layer for Gantry: PostgreSQL repositories plus in-memory
//! equivalents with the same atomicity guarantees.

pub mod memory;
pub mod repositories;

pub use repositories::*;

use gantry_core::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared PostgreSQL pool handing out the repositories.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(|e| Error::Database(format!("connect: {e}")))?;
        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("migrate: {e}")))
    }

    pub fn build_records(&self) -> PgBuildRecordRepository {
        PgBuildRecordRepository::new(self.pool.clone())
    }

    pub fn agents(&self) -> PgAgentRepository {
        PgAgentRepository::new(self.pool.clone())
    }

    pub fn dispatch_builds(&self) -> PgDispatchBuildRepository {
        PgDispatchBuildRepository::new(self.pool.clone())
    }
}

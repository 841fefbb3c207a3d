//! PostgreSQL repository implementations.

mod agent;
mod build_record;
mod dispatch;

pub use agent::PgAgentRepository;
pub use build_record::PgBuildRecordRepository;
pub use dispatch::PgDispatchBuildRepository;

//! In-memory repositories for tests and single-node development.
//!
//! Each repository keeps its tables behind one lock and performs every
//! read-modify-write while holding it, which gives the same atomicity as
//! the PostgreSQL transactions.

mod agents;
mod builds;
mod dispatch;

pub use agents::MemoryAgentRepository;
pub use builds::MemoryBuildRecordRepository;
pub use dispatch::MemoryDispatchBuildRepository;

use gantry_core::Error;

fn poisoned<T>(_: T) -> Error {
    Error::Internal("storage lock poisoned".to_string())
}

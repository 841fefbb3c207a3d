//! Build execution control and executor lifecycle for Gantry.
//!
//! Services here decide whether work runs, persist status changes through
//! the repository ports, and manage the agents and containers that run
//! the work.

pub mod agents;
pub mod condition;
pub mod config;
pub mod dispatch;
pub mod lock;
pub mod packages;
pub mod poll;
pub mod records;
pub mod retry;
pub mod secret;

pub use agents::{AgentLifecycleManager, AgentLink, UpgradeCheck};
pub use condition::{ConditionEvaluator, ConditionOutcome};
pub use config::EngineConfig;
pub use dispatch::{DebugTarget, DispatchResourceController};
pub use lock::ContainerLocks;
pub use packages::LocalPackageSource;
pub use poll::{PollPolicy, PollStep};
pub use records::{BuildRecordService, TaskEnd};
pub use retry::{RetryCoordinator, RetryOutcome, RetryRequest, SkipDecision};
pub use secret::SecretCipher;

//! NATS event bus for Gantry.

mod bus;
pub mod config;

pub use bus::NatsEventBus;
pub use config::NatsConfig;

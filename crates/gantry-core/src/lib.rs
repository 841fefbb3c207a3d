//! Gantry Core
//!
//! Core domain types, traits, and error handling for the Gantry build
//! execution engine. This crate has minimal dependencies and defines the
//! shared vocabulary used across all other crates.

pub mod agent;
pub mod build;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod expression;
pub mod ids;
pub mod interpolation;
pub mod ports;
pub mod record;
pub mod status;
pub mod task;

pub use error::{Error, Result};
pub use ids::*;
pub use status::BuildStatus;

//! Configuration for the NATS event bus.

use std::time::Duration;

/// Configuration for the NATS event bus.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URLs (comma-separated for cluster).
    pub urls: Vec<String>,
    /// Stream holding build and project events.
    pub stream_name: String,
    /// Subjects captured by the stream.
    pub subjects: Vec<String>,
    pub connection_timeout: Duration,
    /// Request timeout for JetStream operations.
    pub request_timeout: Duration,
    /// Maximum delivery attempts per consumer message.
    pub max_deliver: i64,
    /// Message retention period.
    pub max_age: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            stream_name: "GANTRY_EVENTS".to_string(),
            subjects: vec!["build.>".to_string(), "project.>".to_string()],
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            max_deliver: 3,
            max_age: Duration::from_secs(86400 * 3),
        }
    }
}

impl NatsConfig {
    /// Create a new config with a single URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn with_stream_name(mut self, name: impl Into<String>) -> Self {
        self.stream_name = name.into();
        self
    }

    pub fn with_max_deliver(mut self, max: i64) -> Self {
        self.max_deliver = max;
        self
    }
}

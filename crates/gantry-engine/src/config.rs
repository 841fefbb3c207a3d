//! Engine configuration.

use crate::poll::PollPolicy;
use gantry_core::dispatch::MAX_JOBS_PER_BUILD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Tunables of every engine service. Every field has a default so a
/// partial configuration file is enough.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

/// Container dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Ephemeral job containers one build may create per pod selector.
    #[serde(default = "default_job_quota")]
    pub job_quota: u32,
    /// Lifetime of a quota counter in seconds.
    #[serde(default = "default_quota_ttl")]
    pub quota_ttl_secs: u64,
    /// Lifetime of a cached debug builder name in seconds.
    #[serde(default = "default_debug_name_ttl")]
    pub debug_name_ttl_secs: u64,
}

fn default_job_quota() -> u32 {
    MAX_JOBS_PER_BUILD
}

fn default_quota_ttl() -> u64 {
    24 * 60 * 60
}

fn default_debug_name_ttl() -> u64 {
    60 * 60
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            job_quota: default_job_quota(),
            quota_ttl_secs: default_quota_ttl(),
            debug_name_ttl_secs: default_debug_name_ttl(),
        }
    }
}

impl DispatchConfig {
    pub fn quota_ttl(&self) -> Duration {
        Duration::from_secs(self.quota_ttl_secs)
    }

    pub fn debug_name_ttl(&self) -> Duration {
        Duration::from_secs(self.debug_name_ttl_secs)
    }
}

/// Operator retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Lifetime of a container lock in seconds, bounding a crashed holder.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    /// Pause between lock acquisition attempts in milliseconds.
    #[serde(default = "default_lock_retry_interval")]
    pub lock_retry_interval_ms: u64,
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,
}

fn default_lock_ttl() -> u64 {
    60
}

fn default_lock_retry_interval() -> u64 {
    100
}

fn default_lock_attempts() -> u32 {
    50
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl(),
            lock_retry_interval_ms: default_lock_retry_interval(),
            lock_attempts: default_lock_attempts(),
        }
    }
}

/// Third-party agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Lifetime of the last-heartbeat marker in seconds. An agent whose
    /// marker expired is considered offline.
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl_secs: u64,
    /// Longest value stored for a reported descriptive field.
    #[serde(default = "default_field_max_len")]
    pub field_max_len: usize,
    /// Gateway used when an agent is generated without a zone.
    #[serde(default = "default_gateway")]
    pub default_gateway: String,
    /// Gateways by zone name.
    #[serde(default)]
    pub zone_gateways: HashMap<String, String>,
    #[serde(default)]
    pub file_gateway: Option<String>,
}

fn default_heartbeat_ttl() -> u64 {
    10 * 60
}

fn default_field_max_len() -> usize {
    128
}

fn default_gateway() -> String {
    "http://localhost:8080".to_string()
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: default_heartbeat_ttl(),
            field_max_len: default_field_max_len(),
            default_gateway: default_gateway(),
            zone_gateways: HashMap::new(),
            file_gateway: None,
        }
    }
}

impl AgentsConfig {
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    /// Gateway for `zone`, falling back to the default one.
    pub fn gateway_for(&self, zone: Option<&str>) -> &str {
        zone.and_then(|z| self.zone_gateways.get(z))
            .map(String::as_str)
            .unwrap_or(&self.default_gateway)
    }
}

/// Bounded waits against executor platforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_poll_attempts")]
    pub max_attempts: u32,
}

fn default_poll_interval() -> u64 {
    3000
}

fn default_poll_attempts() -> u32 {
    100
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            max_attempts: default_poll_attempts(),
        }
    }
}

impl PollingConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(self.interval_ms), self.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dispatch.job_quota, 10);
        assert_eq!(config.dispatch.quota_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.agents.field_max_len, 128);
        assert_eq!(config.polling.policy().max_attempts, 100);
    }

    #[test]
    fn test_partial_document() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"polling": {"interval_ms": 10}}"#).unwrap();
        assert_eq!(config.polling.interval_ms, 10);
        assert_eq!(config.polling.max_attempts, 100);
        assert_eq!(config.retry.lock_ttl_secs, 60);
    }

    #[test]
    fn test_zone_gateway_fallback() {
        let mut agents = AgentsConfig::default();
        agents
            .zone_gateways
            .insert("shenzhen".into(), "http://sz.gateway".into());
        assert_eq!(agents.gateway_for(Some("shenzhen")), "http://sz.gateway");
        assert_eq!(agents.gateway_for(Some("unknown")), "http://localhost:8080");
        assert_eq!(agents.gateway_for(None), "http://localhost:8080");
    }
}

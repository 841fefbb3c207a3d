//! CLI configuration.
//!
//! Read from an optional `gantry.yaml` (or `--config`), then overridden by
//! `GANTRY__*` environment variables, e.g. `GANTRY__DATABASE_URL` or
//! `GANTRY__ENGINE__DISPATCH__JOB_QUOTA`. A `.env` file is loaded first.

use anyhow::{Context, Result};
use gantry_engine::{EngineConfig, SecretCipher};
use gantry_nats::NatsConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_nats_url")]
    pub nats_url: String,
    /// JetStream stream holding build and project events.
    #[serde(default = "default_nats_stream")]
    pub nats_stream: String,
    /// JetStream KV bucket backing the shared cache.
    #[serde(default = "default_kv_bucket")]
    pub kv_bucket: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Users holding API-operate permission on every project.
    #[serde(default)]
    pub operators: Vec<String>,
    /// Key material for agent secrets at rest.
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub packages: PackagesConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_database_url() -> String {
    "postgres://localhost/gantry".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_stream() -> String {
    "GANTRY_EVENTS".to_string()
}

fn default_kv_bucket() -> String {
    "gantry".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            nats_url: default_nats_url(),
            nats_stream: default_nats_stream(),
            kv_bucket: default_kv_bucket(),
            log_format: LogFormat::default(),
            operators: Vec::new(),
            secret_key: None,
            packages: PackagesConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Agent distributables offered for upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagesConfig {
    #[serde(default = "default_package_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub worker_version: String,
}

fn default_package_dir() -> PathBuf {
    PathBuf::from("packages")
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            dir: default_package_dir(),
            agent_version: String::new(),
            worker_version: String::new(),
        }
    }
}

impl CliConfig {
    /// Load configuration from file and environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("gantry").required(false),
        };
        config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("GANTRY")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("operators")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn nats(&self) -> NatsConfig {
        NatsConfig::new(&self.nats_url).with_stream_name(&self.nats_stream)
    }

    pub fn cipher(&self) -> Result<SecretCipher> {
        let key = self
            .secret_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .context("secret_key is not configured")?;
        Ok(SecretCipher::from_master_key(key))
    }

    /// The configuration as YAML, with the secret key masked.
    pub fn to_redacted_yaml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.secret_key.is_some() {
            shown.secret_key = Some("********".to_string());
        }
        Ok(serde_yaml::to_string(&shown)?)
    }
}

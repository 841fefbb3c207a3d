//! Agent distributables served from a local directory.

use async_trait::async_trait;
use gantry_core::agent::Os;
use gantry_core::ports::AgentPackageSource;
use gantry_core::Result;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Reads `agent-<os>.zip` from `dir`; versions come from configuration.
#[derive(Debug, Clone)]
pub struct LocalPackageSource {
    dir: PathBuf,
    agent_version: String,
    worker_version: String,
}

impl LocalPackageSource {
    pub fn new(dir: impl Into<PathBuf>, agent_version: impl Into<String>, worker_version: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            agent_version: agent_version.into(),
            worker_version: worker_version.into(),
        }
    }

    pub fn package_path(&self, os: Os) -> PathBuf {
        self.dir.join(format!("agent-{}.zip", os.as_str()))
    }
}

/// Hex SHA-256 of a distributable.
pub fn package_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[async_trait]
impl AgentPackageSource for LocalPackageSource {
    async fn agent_version(&self) -> Result<String> {
        Ok(self.agent_version.clone())
    }

    async fn worker_version(&self) -> Result<String> {
        Ok(self.worker_version.clone())
    }

    async fn package_digest(&self, os: Os) -> Result<String> {
        let bytes = tokio::fs::read(self.package_path(os)).await?;
        Ok(package_digest(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_hex_sha256() {
        assert_eq!(
            package_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_reads_package_from_dir() {
        let dir = std::env::temp_dir().join(format!("gantry-packages-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("agent-linux.zip"), b"v2").await.unwrap();

        let source = LocalPackageSource::new(&dir, "1.2.0", "0.9.1");
        assert_eq!(source.agent_version().await.unwrap(), "1.2.0");
        assert_eq!(source.package_digest(Os::Linux).await.unwrap(), package_digest(b"v2"));
        assert!(source.package_digest(Os::Windows).await.is_err());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}

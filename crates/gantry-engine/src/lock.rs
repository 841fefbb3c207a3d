//! Container-scoped mutual exclusion on the shared cache.

use crate::config::RetryConfig;
use gantry_cache::keys;
use gantry_core::ids::{BuildId, ContainerId};
use gantry_core::ports::KvCache;
use gantry_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hands out locks over one job of a build.
///
/// A lock expires after its TTL so a crashed holder cannot block the job
/// forever. Release only removes the key while it still holds the
/// holder's token.
#[derive(Clone)]
pub struct ContainerLocks {
    cache: Arc<dyn KvCache>,
    ttl: Duration,
    retry_interval: Duration,
    attempts: u32,
}

impl ContainerLocks {
    pub fn new(cache: Arc<dyn KvCache>, config: &RetryConfig) -> Self {
        Self {
            cache,
            ttl: Duration::from_secs(config.lock_ttl_secs),
            retry_interval: Duration::from_millis(config.lock_retry_interval_ms),
            attempts: config.lock_attempts.max(1),
        }
    }

    /// Wait for the lock, giving up with [`Error::LockTimeout`].
    pub async fn acquire(&self, build_id: BuildId, container_id: &ContainerId) -> Result<ContainerLockGuard> {
        let key = keys::container_lock(build_id, container_id);
        let token = Uuid::new_v4().to_string();
        for attempt in 1..=self.attempts {
            if self.cache.set_if_absent(&key, &token, self.ttl).await? {
                debug!(key = %key, attempt, "Container lock acquired");
                return Ok(ContainerLockGuard {
                    cache: self.cache.clone(),
                    key,
                    token,
                });
            }
            if attempt < self.attempts {
                sleep(self.retry_interval).await;
            }
        }
        Err(Error::LockTimeout(key))
    }
}

/// A held container lock. Call [`ContainerLockGuard::release`]; a dropped
/// guard is only freed by expiry.
#[must_use = "the lock is held until released or expired"]
pub struct ContainerLockGuard {
    cache: Arc<dyn KvCache>,
    key: String,
    token: String,
}

impl ContainerLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(self) {
        match self.cache.delete_if_equals(&self.key, &self.token).await {
            Ok(true) => debug!(key = %self.key, "Container lock released"),
            Ok(false) => warn!(key = %self.key, "Container lock expired before release"),
            Err(e) => warn!(key = %self.key, error = %e, "Failed to release container lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_cache::MemoryKv;

    fn locks(cache: Arc<dyn KvCache>) -> ContainerLocks {
        ContainerLocks::new(
            cache,
            &RetryConfig {
                lock_ttl_secs: 60,
                lock_retry_interval_ms: 10,
                lock_attempts: 3,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_holder_times_out() {
        let locks = locks(Arc::new(MemoryKv::new()));
        let build_id = BuildId::new();
        let container = ContainerId::new("c-1");

        let guard = locks.acquire(build_id, &container).await.unwrap();
        let err = locks.acquire(build_id, &container).await.err().unwrap();
        assert!(matches!(err, Error::LockTimeout(_)));

        guard.release().await;
        let again = locks.acquire(build_id, &container).await.unwrap();
        again.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_containers_are_independent() {
        let locks = locks(Arc::new(MemoryKv::new()));
        let build_id = BuildId::new();
        let a = locks.acquire(build_id, &ContainerId::new("c-1")).await.unwrap();
        let b = locks.acquire(build_id, &ContainerId::new("c-2")).await.unwrap();
        assert_ne!(a.key(), b.key());
        a.release().await;
        b.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_can_be_taken_over() {
        let cache = Arc::new(MemoryKv::new());
        let locks = locks(cache.clone());
        let build_id = BuildId::new();
        let container = ContainerId::new("c-1");

        let stale = locks.acquire(build_id, &container).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = locks.acquire(build_id, &container).await.unwrap();

        // The stale holder must not free the new holder's lock.
        stale.release().await;
        assert!(cache.get(fresh.key()).await.unwrap().is_some());
        fresh.release().await;
    }
}

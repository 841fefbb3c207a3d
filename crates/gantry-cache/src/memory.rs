use async_trait::async_trait;
use gantry_core::ports::KvCache;
use crate::parse_counter;
use gantry_core::Result;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local [`KvCache`] with per-key expiry.
///
/// Expired entries are dropped lazily on access. Uses tokio's clock so
/// tests can drive expiry with a paused runtime.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a key regardless of its value, as an eviction would.
    pub async fn evict(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }
}

#[async_trait]
impl KvCache for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(key) {
            Some(e) if e.is_live(now) => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let (next, expires_at) = match entries.get(key).filter(|e| e.is_live(now)) {
            Some(e) => (parse_counter(key, &e.value)? + 1, e.expires_at),
            None => (1, now + ttl),
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if entries
            .get(key)
            .is_some_and(|e| e.is_live(now) && e.value == value)
        {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_incr_counts_from_one() {
        let kv = MemoryKv::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(kv.incr("q", ttl).await.unwrap(), 1);
        assert_eq!(kv.incr("q", ttl).await.unwrap(), 2);
        assert_eq!(kv.get("q").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_incr_rejects_non_numeric_value() {
        let kv = MemoryKv::new();
        let ttl = Duration::from_secs(60);
        kv.set("q", "garbage", ttl).await.unwrap();
        let err = kv.incr("q", ttl).await.unwrap_err();
        assert!(matches!(err, gantry_core::Error::Cache(_)));
        assert_eq!(kv.get("q").await.unwrap().as_deref(), Some("garbage"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert_eq!(kv.incr("k", Duration::from_secs(5)).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_keeps_first_expiry() {
        let kv = MemoryKv::new();
        kv.incr("q", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        kv.incr("q", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(kv.incr("q", Duration::from_secs(10)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_if_absent_and_delete_if_equals() {
        let kv = MemoryKv::new();
        let ttl = Duration::from_secs(60);
        assert!(kv.set_if_absent("lock", "a", ttl).await.unwrap());
        assert!(!kv.set_if_absent("lock", "b", ttl).await.unwrap());

        assert!(!kv.delete_if_equals("lock", "b").await.unwrap());
        assert!(kv.delete_if_equals("lock", "a").await.unwrap());
        assert!(kv.set_if_absent("lock", "b", ttl).await.unwrap());
    }
}

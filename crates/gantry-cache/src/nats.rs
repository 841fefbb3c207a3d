use async_nats::jetstream::{self, kv};
use crate::parse_counter;
use async_trait::async_trait;
use chrono::Utc;
use gantry_core::ports::KvCache;
use gantry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Compare-and-swap rounds before a contended increment gives up.
const CAS_ATTEMPTS: usize = 16;

fn cache_err(e: impl std::fmt::Display) -> Error {
    Error::Cache(e.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Value envelope carrying a per-key expiry, which a bucket-wide
/// `max_age` cannot express.
#[derive(Debug, Serialize, Deserialize)]
struct Stored {
    v: String,
    exp: i64,
}

impl Stored {
    fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            v: value.into(),
            exp: now_ms() + ttl.as_millis() as i64,
        }
    }

    fn tombstone() -> Self {
        Self {
            v: String::new(),
            exp: 0,
        }
    }

    fn is_live(&self) -> bool {
        self.exp > now_ms()
    }
}

/// [`KvCache`] backed by a NATS JetStream key/value bucket.
///
/// Conditional writes use the bucket's revision check, so concurrent
/// processes sharing a bucket see atomic increments and lock acquisition.
#[derive(Clone)]
pub struct NatsKv {
    store: kv::Store,
}

impl NatsKv {
    pub fn new(store: kv::Store) -> Self {
        Self { store }
    }

    /// Open `bucket`, creating it on first use.
    pub async fn open(jetstream: &jetstream::Context, bucket: &str) -> Result<Self> {
        let store = match jetstream.get_key_value(bucket).await {
            Ok(store) => store,
            Err(e) => {
                debug!(bucket, error = %e, "KV bucket not found, creating");
                jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(cache_err)?
            }
        };
        info!(bucket, "KV cache ready");
        Ok(Self::new(store))
    }

    /// The live value under `key` and the revision a conditional write
    /// must match.
    async fn read(&self, key: &str) -> Result<(Option<Stored>, Option<u64>)> {
        let Some(entry) = self.store.entry(key).await.map_err(cache_err)? else {
            return Ok((None, None));
        };
        if !matches!(entry.operation, kv::Operation::Put) {
            return Ok((None, Some(entry.revision)));
        }
        let live = serde_json::from_slice::<Stored>(&entry.value)
            .ok()
            .filter(Stored::is_live);
        Ok((live, Some(entry.revision)))
    }

    /// Write `value` if the key is still at `revision`.
    ///
    /// Returns `false` when another writer moved the key first.
    async fn swap(&self, key: &str, revision: Option<u64>, value: &Stored) -> Result<bool> {
        let bytes = serde_json::to_vec(value)?;
        let written = match revision {
            Some(rev) => self
                .store
                .update(key, bytes.into(), rev)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            None => self
                .store
                .create(key, bytes.into())
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
        };
        match written {
            Ok(()) => Ok(true),
            Err(message) => {
                let current = self
                    .store
                    .entry(key)
                    .await
                    .map_err(cache_err)?
                    .map(|e| e.revision);
                if current != revision {
                    Ok(false)
                } else {
                    Err(Error::Cache(message))
                }
            }
        }
    }
}

#[async_trait]
impl KvCache for NatsKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read(key).await?.0.map(|s| s.v))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let bytes = serde_json::to_vec(&Stored::new(value, ttl))?;
        self.store
            .put(key, bytes.into())
            .await
            .map_err(cache_err)?;
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        for _ in 0..CAS_ATTEMPTS {
            let (live, revision) = self.read(key).await?;
            let next = match &live {
                Some(s) => Stored {
                    v: (parse_counter(key, &s.v)? + 1).to_string(),
                    exp: s.exp,
                },
                None => Stored::new("1", ttl),
            };
            if self.swap(key, revision, &next).await? {
                return next.v.parse::<i64>().map_err(cache_err);
            }
        }
        Err(Error::Cache(format!("increment of {key} lost {CAS_ATTEMPTS} races")))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let (live, revision) = self.read(key).await?;
        if live.is_some() {
            return Ok(false);
        }
        self.swap(key, revision, &Stored::new(value, ttl)).await
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let (live, revision) = self.read(key).await?;
        match live {
            Some(s) if s.v == value => self.swap(key, revision, &Stored::tombstone()).await,
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_expiry() {
        assert!(Stored::new("1", Duration::from_secs(60)).is_live());
        assert!(!Stored::tombstone().is_live());
        let json = serde_json::to_value(Stored::new("x", Duration::ZERO)).unwrap();
        assert_eq!(json["v"], "x");
    }
}

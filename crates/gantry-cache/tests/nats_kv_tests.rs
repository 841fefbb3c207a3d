//! NATS KV integration tests.
//!
//! Run with: `cargo test -p gantry-cache --features integration`
//!
//! To start NATS: `docker run -p 4222:4222 nats:latest -js`

#![cfg(feature = "integration")]

use gantry_cache::NatsKv;
use gantry_core::ports::KvCache;
use std::sync::Arc;
use std::time::Duration;

async fn kv() -> NatsKv {
    let client = async_nats::connect("nats://localhost:4222").await.expect("connect");
    let js = async_nats::jetstream::new(client);
    NatsKv::open(&js, "GANTRY_KV_TEST").await.expect("bucket")
}

fn unique(prefix: &str) -> String {
    format!("{prefix}.{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

#[tokio::test]
async fn test_concurrent_increments_are_atomic() {
    let kv = Arc::new(kv().await);
    let key = unique("quota");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let kv = kv.clone();
            let key = key.clone();
            tokio::spawn(async move { kv.incr(&key, Duration::from_secs(60)).await })
        })
        .collect();
    let mut seen = Vec::new();
    for h in handles {
        seen.push(h.await.expect("join").expect("incr"));
    }
    seen.sort();

    assert_eq!(seen, (1..=8).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_lock_round_trip() {
    let kv = kv().await;
    let key = unique("lock");
    let ttl = Duration::from_secs(30);

    assert!(kv.set_if_absent(&key, "a", ttl).await.expect("acquire"));
    assert!(!kv.set_if_absent(&key, "b", ttl).await.expect("contended"));
    assert!(kv.delete_if_equals(&key, "a").await.expect("release"));
    assert!(kv.set_if_absent(&key, "b", ttl).await.expect("reacquire"));
}

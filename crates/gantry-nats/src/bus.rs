//! JetStream-backed event bus.
//!
//! Scheduler refreshes, build-log lines and node notifications all land on
//! one stream. Subscribers get ephemeral consumers that start at the next
//! message, so a watcher only sees what happens after it attached.

use crate::config::NatsConfig;
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy},
    stream::{RetentionPolicy, StorageType},
};
use async_trait::async_trait;
use futures::StreamExt;
use gantry_core::events::Event;
use gantry_core::ports::{EventBus, EventStream};
use gantry_core::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long the server keeps an ephemeral consumer nobody pulls from.
const CONSUMER_INACTIVE_THRESHOLD: Duration = Duration::from_secs(5 * 60);
const ACK_WAIT: Duration = Duration::from_secs(30);

fn bus_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::EventBus(format!("{context}: {e}"))
}

#[derive(Clone)]
pub struct NatsEventBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
    closed: Arc<AtomicBool>,
}

impl NatsEventBus {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(NatsConfig::new(url)).await
    }

    /// Connect and make sure the event stream exists.
    pub async fn connect_with_config(config: NatsConfig) -> Result<Self> {
        let servers = config.urls.join(",");
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(config.connection_timeout)
            .request_timeout(Some(config.request_timeout))
            .retry_on_initial_connect()
            .connect(&servers)
            .await
            .map_err(|e| bus_err("connect", e))?;

        let jetstream = jetstream::new(client.clone());
        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream_name.clone(),
                subjects: config.subjects.clone(),
                retention: RetentionPolicy::Limits,
                storage: StorageType::File,
                max_age: config.max_age,
                ..Default::default()
            })
            .await
            .map_err(|e| bus_err("create stream", e))?;
        info!(servers = %servers, stream = %config.stream_name, "Event bus connected");

        Ok(Self {
            client,
            jetstream,
            config,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// JetStream context, shared with the KV cache.
    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop publishing and drain the connection.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(stream = %self.config.stream_name, "Draining event bus");
        self.client
            .drain()
            .await
            .map_err(|e| bus_err("drain", e))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(Error::EventBus("event bus is shut down".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Decode one message body.
fn decode(subject: &str, payload: &[u8]) -> Result<Event> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::Serialization(format!("event on {subject}: {e}")))
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        self.ensure_open()?;
        let subject = event.subject();
        let payload = serde_json::to_vec(&event).map_err(|e| Error::Serialization(e.to_string()))?;

        let ack = self
            .jetstream
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| bus_err(&subject, e))?;
        let ack = ack.await.map_err(|e| bus_err(&subject, e))?;
        debug!(subject = %subject, sequence = ack.sequence, "Event published");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        self.ensure_open()?;
        let consumer = self
            .jetstream
            .create_consumer_on_stream(
                pull::Config {
                    filter_subject: pattern.to_string(),
                    deliver_policy: DeliverPolicy::New,
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    max_deliver: self.config.max_deliver,
                    inactive_threshold: CONSUMER_INACTIVE_THRESHOLD,
                    ..Default::default()
                },
                self.config.stream_name.as_str(),
            )
            .await
            .map_err(|e| bus_err("create consumer", e))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| bus_err("pull messages", e))?;
        debug!(pattern, "Subscribed");

        let closed = self.closed.clone();
        let events = messages
            .take_while(move |_| futures::future::ready(!closed.load(Ordering::SeqCst)))
            .then(|message| async move {
                let message = message.map_err(|e| bus_err("receive", e))?;
                // Undecodable messages are acked too, redelivery cannot fix them.
                if let Err(e) = message.ack().await {
                    warn!(subject = %message.subject, error = %e, "Failed to ack event");
                }
                decode(message.subject.as_str(), &message.payload)
            });
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gantry_core::events::NodeChangedPayload;
    use gantry_core::ids::ProjectId;

    #[test]
    fn test_decode_event() {
        let event = Event::NodeChanged(NodeChangedPayload {
            project_id: ProjectId::new("proj"),
            user_id: "alice".to_string(),
            node_id: None,
            emitted_at: Utc::now(),
        });
        let payload = serde_json::to_vec(&event).unwrap();
        match decode("project.proj.nodes.changed", &payload).unwrap() {
            Event::NodeChanged(p) => assert_eq!(p.user_id, "alice"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode("build.x.log", b"not json").unwrap_err();
        assert!(matches!(err, Error::Serialization(msg) if msg.contains("build.x.log")));
    }

    #[test]
    fn test_config_builder() {
        let config = NatsConfig::new("nats://localhost:4222")
            .with_stream_name("TEST_STREAM")
            .with_max_deliver(5);
        assert_eq!(config.stream_name, "TEST_STREAM");
        assert_eq!(config.max_deliver, 5);
        assert_eq!(config.subjects, vec!["build.>", "project.>"]);
    }

    #[tokio::test]
    #[ignore] // needs a NATS server with JetStream
    async fn test_shutdown_refuses_subscribe() {
        let bus = NatsEventBus::connect("nats://localhost:4222").await.unwrap();
        bus.shutdown().await.unwrap();
        assert!(bus.is_shutdown());
        let err = bus.subscribe(">").await.err().unwrap();
        assert!(matches!(err, Error::EventBus(_)));
    }
}

//! Message bus abstraction the Consumer Orchestrator polls (SPEC_FULL.md
//! §4.E, §5).
//!
//! Modeled as a trait so the orchestrator is bus-agnostic in tests;
//! grounded on the `EventBus`/`RedpandaEventBus` split from the retrieval
//! pack's Redpanda crate -- `publish`/`subscribe` at the trait boundary,
//! manual offset commits performed only after a processor returns `Ok`,
//! same "commit after successful delivery" discipline.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;

use crate::error::RelayError;

/// One polled record: the raw bytes plus an opaque handle the bus uses to
/// commit the offset once the processor has returned successfully.
pub struct BusRecord {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub topic: String,
    handle: RecordHandle,
}

enum RecordHandle {
    Kafka(rdkafka::message::OwnedMessage),
    Memory,
}

/// A consumer bound to one topic + consumer group. `poll` suspends until a
/// record is available or the bus is closed; `commit` acknowledges a
/// previously polled record so it will not be redelivered to this group.
#[async_trait]
pub trait TopicConsumer: Send {
    async fn poll(&mut self) -> Result<Option<BusRecord>, RelayError>;
    async fn commit(&mut self, record: &BusRecord) -> Result<(), RelayError>;
}

/// The bus itself: publishes records and hands out per-topic consumers.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<(), RelayError>;

    async fn consumer(
        &self,
        topic: &str,
        group_id: &str,
        offset_reset: &str,
    ) -> Result<Box<dyn TopicConsumer>, RelayError>;
}

/// `rdkafka`-backed production bus. `enable.auto.commit=false` and manual
/// `commit_message` after processor success, matching the discipline used
/// across the retrieval pack's Kafka/Redpanda consumers. Partition
/// assignment uses the round-robin assignor per §4.E.
pub struct KafkaBus {
    brokers: String,
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaBus {
    pub fn new(brokers: impl Into<String>) -> Result<Self, RelayError> {
        let brokers = brokers.into();
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "30000")
            .set("acks", "all")
            .create()
            .map_err(|e| RelayError::Fatal(format!("failed to create kafka producer: {e}")))?;

        Ok(Self { brokers, producer, send_timeout: Duration::from_secs(30) })
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn publish(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<(), RelayError> {
        let mut record = FutureRecord::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        self.producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(err, _)| RelayError::TransientBus(err.to_string()))?;
        Ok(())
    }

    async fn consumer(
        &self,
        topic: &str,
        group_id: &str,
        offset_reset: &str,
    ) -> Result<Box<dyn TopicConsumer>, RelayError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", offset_reset)
            .set("session.timeout.ms", "6000")
            .set("partition.assignment.strategy", "roundrobin")
            .create()
            .map_err(|e| RelayError::TransientBus(format!("failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| RelayError::TransientBus(format!("failed to subscribe to {topic}: {e}")))?;

        Ok(Box::new(KafkaTopicConsumer { consumer, topic: topic.to_string() }))
    }
}

struct KafkaTopicConsumer {
    consumer: StreamConsumer,
    topic: String,
}

#[async_trait]
impl TopicConsumer for KafkaTopicConsumer {
    async fn poll(&mut self) -> Result<Option<BusRecord>, RelayError> {
        match self.consumer.recv().await {
            Ok(msg) => {
                let owned = msg.detach();
                let payload = owned.payload().map(|p| p.to_vec()).unwrap_or_default();
                let key = owned.key().map(|k| k.to_vec());
                Ok(Some(BusRecord { key, payload, topic: self.topic.clone(), handle: RecordHandle::Kafka(owned) }))
            }
            Err(e) => Err(RelayError::TransientBus(e.to_string())),
        }
    }

    async fn commit(&mut self, record: &BusRecord) -> Result<(), RelayError> {
        if let RecordHandle::Kafka(owned) = &record.handle {
            self.consumer
                .commit_message(owned, CommitMode::Async)
                .map_err(|e| RelayError::TransientBus(format!("commit failed: {e}")))?;
        }
        Ok(())
    }
}

/// In-process fake bus used by the orchestrator's own tests and by the
/// batch scheduler's "internal batch topic" in integration tests. One
/// `VecDeque` per topic, shared via `Arc<Mutex<_>>` so a test can publish
/// from one handle and consume from another.
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<std::collections::HashMap<String, VecDeque<(Option<Vec<u8>>, Vec<u8>)>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<(), RelayError> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push_back((key.map(|k| k.to_vec()), payload.to_vec()));
        Ok(())
    }

    async fn consumer(
        &self,
        topic: &str,
        _group_id: &str,
        _offset_reset: &str,
    ) -> Result<Box<dyn TopicConsumer>, RelayError> {
        Ok(Box::new(MemoryTopicConsumer { bus: self.clone(), topic: topic.to_string() }))
    }
}

struct MemoryTopicConsumer {
    bus: MemoryBus,
    topic: String,
}

#[async_trait]
impl TopicConsumer for MemoryTopicConsumer {
    async fn poll(&mut self) -> Result<Option<BusRecord>, RelayError> {
        let popped = self.bus.topics.lock().entry(self.topic.clone()).or_default().pop_front();
        Ok(popped.map(|(key, payload)| BusRecord { key, payload, topic: self.topic.clone(), handle: RecordHandle::Memory }))
    }

    async fn commit(&mut self, _record: &BusRecord) -> Result<(), RelayError> {
        // Already removed from the queue at poll time -- nothing to commit.
        Ok(())
    }
}

use anyhow::Result;
use async_trait::async_trait;

use crate::events::{SendPushQueueMessage, UpdateEnvelope};
use crate::kafka::{produce_message, KafkaProducer, PUSHES_TOPIC, UPDATES_TOPIC};

/// Re-publishes a synthetic event onto the updates queue so it flows through
/// the same dispatch path as collaborator-produced events.
#[async_trait]
pub trait UpdatePublisher: Send + Sync {
    async fn publish_update(&self, envelope: &UpdateEnvelope) -> Result<()>;
}

/// Hands an event off to the push pipeline.
#[async_trait]
pub trait PushQueue: Send + Sync {
    async fn enqueue(&self, message: &SendPushQueueMessage) -> Result<()>;
}

pub struct KafkaUpdatePublisher {
    producer: KafkaProducer,
}

impl KafkaUpdatePublisher {
    pub fn new(producer: KafkaProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl UpdatePublisher for KafkaUpdatePublisher {
    async fn publish_update(&self, envelope: &UpdateEnvelope) -> Result<()> {
        let payload = serde_json::to_vec(envelope)?;
        produce_message(&self.producer, UPDATES_TOPIC, None, &payload).await
    }
}

pub struct KafkaPushQueue {
    producer: KafkaProducer,
}

impl KafkaPushQueue {
    pub fn new(producer: KafkaProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl PushQueue for KafkaPushQueue {
    async fn enqueue(&self, message: &SendPushQueueMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        produce_message(&self.producer, PUSHES_TOPIC, None, &payload).await
    }
}

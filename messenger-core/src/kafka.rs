use anyhow::{anyhow, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::StreamConsumer;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing;

use crate::config::KafkaConfig;

/// Durable queue carrying `SourceEvent` JSON from the collaborators.
pub const UPDATES_TOPIC: &str = "messenger.updates";
/// Durable queue carrying `SendPushQueueMessage` JSON.
pub const PUSHES_TOPIC: &str = "messenger.pushes";

pub type KafkaProducer = Arc<FutureProducer>;
pub type KafkaConsumer = Arc<StreamConsumer>;

fn build_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", &config.brokers)
        .set("metadata.request.timeout.ms", "30000")
        .set("socket.timeout.ms", "30000")
        .set("socket.keepalive.enable", "true");

    if let Ok(ssl_enabled) = std::env::var("KAFKA_SSL_ENABLED") {
        if ssl_enabled == "true" || ssl_enabled == "1" {
            tracing::info!("SSL/TLS enabled for Kafka connection");
            client_config.set("security.protocol", "ssl");

            if let Ok(ca_location) = std::env::var("KAFKA_SSL_CA_LOCATION") {
                client_config.set("ssl.ca.location", &ca_location);
            }
        }
    }

    client_config
}

pub fn create_producer(config: &KafkaConfig) -> Result<KafkaProducer> {
    tracing::info!("Creating Kafka producer, brokers: {}", config.brokers);

    let producer: FutureProducer = build_client_config(config)
        .set("message.timeout.ms", "5000")
        .set("acks", "all")
        .set("retries", "3")
        .create()
        .map_err(|e| anyhow!("Failed to create Kafka producer: {}", e))?;

    Ok(Arc::new(producer))
}

pub fn create_consumer(config: &KafkaConfig, group_id: Option<&str>) -> Result<KafkaConsumer> {
    let group = group_id.unwrap_or(&config.consumer_group);
    tracing::info!(
        "Creating Kafka consumer, brokers: {}, group: {}",
        config.brokers,
        group
    );

    let consumer: StreamConsumer = build_client_config(config)
        .set("group.id", group)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "30000")
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", "earliest")
        .create()
        .map_err(|e| anyhow!("Failed to create Kafka consumer: {}", e))?;

    Ok(Arc::new(consumer))
}

pub async fn produce_message(
    producer: &KafkaProducer,
    topic: &str,
    key: Option<&str>,
    payload: &[u8],
) -> Result<()> {
    let mut record = FutureRecord::to(topic).payload(payload);

    if let Some(k) = key {
        record = record.key(k);
    }

    match producer.send(record, Duration::from_secs(5)).await {
        Ok((partition, offset)) => {
            tracing::debug!(
                "Message delivered to topic {} partition {} offset {}",
                topic,
                partition,
                offset
            );
            Ok(())
        }
        Err((e, _)) => {
            tracing::error!("Failed to deliver message to topic {}: {:?}", topic, e);
            Err(anyhow!("Failed to deliver message: {:?}", e))
        }
    }
}

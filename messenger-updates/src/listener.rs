use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use messenger_core::cache::ReadThroughCache;
use messenger_core::connections::RedisBroadcaster;
use messenger_core::counters::RedisCounterCache;
use messenger_core::events::{timestamp_now, UpdateEnvelope};
use messenger_core::kafka::UPDATES_TOPIC;
use messenger_core::presence::RedisPresence;
use messenger_core::publisher::{KafkaPushQueue, KafkaUpdatePublisher};
use messenger_core::MessengerContext;
use rdkafka::consumer::Consumer;
use rdkafka::Message;
use tracing;

use crate::handlers::HandlerContext;
use crate::notifier::WebhookNotifier;
use crate::registry::Registry;

pub fn build_handler_context(ctx: &MessengerContext) -> Result<HandlerContext> {
    Ok(HandlerContext {
        config: ctx.config.clone(),
        storage: ctx.storage.clone(),
        broadcaster: Arc::new(RedisBroadcaster::new(ctx.redis_pool.clone())),
        counters: Arc::new(RedisCounterCache::new(ctx.redis_pool.clone())),
        presence: Arc::new(RedisPresence::new(
            ctx.redis_pool.clone(),
            ctx.config.updates.presence_window_secs,
        )),
        push_queue: Arc::new(KafkaPushQueue::new(ctx.producer.clone())),
        update_publisher: Arc::new(KafkaUpdatePublisher::new(ctx.producer.clone())),
        notifier: Arc::new(WebhookNotifier::new(
            ctx.config.notifier.webhook_url.clone(),
        )?),
        chats_by_id: ReadThroughCache::new(),
        chats_by_message: ReadThroughCache::new(),
    })
}

/// One queue message: parse, drop if stale, dispatch. Handler errors are the
/// caller's to log; they never abort the loop.
pub async fn process_payload(
    registry: &Registry,
    ctx: &HandlerContext,
    payload: &[u8],
) -> Result<()> {
    let envelope: UpdateEnvelope = serde_json::from_slice(payload)?;

    let overtime_limit = ctx.config.updates.overtime_limit_secs;
    let age = timestamp_now() - envelope.created_at;
    if overtime_limit > 0 && age > overtime_limit {
        tracing::warn!(
            "Dropping overtime event {} ({}s old, limit {}s)",
            envelope.event.kind(),
            age,
            overtime_limit
        );
        return Ok(());
    }

    registry.dispatch(ctx, &envelope).await
}

pub async fn run(ctx: MessengerContext) -> Result<()> {
    tracing::info!("Starting update listener");

    let handler_ctx = build_handler_context(&ctx)?;
    let registry = Registry::with_default_handlers()?;

    let consumer = ctx.create_consumer(Some("messenger-updates"))?;
    consumer.subscribe(&[UPDATES_TOPIC])?;
    tracing::info!("Subscribed to topic: {}", UPDATES_TOPIC);

    let mut error_count = 0u32;
    let mut last_error_log = std::time::Instant::now();

    loop {
        match consumer.recv().await {
            Ok(message) => {
                error_count = 0;
                if let Some(payload) = message.payload() {
                    match process_payload(&registry, &handler_ctx, payload).await {
                        Ok(_) => {
                            tracing::debug!("Processed update event");
                        }
                        Err(e) => {
                            tracing::error!("Error processing update event: {:#}", e);
                        }
                    }
                }
            }
            Err(e) => {
                error_count += 1;
                if last_error_log.elapsed().as_secs() >= 30 {
                    tracing::warn!(
                        "Error receiving update message (error count: {}): {}",
                        error_count,
                        e
                    );
                    last_error_log = std::time::Instant::now();
                }
                let backoff =
                    Duration::from_secs(1 << error_count.min(5)).min(Duration::from_secs(30));
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

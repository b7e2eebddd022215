use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use messenger_core::config::PushRetryConfig;
use messenger_core::events::SendPushQueueMessage;
use messenger_core::kafka::PUSHES_TOPIC;
use messenger_core::storage::StorageHandle;
use messenger_core::MessengerContext;
use rdkafka::consumer::Consumer;
use rdkafka::Message;
use tracing;

use crate::error::PushError;
use crate::handlers::PushContext;
use crate::registry::PushRegistry;
use crate::sender::{PreparedPushNotification, PushSender, WebPushSender};

fn retry_wait(retry: &PushRetryConfig, attempt: u32) -> Duration {
    let wait_ms = retry
        .wait_exp_base
        .saturating_pow(attempt)
        .saturating_mul(retry.wait_multiplier_ms)
        .min(retry.max_wait_ms);
    Duration::from_millis(wait_ms)
}

/// Delivers one notification, retrying only on `TryAgainLater`. Nothing
/// escapes: every terminal outcome ends in a log line, and an invalid
/// endpoint additionally kills the device registration.
pub async fn deliver_with_retry(
    sender: &dyn PushSender,
    storage: &StorageHandle,
    retry: &PushRetryConfig,
    notification: &PreparedPushNotification,
) {
    for attempt in 0..retry.max_attempts {
        match sender.send(notification).await {
            Ok(()) => {
                tracing::debug!(
                    "Delivered push to user {} device {}",
                    notification.recipient_user_id,
                    notification.device_id
                );
                return;
            }
            Err(PushError::TryAgainLater) => {
                if attempt + 1 < retry.max_attempts {
                    let wait = retry_wait(retry, attempt);
                    tracing::debug!(
                        "Push to device {} deferred, retrying in {:?}",
                        notification.device_id,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                } else {
                    tracing::warn!(
                        "Abandoning push to device {} after {} attempts",
                        notification.device_id,
                        retry.max_attempts
                    );
                }
            }
            Err(PushError::InvalidEndpoint) => {
                tracing::info!(
                    "Push endpoint of device {} is dead, removing config",
                    notification.device_id
                );
                if let Err(e) = storage
                    .push_configs
                    .remove_configs(&notification.device_id)
                    .await
                {
                    tracing::error!(
                        "Failed to remove dead device {}: {:#}",
                        notification.device_id,
                        e
                    );
                }
                return;
            }
            Err(e @ PushError::PayloadTooLarge) | Err(e @ PushError::Unexpected(_)) => {
                tracing::error!(
                    "Push to device {} failed: {}",
                    notification.device_id,
                    e
                );
                return;
            }
            Err(e) => {
                tracing::warn!(
                    "Push to device {} dropped: {}",
                    notification.device_id,
                    e
                );
                return;
            }
        }
    }
}

/// One queue message: build the notifications and fan them out. Recipient
/// failures are isolated inside `deliver_with_retry`, so the whole batch
/// always runs to completion.
pub async fn process_push_message(
    registry: &PushRegistry,
    ctx: &PushContext,
    sender: &dyn PushSender,
    payload: &[u8],
) -> Result<()> {
    let message: SendPushQueueMessage = serde_json::from_slice(payload)?;
    let notifications = registry.dispatch(ctx, &message).await?;
    if notifications.is_empty() {
        return Ok(());
    }
    tracing::debug!("Dispatching {} push notifications", notifications.len());

    let retry = &ctx.config.push.retry;
    join_all(
        notifications
            .iter()
            .map(|n| deliver_with_retry(sender, &ctx.storage, retry, n)),
    )
    .await;
    Ok(())
}

pub async fn run(ctx: MessengerContext) -> Result<()> {
    tracing::info!("Starting push listener");

    let vapid_private_key = ctx
        .config
        .push
        .vapid_private_key
        .clone()
        .ok_or_else(|| anyhow!("VAPID_PRIVATE_KEY is required for the push listener"))?;
    let sender = WebPushSender::new(
        vapid_private_key,
        ctx.config.push.vapid_subject.clone(),
        ctx.config.push.request_timeout_secs,
    )?;
    let push_ctx = PushContext {
        config: ctx.config.clone(),
        storage: ctx.storage.clone(),
    };
    let registry = PushRegistry::with_default_handlers()?;

    let consumer = ctx.create_consumer(Some("messenger-push"))?;
    consumer.subscribe(&[PUSHES_TOPIC])?;
    tracing::info!("Subscribed to topic: {}", PUSHES_TOPIC);

    let mut error_count = 0u32;
    let mut last_error_log = std::time::Instant::now();

    loop {
        match consumer.recv().await {
            Ok(message) => {
                error_count = 0;
                if let Some(payload) = message.payload() {
                    match process_push_message(&registry, &push_ctx, &sender, payload).await {
                        Ok(_) => {
                            tracing::debug!("Processed push job");
                        }
                        Err(e) => {
                            tracing::error!("Error processing push job: {:#}", e);
                        }
                    }
                }
            }
            Err(e) => {
                error_count += 1;
                if last_error_log.elapsed().as_secs() >= 30 {
                    tracing::warn!(
                        "Error receiving push message (error count: {}): {}",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_wait_is_exponential_and_capped() {
        let retry = PushRetryConfig {
            max_attempts: 5,
            wait_multiplier_ms: 500,
            wait_exp_base: 2,
            max_wait_ms: 3_000,
        };
        assert_eq!(retry_wait(&retry, 0), Duration::from_millis(500));
        assert_eq!(retry_wait(&retry, 1), Duration::from_millis(1_000));
        assert_eq!(retry_wait(&retry, 2), Duration::from_millis(2_000));
        assert_eq!(retry_wait(&retry, 3), Duration::from_millis(3_000));
        assert_eq!(retry_wait(&retry, 10), Duration::from_millis(3_000));
    }
}

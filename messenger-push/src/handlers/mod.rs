pub mod new_message;
pub mod tickets;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use messenger_core::config::Config;
use messenger_core::events::{EventKind, Role, SendPushQueueMessage, UserId};
use messenger_core::protocol::PushNotificationContent;
use messenger_core::storage::{PushNotificationConfig, StorageHandle};
use tracing;

use crate::sender::{PreparedPushNotification, PushUrgency, PUSH_TTL_SECS};

pub struct PushContext {
    pub config: Arc<Config>,
    pub storage: StorageHandle,
}

impl PushContext {
    /// Fresh device configs for a user. Stale devices are deleted on the
    /// spot (lazy eviction), so cleanup cost tracks notification volume.
    pub async fn get_active_configs_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<PushNotificationConfig>> {
        let configs = self.storage.push_configs.get_configs_for_user(user_id).await?;
        let cutoff =
            Utc::now() - Duration::seconds(self.config.push.device_last_alive_threshold_secs);

        let mut active = Vec::new();
        for config in configs {
            if config.last_alive_at < cutoff {
                tracing::debug!("Evicting stale push device {}", config.device_id);
                self.storage
                    .push_configs
                    .remove_configs(&config.device_id)
                    .await?;
            } else {
                active.push(config);
            }
        }
        Ok(active)
    }
}

/// Builds zero or more prepared notifications out of one queued event.
#[async_trait]
pub trait PushHandler: Send + Sync {
    fn event_kind(&self) -> EventKind;

    async fn build(
        &self,
        ctx: &PushContext,
        message: &SendPushQueueMessage,
    ) -> Result<Vec<PreparedPushNotification>>;
}

/// One notification per registered device of the recipient.
pub(crate) fn prepare_for_devices(
    recipient: UserId,
    configs: &[PushNotificationConfig],
    content: &PushNotificationContent,
    urgency: PushUrgency,
    topic: Option<String>,
) -> Result<Vec<PreparedPushNotification>> {
    let payload = serde_json::to_vec(content)?;
    Ok(configs
        .iter()
        .map(|config| PreparedPushNotification {
            recipient_user_id: recipient,
            device_id: config.device_id.clone(),
            endpoint: config.endpoint.clone(),
            p256dh: config.p256dh.clone(),
            auth: config.auth.clone(),
            payload: payload.clone(),
            ttl: PUSH_TTL_SECS,
            urgency,
            topic: topic.clone(),
        })
        .collect())
}

/// Non-supervisors never see real names in a push payload.
pub(crate) fn anonymized_name(role: Role, scout_number: Option<i64>) -> String {
    match role {
        Role::Scout => match scout_number {
            Some(number) => format!("Scout {}", number),
            None => "Scout".to_string(),
        },
        Role::Bookmaker => "Bookmaker".to_string(),
        Role::Supervisor => "Supervisor".to_string(),
    }
}

pub(crate) fn truncate_preview(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let mut preview: String = text.chars().take(max_len).collect();
    preview.push('…');
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncation() {
        assert_eq!(truncate_preview("short", 10), "short");
        assert_eq!(truncate_preview("exactly10!", 10), "exactly10!");
        assert_eq!(truncate_preview("0123456789x", 10), "0123456789…");
    }

    #[test]
    fn anonymized_names() {
        assert_eq!(anonymized_name(Role::Scout, Some(12)), "Scout 12");
        assert_eq!(anonymized_name(Role::Scout, None), "Scout");
        assert_eq!(anonymized_name(Role::Bookmaker, None), "Bookmaker");
        assert_eq!(anonymized_name(Role::Supervisor, Some(3)), "Supervisor");
    }
}

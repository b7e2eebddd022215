use anyhow::Result;
use async_trait::async_trait;
use messenger_core::events::{ChatId, TicketId, UserId};
use std::time::Duration;
use tracing;

/// Out-of-band side channel for ticket creation. Best-effort: handlers
/// spawn the call and never await it, failures end up in the log only.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn ticket_created(
        &self,
        ticket_id: TicketId,
        chat_id: ChatId,
        created_by_user_id: UserId,
    ) -> Result<()>;
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(webhook_url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            webhook_url,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn ticket_created(
        &self,
        ticket_id: TicketId,
        chat_id: ChatId,
        created_by_user_id: UserId,
    ) -> Result<()> {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("No notifier webhook configured, skipping ticket {}", ticket_id);
            return Ok(());
        };

        let body = serde_json::json!({
            "ticket_id": ticket_id,
            "chat_id": chat_id,
            "created_by_user_id": created_by_user_id,
        });
        let response = self.client.post(url).json(&body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Notifier webhook returned {} for ticket {}",
                response.status(),
                ticket_id
            );
        }
        Ok(())
    }
}

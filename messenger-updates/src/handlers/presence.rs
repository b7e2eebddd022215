use anyhow::{anyhow, Result};
use async_trait::async_trait;
use messenger_core::connections::BroadcastOptions;
use messenger_core::events::{EventKind, PresenceStatus, SourceEvent, UpdateEnvelope};
use messenger_core::protocol::ServerUpdate;

use super::{HandlerContext, UpdateHandler};

pub struct PresenceStatusHandler;

#[async_trait]
impl UpdateHandler for PresenceStatusHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::PresenceStatusChanged
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::PresenceStatusChanged { user_id, status } = &envelope.event else {
            return Err(anyhow!("PresenceStatusHandler received a foreign event"));
        };

        match status {
            PresenceStatus::Online => ctx.presence.mark_online(*user_id).await?,
            PresenceStatus::Offline => ctx.presence.mark_offline(*user_id).await?,
        }

        // Only people who recently shared a chat with the subject care;
        // everyone else would just churn through the fan-out for nothing.
        let comembers = ctx.storage.chats.get_comember_ids(*user_id).await?;
        let audience = ctx.filter_online(&comembers).await?;
        if audience.is_empty() {
            return Ok(());
        }

        let update = ServerUpdate::PresenceStatusChanged {
            user_id: *user_id,
            status: *status,
        };
        ctx.broadcaster
            .broadcast(
                &audience,
                &update,
                BroadcastOptions {
                    skip_connection: envelope.cid.clone(),
                    skip_user: Some(*user_id),
                },
            )
            .await?;
        Ok(())
    }
}

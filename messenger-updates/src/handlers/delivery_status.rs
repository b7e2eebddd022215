use anyhow::{anyhow, Result};
use async_trait::async_trait;
use messenger_core::connections::BroadcastOptions;
use messenger_core::counters::UnreadCounterKey;
use messenger_core::events::{DeliveryStatus, EventKind, SourceEvent, UpdateEnvelope};
use messenger_core::protocol::ServerUpdate;

use super::{member_ids, HandlerContext, UpdateHandler};

pub struct DeliveryStatusHandler;

#[async_trait]
impl UpdateHandler for DeliveryStatusHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::DeliveryStatusChanged
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::DeliveryStatusChanged {
            message_id,
            chat_id,
            user_id,
            status,
            updated_for_user,
            updated_for_all,
        } = &envelope.event
        else {
            return Err(anyhow!("DeliveryStatusHandler received a foreign event"));
        };

        let chat = ctx.get_chat_by_message(*message_id).await?;
        let members = ctx.chat_members(*chat_id).await?;

        // Counters only move backwards when messages were actually read.
        if *status == DeliveryStatus::Read && *updated_for_user > 0 {
            let mut scopes = vec![
                UnreadCounterKey::Total,
                UnreadCounterKey::ByChat(*chat_id),
            ];
            if let Some(match_id) = chat.match_id {
                scopes.push(UnreadCounterKey::ByMatch(match_id));
            }
            let results = ctx
                .counters
                .decrement_if_exists(*user_id, &scopes, *updated_for_user)
                .await?;
            if let Some(Some(total)) = results.first() {
                ctx.publish_total(*user_id, *total).await?;
            }
        }

        // The acting user's other devices always learn about their own read,
        // with the per-user count; everyone else gets the chat-wide count.
        let own_update = ServerUpdate::DeliveryStatusChanged {
            message_id: *message_id,
            chat_id: *chat_id,
            state: *status,
            read_by: *user_id,
            updated_count: *updated_for_user,
            chat_type: chat.chat_type,
            match_id: chat.match_id,
        };
        ctx.broadcaster
            .broadcast(
                &[*user_id],
                &own_update,
                BroadcastOptions {
                    skip_connection: envelope.cid.clone(),
                    skip_user: None,
                },
            )
            .await?;

        let others_update = ServerUpdate::DeliveryStatusChanged {
            message_id: *message_id,
            chat_id: *chat_id,
            state: *status,
            read_by: *user_id,
            updated_count: *updated_for_all,
            chat_type: chat.chat_type,
            match_id: chat.match_id,
        };
        ctx.broadcaster
            .broadcast(
                &member_ids(&members),
                &others_update,
                BroadcastOptions {
                    skip_connection: envelope.cid.clone(),
                    skip_user: Some(*user_id),
                },
            )
            .await?;

        Ok(())
    }
}

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use messenger_core::connections::BroadcastOptions;
use messenger_core::events::{EventKind, SourceEvent, UpdateEnvelope};
use messenger_core::protocol::ServerUpdate;
use messenger_core::storage::User;
use tracing;

use super::{HandlerContext, UpdateHandler};

pub struct ChatCreatedHandler;

#[async_trait]
impl UpdateHandler for ChatCreatedHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::ChatCreated
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::ChatCreated {
            chat_id,
            chat_type,
            created_by_user_id,
            match_id,
        } = &envelope.event
        else {
            return Err(anyhow!("ChatCreatedHandler received a foreign event"));
        };

        // Archive/passive members get the chat on their next full sync; the
        // live announcement goes to primary members only.
        let members = ctx.chat_members(*chat_id).await?;
        let audience: Vec<i64> = members
            .iter()
            .filter(|m| m.is_primary_member)
            .map(|m| m.user_id)
            .collect();

        let update = ServerUpdate::ChatCreated {
            chat_id: *chat_id,
            chat_type: *chat_type,
            match_id: *match_id,
            created_by_user_id: *created_by_user_id,
        };
        ctx.broadcaster
            .broadcast(
                &audience,
                &update,
                BroadcastOptions {
                    skip_connection: envelope.cid.clone(),
                    skip_user: None,
                },
            )
            .await?;
        Ok(())
    }
}

pub struct UserDataChangedHandler;

#[async_trait]
impl UpdateHandler for UserDataChangedHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::UserDataChanged
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::UserDataChanged {
            user_id,
            name,
            role,
            scout_number,
        } = &envelope.event
        else {
            return Err(anyhow!("UserDataChangedHandler received a foreign event"));
        };

        let user = User {
            id: *user_id,
            name: name.clone(),
            role: *role,
            scout_number: *scout_number,
        };
        let updated = ctx.storage.users.update(&user).await?;
        if !updated {
            tracing::info!("Provisioning user {} on first data change", user_id);
            ctx.storage.users.create(&user).await?;
        }

        let comembers = ctx.storage.chats.get_comember_ids(*user_id).await?;
        let audience = ctx.filter_online(&comembers).await?;
        if audience.is_empty() {
            return Ok(());
        }

        let update = ServerUpdate::UserDataChanged {
            user_id: *user_id,
            name: name.clone(),
            role: *role,
            scout_number: *scout_number,
        };
        ctx.broadcaster
            .broadcast(&audience, &update, BroadcastOptions::default())
            .await?;
        Ok(())
    }
}

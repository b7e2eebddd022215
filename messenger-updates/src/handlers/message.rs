use anyhow::{anyhow, Result};
use async_trait::async_trait;
use messenger_core::connections::BroadcastOptions;
use messenger_core::counters::UnreadCounterKey;
use messenger_core::events::{
    DeliveryStatus, EventKind, MessageContent, SendPushQueueMessage, SourceEvent, UpdateEnvelope,
};
use messenger_core::protocol::{MessageView, ServerUpdate};
use tracing;

use super::{member_ids, HandlerContext, UpdateHandler};

pub struct MessageSentHandler;

#[async_trait]
impl UpdateHandler for MessageSentHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::MessageSentToChat
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::MessageSentToChat {
            message_id,
            chat_id,
            sender_id,
            initiator_id,
            content_raw,
            msg_created_at,
            do_not_increment_counter,
        } = &envelope.event
        else {
            return Err(anyhow!("MessageSentHandler received a foreign event"));
        };

        let content = MessageContent::decode(content_raw)?;
        let chat = ctx.get_chat(*chat_id).await?;
        let members = ctx.chat_members(*chat_id).await?;

        // The total badge always moves; the flag only exempts the per-chat
        // and per-match counters (service-authored messages are not "unread
        // in chat X", but they still demand attention).
        let mut scopes = vec![UnreadCounterKey::Total];
        if !do_not_increment_counter {
            scopes.push(UnreadCounterKey::ByChat(*chat_id));
            if let Some(match_id) = chat.match_id {
                scopes.push(UnreadCounterKey::ByMatch(match_id));
            }
        }

        for member in &members {
            if Some(member.user_id) == *sender_id || Some(member.user_id) == *initiator_id {
                continue;
            }
            let results = ctx
                .counters
                .increment_if_exists(member.user_id, &scopes, 1)
                .await?;
            if let Some(Some(total)) = results.first() {
                ctx.publish_total(member.user_id, *total).await?;
            }
        }

        let update = ServerUpdate::MessageReceived {
            message: MessageView {
                id: *message_id,
                chat_id: *chat_id,
                sender_id: *sender_id,
                sent_at: *msg_created_at,
                content: content.clone(),
                state: DeliveryStatus::Sent,
                match_id: chat.match_id,
            },
            chat_type: chat.chat_type,
        };
        ctx.broadcaster
            .broadcast(
                &member_ids(&members),
                &update,
                BroadcastOptions {
                    skip_connection: envelope.cid.clone(),
                    skip_user: None,
                },
            )
            .await?;

        if content.requires_push() {
            ctx.push_queue
                .enqueue(&SendPushQueueMessage::new(envelope.clone()))
                .await?;
        } else {
            tracing::debug!("Message {} is push-exempt system content", message_id);
        }

        Ok(())
    }
}

pub struct MessageEditedHandler;

#[async_trait]
impl UpdateHandler for MessageEditedHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::MessageEdited
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::MessageEdited {
            message_id,
            chat_id,
            content_raw,
        } = &envelope.event
        else {
            return Err(anyhow!("MessageEditedHandler received a foreign event"));
        };

        let content = MessageContent::decode(content_raw)?;
        let members = ctx.chat_members(*chat_id).await?;
        let update = ServerUpdate::MessageEdited {
            message_id: *message_id,
            chat_id: *chat_id,
            content,
        };
        ctx.broadcaster
            .broadcast(
                &member_ids(&members),
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

pub struct MessageDeletedHandler;

#[async_trait]
impl UpdateHandler for MessageDeletedHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::MessageDeleted
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::MessageDeleted {
            message_id,
            chat_id,
        } = &envelope.event
        else {
            return Err(anyhow!("MessageDeletedHandler received a foreign event"));
        };

        let members = ctx.chat_members(*chat_id).await?;
        let update = ServerUpdate::MessageDeleted {
            message_id: *message_id,
            chat_id: *chat_id,
        };
        ctx.broadcaster
            .broadcast(
                &member_ids(&members),
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

pub struct ReactionUpdatedHandler;

#[async_trait]
impl UpdateHandler for ReactionUpdatedHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::ReactionUpdatedMessage
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::ReactionUpdatedMessage {
            message_id,
            chat_id,
            user_id,
            emoji,
            emoji_count,
            is_deleted,
        } = &envelope.event
        else {
            return Err(anyhow!("ReactionUpdatedHandler received a foreign event"));
        };

        let members = ctx.chat_members(*chat_id).await?;
        let update = ServerUpdate::ReactionUpdated {
            message_id: *message_id,
            chat_id: *chat_id,
            user_id: *user_id,
            emoji: emoji.clone(),
            emoji_count: *emoji_count,
            is_deleted: *is_deleted,
        };
        ctx.broadcaster
            .broadcast(
                &member_ids(&members),
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

pub struct UserIsTypingHandler;

#[async_trait]
impl UpdateHandler for UserIsTypingHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::UserIsTypingMessage
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::UserIsTypingMessage {
            chat_id,
            user_id,
            is_typing,
        } = &envelope.event
        else {
            return Err(anyhow!("UserIsTypingHandler received a foreign event"));
        };

        let members = ctx.chat_members(*chat_id).await?;
        let update = ServerUpdate::UserIsTyping {
            chat_id: *chat_id,
            user_id: *user_id,
            is_typing: *is_typing,
        };
        // The typist's other devices do not need their own typing state.
        ctx.broadcaster
            .broadcast(
                &member_ids(&members),
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

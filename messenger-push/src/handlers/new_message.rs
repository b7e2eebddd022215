use anyhow::{anyhow, Result};
use async_trait::async_trait;
use messenger_core::events::{
    EventKind, MessageContent, Role, SendPushQueueMessage, SourceEvent,
};
use messenger_core::protocol::{
    NotificationMatchData, NotificationTicketData, NotificationUserData, PushNotificationBody,
    PushNotificationContent,
};
use messenger_core::storage::User;
use tracing;

use super::{
    anonymized_name, prepare_for_devices, truncate_preview, PushContext, PushHandler,
};
use crate::sender::{PreparedPushNotification, PushUrgency};

pub struct NewMessagePushHandler;

#[async_trait]
impl PushHandler for NewMessagePushHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::MessageSentToChat
    }

    async fn build(
        &self,
        ctx: &PushContext,
        message: &SendPushQueueMessage,
    ) -> Result<Vec<PreparedPushNotification>> {
        let SourceEvent::MessageSentToChat {
            message_id,
            chat_id,
            sender_id,
            initiator_id,
            content_raw,
            msg_created_at,
            ..
        } = &message.source_event.event
        else {
            return Err(anyhow!("NewMessagePushHandler received a foreign event"));
        };

        let content = MessageContent::decode(content_raw)?;
        if !content.requires_push() {
            tracing::debug!("Message {} content is push-exempt", message_id);
            return Ok(Vec::new());
        }

        let chat = ctx
            .storage
            .chats
            .get_chat_by_id(*chat_id)
            .await?
            .ok_or_else(|| anyhow!("Chat {} not found", chat_id))?;
        let members = ctx.storage.chats.get_users_in_chat(*chat_id).await?;

        let match_data = match chat.match_id {
            Some(match_id) => ctx
                .storage
                .matches
                .get_match_by_id(match_id)
                .await?
                .map(|m| NotificationMatchData {
                    id: m.id,
                    team_a_name: m.team_a_name,
                    team_b_name: m.team_b_name,
                }),
            None => None,
        };
        let ticket_data = chat
            .assigned_ticket_id
            .map(|id| NotificationTicketData { id });

        // Profiles the device needs to render the notification: whoever the
        // content references, plus the sender.
        let mut referenced = content.referenced_user_ids();
        if let Some(sender) = sender_id {
            if !referenced.contains(sender) {
                referenced.push(*sender);
            }
        }
        let referenced_users = ctx.storage.users.get_by_ids(&referenced).await?;

        // Long texts are cut down only here; the realtime path carries the
        // full content.
        let push_content = match content {
            MessageContent::Text { text } => MessageContent::Text {
                text: truncate_preview(&text, ctx.config.push.preview_max_len),
            },
            other => other,
        };

        let mut notifications = Vec::new();
        for member in &members {
            if Some(member.user_id) == *sender_id || Some(member.user_id) == *initiator_id {
                continue;
            }
            let configs = ctx.get_active_configs_for_user(member.user_id).await?;
            if configs.is_empty() {
                continue;
            }

            let user_data = referenced_users
                .iter()
                .map(|user| user_data_for_viewer(user, member.user_role))
                .collect();
            let body = PushNotificationBody::NewMessage {
                id: *message_id,
                chat_id: *chat_id,
                sent_at: *msg_created_at,
                sender_id: *sender_id,
                content: push_content.clone(),
                match_data: match_data.clone(),
                ticket_data: ticket_data.clone(),
                user_data,
            };
            let payload = PushNotificationContent {
                created_at: message.created_at,
                body,
            };
            notifications.extend(prepare_for_devices(
                member.user_id,
                &configs,
                &payload,
                PushUrgency::High,
                None,
            )?);
        }
        Ok(notifications)
    }
}

fn user_data_for_viewer(user: &User, viewer_role: Role) -> NotificationUserData {
    let name = if viewer_role == Role::Supervisor {
        user.name.clone()
    } else {
        anonymized_name(user.role, user.scout_number)
    };
    NotificationUserData {
        id: user.id,
        name,
        role: user.role,
        scout_number: user.scout_number,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_anonymized_for_non_supervisors() {
        let user = User {
            id: 1,
            name: "Alice Smith".to_string(),
            role: Role::Scout,
            scout_number: Some(4),
        };
        assert_eq!(user_data_for_viewer(&user, Role::Scout).name, "Scout 4");
        assert_eq!(
            user_data_for_viewer(&user, Role::Supervisor).name,
            "Alice Smith"
        );
    }
}

pub mod chat;
pub mod delivery_status;
pub mod matches;
pub mod message;
pub mod presence;
pub mod tickets;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use messenger_core::cache::ReadThroughCache;
use messenger_core::config::Config;
use messenger_core::connections::Broadcaster;
use messenger_core::counters::CounterCache;
use messenger_core::events::{ChatId, EventKind, MessageId, PresenceStatus, UpdateEnvelope, UserId};
use messenger_core::presence::PresenceService;
use messenger_core::protocol::UnreadCountersUpdate;
use messenger_core::publisher::{PushQueue, UpdatePublisher};
use messenger_core::storage::{Chat, ChatUserDTO, StorageHandle};

use crate::notifier::Notifier;

/// Shared dependencies injected into every handler invocation.
pub struct HandlerContext {
    pub config: Arc<Config>,
    pub storage: StorageHandle,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub counters: Arc<dyn CounterCache>,
    pub presence: Arc<dyn PresenceService>,
    pub push_queue: Arc<dyn PushQueue>,
    pub update_publisher: Arc<dyn UpdatePublisher>,
    pub notifier: Arc<dyn Notifier>,
    pub chats_by_id: ReadThroughCache<ChatId, Chat>,
    pub chats_by_message: ReadThroughCache<MessageId, Chat>,
}

impl HandlerContext {
    /// Read-through-cached chat lookup. A missing chat is a collaborator
    /// contract violation, not a recoverable condition.
    pub async fn get_chat(&self, chat_id: ChatId) -> Result<Chat> {
        let storage = self.storage.clone();
        self.chats_by_id
            .get_or_load(chat_id, || async move {
                storage.chats.get_chat_by_id(chat_id).await
            })
            .await?
            .ok_or_else(|| anyhow!("Chat {} not found", chat_id))
    }

    pub async fn get_chat_by_message(&self, message_id: MessageId) -> Result<Chat> {
        let storage = self.storage.clone();
        self.chats_by_message
            .get_or_load(message_id, || async move {
                storage.chats.get_chat_by_message_id(message_id).await
            })
            .await?
            .ok_or_else(|| anyhow!("Chat for message {} not found", message_id))
    }

    pub async fn invalidate_chat(&self, chat_id: ChatId) {
        self.chats_by_id.invalidate(&chat_id).await;
    }

    pub async fn chat_members(&self, chat_id: ChatId) -> Result<Vec<ChatUserDTO>> {
        self.storage.chats.get_users_in_chat(chat_id).await
    }

    /// Keeps only the users the presence window still counts as online.
    pub async fn filter_online(&self, user_ids: &[UserId]) -> Result<Vec<UserId>> {
        let mut online = Vec::new();
        for user_id in user_ids {
            if self.presence.get_status(*user_id).await? == PresenceStatus::Online {
                online.push(*user_id);
            }
        }
        Ok(online)
    }

    pub async fn publish_total(&self, user_id: UserId, unread_count: i64) -> Result<()> {
        self.counters
            .publish_total(&UnreadCountersUpdate {
                user_id,
                unread_count,
            })
            .await
    }
}

/// One handler per event kind; constructed once, invoked per dispatch.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    fn event_kind(&self) -> EventKind;

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()>;
}

pub(crate) fn member_ids(members: &[ChatUserDTO]) -> Vec<UserId> {
    members.iter().map(|m| m.user_id).collect()
}

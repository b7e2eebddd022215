pub mod pg;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::events::{
    ChatId, ChatType, MatchId, MatchState, MessageContent, MessageId, Role, TicketId,
    TicketStatus, UserId,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Chat {
    pub id: ChatId,
    pub chat_type: ChatType,
    pub match_id: Option<MatchId>,
    pub assigned_ticket_id: Option<TicketId>,
    pub is_closed: bool,
}

/// Membership row, queried fresh per event: membership can change
/// mid-conversation (scout reassignment), so it is never cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatUserDTO {
    pub user_id: UserId,
    pub user_role: Role,
    pub is_primary_member: bool,
    pub has_write_permission: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: Option<UserId>,
    pub content: MessageContent,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub id: MatchId,
    pub team_a_name: String,
    pub team_b_name: String,
    pub state: MatchState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchScout {
    pub match_id: MatchId,
    pub user_id: UserId,
    pub scout_number: Option<i64>,
    pub is_main_scout: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub id: TicketId,
    pub status: TicketStatus,
    pub created_by_user_id: UserId,
    pub chat_id: ChatId,
    pub match_id: Option<MatchId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub role: Role,
    pub scout_number: Option<i64>,
}

/// One registered Web Push device.
#[derive(Debug, Clone, PartialEq)]
pub struct PushNotificationConfig {
    pub device_id: String,
    pub user_id: UserId,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub last_alive_at: DateTime<Utc>,
}

/// Membership window applied when the main scout of a match changes: the
/// outgoing scout keeps read access bounded at a message id, the incoming
/// scout gets access starting from it.
#[derive(Debug, Clone, Default)]
pub struct ScoutMembershipWindow {
    pub first_available_message_id: Option<MessageId>,
    pub last_available_message_id: Option<MessageId>,
    pub is_archive_member: bool,
    pub has_write_permission: bool,
}

#[derive(Debug, Clone)]
pub struct NewChatMembership {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub user_role: Role,
    pub is_primary_member: bool,
    pub has_write_permission: bool,
    pub first_available_message_id: Option<MessageId>,
}

#[async_trait]
pub trait ChatsRepo: Send + Sync {
    async fn get_chat_by_id(&self, chat_id: ChatId) -> Result<Option<Chat>>;
    async fn get_chat_by_message_id(&self, message_id: MessageId) -> Result<Option<Chat>>;
    async fn get_users_in_chat(&self, chat_id: ChatId) -> Result<Vec<ChatUserDTO>>;
    async fn get_chats_of_user(&self, user_id: UserId) -> Result<Vec<ChatId>>;
    /// Distinct users sharing at least one chat with `user_id` (the user
    /// themselves excluded).
    async fn get_comember_ids(&self, user_id: UserId) -> Result<Vec<UserId>>;
    async fn get_open_chats_by_match(&self, match_id: MatchId) -> Result<Vec<Chat>>;
    async fn count_chats_by_match(&self, match_id: MatchId) -> Result<i64>;
    async fn close_chats(&self, chat_ids: &[ChatId]) -> Result<()>;
    /// Appends a service-authored message (`sender_id = NULL`) and returns it.
    async fn append_system_message(
        &self,
        chat_id: ChatId,
        content: &MessageContent,
    ) -> Result<StoredMessage>;
    async fn update_scout_membership(
        &self,
        chat_id: ChatId,
        scout_id: UserId,
        window: ScoutMembershipWindow,
    ) -> Result<()>;
    /// Returns false when the user is already a member.
    async fn add_user_to_chat(&self, membership: NewChatMembership) -> Result<bool>;
}

#[async_trait]
pub trait MatchesRepo: Send + Sync {
    async fn get_match_by_id(&self, match_id: MatchId) -> Result<Option<Match>>;
    async fn get_scouts(&self, match_id: MatchId) -> Result<Vec<MatchScout>>;
    async fn upsert_match(&self, match_row: &Match) -> Result<()>;
    /// Returns false when no row exists for `match_id`.
    async fn update_state(&self, match_id: MatchId, state: MatchState) -> Result<bool>;
    async fn update_basic_data(
        &self,
        match_id: MatchId,
        team_a_name: &str,
        team_b_name: &str,
    ) -> Result<bool>;
    async fn replace_scouts(&self, match_id: MatchId, scouts: &[MatchScout]) -> Result<()>;
    /// Removes the match row together with its scout rows.
    async fn delete_match(&self, match_id: MatchId) -> Result<()>;
    /// Scouts of the match plus members of every chat scoped to it.
    async fn get_related_user_ids(&self, match_id: MatchId) -> Result<Vec<UserId>>;
}

#[async_trait]
pub trait TicketsRepo: Send + Sync {
    async fn get_ticket_by_id(&self, ticket_id: TicketId) -> Result<Option<Ticket>>;
}

#[async_trait]
pub trait UsersRepo: Send + Sync {
    async fn get_by_id(&self, user_id: UserId) -> Result<Option<User>>;
    async fn get_by_ids(&self, user_ids: &[UserId]) -> Result<Vec<User>>;
    async fn create(&self, user: &User) -> Result<()>;
    async fn update(&self, user: &User) -> Result<bool>;
    async fn search_by_role(&self, role: Role) -> Result<Vec<User>>;
}

#[async_trait]
pub trait PushConfigsRepo: Send + Sync {
    async fn get_configs_for_user(&self, user_id: UserId) -> Result<Vec<PushNotificationConfig>>;
    async fn remove_configs(&self, device_id: &str) -> Result<u64>;
}

/// Typed repositories of the storage gateway, bundled for injection into
/// handlers. Every call runs on its own short-lived pooled connection and
/// commits before returning, so no transaction is ever held across a
/// broadcast or push publication.
#[derive(Clone)]
pub struct StorageHandle {
    pub chats: Arc<dyn ChatsRepo>,
    pub matches: Arc<dyn MatchesRepo>,
    pub tickets: Arc<dyn TicketsRepo>,
    pub users: Arc<dyn UsersRepo>,
    pub push_configs: Arc<dyn PushConfigsRepo>,
}

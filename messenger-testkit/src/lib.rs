//! In-memory implementations of the dispatch seams, for tests. Behavior
//! mirrors the production components (clamp-at-zero counters, if-exists
//! semantics, membership windowing) without external services.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use messenger_core::connections::{BroadcastOptions, Broadcaster};
use messenger_core::counters::{CounterCache, UnreadCounterKey};
use messenger_core::events::{
    timestamp_now, ChatId, ConnectionId, MatchId, MessageContent, MessageId, PresenceStatus,
    Role, SendPushQueueMessage, TicketId, UpdateEnvelope, UserId,
};
use messenger_core::presence::PresenceService;
use messenger_core::protocol::{ServerUpdate, UnreadCountersUpdate};
use messenger_core::publisher::{PushQueue, UpdatePublisher};
use messenger_core::storage::{
    Chat, ChatUserDTO, ChatsRepo, Match, MatchScout, MatchesRepo, NewChatMembership,
    PushConfigsRepo, PushNotificationConfig, ScoutMembershipWindow, StorageHandle, StoredMessage,
    Ticket, TicketsRepo, User, UsersRepo,
};

/// Full membership row, including the windowing fields the DTO omits.
#[derive(Debug, Clone)]
pub struct MembershipRecord {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub user_role: Role,
    pub is_primary_member: bool,
    pub has_write_permission: bool,
    pub is_archive_member: bool,
    pub first_available_message_id: Option<MessageId>,
    pub last_available_message_id: Option<MessageId>,
}

#[derive(Default)]
struct StorageState {
    chats: HashMap<ChatId, Chat>,
    memberships: Vec<MembershipRecord>,
    messages: Vec<StoredMessage>,
    next_message_id: MessageId,
    matches: HashMap<MatchId, Match>,
    scouts: Vec<MatchScout>,
    tickets: HashMap<TicketId, Ticket>,
    users: HashMap<UserId, User>,
    push_configs: Vec<PushNotificationConfig>,
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<StorageState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> StorageHandle {
        let shared = Arc::new(self.clone());
        StorageHandle {
            chats: shared.clone(),
            matches: shared.clone(),
            tickets: shared.clone(),
            users: shared.clone(),
            push_configs: shared,
        }
    }

    pub fn add_chat(&self, chat: Chat) {
        let mut state = self.state.lock().unwrap();
        state.chats.insert(chat.id, chat);
    }

    pub fn add_membership(&self, record: MembershipRecord) {
        let mut state = self.state.lock().unwrap();
        state.memberships.push(record);
    }

    /// Ordinary active member with write permission.
    pub fn add_member(&self, chat_id: ChatId, user_id: UserId, role: Role) {
        self.add_membership(MembershipRecord {
            chat_id,
            user_id,
            user_role: role,
            is_primary_member: true,
            has_write_permission: true,
            is_archive_member: false,
            first_available_message_id: None,
            last_available_message_id: None,
        });
    }

    pub fn add_match(&self, match_row: Match) {
        let mut state = self.state.lock().unwrap();
        state.matches.insert(match_row.id, match_row);
    }

    pub fn add_scout(&self, scout: MatchScout) {
        let mut state = self.state.lock().unwrap();
        state.scouts.push(scout);
    }

    pub fn add_ticket(&self, ticket: Ticket) {
        let mut state = self.state.lock().unwrap();
        state.tickets.insert(ticket.id, ticket);
    }

    pub fn add_user(&self, user: User) {
        let mut state = self.state.lock().unwrap();
        state.users.insert(user.id, user);
    }

    pub fn add_push_config(
        &self,
        user_id: UserId,
        device_id: &str,
        last_alive_at: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.push_configs.push(PushNotificationConfig {
            device_id: device_id.to_string(),
            user_id,
            endpoint: format!("https://push.example/{}", device_id),
            p256dh: "BNcRdreALRFXTkOOUHK1EtK2wtaz5Ry4YfYCA_0QTpQtUbVlUls0VJXg7A8u-Ts1XbjhazAkj7I99e8QcYP7AcY".to_string(),
            auth: "tBHItJI5svbpez7KI4CCXg".to_string(),
            last_alive_at,
        });
    }

    pub fn chat(&self, chat_id: ChatId) -> Option<Chat> {
        self.state.lock().unwrap().chats.get(&chat_id).cloned()
    }

    pub fn messages_in_chat(&self, chat_id: ChatId) -> Vec<StoredMessage> {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect()
    }

    pub fn membership(&self, chat_id: ChatId, user_id: UserId) -> Option<MembershipRecord> {
        self.state
            .lock()
            .unwrap()
            .memberships
            .iter()
            .find(|m| m.chat_id == chat_id && m.user_id == user_id)
            .cloned()
    }

    pub fn match_row(&self, match_id: MatchId) -> Option<Match> {
        self.state.lock().unwrap().matches.get(&match_id).cloned()
    }

    pub fn scouts_of(&self, match_id: MatchId) -> Vec<MatchScout> {
        self.state
            .lock()
            .unwrap()
            .scouts
            .iter()
            .filter(|s| s.match_id == match_id)
            .cloned()
            .collect()
    }

    pub fn user(&self, user_id: UserId) -> Option<User> {
        self.state.lock().unwrap().users.get(&user_id).cloned()
    }

    pub fn has_push_config(&self, device_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .push_configs
            .iter()
            .any(|c| c.device_id == device_id)
    }
}

#[async_trait]
impl ChatsRepo for MemoryStorage {
    async fn get_chat_by_id(&self, chat_id: ChatId) -> Result<Option<Chat>> {
        Ok(self.chat(chat_id))
    }

    async fn get_chat_by_message_id(&self, message_id: MessageId) -> Result<Option<Chat>> {
        let state = self.state.lock().unwrap();
        let chat_id = state
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.chat_id);
        Ok(chat_id.and_then(|id| state.chats.get(&id).cloned()))
    }

    async fn get_users_in_chat(&self, chat_id: ChatId) -> Result<Vec<ChatUserDTO>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .memberships
            .iter()
            .filter(|m| m.chat_id == chat_id && !m.is_archive_member)
            .map(|m| ChatUserDTO {
                user_id: m.user_id,
                user_role: m.user_role,
                is_primary_member: m.is_primary_member,
                has_write_permission: m.has_write_permission,
            })
            .collect())
    }

    async fn get_chats_of_user(&self, user_id: UserId) -> Result<Vec<ChatId>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.chat_id)
            .collect())
    }

    async fn get_comember_ids(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let state = self.state.lock().unwrap();
        let chat_ids: HashSet<ChatId> = state
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.chat_id)
            .collect();
        let mut seen = HashSet::new();
        Ok(state
            .memberships
            .iter()
            .filter(|m| chat_ids.contains(&m.chat_id) && m.user_id != user_id)
            .filter(|m| seen.insert(m.user_id))
            .map(|m| m.user_id)
            .collect())
    }

    async fn get_open_chats_by_match(&self, match_id: MatchId) -> Result<Vec<Chat>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .chats
            .values()
            .filter(|c| c.match_id == Some(match_id) && !c.is_closed)
            .cloned()
            .collect())
    }

    async fn count_chats_by_match(&self, match_id: MatchId) -> Result<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .chats
            .values()
            .filter(|c| c.match_id == Some(match_id))
            .count() as i64)
    }

    async fn close_chats(&self, chat_ids: &[ChatId]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for chat_id in chat_ids {
            if let Some(chat) = state.chats.get_mut(chat_id) {
                chat.is_closed = true;
            }
        }
        Ok(())
    }

    async fn append_system_message(
        &self,
        chat_id: ChatId,
        content: &MessageContent,
    ) -> Result<StoredMessage> {
        let mut state = self.state.lock().unwrap();
        state.next_message_id += 1;
        let message = StoredMessage {
            id: state.next_message_id,
            chat_id,
            sender_id: None,
            content: content.clone(),
            created_at: timestamp_now(),
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn update_scout_membership(
        &self,
        chat_id: ChatId,
        scout_id: UserId,
        window: ScoutMembershipWindow,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for membership in state
            .memberships
            .iter_mut()
            .filter(|m| m.chat_id == chat_id && m.user_id == scout_id)
        {
            membership.first_available_message_id = window.first_available_message_id;
            membership.last_available_message_id = window.last_available_message_id;
            membership.is_archive_member = window.is_archive_member;
            membership.has_write_permission = window.has_write_permission;
        }
        Ok(())
    }

    async fn add_user_to_chat(&self, membership: NewChatMembership) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state
            .memberships
            .iter()
            .any(|m| m.chat_id == membership.chat_id && m.user_id == membership.user_id)
        {
            return Ok(false);
        }
        state.memberships.push(MembershipRecord {
            chat_id: membership.chat_id,
            user_id: membership.user_id,
            user_role: membership.user_role,
            is_primary_member: membership.is_primary_member,
            has_write_permission: membership.has_write_permission,
            is_archive_member: false,
            first_available_message_id: membership.first_available_message_id,
            last_available_message_id: None,
        });
        Ok(true)
    }
}

#[async_trait]
impl MatchesRepo for MemoryStorage {
    async fn get_match_by_id(&self, match_id: MatchId) -> Result<Option<Match>> {
        Ok(self.match_row(match_id))
    }

    async fn get_scouts(&self, match_id: MatchId) -> Result<Vec<MatchScout>> {
        Ok(self.scouts_of(match_id))
    }

    async fn upsert_match(&self, match_row: &Match) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.matches.insert(match_row.id, match_row.clone());
        Ok(())
    }

    async fn update_state(
        &self,
        match_id: MatchId,
        new_state: messenger_core::events::MatchState,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.matches.get_mut(&match_id) {
            Some(row) => {
                row.state = new_state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_basic_data(
        &self,
        match_id: MatchId,
        team_a_name: &str,
        team_b_name: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.matches.get_mut(&match_id) {
            Some(row) => {
                row.team_a_name = team_a_name.to_string();
                row.team_b_name = team_b_name.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn replace_scouts(&self, match_id: MatchId, scouts: &[MatchScout]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.scouts.retain(|s| s.match_id != match_id);
        state.scouts.extend_from_slice(scouts);
        Ok(())
    }

    async fn delete_match(&self, match_id: MatchId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.scouts.retain(|s| s.match_id != match_id);
        state.matches.remove(&match_id);
        Ok(())
    }

    async fn get_related_user_ids(&self, match_id: MatchId) -> Result<Vec<UserId>> {
        let state = self.state.lock().unwrap();
        let mut related: HashSet<UserId> = state
            .scouts
            .iter()
            .filter(|s| s.match_id == match_id)
            .map(|s| s.user_id)
            .collect();
        let chat_ids: HashSet<ChatId> = state
            .chats
            .values()
            .filter(|c| c.match_id == Some(match_id))
            .map(|c| c.id)
            .collect();
        related.extend(
            state
                .memberships
                .iter()
                .filter(|m| chat_ids.contains(&m.chat_id))
                .map(|m| m.user_id),
        );
        Ok(related.into_iter().collect())
    }
}

#[async_trait]
impl TicketsRepo for MemoryStorage {
    async fn get_ticket_by_id(&self, ticket_id: TicketId) -> Result<Option<Ticket>> {
        Ok(self.state.lock().unwrap().tickets.get(&ticket_id).cloned())
    }
}

#[async_trait]
impl UsersRepo for MemoryStorage {
    async fn get_by_id(&self, user_id: UserId) -> Result<Option<User>> {
        Ok(self.user(user_id))
    }

    async fn get_by_ids(&self, user_ids: &[UserId]) -> Result<Vec<User>> {
        let state = self.state.lock().unwrap();
        Ok(user_ids
            .iter()
            .filter_map(|id| state.users.get(id).cloned())
            .collect())
    }

    async fn create(&self, user: &User) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.users.entry(user.id).or_insert_with(|| user.clone());
        Ok(())
    }

    async fn update(&self, user: &User) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn search_by_role(&self, role: Role) -> Result<Vec<User>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .users
            .values()
            .filter(|u| u.role == role)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PushConfigsRepo for MemoryStorage {
    async fn get_configs_for_user(&self, user_id: UserId) -> Result<Vec<PushNotificationConfig>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .push_configs
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn remove_configs(&self, device_id: &str) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let before = state.push_configs.len();
        state.push_configs.retain(|c| c.device_id != device_id);
        Ok((before - state.push_configs.len()) as u64)
    }
}

/// Counter cache over a plain map, same clamp-at-zero and if-exists
/// semantics as the Lua scripts.
#[derive(Default)]
pub struct MemoryCounterCache {
    counters: Mutex<HashMap<String, i64>>,
    published: Mutex<Vec<UnreadCountersUpdate>>,
}

impl MemoryCounterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a key, as a live session would on first fetch.
    pub fn seed(&self, user_id: UserId, scope: UnreadCounterKey, value: i64) {
        self.counters
            .lock()
            .unwrap()
            .insert(scope.render(user_id), value);
    }

    pub fn value(&self, user_id: UserId, scope: UnreadCounterKey) -> Option<i64> {
        self.counters
            .lock()
            .unwrap()
            .get(&scope.render(user_id))
            .copied()
    }

    pub fn published_totals(&self) -> Vec<UnreadCountersUpdate> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl CounterCache for MemoryCounterCache {
    async fn increment_if_exists(
        &self,
        user_id: UserId,
        scopes: &[UnreadCounterKey],
        amount: i64,
    ) -> Result<Vec<Option<i64>>> {
        let mut counters = self.counters.lock().unwrap();
        Ok(scopes
            .iter()
            .map(|scope| {
                counters.get_mut(&scope.render(user_id)).map(|value| {
                    *value += amount;
                    *value
                })
            })
            .collect())
    }

    async fn decrement_if_exists(
        &self,
        user_id: UserId,
        scopes: &[UnreadCounterKey],
        amount: i64,
    ) -> Result<Vec<Option<i64>>> {
        let mut counters = self.counters.lock().unwrap();
        Ok(scopes
            .iter()
            .map(|scope| {
                counters.get_mut(&scope.render(user_id)).map(|value| {
                    *value = (*value - amount).max(0);
                    *value
                })
            })
            .collect())
    }

    async fn publish_total(&self, update: &UnreadCountersUpdate) -> Result<()> {
        self.published.lock().unwrap().push(update.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastRecord {
    pub user_ids: Vec<UserId>,
    pub update: ServerUpdate,
    pub skip_connection: Option<ConnectionId>,
    pub skip_user: Option<UserId>,
}

/// Records every broadcast; "delivery" counts one session per non-skipped
/// user.
#[derive(Default)]
pub struct RecordingBroadcaster {
    records: Mutex<Vec<BroadcastRecord>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<BroadcastRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn broadcast(
        &self,
        user_ids: &[UserId],
        update: &ServerUpdate,
        options: BroadcastOptions,
    ) -> Result<usize> {
        let delivered = user_ids
            .iter()
            .filter(|id| Some(**id) != options.skip_user)
            .count();
        self.records.lock().unwrap().push(BroadcastRecord {
            user_ids: user_ids.to_vec(),
            update: update.clone(),
            skip_connection: options.skip_connection,
            skip_user: options.skip_user,
        });
        Ok(delivered)
    }
}

#[derive(Default)]
pub struct MemoryPushQueue {
    messages: Mutex<Vec<SendPushQueueMessage>>,
}

impl MemoryPushQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<SendPushQueueMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushQueue for MemoryPushQueue {
    async fn enqueue(&self, message: &SendPushQueueMessage) -> Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct CapturingUpdatePublisher {
    envelopes: Mutex<Vec<UpdateEnvelope>>,
}

impl CapturingUpdatePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<UpdateEnvelope> {
        self.envelopes.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpdatePublisher for CapturingUpdatePublisher {
    async fn publish_update(&self, envelope: &UpdateEnvelope) -> Result<()> {
        self.envelopes.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct StubPresence {
    online: Mutex<HashSet<UserId>>,
}

impl StubPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, user_id: UserId) {
        self.online.lock().unwrap().insert(user_id);
    }
}

#[async_trait]
impl PresenceService for StubPresence {
    async fn mark_online(&self, user_id: UserId) -> Result<()> {
        self.online.lock().unwrap().insert(user_id);
        Ok(())
    }

    async fn mark_offline(&self, user_id: UserId) -> Result<()> {
        self.online.lock().unwrap().remove(&user_id);
        Ok(())
    }

    async fn get_status(&self, user_id: UserId) -> Result<PresenceStatus> {
        let online = self.online.lock().unwrap().contains(&user_id);
        Ok(if online {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        })
    }
}

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use std::collections::HashSet;

use crate::db::DbPool;
use crate::events::{ChatId, ChatType, MatchId, MatchState, MessageContent, MessageId, Role, TicketId, TicketStatus, UserId};
use crate::schema::{chat_memberships, chats, match_scouts, matches, messages, push_configs, tickets, users};
use crate::storage::{
    Chat, ChatUserDTO, ChatsRepo, Match, MatchScout, MatchesRepo, NewChatMembership,
    PushConfigsRepo, PushNotificationConfig, ScoutMembershipWindow, StorageHandle, StoredMessage,
    Ticket, TicketsRepo, User, UsersRepo,
};

/// Postgres-backed storage gateway. One pool shared across all repos; each
/// method checks out a connection, runs, and returns it.
#[derive(Clone)]
pub struct PgStorage {
    pool: std::sync::Arc<DbPool>,
}

impl PgStorage {
    pub fn new(pool: std::sync::Arc<DbPool>) -> Self {
        Self { pool }
    }

    pub fn into_handle(self) -> StorageHandle {
        let shared = std::sync::Arc::new(self);
        StorageHandle {
            chats: shared.clone(),
            matches: shared.clone(),
            tickets: shared.clone(),
            users: shared.clone(),
            push_configs: shared,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chats)]
struct ChatRow {
    id: i64,
    chat_type: String,
    match_id: Option<i64>,
    assigned_ticket_id: Option<i64>,
    is_closed: bool,
}

impl ChatRow {
    fn into_chat(self) -> Result<Chat> {
        Ok(Chat {
            id: self.id,
            chat_type: ChatType::parse(&self.chat_type)?,
            match_id: self.match_id,
            assigned_ticket_id: self.assigned_ticket_id,
            is_closed: self.is_closed,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chat_memberships)]
struct MembershipRow {
    user_id: i64,
    user_role: String,
    is_primary_member: bool,
    has_write_permission: bool,
}

impl MembershipRow {
    fn into_dto(self) -> Result<ChatUserDTO> {
        Ok(ChatUserDTO {
            user_id: self.user_id,
            user_role: Role::parse(&self.user_role)?,
            is_primary_member: self.is_primary_member,
            has_write_permission: self.has_write_permission,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = messages)]
struct MessageRow {
    id: i64,
    chat_id: i64,
    sender_id: Option<i64>,
    content: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl MessageRow {
    fn into_message(self) -> Result<StoredMessage> {
        Ok(StoredMessage {
            id: self.id,
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            content: serde_json::from_value(self.content)
                .map_err(|e| anyhow!("Malformed message content in storage: {}", e))?,
            created_at: self.created_at.timestamp(),
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = matches)]
struct MatchRow {
    id: i64,
    team_a_name: String,
    team_b_name: String,
    state: String,
}

impl MatchRow {
    fn into_match(self) -> Result<Match> {
        Ok(Match {
            id: self.id,
            team_a_name: self.team_a_name,
            team_b_name: self.team_b_name,
            state: MatchState::parse(&self.state)?,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = tickets)]
struct TicketRow {
    id: i64,
    status: String,
    created_by_user_id: i64,
    chat_id: i64,
    match_id: Option<i64>,
}

impl TicketRow {
    fn into_ticket(self) -> Result<Ticket> {
        Ok(Ticket {
            id: self.id,
            status: TicketStatus::parse(&self.status)?,
            created_by_user_id: self.created_by_user_id,
            chat_id: self.chat_id,
            match_id: self.match_id,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = users)]
struct UserRow {
    id: i64,
    name: String,
    role: String,
    scout_number: Option<i64>,
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        Ok(User {
            id: self.id,
            name: self.name,
            role: Role::parse(&self.role)?,
            scout_number: self.scout_number,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = push_configs)]
struct PushConfigRow {
    device_id: String,
    user_id: i64,
    endpoint: String,
    p256dh: String,
    auth: String,
    last_alive_at: DateTime<Utc>,
}

impl PushConfigRow {
    fn into_config(self) -> PushNotificationConfig {
        PushNotificationConfig {
            device_id: self.device_id,
            user_id: self.user_id,
            endpoint: self.endpoint,
            p256dh: self.p256dh,
            auth: self.auth,
            last_alive_at: self.last_alive_at,
        }
    }
}

#[async_trait]
impl ChatsRepo for PgStorage {
    async fn get_chat_by_id(&self, chat_id: ChatId) -> Result<Option<Chat>> {
        let mut conn = self.pool.get().await?;
        let row: Option<ChatRow> = chats::table
            .filter(chats::id.eq(chat_id))
            .select(ChatRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(ChatRow::into_chat).transpose()
    }

    async fn get_chat_by_message_id(&self, message_id: MessageId) -> Result<Option<Chat>> {
        let mut conn = self.pool.get().await?;
        let chat_id: Option<i64> = messages::table
            .filter(messages::id.eq(message_id))
            .select(messages::chat_id)
            .first(&mut conn)
            .await
            .optional()?;
        match chat_id {
            Some(chat_id) => self.get_chat_by_id(chat_id).await,
            None => Ok(None),
        }
    }

    async fn get_users_in_chat(&self, chat_id: ChatId) -> Result<Vec<ChatUserDTO>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<MembershipRow> = chat_memberships::table
            .filter(chat_memberships::chat_id.eq(chat_id))
            .filter(chat_memberships::is_archive_member.eq(false))
            .select(MembershipRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(MembershipRow::into_dto).collect()
    }

    async fn get_chats_of_user(&self, user_id: UserId) -> Result<Vec<ChatId>> {
        let mut conn = self.pool.get().await?;
        let ids: Vec<i64> = chat_memberships::table
            .filter(chat_memberships::user_id.eq(user_id))
            .select(chat_memberships::chat_id)
            .load(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn get_comember_ids(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let chat_ids = self.get_chats_of_user(user_id).await?;
        if chat_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;
        let ids: Vec<i64> = chat_memberships::table
            .filter(chat_memberships::chat_id.eq_any(&chat_ids))
            .filter(chat_memberships::user_id.ne(user_id))
            .select(chat_memberships::user_id)
            .distinct()
            .load(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn get_open_chats_by_match(&self, match_id: MatchId) -> Result<Vec<Chat>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<ChatRow> = chats::table
            .filter(chats::match_id.eq(match_id))
            .filter(chats::is_closed.eq(false))
            .select(ChatRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(ChatRow::into_chat).collect()
    }

    async fn count_chats_by_match(&self, match_id: MatchId) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        let count: i64 = chats::table
            .filter(chats::match_id.eq(match_id))
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(count)
    }

    async fn close_chats(&self, chat_ids: &[ChatId]) -> Result<()> {
        if chat_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        diesel::update(chats::table.filter(chats::id.eq_any(chat_ids)))
            .set((chats::is_closed.eq(true), chats::updated_at.eq(Utc::now())))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn append_system_message(
        &self,
        chat_id: ChatId,
        content: &MessageContent,
    ) -> Result<StoredMessage> {
        let mut conn = self.pool.get().await?;
        let content_json = serde_json::to_value(content)?;
        let row: MessageRow = diesel::insert_into(messages::table)
            .values((
                messages::chat_id.eq(chat_id),
                messages::sender_id.eq(None::<i64>),
                messages::content.eq(content_json),
            ))
            .returning(MessageRow::as_select())
            .get_result(&mut conn)
            .await?;
        row.into_message()
    }

    async fn update_scout_membership(
        &self,
        chat_id: ChatId,
        scout_id: UserId,
        window: ScoutMembershipWindow,
    ) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::update(
            chat_memberships::table
                .filter(chat_memberships::chat_id.eq(chat_id))
                .filter(chat_memberships::user_id.eq(scout_id)),
        )
        .set((
            chat_memberships::first_available_message_id.eq(window.first_available_message_id),
            chat_memberships::last_available_message_id.eq(window.last_available_message_id),
            chat_memberships::is_archive_member.eq(window.is_archive_member),
            chat_memberships::has_write_permission.eq(window.has_write_permission),
        ))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn add_user_to_chat(&self, membership: NewChatMembership) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let exists: Option<i64> = chat_memberships::table
            .filter(chat_memberships::chat_id.eq(membership.chat_id))
            .filter(chat_memberships::user_id.eq(membership.user_id))
            .select(chat_memberships::id)
            .first(&mut conn)
            .await
            .optional()?;
        if exists.is_some() {
            return Ok(false);
        }
        diesel::insert_into(chat_memberships::table)
            .values((
                chat_memberships::chat_id.eq(membership.chat_id),
                chat_memberships::user_id.eq(membership.user_id),
                chat_memberships::user_role.eq(membership.user_role.as_str()),
                chat_memberships::is_primary_member.eq(membership.is_primary_member),
                chat_memberships::has_write_permission.eq(membership.has_write_permission),
                chat_memberships::is_archive_member.eq(false),
                chat_memberships::first_available_message_id
                    .eq(membership.first_available_message_id),
                chat_memberships::last_read_message_id.eq(0i64),
            ))
            .execute(&mut conn)
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl MatchesRepo for PgStorage {
    async fn get_match_by_id(&self, match_id: MatchId) -> Result<Option<Match>> {
        let mut conn = self.pool.get().await?;
        let row: Option<MatchRow> = matches::table
            .filter(matches::id.eq(match_id))
            .select(MatchRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(MatchRow::into_match).transpose()
    }

    async fn get_scouts(&self, match_id: MatchId) -> Result<Vec<MatchScout>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<(i64, i64, Option<i64>, bool)> = match_scouts::table
            .filter(match_scouts::match_id.eq(match_id))
            .select((
                match_scouts::match_id,
                match_scouts::user_id,
                match_scouts::scout_number,
                match_scouts::is_main_scout,
            ))
            .load(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(match_id, user_id, scout_number, is_main_scout)| MatchScout {
                match_id,
                user_id,
                scout_number,
                is_main_scout,
            })
            .collect())
    }

    async fn upsert_match(&self, match_row: &Match) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(matches::table)
            .values((
                matches::id.eq(match_row.id),
                matches::team_a_name.eq(&match_row.team_a_name),
                matches::team_b_name.eq(&match_row.team_b_name),
                matches::state.eq(match_row.state.as_str()),
            ))
            .on_conflict(matches::id)
            .do_update()
            .set((
                matches::team_a_name.eq(&match_row.team_a_name),
                matches::team_b_name.eq(&match_row.team_b_name),
                matches::state.eq(match_row.state.as_str()),
                matches::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn update_state(&self, match_id: MatchId, state: MatchState) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(matches::table.filter(matches::id.eq(match_id)))
            .set((matches::state.eq(state.as_str()), matches::updated_at.eq(Utc::now())))
            .execute(&mut conn)
            .await?;
        Ok(updated > 0)
    }

    async fn update_basic_data(
        &self,
        match_id: MatchId,
        team_a_name: &str,
        team_b_name: &str,
    ) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(matches::table.filter(matches::id.eq(match_id)))
            .set((
                matches::team_a_name.eq(team_a_name),
                matches::team_b_name.eq(team_b_name),
                matches::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(updated > 0)
    }

    async fn replace_scouts(&self, match_id: MatchId, scouts: &[MatchScout]) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::delete(match_scouts::table.filter(match_scouts::match_id.eq(match_id)))
            .execute(&mut conn)
            .await?;
        if scouts.is_empty() {
            return Ok(());
        }
        let rows: Vec<_> = scouts
            .iter()
            .map(|s| {
                (
                    match_scouts::match_id.eq(match_id),
                    match_scouts::user_id.eq(s.user_id),
                    match_scouts::scout_number.eq(s.scout_number),
                    match_scouts::is_main_scout.eq(s.is_main_scout),
                )
            })
            .collect();
        diesel::insert_into(match_scouts::table)
            .values(rows)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_match(&self, match_id: MatchId) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::delete(match_scouts::table.filter(match_scouts::match_id.eq(match_id)))
            .execute(&mut conn)
            .await?;
        diesel::delete(matches::table.filter(matches::id.eq(match_id)))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_related_user_ids(&self, match_id: MatchId) -> Result<Vec<UserId>> {
        let mut conn = self.pool.get().await?;
        let scout_ids: Vec<i64> = match_scouts::table
            .filter(match_scouts::match_id.eq(match_id))
            .select(match_scouts::user_id)
            .load(&mut conn)
            .await?;
        let chat_ids: Vec<i64> = chats::table
            .filter(chats::match_id.eq(match_id))
            .select(chats::id)
            .load(&mut conn)
            .await?;
        let mut related: HashSet<i64> = scout_ids.into_iter().collect();
        if !chat_ids.is_empty() {
            let member_ids: Vec<i64> = chat_memberships::table
                .filter(chat_memberships::chat_id.eq_any(&chat_ids))
                .select(chat_memberships::user_id)
                .distinct()
                .load(&mut conn)
                .await?;
            related.extend(member_ids);
        }
        Ok(related.into_iter().collect())
    }
}

#[async_trait]
impl TicketsRepo for PgStorage {
    async fn get_ticket_by_id(&self, ticket_id: TicketId) -> Result<Option<Ticket>> {
        let mut conn = self.pool.get().await?;
        let row: Option<TicketRow> = tickets::table
            .filter(tickets::id.eq(ticket_id))
            .select(TicketRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(TicketRow::into_ticket).transpose()
    }
}

#[async_trait]
impl UsersRepo for PgStorage {
    async fn get_by_id(&self, user_id: UserId) -> Result<Option<User>> {
        let mut conn = self.pool.get().await?;
        let row: Option<UserRow> = users::table
            .filter(users::id.eq(user_id))
            .select(UserRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(UserRow::into_user).transpose()
    }

    async fn get_by_ids(&self, user_ids: &[UserId]) -> Result<Vec<User>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;
        let rows: Vec<UserRow> = users::table
            .filter(users::id.eq_any(user_ids))
            .select(UserRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(UserRow::into_user).collect()
    }

    async fn create(&self, user: &User) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(users::table)
            .values((
                users::id.eq(user.id),
                users::name.eq(&user.name),
                users::role.eq(user.role.as_str()),
                users::scout_number.eq(user.scout_number),
            ))
            .on_conflict(users::id)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn update(&self, user: &User) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(users::table.filter(users::id.eq(user.id)))
            .set((
                users::name.eq(&user.name),
                users::role.eq(user.role.as_str()),
                users::scout_number.eq(user.scout_number),
            ))
            .execute(&mut conn)
            .await?;
        Ok(updated > 0)
    }

    async fn search_by_role(&self, role: Role) -> Result<Vec<User>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<UserRow> = users::table
            .filter(users::role.eq(role.as_str()))
            .select(UserRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(UserRow::into_user).collect()
    }
}

#[async_trait]
impl PushConfigsRepo for PgStorage {
    async fn get_configs_for_user(&self, user_id: UserId) -> Result<Vec<PushNotificationConfig>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<PushConfigRow> = push_configs::table
            .filter(push_configs::user_id.eq(user_id))
            .select(PushConfigRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(PushConfigRow::into_config).collect())
    }

    async fn remove_configs(&self, device_id: &str) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let removed =
            diesel::delete(push_configs::table.filter(push_configs::device_id.eq(device_id)))
                .execute(&mut conn)
                .await?;
        Ok(removed as u64)
    }
}

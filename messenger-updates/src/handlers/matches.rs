use anyhow::{anyhow, Result};
use async_trait::async_trait;
use messenger_core::connections::BroadcastOptions;
use messenger_core::events::{
    ChatCloseReason, EventKind, MatchScoutData, MatchState, MessageContent, Role, SourceEvent,
    UpdateEnvelope,
};
use messenger_core::protocol::ServerUpdate;
use messenger_core::storage::{Match, MatchScout, NewChatMembership, ScoutMembershipWindow, User};
use tracing;

use super::{HandlerContext, UpdateHandler};

/// Scout rows arrive from the match collaborator before the user service
/// has necessarily seen the scout, so user rows are provisioned on first
/// sight.
async fn provision_scout_users(ctx: &HandlerContext, scouts: &[MatchScoutData]) -> Result<()> {
    let ids: Vec<i64> = scouts.iter().map(|s| s.user_id).collect();
    let known = ctx.storage.users.get_by_ids(&ids).await?;
    for scout in scouts {
        if known.iter().any(|u| u.id == scout.user_id) {
            continue;
        }
        tracing::info!("Provisioning scout user {}", scout.user_id);
        ctx.storage
            .users
            .create(&User {
                id: scout.user_id,
                name: scout.name.clone(),
                role: Role::Scout,
                scout_number: scout.scout_number,
            })
            .await?;
    }
    Ok(())
}

/// Appends the "chat closed" system message and re-publishes it as a
/// message event, so broadcast, counters and push exemption all run through
/// the ordinary message path. Returns the appended message id.
async fn append_and_republish_close(
    ctx: &HandlerContext,
    chat_id: i64,
    reason: ChatCloseReason,
) -> Result<i64> {
    let content = MessageContent::ChatClosedNotification { reason };
    let message = ctx.storage.chats.append_system_message(chat_id, &content).await?;
    let synthetic = SourceEvent::MessageSentToChat {
        message_id: message.id,
        chat_id,
        sender_id: None,
        initiator_id: None,
        content_raw: content.encode()?,
        msg_created_at: message.created_at,
        do_not_increment_counter: true,
    };
    ctx.update_publisher
        .publish_update(&UpdateEnvelope::new(synthetic))
        .await?;
    Ok(message.id)
}

pub struct MatchCreatedHandler;

#[async_trait]
impl UpdateHandler for MatchCreatedHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::MatchCreated
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::MatchCreated { payload } = &envelope.event else {
            return Err(anyhow!("MatchCreatedHandler received a foreign event"));
        };

        provision_scout_users(ctx, &payload.scouts).await?;
        ctx.storage
            .matches
            .upsert_match(&Match {
                id: payload.match_id,
                team_a_name: payload.team_a_name.clone(),
                team_b_name: payload.team_b_name.clone(),
                state: payload.state,
            })
            .await?;
        let scouts: Vec<MatchScout> = payload
            .scouts
            .iter()
            .map(|s| MatchScout {
                match_id: payload.match_id,
                user_id: s.user_id,
                scout_number: s.scout_number,
                is_main_scout: s.is_main_scout,
            })
            .collect();
        ctx.storage
            .matches
            .replace_scouts(payload.match_id, &scouts)
            .await?;

        let audience = ctx.storage.matches.get_related_user_ids(payload.match_id).await?;
        let update = ServerUpdate::MatchCreated {
            match_id: payload.match_id,
            team_a_name: payload.team_a_name.clone(),
            team_b_name: payload.team_b_name.clone(),
            state: payload.state,
        };
        ctx.broadcaster
            .broadcast(&audience, &update, BroadcastOptions::default())
            .await?;
        Ok(())
    }
}

pub struct MatchDataChangedHandler;

#[async_trait]
impl UpdateHandler for MatchDataChangedHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::MatchDataChanged
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::MatchDataChanged {
            match_id,
            team_a_name,
            team_b_name,
        } = &envelope.event
        else {
            return Err(anyhow!("MatchDataChangedHandler received a foreign event"));
        };

        let found = ctx
            .storage
            .matches
            .update_basic_data(*match_id, team_a_name, team_b_name)
            .await?;
        if !found {
            tracing::warn!("Data change for unknown match {}", match_id);
            return Ok(());
        }

        let audience = ctx.storage.matches.get_related_user_ids(*match_id).await?;
        let update = ServerUpdate::MatchDataChanged {
            match_id: *match_id,
            team_a_name: team_a_name.clone(),
            team_b_name: team_b_name.clone(),
        };
        ctx.broadcaster
            .broadcast(&audience, &update, BroadcastOptions::default())
            .await?;
        Ok(())
    }
}

pub struct MatchStateChangedHandler;

#[async_trait]
impl UpdateHandler for MatchStateChangedHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::MatchStateChanged
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::MatchStateChanged {
            match_id,
            old_state,
            new_state,
        } = &envelope.event
        else {
            return Err(anyhow!("MatchStateChangedHandler received a foreign event"));
        };

        let found = ctx.storage.matches.update_state(*match_id, *new_state).await?;
        if !found {
            // Inactive states for unknown matches show up during backfill;
            // an unknown match going active is worth looking at.
            if new_state.is_active() {
                tracing::warn!("State change to active for unknown match {}", match_id);
            } else {
                tracing::info!(
                    "State change to {} for unknown match {}",
                    new_state.as_str(),
                    match_id
                );
            }
            return Ok(());
        }

        let audience = ctx.storage.matches.get_related_user_ids(*match_id).await?;
        let update = ServerUpdate::MatchStateChanged {
            match_id: *match_id,
            old_state: *old_state,
            new_state: *new_state,
        };
        ctx.broadcaster
            .broadcast(&audience, &update, BroadcastOptions::default())
            .await?;

        if old_state.is_active() && !new_state.is_active() {
            self.close_match_chats(ctx, *match_id, *new_state).await?;
        }
        Ok(())
    }
}

impl MatchStateChangedHandler {
    async fn close_match_chats(
        &self,
        ctx: &HandlerContext,
        match_id: i64,
        new_state: MatchState,
    ) -> Result<()> {
        let reason = match new_state {
            MatchState::Cancelled => ChatCloseReason::MatchCancelled,
            _ => ChatCloseReason::MatchFinished,
        };

        let open_chats = ctx.storage.chats.get_open_chats_by_match(match_id).await?;
        if !open_chats.is_empty() {
            let chat_ids: Vec<i64> = open_chats.iter().map(|c| c.id).collect();
            for chat in &open_chats {
                append_and_republish_close(ctx, chat.id, reason).await?;
            }
            ctx.storage.chats.close_chats(&chat_ids).await?;
            for chat_id in &chat_ids {
                ctx.invalidate_chat(*chat_id).await;
            }
            tracing::info!("Closed {} chats of match {}", chat_ids.len(), match_id);
        }

        // A match that never grew a single chat leaves no trace behind.
        if ctx.storage.chats.count_chats_by_match(match_id).await? == 0 {
            ctx.storage.matches.delete_match(match_id).await?;
            tracing::info!("Deleted orphaned match {}", match_id);
        }
        Ok(())
    }
}

pub struct MatchScoutsChangedHandler;

#[async_trait]
impl UpdateHandler for MatchScoutsChangedHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::MatchScoutsChanged
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::MatchScoutsChanged { match_id, scouts } = &envelope.event else {
            return Err(anyhow!("MatchScoutsChangedHandler received a foreign event"));
        };

        let previous = ctx.storage.matches.get_scouts(*match_id).await?;
        let old_main = previous.iter().find(|s| s.is_main_scout).map(|s| s.user_id);
        let new_main = scouts.iter().find(|s| s.is_main_scout).map(|s| s.user_id);

        provision_scout_users(ctx, scouts).await?;
        let rows: Vec<MatchScout> = scouts
            .iter()
            .map(|s| MatchScout {
                match_id: *match_id,
                user_id: s.user_id,
                scout_number: s.scout_number,
                is_main_scout: s.is_main_scout,
            })
            .collect();
        ctx.storage.matches.replace_scouts(*match_id, &rows).await?;

        if old_main == new_main {
            return Ok(());
        }
        tracing::info!(
            "Main scout of match {} changed: {:?} -> {:?}",
            match_id,
            old_main,
            new_main
        );

        for chat in ctx.storage.chats.get_open_chats_by_match(*match_id).await? {
            let boundary =
                append_and_republish_close(ctx, chat.id, ChatCloseReason::MainScoutChanged)
                    .await?;

            // The outgoing scout keeps history up to the boundary message,
            // the incoming scout sees the chat from it onward.
            if let Some(outgoing) = old_main {
                ctx.storage
                    .chats
                    .update_scout_membership(
                        chat.id,
                        outgoing,
                        ScoutMembershipWindow {
                            first_available_message_id: None,
                            last_available_message_id: Some(boundary),
                            is_archive_member: true,
                            has_write_permission: false,
                        },
                    )
                    .await?;
            }
            if let Some(incoming) = new_main {
                let added = ctx
                    .storage
                    .chats
                    .add_user_to_chat(NewChatMembership {
                        chat_id: chat.id,
                        user_id: incoming,
                        user_role: Role::Scout,
                        is_primary_member: true,
                        has_write_permission: true,
                        first_available_message_id: Some(boundary),
                    })
                    .await?;
                if !added {
                    ctx.storage
                        .chats
                        .update_scout_membership(
                            chat.id,
                            incoming,
                            ScoutMembershipWindow {
                                first_available_message_id: Some(boundary),
                                last_available_message_id: None,
                                is_archive_member: false,
                                has_write_permission: true,
                            },
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }
}

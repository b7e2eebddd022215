use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = i64;
pub type ChatId = i64;
pub type MessageId = i64;
pub type MatchId = i64;
pub type TicketId = i64;
pub type ConnectionId = String;

pub fn timestamp_now() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Scout,
    Bookmaker,
    Supervisor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Scout => "scout",
            Role::Bookmaker => "bookmaker",
            Role::Supervisor => "supervisor",
        }
    }

    pub fn parse(value: &str) -> Result<Role> {
        match value {
            "scout" => Ok(Role::Scout),
            "bookmaker" => Ok(Role::Bookmaker),
            "supervisor" => Ok(Role::Supervisor),
            other => Err(anyhow!("Unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Personal,
    Match,
    Ticket,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Personal => "personal",
            ChatType::Match => "match",
            ChatType::Ticket => "ticket",
        }
    }

    pub fn parse(value: &str) -> Result<ChatType> {
        match value {
            "personal" => Ok(ChatType::Personal),
            "match" => Ok(ChatType::Match),
            "ticket" => Ok(ChatType::Ticket),
            other => Err(anyhow!("Unknown chat type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    Planned,
    Active,
    Finished,
    Cancelled,
}

impl MatchState {
    pub fn is_active(&self) -> bool {
        matches!(self, MatchState::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchState::Planned => "planned",
            MatchState::Active => "active",
            MatchState::Finished => "finished",
            MatchState::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<MatchState> {
        match value {
            "planned" => Ok(MatchState::Planned),
            "active" => Ok(MatchState::Active),
            "finished" => Ok(MatchState::Finished),
            "cancelled" => Ok(MatchState::Cancelled),
            other => Err(anyhow!("Unknown match state: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    InProgress,
    Solved,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::New => "new",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Solved => "solved",
        }
    }

    pub fn parse(value: &str) -> Result<TicketStatus> {
        match value {
            "new" => Ok(TicketStatus::New),
            "in_progress" => Ok(TicketStatus::InProgress),
            "solved" => Ok(TicketStatus::Solved),
            other => Err(anyhow!("Unknown ticket status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatCloseReason {
    MainScoutChanged,
    MatchFinished,
    MembersInactivity,
    InitiatedByUser,
    MatchCancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatOpenReason {
    InitiatedByUser,
}

/// Message body carried inside `MessageSentToChat.content_raw` and stored
/// alongside each message. System-notification kinds are appended by the
/// service itself, never typed by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    File {
        file_id: String,
        filename: String,
        size: i64,
        mime_type: String,
    },
    ChatCreatedNotification {
        created_by_user_id: UserId,
    },
    ChatOpenedNotification {
        reason: ChatOpenReason,
    },
    ChatClosedNotification {
        reason: ChatCloseReason,
    },
    UserJoinedChatNotification {
        user_id: UserId,
    },
    UserLeftChatNotification {
        user_id: UserId,
    },
    RelatedTicketCreatedNotification {
        ticket_id: TicketId,
        ticket_chat_id: ChatId,
    },
    TicketFirstMessageNotification {
        ticket_id: TicketId,
        created_from_chat_id: Option<ChatId>,
    },
    TicketClosedNotification {
        ticket_id: TicketId,
        ticket_chat_id: ChatId,
        closed_by_user_id: UserId,
    },
    TicketStatusChangedNotification {
        ticket_id: TicketId,
        status: TicketStatus,
    },
    Unsupported,
}

impl MessageContent {
    /// Users whose profiles a client needs to render this content.
    pub fn referenced_user_ids(&self) -> Vec<UserId> {
        match self {
            MessageContent::ChatCreatedNotification { created_by_user_id } => {
                vec![*created_by_user_id]
            }
            MessageContent::UserJoinedChatNotification { user_id }
            | MessageContent::UserLeftChatNotification { user_id } => vec![*user_id],
            MessageContent::TicketClosedNotification {
                closed_by_user_id, ..
            } => vec![*closed_by_user_id],
            _ => vec![],
        }
    }

    /// System-notification kinds never produce a push; everything else does.
    pub fn requires_push(&self) -> bool {
        !matches!(
            self,
            MessageContent::UserJoinedChatNotification { .. }
                | MessageContent::UserLeftChatNotification { .. }
                | MessageContent::ChatClosedNotification { .. }
                | MessageContent::ChatOpenedNotification { .. }
                | MessageContent::RelatedTicketCreatedNotification { .. }
                | MessageContent::ChatCreatedNotification { .. }
                | MessageContent::TicketClosedNotification { .. }
        )
    }

    /// Opaque transport form used in `content_raw`.
    pub fn encode(&self) -> Result<String> {
        let raw = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(raw))
    }

    pub fn decode(raw: &str) -> Result<MessageContent> {
        let bytes = STANDARD
            .decode(raw)
            .map_err(|e| anyhow!("Invalid base64 in message content: {}", e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchScoutData {
    pub user_id: UserId,
    pub name: String,
    pub scout_number: Option<i64>,
    pub is_main_scout: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub match_id: MatchId,
    pub team_a_name: String,
    pub team_b_name: String,
    pub state: MatchState,
    pub scouts: Vec<MatchScoutData>,
}

/// Domain occurrences produced by the collaborators. Identifiers only, no
/// object references, so the union survives the queue unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceEvent {
    MessageSentToChat {
        message_id: MessageId,
        chat_id: ChatId,
        sender_id: Option<UserId>,
        initiator_id: Option<UserId>,
        content_raw: String,
        msg_created_at: i64,
        #[serde(default)]
        do_not_increment_counter: bool,
    },
    DeliveryStatusChanged {
        message_id: MessageId,
        chat_id: ChatId,
        user_id: UserId,
        status: DeliveryStatus,
        updated_for_user: i64,
        updated_for_all: i64,
    },
    PresenceStatusChanged {
        user_id: UserId,
        status: PresenceStatus,
    },
    UserIsTypingMessage {
        chat_id: ChatId,
        user_id: UserId,
        is_typing: bool,
    },
    MatchCreated {
        payload: MatchSnapshot,
    },
    MatchDataChanged {
        match_id: MatchId,
        team_a_name: String,
        team_b_name: String,
    },
    MatchStateChanged {
        match_id: MatchId,
        old_state: MatchState,
        new_state: MatchState,
    },
    MatchScoutsChanged {
        match_id: MatchId,
        scouts: Vec<MatchScoutData>,
    },
    UserDataChanged {
        user_id: UserId,
        name: String,
        role: Role,
        scout_number: Option<i64>,
    },
    TicketCreated {
        created_by_user_id: UserId,
        ticket_id: TicketId,
        match_id: Option<MatchId>,
        chat_id: ChatId,
    },
    TicketStatusChanged {
        changed_by_user_id: UserId,
        ticket_id: TicketId,
        old_status: TicketStatus,
        new_status: TicketStatus,
    },
    ChatCreated {
        chat_id: ChatId,
        chat_type: ChatType,
        created_by_user_id: Option<UserId>,
        match_id: Option<MatchId>,
    },
    ReactionUpdatedMessage {
        message_id: MessageId,
        chat_id: ChatId,
        user_id: UserId,
        emoji: String,
        emoji_count: i64,
        is_deleted: bool,
    },
    MessageEdited {
        message_id: MessageId,
        chat_id: ChatId,
        content_raw: String,
    },
    MessageDeleted {
        message_id: MessageId,
        chat_id: ChatId,
    },
}

/// Dispatch key for handler registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageSentToChat,
    DeliveryStatusChanged,
    PresenceStatusChanged,
    UserIsTypingMessage,
    MatchCreated,
    MatchDataChanged,
    MatchStateChanged,
    MatchScoutsChanged,
    UserDataChanged,
    TicketCreated,
    TicketStatusChanged,
    ChatCreated,
    ReactionUpdatedMessage,
    MessageEdited,
    MessageDeleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::MessageSentToChat => "message_sent_to_chat",
            EventKind::DeliveryStatusChanged => "delivery_status_changed",
            EventKind::PresenceStatusChanged => "presence_status_changed",
            EventKind::UserIsTypingMessage => "user_is_typing_message",
            EventKind::MatchCreated => "match_created",
            EventKind::MatchDataChanged => "match_data_changed",
            EventKind::MatchStateChanged => "match_state_changed",
            EventKind::MatchScoutsChanged => "match_scouts_changed",
            EventKind::UserDataChanged => "user_data_changed",
            EventKind::TicketCreated => "ticket_created",
            EventKind::TicketStatusChanged => "ticket_status_changed",
            EventKind::ChatCreated => "chat_created",
            EventKind::ReactionUpdatedMessage => "reaction_updated_message",
            EventKind::MessageEdited => "message_edited",
            EventKind::MessageDeleted => "message_deleted",
        };
        f.write_str(name)
    }
}

impl SourceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SourceEvent::MessageSentToChat { .. } => EventKind::MessageSentToChat,
            SourceEvent::DeliveryStatusChanged { .. } => EventKind::DeliveryStatusChanged,
            SourceEvent::PresenceStatusChanged { .. } => EventKind::PresenceStatusChanged,
            SourceEvent::UserIsTypingMessage { .. } => EventKind::UserIsTypingMessage,
            SourceEvent::MatchCreated { .. } => EventKind::MatchCreated,
            SourceEvent::MatchDataChanged { .. } => EventKind::MatchDataChanged,
            SourceEvent::MatchStateChanged { .. } => EventKind::MatchStateChanged,
            SourceEvent::MatchScoutsChanged { .. } => EventKind::MatchScoutsChanged,
            SourceEvent::UserDataChanged { .. } => EventKind::UserDataChanged,
            SourceEvent::TicketCreated { .. } => EventKind::TicketCreated,
            SourceEvent::TicketStatusChanged { .. } => EventKind::TicketStatusChanged,
            SourceEvent::ChatCreated { .. } => EventKind::ChatCreated,
            SourceEvent::ReactionUpdatedMessage { .. } => EventKind::ReactionUpdatedMessage,
            SourceEvent::MessageEdited { .. } => EventKind::MessageEdited,
            SourceEvent::MessageDeleted { .. } => EventKind::MessageDeleted,
        }
    }
}

/// Queue envelope around a `SourceEvent`: the connection that triggered the
/// event (for echo suppression) and the moment it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEnvelope {
    #[serde(default)]
    pub cid: Option<ConnectionId>,
    #[serde(default = "timestamp_now")]
    pub created_at: i64,
    #[serde(flatten)]
    pub event: SourceEvent,
}

impl UpdateEnvelope {
    pub fn new(event: SourceEvent) -> Self {
        UpdateEnvelope {
            cid: None,
            created_at: timestamp_now(),
            event,
        }
    }

    pub fn with_cid(event: SourceEvent, cid: Option<ConnectionId>) -> Self {
        UpdateEnvelope {
            cid,
            created_at: timestamp_now(),
            event,
        }
    }
}

/// Hand-off from an update handler to the push pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPushQueueMessage {
    pub source_event: UpdateEnvelope,
    #[serde(default = "timestamp_now")]
    pub created_at: i64,
}

impl SendPushQueueMessage {
    pub fn new(source_event: UpdateEnvelope) -> Self {
        SendPushQueueMessage {
            source_event,
            created_at: timestamp_now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_raw_round_trip() {
        let content = MessageContent::Text {
            text: "hello".to_string(),
        };
        let raw = content.encode().unwrap();
        assert_eq!(MessageContent::decode(&raw).unwrap(), content);
    }

    #[test]
    fn envelope_json_carries_event_tag() {
        let envelope = UpdateEnvelope::new(SourceEvent::MessageDeleted {
            message_id: 7,
            chat_id: 3,
        });
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "MESSAGE_DELETED");
        assert_eq!(json["message_id"], 7);

        let parsed: UpdateEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.event, envelope.event);
    }

    #[test]
    fn system_notifications_are_push_exempt() {
        assert!(!MessageContent::ChatClosedNotification {
            reason: ChatCloseReason::MatchCancelled
        }
        .requires_push());
        assert!(!MessageContent::UserJoinedChatNotification { user_id: 1 }.requires_push());
        assert!(MessageContent::Text {
            text: "hi".to_string()
        }
        .requires_push());
        assert!(MessageContent::TicketStatusChangedNotification {
            ticket_id: 1,
            status: TicketStatus::Solved
        }
        .requires_push());
    }
}

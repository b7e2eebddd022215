use serde::{Deserialize, Serialize};

use crate::events::{
    ChatId, ChatType, DeliveryStatus, MatchId, MatchState, MessageContent, MessageId,
    PresenceStatus, Role, TicketId, TicketStatus, UserId,
};

/// Message projection sent to live sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: Option<UserId>,
    pub sent_at: i64,
    pub content: MessageContent,
    pub state: DeliveryStatus,
    pub match_id: Option<MatchId>,
}

/// Discriminated server-to-client update, one variant per event kind the
/// realtime channel carries. Serialized as JSON and published per
/// connection; the session transport itself is out of scope here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerUpdate {
    MessageReceived {
        message: MessageView,
        chat_type: ChatType,
    },
    MessageEdited {
        message_id: MessageId,
        chat_id: ChatId,
        content: MessageContent,
    },
    MessageDeleted {
        message_id: MessageId,
        chat_id: ChatId,
    },
    DeliveryStatusChanged {
        message_id: MessageId,
        chat_id: ChatId,
        state: DeliveryStatus,
        read_by: UserId,
        updated_count: i64,
        chat_type: ChatType,
        match_id: Option<MatchId>,
    },
    UserIsTyping {
        chat_id: ChatId,
        user_id: UserId,
        is_typing: bool,
    },
    PresenceStatusChanged {
        user_id: UserId,
        status: PresenceStatus,
    },
    ReactionUpdated {
        message_id: MessageId,
        chat_id: ChatId,
        user_id: UserId,
        emoji: String,
        emoji_count: i64,
        is_deleted: bool,
    },
    TicketCreated {
        ticket_id: TicketId,
        chat_id: ChatId,
        match_id: Option<MatchId>,
        created_by_user_id: UserId,
    },
    TicketStatusChanged {
        ticket_id: TicketId,
        old_status: TicketStatus,
        new_status: TicketStatus,
        changed_by_user_id: UserId,
    },
    MatchCreated {
        match_id: MatchId,
        team_a_name: String,
        team_b_name: String,
        state: MatchState,
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
    ChatCreated {
        chat_id: ChatId,
        chat_type: ChatType,
        match_id: Option<MatchId>,
        created_by_user_id: Option<UserId>,
    },
    UserDataChanged {
        user_id: UserId,
        name: String,
        role: Role,
        scout_number: Option<i64>,
    },
}

/// Published on the per-user counters channel after every TOTAL change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnreadCountersUpdate {
    pub user_id: UserId,
    pub unread_count: i64,
}

/// Match context embedded into push payloads (resolved names, not ids only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMatchData {
    pub id: MatchId,
    pub team_a_name: String,
    pub team_b_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTicketData {
    pub id: TicketId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationUserData {
    pub id: UserId,
    pub name: String,
    pub role: Role,
    pub scout_number: Option<i64>,
}

/// Push payload body, richer than the realtime update: referenced entities
/// arrive resolved because the receiving device may have no local state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushNotificationBody {
    NewMessage {
        id: MessageId,
        chat_id: ChatId,
        sent_at: i64,
        sender_id: Option<UserId>,
        content: MessageContent,
        match_data: Option<NotificationMatchData>,
        ticket_data: Option<NotificationTicketData>,
        user_data: Vec<NotificationUserData>,
    },
    TicketCreated {
        ticket_id: TicketId,
        chat_id: ChatId,
        match_data: Option<NotificationMatchData>,
        created_by: Option<NotificationUserData>,
    },
    TicketStatusChanged {
        ticket_id: TicketId,
        old_status: TicketStatus,
        new_status: TicketStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushNotificationContent {
    pub created_at: i64,
    #[serde(flatten)]
    pub body: PushNotificationBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_update_is_tagged() {
        let update = ServerUpdate::MessageDeleted {
            message_id: 1,
            chat_id: 2,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "MESSAGE_DELETED");
    }

    #[test]
    fn push_content_round_trip() {
        let content = PushNotificationContent {
            created_at: 123,
            body: PushNotificationBody::TicketStatusChanged {
                ticket_id: 5,
                old_status: TicketStatus::New,
                new_status: TicketStatus::InProgress,
            },
        };
        let json = serde_json::to_string(&content).unwrap();
        let parsed: PushNotificationContent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, content);
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use messenger_core::config::{
    Config, DatabaseConfig, KafkaConfig, NotifierConfig, PushConfig, PushRetryConfig,
    RedisConfig, UpdatesConfig,
};
use messenger_core::events::{
    timestamp_now, ChatCloseReason, ChatId, ChatType, MatchState, MessageContent, Role,
    SendPushQueueMessage, SourceEvent, TicketStatus, UpdateEnvelope, UserId,
};
use messenger_core::protocol::{PushNotificationBody, PushNotificationContent};
use messenger_core::storage::{Chat, Match, Ticket, User};
use messenger_push::sender::PUSH_TTL_SECS;
use messenger_push::{
    deliver_with_retry, process_push_message, PreparedPushNotification, PushContext, PushError,
    PushRegistry, PushSender, PushUrgency,
};
use messenger_testkit::MemoryStorage;

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        database: DatabaseConfig {
            url: "postgres://localhost/test".to_string(),
            max_connections: 1,
        },
        redis: RedisConfig {
            url: "redis://localhost".to_string(),
        },
        kafka: KafkaConfig {
            brokers: "localhost:9092".to_string(),
            consumer_group: "test".to_string(),
        },
        updates: UpdatesConfig {
            overtime_limit_secs: 300,
            presence_window_secs: 600,
        },
        push: PushConfig {
            vapid_private_key: None,
            vapid_subject: "mailto:test@localhost".to_string(),
            request_timeout_secs: 1,
            device_last_alive_threshold_secs: 86_400,
            preview_max_len: 20,
            retry: PushRetryConfig {
                max_attempts: 3,
                wait_multiplier_ms: 1,
                wait_exp_base: 2,
                max_wait_ms: 4,
            },
        },
        notifier: NotifierConfig { webhook_url: None },
    })
}

fn push_context(storage: &MemoryStorage) -> PushContext {
    PushContext {
        config: test_config(),
        storage: storage.handle(),
    }
}

/// Sender that replays a scripted sequence of outcomes; once the script is
/// exhausted every further attempt succeeds.
struct ScriptedSender {
    script: Mutex<VecDeque<Result<(), PushError>>>,
    sent: Mutex<Vec<PreparedPushNotification>>,
}

impl ScriptedSender {
    fn new(script: Vec<Result<(), PushError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn always_ok() -> Self {
        Self::new(Vec::new())
    }

    fn attempts(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn sent(&self) -> Vec<PreparedPushNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushSender for ScriptedSender {
    async fn send(&self, notification: &PreparedPushNotification) -> Result<(), PushError> {
        self.sent.lock().unwrap().push(notification.clone());
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

fn user(id: UserId, name: &str, role: Role, scout_number: Option<i64>) -> User {
    User {
        id,
        name: name.to_string(),
        role,
        scout_number,
    }
}

fn match_chat(id: ChatId, match_id: i64) -> Chat {
    Chat {
        id,
        chat_type: ChatType::Match,
        match_id: Some(match_id),
        assigned_ticket_id: None,
        is_closed: false,
    }
}

fn queued_message(content: &MessageContent, chat_id: ChatId, sender_id: UserId) -> SendPushQueueMessage {
    let event = SourceEvent::MessageSentToChat {
        message_id: 100,
        chat_id,
        sender_id: Some(sender_id),
        initiator_id: None,
        content_raw: content.encode().unwrap(),
        msg_created_at: timestamp_now(),
        do_not_increment_counter: false,
    };
    SendPushQueueMessage::new(UpdateEnvelope::new(event))
}

fn notification_for(device_id: &str, endpoint: &str) -> PreparedPushNotification {
    PreparedPushNotification {
        recipient_user_id: 20,
        device_id: device_id.to_string(),
        endpoint: endpoint.to_string(),
        p256dh: "p".to_string(),
        auth: "a".to_string(),
        payload: b"{}".to_vec(),
        ttl: PUSH_TTL_SECS,
        urgency: PushUrgency::High,
        topic: None,
    }
}

#[tokio::test]
async fn new_message_builds_per_device_with_viewer_dependent_names() {
    let storage = MemoryStorage::new();
    storage.add_chat(match_chat(1, 9));
    storage.add_match(Match {
        id: 9,
        team_a_name: "A".to_string(),
        team_b_name: "B".to_string(),
        state: MatchState::Active,
    });
    storage.add_user(user(10, "Alice Smith", Role::Scout, Some(4)));
    storage.add_user(user(20, "Bob", Role::Bookmaker, None));
    storage.add_user(user(30, "Carol", Role::Supervisor, None));
    storage.add_member(1, 10, Role::Scout);
    storage.add_member(1, 20, Role::Bookmaker);
    storage.add_member(1, 30, Role::Supervisor);
    storage.add_member(1, 40, Role::Bookmaker);
    storage.add_push_config(20, "bob-phone", Utc::now());
    storage.add_push_config(20, "bob-laptop", Utc::now());
    storage.add_push_config(30, "carol-phone", Utc::now());
    // User 40 has no registered device and silently drops out.

    let ctx = push_context(&storage);
    let registry = PushRegistry::with_default_handlers().unwrap();
    let long_text = "a text well beyond the preview limit".to_string();
    let message = queued_message(&MessageContent::Text { text: long_text }, 1, 10);

    let notifications = registry.dispatch(&ctx, &message).await.unwrap();
    assert_eq!(notifications.len(), 3);
    assert!(notifications.iter().all(|n| n.recipient_user_id != 10));
    assert!(notifications.iter().all(|n| n.urgency == PushUrgency::High));
    assert!(notifications.iter().all(|n| n.ttl == PUSH_TTL_SECS));

    let for_bob: Vec<_> = notifications
        .iter()
        .filter(|n| n.recipient_user_id == 20)
        .collect();
    assert_eq!(for_bob.len(), 2);
    let content: PushNotificationContent = serde_json::from_slice(&for_bob[0].payload).unwrap();
    match content.body {
        PushNotificationBody::NewMessage {
            content: MessageContent::Text { text },
            user_data,
            match_data,
            ..
        } => {
            // Only the push preview is truncated; 20 chars plus the ellipsis.
            assert_eq!(text, "a text well beyond t…");
            assert_eq!(user_data.len(), 1);
            assert_eq!(user_data[0].name, "Scout 4");
            assert_eq!(match_data.unwrap().team_a_name, "A");
        }
        other => panic!("unexpected body: {:?}", other),
    }

    let for_carol: Vec<_> = notifications
        .iter()
        .filter(|n| n.recipient_user_id == 30)
        .collect();
    assert_eq!(for_carol.len(), 1);
    let content: PushNotificationContent = serde_json::from_slice(&for_carol[0].payload).unwrap();
    match content.body {
        PushNotificationBody::NewMessage { user_data, .. } => {
            // Supervisors see real names.
            assert_eq!(user_data[0].name, "Alice Smith");
        }
        other => panic!("unexpected body: {:?}", other),
    }
}

#[tokio::test]
async fn stale_devices_are_evicted_lazily() {
    let storage = MemoryStorage::new();
    storage.add_chat(match_chat(1, 9));
    storage.add_user(user(10, "Sender", Role::Scout, Some(1)));
    storage.add_member(1, 10, Role::Scout);
    storage.add_member(1, 20, Role::Bookmaker);
    storage.add_push_config(20, "fresh", Utc::now());
    storage.add_push_config(20, "dusty", Utc::now() - Duration::days(2));

    let ctx = push_context(&storage);
    let registry = PushRegistry::with_default_handlers().unwrap();
    let message = queued_message(&MessageContent::Text { text: "hi".to_string() }, 1, 10);

    let notifications = registry.dispatch(&ctx, &message).await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].device_id, "fresh");
    assert!(storage.has_push_config("fresh"));
    assert!(!storage.has_push_config("dusty"));
}

#[tokio::test]
async fn push_exempt_content_yields_nothing() {
    let storage = MemoryStorage::new();
    storage.add_chat(match_chat(1, 9));
    storage.add_member(1, 20, Role::Bookmaker);
    storage.add_push_config(20, "bob-phone", Utc::now());

    let ctx = push_context(&storage);
    let registry = PushRegistry::with_default_handlers().unwrap();
    let content = MessageContent::ChatClosedNotification {
        reason: ChatCloseReason::MatchFinished,
    };
    let message = queued_message(&content, 1, 10);

    let notifications = registry.dispatch(&ctx, &message).await.unwrap();
    assert!(notifications.is_empty());
}

#[tokio::test]
async fn new_ticket_goes_to_every_supervisor_except_the_creator() {
    let storage = MemoryStorage::new();
    storage.add_user(user(60, "Sup Creator", Role::Supervisor, None));
    storage.add_user(user(61, "Sup Other", Role::Supervisor, None));
    storage.add_push_config(60, "creator-phone", Utc::now());
    storage.add_push_config(61, "other-phone", Utc::now());

    let ctx = push_context(&storage);
    let registry = PushRegistry::with_default_handlers().unwrap();
    let event = SourceEvent::TicketCreated {
        created_by_user_id: 60,
        ticket_id: 7,
        match_id: None,
        chat_id: 3,
    };
    let message = SendPushQueueMessage::new(UpdateEnvelope::new(event));

    let notifications = registry.dispatch(&ctx, &message).await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].recipient_user_id, 61);
    assert_eq!(notifications[0].urgency, PushUrgency::High);
}

#[tokio::test]
async fn own_status_change_is_not_pushed_back() {
    let storage = MemoryStorage::new();
    storage.add_ticket(Ticket {
        id: 7,
        status: TicketStatus::InProgress,
        created_by_user_id: 50,
        chat_id: 3,
        match_id: None,
    });
    storage.add_push_config(50, "creator-phone", Utc::now());

    let ctx = push_context(&storage);
    let registry = PushRegistry::with_default_handlers().unwrap();

    let self_change = SourceEvent::TicketStatusChanged {
        changed_by_user_id: 50,
        ticket_id: 7,
        old_status: TicketStatus::InProgress,
        new_status: TicketStatus::Solved,
    };
    let message = SendPushQueueMessage::new(UpdateEnvelope::new(self_change));
    assert!(registry.dispatch(&ctx, &message).await.unwrap().is_empty());

    let foreign_change = SourceEvent::TicketStatusChanged {
        changed_by_user_id: 60,
        ticket_id: 7,
        old_status: TicketStatus::InProgress,
        new_status: TicketStatus::Solved,
    };
    let message = SendPushQueueMessage::new(UpdateEnvelope::new(foreign_change));
    let notifications = registry.dispatch(&ctx, &message).await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].recipient_user_id, 50);
    assert_eq!(notifications[0].urgency, PushUrgency::Normal);
}

#[tokio::test]
async fn retries_stop_at_the_attempt_ceiling() {
    let storage = MemoryStorage::new();
    storage.add_push_config(20, "bob-phone", Utc::now());
    let sender = ScriptedSender::new(vec![
        Err(PushError::TryAgainLater),
        Err(PushError::TryAgainLater),
        Err(PushError::TryAgainLater),
    ]);
    let config = test_config();

    let notification = notification_for("bob-phone", "https://push.example/bob-phone");
    deliver_with_retry(&sender, &storage.handle(), &config.push.retry, &notification).await;

    assert_eq!(sender.attempts(), 3);
    assert!(storage.has_push_config("bob-phone"));
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let storage = MemoryStorage::new();
    let sender = ScriptedSender::new(vec![Err(PushError::TryAgainLater), Ok(())]);
    let config = test_config();

    let notification = notification_for("bob-phone", "https://push.example/bob-phone");
    deliver_with_retry(&sender, &storage.handle(), &config.push.retry, &notification).await;

    assert_eq!(sender.attempts(), 2);
}

#[tokio::test]
async fn dead_endpoint_removes_the_device() {
    let storage = MemoryStorage::new();
    storage.add_push_config(20, "bob-phone", Utc::now());
    let sender = ScriptedSender::new(vec![Err(PushError::InvalidEndpoint)]);
    let config = test_config();

    let notification = notification_for("bob-phone", "https://push.example/bob-phone");
    deliver_with_retry(&sender, &storage.handle(), &config.push.retry, &notification).await;

    assert_eq!(sender.attempts(), 1);
    assert!(!storage.has_push_config("bob-phone"));
}

#[tokio::test]
async fn bad_request_is_terminal_but_keeps_the_device() {
    let storage = MemoryStorage::new();
    storage.add_push_config(20, "bob-phone", Utc::now());
    let sender = ScriptedSender::new(vec![Err(PushError::BadRequest(
        "malformed crypto header".to_string(),
    ))]);
    let config = test_config();

    let notification = notification_for("bob-phone", "https://push.example/bob-phone");
    deliver_with_retry(&sender, &storage.handle(), &config.push.retry, &notification).await;

    assert_eq!(sender.attempts(), 1);
    assert!(storage.has_push_config("bob-phone"));
}

#[tokio::test]
async fn queue_payload_flows_through_to_delivery() {
    let storage = MemoryStorage::new();
    storage.add_chat(match_chat(1, 9));
    storage.add_user(user(10, "Sender", Role::Scout, Some(1)));
    storage.add_member(1, 10, Role::Scout);
    storage.add_member(1, 20, Role::Bookmaker);
    storage.add_push_config(20, "bob-phone", Utc::now());

    let ctx = push_context(&storage);
    let registry = PushRegistry::with_default_handlers().unwrap();
    let sender = ScriptedSender::always_ok();
    let message = queued_message(&MessageContent::Text { text: "hi".to_string() }, 1, 10);
    let payload = serde_json::to_vec(&message).unwrap();

    process_push_message(&registry, &ctx, &sender, &payload)
        .await
        .unwrap();

    let sent = sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient_user_id, 20);
    assert_eq!(sent[0].device_id, "bob-phone");
}

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use messenger_core::cache::ReadThroughCache;
use messenger_core::config::{
    Config, DatabaseConfig, KafkaConfig, NotifierConfig, PushConfig, PushRetryConfig,
    RedisConfig, UpdatesConfig,
};
use messenger_core::counters::UnreadCounterKey;
use messenger_core::events::{
    timestamp_now, ChatCloseReason, ChatId, ChatType, DeliveryStatus, MatchScoutData, MatchState,
    MessageContent, PresenceStatus, Role, SourceEvent, TicketId, TicketStatus, UpdateEnvelope,
    UserId,
};
use messenger_core::presence::PresenceService;
use messenger_core::protocol::ServerUpdate;
use messenger_core::storage::{Chat, Match, MatchScout, Ticket, User};
use messenger_testkit::{
    CapturingUpdatePublisher, MemoryCounterCache, MemoryPushQueue, MemoryStorage,
    RecordingBroadcaster, StubPresence,
};
use messenger_updates::{process_payload, HandlerContext, Notifier, Registry};

#[derive(Default)]
struct RecordingNotifier {
    calls: Mutex<Vec<(TicketId, ChatId, UserId)>>,
}

impl RecordingNotifier {
    fn calls(&self) -> Vec<(TicketId, ChatId, UserId)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn ticket_created(
        &self,
        ticket_id: TicketId,
        chat_id: ChatId,
        created_by_user_id: UserId,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((ticket_id, chat_id, created_by_user_id));
        Ok(())
    }
}

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
            device_last_alive_threshold_secs: 3600,
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

struct TestEnv {
    storage: MemoryStorage,
    broadcaster: Arc<RecordingBroadcaster>,
    counters: Arc<MemoryCounterCache>,
    presence: Arc<StubPresence>,
    push_queue: Arc<MemoryPushQueue>,
    publisher: Arc<CapturingUpdatePublisher>,
    notifier: Arc<RecordingNotifier>,
    ctx: HandlerContext,
    registry: Registry,
}

impl TestEnv {
    fn new() -> Self {
        let storage = MemoryStorage::new();
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let counters = Arc::new(MemoryCounterCache::new());
        let presence = Arc::new(StubPresence::new());
        let push_queue = Arc::new(MemoryPushQueue::new());
        let publisher = Arc::new(CapturingUpdatePublisher::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = HandlerContext {
            config: test_config(),
            storage: storage.handle(),
            broadcaster: broadcaster.clone(),
            counters: counters.clone(),
            presence: presence.clone(),
            push_queue: push_queue.clone(),
            update_publisher: publisher.clone(),
            notifier: notifier.clone(),
            chats_by_id: ReadThroughCache::new(),
            chats_by_message: ReadThroughCache::new(),
        };
        let registry = Registry::with_default_handlers().unwrap();
        TestEnv {
            storage,
            broadcaster,
            counters,
            presence,
            push_queue,
            publisher,
            notifier,
            ctx,
            registry,
        }
    }

    async fn dispatch(&self, envelope: &UpdateEnvelope) -> Result<()> {
        self.registry.dispatch(&self.ctx, envelope).await
    }
}

fn personal_chat(id: ChatId) -> Chat {
    Chat {
        id,
        chat_type: ChatType::Personal,
        match_id: None,
        assigned_ticket_id: None,
        is_closed: false,
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

fn user(id: UserId, name: &str, role: Role) -> User {
    User {
        id,
        name: name.to_string(),
        role,
        scout_number: None,
    }
}

fn text_message_event(
    message_id: i64,
    chat_id: ChatId,
    sender_id: UserId,
    text: &str,
) -> SourceEvent {
    SourceEvent::MessageSentToChat {
        message_id,
        chat_id,
        sender_id: Some(sender_id),
        initiator_id: None,
        content_raw: MessageContent::Text {
            text: text.to_string(),
        }
        .encode()
        .unwrap(),
        msg_created_at: timestamp_now(),
        do_not_increment_counter: false,
    }
}

#[tokio::test]
async fn message_fans_out_and_counts_unread() {
    let env = TestEnv::new();
    env.storage.add_chat(personal_chat(1));
    env.storage.add_member(1, 10, Role::Scout);
    env.storage.add_member(1, 20, Role::Bookmaker);
    env.storage.add_member(1, 30, Role::Bookmaker);
    // User 20 has a live session that seeded their counters; user 30 is cold.
    env.counters.seed(20, UnreadCounterKey::Total, 2);
    env.counters.seed(20, UnreadCounterKey::ByChat(1), 0);

    let envelope = UpdateEnvelope::with_cid(
        text_message_event(100, 1, 10, "full text that is definitely long"),
        Some("conn-a".to_string()),
    );
    env.dispatch(&envelope).await.unwrap();

    let records = env.broadcaster.records();
    assert_eq!(records.len(), 1);
    let mut audience = records[0].user_ids.clone();
    audience.sort();
    assert_eq!(audience, vec![10, 20, 30]);
    assert_eq!(records[0].skip_connection.as_deref(), Some("conn-a"));
    // The realtime payload carries the full text, never a preview.
    match &records[0].update {
        ServerUpdate::MessageReceived { message, chat_type } => {
            assert_eq!(*chat_type, ChatType::Personal);
            assert_eq!(
                message.content,
                MessageContent::Text {
                    text: "full text that is definitely long".to_string()
                }
            );
        }
        other => panic!("unexpected update: {:?}", other),
    }

    assert_eq!(env.counters.value(20, UnreadCounterKey::Total), Some(3));
    assert_eq!(env.counters.value(20, UnreadCounterKey::ByChat(1)), Some(1));
    assert_eq!(env.counters.value(30, UnreadCounterKey::Total), None);
    assert_eq!(env.counters.value(10, UnreadCounterKey::Total), None);

    let published = env.counters.published_totals();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].user_id, 20);
    assert_eq!(published[0].unread_count, 3);

    assert_eq!(env.push_queue.messages().len(), 1);
}

#[tokio::test]
async fn system_message_raises_total_but_not_scoped_counters() {
    let env = TestEnv::new();
    env.storage.add_chat(personal_chat(1));
    env.storage.add_member(1, 10, Role::Scout);
    env.storage.add_member(1, 20, Role::Bookmaker);
    env.counters.seed(20, UnreadCounterKey::Total, 5);
    env.counters.seed(20, UnreadCounterKey::ByChat(1), 2);

    let event = SourceEvent::MessageSentToChat {
        message_id: 101,
        chat_id: 1,
        sender_id: None,
        initiator_id: None,
        content_raw: MessageContent::ChatClosedNotification {
            reason: ChatCloseReason::MatchFinished,
        }
        .encode()
        .unwrap(),
        msg_created_at: timestamp_now(),
        do_not_increment_counter: true,
    };
    env.dispatch(&UpdateEnvelope::new(event)).await.unwrap();

    assert_eq!(env.broadcaster.records().len(), 1);
    // The flag exempts only the per-chat/per-match keys; the total badge
    // still moves and is published.
    assert_eq!(env.counters.value(20, UnreadCounterKey::Total), Some(6));
    assert_eq!(env.counters.value(20, UnreadCounterKey::ByChat(1)), Some(2));
    let published = env.counters.published_totals();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].unread_count, 6);
    assert!(env.push_queue.messages().is_empty());
}

#[tokio::test]
async fn read_status_decrements_and_clamps() {
    let env = TestEnv::new();
    env.storage.add_chat(personal_chat(2));
    env.storage.add_member(2, 10, Role::Scout);
    env.storage.add_member(2, 20, Role::Bookmaker);
    let message = env
        .storage
        .handle()
        .chats
        .append_system_message(2, &MessageContent::Text { text: "x".to_string() })
        .await
        .unwrap();
    env.counters.seed(20, UnreadCounterKey::Total, 1);
    env.counters.seed(20, UnreadCounterKey::ByChat(2), 5);

    let event = SourceEvent::DeliveryStatusChanged {
        message_id: message.id,
        chat_id: 2,
        user_id: 20,
        status: DeliveryStatus::Read,
        updated_for_user: 3,
        updated_for_all: 3,
    };
    env.dispatch(&UpdateEnvelope::with_cid(event, Some("conn-b".to_string())))
        .await
        .unwrap();

    // Over-decrement clamps at zero instead of going negative.
    assert_eq!(env.counters.value(20, UnreadCounterKey::Total), Some(0));
    assert_eq!(env.counters.value(20, UnreadCounterKey::ByChat(2)), Some(2));

    let published = env.counters.published_totals();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].unread_count, 0);

    let records = env.broadcaster.records();
    assert_eq!(records.len(), 2);
    // First goes to the acting user's other devices; the session that
    // reported the read does not get an echo.
    assert_eq!(records[0].user_ids, vec![20]);
    assert_eq!(records[0].skip_user, None);
    assert_eq!(records[0].skip_connection.as_deref(), Some("conn-b"));
    // Second goes to the rest, skipping the reader and their connection.
    assert_eq!(records[1].skip_user, Some(20));
    assert_eq!(records[1].skip_connection.as_deref(), Some("conn-b"));
}

#[tokio::test]
async fn non_read_status_leaves_counters_alone() {
    let env = TestEnv::new();
    env.storage.add_chat(personal_chat(2));
    env.storage.add_member(2, 20, Role::Bookmaker);
    let message = env
        .storage
        .handle()
        .chats
        .append_system_message(2, &MessageContent::Text { text: "x".to_string() })
        .await
        .unwrap();
    env.counters.seed(20, UnreadCounterKey::Total, 4);

    let event = SourceEvent::DeliveryStatusChanged {
        message_id: message.id,
        chat_id: 2,
        user_id: 20,
        status: DeliveryStatus::Delivered,
        updated_for_user: 2,
        updated_for_all: 2,
    };
    env.dispatch(&UpdateEnvelope::new(event)).await.unwrap();

    assert_eq!(env.counters.value(20, UnreadCounterKey::Total), Some(4));
    assert!(env.counters.published_totals().is_empty());
}

#[tokio::test]
async fn ticket_created_reaches_online_supervisors_and_side_channel() {
    let env = TestEnv::new();
    env.storage.add_user(user(50, "Creator", Role::Scout));
    env.storage.add_user(user(60, "Sup A", Role::Supervisor));
    env.storage.add_user(user(61, "Sup B", Role::Supervisor));
    env.presence.set_online(60);

    let event = SourceEvent::TicketCreated {
        created_by_user_id: 50,
        ticket_id: 7,
        match_id: None,
        chat_id: 3,
    };
    env.dispatch(&UpdateEnvelope::new(event)).await.unwrap();

    let records = env.broadcaster.records();
    assert_eq!(records.len(), 1);
    let mut audience = records[0].user_ids.clone();
    audience.sort();
    // Online supervisor plus the creator; the offline supervisor relies on
    // the push pipeline.
    assert_eq!(audience, vec![50, 60]);

    assert_eq!(env.push_queue.messages().len(), 1);

    // The side channel is spawned; give it a moment.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(env.notifier.calls(), vec![(7, 3, 50)]);
}

#[tokio::test]
async fn only_pushed_ticket_transitions_enqueue() {
    let env = TestEnv::new();
    env.storage.add_user(user(50, "Creator", Role::Scout));
    env.storage.add_ticket(Ticket {
        id: 7,
        status: TicketStatus::InProgress,
        created_by_user_id: 50,
        chat_id: 3,
        match_id: None,
    });

    let reopened = SourceEvent::TicketStatusChanged {
        changed_by_user_id: 60,
        ticket_id: 7,
        old_status: TicketStatus::Solved,
        new_status: TicketStatus::InProgress,
    };
    env.dispatch(&UpdateEnvelope::new(reopened)).await.unwrap();
    assert!(env.push_queue.messages().is_empty());

    let solved = SourceEvent::TicketStatusChanged {
        changed_by_user_id: 60,
        ticket_id: 7,
        old_status: TicketStatus::InProgress,
        new_status: TicketStatus::Solved,
    };
    env.dispatch(&UpdateEnvelope::new(solved)).await.unwrap();
    assert_eq!(env.push_queue.messages().len(), 1);
    assert_eq!(env.broadcaster.records().len(), 2);
}

#[tokio::test]
async fn match_going_inactive_closes_chats_but_keeps_match() {
    let env = TestEnv::new();
    env.storage.add_match(Match {
        id: 9,
        team_a_name: "A".to_string(),
        team_b_name: "B".to_string(),
        state: MatchState::Active,
    });
    env.storage.add_chat(match_chat(31, 9));
    env.storage.add_chat(match_chat(32, 9));
    env.storage.add_member(31, 10, Role::Scout);
    env.storage.add_member(32, 20, Role::Bookmaker);

    let event = SourceEvent::MatchStateChanged {
        match_id: 9,
        old_state: MatchState::Active,
        new_state: MatchState::Finished,
    };
    env.dispatch(&UpdateEnvelope::new(event)).await.unwrap();

    assert!(env.storage.chat(31).unwrap().is_closed);
    assert!(env.storage.chat(32).unwrap().is_closed);
    assert_eq!(env.storage.messages_in_chat(31).len(), 1);
    assert_eq!(env.storage.messages_in_chat(32).len(), 1);

    // The synthetic closed-messages flow back through the message path.
    let republished = env.publisher.envelopes();
    assert_eq!(republished.len(), 2);
    for envelope in &republished {
        match &envelope.event {
            SourceEvent::MessageSentToChat {
                sender_id,
                do_not_increment_counter,
                content_raw,
                ..
            } => {
                assert_eq!(*sender_id, None);
                assert!(*do_not_increment_counter);
                let content = MessageContent::decode(content_raw).unwrap();
                assert_eq!(
                    content,
                    MessageContent::ChatClosedNotification {
                        reason: ChatCloseReason::MatchFinished
                    }
                );
            }
            other => panic!("unexpected republished event: {:?}", other),
        }
    }

    // Chats exist, so the match row survives.
    assert!(env.storage.match_row(9).is_some());
}

#[tokio::test]
async fn chatless_match_is_garbage_collected() {
    let env = TestEnv::new();
    env.storage.add_match(Match {
        id: 9,
        team_a_name: "A".to_string(),
        team_b_name: "B".to_string(),
        state: MatchState::Active,
    });
    env.storage.add_scout(MatchScout {
        match_id: 9,
        user_id: 10,
        scout_number: Some(1),
        is_main_scout: true,
    });

    let event = SourceEvent::MatchStateChanged {
        match_id: 9,
        old_state: MatchState::Active,
        new_state: MatchState::Cancelled,
    };
    env.dispatch(&UpdateEnvelope::new(event)).await.unwrap();

    assert!(env.storage.match_row(9).is_none());
    assert!(env.storage.scouts_of(9).is_empty());
}

#[tokio::test]
async fn unknown_match_state_change_is_non_fatal() {
    let env = TestEnv::new();
    let event = SourceEvent::MatchStateChanged {
        match_id: 404,
        old_state: MatchState::Active,
        new_state: MatchState::Finished,
    };
    env.dispatch(&UpdateEnvelope::new(event)).await.unwrap();
    assert!(env.broadcaster.records().is_empty());
}

#[tokio::test]
async fn main_scout_change_windows_memberships() {
    let env = TestEnv::new();
    env.storage.add_match(Match {
        id: 9,
        team_a_name: "A".to_string(),
        team_b_name: "B".to_string(),
        state: MatchState::Active,
    });
    env.storage.add_chat(match_chat(31, 9));
    env.storage.add_user(user(20, "Old Main", Role::Scout));
    env.storage.add_member(31, 20, Role::Scout);
    env.storage.add_scout(MatchScout {
        match_id: 9,
        user_id: 20,
        scout_number: Some(1),
        is_main_scout: true,
    });

    let event = SourceEvent::MatchScoutsChanged {
        match_id: 9,
        scouts: vec![MatchScoutData {
            user_id: 21,
            name: "New Main".to_string(),
            scout_number: Some(2),
            is_main_scout: true,
        }],
    };
    env.dispatch(&UpdateEnvelope::new(event)).await.unwrap();

    // The new scout had no user row and was provisioned lazily.
    let provisioned = env.storage.user(21).unwrap();
    assert_eq!(provisioned.role, Role::Scout);
    assert_eq!(provisioned.name, "New Main");

    let boundary = env.storage.messages_in_chat(31)[0].id;

    let outgoing = env.storage.membership(31, 20).unwrap();
    assert!(outgoing.is_archive_member);
    assert!(!outgoing.has_write_permission);
    assert_eq!(outgoing.last_available_message_id, Some(boundary));

    let incoming = env.storage.membership(31, 21).unwrap();
    assert!(!incoming.is_archive_member);
    assert!(incoming.has_write_permission);
    assert_eq!(incoming.first_available_message_id, Some(boundary));

    let scouts = env.storage.scouts_of(9);
    assert_eq!(scouts.len(), 1);
    assert_eq!(scouts[0].user_id, 21);

    assert_eq!(env.publisher.envelopes().len(), 1);
}

#[tokio::test]
async fn presence_flip_reaches_recently_active_comembers_only() {
    let env = TestEnv::new();
    env.storage.add_chat(personal_chat(1));
    env.storage.add_member(1, 10, Role::Scout);
    env.storage.add_member(1, 20, Role::Bookmaker);
    env.storage.add_member(1, 30, Role::Bookmaker);
    env.presence.set_online(20);

    let event = SourceEvent::PresenceStatusChanged {
        user_id: 10,
        status: PresenceStatus::Online,
    };
    env.dispatch(&UpdateEnvelope::new(event)).await.unwrap();

    assert_eq!(
        env.presence.get_status(10).await.unwrap(),
        PresenceStatus::Online
    );
    let records = env.broadcaster.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user_ids, vec![20]);
    assert_eq!(records[0].skip_user, Some(10));
}

#[tokio::test]
async fn chat_created_announces_to_primary_members_only() {
    let env = TestEnv::new();
    env.storage.add_chat(personal_chat(5));
    env.storage.add_member(5, 10, Role::Scout);
    env.storage.add_membership(messenger_testkit::MembershipRecord {
        chat_id: 5,
        user_id: 20,
        user_role: Role::Supervisor,
        is_primary_member: false,
        has_write_permission: false,
        is_archive_member: false,
        first_available_message_id: None,
        last_available_message_id: None,
    });

    let event = SourceEvent::ChatCreated {
        chat_id: 5,
        chat_type: ChatType::Personal,
        created_by_user_id: Some(10),
        match_id: None,
    };
    env.dispatch(&UpdateEnvelope::new(event)).await.unwrap();

    let records = env.broadcaster.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user_ids, vec![10]);
}

#[tokio::test]
async fn user_data_change_updates_or_provisions_row() {
    let env = TestEnv::new();
    env.storage.add_user(user(10, "Old Name", Role::Scout));

    let event = SourceEvent::UserDataChanged {
        user_id: 10,
        name: "New Name".to_string(),
        role: Role::Scout,
        scout_number: Some(3),
    };
    env.dispatch(&UpdateEnvelope::new(event)).await.unwrap();
    assert_eq!(env.storage.user(10).unwrap().name, "New Name");

    let event = SourceEvent::UserDataChanged {
        user_id: 99,
        name: "Fresh".to_string(),
        role: Role::Bookmaker,
        scout_number: None,
    };
    env.dispatch(&UpdateEnvelope::new(event)).await.unwrap();
    assert_eq!(env.storage.user(99).unwrap().name, "Fresh");
}

#[tokio::test]
async fn overtime_events_are_dropped() {
    let env = TestEnv::new();
    env.storage.add_chat(personal_chat(1));
    env.storage.add_member(1, 10, Role::Scout);

    let mut envelope = UpdateEnvelope::new(text_message_event(100, 1, 10, "late"));
    envelope.created_at = timestamp_now() - 10_000;
    let payload = serde_json::to_vec(&envelope).unwrap();

    process_payload(&env.registry, &env.ctx, &payload)
        .await
        .unwrap();
    assert!(env.broadcaster.records().is_empty());
    assert!(env.push_queue.messages().is_empty());
}

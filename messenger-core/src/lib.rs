pub mod cache;
pub mod config;
pub mod connections;
pub mod context;
pub mod counters;
pub mod db;
pub mod events;
pub mod kafka;
pub mod presence;
pub mod protocol;
pub mod publisher;
pub mod redis;
pub mod schema;
pub mod storage;

pub use config::Config;
pub use connections::{BroadcastOptions, Broadcaster, RedisBroadcaster};
pub use context::MessengerContext;
pub use counters::{CounterCache, RedisCounterCache, UnreadCounterKey};
pub use db::DbPool;
pub use events::{SendPushQueueMessage, SourceEvent, UpdateEnvelope};
pub use kafka::{KafkaConsumer, KafkaProducer, PUSHES_TOPIC, UPDATES_TOPIC};
pub use presence::{PresenceService, RedisPresence};
pub use publisher::{KafkaPushQueue, KafkaUpdatePublisher, PushQueue, UpdatePublisher};
pub use redis::RedisPool;
pub use storage::StorageHandle;

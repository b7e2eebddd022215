use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;

use crate::events::{timestamp_now, PresenceStatus, UserId};
use crate::redis::{get_connection, RedisPool};

const LAST_SEEN_KEY: &str = "presence:last_seen";

/// Presence bookkeeping shared with the session layer: a sorted set of
/// `user_id -> last_seen_at` scores. A user counts as online while the
/// score is within the configured window.
#[async_trait]
pub trait PresenceService: Send + Sync {
    async fn mark_online(&self, user_id: UserId) -> Result<()>;
    async fn mark_offline(&self, user_id: UserId) -> Result<()>;
    async fn get_status(&self, user_id: UserId) -> Result<PresenceStatus>;
}

pub struct RedisPresence {
    pool: RedisPool,
    window_secs: i64,
}

impl RedisPresence {
    pub fn new(pool: RedisPool, window_secs: i64) -> Self {
        Self { pool, window_secs }
    }
}

#[async_trait]
impl PresenceService for RedisPresence {
    async fn mark_online(&self, user_id: UserId) -> Result<()> {
        let mut conn = get_connection(&self.pool).await?;
        let _: i64 = conn.zadd(LAST_SEEN_KEY, user_id, timestamp_now()).await?;
        Ok(())
    }

    async fn mark_offline(&self, user_id: UserId) -> Result<()> {
        let mut conn = get_connection(&self.pool).await?;
        let _: i64 = conn.zrem(LAST_SEEN_KEY, user_id).await?;
        Ok(())
    }

    async fn get_status(&self, user_id: UserId) -> Result<PresenceStatus> {
        let mut conn = get_connection(&self.pool).await?;
        let last_seen: Option<i64> = conn.zscore(LAST_SEEN_KEY, user_id).await?;
        let status = match last_seen {
            Some(ts) if ts >= timestamp_now() - self.window_secs => PresenceStatus::Online,
            _ => PresenceStatus::Offline,
        };
        Ok(status)
    }
}

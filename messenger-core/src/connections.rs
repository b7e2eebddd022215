use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use tracing;

use crate::events::{ConnectionId, UserId};
use crate::protocol::ServerUpdate;
use crate::redis::{get_connection, RedisPool};

/// Set of `{user_id}:{connection_id}` members per user. The session layer
/// adds a member on connect and removes it on disconnect; crashes leave
/// stale members behind, which broadcasting lazily reaps.
pub fn connections_key(user_id: UserId) -> String {
    format!("connections:{}", user_id)
}

/// Channel a single live session subscribes to.
pub fn connection_channel(member: &str) -> String {
    format!("updates:connection:{}", member)
}

fn member_of(user_id: UserId, connection_id: &str) -> String {
    format!("{}:{}", user_id, connection_id)
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    /// Connection that caused the update; it already knows.
    pub skip_connection: Option<ConnectionId>,
    /// User excluded from the fan-out entirely.
    pub skip_user: Option<UserId>,
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Publishes `update` to every live connection of `user_ids`, minus the
    /// exclusions. Returns how many connections received it.
    async fn broadcast(
        &self,
        user_ids: &[UserId],
        update: &ServerUpdate,
        options: BroadcastOptions,
    ) -> Result<usize>;
}

pub struct RedisBroadcaster {
    pool: RedisPool,
}

impl RedisBroadcaster {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    pub async fn register_connection(
        &self,
        user_id: UserId,
        connection_id: &str,
    ) -> Result<()> {
        let mut conn = get_connection(&self.pool).await?;
        let _: i64 = conn
            .sadd(connections_key(user_id), member_of(user_id, connection_id))
            .await?;
        Ok(())
    }

    pub async fn unregister_connection(
        &self,
        user_id: UserId,
        connection_id: &str,
    ) -> Result<()> {
        let mut conn = get_connection(&self.pool).await?;
        let _: i64 = conn
            .srem(connections_key(user_id), member_of(user_id, connection_id))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Broadcaster for RedisBroadcaster {
    async fn broadcast(
        &self,
        user_ids: &[UserId],
        update: &ServerUpdate,
        options: BroadcastOptions,
    ) -> Result<usize> {
        let keys: Vec<String> = user_ids
            .iter()
            .filter(|id| Some(**id) != options.skip_user)
            .map(|id| connections_key(*id))
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let payload = serde_json::to_string(update)?;
        let mut conn = get_connection(&self.pool).await?;
        let members: Vec<String> = conn.sunion(&keys).await?;

        let mut delivered = 0usize;
        for member in members {
            if let Some(skip) = &options.skip_connection {
                if member_matches_connection(&member, skip) {
                    continue;
                }
            }

            let receivers: i64 = conn
                .publish(connection_channel(&member), &payload)
                .await?;
            if receivers > 0 {
                delivered += receivers as usize;
                continue;
            }

            // Nobody listening: the session died without cleaning up.
            if let Some(user_id) = member_user_id(&member) {
                let removed: i64 = conn.srem(connections_key(user_id), &member).await?;
                if removed > 0 {
                    tracing::debug!("Removed stale connection {}", member);
                }
            }
        }

        Ok(delivered)
    }
}

fn member_user_id(member: &str) -> Option<UserId> {
    member.split(':').next()?.parse().ok()
}

fn member_matches_connection(member: &str, connection_id: &str) -> bool {
    member
        .split_once(':')
        .map(|(_, cid)| cid == connection_id)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_parsing() {
        assert_eq!(member_user_id("42:abc-def"), Some(42));
        assert_eq!(member_user_id("garbage"), None);
        assert!(member_matches_connection("42:abc-def", "abc-def"));
        assert!(!member_matches_connection("42:abc-def", "abc"));
    }

    #[test]
    fn key_shapes() {
        assert_eq!(connections_key(9), "connections:9");
        assert_eq!(
            connection_channel("9:cid-1"),
            "updates:connection:9:cid-1"
        );
    }
}

use anyhow::Result;
use async_trait::async_trait;
use redis::Script;
use tracing;

use crate::events::{ChatId, MatchId, UserId};
use crate::protocol::UnreadCountersUpdate;
use crate::redis::{get_connection, RedisPool};

/// Scope of one cached unread counter. Keys are only adjusted when they
/// already exist: a session seeds them on first fetch, so a missing key
/// means nobody is looking and there is nothing to keep consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadCounterKey {
    Total,
    ByChat(ChatId),
    ByMatch(MatchId),
}

impl UnreadCounterKey {
    pub fn render(&self, user_id: UserId) -> String {
        match self {
            UnreadCounterKey::Total => format!("unread:{}:total", user_id),
            UnreadCounterKey::ByChat(chat_id) => format!("unread:{}:chat:{}", user_id, chat_id),
            UnreadCounterKey::ByMatch(match_id) => format!("unread:{}:match:{}", user_id, match_id),
        }
    }
}

pub fn counters_channel(user_id: UserId) -> String {
    format!("updates:counters:{}", user_id)
}

/// Unread counter cache. Results are positional: `result[i]` is the new
/// value of `scopes[i]`, or `None` when that key was absent.
#[async_trait]
pub trait CounterCache: Send + Sync {
    async fn increment_if_exists(
        &self,
        user_id: UserId,
        scopes: &[UnreadCounterKey],
        amount: i64,
    ) -> Result<Vec<Option<i64>>>;

    async fn decrement_if_exists(
        &self,
        user_id: UserId,
        scopes: &[UnreadCounterKey],
        amount: i64,
    ) -> Result<Vec<Option<i64>>>;

    /// Publishes the new TOTAL on the per-user counters channel.
    async fn publish_total(&self, update: &UnreadCountersUpdate) -> Result<()>;
}

const INCREMENT_IF_EXISTS: &str = r#"
local results = {}
for i, key in ipairs(KEYS) do
    if redis.call('EXISTS', key) == 1 then
        results[i] = redis.call('INCRBY', key, ARGV[1])
    else
        results[i] = false
    end
end
return results
"#;

// Decrements clamp at zero: a counter drifting negative would stick as
// garbage until the next seed, showing "-1 unread" to the user.
const DECREMENT_IF_EXISTS: &str = r#"
local results = {}
for i, key in ipairs(KEYS) do
    if redis.call('EXISTS', key) == 1 then
        local value = redis.call('DECRBY', key, ARGV[1])
        if value < 0 then
            redis.call('SET', key, 0)
            value = 0
        end
        results[i] = value
    else
        results[i] = false
    end
end
return results
"#;

pub struct RedisCounterCache {
    pool: RedisPool,
    increment_script: Script,
    decrement_script: Script,
}

impl RedisCounterCache {
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            increment_script: Script::new(INCREMENT_IF_EXISTS),
            decrement_script: Script::new(DECREMENT_IF_EXISTS),
        }
    }

    async fn run_script(
        &self,
        script: &Script,
        user_id: UserId,
        scopes: &[UnreadCounterKey],
        amount: i64,
    ) -> Result<Vec<Option<i64>>> {
        if scopes.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = get_connection(&self.pool).await?;
        let mut invocation = script.prepare_invoke();
        for scope in scopes {
            invocation.key(scope.render(user_id));
        }
        invocation.arg(amount);
        let results: Vec<Option<i64>> = invocation.invoke_async(&mut conn).await?;
        Ok(results)
    }
}

#[async_trait]
impl CounterCache for RedisCounterCache {
    async fn increment_if_exists(
        &self,
        user_id: UserId,
        scopes: &[UnreadCounterKey],
        amount: i64,
    ) -> Result<Vec<Option<i64>>> {
        self.run_script(&self.increment_script, user_id, scopes, amount)
            .await
    }

    async fn decrement_if_exists(
        &self,
        user_id: UserId,
        scopes: &[UnreadCounterKey],
        amount: i64,
    ) -> Result<Vec<Option<i64>>> {
        self.run_script(&self.decrement_script, user_id, scopes, amount)
            .await
    }

    async fn publish_total(&self, update: &UnreadCountersUpdate) -> Result<()> {
        let mut conn = get_connection(&self.pool).await?;
        let payload = serde_json::to_string(update)?;
        let channel = counters_channel(update.user_id);
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(&payload)
            .query_async(&mut conn)
            .await?;
        tracing::debug!(
            "Published counters update for user {} to {} receivers",
            update.user_id,
            receivers
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_rendering() {
        assert_eq!(UnreadCounterKey::Total.render(7), "unread:7:total");
        assert_eq!(UnreadCounterKey::ByChat(3).render(7), "unread:7:chat:3");
        assert_eq!(UnreadCounterKey::ByMatch(9).render(7), "unread:7:match:9");
        assert_eq!(counters_channel(7), "updates:counters:7");
    }
}

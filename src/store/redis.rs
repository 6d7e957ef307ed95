use super::{FastCounterStore, TtlPolicy};
use crate::error::{CounterError, CounterResult};
use crate::types::{EntityId, KeySpace, LockToken};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, info, warn};

/// INCRBY only when the key exists, then re-apply the TTL.
/// Returns nil for an absent key so the caller can repopulate.
const INCR_IF_EXISTS_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    local value = redis.call("INCRBY", KEYS[1], ARGV[1])
    redis.call("PEXPIRE", KEYS[1], ARGV[2])
    return value
end
return nil
"#;

/// SET NX PX, answering with whatever value the key holds afterwards.
const POPULATE_IF_ABSENT_SCRIPT: &str = r#"
if redis.call("SET", KEYS[1], ARGV[1], "NX", "PX", ARGV[2]) then
    return tonumber(ARGV[1])
end
return tonumber(redis.call("GET", KEYS[1]))
"#;

/// Compare-and-delete on the lock record.
const UNLOCK_IF_MATCH_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Production fast counter store backed by Redis.
///
/// Counters are plain integer strings with a TTL, locks use `SET NX PX`,
/// the dirty set is a Redis set drained with `SPOP <count>`.
pub struct RedisCounterStore {
    conn: ConnectionManager,
    keys: KeySpace,
    ttl: TtlPolicy,
    incr_script: Script,
    populate_script: Script,
    unlock_script: Script,
}

impl RedisCounterStore {
    /// Connect to `url` and verify the server answers.
    pub async fn connect(url: &str, keys: KeySpace, ttl: TtlPolicy) -> CounterResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CounterError::InvalidArgument(format!("Invalid redis URL: {}", e)))?;
        let mut conn = ConnectionManager::new(client).await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(
            operation = "redis_connect",
            prefix = keys.prefix(),
            reply = %pong,
            "Connected to redis"
        );

        Ok(Self {
            conn,
            keys,
            ttl,
            incr_script: Script::new(INCR_IF_EXISTS_SCRIPT),
            populate_script: Script::new(POPULATE_IF_ABSENT_SCRIPT),
            unlock_script: Script::new(UNLOCK_IF_MATCH_SCRIPT),
        })
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// Redis takes expiries in whole milliseconds and rejects zero.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl FastCounterStore for RedisCounterStore {
    async fn increment(&self, id: EntityId, delta: i64) -> CounterResult<i64> {
        let mut conn = self.conn();
        let ttl = self.ttl.draw();
        let value: Option<i64> = self
            .incr_script
            .key(self.keys.counter(id))
            .arg(delta)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        value.ok_or_else(|| CounterError::NotFound(self.keys.counter(id)))
    }

    async fn get(&self, id: EntityId) -> CounterResult<i64> {
        let mut conn = self.conn();
        let value: Option<i64> = conn.get(self.keys.counter(id)).await?;
        value.ok_or_else(|| CounterError::NotFound(self.keys.counter(id)))
    }

    async fn set(&self, id: EntityId, value: i64) -> CounterResult<()> {
        let mut conn = self.conn();
        let ttl = self.ttl.draw();
        let _: () = redis::cmd("SET")
            .arg(self.keys.counter(id))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        debug!(entity_id = id, value, ttl_ms = ttl_millis(ttl), "counter populated");
        Ok(())
    }

    async fn populate(&self, id: EntityId, value: i64) -> CounterResult<i64> {
        let mut conn = self.conn();
        let ttl = self.ttl.draw();
        let cached: Option<i64> = self
            .populate_script
            .key(self.keys.counter(id))
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        // nil only when the key holds something that is not an integer
        cached.ok_or_else(|| {
            CounterError::Store(format!("{} does not hold a counter", self.keys.counter(id)))
        })
    }

    async fn invalidate(&self, id: EntityId) -> CounterResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.del(self.keys.counter(id)).await?;
        Ok(())
    }

    async fn try_lock(
        &self,
        id: EntityId,
        token: &LockToken,
        ttl: Duration,
    ) -> CounterResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.keys.lock(id))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, id: EntityId, token: &LockToken) -> CounterResult<bool> {
        let mut conn = self.conn();
        let deleted: i64 = self
            .unlock_script
            .key(self.keys.lock(id))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn mark_dirty(&self, id: EntityId) -> CounterResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.sadd(self.keys.dirty(), id).await?;
        Ok(())
    }

    async fn pop_dirty(&self, limit: usize) -> CounterResult<Vec<EntityId>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let members: Vec<String> = redis::cmd("SPOP")
            .arg(self.keys.dirty())
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(parse_members(&members))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

/// Skip members that are not entity ids; they can only come from a foreign
/// writer and would otherwise poison every cycle.
fn parse_members(members: &[String]) -> Vec<EntityId> {
    members
        .iter()
        .filter_map(|member| {
            let id = KeySpace::parse_member(member);
            if id.is_none() {
                warn!(member = %member, "Skipping malformed dirty-set member");
            }
            id
        })
        .collect()
}

// src/services/redis_store.rs
use async_trait::async_trait;
use log::{info, warn};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::sync::RwLock;
use std::time::Duration;

use crate::errors::VeilpixError;
use crate::services::store::LedgerStore;

const INCR_FIRST_EXPIRY: &str = r#"
local counts = {}
for i, key in ipairs(KEYS) do
    local n = redis.call('INCR', key)
    if n == 1 then
        redis.call('PEXPIRE', key, ARGV[1])
    end
    counts[i] = n
end
return counts
"#;

const INCR_FIXED_WINDOW: &str = r#"
local n = redis.call('INCR', KEYS[1])
if n == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
return {n, ttl}
"#;

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Ledger store backed by Redis. All compound primitives run as Lua scripts
/// so each one executes atomically on the server.
pub struct RedisStore {
    /// Taken out on close; commands after that fail.
    manager: RwLock<Option<ConnectionManager>>,
    incr_first_expiry: Script,
    incr_fixed_window: Script,
    delete_if_equals: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, VeilpixError> {
        let client = Client::open(redis_url)?;
        let mut manager = ConnectionManager::new(client).await?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut manager)
            .await?;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            manager: RwLock::new(Some(manager)),
            incr_first_expiry: Script::new(INCR_FIRST_EXPIRY),
            incr_fixed_window: Script::new(INCR_FIXED_WINDOW),
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
        })
    }

    fn conn(&self) -> Result<ConnectionManager, VeilpixError> {
        self.manager
            .read()
            .map_err(|_| VeilpixError::Store("redis connection lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| VeilpixError::Store("redis store is closed".to_string()))
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().max(1) as u64
}

#[async_trait]
impl LedgerStore for RedisStore {
    async fn incr_with_first_expiry(
        &self,
        keys: &[String],
        ttl: Duration,
    ) -> Result<Vec<u64>, VeilpixError> {
        let mut conn = self.conn()?;
        let mut invocation = self.incr_first_expiry.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(millis(ttl));
        Ok(invocation.invoke_async(&mut conn).await?)
    }

    async fn incr_fixed_window(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<(u64, Duration), VeilpixError> {
        let mut conn = self.conn()?;
        let (count, ttl_ms): (u64, i64) = self
            .incr_fixed_window
            .key(key)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await?;
        // PTTL is negative when the key has no expiry; report a full window.
        let remaining = if ttl_ms >= 0 {
            Duration::from_millis(ttl_ms as u64)
        } else {
            window
        };
        Ok((count, remaining))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, VeilpixError> {
        let mut conn = self.conn()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, VeilpixError> {
        let mut conn = self.conn()?;
        let deleted: u64 = self
            .delete_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), VeilpixError> {
        let mut conn = self.conn()?;
        conn.pset_ex::<_, _, ()>(key, value, millis(ttl) as usize)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, VeilpixError> {
        let mut conn = self.conn()?;
        Ok(conn.get(key).await?)
    }

    async fn close(&self) {
        info!("Closing Redis ledger store");
        match self.manager.write() {
            // Dropping the last manager clone closes the connection.
            Ok(mut manager) => drop(manager.take()),
            Err(_) => warn!("Redis connection lock poisoned, leaving it to drop"),
        }
    }
}

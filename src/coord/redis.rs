//! Redis-backed coordination store.
//!
//! All non-blocking commands go through a shared multiplexed connection;
//! every [`TakeHandle`] opens its own dedicated connection because `BLMOVE`
//! parks the connection server-side for the duration of the wait. Scripted
//! operations (window admission, monotonic set-max, conditional move) are
//! Lua scripts evaluated atomically by the server, so no lock is held
//! between evaluation and effect.

use crate::coord::store::{CoordOp, CoordStore, TakeHandle};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::time::Duration;

/// Evict entries older than the window, then admit the new member only if
/// the remaining count is under the limit. Time comes from the server's own
/// clock so caller clock skew never matters.
const WINDOW_ADMIT_SCRIPT: &str = r"
local time = redis.call('TIME')
local now = time[1] * 1000 + math.floor(time[2] / 1000)
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - window)
if redis.call('ZCARD', KEYS[1]) < limit then
    redis.call('ZADD', KEYS[1], now, ARGV[3])
    redis.call('PEXPIRE', KEYS[1], window)
    return 1
end
return 0
";

const SET_MAX_SCRIPT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]))
local candidate = tonumber(ARGV[1])
if current == nil or candidate > current then
    redis.call('SET', KEYS[1], ARGV[1])
    return candidate
end
return current
";

/// Remove-then-push as one atomic step; the push only happens when this
/// caller's LREM actually removed an occurrence.
const MOVE_IF_MEMBER_SCRIPT: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
    redis.call('RPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
";

pub struct RedisCoord {
    client: redis::Client,
    shared: MultiplexedConnection,
    window_admit: Script,
    set_max: Script,
    move_if_member: Script,
}

impl RedisCoord {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid coordination store url {url}"))?;
        let shared = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to coordination store")?;

        Ok(Self {
            client,
            shared,
            window_admit: Script::new(WINDOW_ADMIT_SCRIPT),
            set_max: Script::new(SET_MAX_SCRIPT),
            move_if_member: Script::new(MOVE_IF_MEMBER_SCRIPT),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.shared.clone()
    }
}

struct RedisTakeHandle {
    conn: MultiplexedConnection,
}

#[async_trait]
impl TakeHandle for RedisTakeHandle {
    async fn take(&mut self, src: &str, dst: &str, timeout: Duration) -> Result<Option<String>> {
        let value: Option<String> = redis::cmd("BLMOVE")
            .arg(src)
            .arg(dst)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut self.conn)
            .await
            .context("blocking take failed")?;
        Ok(value)
    }
}

#[async_trait]
impl CoordStore for RedisCoord {
    async fn push_tail(&self, list: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(list);
        for value in values {
            cmd.arg(value);
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to append to list {list}"))?;
        Ok(())
    }

    async fn take_handle(&self) -> Result<Box<dyn TakeHandle>> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("failed to open dedicated take connection")?;
        Ok(Box::new(RedisTakeHandle { conn }))
    }

    async fn multi(&self, ops: &[CoordOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                CoordOp::PushTail { list, value } => {
                    pipe.cmd("RPUSH").arg(list).arg(value).ignore();
                }
                CoordOp::ListRemove { list, value } => {
                    pipe.cmd("LREM").arg(list).arg(1).arg(value).ignore();
                }
                CoordOp::KeyDelete { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }
        let mut conn = self.conn();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("atomic multi-op failed")?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to set key {key}"))?;
        Ok(())
    }

    async fn refresh_ttl(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to refresh ttl of key {key}"))?;
        Ok(updated == 1)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let found: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to check key {key}"))?;
        Ok(found == 1)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to delete key {key}"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to read key {key}"))?;
        Ok(value)
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(list)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to read list {list}"))?;
        Ok(values)
    }

    async fn list_len(&self, list: &str) -> Result<usize> {
        let mut conn = self.conn();
        let len: i64 = redis::cmd("LLEN")
            .arg(list)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to read length of list {list}"))?;
        Ok(len.max(0) as usize)
    }

    async fn move_if_member(&self, src: &str, dst: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn();
        let moved: i64 = self
            .move_if_member
            .key(src)
            .key(dst)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("conditional move from {src} to {dst} failed"))?;
        Ok(moved == 1)
    }

    async fn set_max(&self, key: &str, candidate: u64) -> Result<u64> {
        let mut conn = self.conn();
        let value: u64 = self
            .set_max
            .key(key)
            .arg(candidate)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("monotonic set of key {key} failed"))?;
        Ok(value)
    }

    async fn window_admit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        member: &str,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let admitted: i64 = self
            .window_admit
            .key(key)
            .arg(window.as_millis() as u64)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .context("window admission script failed")?;
        Ok(admitted == 1)
    }
}

// =============================================================================
// Distributed trade lock — per-symbol mutual exclusion with TTL and fencing
// =============================================================================
//
// Key layout: `asv8:lock:trade:{symbol}`. Acquisition is set-if-absent with a
// TTL; release is compare-and-delete against the holder's token, so a holder
// that outlived its TTL can never clobber a lock re-acquired by another
// instance. Callers must release on every exit path; the TTL is the safety
// net, not the mechanism.
//
// Two backends: Redis (multi-instance production) and an in-process table
// with identical semantics (paper mode, tests).
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Lock key for one symbol.
pub fn trade_lock_key(symbol: &str) -> String {
    format!("asv8:lock:trade:{symbol}")
}

/// Per-symbol mutual exclusion.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Set-if-absent with TTL. `true` when this caller now holds the lock.
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Compare-and-delete. `true` when the lock was held with `token` and is
    /// now released; `false` when it was absent or held by someone else.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}

// =============================================================================
// Redis backend
// =============================================================================

/// Lua compare-and-delete: only the token holder may release.
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct RedisLockManager {
    client: redis::Client,
}

impl RedisLockManager {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("redis connection failed")?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .context("redis SET NX failed")?;

        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("redis connection failed")?;

        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .context("redis release script failed")?;

        Ok(deleted == 1)
    }
}

// =============================================================================
// In-process backend
// =============================================================================

/// Single-process lock table with the same TTL/fencing semantics. Used in
/// paper mode and tests where no Redis is available.
#[derive(Default)]
pub struct LocalLockManager {
    locks: Mutex<HashMap<String, (String, Instant)>>,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock();
        let now = Instant::now();

        match locks.get(key) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                locks.insert(key.to_string(), (token.to_string(), now + ttl));
                debug!(key, "local lock acquired");
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some((holder, expires)) if holder == token && *expires > Instant::now() => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(trade_lock_key("BTCUSDT"), "asv8:lock:trade:BTCUSDT");
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_is_rejected_while_held() {
        let locks = LocalLockManager::new();
        let key = trade_lock_key("BTCUSDT");
        assert!(locks.acquire(&key, "tok-a", Duration::from_secs(30)).await.unwrap());
        assert!(!locks.acquire(&key, "tok-b", Duration::from_secs(30)).await.unwrap());

        // Other symbols are independent.
        assert!(locks
            .acquire(&trade_lock_key("ETHUSDT"), "tok-b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn release_then_reacquire() {
        let locks = LocalLockManager::new();
        let key = trade_lock_key("BTCUSDT");
        assert!(locks.acquire(&key, "tok-a", Duration::from_secs(30)).await.unwrap());
        assert!(locks.release(&key, "tok-a").await.unwrap());
        assert!(locks.acquire(&key, "tok-b", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_holder_cannot_clobber_new_holder() {
        let locks = LocalLockManager::new();
        let key = trade_lock_key("BTCUSDT");

        assert!(locks.acquire(&key, "tok-old", Duration::from_secs(1)).await.unwrap());

        // TTL elapses; another instance takes the lock safely.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(locks.acquire(&key, "tok-new", Duration::from_secs(30)).await.unwrap());

        // The original holder's release must not remove the new lock.
        assert!(!locks.release(&key, "tok-old").await.unwrap());
        assert!(!locks.acquire(&key, "tok-other", Duration::from_secs(30)).await.unwrap());

        // The new holder releases normally.
        assert!(locks.release(&key, "tok-new").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn release_of_unheld_lock_is_false() {
        let locks = LocalLockManager::new();
        assert!(!locks.release(&trade_lock_key("BTCUSDT"), "tok").await.unwrap());
    }
}

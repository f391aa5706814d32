//! Per-visit advisory locks serialising pipeline and admin transitions

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Proof of ownership, needed to release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: Uuid,
    token: String,
}

#[async_trait]
pub trait ReceiptLocks: Send + Sync {
    /// Take the lock or fail with `Conflict` if someone else holds it
    async fn acquire(&self, key: Uuid, ttl: Duration) -> AppResult<LockToken>;

    /// Release a lock; a lease that already expired or changed hands is left alone
    async fn release(&self, token: &LockToken) -> AppResult<()>;
}

fn contended(key: Uuid) -> AppError {
    AppError::Conflict(format!("Visit {} is already being processed", key))
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Locks held as Redis keys with a lease (`SET NX PX`)
#[derive(Clone)]
pub struct RedisReceiptLocks {
    manager: ConnectionManager,
}

impl RedisReceiptLocks {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let client = Client::open(url)
            .map_err(|e| AppError::Internal(format!("Failed to create Redis client: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to connect to Redis: {}", e)))?;
        Ok(Self { manager })
    }

    fn redis_key(key: Uuid) -> String {
        format!("visit-lock:{}", key)
    }
}

#[async_trait]
impl ReceiptLocks for RedisReceiptLocks {
    async fn acquire(&self, key: Uuid, ttl: Duration) -> AppResult<LockToken> {
        let mut conn = self.manager.clone();
        let token = Uuid::new_v4().to_string();

        let set: Option<String> = redis::cmd("SET")
            .arg(Self::redis_key(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to take lock in Redis: {}", e)))?;

        match set {
            Some(_) => Ok(LockToken { key, token }),
            None => Err(contended(key)),
        }
    }

    async fn release(&self, token: &LockToken) -> AppResult<()> {
        let mut conn = self.manager.clone();
        let _: i32 = Script::new(RELEASE_SCRIPT)
            .key(Self::redis_key(token.key))
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to release lock in Redis: {}", e)))?;
        Ok(())
    }
}

/// In-process lock table for single-instance deployments
#[derive(Default)]
pub struct LocalReceiptLocks {
    held: Mutex<HashMap<Uuid, (String, Instant)>>,
}

impl LocalReceiptLocks {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn held_count(&self) -> usize {
        self.held.lock().map(|held| held.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ReceiptLocks for LocalReceiptLocks {
    async fn acquire(&self, key: Uuid, ttl: Duration) -> AppResult<LockToken> {
        let now = Instant::now();
        let mut held = self
            .held
            .lock()
            .map_err(|_| AppError::Internal("Lock table poisoned".to_string()))?;

        // Leases abandoned by dropped requests are never released
        held.retain(|_, (_, expires)| *expires > now);
        if held.contains_key(&key) {
            return Err(contended(key));
        }

        let token = Uuid::new_v4().to_string();
        held.insert(key, (token.clone(), now + ttl));
        Ok(LockToken { key, token })
    }

    async fn release(&self, token: &LockToken) -> AppResult<()> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| AppError::Internal("Lock table poisoned".to_string()))?;
        if held.get(&token.key).is_some_and(|(t, _)| *t == token.token) {
            held.remove(&token.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_second_acquire_conflicts_until_release() {
        let locks = LocalReceiptLocks::new();
        let key = Uuid::new_v4();

        let token = locks.acquire(key, TTL).await.unwrap();
        assert!(matches!(locks.acquire(key, TTL).await, Err(AppError::Conflict(_))));
        // other keys are independent
        assert!(locks.acquire(Uuid::new_v4(), TTL).await.is_ok());

        locks.release(&token).await.unwrap();
        assert!(locks.acquire(key, TTL).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let locks = LocalReceiptLocks::new();
        let key = Uuid::new_v4();

        let stale = locks.acquire(key, Duration::ZERO).await.unwrap();
        let fresh = locks.acquire(key, TTL).await.unwrap();

        // the stale holder must not free the new lease
        locks.release(&stale).await.unwrap();
        assert!(matches!(locks.acquire(key, TTL).await, Err(AppError::Conflict(_))));
        locks.release(&fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_leases_are_pruned() {
        let locks = LocalReceiptLocks::new();

        // never released, as when the request future is dropped
        for _ in 0..3 {
            locks.acquire(Uuid::new_v4(), Duration::from_millis(1)).await.unwrap();
        }
        assert_eq!(locks.held_count(), 3);

        std::thread::sleep(Duration::from_millis(5));
        let live = locks.acquire(Uuid::new_v4(), TTL).await.unwrap();
        assert_eq!(locks.held_count(), 1);
        locks.release(&live).await.unwrap();
        assert_eq!(locks.held_count(), 0);
    }
}

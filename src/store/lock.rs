//! Named advisory locks.
//!
//! A global sweep lock keeps at most one expiry sweep running across all
//! workers; a per-match lock serializes resolution of a single match against
//! concurrent voters and sweepers.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

use crate::store::StoreError;

/// Global lock name for the expiry sweep.
pub const SWEEP_LOCK: &str = "settlement-sweep";

/// Per-match lock name, scoping vote resolution and settlement of one match.
pub fn match_lock_name(match_id: Uuid) -> String {
    format!("settlement:{}", match_id)
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to take the named lock. `false` means another holder has it;
    /// that is not an error, the caller simply skips or backs off.
    async fn acquire(&self, name: &str) -> Result<bool, StoreError>;
    async fn release(&self, name: &str) -> Result<(), StoreError>;
}

/// Redis-backed advisory lock (`SET NX EX`). The TTL guards against a
/// crashed holder wedging settlement forever.
pub struct RedisLockManager {
    conn: redis::aio::ConnectionManager,
    ttl_secs: u64,
}

impl RedisLockManager {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { conn, ttl_secs: 60 })
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, name: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn release(&self, name: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(name)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

/// In-process lock manager for tests and single-node demo runs.
#[derive(Default)]
pub struct LocalLockManager {
    held: Mutex<HashSet<String>>,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn acquire(&self, name: &str) -> Result<bool, StoreError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| StoreError::Unavailable("lock table poisoned".to_string()))?;
        Ok(held.insert(name.to_string()))
    }

    async fn release(&self, name: &str) -> Result<(), StoreError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| StoreError::Unavailable("lock table poisoned".to_string()))?;
        held.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_released() {
        let locks = LocalLockManager::new();

        assert!(locks.acquire(SWEEP_LOCK).await.unwrap());
        assert!(!locks.acquire(SWEEP_LOCK).await.unwrap());

        locks.release(SWEEP_LOCK).await.unwrap();
        assert!(locks.acquire(SWEEP_LOCK).await.unwrap());
    }

    #[tokio::test]
    async fn different_names_are_independent() {
        let locks = LocalLockManager::new();
        let a = match_lock_name(Uuid::new_v4());
        let b = match_lock_name(Uuid::new_v4());

        assert!(locks.acquire(&a).await.unwrap());
        assert!(locks.acquire(&b).await.unwrap());
    }
}

//! Advisory compression lock.
//!
//! Async compression takes the per-conversation lock before running;
//! failure to acquire means another compression is in flight and the
//! caller quietly exits. The Redis variant is SETNX with a 30-second TTL
//! so a crashed holder cannot wedge a conversation.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use rustc_hash::FxHashSet;

use super::MemoryError;

const LOCK_TTL: Duration = Duration::from_secs(30);
const LOCK_KEY_PREFIX: &str = "stm:v2:lock:";

/// Per-conversation advisory lock.
#[async_trait]
pub trait CompressionLock: Send + Sync {
    /// Try to take the lock; false when already held.
    async fn acquire(&self, conversation_id: &str) -> Result<bool, MemoryError>;

    async fn release(&self, conversation_id: &str) -> Result<(), MemoryError>;
}

/// SETNX-based Redis lock.
pub struct RedisCompressLock {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisCompressLock {
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        RedisCompressLock {
            conn,
            ttl: LOCK_TTL,
        }
    }

    fn key(conversation_id: &str) -> String {
        format!("{LOCK_KEY_PREFIX}{conversation_id}")
    }
}

#[async_trait]
impl CompressionLock for RedisCompressLock {
    async fn acquire(&self, conversation_id: &str) -> Result<bool, MemoryError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key(conversation_id))
            .arg("locked")
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(|e| MemoryError::Store(e.to_string()))?;

        let acquired = reply.is_some();
        tracing::debug!(
            conversation_id = %conversation_id,
            acquired,
            "compression lock acquire"
        );
        Ok(acquired)
    }

    async fn release(&self, conversation_id: &str) -> Result<(), MemoryError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(Self::key(conversation_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| MemoryError::Store(e.to_string()))?;
        Ok(())
    }
}

/// Process-local lock for tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryCompressLock {
    held: Mutex<FxHashSet<String>>,
}

impl InMemoryCompressLock {
    #[must_use]
    pub fn new() -> Self {
        InMemoryCompressLock::default()
    }
}

#[async_trait]
impl CompressionLock for InMemoryCompressLock {
    async fn acquire(&self, conversation_id: &str) -> Result<bool, MemoryError> {
        Ok(self
            .held
            .lock()
            .expect("lock poisoned")
            .insert(conversation_id.to_string()))
    }

    async fn release(&self, conversation_id: &str) -> Result<(), MemoryError> {
        self.held
            .lock()
            .expect("lock poisoned")
            .remove(conversation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let lock = InMemoryCompressLock::new();
        assert!(lock.acquire("c1").await.unwrap());
        assert!(!lock.acquire("c1").await.unwrap());
        assert!(lock.acquire("c2").await.unwrap());
        lock.release("c1").await.unwrap();
        assert!(lock.acquire("c1").await.unwrap());
    }
}

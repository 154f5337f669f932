//! Coordination store abstraction
//!
//! This module provides a trait-based abstraction over the shared key-value
//! backend that holds consumed nonces and lock ownership records, with both
//! in-memory (default) and persistent (PostgreSQL) implementations.
//!
//! Any backend works as long as each primitive is linearizable per key:
//! two racing `set_if_absent` calls on the same key have exactly one winner,
//! and the conditional operations compare and mutate as one step on the
//! server side.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

/// Error type for storage operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid TTL: {0:?}")]
    InvalidTtl(Duration),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value contract used for nonce claims and lock ownership
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait CoordinationStore: Send + Sync + Debug {
    /// Store `value` under `key` with a TTL, only if `key` is absent or expired.
    ///
    /// Returns `true` if this call created the entry.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StorageError>;

    /// Current value of a live key
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Reset the TTL of a live key. Returns `false` if the key does not exist.
    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Reset the TTL only if the stored value equals `expected`
    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Delete `key` only if the stored value equals `expected`.
    ///
    /// Returns `true` if the entry was removed.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError>;
}

/// Reject zero TTLs before they reach a backend
pub(crate) fn check_ttl(ttl: Duration) -> Result<(), StorageError> {
    if ttl.is_zero() {
        Err(StorageError::InvalidTtl(ttl))
    } else {
        Ok(())
    }
}

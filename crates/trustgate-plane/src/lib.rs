//! # Trustgate Plane
//!
//! Coordination primitives shared by every service instance:
//!
//! - [`storage`]: the [`CoordinationStore`] contract with in-memory and
//!   PostgreSQL backends
//! - [`breaker`]: a [`CircuitBreaker`] wrapping every store call so an
//!   unhealthy backend fails fast instead of stalling requests
//! - [`lock`]: [`DistributedLock`] leases with owner-verified heartbeat and
//!   release, built through a [`LockManager`]
//!
//! ## Fail Closed
//!
//! None of these types ever report success when the store could not be
//! consulted. An open circuit surfaces as an error the caller must handle.

pub mod breaker;
pub mod lock;
pub mod storage;

pub use breaker::{BreakerError, BreakerState, CircuitBreaker};
pub use lock::{DistributedLock, LockLostCallback, LockManager};
pub use storage::{CoordinationStore, MemoryStore, StorageError};
#[cfg(feature = "postgres")]
pub use storage::PostgresStore;

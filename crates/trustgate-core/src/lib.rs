//! # Trustgate Core
//!
//! Shared types for the trust-verification and coordination layer that gates
//! privileged, mutating operations across service instances.
//!
//! ## Key Concepts
//!
//! - **Trust token**: signed credential asserting a [`TrustLevel`] for one request
//! - **Nonce**: single-use value in the token, consumed atomically in the
//!   coordination store so a token can never be replayed
//! - **Fail closed**: when the coordination store cannot be consulted the
//!   request is denied, never waved through
//!
//! ## Error Classes
//!
//! Every [`GateError`] maps to an [`ErrorClass`] so callers can tell a forged
//! or replayed token (do not retry) from a degraded backend (retry later).

pub mod audit;
pub mod config;
pub mod error;
pub mod types;

pub use audit::{AuditEntry, AuditEvent, AuditSink, HashChainAuditSink, MemoryAuditSink};
pub use config::{BreakerConfig, GateConfig, LockConfig, TrustConfig};
pub use error::{ErrorClass, GateError, Result};
pub use types::{validate_nonce, TrustLevel, TrustPayload, NONCE_MAX_LENGTH};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! # Trustgate Verify
//!
//! Verification of signed trust tokens in front of privileged operations.
//!
//! ## Architecture
//!
//! - [`KeyResolver`] fetches the issuer's JWKS through a [`KeySource`],
//!   caches Ed25519 keys per key id and rate-limits refetches
//! - [`TrustTokenVerifier`] checks the token header, signature and claims,
//!   then consumes the nonce in the coordination store so the token can be
//!   used exactly once
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use trustgate_core::{BreakerConfig, GateConfig};
//! use trustgate_plane::{CircuitBreaker, MemoryStore};
//! use trustgate_verify::{KeyResolver, TrustTokenVerifier};
//!
//! let config = GateConfig::from_env()?;
//! let keys = Arc::new(KeyResolver::from_config(&config.trust)?);
//! let breaker = Arc::new(CircuitBreaker::new("coordination-store", config.breaker)?);
//! let verifier = TrustTokenVerifier::new(
//!     config.trust,
//!     keys,
//!     Arc::new(MemoryStore::new()),
//!     breaker,
//! )?;
//!
//! let payload = verifier.verify(token).await?;
//! println!("trust={} trace={}", payload.trust, payload.trace);
//! ```

pub mod keys;
pub mod verifier;

pub use keys::{decoding_key, HttpKeySource, KeyResolver, KeySource};
pub use verifier::TrustTokenVerifier;

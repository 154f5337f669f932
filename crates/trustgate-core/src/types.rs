//! Trust token data model

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::GateError;

/// Maximum nonce length accepted before it is used as part of a store key
pub const NONCE_MAX_LENGTH: usize = 128;

/// Trust level asserted by a token
///
/// This is a closed set. Anything else on the wire is a hard failure and is
/// never mapped to a default level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrustLevel {
    /// Caller is fully trusted for privileged actions
    Full,
    /// Caller runs with reduced guarantees
    Degraded,
    /// Caller is explicitly untrusted
    Unsafe,
}

impl TrustLevel {
    /// Wire representation of the level
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Full => "FULL",
            TrustLevel::Degraded => "DEGRADED",
            TrustLevel::Unsafe => "UNSAFE",
        }
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrustLevel {
    type Err = GateError;

    /// Exact, case-sensitive match against the wire names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FULL" => Ok(TrustLevel::Full),
            "DEGRADED" => Ok(TrustLevel::Degraded),
            "UNSAFE" => Ok(TrustLevel::Unsafe),
            other => Err(GateError::InvalidTrustLevel(other.to_string())),
        }
    }
}

/// Check that a nonce is safe to interpolate into a store key.
///
/// Accepts 1..=128 characters from `[A-Za-z0-9_-]`.
pub fn validate_nonce(nonce: &str) -> Result<(), GateError> {
    let well_formed = !nonce.is_empty()
        && nonce.len() <= NONCE_MAX_LENGTH
        && nonce
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if well_formed {
        Ok(())
    } else {
        Err(GateError::InvalidNonceFormat)
    }
}

/// The verified contents of a trust token
///
/// Only produced after the signature, claims and nonce claim all succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustPayload {
    /// Asserted trust level
    pub trust: TrustLevel,

    /// Single-use nonce, now consumed
    pub nonce: String,

    /// Correlation id propagated from the caller
    pub trace: String,

    /// Token issuer
    pub issuer: String,

    /// Issued-at, seconds since the epoch
    pub issued_at: i64,

    /// Expiry, seconds since the epoch
    pub expires_at: i64,

    /// Id of the key that signed the token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Claims outside the required set
    #[serde(default)]
    pub claims: HashMap<String, serde_json::Value>,
}

impl TrustPayload {
    /// Create a payload with the required fields
    pub fn new(
        trust: TrustLevel,
        nonce: impl Into<String>,
        trace: impl Into<String>,
        issuer: impl Into<String>,
        issued_at: i64,
        expires_at: i64,
    ) -> Self {
        Self {
            trust,
            nonce: nonce.into(),
            trace: trace.into(),
            issuer: issuer.into(),
            issued_at,
            expires_at,
            kid: None,
            claims: HashMap::new(),
        }
    }

    /// Set the signing key id
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// Add an extra claim
    pub fn with_claim(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }

    /// Expiry as a timestamp, if representable
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expires_at, 0).single()
    }

    /// Seconds of validity left relative to `now`
    pub fn remaining_seconds(&self, now: i64) -> i64 {
        self.expires_at - now
    }

    /// Whether the token would be rejected as expired at `now`
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.remaining_seconds(now) <= 0
    }
}

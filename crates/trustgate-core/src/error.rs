//! Error types for trust verification and coordination

use thiserror::Error;

/// Result type alias using GateError
pub type Result<T> = std::result::Result<T, GateError>;

/// Broad category of a failure, for callers choosing a backoff policy.
///
/// Security failures mean the request itself is untrustworthy and must not
/// be retried as-is. Availability failures mean the coordination backend
/// could not be consulted and the decision was failed closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Forged, replayed or otherwise untrustworthy input
    Security,
    /// Token was well formed but not acceptable (expired, bad claims)
    Rejected,
    /// A backend was unreachable or its circuit is open
    Availability,
    /// Another holder owns the resource
    Contention,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Security => write!(f, "security"),
            ErrorClass::Rejected => write!(f, "rejected"),
            ErrorClass::Availability => write!(f, "availability"),
            ErrorClass::Contention => write!(f, "contention"),
        }
    }
}

/// Errors that can occur while verifying tokens or coordinating locks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// Token could not be parsed (bad segments, header JSON, missing kid)
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Header declares an algorithm other than the allow-listed one
    #[error("Algorithm mismatch: expected {expected}, got {actual}")]
    AlgorithmMismatch { expected: String, actual: String },

    /// Signature did not verify against the resolved key
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// One or more required claims are absent
    #[error("Missing required claims: {}", .0.join(", "))]
    MissingClaims(Vec<String>),

    /// Issuer claim does not match the configured issuer
    #[error("Invalid issuer: {0}")]
    InvalidIssuer(String),

    /// Trust claim is not one of the closed set of levels
    #[error("Invalid trust level: {0}")]
    InvalidTrustLevel(String),

    /// Issued-at is too far from the local clock
    #[error("Clock skew violation: |now - iat| = {skew_seconds}s exceeds {max_skew_seconds}s")]
    ClockSkewViolation {
        skew_seconds: i64,
        max_skew_seconds: i64,
    },

    /// Nonce is empty, too long, or contains characters outside the allowed set
    #[error("Invalid nonce format")]
    InvalidNonceFormat,

    /// Token expiry is not in the future
    #[error("Token expired at {0}")]
    TokenExpired(i64),

    /// Nonce was already claimed by an earlier verification
    #[error("Replay detected: nonce already consumed")]
    ReplayDetected,

    /// Coordination store circuit is open; the request is failed closed
    #[error("Coordination store degraded, failing closed: {0}")]
    StoreDegraded(String),

    /// Coordination store returned an error while the circuit was closed
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// No key with the requested id in the key set
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Key exists but is not usable with the allow-listed algorithm
    #[error("Unsupported key: {0}")]
    UnsupportedKey(String),

    /// Key-set endpoint could not be reached or returned garbage
    #[error("Key set unavailable: {0}")]
    KeySetUnavailable(String),

    /// Key-set endpoint is not HTTPS
    #[error("Key set URL must use HTTPS (got: {0})")]
    InsecureKeySetUrl(String),

    /// Lock key is already owned by someone else
    #[error("Lock already held: {0}")]
    LockAlreadyHeld(String),

    /// Half-open probe slots are all in use
    #[error("Lock acquisition rejected, half-open probes exhausted: {0}")]
    LockProbeExhausted(String),

    /// Ownership of a held lock could no longer be confirmed
    #[error("Lock lost: {0}")]
    LockLost(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GateError {
    /// Classify this error for upstream retry/backoff decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            GateError::MalformedToken(_)
            | GateError::AlgorithmMismatch { .. }
            | GateError::InvalidSignature(_)
            | GateError::InvalidIssuer(_)
            | GateError::InvalidTrustLevel(_)
            | GateError::ClockSkewViolation { .. }
            | GateError::InvalidNonceFormat
            | GateError::ReplayDetected
            | GateError::KeyNotFound(_)
            | GateError::UnsupportedKey(_) => ErrorClass::Security,

            GateError::MissingClaims(_) | GateError::TokenExpired(_) | GateError::Config(_) => {
                ErrorClass::Rejected
            }

            GateError::StoreDegraded(_)
            | GateError::StoreUnavailable(_)
            | GateError::KeySetUnavailable(_)
            | GateError::InsecureKeySetUrl(_)
            | GateError::LockProbeExhausted(_)
            | GateError::LockLost(_) => ErrorClass::Availability,

            GateError::LockAlreadyHeld(_) => ErrorClass::Contention,
        }
    }

    /// True for failures that indicate an attack or forged input
    pub fn is_security(&self) -> bool {
        self.class() == ErrorClass::Security
    }

    /// True for failures caused by an unreachable or degraded backend
    pub fn is_availability(&self) -> bool {
        self.class() == ErrorClass::Availability
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::MalformedToken(err.to_string())
    }
}

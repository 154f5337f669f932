//! Configuration for verification, circuit breaking and locking
//!
//! All structs deserialize with defaults for every field, so a partial
//! config file only needs the values that differ. [`GateConfig::from_env`]
//! reads the `TRUSTGATE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GateError, Result};

fn default_issuer() -> String {
    "trustgate-authority".to_string()
}

fn default_algorithm() -> String {
    "EdDSA".to_string()
}

fn default_max_skew_seconds() -> i64 {
    5
}

fn default_nonce_prefix() -> String {
    "nonce:".to_string()
}

fn default_key_cache_max_age_secs() -> u64 {
    60
}

fn default_key_refresh_cooldown_secs() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

fn default_lock_prefix() -> String {
    "lock:".to_string()
}

fn default_lock_ttl_ms() -> u64 {
    5_000
}

fn default_heartbeat_ms() -> u64 {
    2_000
}

/// Token verification settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Expected `iss` claim
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// The single accepted signature algorithm (JOSE name)
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Allowed |now - iat| in seconds
    #[serde(default = "default_max_skew_seconds")]
    pub max_skew_seconds: i64,

    /// Store key prefix for consumed nonces
    #[serde(default = "default_nonce_prefix")]
    pub nonce_prefix: String,

    /// HTTPS endpoint serving the signing key set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_url: Option<String>,

    /// How long a resolved key stays cached
    #[serde(default = "default_key_cache_max_age_secs")]
    pub key_cache_max_age_secs: u64,

    /// Minimum gap between key-set fetches triggered by cache misses
    #[serde(default = "default_key_refresh_cooldown_secs")]
    pub key_refresh_cooldown_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            algorithm: default_algorithm(),
            max_skew_seconds: default_max_skew_seconds(),
            nonce_prefix: default_nonce_prefix(),
            jwks_url: None,
            key_cache_max_age_secs: default_key_cache_max_age_secs(),
            key_refresh_cooldown_secs: default_key_refresh_cooldown_secs(),
        }
    }
}

impl TrustConfig {
    /// Create a config for the given issuer with default settings
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            ..Self::default()
        }
    }

    /// Set the key-set endpoint
    pub fn with_jwks_url(mut self, url: impl Into<String>) -> Self {
        self.jwks_url = Some(url.into());
        self
    }

    /// Set the allowed clock skew
    pub fn with_max_skew_seconds(mut self, seconds: i64) -> Self {
        self.max_skew_seconds = seconds;
        self
    }

    /// Set the nonce key prefix
    pub fn with_nonce_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.nonce_prefix = prefix.into();
        self
    }

    /// Key cache max-age as a duration
    pub fn key_cache_max_age(&self) -> Duration {
        Duration::from_secs(self.key_cache_max_age_secs)
    }

    /// Key refresh cooldown as a duration
    pub fn key_refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.key_refresh_cooldown_secs)
    }

    /// Reject values that would weaken verification
    pub fn validate(&self) -> Result<()> {
        if self.issuer.is_empty() {
            return Err(GateError::Config("issuer must not be empty".into()));
        }
        if self.algorithm.is_empty() {
            return Err(GateError::Config("algorithm must not be empty".into()));
        }
        if self.max_skew_seconds < 0 {
            return Err(GateError::Config(format!(
                "max_skew_seconds must be >= 0 (got {})",
                self.max_skew_seconds
            )));
        }
        Ok(())
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time after the last failure before a probe is allowed
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Concurrent probes allowed while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl BreakerConfig {
    /// Create a breaker config
    pub fn new(failure_threshold: u32, reset_timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold,
            reset_timeout_ms: reset_timeout.as_millis() as u64,
            half_open_max_calls,
        }
    }

    /// Reset timeout as a duration
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Threshold and probe budget must both be at least one
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(GateError::Config("failure_threshold must be >= 1".into()));
        }
        if self.half_open_max_calls == 0 {
            return Err(GateError::Config("half_open_max_calls must be >= 1".into()));
        }
        Ok(())
    }
}

/// Distributed lock defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Store key prefix for lock records
    #[serde(default = "default_lock_prefix")]
    pub prefix: String,

    /// Lease length
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,

    /// Interval between ownership checks
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            prefix: default_lock_prefix(),
            ttl_ms: default_lock_ttl_ms(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

impl LockConfig {
    /// Lease length as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Heartbeat interval as a duration
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// The heartbeat must fire at least once per lease
    pub fn validate(&self) -> Result<()> {
        Self::validate_timings(self.ttl(), self.heartbeat())
    }

    /// Check a lease length and heartbeat interval pair
    pub fn validate_timings(ttl: Duration, heartbeat: Duration) -> Result<()> {
        if ttl.is_zero() || heartbeat.is_zero() {
            return Err(GateError::Config("lock ttl and heartbeat must be > 0".into()));
        }
        if heartbeat >= ttl {
            return Err(GateError::Config(format!(
                "heartbeat ({}ms) must be shorter than ttl ({}ms)",
                heartbeat.as_millis(),
                ttl.as_millis()
            )));
        }
        Ok(())
    }
}

/// Complete configuration surface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub trust: TrustConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub lock: LockConfig,
}

impl GateConfig {
    /// Load from `TRUSTGATE_*` environment variables, falling back to defaults.
    ///
    /// `TRUSTGATE_ALGORITHM` is read here but the verifier only accepts `EdDSA`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let trust = TrustConfig {
            issuer: lookup("TRUSTGATE_ISSUER").unwrap_or(defaults.trust.issuer),
            algorithm: lookup("TRUSTGATE_ALGORITHM").unwrap_or(defaults.trust.algorithm),
            max_skew_seconds: parse_var(
                &lookup,
                "TRUSTGATE_CLOCK_SKEW_SECS",
                defaults.trust.max_skew_seconds,
            )?,
            nonce_prefix: lookup("TRUSTGATE_NONCE_PREFIX").unwrap_or(defaults.trust.nonce_prefix),
            jwks_url: lookup("TRUSTGATE_JWKS_URL").filter(|url| !url.is_empty()),
            key_cache_max_age_secs: defaults.trust.key_cache_max_age_secs,
            key_refresh_cooldown_secs: defaults.trust.key_refresh_cooldown_secs,
        };

        let breaker = BreakerConfig {
            failure_threshold: parse_var(
                &lookup,
                "TRUSTGATE_CB_FAILURE_THRESHOLD",
                defaults.breaker.failure_threshold,
            )?,
            reset_timeout_ms: parse_var(
                &lookup,
                "TRUSTGATE_CB_RESET_TIMEOUT_MS",
                defaults.breaker.reset_timeout_ms,
            )?,
            half_open_max_calls: parse_var(
                &lookup,
                "TRUSTGATE_CB_HALF_OPEN_MAX_CALLS",
                defaults.breaker.half_open_max_calls,
            )?,
        };

        let lock = LockConfig {
            prefix: lookup("TRUSTGATE_LOCK_PREFIX").unwrap_or(defaults.lock.prefix),
            ttl_ms: parse_var(&lookup, "TRUSTGATE_LOCK_TTL_MS", defaults.lock.ttl_ms)?,
            heartbeat_ms: parse_var(
                &lookup,
                "TRUSTGATE_LOCK_HEARTBEAT_MS",
                defaults.lock.heartbeat_ms,
            )?,
        };

        let config = Self { trust, breaker, lock };
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.trust.validate()?;
        self.breaker.validate()?;
        self.lock.validate()
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GateError::Config(format!("{name}: {e}"))),
        None => Ok(default),
    }
}

//! Trust token verification
//!
//! A trust token is a compact JWS signed with the issuer's Ed25519 key.
//! Verification stops at the first failed check:
//!
//! 1. Header algorithm equals the configured one, read before any crypto so
//!    `none` or HMAC headers are rejected outright
//! 2. Key id present and resolvable; signature valid
//! 3. Required claims present, issuer matches
//! 4. Trust level is one of the known values
//! 5. `|now - iat|` within the allowed skew
//! 6. Nonce well-formed, checked before it becomes part of a store key
//! 7. Token not yet expired
//! 8. Nonce claimed in the coordination store for the token's remaining
//!    lifetime; a second claim is a replay
//!
//! If the store cannot be consulted the token is rejected. A verifier never
//! accepts a token whose nonce it could not consume.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use trustgate_core::{
    validate_nonce, AuditEvent, AuditSink, GateError, HashChainAuditSink, Result, TrustConfig,
    TrustLevel, TrustPayload,
};
use trustgate_plane::{BreakerError, CircuitBreaker, CoordinationStore};

use crate::keys::KeyResolver;

/// Value stored under a consumed nonce key
const NONCE_MARKER: &str = "1";

#[derive(Debug, Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    iss: Option<String>,
    exp: Option<i64>,
    iat: Option<i64>,
    nonce: Option<Value>,
    trace: Option<String>,
    trust: Option<Value>,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

impl RawClaims {
    fn missing(&self) -> Vec<String> {
        [
            ("exp", self.exp.is_some()),
            ("iat", self.iat.is_some()),
            ("iss", self.iss.is_some()),
            ("nonce", self.nonce.is_some()),
            ("trace", self.trace.is_some()),
            ("trust", self.trust.is_some()),
        ]
        .into_iter()
        .filter(|(_, present)| !present)
        .map(|(name, _)| name.to_string())
        .collect()
    }
}

fn parse_header(raw: &str) -> Result<RawHeader> {
    let mut segments = raw.split('.');
    let (Some(header), Some(_), Some(_), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(GateError::MalformedToken(
            "expected three dot-separated segments".to_string(),
        ));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| GateError::MalformedToken(format!("header encoding: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| GateError::MalformedToken(format!("header json: {e}")))
}

fn map_jwt_error(error: jsonwebtoken::errors::Error) -> GateError {
    match error.kind() {
        ErrorKind::InvalidSignature => {
            GateError::InvalidSignature("signature does not match key".to_string())
        }
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            GateError::InvalidSignature(error.to_string())
        }
        _ => GateError::MalformedToken(error.to_string()),
    }
}

/// Verifies trust tokens and consumes their nonces
pub struct TrustTokenVerifier {
    config: TrustConfig,
    algorithm: Algorithm,
    keys: Arc<KeyResolver>,
    store: Arc<dyn CoordinationStore>,
    breaker: Arc<CircuitBreaker>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for TrustTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustTokenVerifier")
            .field("issuer", &self.config.issuer)
            .field("algorithm", &self.algorithm)
            .field("store", &self.store)
            .field("breaker", &self.breaker.name())
            .finish()
    }
}

impl TrustTokenVerifier {
    /// Create a verifier.
    ///
    /// Events go to a [`HashChainAuditSink`] unless replaced with
    /// [`with_audit_sink`](Self::with_audit_sink).
    pub fn new(
        config: TrustConfig,
        keys: Arc<KeyResolver>,
        store: Arc<dyn CoordinationStore>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        config.validate()?;
        let algorithm: Algorithm = config
            .algorithm
            .parse()
            .map_err(|_| GateError::Config(format!("unknown algorithm {}", config.algorithm)))?;
        // Keys are Ed25519 only
        if algorithm != Algorithm::EdDSA {
            return Err(GateError::Config(format!(
                "algorithm {} is not supported, use EdDSA",
                config.algorithm
            )));
        }

        Ok(Self {
            config,
            algorithm,
            keys,
            store,
            breaker,
            audit: Arc::new(HashChainAuditSink::new()),
        })
    }

    /// Send audit events to `sink`
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Verify `raw` against the current wall clock
    pub async fn verify(&self, raw: &str) -> Result<TrustPayload> {
        self.verify_at(raw, Utc::now().timestamp()).await
    }

    /// Verify `raw` as of `now` (seconds since the epoch)
    pub async fn verify_at(&self, raw: &str, now: i64) -> Result<TrustPayload> {
        let header = parse_header(raw)?;
        if header.alg != self.config.algorithm {
            warn!(
                expected = %self.config.algorithm,
                actual = %header.alg,
                "SECURITY: token algorithm mismatch"
            );
            return Err(GateError::AlgorithmMismatch {
                expected: self.config.algorithm.clone(),
                actual: header.alg,
            });
        }

        let kid = header
            .kid
            .ok_or_else(|| GateError::MalformedToken("header has no key id".to_string()))?;
        let key = self.keys.resolve(&kid).await?;

        let claims = self.decode(raw, &key)?;
        let (payload, ttl) = self.check_claims(claims, kid, now)?;
        self.claim_nonce(payload, ttl).await
    }

    fn decode(&self, raw: &str, key: &DecodingKey) -> Result<RawClaims> {
        // Time and presence checks run afterwards with our own clock and order
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<RawClaims>(raw, key, &validation).map_err(|e| {
            let error = map_jwt_error(e);
            warn!(error = %error, "SECURITY: token signature check failed");
            error
        })?;
        Ok(data.claims)
    }

    fn check_claims(
        &self,
        claims: RawClaims,
        kid: String,
        now: i64,
    ) -> Result<(TrustPayload, i64)> {
        let (iss, exp, iat, nonce, trace, trust, extra) = match claims {
            RawClaims {
                iss: Some(iss),
                exp: Some(exp),
                iat: Some(iat),
                nonce: Some(nonce),
                trace: Some(trace),
                trust: Some(trust),
                extra,
            } => (iss, exp, iat, nonce, trace, trust, extra),
            incomplete => return Err(GateError::MissingClaims(incomplete.missing())),
        };

        if iss != self.config.issuer {
            warn!(issuer = %iss, trace = %trace, "SECURITY: unexpected token issuer");
            return Err(GateError::InvalidIssuer(iss));
        }

        let trust: TrustLevel = match trust {
            Value::String(level) => level.parse()?,
            other => return Err(GateError::InvalidTrustLevel(other.to_string())),
        };

        let skew = now.saturating_sub(iat).saturating_abs();
        if skew > self.config.max_skew_seconds {
            warn!(skew_seconds = skew, trace = %trace, "SECURITY: clock skew violation");
            return Err(GateError::ClockSkewViolation {
                skew_seconds: skew,
                max_skew_seconds: self.config.max_skew_seconds,
            });
        }

        let Value::String(nonce) = nonce else {
            return Err(GateError::InvalidNonceFormat);
        };
        if let Err(e) = validate_nonce(&nonce) {
            warn!(trace = %trace, "SECURITY: malformed nonce");
            return Err(e);
        }

        let ttl = exp.saturating_sub(now);
        if ttl <= 0 {
            debug!(trace = %trace, exp, "Token expired");
            return Err(GateError::TokenExpired(exp));
        }

        let mut payload = TrustPayload::new(trust, nonce, trace, iss, iat, exp).with_kid(kid);
        payload.claims = extra;
        Ok((payload, ttl))
    }

    async fn claim_nonce(&self, payload: TrustPayload, ttl: i64) -> Result<TrustPayload> {
        let key = format!("{}{}", self.config.nonce_prefix, payload.nonce);
        let ttl = Duration::from_secs(ttl.unsigned_abs());

        let claimed = self
            .breaker
            .call(|| self.store.set_if_absent(&key, NONCE_MARKER, ttl))
            .await;

        match claimed {
            Ok(true) => {
                info!(
                    trust = %payload.trust,
                    trace = %payload.trace,
                    "Trust token verified"
                );
                self.audit.record(&AuditEvent::TrustVerified {
                    trust: payload.trust,
                    nonce: payload.nonce.clone(),
                    trace: payload.trace.clone(),
                });
                Ok(payload)
            }
            Ok(false) => {
                warn!(
                    nonce = %payload.nonce,
                    trace = %payload.trace,
                    "SECURITY: replay detected"
                );
                self.audit.record(&AuditEvent::ReplayDetected {
                    nonce: payload.nonce,
                    trace: payload.trace,
                });
                Err(GateError::ReplayDetected)
            }
            Err(BreakerError::Inner(e)) => {
                warn!(error = %e, trace = %payload.trace, "Nonce store error, failing closed");
                self.audit.record(&AuditEvent::DegradedMode {
                    reason: format!("store error: {e}"),
                    trace: payload.trace,
                });
                Err(GateError::StoreUnavailable(e.to_string()))
            }
            Err(rejected) => {
                warn!(reason = %rejected, trace = %payload.trace, "Nonce store degraded, failing closed");
                self.audit.record(&AuditEvent::DegradedMode {
                    reason: rejected.to_string(),
                    trace: payload.trace,
                });
                Err(GateError::StoreDegraded(rejected.to_string()))
            }
        }
    }
}

//! Token signing helpers and test doubles

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use trustgate_core::{BreakerConfig, GateError, MemoryAuditSink, TrustConfig};
use trustgate_plane::{CircuitBreaker, CoordinationStore, MemoryStore, StorageError};
use trustgate_verify::{KeyResolver, KeySource, TrustTokenVerifier};

pub const ISSUER: &str = "trustgate-authority";
pub const KID: &str = "k1";

/// Deterministic issuer key
pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

pub fn public_key_bytes() -> [u8; 32] {
    signing_key().verifying_key().to_bytes()
}

pub fn encoding_key() -> EncodingKey {
    let der = signing_key()
        .to_pkcs8_der()
        .expect("pkcs8 encoding");
    EncodingKey::from_ed_der(der.as_bytes())
}

pub fn jwks() -> Value {
    json!({
        "keys": [{
            "kty": "OKP",
            "crv": "Ed25519",
            "x": URL_SAFE_NO_PAD.encode(public_key_bytes()),
            "kid": KID,
            "alg": "EdDSA",
            "use": "sig"
        }]
    })
}

/// Key source serving a fixed key set
pub struct StaticKeySource(pub Value);

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> Result<JwkSet, GateError> {
        Ok(serde_json::from_value(self.0.clone())?)
    }

    fn location(&self) -> &str {
        "static"
    }
}

/// Claims for a valid token issued at `now`
pub fn claims(nonce: &str, now: i64) -> Value {
    json!({
        "iss": ISSUER,
        "iat": now,
        "exp": now + 60,
        "nonce": nonce,
        "trace": "trace-1",
        "trust": "FULL"
    })
}

pub fn sign(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some(KID.to_string());
    jsonwebtoken::encode(&header, claims, &encoding_key()).expect("sign token")
}

/// Token with a hand-built header and no signature check possible
pub fn unsigned(header: &Value, claims: &Value) -> String {
    format!(
        "{}.{}.",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

/// Memory store that can be switched into failing every call
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CoordinationStore for FlakyStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.extend_ttl(key, ttl).await
    }

    async fn compare_and_extend(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.compare_and_extend(key, expected, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.compare_and_delete(key, expected).await
    }
}

/// Everything a verification test needs to inspect
pub struct Harness {
    pub verifier: Arc<TrustTokenVerifier>,
    pub store: Arc<FlakyStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub audit: Arc<MemoryAuditSink>,
}

pub fn harness() -> Harness {
    harness_with(TrustConfig::new(ISSUER), BreakerConfig::default())
}

pub fn harness_with(config: TrustConfig, breaker: BreakerConfig) -> Harness {
    let keys = Arc::new(
        KeyResolver::new(Arc::new(StaticKeySource(jwks())), &config).expect("key resolver"),
    );
    let store = Arc::new(FlakyStore::default());
    let breaker = Arc::new(CircuitBreaker::new("coordination-store", breaker).expect("valid breaker"));
    let audit = Arc::new(MemoryAuditSink::new());

    let verifier = TrustTokenVerifier::new(config, keys, store.clone(), breaker.clone())
        .expect("valid config")
        .with_audit_sink(audit.clone());

    Harness {
        verifier: Arc::new(verifier),
        store,
        breaker,
        audit,
    }
}

//! Signing key resolution
//!
//! Verification keys come from a JWKS document published by the token
//! issuer. [`KeyResolver`] caches decoded keys per key id and refetches the
//! set on a miss, at most once per cooldown window, so a flood of tokens
//! with unknown key ids cannot turn into a flood of fetches.
//!
//! Only Ed25519 OKP keys are accepted. Anything else in the set is skipped
//! when the set is loaded, and requesting it by id fails with
//! `UnsupportedKey`.

use async_trait::async_trait;
use jsonwebtoken::jwk::{
    AlgorithmParameters, EllipticCurve, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse,
};
use jsonwebtoken::DecodingKey;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use trustgate_core::{BreakerConfig, GateError, Result, TrustConfig};
use trustgate_plane::{BreakerError, CircuitBreaker};

/// Timeout for a single key-set fetch
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Where key sets come from
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the current key set
    async fn fetch(&self) -> Result<JwkSet>;

    /// Location shown in logs
    fn location(&self) -> &str;
}

/// Fetches a JWKS document over HTTPS
#[derive(Debug, Clone)]
pub struct HttpKeySource {
    url: String,
    client: reqwest::Client,
}

impl HttpKeySource {
    /// Create a source for `url`, which must use HTTPS
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let is_https = url
            .get(..8)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"));
        if !is_https {
            return Err(GateError::InsecureKeySetUrl(url));
        }

        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| GateError::Config(format!("http client: {e}")))?;

        Ok(Self { url, client })
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<JwkSet> {
        debug!(url = %self.url, "Fetching JWKS");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| GateError::KeySetUnavailable(e.to_string()))?;

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| GateError::KeySetUnavailable(format!("invalid key set: {e}")))
    }

    fn location(&self) -> &str {
        &self.url
    }
}

/// Decode a JWK, accepting only Ed25519 signing keys
pub fn decoding_key(jwk: &Jwk) -> Result<DecodingKey> {
    match &jwk.algorithm {
        AlgorithmParameters::OctetKeyPair(params) if params.curve == EllipticCurve::Ed25519 => {}
        AlgorithmParameters::OctetKeyPair(params) => {
            return Err(GateError::UnsupportedKey(format!(
                "curve {:?} is not Ed25519",
                params.curve
            )))
        }
        _ => {
            return Err(GateError::UnsupportedKey(
                "only OKP keys are accepted".to_string(),
            ))
        }
    }

    if let Some(alg) = &jwk.common.key_algorithm {
        if *alg != KeyAlgorithm::EdDSA {
            return Err(GateError::UnsupportedKey(format!(
                "key declares algorithm {alg:?}"
            )));
        }
    }
    if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
        return Err(GateError::UnsupportedKey("encryption key".to_string()));
    }

    DecodingKey::from_jwk(jwk).map_err(|e| GateError::UnsupportedKey(e.to_string()))
}

/// Cached, rate-limited lookup of verification keys by key id
pub struct KeyResolver {
    source: Arc<dyn KeySource>,
    keys: Cache<String, Arc<DecodingKey>>,
    /// Held for the duration of a fetch; records the last successful one
    last_fetch: Mutex<Option<Instant>>,
    cooldown: Duration,
    breaker: CircuitBreaker,
}

impl std::fmt::Debug for KeyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyResolver")
            .field("source", &self.source.location())
            .field("cooldown", &self.cooldown)
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

impl KeyResolver {
    /// Create a resolver over `source` with cache timings from `config`
    pub fn new(source: Arc<dyn KeySource>, config: &TrustConfig) -> Result<Self> {
        Ok(Self {
            source,
            keys: Cache::builder()
                .time_to_live(config.key_cache_max_age())
                .max_capacity(256)
                .build(),
            last_fetch: Mutex::new(None),
            cooldown: config.key_refresh_cooldown(),
            breaker: CircuitBreaker::new("jwks", BreakerConfig::default())?,
        })
    }

    /// Create a resolver fetching from the configured HTTPS endpoint
    pub fn from_config(config: &TrustConfig) -> Result<Self> {
        let url = config
            .jwks_url
            .as_deref()
            .ok_or_else(|| GateError::Config("jwks_url is not set".to_string()))?;
        let source = HttpKeySource::new(url)?;
        Self::new(Arc::new(source), config)
    }

    /// Replace the breaker guarding key-set fetches
    pub fn with_breaker(mut self, config: BreakerConfig) -> Result<Self> {
        self.breaker = CircuitBreaker::new("jwks", config)?;
        Ok(self)
    }

    /// Breaker guarding key-set fetches
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Resolve the verification key for `kid`
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` if the key set does not contain `kid`
    /// - `UnsupportedKey` if it does but the key is not Ed25519
    /// - `KeySetUnavailable` if the key set could not be fetched
    pub async fn resolve(&self, kid: &str) -> Result<Arc<DecodingKey>> {
        if let Some(key) = self.keys.get(kid).await {
            return Ok(key);
        }

        let mut last_fetch = self.last_fetch.lock().await;

        // Filled by a fetch we waited on
        if let Some(key) = self.keys.get(kid).await {
            return Ok(key);
        }

        if let Some(at) = *last_fetch {
            if at.elapsed() < self.cooldown {
                debug!(kid = %kid, "Key miss inside refresh cooldown");
                return Err(GateError::KeyNotFound(kid.to_string()));
            }
        }

        let set = self.fetch().await?;
        *last_fetch = Some(Instant::now());

        // Populate before the gate opens so waiters hit the cache
        let mut requested = None;
        for jwk in &set.keys {
            let Some(id) = jwk.common.key_id.as_deref() else {
                continue;
            };
            let decoded = decoding_key(jwk);
            match &decoded {
                Ok(key) => {
                    self.keys.insert(id.to_string(), Arc::new(key.clone())).await;
                }
                Err(e) => warn!(kid = %id, error = %e, "Skipping key"),
            }
            if id == kid {
                requested = Some(decoded);
            }
        }

        match requested {
            Some(decoded) => decoded.map(Arc::new),
            None => Err(GateError::KeyNotFound(kid.to_string())),
        }
    }

    /// Drop a cached key so the next lookup refetches
    pub async fn invalidate(&self, kid: &str) {
        self.keys.invalidate(kid).await;
    }

    async fn fetch(&self) -> Result<JwkSet> {
        let set = self
            .breaker
            .call(|| self.source.fetch())
            .await
            .map_err(|e| match e {
                BreakerError::Inner(e) => e,
                rejected => GateError::KeySetUnavailable(rejected.to_string()),
            })?;

        info!(
            source = %self.source.location(),
            keys = set.keys.len(),
            "Loaded key set"
        );
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ED_X: &str = "11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo";

    struct StaticSource {
        set: serde_json::Value,
        fetches: AtomicUsize,
    }

    impl StaticSource {
        fn new(set: serde_json::Value) -> Arc<Self> {
            Arc::new(Self {
                set,
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl KeySource for StaticSource {
        async fn fetch(&self) -> Result<JwkSet> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::from_value(self.set.clone())?)
        }

        fn location(&self) -> &str {
            "static"
        }
    }

    struct DownSource;

    #[async_trait]
    impl KeySource for DownSource {
        async fn fetch(&self) -> Result<JwkSet> {
            Err(GateError::KeySetUnavailable("connection refused".into()))
        }

        fn location(&self) -> &str {
            "down"
        }
    }

    fn key_set() -> serde_json::Value {
        serde_json::json!({
            "keys": [
                { "kty": "OKP", "crv": "Ed25519", "x": ED_X, "kid": "ed-1", "alg": "EdDSA", "use": "sig" },
                { "kty": "oct", "k": "c2VjcmV0", "kid": "hmac-1", "alg": "HS256" },
                { "kty": "OKP", "crv": "Ed25519", "x": ED_X, "kid": "ed-rs", "alg": "RS256" }
            ]
        })
    }

    #[test]
    fn test_http_source_requires_https() {
        assert!(HttpKeySource::new("https://issuer.example/jwks.json").is_ok());
        assert!(HttpKeySource::new("HTTPS://issuer.example/jwks.json").is_ok());
        assert_eq!(
            HttpKeySource::new("http://issuer.example/jwks.json").unwrap_err(),
            GateError::InsecureKeySetUrl("http://issuer.example/jwks.json".into())
        );
        assert!(HttpKeySource::new("file:///etc/jwks.json").is_err());
    }

    #[test]
    fn test_from_config_requires_url() {
        let config = TrustConfig::default();
        assert!(matches!(
            KeyResolver::from_config(&config),
            Err(GateError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_resolves_and_caches() {
        let source = StaticSource::new(key_set());
        let resolver = KeyResolver::new(source.clone(), &TrustConfig::default()).unwrap();

        resolver.resolve("ed-1").await.unwrap();
        resolver.resolve("ed-1").await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejects_non_ed25519_keys() {
        let source = StaticSource::new(key_set());
        let resolver = KeyResolver::new(source, &TrustConfig::default()).unwrap();

        assert!(matches!(
            resolver.resolve("hmac-1").await,
            Err(GateError::UnsupportedKey(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_key_with_foreign_alg() {
        let source = StaticSource::new(key_set());
        let resolver = KeyResolver::new(source, &TrustConfig::default()).unwrap();

        assert!(matches!(
            resolver.resolve("ed-rs").await,
            Err(GateError::UnsupportedKey(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_respects_cooldown() {
        let source = StaticSource::new(key_set());
        let resolver = KeyResolver::new(source.clone(), &TrustConfig::default()).unwrap();

        assert_eq!(
            resolver.resolve("unknown").await.err().unwrap(),
            GateError::KeyNotFound("unknown".into())
        );
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        // Inside the cooldown the set is not refetched
        assert!(resolver.resolve("other-unknown").await.is_err());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(resolver.resolve("other-unknown").await.is_err());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_source_is_typed_error() {
        let resolver = KeyResolver::new(Arc::new(DownSource), &TrustConfig::default()).unwrap();

        let err = resolver.resolve("ed-1").await.err().unwrap();
        assert!(matches!(err, GateError::KeySetUnavailable(_)));
        assert!(err.is_availability());
    }

    #[tokio::test]
    async fn test_repeated_outage_opens_key_breaker() {
        let resolver = KeyResolver::new(Arc::new(DownSource), &TrustConfig::default())
            .unwrap()
            .with_breaker(BreakerConfig::new(2, Duration::from_secs(30), 1))
            .unwrap();

        for _ in 0..2 {
            let _ = resolver.resolve("ed-1").await;
        }
        let err = resolver.resolve("ed-1").await.err().unwrap();
        assert_eq!(
            err,
            GateError::KeySetUnavailable("Circuit breaker 'jwks' is open, failing fast".into())
        );
    }
}

//! Distributed locks over the coordination store
//!
//! A lock is a store record `<prefix><name> -> owner id` with a TTL. The
//! holder keeps it alive from a heartbeat task that re-reads the owner and
//! extends the lease only while the record is still its own. If the record
//! changed hands, expired, or the store could not be reached, the lock is
//! considered lost: the heartbeat stops and `on_lock_lost` fires once.
//!
//! Release deletes the record only if it still carries this holder's owner
//! id, so a holder whose lease lapsed can never remove a successor's lock.
//!
//! # Example
//!
//! ```ignore
//! let locks = LockManager::new(store, breaker, LockConfig::default());
//! let report = locks
//!     .with_lock("job:42", || async { run_job().await })
//!     .await?;
//! ```

use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use trustgate_core::{GateError, LockConfig};

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::storage::{CoordinationStore, StorageError};

/// Invoked with the lock name when the heartbeat detects loss
pub type LockLostCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Holding {
    owner_id: String,
    released: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// A named lease on a shared resource
pub struct DistributedLock {
    name: String,
    key: String,
    ttl: Duration,
    heartbeat: Duration,
    store: Arc<dyn CoordinationStore>,
    breaker: Arc<CircuitBreaker>,
    on_lock_lost: Option<LockLostCallback>,
    holding: Mutex<Option<Holding>>,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("heartbeat", &self.heartbeat)
            .field("held", &self.is_held())
            .finish()
    }
}

impl DistributedLock {
    /// Create an unacquired lock using the TTL and heartbeat from `config`
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        breaker: Arc<CircuitBreaker>,
        config: &LockConfig,
    ) -> Self {
        let name = name.into();
        Self {
            key: format!("{}{}", config.prefix, name),
            name,
            ttl: config.ttl(),
            heartbeat: config.heartbeat(),
            store,
            breaker,
            on_lock_lost: None,
            holding: Mutex::new(None),
        }
    }

    /// Override the lease length
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the heartbeat interval
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Register a callback fired once if the lock is lost while held
    pub fn on_lock_lost<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_lock_lost = Some(Arc::new(callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store key holding the owner record
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner id of the current holding, if any
    pub fn owner_id(&self) -> Option<String> {
        self.holding.lock().as_ref().map(|h| h.owner_id.clone())
    }

    /// True between a successful acquire and release or detected loss
    pub fn is_held(&self) -> bool {
        self.holding
            .lock()
            .as_ref()
            .is_some_and(|h| !h.released.load(Ordering::SeqCst))
    }

    /// Fail with `LockLost` unless the lock is still held
    pub fn ensure_held(&self) -> Result<(), GateError> {
        if self.is_held() {
            Ok(())
        } else {
            Err(GateError::LockLost(self.name.clone()))
        }
    }

    /// Claim the lock and start the heartbeat.
    ///
    /// # Errors
    ///
    /// - `Config` if the TTL or heartbeat is zero, or the heartbeat is not
    ///   shorter than the TTL; the store is not contacted
    /// - `LockAlreadyHeld` if another owner holds a live record
    /// - `StoreDegraded` if the store circuit is open
    /// - `LockProbeExhausted` if the circuit is half-open with no probe free
    /// - `StoreUnavailable` if the store call itself failed
    pub async fn acquire(&self) -> Result<(), GateError> {
        LockConfig::validate_timings(self.ttl, self.heartbeat)?;
        if self.is_held() {
            return Err(GateError::LockAlreadyHeld(self.name.clone()));
        }

        let owner_id = Uuid::new_v4().to_string();
        let claimed = self
            .breaker
            .call(|| self.store.set_if_absent(&self.key, &owner_id, self.ttl))
            .await
            .map_err(|e| self.acquire_error(e))?;

        if !claimed {
            debug!(lock = %self.name, "Lock held by another owner");
            return Err(GateError::LockAlreadyHeld(self.name.clone()));
        }

        let released = Arc::new(AtomicBool::new(false));
        let heartbeat = Heartbeat {
            name: self.name.clone(),
            key: self.key.clone(),
            owner_id: owner_id.clone(),
            ttl: self.ttl,
            every: self.heartbeat,
            store: self.store.clone(),
            breaker: self.breaker.clone(),
            released: released.clone(),
            on_lock_lost: self.on_lock_lost.clone(),
        };
        let task = tokio::spawn(heartbeat.run());

        // A previous holding can only remain here if it was lost
        let previous = self.holding.lock().replace(Holding {
            owner_id,
            released,
            task,
        });
        if let Some(previous) = previous {
            previous.task.abort();
        }

        info!(lock = %self.name, ttl_ms = self.ttl.as_millis() as u64, "Lock acquired");
        Ok(())
    }

    fn acquire_error(&self, error: BreakerError<StorageError>) -> GateError {
        match error {
            BreakerError::Open(breaker) => {
                warn!(lock = %self.name, breaker = %breaker, "Lock acquire rejected, store degraded");
                GateError::StoreDegraded(format!("circuit '{breaker}' open"))
            }
            BreakerError::ProbesExhausted(_) => GateError::LockProbeExhausted(self.name.clone()),
            BreakerError::Inner(e) => {
                warn!(lock = %self.name, error = %e, "Lock acquire failed");
                GateError::StoreUnavailable(e.to_string())
            }
        }
    }

    /// Stop the heartbeat and delete the record if this holder still owns it.
    ///
    /// Idempotent. Store errors are logged and the record is left to expire.
    pub async fn release(&self) {
        let holding = self.holding.lock().take();
        let Some(holding) = holding else {
            return;
        };

        let was_lost = holding.released.swap(true, Ordering::SeqCst);
        holding.task.abort();
        if !was_lost {
            // Wait out an in-progress heartbeat so it cannot extend after delete
            let _ = holding.task.await;
        }

        let owner_id = holding.owner_id;
        match self
            .breaker
            .call(|| self.store.compare_and_delete(&self.key, &owner_id))
            .await
        {
            Ok(true) => info!(lock = %self.name, "Lock released"),
            Ok(false) => debug!(lock = %self.name, "Lock record no longer owned, nothing to delete"),
            Err(e) => warn!(lock = %self.name, error = %e, "Lock release failed, record will expire"),
        }
    }

    /// Acquire, run `f`, and release on every exit path.
    ///
    /// A panic inside `f` is re-raised after the lock has been released.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> Result<T, GateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await?;
        let outcome = AssertUnwindSafe(async move { f().await })
            .catch_unwind()
            .await;
        self.release().await;

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if let Some(holding) = self.holding.get_mut().take() {
            holding.released.store(true, Ordering::SeqCst);
            holding.task.abort();
        }
    }
}

/// State moved into the heartbeat task
struct Heartbeat {
    name: String,
    key: String,
    owner_id: String,
    ttl: Duration,
    every: Duration,
    store: Arc<dyn CoordinationStore>,
    breaker: Arc<CircuitBreaker>,
    released: Arc<AtomicBool>,
    on_lock_lost: Option<LockLostCallback>,
}

impl Heartbeat {
    async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.every, self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.released.load(Ordering::SeqCst) {
                return;
            }
            match self.renew().await {
                Ok(()) => debug!(lock = %self.name, "Lock lease extended"),
                Err(reason) => {
                    self.lost(&reason);
                    return;
                }
            }
        }
    }

    async fn renew(&self) -> Result<(), String> {
        let current = self
            .breaker
            .call(|| self.store.get(&self.key))
            .await
            .map_err(|e| e.to_string())?;

        if current.as_deref() != Some(self.owner_id.as_str()) {
            return Err("owner record replaced or expired".into());
        }

        let extended = self
            .breaker
            .call(|| {
                self.store
                    .compare_and_extend(&self.key, &self.owner_id, self.ttl)
            })
            .await
            .map_err(|e| e.to_string())?;

        if extended {
            Ok(())
        } else {
            Err("lease could not be extended".into())
        }
    }

    fn lost(&self, reason: &str) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(lock = %self.name, reason = %reason, "Lock lost");
        if let Some(callback) = &self.on_lock_lost {
            callback(&self.name);
        }
    }
}

/// Builds named locks that share a store, a breaker and defaults
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    breaker: Arc<CircuitBreaker>,
    config: LockConfig,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("breaker", &self.breaker.name())
            .field("config", &self.config)
            .finish()
    }
}

impl LockManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        breaker: Arc<CircuitBreaker>,
        config: LockConfig,
    ) -> Self {
        Self {
            store,
            breaker,
            config,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Unacquired lock on `name` with the default TTL and heartbeat
    pub fn lock(&self, name: impl Into<String>) -> DistributedLock {
        DistributedLock::new(name, self.store.clone(), self.breaker.clone(), &self.config)
    }

    /// Unacquired lock with explicit timings and an optional loss callback
    pub fn lock_with(
        &self,
        name: impl Into<String>,
        ttl: Duration,
        heartbeat: Duration,
        on_lock_lost: Option<LockLostCallback>,
    ) -> DistributedLock {
        let mut lock = self.lock(name).with_ttl(ttl).with_heartbeat(heartbeat);
        lock.on_lock_lost = on_lock_lost;
        lock
    }

    /// Run `f` while holding the lock on `name`
    pub async fn with_lock<F, Fut, T>(&self, name: impl Into<String>, f: F) -> Result<T, GateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.lock(name).with_lock(f).await
    }
}

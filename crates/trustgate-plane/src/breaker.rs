//! Circuit breaker for calls into the coordination store
//!
//! States move CLOSED → OPEN → HALF_OPEN → CLOSED:
//!
//! - **Closed**: calls pass through. `failure_threshold` consecutive failures
//!   open the circuit.
//! - **Open**: calls fail immediately without running. Once `reset_timeout`
//!   has elapsed since the last failure the breaker becomes half-open the next
//!   time its state is read.
//! - **HalfOpen**: up to `half_open_max_calls` probes run concurrently; extra
//!   callers fail fast. A failed probe re-opens the circuit. A successful
//!   probe closes it once no other calls are in flight.
//!
//! The breaker lock is never held across the wrapped future. In-flight calls
//! are counted so a slow call that started before the circuit opened cannot
//! close it again after a newer failure has opened it.
//!
//! Timing uses the monotonic tokio clock.

use parking_lot::Mutex;
use std::future::Future;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use trustgate_core::{BreakerConfig, GateError};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Outcome of a call rejected or failed through the breaker
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Circuit is open; the call was not attempted
    #[error("Circuit breaker '{0}' is open, failing fast")]
    Open(String),

    /// Circuit is half-open and every probe slot is taken
    #[error("Circuit breaker '{0}' is half-open, probe limit reached")]
    ProbesExhausted(String),

    /// The wrapped call ran and failed
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True if the call was rejected without running
    pub fn is_rejected(&self) -> bool {
        !matches!(self, BreakerError::Inner(_))
    }
}

#[derive(Debug)]
struct Counters {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_calls: u32,
    in_flight: u32,
}

impl Counters {
    fn refresh(&mut self, config: &BreakerConfig, name: &str) {
        if self.state != BreakerState::Open {
            return;
        }
        let elapsed = self
            .last_failure
            .map_or(true, |at| at.elapsed() >= config.reset_timeout());
        if elapsed {
            debug!(breaker = %name, "Circuit half-open, allowing probes");
            self.state = BreakerState::HalfOpen;
            self.half_open_calls = 0;
        }
    }
}

enum Rejection {
    Open,
    ProbesExhausted,
}

/// Protective wrapper around calls to one downstream dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    ///
    /// Fails with `GateError::Config` if the threshold or probe budget is zero.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, GateError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            counters: Mutex::new(Counters {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_calls: 0,
                in_flight: 0,
            }),
        })
    }

    /// Name used in log fields and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, moving OPEN to HALF_OPEN if the reset timeout elapsed
    pub fn state(&self) -> BreakerState {
        let mut counters = self.counters.lock();
        counters.refresh(&self.config, &self.name);
        counters.state
    }

    /// Consecutive failures recorded since the last reset
    pub fn failure_count(&self) -> u32 {
        self.counters.lock().failure_count
    }

    /// Calls currently executing through the breaker
    pub fn in_flight(&self) -> u32 {
        self.counters.lock().in_flight
    }

    /// Run `op` under the breaker.
    ///
    /// Any `Err` from `op` counts as a failure. The returned future may be
    /// dropped at any point; an abandoned call frees its slot without being
    /// counted either way.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut permit = match self.admit() {
            Ok(permit) => permit,
            Err(Rejection::Open) => return Err(BreakerError::Open(self.name.clone())),
            Err(Rejection::ProbesExhausted) => {
                return Err(BreakerError::ProbesExhausted(self.name.clone()))
            }
        };

        let result = op().await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(_) => permit.fail(),
        }
        result.map_err(BreakerError::Inner)
    }

    fn admit(&self) -> Result<CallPermit<'_>, Rejection> {
        let mut counters = self.counters.lock();
        counters.refresh(&self.config, &self.name);

        let probe = match counters.state {
            BreakerState::Open => return Err(Rejection::Open),
            BreakerState::HalfOpen => {
                if counters.half_open_calls >= self.config.half_open_max_calls {
                    return Err(Rejection::ProbesExhausted);
                }
                counters.half_open_calls += 1;
                true
            }
            BreakerState::Closed => false,
        };

        counters.in_flight += 1;
        Ok(CallPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }
}

/// Slot held by one admitted call
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    fn succeed(&mut self) {
        self.settled = true;
        let breaker = self.breaker;
        let mut counters = breaker.counters.lock();
        counters.in_flight = counters.in_flight.saturating_sub(1);

        match counters.state {
            BreakerState::Closed => counters.failure_count = 0,
            BreakerState::HalfOpen if counters.in_flight == 0 => {
                counters.state = BreakerState::Closed;
                counters.failure_count = 0;
                counters.half_open_calls = 0;
                info!(breaker = %breaker.name, "Circuit closed after successful probe");
            }
            // A stale success must not undo a newer failure
            BreakerState::HalfOpen | BreakerState::Open => {}
        }
    }

    fn fail(&mut self) {
        self.settled = true;
        let breaker = self.breaker;
        let mut counters = breaker.counters.lock();
        counters.in_flight = counters.in_flight.saturating_sub(1);
        counters.failure_count = counters.failure_count.saturating_add(1);
        counters.last_failure = Some(Instant::now());

        let reopen = self.probe || counters.state == BreakerState::HalfOpen;
        if reopen || counters.failure_count >= breaker.config.failure_threshold {
            if counters.state != BreakerState::Open {
                warn!(
                    breaker = %breaker.name,
                    failures = counters.failure_count,
                    probe = self.probe,
                    "Circuit opened"
                );
            }
            counters.state = BreakerState::Open;
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut counters = self.breaker.counters.lock();
        counters.in_flight = counters.in_flight.saturating_sub(1);
        if self.probe {
            counters.half_open_calls = counters.half_open_calls.saturating_sub(1);
        }
    }
}

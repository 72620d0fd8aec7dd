//! Circuit breaker
//!
//! Protects one Kubernetes API surface from repeated failing calls. A
//! breaker is Closed (calls flow through), Open (calls rejected until a
//! timeout expires), or HalfOpen (a bounded number of probe calls decide
//! whether to close again).
//!
//! Every state change, and every periodic reset while Closed, starts a new
//! generation and zeroes the counters. A call's post-accounting compares the
//! generation it captured on entry with the current one; on mismatch the
//! result is discarded so a stale call can never flip state.

use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::store::StoreError;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl State {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request counters for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

/// Errors produced by [`CircuitBreaker::execute`]
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit breaker is open")]
    Open,

    #[error("too many requests in half-open state")]
    TooManyRequests,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BreakerError {
    /// True when the breaker rejected the call without running the operation.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open | Self::TooManyRequests)
    }
}

/// Decides whether the Closed breaker should trip based on current counts.
pub type ReadyToTrip = Box<dyn Fn(Counts) -> bool + Send + Sync>;

/// Classifies an operation error as a success for accounting purposes
/// (e.g. a benign NotFound on a delete).
pub type SuccessPredicate = Box<dyn Fn(&StoreError) -> bool + Send + Sync>;

/// Invoked on every state transition with (name, from, to).
pub type StateChangeHook = Box<dyn Fn(&str, State, State) + Send + Sync>;

/// Circuit breaker configuration. Zero values fall back to the defaults
/// (1 half-open request, 60s interval, 60s open timeout).
#[derive(Default)]
pub struct BreakerConfig {
    pub max_requests: u32,
    pub interval: Duration,
    pub timeout: Duration,
    pub ready_to_trip: Option<ReadyToTrip>,
    pub is_successful: Option<SuccessPredicate>,
    pub on_state_change: Option<StateChangeHook>,
}

fn default_ready_to_trip(counts: Counts) -> bool {
    counts.consecutive_failures > 5
}

struct Shared {
    state: State,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// A circuit breaker guarding a single API surface.
pub struct CircuitBreaker {
    name: String,
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    ready_to_trip: ReadyToTrip,
    is_successful: SuccessPredicate,
    on_state_change: Option<StateChangeHook>,
    shared: Mutex<Shared>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            max_requests: if config.max_requests == 0 {
                1
            } else {
                config.max_requests
            },
            interval: if config.interval.is_zero() {
                Duration::from_secs(60)
            } else {
                config.interval
            },
            timeout: if config.timeout.is_zero() {
                Duration::from_secs(60)
            } else {
                config.timeout
            },
            ready_to_trip: config
                .ready_to_trip
                .unwrap_or_else(|| Box::new(default_ready_to_trip)),
            is_successful: config.is_successful.unwrap_or_else(|| Box::new(|_| false)),
            on_state_change: config.on_state_change,
            shared: Mutex::new(Shared {
                state: State::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
        };

        {
            let mut shared = breaker.shared.lock();
            breaker.to_new_generation(&mut shared, Instant::now());
        }

        breaker
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` through the breaker.
    ///
    /// A panic inside the operation is accounted as a failure before it is
    /// resumed, so abnormal returns cannot leak past the accounting.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let generation = self.before_request()?;

        match AssertUnwindSafe(operation()).catch_unwind().await {
            Err(panic) => {
                self.after_request(generation, false);
                std::panic::resume_unwind(panic);
            }
            Ok(Ok(value)) => {
                self.after_request(generation, true);
                Ok(value)
            }
            Ok(Err(err)) => {
                let counts_as_success = (self.is_successful)(&err);
                self.after_request(generation, counts_as_success);
                Err(BreakerError::Store(err))
            }
        }
    }

    /// Current state, applying any pending timed transition.
    pub fn state(&self) -> State {
        let mut shared = self.shared.lock();
        let (state, _) = self.current_state(&mut shared, Instant::now());
        state
    }

    /// Counters for the current generation.
    pub fn counts(&self) -> Counts {
        self.shared.lock().counts
    }

    fn before_request(&self) -> Result<u64, BreakerError> {
        let mut shared = self.shared.lock();
        let (state, generation) = self.current_state(&mut shared, Instant::now());

        match state {
            State::Open => Err(BreakerError::Open),
            State::HalfOpen if shared.counts.requests >= self.max_requests => {
                Err(BreakerError::TooManyRequests)
            }
            _ => {
                shared.counts.requests += 1;
                Ok(generation)
            }
        }
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut shared = self.shared.lock();
        let now = Instant::now();
        let (state, generation) = self.current_state(&mut shared, now);
        if generation != before {
            // the breaker moved on; this result belongs to a dead generation
            return;
        }

        if success {
            self.on_success(&mut shared, state, now);
        } else {
            self.on_failure(&mut shared, state, now);
        }
    }

    fn on_success(&self, shared: &mut Shared, state: State, now: Instant) {
        shared.counts.total_successes += 1;
        shared.counts.consecutive_successes += 1;
        shared.counts.consecutive_failures = 0;

        if state == State::HalfOpen && shared.counts.consecutive_successes >= self.max_requests {
            self.set_state(shared, State::Closed, now);
        }
    }

    fn on_failure(&self, shared: &mut Shared, state: State, now: Instant) {
        shared.counts.total_failures += 1;
        shared.counts.consecutive_failures += 1;
        shared.counts.consecutive_successes = 0;

        match state {
            State::Closed if (self.ready_to_trip)(shared.counts) => {
                self.set_state(shared, State::Open, now);
            }
            State::HalfOpen => {
                self.set_state(shared, State::Open, now);
            }
            _ => {}
        }
    }

    fn current_state(&self, shared: &mut Shared, now: Instant) -> (State, u64) {
        match shared.state {
            State::Closed => {
                if shared.expiry.is_some_and(|expiry| expiry <= now) {
                    self.to_new_generation(shared, now);
                }
            }
            State::Open => {
                if shared.expiry.is_some_and(|expiry| expiry <= now) {
                    self.set_state(shared, State::HalfOpen, now);
                }
            }
            State::HalfOpen => {}
        }

        (shared.state, shared.generation)
    }

    fn set_state(&self, shared: &mut Shared, state: State, now: Instant) {
        if shared.state == state {
            return;
        }

        let previous = shared.state;
        shared.state = state;
        self.to_new_generation(shared, now);

        if let Some(hook) = &self.on_state_change {
            hook(&self.name, previous, state);
        }
    }

    fn to_new_generation(&self, shared: &mut Shared, now: Instant) {
        shared.generation += 1;
        shared.counts = Counts::default();
        shared.expiry = match shared.state {
            State::Closed => Some(now + self.interval),
            State::Open => Some(now + self.timeout),
            State::HalfOpen => None,
        };
    }
}

//! Three-state circuit breaker guarding a single upstream transport.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::errors::{RelayError, RelayErrorKind, RelayResult};

/// Current gating state of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
    pub rolling_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            rolling_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CircuitBreakerStats {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    window_failures: Vec<Instant>,
}

/// Per-transport gate: fails fast once `failure_threshold` consecutive
/// failures accumulate, and probes for recovery after `recovery_timeout`.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    total_calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    /// Optional diagnostic: failures seen by `RelayErrorKind`, so a caller can
    /// tell whether a breaker is tripping on e.g. rate limiting vs. genuine
    /// network loss without needing a separate metrics pipeline.
    failures_by_kind: DashMap<RelayErrorKind, AtomicU64>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                window_failures: Vec::new(),
            }),
            total_calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            failures_by_kind: DashMap::new(),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!("circuit transitioning to half-open after recovery timeout");
                }
            }
        }
        inner.state
    }

    /// Gate a call: returns `Err(CircuitOpen)` immediately if the breaker is
    /// open, otherwise runs `operation` and records the outcome.
    pub async fn call<F, Fut, T>(&self, service: &str, operation: F) -> RelayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = RelayResult<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if self.state() == CircuitState::Open {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            return Err(RelayError::CircuitOpen { service: service.to_string() });
        }

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure(err.kind());
                Err(err)
            }
        }
    }

    fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;

        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && successes >= self.config.success_threshold {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.window_failures.clear();
            self.consecutive_successes.store(0, Ordering::Relaxed);
            info!("circuit closed after successful recovery probes");
        }
    }

    fn on_failure(&self, kind: RelayErrorKind) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.failures_by_kind.entry(kind).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        let mut inner = self.inner.lock();
        inner.window_failures.push(Instant::now());
        let cutoff = Instant::now() - self.config.rolling_window;
        inner.window_failures.retain(|t| *t >= cutoff);

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!("circuit reopened after failure during half-open probe");
        } else if inner.state == CircuitState::Closed && failures >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(failures, "circuit opened after consecutive failures");
        }
    }

    /// Fraction of calls within `rolling_window` that failed.
    pub fn windowed_failure_rate(&self) -> f64 {
        let inner = self.inner.lock();
        let cutoff = Instant::now() - self.config.rolling_window;
        let recent = inner.window_failures.iter().filter(|t| **t >= cutoff).count();
        let total = self.total_calls.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            recent as f64 / total as f64
        }
    }

    /// Failure count observed for a specific [`RelayErrorKind`], `0` if that
    /// kind has never been recorded. Lets a caller decide whether a breaker
    /// is tripping on a specific kind (e.g. persistent auth failures) rather
    /// than transient network loss, without a separate metrics pipeline.
    pub fn failures_of_kind(&self, kind: RelayErrorKind) -> u64 {
        self.failures_by_kind.get(&kind).map(|count| count.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            consecutive_successes: self.consecutive_successes.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.window_failures.clear();
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
    }

    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }
}

/// Aggregate health across a named set of breakers, e.g. one per transport.
pub struct CircuitBreakerManager {
    breakers: DashMap<String, std::sync::Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self { breakers: DashMap::new(), default_config }
    }

    pub fn get_or_create(&self, service: &str) -> std::sync::Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(self.default_config)))
            .clone()
    }

    /// `(closed, half_open, open)` counts across every tracked service.
    pub fn aggregate_health(&self) -> (usize, usize, usize) {
        let mut closed = 0;
        let mut half_open = 0;
        let mut open = 0;
        for entry in self.breakers.iter() {
            match entry.value().state() {
                CircuitState::Closed => closed += 1,
                CircuitState::HalfOpen => half_open += 1,
                CircuitState::Open => open += 1,
            }
        }
        (closed, half_open, open)
    }
}

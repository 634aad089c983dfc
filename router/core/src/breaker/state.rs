//! Per-engine circuit breaker
//!
//! ```text
//! +--------+  failures >= threshold  +------+  cooldown elapsed   +-----------+
//! | Closed | ----------------------> | Open | ------------------> | Half-Open |
//! +--------+                         +------+   (lazy, on check)  +-----------+
//!     ^                                 ^                             |    |
//!     |                                 |          probe fails        |    |
//!     |                                 +-----------------------------+    |
//!     |                        probe succeeds                              |
//!     +--------------------------------------------------------------------+
//! ```
//!
//! All state is atomic. The open to half-open move is a compare-exchange, so
//! exactly one caller observes it and that caller owns the single probe.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

const CLOSED: u32 = 0;
const OPEN: u32 = 1;
const HALF_OPEN: u32 = 2;

/// Circuit breaker state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    #[default]
    Closed,
    /// Requests are rejected until the cooldown elapses
    Open,
    /// One probe request decides whether to close or re-open
    HalfOpen,
}

impl CircuitState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    /// Snake-case label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Outcome of asking a breaker whether a request may proceed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed
    Allowed,
    /// This call moved the circuit to half-open and owns the probe
    HalfOpened,
    /// Circuit was already half-open and this call claimed the probe
    Probe,
    /// Circuit open, or the probe is already in flight
    Rejected,
}

impl Admission {
    /// Whether the request may proceed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Breaker for a single engine
pub struct EngineBreaker {
    /// Engine identifier
    pub engine_id: String,
    state: AtomicU32,
    failure_count: AtomicU32,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    /// Millis since `startup`, 0 when never failed
    last_failure_ts: AtomicU64,
    probe_in_flight: AtomicBool,
    threshold: AtomicU32,
    cooldown_ms: AtomicU64,
    startup: Instant,
}

impl EngineBreaker {
    /// Closed breaker tripping after `threshold` consecutive failures
    pub fn new(engine_id: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            engine_id: engine_id.into(),
            state: AtomicU32::new(CLOSED),
            failure_count: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            last_failure_ts: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            threshold: AtomicU32::new(threshold.max(1)),
            cooldown_ms: AtomicU64::new(duration_millis(cooldown)),
            startup: Instant::now(),
        }
    }

    /// Current state without triggering the lazy half-open transition
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Decide whether a request may be sent to this engine
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open here.
    /// In half-open exactly one caller is admitted until the probe reports
    /// back through [`Self::record_success`] or [`Self::record_failure`].
    pub fn admit(&self) -> Admission {
        match self.state() {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                if self.cooldown_elapsed() && self.try_half_open() {
                    Admission::HalfOpened
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        let last = self.last_failure_ts.load(Ordering::Acquire);
        let cooldown = self.cooldown_ms.load(Ordering::Relaxed);
        self.now_millis().saturating_sub(last) > cooldown
    }

    fn try_half_open(&self) -> bool {
        // Claim the probe before publishing half-open
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self
            .state
            .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.probe_in_flight.store(false, Ordering::Release);
            return false;
        }
        tracing::info!(engine = %self.engine_id, "Circuit breaker half-open, sending probe");
        true
    }

    /// Record a success. Returns the new state when it changed.
    pub fn record_success(&self) -> Option<CircuitState> {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Release);

        if self
            .state
            .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.probe_in_flight.store(false, Ordering::Release);
            tracing::info!(engine = %self.engine_id, "Circuit breaker closed, engine recovered");
            return Some(CircuitState::Closed);
        }
        None
    }

    /// Record a failure. Returns the new state when it changed.
    pub fn record_failure(&self) -> Option<CircuitState> {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ts.store(self.now_millis(), Ordering::Release);
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::Closed if failures >= self.threshold.load(Ordering::Relaxed) => {
                if self
                    .state
                    .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::warn!(
                        engine = %self.engine_id,
                        failures,
                        "Circuit breaker opened"
                    );
                    return Some(CircuitState::Open);
                }
                None
            }
            CircuitState::HalfOpen => {
                self.state.store(OPEN, Ordering::Release);
                self.probe_in_flight.store(false, Ordering::Release);
                tracing::warn!(engine = %self.engine_id, "Probe failed, circuit breaker re-opened");
                Some(CircuitState::Open)
            }
            _ => None,
        }
    }

    /// Open the circuit regardless of the failure count
    pub fn force_open(&self) {
        self.last_failure_ts.store(self.now_millis(), Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
        self.state.store(OPEN, Ordering::Release);
    }

    /// Close the circuit and clear the failure count
    pub fn reset(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.last_failure_ts.store(0, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
    }

    /// Change threshold and cooldown for future decisions
    pub fn reconfigure(&self, threshold: u32, cooldown: Duration) {
        self.threshold.store(threshold.max(1), Ordering::Relaxed);
        self.cooldown_ms
            .store(duration_millis(cooldown), Ordering::Relaxed);
    }

    /// Consecutive failures
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Failures since creation
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Time since the last failure, if any
    #[must_use]
    pub fn time_since_last_failure(&self) -> Option<Duration> {
        let ts = self.last_failure_ts.load(Ordering::Acquire);
        if ts == 0 {
            return None;
        }
        Some(Duration::from_millis(self.now_millis().saturating_sub(ts)))
    }

    /// Millis since creation, never 0 so 0 can mean "never"
    fn now_millis(&self) -> u64 {
        duration_millis(self.startup.elapsed()) + 1
    }

    /// Point-in-time view
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            engine: self.engine_id.clone(),
            state: self.state(),
            failure_count: self.failure_count(),
            total_failures: self.total_failures(),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            threshold: self.threshold.load(Ordering::Relaxed),
            cooldown_ms: self.cooldown_ms.load(Ordering::Relaxed),
            ms_since_last_failure: self
                .time_since_last_failure()
                .map(duration_millis),
        }
    }
}

impl std::fmt::Debug for EngineBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBreaker")
            .field("engine_id", &self.engine_id)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish_non_exhaustive()
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Point-in-time view of one breaker
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    /// Engine id
    pub engine: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Failures since creation
    pub total_failures: u64,
    /// Successes since creation
    pub total_successes: u64,
    /// Failures that open the circuit
    pub threshold: u32,
    /// Open duration before a probe
    pub cooldown_ms: u64,
    /// Time since the last failure
    pub ms_since_last_failure: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> EngineBreaker {
        EngineBreaker::new("remote", threshold, Duration::from_millis(cooldown_ms))
    }

    #[test]
    fn test_opens_at_threshold() {
        let b = breaker(3, 10_000);
        assert_eq!(b.record_failure(), None);
        assert_eq!(b.record_failure(), None);
        assert_eq!(b.admit(), Admission::Allowed);
        assert_eq!(b.record_failure(), Some(CircuitState::Open));
        assert_eq!(b.admit(), Admission::Rejected);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = breaker(3, 10_000);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 1);
    }

    #[test]
    fn test_single_probe_after_cooldown() {
        let b = breaker(1, 5);
        b.record_failure();
        assert_eq!(b.admit(), Admission::Rejected);

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(b.admit(), Admission::HalfOpened);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.admit(), Admission::Rejected);
    }

    #[test]
    fn test_probe_success_closes() {
        let b = breaker(1, 0);
        b.record_failure();
        std::thread::sleep(Duration::from_millis(2));
        assert!(b.admit().is_allowed());
        assert_eq!(b.record_success(), Some(CircuitState::Closed));
        assert_eq!(b.admit(), Admission::Allowed);
    }

    #[test]
    fn test_probe_failure_reopens_and_restarts_cooldown() {
        let b = breaker(1, 20);
        b.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(b.admit(), Admission::HalfOpened);
        assert_eq!(b.record_failure(), Some(CircuitState::Open));
        assert_eq!(b.admit(), Admission::Rejected);
    }

    #[test]
    fn test_force_open_and_reset() {
        let b = breaker(5, 60_000);
        b.force_open();
        assert_eq!(b.admit(), Admission::Rejected);
        b.reset();
        assert_eq!(b.admit(), Admission::Allowed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn test_half_open_transition_happens_once_under_contention() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let b = Arc::new(breaker(1, 0));
        b.record_failure();
        std::thread::sleep(Duration::from_millis(2));

        let admitted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&b);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    if b.admit().is_allowed() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }
}

//! Breaker registry with bounded event history

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::category::ErrorCategory;
use super::state::{Admission, BreakerSnapshot, CircuitState, EngineBreaker};

/// Breaker settings applied to every engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures that open a closed circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a probe
    pub cooldown: Duration,
    /// Maximum retained events
    pub history_limit: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            history_limit: 100,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Kind of breaker event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerEventKind {
    /// Circuit tripped open
    CircuitOpen,
    /// Circuit closed again
    CircuitClose,
    /// Cooldown elapsed, probe admitted
    CircuitHalfOpen,
    /// Request moved on to another engine
    Failover,
    /// Engine reported rate limiting
    RateLimit,
    /// Engine failed
    Failure,
    /// Engine answered
    Success,
}

/// A recorded breaker event
#[derive(Clone, Debug, Serialize)]
pub struct BreakerEvent {
    /// What happened
    pub kind: BreakerEventKind,
    /// Engine the event is about
    pub engine: String,
    /// Category, target engine or reason
    pub detail: Option<String>,
    /// When the event was recorded
    pub at: DateTime<Utc>,
}

/// Aggregate breaker view for dashboards
#[derive(Clone, Debug, Default, Serialize)]
pub struct BreakerStatus {
    /// Engines whose circuit is open or half-open
    pub open: Vec<String>,
    /// Failures across all engines since start
    pub total_failures: u64,
    /// Failover events in the last hour
    pub failovers_last_hour: usize,
    /// Per-engine detail, sorted by engine id
    pub engines: Vec<BreakerSnapshot>,
}

// ============================================================================
// Registry
// ============================================================================

/// All engine breakers, created on first use
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<EngineBreaker>>,
    config: RwLock<BreakerConfig>,
    events: Mutex<VecDeque<BreakerEvent>>,
}

impl BreakerRegistry {
    /// Registry creating breakers with `config`
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config: RwLock::new(config),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Breaker for an engine, creating a closed one if needed
    pub fn get_or_create(&self, engine: &str) -> Arc<EngineBreaker> {
        if let Some(existing) = self.breakers.get(engine) {
            return Arc::clone(existing.value());
        }
        let config = self.config.read().clone();
        self.breakers
            .entry(engine.to_string())
            .or_insert_with(|| {
                Arc::new(EngineBreaker::new(
                    engine,
                    config.failure_threshold,
                    config.cooldown,
                ))
            })
            .clone()
    }

    /// Whether requests to `engine` are currently rejected
    ///
    /// A `false` answer admits the caller. When the circuit is half-open the
    /// caller holds the single probe and must report its outcome.
    pub fn is_open(&self, engine: &str) -> bool {
        !self.allow_request(engine)
    }

    /// Ask the engine's breaker for admission
    pub fn allow_request(&self, engine: &str) -> bool {
        let admission = self.get_or_create(engine).admit();
        if admission == Admission::HalfOpened {
            self.push_event(BreakerEventKind::CircuitHalfOpen, engine, None);
        }
        admission.is_allowed()
    }

    /// Current state without side effects
    #[must_use]
    pub fn state(&self, engine: &str) -> CircuitState {
        self.breakers
            .get(engine)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    /// Record an answer from `engine`
    pub fn record_success(&self, engine: &str) {
        let transition = self.get_or_create(engine).record_success();
        self.push_event(BreakerEventKind::Success, engine, None);
        if transition == Some(CircuitState::Closed) {
            self.push_event(BreakerEventKind::CircuitClose, engine, None);
        }
    }

    /// Record a failure of `engine`
    pub fn record_failure(&self, engine: &str, category: ErrorCategory) {
        let transition = self.get_or_create(engine).record_failure();
        let kind = if category == ErrorCategory::RateLimit {
            BreakerEventKind::RateLimit
        } else {
            BreakerEventKind::Failure
        };
        self.push_event(kind, engine, Some(category.to_string()));
        if transition == Some(CircuitState::Open) {
            self.push_event(BreakerEventKind::CircuitOpen, engine, None);
        }
    }

    /// Note that a request moved on from `from` to `to`
    pub fn record_failover(&self, from: &str, to: &str) {
        tracing::debug!(from = %from, to = %to, "Failing over");
        self.push_event(BreakerEventKind::Failover, from, Some(to.to_string()));
    }

    // ========================================================================
    // Admin
    // ========================================================================

    /// Open the circuit of `engine` until reset
    pub fn force_open(&self, engine: &str, reason: &str) {
        self.get_or_create(engine).force_open();
        tracing::warn!(engine = %engine, reason = %reason, "Circuit breaker forced open");
        self.push_event(BreakerEventKind::CircuitOpen, engine, Some(reason.to_string()));
    }

    /// Close the circuit of `engine`
    pub fn reset(&self, engine: &str) {
        if let Some(breaker) = self.breakers.get(engine) {
            breaker.reset();
            tracing::info!(engine = %engine, "Circuit breaker reset");
            self.push_event(BreakerEventKind::CircuitClose, engine, Some("reset".into()));
        }
    }

    /// Close every circuit and clear the event history
    pub fn reset_all(&self) {
        for entry in &self.breakers {
            entry.value().reset();
        }
        self.events.lock().clear();
        tracing::info!(count = self.breakers.len(), "All circuit breakers reset");
    }

    /// Apply new threshold and cooldown to existing and future breakers
    pub fn reconfigure(&self, failure_threshold: u32, cooldown: Duration) {
        {
            let mut config = self.config.write();
            config.failure_threshold = failure_threshold;
            config.cooldown = cooldown;
        }
        for entry in &self.breakers {
            entry.value().reconfigure(failure_threshold, cooldown);
        }
    }

    // ========================================================================
    // Views
    // ========================================================================

    fn push_event(&self, kind: BreakerEventKind, engine: &str, detail: Option<String>) {
        let limit = self.config.read().history_limit;
        let mut events = self.events.lock();
        events.push_back(BreakerEvent {
            kind,
            engine: engine.to_string(),
            detail,
            at: Utc::now(),
        });
        while events.len() > limit {
            events.pop_front();
        }
    }

    /// Most recent events, newest last
    #[must_use]
    pub fn events(&self, limit: usize) -> Vec<BreakerEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    /// Snapshot of every breaker
    #[must_use]
    pub fn status_summary(&self) -> BreakerStatus {
        let mut engines: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|b| b.value().snapshot()).collect();
        engines.sort_by(|a, b| a.engine.cmp(&b.engine));

        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let failovers_last_hour = self
            .events
            .lock()
            .iter()
            .filter(|e| e.kind == BreakerEventKind::Failover && e.at >= hour_ago)
            .count();

        BreakerStatus {
            open: engines
                .iter()
                .filter(|s| s.state != CircuitState::Closed)
                .map(|s| s.engine.clone())
                .collect(),
            total_failures: engines.iter().map(|s| s.total_failures).sum(),
            failovers_last_hour,
            engines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry(threshold: u32) -> BreakerRegistry {
        BreakerRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(60),
            history_limit: 5,
        })
    }

    #[test]
    fn test_unknown_engine_is_closed() {
        let r = registry(2);
        assert_eq!(r.state("remote"), CircuitState::Closed);
        assert!(!r.is_open("remote"));
    }

    #[test]
    fn test_trip_records_events() {
        let r = registry(2);
        r.record_failure("remote", ErrorCategory::Server);
        r.record_failure("remote", ErrorCategory::RateLimit);
        assert!(r.is_open("remote"));

        let kinds: Vec<_> = r.events(10).iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BreakerEventKind::Failure,
                BreakerEventKind::RateLimit,
                BreakerEventKind::CircuitOpen
            ]
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let r = registry(100);
        for _ in 0..20 {
            r.record_success("local-fast");
        }
        assert_eq!(r.events(100).len(), 5);
    }

    #[test]
    fn test_force_open_reset_and_summary() {
        let r = registry(5);
        r.force_open("remote", "maintenance");
        r.record_failover("remote", "local-semantic");

        let status = r.status_summary();
        assert_eq!(status.open, vec!["remote".to_string()]);
        assert_eq!(status.failovers_last_hour, 1);

        r.reset("remote");
        assert!(r.status_summary().open.is_empty());
    }

    #[test]
    fn test_reset_all_and_reconfigure() {
        let r = registry(5);
        r.force_open("a", "test");
        r.force_open("b", "test");
        r.reset_all();
        assert!(r.status_summary().open.is_empty());
        assert!(r.events(10).is_empty());

        r.reconfigure(1, Duration::from_secs(60));
        r.record_failure("a", ErrorCategory::Timeout);
        assert_eq!(r.state("a"), CircuitState::Open);
    }
}

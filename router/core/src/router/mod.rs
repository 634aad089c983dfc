//! Query Router
//!
//! The orchestrator. Owns `Arc` handles to every collaborator and drives
//! one request through its stages:
//!
//! ```text
//! Received -> CacheChecked -+-> CacheHit -----------------------------+
//!                           |                                         |
//!                           +-> CacheMiss -> Analyzing                |
//!                                 -> EngineSelected                   |
//!                                 -> Executing | FallbackLoop         |
//!                                 -> MetricsRecorded -> CacheWritten -+-> Responded
//! ```
//!
//! Cache-miss execution runs in a spawned task bounded by the request
//! deadline. A request that outlives its deadline gets a fast fallback
//! response while the task keeps running; a late success still fills the
//! cache unless a fresher entry was written in the meantime.
//!
//! A fresh engine answer also triggers predictive loading: queries related
//! to it (see [`PatternTracker::predict_related`]) are answered in the
//! background and stored in the predictive tier.

pub mod error;
pub mod execute;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Semaphore;

use crate::breaker::{BreakerRegistry, FallbackChain};
use crate::cache::{CacheKeys, TierStore};
use crate::complexity::{Complexity, ComplexityAnalysis, ComplexityAnalyzer, EngineFamily};
use crate::config::{ConfigError, RouterSettings};
use crate::engine::{Engine, EngineRegistry};
use crate::metrics::{
    AutoOptimizer, Bottleneck, DashboardSnapshot, MetricsCollector, OptimizationOutcome,
    OptimizationTarget, Percentiles,
};
use crate::normalizer::{normalize, NormalizedQuery};
use crate::patterns::PatternTracker;
use crate::types::{CacheTier, QueryMode, QueryRequest, QueryResponse, ThinkingStep};

pub use error::{RouteFailure, RouterError};
pub use execute::{Execution, ExecutionPolicy, Executor, Failure, InFlight};

/// Queries used to pre-populate the predictive tier
pub const DEFAULT_WARM_UP_QUERIES: [&str; 8] = [
    "cpu usage",
    "memory status",
    "disk capacity",
    "network status",
    "server status",
    "system health",
    "error logs",
    "performance metrics",
];

/// Bottlenecks included in reports and the dashboard
const BOTTLENECK_REPORT_LIMIT: usize = 5;

/// Preload passes allowed to run at once; further passes are skipped
const MAX_PRELOAD_TASKS: usize = 2;

/// Tiers a late (post-deadline) success may fill
const STRAGGLER_TIERS: [CacheTier; 3] =
    [CacheTier::Predictive, CacheTier::Pattern, CacheTier::Similarity];

// ============================================================================
// Request Stages
// ============================================================================

/// Lifecycle stage of a single request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStage {
    /// Accepted by the router
    Received,
    /// Cache tiers consulted
    CacheChecked,
    /// Served from cache
    CacheHit,
    /// No tier had an answer
    CacheMiss,
    /// Complexity analyzed
    Analyzing,
    /// Candidates chosen
    EngineSelected,
    /// First candidate answered
    Executing,
    /// Later candidates were tried
    FallbackLoop,
    /// Metric recorded
    MetricsRecorded,
    /// Answer written to the cache tiers
    CacheWritten,
    /// Response returned
    Responded,
}

impl RequestStage {
    /// Snake-case label used in stage timings
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::CacheChecked => "cache_checked",
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::Analyzing => "analyzing",
            Self::EngineSelected => "engine_selected",
            Self::Executing => "executing",
            Self::FallbackLoop => "fallback_loop",
            Self::MetricsRecorded => "metrics_recorded",
            Self::CacheWritten => "cache_written",
            Self::Responded => "responded",
        }
    }
}

/// Per-request stage timings and thinking steps
///
/// Each mark records the time since the previous mark under the stage that
/// just completed.
struct StageTrace {
    started: Instant,
    last: Instant,
    timings: BTreeMap<String, u64>,
    steps: Vec<ThinkingStep>,
}

impl StageTrace {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
            timings: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    fn record(&mut self, stage: RequestStage, ok: bool) {
        let now = Instant::now();
        let ms = millis(now.duration_since(self.last));
        self.last = now;
        self.timings.insert(stage.as_str().to_string(), ms);
        self.steps.push(if ok {
            ThinkingStep::done(stage.as_str(), ms)
        } else {
            ThinkingStep::failed(stage.as_str(), ms)
        });
    }

    fn mark(&mut self, stage: RequestStage) {
        self.record(stage, true);
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn finish(mut self, response: &mut QueryResponse) {
        self.mark(RequestStage::Responded);
        response.processing_time_ms = millis(self.elapsed());
        response.thinking_steps = self.steps;
        response.metadata.stage_timings_ms = self.timings;
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Router
// ============================================================================

/// Settings that may change at runtime
#[derive(Clone, Debug)]
struct Tunables {
    target: Duration,
    policy: ExecutionPolicy,
    chain: FallbackChain,
    local_timeout: Duration,
    remote_timeout: Duration,
    predictive_loading: bool,
}

/// A query prepared for the predictive tier
struct Preload {
    request: QueryRequest,
    normalized: NormalizedQuery,
    keys: CacheKeys,
    candidates: Vec<String>,
    complexity: Complexity,
}

impl Preload {
    /// Answer the query and store it in the predictive tier
    async fn load(self, executor: Executor, cache: &TierStore) -> bool {
        let execution = executor
            .run(
                Arc::from(self.request.text.as_str()),
                Arc::new(self.request.context.clone()),
                self.candidates,
                InFlight::default(),
            )
            .await;
        if !execution.is_success() {
            tracing::debug!(query = %self.request.text, "Preload got no answer");
            return false;
        }

        let mut response = execution.into_response();
        response.metadata.complexity = Some(self.complexity);
        response.metadata.pattern_id = Some(self.normalized.id.clone());
        !cache
            .write_back(&self.keys, &self.normalized, &response, &[CacheTier::Predictive])
            .is_empty()
    }
}

/// Routes queries to engines through the cache, breakers and metrics
pub struct QueryRouter {
    cache: Arc<TierStore>,
    patterns: Arc<PatternTracker>,
    breakers: Arc<BreakerRegistry>,
    analyzer: Arc<ComplexityAnalyzer>,
    engines: EngineRegistry,
    metrics: Arc<MetricsCollector>,
    optimizer: Arc<AutoOptimizer>,
    tunables: RwLock<Tunables>,
    permits: Arc<Semaphore>,
    preload_slots: Arc<Semaphore>,
    background: AtomicBool,
}

impl std::fmt::Debug for QueryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tunables = self.tunables.read();
        f.debug_struct("QueryRouter")
            .field("engines", &self.engines)
            .field("target", &tunables.target)
            .field("policy", &tunables.policy)
            .field("chain", &tunables.chain.engines())
            .finish_non_exhaustive()
    }
}

/// Builder for [`QueryRouter`]
#[derive(Default)]
pub struct QueryRouterBuilder {
    engines: EngineRegistry,
    settings: Option<RouterSettings>,
}

impl QueryRouterBuilder {
    /// Register an engine
    #[must_use]
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engines.register(engine);
        self
    }

    /// Use an existing registry, replacing engines added so far
    #[must_use]
    pub fn engines(mut self, engines: EngineRegistry) -> Self {
        self.engines = engines;
        self
    }

    /// Use `settings` instead of the defaults
    #[must_use]
    pub fn settings(mut self, settings: RouterSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Build the router
    ///
    /// # Errors
    ///
    /// [`RouterError::NoEngines`] when nothing is registered, and
    /// [`RouterError::UnknownEngine`] when no fallback chain entry names a
    /// registered engine.
    pub fn build(self) -> Result<QueryRouter, RouterError> {
        let settings = self.settings.unwrap_or_default();
        if self.engines.is_empty() {
            return Err(RouterError::NoEngines);
        }
        let chain = resolve_chain(&self.engines, &settings.fallback_chain)?;

        tracing::info!(
            engines = ?self.engines.ids(),
            chain = ?chain.engines(),
            target_ms = millis(settings.target),
            policy = settings.execution.as_str(),
            "Query router ready"
        );

        Ok(QueryRouter {
            cache: Arc::new(TierStore::new(settings.cache.clone())),
            patterns: Arc::new(PatternTracker::new()),
            breakers: Arc::new(BreakerRegistry::new(settings.breaker.clone())),
            analyzer: Arc::new(ComplexityAnalyzer::new(settings.analyzer.clone())),
            engines: self.engines,
            metrics: Arc::new(MetricsCollector::new(settings.metrics_config())),
            optimizer: Arc::new(AutoOptimizer::new()),
            tunables: RwLock::new(Tunables {
                target: settings.target,
                policy: settings.execution,
                chain,
                local_timeout: settings.engines.local_timeout,
                remote_timeout: settings.engines.remote_timeout,
                predictive_loading: settings.predictive_loading,
            }),
            permits: Arc::new(Semaphore::new(settings.max_concurrent_requests)),
            preload_slots: Arc::new(Semaphore::new(MAX_PRELOAD_TASKS)),
            background: AtomicBool::new(false),
        })
    }
}

/// Keep the registered chain entries, warning about the rest
fn resolve_chain(engines: &EngineRegistry, ids: &[String]) -> Result<FallbackChain, RouterError> {
    let known: Vec<&String> = ids
        .iter()
        .filter(|id| {
            let registered = engines.contains(id);
            if !registered {
                tracing::warn!(engine = %id, "Fallback chain names an unregistered engine, skipping");
            }
            registered
        })
        .collect();
    if known.is_empty() {
        let first = ids.first().cloned().unwrap_or_default();
        return Err(RouterError::UnknownEngine(first));
    }
    Ok(FallbackChain::new(known))
}

impl QueryRouter {
    /// Start building a router
    #[must_use]
    pub fn builder() -> QueryRouterBuilder {
        QueryRouterBuilder::default()
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Answer a query
    ///
    /// Never fails: validation errors, engine failures and deadline
    /// expiry all produce a well-formed failure response. Every call
    /// records exactly one metric.
    pub async fn route(&self, request: QueryRequest) -> QueryResponse {
        let mut token = self.metrics.record_start("route");
        let mut trace = StageTrace::new();
        trace.mark(RequestStage::Received);

        if request.is_blank() {
            let failure = RouteFailure::Validation;
            let mut response = QueryResponse::failure(
                failure.engine_label().unwrap_or("none"),
                failure.to_string(),
                failure.category_label(),
            );
            token.set_operation("validation");
            self.metrics.record_end(token, false, &response.engine_used, None);
            trace.mark(RequestStage::MetricsRecorded);
            trace.finish(&mut response);
            return response;
        }

        let tunables = self.tunables.read().clone();
        let deadline = request
            .options
            .timeout_ms
            .map_or(tunables.target, Duration::from_millis);
        let normalized = normalize(&request.text);
        let keys = CacheKeys::derive(&request, &normalized);

        // Cache
        if request.options.cache_enabled {
            if let Some(hit) = self.cache.lookup(&keys, &normalized) {
                trace.mark(RequestStage::CacheChecked);
                trace.mark(RequestStage::CacheHit);
                let mut response = hit.response;
                response.metadata.pattern_id = Some(normalized.id.clone());
                self.patterns.record(&normalized, millis(trace.elapsed()));
                token.set_operation(RequestStage::CacheHit.as_str());
                self.metrics
                    .record_end(token, true, &response.engine_used, Some(hit.tier));
                trace.mark(RequestStage::MetricsRecorded);
                trace.finish(&mut response);
                return response;
            }
        }
        trace.mark(RequestStage::CacheChecked);
        trace.mark(RequestStage::CacheMiss);

        // Analysis and selection
        let analysis = self.analyzer.analyze(&request.text);
        trace.mark(RequestStage::Analyzing);
        let candidates = self.candidates(request.mode, &analysis, &tunables.chain);
        tracing::debug!(
            request_id = %request.request_id,
            complexity = ?analysis.complexity,
            recommended = %analysis.recommended_engine,
            candidates = ?candidates,
            "Engines selected"
        );
        trace.mark(RequestStage::EngineSelected);

        // Execution under the deadline
        let in_flight = InFlight::default();
        let mut handle = tokio::spawn(self.executor(&tunables).run(
            Arc::from(request.text.as_str()),
            Arc::new(request.context.clone()),
            candidates,
            in_flight.clone(),
        ));
        let remaining = deadline.saturating_sub(trace.elapsed());
        let mut deadline_missed = false;
        let mut timed_out_engine = None;

        let mut response = match tokio::time::timeout(remaining, &mut handle).await {
            Ok(Ok(execution)) => execution.into_response(),
            Ok(Err(join_error)) => {
                tracing::warn!(request_id = %request.request_id, error = %join_error, "Execution task failed");
                QueryResponse::failure(
                    "fallback",
                    "Engine execution was interrupted",
                    RouteFailure::AllEnginesFailed.category_label(),
                )
            }
            Err(_) => {
                let waiting = in_flight.snapshot();
                tracing::warn!(
                    request_id = %request.request_id,
                    deadline_ms = millis(deadline),
                    in_flight = ?waiting,
                    "Deadline reached, returning fast fallback"
                );
                if request.options.cache_enabled {
                    self.fill_from_straggler(handle, keys.clone(), normalized.clone(), trace.started);
                }
                deadline_missed = true;
                timed_out_engine = waiting.first().cloned();
                fast_fallback(deadline, waiting)
            }
        };

        let stage = if response.metadata.failed_engines.is_empty() {
            RequestStage::Executing
        } else {
            RequestStage::FallbackLoop
        };
        trace.record(stage, response.success);
        token.set_operation(if deadline_missed {
            "deadline"
        } else {
            stage.as_str()
        });
        response.metadata.complexity = Some(analysis.complexity);
        response.metadata.pattern_id = Some(normalized.id.clone());

        // Accounting
        let elapsed = trace.elapsed();
        self.patterns.record(&normalized, millis(elapsed));
        // A deadline miss counts against the engine that was still running
        let metric_engine = timed_out_engine.as_deref().unwrap_or(&response.engine_used);
        self.metrics
            .record_end(token, response.success, metric_engine, None);
        trace.mark(RequestStage::MetricsRecorded);

        if request.options.cache_enabled && response.is_cacheable() {
            let mut tiers = STRAGGLER_TIERS.to_vec();
            if elapsed < tunables.target {
                tiers.insert(0, CacheTier::Exact);
            }
            let written = self.cache.write_back(&keys, &normalized, &response, &tiers);
            tracing::debug!(tiers = ?written, "Response cached");
            trace.mark(RequestStage::CacheWritten);

            if tunables.predictive_loading {
                self.preload_related(&normalized, request.mode, &tunables);
            }
        }

        trace.finish(&mut response);
        response
    }

    /// Candidate engines in invocation order
    fn candidates(
        &self,
        mode: QueryMode,
        analysis: &ComplexityAnalysis,
        chain: &FallbackChain,
    ) -> Vec<String> {
        let family = match mode {
            QueryMode::Remote => EngineFamily::Remote,
            QueryMode::Local if !analysis.recommended_engine.is_local() => {
                EngineFamily::LocalSemantic
            }
            QueryMode::Local | QueryMode::Auto => analysis.recommended_engine,
        };
        let preferred = self.engines.by_family(family).map(|e| e.id().to_string());

        chain
            .candidates(preferred.as_deref())
            .into_iter()
            .filter(|id| match self.engines.get(id) {
                Some(engine) => mode != QueryMode::Local || engine.family().is_local(),
                None => false,
            })
            .collect()
    }

    fn executor(&self, tunables: &Tunables) -> Executor {
        Executor {
            engines: self.engines.clone(),
            breakers: Arc::clone(&self.breakers),
            policy: tunables.policy,
            local_timeout: tunables.local_timeout,
            remote_timeout: tunables.remote_timeout,
            permits: Arc::clone(&self.permits),
        }
    }

    /// Let an abandoned execution fill the cache if it eventually succeeds
    fn fill_from_straggler(
        &self,
        handle: tokio::task::JoinHandle<Execution>,
        keys: CacheKeys,
        normalized: NormalizedQuery,
        started_at: Instant,
    ) {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            let Ok(execution) = handle.await else {
                return;
            };
            if !execution.is_success() {
                return;
            }
            let response = execution.into_response();
            let written =
                cache.write_back_if_fresher(&keys, &normalized, &response, &STRAGGLER_TIERS, started_at);
            tracing::debug!(
                engine = %response.engine_used,
                tiers = ?written,
                "Late answer cached"
            );
        });
    }

    // ========================================================================
    // Warm-up and prediction
    // ========================================================================

    /// Run `queries` through the engines to fill the predictive tier
    ///
    /// Queries already cached are skipped. Returns the number of entries
    /// written.
    pub async fn warm_up<I, S>(&self, queries: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tunables = self.tunables.read().clone();
        let mut warmed = 0;

        for query in queries {
            let Some(job) = self.prepare_preload(query.as_ref(), QueryMode::Auto, &tunables) else {
                continue;
            };
            if job.load(self.executor(&tunables), &self.cache).await {
                warmed += 1;
            }
        }

        tracing::info!(warmed, "Cache warm-up complete");
        warmed
    }

    /// Build a preload job, or `None` for blank or already predicted queries
    fn prepare_preload(&self, text: &str, mode: QueryMode, tunables: &Tunables) -> Option<Preload> {
        let request = QueryRequest::new(text).with_mode(mode);
        if request.is_blank() {
            return None;
        }
        let normalized = normalize(&request.text);
        let keys = CacheKeys::derive(&request, &normalized);
        if self.cache.get(CacheTier::Predictive, &keys.predictive).is_some() {
            return None;
        }
        let analysis = self.analyzer.analyze(&request.text);
        let candidates = self.candidates(mode, &analysis, &tunables.chain);
        Some(Preload {
            request,
            normalized,
            keys,
            candidates,
            complexity: analysis.complexity,
        })
    }

    /// Answer queries related to `normalized` in the background
    ///
    /// Runs only when a preload slot is free. Engine calls take execution
    /// permits like any request, and cache writes keep the tier write
    /// budget. Returns whether a preload task was started.
    fn preload_related(
        &self,
        normalized: &NormalizedQuery,
        mode: QueryMode,
        tunables: &Tunables,
    ) -> bool {
        let related = self.patterns.predict_related(normalized);
        if related.is_empty() {
            return false;
        }
        let Ok(slot) = Arc::clone(&self.preload_slots).try_acquire_owned() else {
            tracing::debug!(pattern_id = %normalized.id, "Preload slots busy, skipping");
            return false;
        };
        let jobs: Vec<Preload> = related
            .iter()
            .filter_map(|text| self.prepare_preload(text, mode, tunables))
            .collect();
        if jobs.is_empty() {
            return false;
        }

        let executor = self.executor(tunables);
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            let _slot = slot;
            let queued = jobs.len();
            let mut loaded = 0;
            for job in jobs {
                if job.load(executor.clone(), &cache).await {
                    loaded += 1;
                }
            }
            tracing::debug!(queued, loaded, "Related queries preloaded");
        });
        true
    }

    /// Warm the predictive tier with [`DEFAULT_WARM_UP_QUERIES`]
    pub async fn warm_up_defaults(&self) -> usize {
        self.warm_up(DEFAULT_WARM_UP_QUERIES).await
    }

    /// Up to three queries users asked alongside similar ones
    #[must_use]
    pub fn predict_related(&self, query: &str) -> Vec<String> {
        self.patterns.predict_related(&normalize(query))
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drop expired cache entries
    pub fn cleanup(&self) -> usize {
        let removed = self.cache.cleanup_expired();
        if removed > 0 {
            tracing::debug!(removed, "Expired cache entries removed");
        }
        removed
    }

    /// Raise alerts, prune bottlenecks and run the optimizer if needed
    pub async fn run_analysis(&self) -> Option<OptimizationOutcome> {
        let alerts = self.metrics.check_alerts();
        let pruned = self.metrics.prune_bottlenecks();
        tracing::debug!(alerts = alerts.len(), pruned, "Metrics analysis");
        self.optimizer.evaluate(&self.metrics, self).await
    }

    /// Apply runtime-tunable settings
    ///
    /// Updates the target, execution policy, fallback chain, timeouts,
    /// breaker thresholds, analyzer tables, similarity tuning and metrics
    /// thresholds. Cache capacities and the concurrency limit are fixed at
    /// build time.
    ///
    /// # Errors
    ///
    /// Returns a validation error and changes nothing when the settings are
    /// invalid or the chain names no registered engine.
    pub fn apply_tunables(&self, settings: &RouterSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        let chain = resolve_chain(&self.engines, &settings.fallback_chain)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        *self.tunables.write() = Tunables {
            target: settings.target,
            policy: settings.execution,
            chain,
            local_timeout: settings.engines.local_timeout,
            remote_timeout: settings.engines.remote_timeout,
            predictive_loading: settings.predictive_loading,
        };
        self.metrics.set_config(settings.metrics_config());
        self.breakers
            .reconfigure(settings.breaker.failure_threshold, settings.breaker.cooldown);
        self.analyzer.set_config(settings.analyzer.clone());
        self.cache.set_similarity(
            settings.cache.similarity_threshold,
            settings.cache.similarity_scan_limit,
        );

        tracing::info!(
            target_ms = millis(settings.target),
            policy = settings.execution.as_str(),
            "Router settings applied"
        );
        Ok(())
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Point-in-time view of metrics, cache and breakers
    #[must_use]
    pub fn dashboard(&self) -> DashboardSnapshot {
        DashboardSnapshot {
            generated_at: Utc::now(),
            target_ms: self.metrics.target_ms(),
            rolling: self.metrics.rolling(),
            percentiles: Percentiles::from(&self.metrics.latency()),
            engines: self.metrics.engine_stats(),
            bottlenecks: self.metrics.bottlenecks(BOTTLENECK_REPORT_LIMIT),
            alerts: self.metrics.alerts(),
            cache: self.cache.stats(),
            breakers: self.breakers.status_summary(),
            target_achievement_rate: self.metrics.target_achievement_rate(),
            summary: self.metrics.performance_summary(),
            optimizations: self.optimizer.outcomes(),
        }
    }

    /// Health of every registered engine
    pub async fn health(&self) -> Vec<(String, bool)> {
        self.engines.health().await
    }

    /// Cache tiers
    #[must_use]
    pub fn cache(&self) -> &Arc<TierStore> {
        &self.cache
    }

    /// Metrics collector
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Circuit breakers
    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Pattern tracker
    #[must_use]
    pub fn patterns(&self) -> &Arc<PatternTracker> {
        &self.patterns
    }

    /// Auto optimizer
    #[must_use]
    pub fn optimizer(&self) -> &Arc<AutoOptimizer> {
        &self.optimizer
    }

    /// Registered engines
    #[must_use]
    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    /// Current target response time
    #[must_use]
    pub fn target(&self) -> Duration {
        self.tunables.read().target
    }

    /// Current execution policy
    #[must_use]
    pub fn policy(&self) -> ExecutionPolicy {
        self.tunables.read().policy
    }

    /// Fallback chain in use
    #[must_use]
    pub fn fallback_chain(&self) -> Vec<String> {
        self.tunables.read().chain.engines().to_vec()
    }

    /// Mark background tasks as running; `false` if they already are
    pub(crate) fn claim_background(&self) -> bool {
        self.background
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_background(&self) {
        self.background.store(false, Ordering::Release);
    }
}

fn fast_fallback(deadline: Duration, waiting: Vec<String>) -> QueryResponse {
    let failure = RouteFailure::Timeout;
    let text = if waiting.is_empty() {
        format!("No engine answered within {} ms", millis(deadline))
    } else {
        format!(
            "No answer within {} ms; still waiting on {}",
            millis(deadline),
            waiting.join(", ")
        )
    };
    let mut response = QueryResponse::failure(
        failure.engine_label().unwrap_or("fallback"),
        text,
        failure.category_label(),
    );
    response.metadata.fallback_used = true;
    response.metadata.failed_engines = waiting;
    response
}

#[async_trait]
impl OptimizationTarget for QueryRouter {
    fn grow_cache(&self, factor: f64) -> usize {
        self.cache.grow_capacity(factor)
    }

    async fn warm_patterns(&self, limit: usize) -> usize {
        let samples: Vec<String> = self
            .patterns
            .top_patterns(limit)
            .into_iter()
            .map(|p| p.sample_query)
            .collect();
        self.warm_up(samples).await
    }

    fn bottleneck_report(&self) -> Vec<Bottleneck> {
        self.metrics.bottlenecks(BOTTLENECK_REPORT_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{PatternEngine, ScriptedEngine, ScriptedOutcome};
    use pretty_assertions::assert_eq;

    fn scripted(id: &str, family: EngineFamily) -> Arc<ScriptedEngine> {
        Arc::new(ScriptedEngine::new(id, family))
    }

    fn router_with(engines: &[Arc<ScriptedEngine>]) -> QueryRouter {
        let mut builder = QueryRouter::builder();
        for engine in engines {
            builder = builder.engine(Arc::clone(engine) as Arc<dyn Engine>);
        }
        builder.build().unwrap()
    }

    fn standard() -> (QueryRouter, [Arc<ScriptedEngine>; 3]) {
        let engines = [
            scripted("local-fast", EngineFamily::LocalFast),
            scripted("local-semantic", EngineFamily::LocalSemantic),
            scripted("remote", EngineFamily::Remote),
        ];
        (router_with(&engines), engines)
    }

    #[test]
    fn test_build_requires_engines() {
        let err = QueryRouter::builder().build().unwrap_err();
        assert_eq!(err, RouterError::NoEngines);
    }

    #[test]
    fn test_build_rejects_unknown_chain() {
        let mut settings = RouterSettings::default();
        settings.fallback_chain = vec!["gpu".into()];
        let err = QueryRouter::builder()
            .engine(scripted("local-fast", EngineFamily::LocalFast))
            .settings(settings)
            .build()
            .unwrap_err();
        assert_eq!(err, RouterError::UnknownEngine("gpu".into()));
    }

    #[test]
    fn test_build_skips_unregistered_chain_entries() {
        let router = router_with(&[scripted("local-fast", EngineFamily::LocalFast)]);
        assert_eq!(router.fallback_chain(), vec!["local-fast"]);
    }

    #[tokio::test]
    async fn test_blank_query_is_validation_failure() {
        let (router, engines) = standard();
        let response = router.route(QueryRequest::new("   ")).await;

        assert!(!response.success);
        assert_eq!(response.engine_used, "none");
        assert_eq!(response.metadata.error_category.as_deref(), Some("validation"));
        assert!(engines.iter().all(|e| e.invocations() == 0));
        assert_eq!(router.metrics().rolling().failures, 1);
        assert_eq!(router.cache().len(CacheTier::Exact), 0);
    }

    #[tokio::test]
    async fn test_stage_timings_recorded() {
        let (router, _) = standard();
        let response = router.route(QueryRequest::new("cpu usage")).await;

        assert!(response.success);
        for stage in ["received", "cache_miss", "analyzing", "executing", "responded"] {
            assert!(
                response.metadata.stage_timings_ms.contains_key(stage),
                "missing {stage}"
            );
        }
        assert_eq!(
            response.thinking_steps.last().map(|s| s.name.as_str()),
            Some("responded")
        );
        assert!(response.metadata.complexity.is_some());
        assert!(response.metadata.pattern_id.is_some());
    }

    #[tokio::test]
    async fn test_local_mode_never_calls_remote() {
        let (router, [_, _, remote]) = standard();
        let response = router
            .route(QueryRequest::new("explain the architecture trade-offs").with_mode(QueryMode::Local))
            .await;

        assert!(response.success);
        assert_ne!(response.engine_used, "remote");
        assert_eq!(remote.invocations(), 0);
    }

    #[tokio::test]
    async fn test_remote_mode_prefers_remote() {
        let (router, _) = standard();
        let response = router
            .route(QueryRequest::new("cpu usage").with_mode(QueryMode::Remote))
            .await;
        assert_eq!(response.engine_used, "remote");
    }

    #[tokio::test]
    async fn test_cache_disabled_always_executes() {
        let (router, [fast, _, _]) = standard();
        for _ in 0..2 {
            let response = router
                .route(QueryRequest::new("cpu usage").with_cache(false))
                .await;
            assert!(!response.metadata.cached);
        }
        assert_eq!(fast.invocations(), 2);
    }

    #[tokio::test]
    async fn test_slow_answer_is_not_exact_cached() {
        let slow = Arc::new(
            ScriptedEngine::new("local-fast", EngineFamily::LocalFast)
                .with_latency(Duration::from_millis(60)),
        );
        let mut settings = RouterSettings::default();
        settings.target = Duration::from_millis(40);
        let router = QueryRouter::builder()
            .engine(Arc::clone(&slow) as Arc<dyn Engine>)
            .settings(settings)
            .build()
            .unwrap();

        let response = router
            .route(QueryRequest::new("cpu usage").with_timeout_ms(500))
            .await;
        assert!(response.success);
        assert_eq!(router.cache().len(CacheTier::Exact), 0);
        assert_eq!(router.cache().len(CacheTier::Predictive), 1);
    }

    #[tokio::test]
    async fn test_straggler_fills_cache() {
        let slow = Arc::new(
            ScriptedEngine::new("local-fast", EngineFamily::LocalFast)
                .with_latency(Duration::from_millis(80)),
        );
        let mut settings = RouterSettings::default();
        settings.target = Duration::from_millis(20);
        let router = QueryRouter::builder()
            .engine(Arc::clone(&slow) as Arc<dyn Engine>)
            .settings(settings)
            .build()
            .unwrap();

        let response = router.route(QueryRequest::new("memory status")).await;
        assert!(!response.success);
        assert_eq!(response.engine_used, "fallback");
        assert_eq!(response.metadata.error_category.as_deref(), Some("timeout"));
        assert_eq!(response.metadata.failed_engines, vec!["local-fast"]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let again = router.route(QueryRequest::new("memory status")).await;
        assert!(again.success);
        assert_eq!(again.metadata.cache_tier, Some(CacheTier::Predictive));
        assert_eq!(slow.invocations(), 1);
    }

    #[tokio::test]
    async fn test_deadline_miss_counts_against_running_engine() {
        let slow = Arc::new(
            ScriptedEngine::new("local-fast", EngineFamily::LocalFast)
                .with_latency(Duration::from_millis(80)),
        );
        let mut settings = RouterSettings::default();
        settings.target = Duration::from_millis(20);
        let router = QueryRouter::builder()
            .engine(Arc::clone(&slow) as Arc<dyn Engine>)
            .settings(settings)
            .build()
            .unwrap();

        let response = router.route(QueryRequest::new("memory status")).await;
        assert_eq!(response.engine_used, "fallback");

        let stats = router.metrics().engine_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].0, "local-fast");
        assert_eq!(stats[0].1.failures, 1);
        let recent = router.metrics().recent(1);
        assert_eq!(recent[0].engine, "local-fast");
        assert_eq!(recent[0].operation, "deadline");
    }

    #[tokio::test]
    async fn test_metric_operation_follows_route_path() {
        let (router, _) = standard();
        router.route(QueryRequest::new("cpu usage")).await;
        router.route(QueryRequest::new("cpu usage")).await;
        router.route(QueryRequest::new("   ")).await;

        let operations: Vec<String> = router
            .metrics()
            .recent(3)
            .into_iter()
            .map(|m| m.operation)
            .collect();
        assert_eq!(operations, vec!["executing", "cache_hit", "validation"]);
    }

    #[tokio::test]
    async fn test_warm_up_fills_predictive_tier() {
        let router = QueryRouter::builder()
            .engine(Arc::new(PatternEngine::new()))
            .engine(scripted("local-semantic", EngineFamily::LocalSemantic))
            .build()
            .unwrap();

        let warmed = router.warm_up_defaults().await;
        assert_eq!(warmed, DEFAULT_WARM_UP_QUERIES.len());
        assert_eq!(router.warm_up(["cpu usage"]).await, 0);

        let response = router.route(QueryRequest::new("cpu usage")).await;
        assert!(response.metadata.cached);
        assert_eq!(response.metadata.cache_tier, Some(CacheTier::Predictive));
    }

    #[tokio::test]
    async fn test_predict_related() {
        let (router, _) = standard();
        for q in ["disk usage on server 3", "disk capacity", "memory status", "disk capacity"] {
            router.route(QueryRequest::new(q)).await;
        }
        let related = router.predict_related("disk usage on server 9");
        assert_eq!(related, vec!["disk capacity"]);
    }

    async fn wait_for_predictive(router: &QueryRouter, entries: usize) {
        for _ in 0..50 {
            if router.cache().len(CacheTier::Predictive) >= entries {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn total_invocations(engines: &[Arc<ScriptedEngine>]) -> usize {
        engines.iter().map(|e| e.invocations()).sum()
    }

    #[tokio::test]
    async fn test_related_query_is_preloaded() {
        let (router, engines) = standard();
        router.patterns().record(&normalize("disk capacity"), 5);

        let first = router.route(QueryRequest::new("disk usage on server 3")).await;
        assert!(first.success);
        wait_for_predictive(&router, 2).await;
        assert_eq!(total_invocations(&engines), 2);

        let related = router.route(QueryRequest::new("disk capacity")).await;
        assert!(related.success);
        assert!(related.metadata.cached);
        assert_eq!(related.metadata.cache_tier, Some(CacheTier::Predictive));
        assert_eq!(total_invocations(&engines), 2);
    }

    #[tokio::test]
    async fn test_preloading_can_be_disabled() {
        let mut settings = RouterSettings::default();
        settings.predictive_loading = false;
        let engines = [scripted("local-fast", EngineFamily::LocalFast)];
        let router = QueryRouter::builder()
            .engine(Arc::clone(&engines[0]) as Arc<dyn Engine>)
            .settings(settings)
            .build()
            .unwrap();
        router.patterns().record(&normalize("disk capacity"), 5);

        router.route(QueryRequest::new("disk usage on server 3")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(router.cache().len(CacheTier::Predictive), 1);
        assert_eq!(total_invocations(&engines), 1);
    }

    #[tokio::test]
    async fn test_uncached_request_does_not_preload() {
        let (router, engines) = standard();
        router.patterns().record(&normalize("disk capacity"), 5);

        router
            .route(QueryRequest::new("disk usage on server 3").with_cache(false))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(router.cache().len(CacheTier::Predictive), 0);
        assert_eq!(total_invocations(&engines), 1);
    }

    #[tokio::test]
    async fn test_apply_tunables() {
        let (router, _) = standard();
        let mut settings = RouterSettings::default();
        settings.target = Duration::from_millis(75);
        settings.execution = ExecutionPolicy::Raced { max_concurrent: 2 };
        settings.breaker.failure_threshold = 2;
        router.apply_tunables(&settings).unwrap();

        assert_eq!(router.target(), Duration::from_millis(75));
        assert_eq!(router.metrics().target_ms(), 75);
        assert_eq!(router.policy(), ExecutionPolicy::Raced { max_concurrent: 2 });

        settings.fallback_chain.clear();
        assert!(router.apply_tunables(&settings).is_err());
        assert_eq!(router.target(), Duration::from_millis(75));
    }

    #[tokio::test]
    async fn test_failed_engine_reply_is_not_cached() {
        let engine = Arc::new(
            ScriptedEngine::new("local-fast", EngineFamily::LocalFast)
                .with_script([ScriptedOutcome::Answer(String::new(), 0.9)]),
        );
        let router = router_with(&[engine.clone()]);

        let first = router.route(QueryRequest::new("cpu usage")).await;
        assert!(!first.success);
        let second = router.route(QueryRequest::new("cpu usage")).await;
        assert!(second.success);
        assert!(!second.metadata.cached);
        assert_eq!(engine.invocations(), 2);
    }

    #[tokio::test]
    async fn test_dashboard_reflects_traffic() {
        let (router, _) = standard();
        router.route(QueryRequest::new("cpu usage")).await;
        router.route(QueryRequest::new("cpu usage")).await;

        let dashboard = router.dashboard();
        assert_eq!(dashboard.rolling.total_requests, 2);
        assert_eq!(dashboard.rolling.cache_hits, 1);
        assert_eq!(dashboard.cache.len(), 4);
        assert!(serde_json::to_string(&dashboard).is_ok());
    }
}

//! Routing Behaviour Scenarios
//!
//! End-to-end checks of the router against scripted engines.
//!
//! # Scenarios
//!
//! 1. Cache - repeats are served from cache without touching engines
//! 2. Patterns - look-alike queries share a pattern and an adapted answer
//! 3. Breakers - failing engines are skipped, then probed once
//! 4. Deadline - responses arrive within the target
//! 5. Fallback - exhaustion reports every attempted engine once
//! 6. CPU usage - a simple query stays local and repeats in under 5 ms

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use router_core::engine::{PatternEngine, ScriptedEngine};
use router_core::{
    CacheTier, CircuitState, Complexity, Engine, EngineFamily, ExecutionPolicy, QueryMode,
    QueryRequest, QueryRouter, RouterSettings,
};

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    router: QueryRouter,
    fast: Arc<ScriptedEngine>,
    semantic: Arc<ScriptedEngine>,
    remote: Arc<ScriptedEngine>,
}

fn fixture_with(settings: RouterSettings, latency: Duration) -> Fixture {
    let fast = Arc::new(ScriptedEngine::new("local-fast", EngineFamily::LocalFast).with_latency(latency));
    let semantic = Arc::new(
        ScriptedEngine::new("local-semantic", EngineFamily::LocalSemantic).with_latency(latency),
    );
    let remote = Arc::new(ScriptedEngine::new("remote", EngineFamily::Remote).with_latency(latency));
    let router = QueryRouter::builder()
        .engine(Arc::clone(&fast) as Arc<dyn Engine>)
        .engine(Arc::clone(&semantic) as Arc<dyn Engine>)
        .engine(Arc::clone(&remote) as Arc<dyn Engine>)
        .settings(settings)
        .build()
        .expect("router builds");
    Fixture {
        router,
        fast,
        semantic,
        remote,
    }
}

fn fixture() -> Fixture {
    fixture_with(RouterSettings::default(), Duration::from_millis(10))
}

// ============================================================================
// Scenario 1: Cache
// ============================================================================

/// A repeated request is cached, at least as fast, and skips the engine
#[tokio::test]
async fn scenario_1_repeat_is_served_from_cache() {
    let f = fixture();

    let first = f.router.route(QueryRequest::new("memory status")).await;
    assert!(first.success);
    assert!(!first.metadata.cached);

    let second = f.router.route(QueryRequest::new("memory status")).await;
    assert!(second.success);
    assert!(second.metadata.cached);
    assert_eq!(second.metadata.cache_tier, Some(CacheTier::Exact));
    assert_eq!(second.text, first.text);
    assert!(second.processing_time_ms <= first.processing_time_ms);

    let invocations = f.fast.invocations() + f.semantic.invocations() + f.remote.invocations();
    assert_eq!(invocations, 1);
}

/// Whitespace and case differences still hit the same entry
#[tokio::test]
async fn scenario_1b_normalized_repeat_hits() {
    let f = fixture();
    f.router.route(QueryRequest::new("Memory Status")).await;
    let again = f.router.route(QueryRequest::new("  memory   status ")).await;
    assert!(again.metadata.cached);
}

/// A different context is a different exact entry
#[tokio::test]
async fn scenario_1c_context_scopes_exact_tier() {
    let f = fixture();
    let host_a = serde_json::json!({ "host": "a" });
    let host_b = serde_json::json!({ "host": "b" });

    f.router
        .route(QueryRequest::new("memory status").with_context(host_a.clone()))
        .await;
    let other = f
        .router
        .route(QueryRequest::new("memory status").with_context(host_b))
        .await;
    assert_ne!(other.metadata.cache_tier, Some(CacheTier::Exact));

    let same = f
        .router
        .route(QueryRequest::new("memory status").with_context(host_a))
        .await;
    assert_eq!(same.metadata.cache_tier, Some(CacheTier::Exact));
}

// ============================================================================
// Scenario 2: Pattern generalization
// ============================================================================

/// "server 3" and "server 7" share a pattern; the second answer is adapted
#[tokio::test]
async fn scenario_2_pattern_tier_adapts_answer() {
    let f = fixture();

    let first = f.router.route(QueryRequest::new("disk usage on server 3")).await;
    assert!(first.success);
    assert!(first.text.contains("server 3"));

    let second = f.router.route(QueryRequest::new("disk usage on server 7")).await;
    assert!(second.success);
    assert_eq!(second.metadata.pattern_id, first.metadata.pattern_id);
    assert_eq!(second.metadata.cache_tier, Some(CacheTier::Pattern));
    assert!(second.text.contains("server 7"), "{}", second.text);
    assert!(!second.text.contains("server 3"), "{}", second.text);

    let pattern = f
        .router
        .patterns()
        .get(first.metadata.pattern_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(pattern.frequency, 2);
}

// ============================================================================
// Scenario 3: Circuit breaker
// ============================================================================

/// After the threshold the engine is skipped; after the cooldown it gets
/// exactly one probe even under concurrent traffic
#[tokio::test]
async fn scenario_3_breaker_trips_and_probes_once() {
    let mut settings = RouterSettings::default();
    settings.breaker.failure_threshold = 2;
    settings.breaker.cooldown = Duration::from_millis(100);
    let f = fixture_with(settings, Duration::from_millis(20));
    f.fast.fail_with("HTTP 503 service unavailable");

    let request = || QueryRequest::new("cpu usage").with_cache(false);

    for _ in 0..2 {
        let response = f.router.route(request()).await;
        assert!(response.success);
        assert_eq!(response.engine_used, "local-semantic");
    }
    assert_eq!(f.fast.invocations(), 2);
    assert_eq!(f.router.breakers().state("local-fast"), CircuitState::Open);

    let skipped = f.router.route(request()).await;
    assert_eq!(skipped.engine_used, "local-semantic");
    assert_eq!(skipped.metadata.failed_engines, vec!["local-fast"]);
    assert_eq!(f.fast.invocations(), 2);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let router = &f.router;
    let burst = futures::future::join_all((0..5).map(|_| router.route(request()))).await;
    assert!(burst.iter().all(|r| r.success));
    assert_eq!(f.fast.invocations(), 3);
    assert_eq!(f.router.breakers().state("local-fast"), CircuitState::Open);
}

/// A successful probe closes the circuit
#[tokio::test]
async fn scenario_3b_successful_probe_closes() {
    let mut settings = RouterSettings::default();
    settings.breaker.failure_threshold = 1;
    settings.breaker.cooldown = Duration::from_millis(50);
    let f = fixture_with(settings, Duration::ZERO);
    f.fast.fail_with("connection refused");

    f.router.route(QueryRequest::new("cpu usage").with_cache(false)).await;
    assert_eq!(f.router.breakers().state("local-fast"), CircuitState::Open);

    f.fast.recover();
    tokio::time::sleep(Duration::from_millis(70)).await;
    let response = f.router.route(QueryRequest::new("cpu usage").with_cache(false)).await;
    assert_eq!(response.engine_used, "local-fast");
    assert_eq!(f.router.breakers().state("local-fast"), CircuitState::Closed);
}

// ============================================================================
// Scenario 4: Deadline
// ============================================================================

/// A slow engine cannot push the response past the target
#[tokio::test]
async fn scenario_4_deadline_is_enforced() {
    let mut settings = RouterSettings::default();
    settings.target = Duration::from_millis(50);
    let f = fixture_with(settings, Duration::from_millis(400));

    let started = std::time::Instant::now();
    let response = f.router.route(QueryRequest::new("analyze the design strategy")).await;
    let wall = started.elapsed();

    assert!(!response.success);
    assert_eq!(response.engine_used, "fallback");
    assert_eq!(response.metadata.error_category.as_deref(), Some("timeout"));
    assert_eq!(response.metadata.failed_engines, vec!["remote"]);
    assert!(response.processing_time_ms <= 50 + 25, "{} ms", response.processing_time_ms);
    assert!(wall < Duration::from_millis(100));
}

/// The per-request timeout overrides the target
#[tokio::test]
async fn scenario_4b_request_timeout_override() {
    let mut settings = RouterSettings::default();
    settings.target = Duration::from_millis(20);
    let f = fixture_with(settings, Duration::from_millis(40));

    let response = f
        .router
        .route(QueryRequest::new("memory status").with_timeout_ms(120))
        .await;
    assert!(response.success);
}

// ============================================================================
// Scenario 5: Fallback
// ============================================================================

/// Every engine fails: the response lists each attempt once, in order
#[tokio::test]
async fn scenario_5_fallback_exhaustion() {
    let f = fixture();
    f.fast.fail_with("HTTP 500 internal error");
    f.semantic.fail_with("request timed out");
    f.remote.fail_with("HTTP 429 too many requests");

    let response = f
        .router
        .route(QueryRequest::new("analyze the design strategy"))
        .await;

    assert!(!response.success);
    assert_eq!(response.engine_used, "fallback");
    assert_eq!(
        response.metadata.error_category.as_deref(),
        Some("all_engines_failed")
    );
    assert_eq!(
        response.metadata.failed_engines,
        vec!["remote", "local-fast", "local-semantic"]
    );
    assert!(response.text.contains("remote (rate_limit)"), "{}", response.text);
    assert_eq!(f.router.cache().len(CacheTier::Exact), 0);
}

/// A non-retryable failure stops the loop and names the engine
#[tokio::test]
async fn scenario_5b_auth_failure_short_circuits() {
    let f = fixture();
    f.remote.fail_with("HTTP 401 unauthorized");

    let response = f
        .router
        .route(QueryRequest::new("analyze the design strategy"))
        .await;

    assert!(!response.success);
    assert_eq!(response.engine_used, "remote");
    assert_eq!(response.metadata.error_category.as_deref(), Some("auth"));
    assert_eq!(f.fast.invocations() + f.semantic.invocations(), 0);
}

/// Raced execution answers from the fastest engine
#[tokio::test]
async fn scenario_5c_raced_execution() {
    let fast = Arc::new(
        ScriptedEngine::new("local-fast", EngineFamily::LocalFast).with_latency(Duration::from_millis(5)),
    );
    let slow_remote = Arc::new(
        ScriptedEngine::new("remote", EngineFamily::Remote).with_latency(Duration::from_millis(100)),
    );
    let mut settings = RouterSettings::default();
    settings.execution = ExecutionPolicy::Raced { max_concurrent: 2 };
    let router = QueryRouter::builder()
        .engine(Arc::clone(&fast) as Arc<dyn Engine>)
        .engine(Arc::clone(&slow_remote) as Arc<dyn Engine>)
        .settings(settings)
        .build()
        .unwrap();

    let response = router
        .route(QueryRequest::new("analyze the design strategy"))
        .await;
    assert!(response.success);
    assert_eq!(response.engine_used, "local-fast");
    assert_eq!(slow_remote.invocations(), 1);
}

// ============================================================================
// Scenario 6: CPU usage
// ============================================================================

/// "CPU usage" is simple, answered locally, cached, and repeats in < 5 ms
#[tokio::test]
async fn scenario_6_cpu_usage() {
    let remote = Arc::new(ScriptedEngine::new("remote", EngineFamily::Remote));
    let router = QueryRouter::builder()
        .engine(Arc::new(PatternEngine::new()))
        .engine(Arc::clone(&remote) as Arc<dyn Engine>)
        .build()
        .unwrap();

    let analysis = router_core::ComplexityAnalyzer::default().analyze("CPU usage");
    assert_eq!(analysis.complexity, Complexity::Simple);
    assert!(analysis.recommended_engine.is_local());

    let first = router.route(QueryRequest::new("CPU usage")).await;
    assert!(first.success);
    assert_eq!(first.engine_used, "local-fast");
    assert_eq!(first.metadata.complexity, Some(Complexity::Simple));

    let repeat = router.route(QueryRequest::new("CPU usage")).await;
    assert!(repeat.metadata.cached);
    assert!(repeat.processing_time_ms < 5);
    assert_eq!(remote.invocations(), 0);
}

/// Declining engines hand over to the next candidate
#[tokio::test]
async fn scenario_6b_local_decline_falls_through() {
    let remote = Arc::new(ScriptedEngine::new("remote", EngineFamily::Remote));
    let router = QueryRouter::builder()
        .engine(Arc::new(PatternEngine::new()))
        .engine(Arc::clone(&remote) as Arc<dyn Engine>)
        .build()
        .unwrap();

    // Short, simple and unknown to the local rules
    let response = router.route(QueryRequest::new("weather today")).await;
    assert!(response.success);
    assert_eq!(response.engine_used, "remote");
    assert_eq!(response.metadata.failed_engines, vec!["local-fast"]);
    assert_eq!(router.breakers().state("local-fast"), CircuitState::Closed);
}

/// Local mode with no answering local engine fails without the remote
#[tokio::test]
async fn scenario_6c_local_mode_exhaustion() {
    let f = fixture();
    f.fast.fail_with("HTTP 502 bad gateway");
    f.semantic.fail_with("HTTP 502 bad gateway");

    let response = f
        .router
        .route(QueryRequest::new("cpu usage").with_mode(QueryMode::Local))
        .await;
    assert!(!response.success);
    assert_eq!(f.remote.invocations(), 0);
    assert_eq!(response.metadata.failed_engines.len(), 2);
}

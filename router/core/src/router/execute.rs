//! Engine execution
//!
//! ```text
//! candidates: [preferred, chain...]
//!       |
//!       +-- Raced { n }: first n admitted candidates run concurrently,
//!       |                first answer wins, losers finish in the background
//!       |
//!       +-- Sequential: one at a time, skipping open circuits,
//!                       stopping early on a non-retryable failure
//! ```
//!
//! Every engine call updates that engine's breaker from inside the call
//! itself, so abandoned race participants still report their outcome. A
//! panicking adapter counts as a failure: the breaker hears about it (which
//! releases a half-open probe) and the chain moves on.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::error::RouteFailure;
use crate::breaker::{BreakerRegistry, ErrorCategory, FallbackContext};
use crate::engine::{invoke_with_timeout, Engine, EngineRegistry, EngineReply};
use crate::types::QueryResponse;

/// Category recorded for an engine that ran but had no answer
pub const DECLINED: &str = "declined";

// ============================================================================
// Policy
// ============================================================================

/// How candidates are invoked
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// One candidate at a time
    #[default]
    Sequential,
    /// Up to `max_concurrent` candidates at once
    Raced {
        /// Candidates in flight at once
        max_concurrent: usize,
    },
}

impl ExecutionPolicy {
    /// Parse `"sequential"` or `"raced"`; `width` applies to raced
    ///
    /// # Errors
    ///
    /// Returns a message naming the unknown policy.
    pub fn parse(name: &str, width: usize) -> Result<Self, String> {
        match name.trim().to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "raced" | "race" => Ok(Self::Raced {
                max_concurrent: width,
            }),
            other => Err(format!("unknown execution policy: {other}")),
        }
    }

    /// Config label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Raced { .. } => "raced",
        }
    }
}

// ============================================================================
// In-flight tracking
// ============================================================================

/// Engines currently being invoked for one request
#[derive(Clone, Debug, Default)]
pub struct InFlight(Arc<Mutex<Vec<String>>>);

impl InFlight {
    fn enter(&self, engine: &str) -> InFlightGuard {
        self.0.lock().push(engine.to_string());
        InFlightGuard {
            set: self.clone(),
            engine: engine.to_string(),
        }
    }

    /// Engine ids in flight right now
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

struct InFlightGuard {
    set: InFlight,
    engine: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut engines = self.set.0.lock();
        if let Some(pos) = engines.iter().position(|e| *e == self.engine) {
            engines.remove(pos);
        }
    }
}

// ============================================================================
// Single attempt
// ============================================================================

enum Attempt {
    Answer(EngineReply),
    Declined(String),
    Empty,
    Panicked(String),
    Failed(ErrorCategory, String),
}

/// Invoke one engine and report the outcome to its breaker
async fn attempt(
    engine: Arc<dyn Engine>,
    breakers: Arc<BreakerRegistry>,
    query: Arc<str>,
    context: Arc<serde_json::Value>,
    timeout: Duration,
    in_flight: InFlight,
) -> Attempt {
    let id = engine.id().to_string();
    let result = {
        let _guard = in_flight.enter(&id);
        AssertUnwindSafe(invoke_with_timeout(engine.as_ref(), &query, &context, timeout))
            .catch_unwind()
            .await
    };
    let Ok(result) = result else {
        tracing::warn!(engine = %id, "Engine panicked");
        breakers.record_failure(&id, ErrorCategory::Unknown);
        return Attempt::Panicked(format!("Engine {id} panicked"));
    };

    match result {
        Ok(reply) if reply.success && !reply.text.trim().is_empty() => {
            breakers.record_success(&id);
            Attempt::Answer(reply)
        }
        Ok(reply) if reply.success => {
            tracing::debug!(engine = %id, "Engine returned an empty answer");
            breakers.record_failure(&id, ErrorCategory::Unknown);
            Attempt::Empty
        }
        Ok(reply) => {
            // The engine is healthy, it just has nothing for this query
            breakers.record_success(&id);
            Attempt::Declined(reply.text)
        }
        Err(err) => {
            let category = err.category();
            tracing::debug!(engine = %id, category = %category, error = %err, "Engine call failed");
            breakers.record_failure(&id, category);
            Attempt::Failed(category, err.to_string())
        }
    }
}

// ============================================================================
// Execution result
// ============================================================================

/// Outcome of running the candidates for one request
#[derive(Debug)]
pub struct Execution {
    /// Winning engine and its reply, or why there is none
    pub result: Result<(String, EngineReply), Failure>,
    /// Attempts made, in order
    pub attempts: FallbackContext,
}

/// A request that ended without an answer
#[derive(Debug, Clone)]
pub struct Failure {
    /// Why the request failed
    pub kind: RouteFailure,
    /// Engine responsible, for engine failures
    pub engine: Option<String>,
    /// Detail from the last failure
    pub message: Option<String>,
}

impl Execution {
    fn answered(engine: String, reply: EngineReply, attempts: FallbackContext) -> Self {
        Self {
            result: Ok((engine, reply)),
            attempts,
        }
    }

    fn failed(
        kind: RouteFailure,
        engine: Option<String>,
        message: Option<String>,
        attempts: FallbackContext,
    ) -> Self {
        Self {
            result: Err(Failure {
                kind,
                engine,
                message,
            }),
            attempts,
        }
    }

    /// Whether an engine answered
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Build the caller-facing response
    #[must_use]
    pub fn into_response(self) -> QueryResponse {
        let failed_engines = self.attempts.failed_engines();
        match self.result {
            Ok((engine, reply)) => {
                let mut response = QueryResponse::success(engine, reply.text, reply.confidence);
                response.metadata.fallback_used = !failed_engines.is_empty();
                response.metadata.failed_engines = failed_engines;
                response
            }
            Err(failure) => {
                let engine = failure
                    .kind
                    .engine_label()
                    .map(str::to_string)
                    .or(failure.engine)
                    .unwrap_or_else(|| "fallback".to_string());
                let text = match failure.kind {
                    RouteFailure::AllEnginesFailed => {
                        let detail: Vec<String> = self
                            .attempts
                            .failures()
                            .iter()
                            .map(|f| format!("{} ({})", f.engine, f.category))
                            .collect();
                        if detail.is_empty() {
                            "No engine is available for this query".to_string()
                        } else {
                            format!("All engines failed: {}", detail.join(", "))
                        }
                    }
                    _ => failure
                        .message
                        .unwrap_or_else(|| failure.kind.to_string()),
                };
                let mut response =
                    QueryResponse::failure(engine, text, failure.kind.category_label());
                response.metadata.fallback_used = response.engine_used == "fallback";
                response.metadata.failed_engines = failed_engines;
                response
            }
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Everything needed to run candidates, detached from the router
#[derive(Clone, Debug)]
pub struct Executor {
    /// Adapters by id
    pub engines: EngineRegistry,
    /// Shared circuit breakers
    pub breakers: Arc<BreakerRegistry>,
    /// Sequential or raced
    pub policy: ExecutionPolicy,
    /// Per-call bound for local engines
    pub local_timeout: Duration,
    /// Per-call bound for the remote engine
    pub remote_timeout: Duration,
    /// Shared execution permits
    pub permits: Arc<Semaphore>,
}

struct Request {
    query: Arc<str>,
    context: Arc<serde_json::Value>,
    in_flight: InFlight,
}

impl Executor {
    fn timeout_for(&self, engine: &dyn Engine) -> Duration {
        if engine.family().is_local() {
            self.local_timeout
        } else {
            self.remote_timeout
        }
    }

    /// Run `candidates` under the configured policy
    pub async fn run(
        self,
        query: Arc<str>,
        context: Arc<serde_json::Value>,
        candidates: Vec<String>,
        in_flight: InFlight,
    ) -> Execution {
        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return Execution::failed(
                RouteFailure::AllEnginesFailed,
                None,
                Some("router is shutting down".into()),
                FallbackContext::new(),
            );
        };

        let request = Request {
            query,
            context,
            in_flight,
        };
        let mut attempts = FallbackContext::new();

        if let ExecutionPolicy::Raced { max_concurrent } = self.policy {
            if max_concurrent > 1 {
                if let Some(done) = self
                    .race(&request, &candidates, max_concurrent, &mut attempts)
                    .await
                {
                    return done;
                }
            }
        }

        self.sequential(&request, &candidates, attempts).await
    }

    fn spawn_attempt(&self, engine: Arc<dyn Engine>, request: &Request) -> tokio::task::JoinHandle<Attempt> {
        let timeout = self.timeout_for(engine.as_ref());
        tokio::spawn(attempt(
            engine,
            Arc::clone(&self.breakers),
            Arc::clone(&request.query),
            Arc::clone(&request.context),
            timeout,
            request.in_flight.clone(),
        ))
    }

    /// Admit a candidate, recording skips. Returns the engine when admitted.
    fn admit(&self, id: &str, attempts: &mut FallbackContext) -> Option<Arc<dyn Engine>> {
        if attempts.has_tried(id) {
            return None;
        }
        let engine = self.engines.get(id)?;
        if self.breakers.is_open(id) {
            tracing::debug!(engine = %id, "Skipping engine with open circuit");
            attempts.fail(id, RouteFailure::CircuitOpen.category_label());
            return None;
        }
        if let Some(previous) = attempts.failures().last() {
            self.breakers.record_failover(&previous.engine, id);
        }
        attempts.attempt(id);
        Some(engine)
    }

    async fn sequential(
        &self,
        request: &Request,
        candidates: &[String],
        mut attempts: FallbackContext,
    ) -> Execution {
        let mut last_error = None;

        for id in candidates {
            let Some(engine) = self.admit(id, &mut attempts) else {
                continue;
            };
            let timeout = self.timeout_for(engine.as_ref());
            let outcome = attempt(
                engine,
                Arc::clone(&self.breakers),
                Arc::clone(&request.query),
                Arc::clone(&request.context),
                timeout,
                request.in_flight.clone(),
            )
            .await;

            match outcome {
                Attempt::Answer(reply) => return Execution::answered(id.clone(), reply, attempts),
                Attempt::Declined(reason) => {
                    attempts.fail(id, DECLINED);
                    last_error = Some(reason);
                }
                Attempt::Empty => {
                    attempts.fail(id, ErrorCategory::Unknown.as_str());
                }
                Attempt::Panicked(message) => {
                    attempts.fail(id, ErrorCategory::Unknown.as_str());
                    last_error = Some(message);
                }
                Attempt::Failed(category, message) => {
                    attempts.fail(id, category.as_str());
                    if !category.is_retryable() {
                        tracing::debug!(engine = %id, category = %category, "Non-retryable failure, stopping");
                        attempts.terminal = Some(category);
                        return Execution::failed(
                            RouteFailure::EngineFailure(category),
                            Some(id.clone()),
                            Some(message),
                            attempts,
                        );
                    }
                    last_error = Some(message);
                }
            }
        }

        Execution::failed(RouteFailure::AllEnginesFailed, None, last_error, attempts)
    }

    /// Race the first admitted candidates; `None` means all of them failed
    /// retryably and the remaining candidates should be tried in turn
    async fn race(
        &self,
        request: &Request,
        candidates: &[String],
        width: usize,
        attempts: &mut FallbackContext,
    ) -> Option<Execution> {
        let mut racing = FuturesUnordered::new();
        for id in candidates {
            if racing.len() >= width {
                break;
            }
            if let Some(engine) = self.admit(id, attempts) {
                let task = self.spawn_attempt(engine, request);
                let id = id.clone();
                racing.push(async move { (id, task.await) });
            }
        }
        let launched = racing.len();
        let mut terminal: Option<(String, ErrorCategory, String)> = None;

        while let Some((id, joined)) = racing.next().await {
            match joined {
                Ok(Attempt::Answer(reply)) => {
                    let abandoned = racing.len();
                    if abandoned > 0 {
                        tracing::debug!(winner = %id, abandoned, "Race won");
                    }
                    return Some(Execution::answered(id, reply, std::mem::take(attempts)));
                }
                Ok(Attempt::Declined(_)) => attempts.fail(&id, DECLINED),
                Ok(Attempt::Empty | Attempt::Panicked(_)) => {
                    attempts.fail(&id, ErrorCategory::Unknown.as_str());
                }
                Err(err) => {
                    // Task cancelled before the attempt could report
                    tracing::warn!(engine = %id, error = %err, "Raced attempt did not complete");
                    self.breakers.record_failure(&id, ErrorCategory::Unknown);
                    attempts.fail(&id, ErrorCategory::Unknown.as_str());
                }
                Ok(Attempt::Failed(category, message)) => {
                    attempts.fail(&id, category.as_str());
                    if !category.is_retryable() && terminal.is_none() {
                        terminal = Some((id, category, message));
                    }
                }
            }
        }

        if let Some((engine, category, message)) = terminal {
            attempts.terminal = Some(category);
            return Some(Execution::failed(
                RouteFailure::EngineFailure(category),
                Some(engine),
                Some(message),
                std::mem::take(attempts),
            ));
        }
        if launched > 0 {
            tracing::debug!(launched, "All raced engines failed, continuing sequentially");
        }
        None
    }
}

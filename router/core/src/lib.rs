//! Router Core - Multi-Tier Cached Query Routing
//!
//! Routes natural-language queries to interchangeable answer engines
//! against a fixed target response time. Repeated and look-alike queries
//! are served from cache; slow or failing engines are isolated by
//! per-engine circuit breakers; every request is measured and the router
//! tunes itself when it drifts off target.
//!
//! # Architecture
//!
//! ```text
//!                      QueryRequest
//!                           |
//!                           v
//! +----------------------------------------------------------+
//! |                      QueryRouter                          |
//! |                                                          |
//! |  TierStore --------- exact / predictive / pattern /      |
//! |     ^                similarity                          |
//! |     | miss                                               |
//! |  ComplexityAnalyzer -> candidates -> Executor            |
//! |                                        |                 |
//! |                         BreakerRegistry + FallbackChain  |
//! |                                        |                 |
//! |                     +------------------+--------------+  |
//! |                     v                  v              v  |
//! |               local-fast      local-semantic     remote  |
//! |                                                          |
//! |  MetricsCollector -> AutoOptimizer    BackgroundTasks     |
//! +----------------------------------------------------------+
//!                           |
//!                           v
//!                     QueryResponse
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use router_core::{engine::PatternEngine, QueryRequest, QueryRouter};
//!
//! let router = QueryRouter::builder()
//!     .engine(Arc::new(PatternEngine::new()))
//!     .build()?;
//!
//! let response = router.route(QueryRequest::new("cpu usage")).await;
//! assert!(response.success);
//!
//! // Served from the exact tier
//! let again = router.route(QueryRequest::new("cpu usage")).await;
//! assert!(again.metadata.cached);
//! ```
//!
//! # Module Overview
//!
//! - [`types`]: request, response and cache tier types
//! - [`normalizer`]: query normalization and pattern templates
//! - [`cache`]: the four cache tiers
//! - [`patterns`]: query pattern learning and related-query prediction
//! - [`breaker`]: circuit breakers, error categories and fallback chains
//! - [`complexity`]: query complexity scoring and engine recommendation
//! - [`engine`]: the engine trait and its adapters
//! - [`router`]: the orchestrator and execution policies
//! - [`metrics`]: collection, bottlenecks, dashboard and auto-optimization
//! - [`scheduler`]: periodic cleanup and analysis
//! - [`config`]: layered configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod breaker;
pub mod cache;
pub mod complexity;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod normalizer;
pub mod patterns;
pub mod router;
pub mod scheduler;
pub mod types;

// Re-exports for convenience
pub use breaker::{BreakerConfig, BreakerRegistry, CircuitState, ErrorCategory, FallbackChain};
pub use cache::{CacheConfig, TierStore};
pub use complexity::{Complexity, ComplexityAnalysis, ComplexityAnalyzer, EngineFamily};
pub use config::{load_config, load_config_from_path, ConfigError, ConfigOverrides, RouterSettings};
pub use engine::{Engine, EngineError, EngineRegistry, EngineReply};
pub use metrics::{DashboardSnapshot, MetricsCollector, MetricsConfig};
pub use router::{ExecutionPolicy, QueryRouter, RequestStage, RouteFailure, RouterError};
pub use scheduler::{BackgroundTasks, SchedulerConfig};
pub use types::{
    CacheTier, QueryMode, QueryOptions, QueryRequest, QueryResponse, ResponseMetadata, StepStatus,
    ThinkingStep,
};

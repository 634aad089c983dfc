//! Engine Adapters
//!
//! An engine is a black box that turns query text plus opaque context into
//! answer text with a confidence. The router only sees the [`Engine`] trait,
//! so local rule engines, the knowledge-base engine, the remote HTTP engine
//! and scripted test engines are interchangeable.
//!
//! Every call goes through [`invoke_with_timeout`], which bounds the adapter
//! by its own timeout. Dropping the returned future cancels the call, so
//! raced candidates can be abandoned safely.

pub mod keyword;
pub mod pattern;
pub mod remote;
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::breaker::ErrorCategory;
use crate::complexity::EngineFamily;

pub use keyword::{KeywordEngine, KnowledgeDoc};
pub use pattern::{PatternEngine, StatusSnapshot};
pub use remote::{RemoteConfig, RemoteEngine};
pub use scripted::{ScriptedEngine, ScriptedOutcome};

// ============================================================================
// Reply and Errors
// ============================================================================

/// What an engine produced for one query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineReply {
    /// Whether the engine produced an answer
    pub success: bool,
    /// Answer, or the reason for declining
    pub text: String,
    /// 0.0..=1.0
    pub confidence: f64,
}

impl EngineReply {
    /// An answer
    pub fn answer(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            success: true,
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// The engine ran but has nothing to say about this query
    pub fn declined(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            text: reason.into(),
            confidence: 0.0,
        }
    }
}

/// Errors raised by engine adapters
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine did not answer within its timeout
    #[error("engine {engine} timed out after {ms}ms")]
    Timeout {
        /// Engine id
        engine: String,
        /// Timeout that elapsed
        ms: u64,
    },

    /// The engine failed; the message is classified into a category
    #[error("engine {engine} failed: {message}")]
    Failed {
        /// Engine id
        engine: String,
        /// Error text reported by the adapter
        message: String,
    },
}

impl EngineError {
    /// Failure with a message to classify
    pub fn failed(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            engine: engine.into(),
            message: message.into(),
        }
    }

    /// Failure category used for breaker events and retry decisions
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Failed { message, .. } => ErrorCategory::classify(message),
        }
    }
}

// ============================================================================
// Engine Trait
// ============================================================================

/// An answer-producing backend
#[async_trait]
pub trait Engine: Send + Sync {
    /// Stable identifier used by breakers, fallback chains and metrics
    fn id(&self) -> &str;

    /// Kind of engine
    fn family(&self) -> EngineFamily;

    /// Answer a query
    async fn invoke(
        &self,
        query: &str,
        context: &serde_json::Value,
    ) -> Result<EngineReply, EngineError>;

    /// Whether the engine is reachable
    async fn health_check(&self) -> bool {
        true
    }
}

/// Invoke an engine bounded by `timeout`
pub async fn invoke_with_timeout(
    engine: &dyn Engine,
    query: &str,
    context: &serde_json::Value,
    timeout: Duration,
) -> Result<EngineReply, EngineError> {
    match tokio::time::timeout(timeout, engine.invoke(query, context)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            engine: engine.id().to_string(),
            ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Engines by id, in registration order
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: Vec<Arc<dyn Engine>>,
}

impl EngineRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine, replacing any engine with the same id
    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        self.engines.retain(|e| e.id() != engine.id());
        self.engines.push(engine);
    }

    /// Builder-style [`Self::register`]
    #[must_use]
    pub fn with(mut self, engine: Arc<dyn Engine>) -> Self {
        self.register(engine);
        self
    }

    /// Engine registered under `id`
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Engine>> {
        self.engines.iter().find(|e| e.id() == id).cloned()
    }

    /// First registered engine of a family
    #[must_use]
    pub fn by_family(&self, family: EngineFamily) -> Option<Arc<dyn Engine>> {
        self.engines.iter().find(|e| e.family() == family).cloned()
    }

    /// Registered ids in registration order
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.id().to_string()).collect()
    }

    /// Whether an engine is registered under `id`
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.engines.iter().any(|e| e.id() == id)
    }

    /// Number of registered engines
    #[must_use]
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Whether no engine is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Health of every engine, in registration order
    pub async fn health(&self) -> Vec<(String, bool)> {
        let checks = self.engines.iter().map(|e| async move {
            (e.id().to_string(), e.health_check().await)
        });
        futures::future::join_all(checks).await
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_becomes_error() {
        let slow = ScriptedEngine::new("slow", EngineFamily::Remote)
            .with_latency(Duration::from_millis(200));
        let result = invoke_with_timeout(
            &slow,
            "q",
            &serde_json::Value::Null,
            Duration::from_millis(20),
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { ms: 20, .. }));
        assert_eq!(err.category(), ErrorCategory::Timeout);
    }

    #[test]
    fn test_failed_error_is_classified() {
        let err = EngineError::failed("remote", "HTTP 503 service unavailable");
        assert_eq!(err.category(), ErrorCategory::Server);
        assert!(err.to_string().contains("remote"));
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = EngineRegistry::new()
            .with(Arc::new(ScriptedEngine::new("a", EngineFamily::LocalFast)))
            .with(Arc::new(ScriptedEngine::new("b", EngineFamily::Remote)))
            .with(Arc::new(ScriptedEngine::new("a", EngineFamily::LocalSemantic)));

        assert_eq!(registry.ids(), vec!["b", "a"]);
        assert_eq!(
            registry.get("a").map(|e| e.family()),
            Some(EngineFamily::LocalSemantic)
        );
        assert_eq!(
            registry.by_family(EngineFamily::Remote).map(|e| e.id().to_string()),
            Some("b".to_string())
        );
        assert!(registry.health().await.iter().all(|(_, ok)| *ok));
    }
}

//! Programmable engine for tests and simulation
//!
//! ```ignore
//! let engine = ScriptedEngine::new("remote", EngineFamily::Remote)
//!     .with_latency(Duration::from_millis(40))
//!     .with_script([ScriptedOutcome::Error("HTTP 503".into())]);
//!
//! // first call fails, later calls answer
//! assert_eq!(engine.invocations(), 0);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Engine, EngineError, EngineReply};
use crate::complexity::EngineFamily;

/// One scripted result
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptedOutcome {
    /// Answer with this text and confidence
    Answer(String, f64),
    /// Decline to answer
    Decline(String),
    /// Fail with this message
    Error(String),
    /// Panic inside the adapter with this message
    Panic(String),
}

/// Engine whose behaviour is set up by the caller
///
/// Scripted outcomes are consumed in order; once the script is empty the
/// default outcome is used. Every invocation is counted and its query kept.
#[derive(Debug)]
pub struct ScriptedEngine {
    id: String,
    family: EngineFamily,
    latency: Duration,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    default: Mutex<Option<ScriptedOutcome>>,
    invocations: AtomicUsize,
    queries: Mutex<Vec<String>>,
    healthy: AtomicBool,
}

impl ScriptedEngine {
    /// Healthy engine with no script and no latency
    pub fn new(id: impl Into<String>, family: EngineFamily) -> Self {
        Self {
            id: id.into(),
            family,
            latency: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(None),
            invocations: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Simulated processing time of every call
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Outcomes returned by the first calls, in order
    #[must_use]
    pub fn with_script(self, outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        self.script.lock().extend(outcomes);
        self
    }

    /// Outcome once the script is exhausted
    #[must_use]
    pub fn with_default(self, outcome: ScriptedOutcome) -> Self {
        *self.default.lock() = Some(outcome);
        self
    }

    /// Make every future call fail with `message`
    pub fn fail_with(&self, message: impl Into<String>) {
        self.script.lock().clear();
        *self.default.lock() = Some(ScriptedOutcome::Error(message.into()));
    }

    /// Make every future call answer
    pub fn recover(&self) {
        self.script.lock().clear();
        *self.default.lock() = None;
    }

    /// Flip the reported health
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Number of calls that reached this engine
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Queries received, in arrival order
    #[must_use]
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    fn next_outcome(&self, query: &str) -> ScriptedOutcome {
        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        self.default
            .lock()
            .clone()
            .unwrap_or_else(|| ScriptedOutcome::Answer(format!("{} answer: {query}", self.id), 0.8))
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> EngineFamily {
        self.family
    }

    async fn invoke(
        &self,
        query: &str,
        _context: &serde_json::Value,
    ) -> Result<EngineReply, EngineError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().push(query.to_string());
        let outcome = self.next_outcome(query);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match outcome {
            ScriptedOutcome::Answer(text, confidence) => Ok(EngineReply::answer(text, confidence)),
            ScriptedOutcome::Decline(reason) => Ok(EngineReply::declined(reason)),
            ScriptedOutcome::Error(message) => Err(EngineError::failed(&self.id, message)),
            ScriptedOutcome::Panic(message) => panic!("{message}"),
        }
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_default() {
        let engine = ScriptedEngine::new("remote", EngineFamily::Remote).with_script([
            ScriptedOutcome::Error("HTTP 503".into()),
            ScriptedOutcome::Decline("no idea".into()),
        ]);
        let ctx = serde_json::Value::Null;

        assert!(engine.invoke("a", &ctx).await.is_err());
        assert!(!engine.invoke("b", &ctx).await.unwrap().success);
        let reply = engine.invoke("c", &ctx).await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.text, "remote answer: c");
        assert_eq!(engine.invocations(), 3);
        assert_eq!(engine.queries(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_fail_and_recover() {
        let engine = ScriptedEngine::new("x", EngineFamily::LocalFast);
        let ctx = serde_json::Value::Null;
        engine.fail_with("connection reset by peer");
        assert!(engine.invoke("q", &ctx).await.is_err());
        engine.recover();
        assert!(engine.invoke("q", &ctx).await.is_ok());
    }
}

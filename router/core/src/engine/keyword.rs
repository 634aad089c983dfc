//! Knowledge-base engine ranking documents by keyword overlap

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Engine, EngineError, EngineReply};
use crate::complexity::EngineFamily;

/// One answer with the keywords that select it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDoc {
    /// Lower-cased keywords
    pub keywords: Vec<String>,
    /// Answer text
    pub answer: String,
}

impl KnowledgeDoc {
    /// Doc answering `answer` for any of `keywords`
    pub fn new(keywords: &[&str], answer: impl Into<String>) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            answer: answer.into(),
        }
    }

    /// Share of this document's keywords present in `words`
    #[allow(clippy::cast_precision_loss)]
    fn overlap(&self, words: &HashSet<String>) -> f64 {
        if self.keywords.is_empty() {
            return 0.0;
        }
        let hits = self.keywords.iter().filter(|k| words.contains(*k)).count();
        hits as f64 / self.keywords.len() as f64
    }
}

fn default_docs() -> Vec<KnowledgeDoc> {
    vec![
        KnowledgeDoc::new(
            &["system", "health"],
            "System health is good: all core services respond within their targets.",
        ),
        KnowledgeDoc::new(
            &["server", "status"],
            "All monitored servers report healthy status with no active incidents.",
        ),
        KnowledgeDoc::new(
            &["error", "logs"],
            "No critical errors in the last hour; 3 warnings were logged by the API gateway.",
        ),
        KnowledgeDoc::new(
            &["performance", "metrics"],
            "Median response time is 84 ms with a 97% cache hit rate over the last hour.",
        ),
        KnowledgeDoc::new(
            &["high", "cpu", "troubleshoot"],
            "For high CPU, list the top processes, check for runaway jobs, then scale out.",
        ),
        KnowledgeDoc::new(
            &["memory", "leak"],
            "Suspected memory leaks: compare heap snapshots and restart the affected worker.",
        ),
        KnowledgeDoc::new(
            &["disk", "cleanup", "space"],
            "Free disk space by rotating logs and pruning old build artifacts.",
        ),
        KnowledgeDoc::new(
            &["restart", "service"],
            "Restart a service with a rolling restart so capacity never drops below half.",
        ),
    ]
}

/// Local engine answering from an in-memory knowledge base
#[derive(Debug, Clone)]
pub struct KeywordEngine {
    id: String,
    docs: Vec<KnowledgeDoc>,
}

impl KeywordEngine {
    /// Engine with the built-in operations knowledge base
    #[must_use]
    pub fn new() -> Self {
        Self::with_docs(default_docs())
    }

    /// Engine over a custom knowledge base
    #[must_use]
    pub fn with_docs(docs: Vec<KnowledgeDoc>) -> Self {
        Self {
            id: EngineFamily::LocalSemantic.as_str().to_string(),
            docs,
        }
    }

    /// Best document and its overlap ratio
    #[must_use]
    pub fn best(&self, query: &str) -> Option<(&KnowledgeDoc, f64)> {
        let words: HashSet<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();

        self.docs
            .iter()
            .map(|d| (d, d.overlap(&words)))
            .filter(|(_, ratio)| *ratio > 0.0)
            .fold(None, |best: Option<(&KnowledgeDoc, f64)>, (doc, ratio)| {
                match best {
                    Some((_, r)) if r >= ratio => best,
                    _ => Some((doc, ratio)),
                }
            })
    }
}

impl Default for KeywordEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for KeywordEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> EngineFamily {
        EngineFamily::LocalSemantic
    }

    async fn invoke(
        &self,
        query: &str,
        _context: &serde_json::Value,
    ) -> Result<EngineReply, EngineError> {
        Ok(match self.best(query) {
            Some((doc, ratio)) => EngineReply::answer(doc.answer.clone(), ratio * 0.9),
            None => EngineReply::declined("no knowledge base entry matches this query"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_overlap() {
        let engine = KeywordEngine::new();
        let reply = engine
            .invoke("Show me the error logs", &serde_json::Value::Null)
            .await
            .unwrap();
        assert!(reply.success);
        assert!(reply.text.contains("critical errors"));
        assert!((reply.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_partial_overlap_confidence() {
        let engine = KeywordEngine::with_docs(vec![KnowledgeDoc::new(
            &["disk", "cleanup", "space"],
            "prune",
        )]);
        let (_, ratio) = engine.best("how much disk is left").unwrap();
        assert!((ratio - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_overlap_declines() {
        let engine = KeywordEngine::new();
        let reply = engine
            .invoke("tell me a joke", &serde_json::Value::Null)
            .await
            .unwrap();
        assert!(!reply.success);
    }
}

//! Rule-based local engine for infrastructure status questions

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Engine, EngineError, EngineReply};
use crate::complexity::EngineFamily;

/// Metrics the rules render answers from
///
/// Read from `context["status"]` when present, otherwise the baseline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSnapshot {
    /// CPU utilization
    pub cpu_percent: f64,
    /// Memory utilization
    pub memory_percent: f64,
    /// Disk utilization
    pub disk_percent: f64,
    /// Network throughput
    pub network_mbps: f64,
    /// Servers reporting healthy
    pub servers_online: u32,
    /// Servers in the fleet
    pub servers_total: u32,
    /// Fleet uptime
    pub uptime_hours: u64,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            cpu_percent: 45.0,
            memory_percent: 62.0,
            disk_percent: 71.0,
            network_mbps: 120.0,
            servers_online: 12,
            servers_total: 12,
            uptime_hours: 336,
        }
    }
}

impl StatusSnapshot {
    fn from_context(context: &serde_json::Value) -> Self {
        context
            .get("status")
            .and_then(|s| serde_json::from_value(s.clone()).ok())
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Topic {
    Cpu,
    Memory,
    Disk,
    Network,
    Fleet,
}

static RULES: Lazy<Vec<(Regex, Topic)>> = Lazy::new(|| {
    [
        (r"\b(cpu|processor|load)\b", Topic::Cpu),
        (r"\b(memory|ram|swap)\b", Topic::Memory),
        (r"\b(disk|storage|capacity)\b", Topic::Disk),
        (r"\b(network|bandwidth|traffic|throughput)\b", Topic::Network),
        (r"\b(status|health|state|uptime)\b", Topic::Fleet),
    ]
    .into_iter()
    .map(|(pattern, topic)| (Regex::new(pattern).expect("rule pattern is valid"), topic))
    .collect()
});

static SUBJECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(server|host|node|vm|instance)\s+([a-z0-9._-]*\d[a-z0-9._-]*)")
        .expect("subject pattern is valid")
});

/// Local engine answering from a status snapshot
#[derive(Debug, Clone)]
pub struct PatternEngine {
    id: String,
}

impl PatternEngine {
    /// Engine registered as `local-fast`
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(EngineFamily::LocalFast.as_str())
    }

    /// Engine registered under a custom id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Render an answer, `None` when no rule matches
    #[must_use]
    pub fn answer(query: &str, status: &StatusSnapshot) -> Option<String> {
        let lower = query.to_lowercase();
        let topic = RULES
            .iter()
            .find(|(re, _)| re.is_match(&lower))
            .map(|(_, topic)| *topic)?;

        let subject = SUBJECT_RE.captures(&lower).map_or_else(
            || "System".to_string(),
            |caps| format!("{} {}", capitalize(&caps[1]), &caps[2]),
        );

        let text = match topic {
            Topic::Cpu => format!("{subject} CPU usage: {:.0}%", status.cpu_percent),
            Topic::Memory => format!("{subject} memory usage: {:.0}%", status.memory_percent),
            Topic::Disk => format!("{subject} disk usage: {:.0}%", status.disk_percent),
            Topic::Network => format!(
                "{subject} network throughput: {:.0} Mbps",
                status.network_mbps
            ),
            Topic::Fleet => format!(
                "{subject} status: {}/{} servers online, uptime {}h",
                status.servers_online, status.servers_total, status.uptime_hours
            ),
        };
        Some(text)
    }
}

impl Default for PatternEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

#[async_trait]
impl Engine for PatternEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> EngineFamily {
        EngineFamily::LocalFast
    }

    async fn invoke(
        &self,
        query: &str,
        context: &serde_json::Value,
    ) -> Result<EngineReply, EngineError> {
        let status = StatusSnapshot::from_context(context);
        Ok(match Self::answer(query, &status) {
            Some(text) => EngineReply::answer(text, 0.9),
            None => EngineReply::declined("no status rule matches this query"),
        })
    }
}

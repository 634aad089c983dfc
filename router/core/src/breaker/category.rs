//! Error categorization by message text

use serde::{Deserialize, Serialize};

/// Category of an engine failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Engine did not answer in time
    Timeout,
    /// Throttled by the engine
    RateLimit,
    /// Usage quota exhausted
    Quota,
    /// Credentials rejected
    Auth,
    /// Request rejected as malformed
    Validation,
    /// Connection-level failure
    Network,
    /// Engine-side error
    Server,
    /// Anything unrecognized
    Unknown,
}

/// Substring rules, checked in order; the first matching category wins
const RULES: &[(ErrorCategory, &[&str])] = &[
    (ErrorCategory::Timeout, &["timeout", "timed out", "deadline"]),
    (
        ErrorCategory::RateLimit,
        &["rate limit", "429", "too many requests"],
    ),
    (ErrorCategory::Quota, &["quota", "exceeded your current"]),
    (
        ErrorCategory::Auth,
        &[
            "unauthorized",
            "forbidden",
            "401",
            "403",
            "api key",
            "authentication",
        ],
    ),
    (
        ErrorCategory::Validation,
        &["invalid", "validation", "malformed", "400"],
    ),
    (
        ErrorCategory::Network,
        &[
            "network",
            "connection",
            "econnrefused",
            "dns",
            "unreachable",
            "reset by peer",
        ],
    ),
    (
        ErrorCategory::Server,
        &[
            "500",
            "502",
            "503",
            "504",
            "internal server",
            "service unavailable",
            "bad gateway",
        ],
    ),
];

impl ErrorCategory {
    /// Classify an error message (case-insensitive)
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        RULES
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
            .map_or(Self::Unknown, |(category, _)| *category)
    }

    /// Whether another engine may be tried after this failure
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network | Self::RateLimit | Self::Server
        )
    }

    /// Snake-case label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Quota => "quota",
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Server => "server",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

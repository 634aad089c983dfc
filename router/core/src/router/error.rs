//! Failure taxonomy
//!
//! [`RouteFailure`] describes why a single request did not get an engine
//! answer; it never escapes [`super::QueryRouter::route`] and only shapes the
//! failure response. [`RouterError`] covers bootstrap and admin operations.

use crate::breaker::ErrorCategory;

/// Why a request ended without a successful engine answer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteFailure {
    /// Blank query text
    Validation,
    /// The global deadline passed
    Timeout,
    /// An engine failed with a non-retryable category
    EngineFailure(ErrorCategory),
    /// The only candidate was skipped by its breaker
    CircuitOpen,
    /// Every candidate was tried or skipped
    AllEnginesFailed,
}

impl RouteFailure {
    /// Value placed in `metadata.error_category`
    #[must_use]
    pub fn category_label(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::EngineFailure(category) => category.as_str(),
            Self::CircuitOpen => "circuit_open",
            Self::AllEnginesFailed => "all_engines_failed",
        }
    }

    /// Engine name reported for failures not attributable to one engine
    #[must_use]
    pub fn engine_label(&self) -> Option<&'static str> {
        match self {
            Self::Validation => Some("none"),
            Self::Timeout | Self::AllEnginesFailed | Self::CircuitOpen => Some("fallback"),
            Self::EngineFailure(_) => None,
        }
    }
}

impl std::fmt::Display for RouteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "Query text is empty"),
            Self::Timeout => write!(f, "No engine answered before the deadline"),
            Self::EngineFailure(category) => write!(f, "Engine failed ({category})"),
            Self::CircuitOpen => write!(f, "Engine circuit is open"),
            Self::AllEnginesFailed => write!(f, "All engines failed"),
        }
    }
}

/// Router bootstrap and administration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// No engine is registered
    NoEngines,
    /// A configured engine id is not registered
    UnknownEngine(String),
    /// Background tasks are already running for this router
    AlreadyRunning,
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoEngines => write!(f, "No engines registered"),
            Self::UnknownEngine(id) => write!(f, "Unknown engine: {id}"),
            Self::AlreadyRunning => write!(f, "Background tasks already running"),
        }
    }
}

impl std::error::Error for RouterError {}

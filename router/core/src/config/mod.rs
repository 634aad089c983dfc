//! TOML Configuration File Support
//!
//! Router settings are loaded from `~/.config/query-router/router.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`ROUTER_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [router]
//! target_response_ms = 152
//! execution = "raced"
//! race_width = 2
//! fallback_chain = ["local-fast", "local-semantic", "remote"]
//! predictive_loading = true
//!
//! [cache]
//! exact_capacity = 1000
//! exact_ttl_secs = 300
//! similarity_threshold = 0.8
//!
//! [breaker]
//! failure_threshold = 5
//! cooldown_ms = 30000
//!
//! [analyzer.remote_keywords]
//! explain = 1.0
//! design = 2.0
//!
//! [engines]
//! remote_endpoint = "http://localhost:8787/v1/answer"
//! remote_api_key_env = "ROUTER_REMOTE_API_KEY"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::cache::{CacheConfig, TierSettings};
use crate::complexity::AnalyzerConfig;
use crate::engine::RemoteConfig;
use crate::metrics::MetricsConfig;
use crate::router::ExecutionPolicy;
use crate::scheduler::SchedulerConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the highest-priority configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[router]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterToml {
    /// Target response time in milliseconds
    pub target_response_ms: Option<u64>,
    /// "sequential" or "raced"
    pub execution: Option<String>,
    /// Concurrent candidates in raced mode
    pub race_width: Option<usize>,
    /// Ordered engine ids tried after the preferred engine
    pub fallback_chain: Option<Vec<String>>,
    /// Cap on concurrently executing requests
    pub max_concurrent_requests: Option<usize>,
    /// Preload queries related to each fresh answer
    pub predictive_loading: Option<bool>,
}

/// `[cache]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Exact tier capacity
    pub exact_capacity: Option<usize>,
    /// Exact tier TTL
    pub exact_ttl_secs: Option<u64>,
    /// Predictive tier capacity
    pub predictive_capacity: Option<usize>,
    /// Predictive tier TTL
    pub predictive_ttl_secs: Option<u64>,
    /// Pattern tier capacity
    pub pattern_capacity: Option<usize>,
    /// Pattern tier TTL
    pub pattern_ttl_secs: Option<u64>,
    /// Similarity tier capacity
    pub similarity_capacity: Option<usize>,
    /// Similarity tier TTL
    pub similarity_ttl_secs: Option<u64>,
    /// Eviction score bonus per hit
    pub bonus_window_secs: Option<u64>,
    /// Longest a cache write waits for a tier lock
    pub write_budget_ms: Option<u64>,
    /// Minimum word overlap for a similarity hit
    pub similarity_threshold: Option<f64>,
    /// Entries compared per similarity lookup
    pub similarity_scan_limit: Option<usize>,
    /// Upper bound for capacity growth
    pub max_capacity: Option<usize>,
}

/// `[breaker]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerToml {
    /// Consecutive failures that open a circuit
    pub failure_threshold: Option<u32>,
    /// Open duration before a probe
    pub cooldown_ms: Option<u64>,
    /// Breaker events kept for the dashboard
    pub history_limit: Option<usize>,
}

/// `[analyzer]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerToml {
    /// Replaces the built-in local keyword table
    pub local_keywords: Option<BTreeMap<String, f64>>,
    /// Replaces the built-in remote keyword table
    pub remote_keywords: Option<BTreeMap<String, f64>>,
    /// Factor one keyword score must beat the other by
    pub keyword_margin: Option<f64>,
}

/// `[metrics]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsToml {
    /// Recent metrics kept for the dashboard
    pub ring_capacity: Option<usize>,
    /// Share of requests kept in the ring buffer
    pub sample_rate: Option<f64>,
    /// Hit rate below which optimization runs
    pub hit_rate_floor: Option<f64>,
    /// Error rate above which optimization runs
    pub error_rate_ceiling: Option<f64>,
    /// Minimum time between optimization runs
    pub optimize_cooldown_secs: Option<u64>,
    /// Occurrences before a slow pair is reported
    pub min_bottleneck_frequency: Option<u64>,
}

/// `[scheduler]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerToml {
    /// Expired-entry sweep interval
    pub cleanup_interval_secs: Option<u64>,
    /// Pattern and bottleneck analysis interval
    pub analysis_interval_secs: Option<u64>,
}

/// `[engines]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesToml {
    /// Remote engine URL; the remote engine is disabled without one
    pub remote_endpoint: Option<String>,
    /// Name of the environment variable holding the remote API key
    pub remote_api_key_env: Option<String>,
    /// Per-call bound for the remote engine
    pub remote_timeout_ms: Option<u64>,
    /// Per-call bound for local engines
    pub local_timeout_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfigToml {
    /// `[router]`
    pub router: RouterToml,
    /// `[cache]`
    pub cache: CacheToml,
    /// `[breaker]`
    pub breaker: BreakerToml,
    /// `[analyzer]`
    pub analyzer: AnalyzerToml,
    /// `[metrics]`
    pub metrics: MetricsToml,
    /// `[scheduler]`
    pub scheduler: SchedulerToml,
    /// `[engines]`
    pub engines: EnginesToml,
}

// =============================================================================
// Resolved Settings
// =============================================================================

/// Engine adapter settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    /// Remote engine URL, `None` disables the remote engine
    pub remote_endpoint: Option<String>,
    /// Environment variable holding the remote API key
    pub remote_api_key_env: String,
    /// Per-call bound for the remote engine
    pub remote_timeout: Duration,
    /// Per-call bound for local engines
    pub local_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            remote_endpoint: None,
            remote_api_key_env: "ROUTER_REMOTE_API_KEY".to_string(),
            remote_timeout: Duration::from_millis(2000),
            local_timeout: Duration::from_millis(150),
        }
    }
}

impl EngineSettings {
    /// Remote adapter configuration, if a remote endpoint is configured
    #[must_use]
    pub fn remote_config(&self) -> Option<RemoteConfig> {
        let endpoint = self.remote_endpoint.clone()?;
        Some(RemoteConfig {
            endpoint,
            api_key: std::env::var(&self.remote_api_key_env).ok(),
            timeout: self.remote_timeout,
        })
    }
}

/// Fully resolved router configuration
#[derive(Clone, Debug)]
pub struct RouterSettings {
    /// Target response time and default deadline
    pub target: Duration,
    /// Sequential or raced candidate execution
    pub execution: ExecutionPolicy,
    /// Engines tried after the preferred one
    pub fallback_chain: Vec<String>,
    /// Cap on concurrently executing requests
    pub max_concurrent_requests: usize,
    /// Preload related queries into the predictive tier after an answer
    pub predictive_loading: bool,
    /// Cache tier sizes and TTLs
    pub cache: CacheConfig,
    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,
    /// Keyword tables for complexity analysis
    pub analyzer: AnalyzerConfig,
    /// Metrics thresholds; the target is taken from [`Self::target`]
    pub metrics: MetricsConfig,
    /// Background loop intervals
    pub scheduler: SchedulerConfig,
    /// Engine adapter settings
    pub engines: EngineSettings,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            target: Duration::from_millis(152),
            execution: ExecutionPolicy::Sequential,
            fallback_chain: vec![
                "local-fast".to_string(),
                "local-semantic".to_string(),
                "remote".to_string(),
            ],
            max_concurrent_requests: 64,
            predictive_loading: true,
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            analyzer: AnalyzerConfig::default(),
            metrics: MetricsConfig::default(),
            scheduler: SchedulerConfig::default(),
            engines: EngineSettings::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RouterSettings {
    /// Default settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Record where the settings came from
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Metrics configuration with the router target applied
    #[must_use]
    pub fn metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            target: self.target,
            ..self.metrics.clone()
        }
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.is_zero() {
            return Err(ConfigError::ValidationError(
                "target_response_ms must be greater than zero".into(),
            ));
        }
        if self.fallback_chain.is_empty() {
            return Err(ConfigError::ValidationError(
                "fallback_chain must name at least one engine".into(),
            ));
        }
        let rate = self.metrics.sample_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "sample_rate must be in (0, 1], got {rate}"
            )));
        }
        let threshold = self.cache.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "similarity_threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "failure_threshold must be greater than zero".into(),
            ));
        }
        if let ExecutionPolicy::Raced { max_concurrent: 0 } = self.execution {
            return Err(ConfigError::ValidationError(
                "race_width must be greater than zero".into(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::ValidationError(
                "max_concurrent_requests must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/query-router/router.toml` when a config
/// directory is known.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("query-router").join("router.toml"))
}

/// Load configuration from the default path and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read, parsed or
/// validated. A missing file is not an error.
pub fn load_config() -> Result<RouterSettings, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RouterSettings, ConfigError> {
    let mut config = RouterSettings::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RouterConfigToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    apply_env_config(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Parse settings from TOML text without touching the environment
///
/// # Errors
///
/// Returns an error if the text cannot be parsed or validated.
pub fn parse_settings(toml_content: &str) -> Result<RouterSettings, ConfigError> {
    let mut config = RouterSettings::default();
    let toml_config: RouterConfigToml = toml::from_str(toml_content)?;
    apply_toml_config(&mut config, &toml_config)?;
    config.source = ConfigSource::File;
    config.validate()?;
    Ok(config)
}

fn set_tier(tier: &mut TierSettings, capacity: Option<usize>, ttl_secs: Option<u64>) {
    if let Some(capacity) = capacity {
        tier.capacity = capacity;
    }
    if let Some(secs) = ttl_secs {
        tier.ttl = Duration::from_secs(secs);
    }
}

fn parse_execution(name: &str, width: usize) -> Result<ExecutionPolicy, ConfigError> {
    ExecutionPolicy::parse(name, width).map_err(ConfigError::ValidationError)
}

fn race_width(policy: ExecutionPolicy) -> usize {
    match policy {
        ExecutionPolicy::Raced { max_concurrent } => max_concurrent,
        ExecutionPolicy::Sequential => 2,
    }
}

/// Apply TOML configuration values to the settings
fn apply_toml_config(
    config: &mut RouterSettings,
    toml: &RouterConfigToml,
) -> Result<(), ConfigError> {
    // Router
    if let Some(ms) = toml.router.target_response_ms {
        config.target = Duration::from_millis(ms);
    }
    let width = toml
        .router
        .race_width
        .unwrap_or_else(|| race_width(config.execution));
    if let Some(ref name) = toml.router.execution {
        config.execution = parse_execution(name, width)?;
    } else if let ExecutionPolicy::Raced { .. } = config.execution {
        config.execution = ExecutionPolicy::Raced {
            max_concurrent: width,
        };
    }
    if let Some(ref chain) = toml.router.fallback_chain {
        config.fallback_chain.clone_from(chain);
    }
    if let Some(max) = toml.router.max_concurrent_requests {
        config.max_concurrent_requests = max;
    }
    if let Some(enabled) = toml.router.predictive_loading {
        config.predictive_loading = enabled;
    }

    // Cache
    let cache = &toml.cache;
    set_tier(&mut config.cache.exact, cache.exact_capacity, cache.exact_ttl_secs);
    set_tier(
        &mut config.cache.predictive,
        cache.predictive_capacity,
        cache.predictive_ttl_secs,
    );
    set_tier(&mut config.cache.pattern, cache.pattern_capacity, cache.pattern_ttl_secs);
    set_tier(
        &mut config.cache.similarity,
        cache.similarity_capacity,
        cache.similarity_ttl_secs,
    );
    if let Some(secs) = cache.bonus_window_secs {
        config.cache.bonus_window = Duration::from_secs(secs);
    }
    if let Some(ms) = cache.write_budget_ms {
        config.cache.write_budget = Duration::from_millis(ms);
    }
    if let Some(threshold) = cache.similarity_threshold {
        config.cache.similarity_threshold = threshold;
    }
    if let Some(limit) = cache.similarity_scan_limit {
        config.cache.similarity_scan_limit = limit;
    }
    if let Some(max) = cache.max_capacity {
        config.cache.max_capacity = max;
    }

    // Breaker
    if let Some(threshold) = toml.breaker.failure_threshold {
        config.breaker.failure_threshold = threshold;
    }
    if let Some(ms) = toml.breaker.cooldown_ms {
        config.breaker.cooldown = Duration::from_millis(ms);
    }
    if let Some(limit) = toml.breaker.history_limit {
        config.breaker.history_limit = limit;
    }

    // Analyzer
    if let Some(ref table) = toml.analyzer.local_keywords {
        config.analyzer.local_keywords = lowercase_keys(table);
    }
    if let Some(ref table) = toml.analyzer.remote_keywords {
        config.analyzer.remote_keywords = lowercase_keys(table);
    }
    if let Some(margin) = toml.analyzer.keyword_margin {
        config.analyzer.keyword_margin = margin;
    }

    // Metrics
    let metrics = &toml.metrics;
    if let Some(capacity) = metrics.ring_capacity {
        config.metrics.ring_capacity = capacity;
    }
    if let Some(rate) = metrics.sample_rate {
        config.metrics.sample_rate = rate;
    }
    if let Some(floor) = metrics.hit_rate_floor {
        config.metrics.hit_rate_floor = floor;
    }
    if let Some(ceiling) = metrics.error_rate_ceiling {
        config.metrics.error_rate_ceiling = ceiling;
    }
    if let Some(secs) = metrics.optimize_cooldown_secs {
        config.metrics.optimize_cooldown = Duration::from_secs(secs);
    }
    if let Some(min) = metrics.min_bottleneck_frequency {
        config.metrics.min_bottleneck_frequency = min;
    }

    // Scheduler
    if let Some(secs) = toml.scheduler.cleanup_interval_secs {
        config.scheduler.cleanup_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.scheduler.analysis_interval_secs {
        config.scheduler.analysis_interval = Duration::from_secs(secs);
    }

    // Engines
    if toml.engines.remote_endpoint.is_some() {
        config.engines.remote_endpoint.clone_from(&toml.engines.remote_endpoint);
    }
    if let Some(ref name) = toml.engines.remote_api_key_env {
        config.engines.remote_api_key_env.clone_from(name);
    }
    if let Some(ms) = toml.engines.remote_timeout_ms {
        config.engines.remote_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.engines.local_timeout_ms {
        config.engines.local_timeout = Duration::from_millis(ms);
    }
    Ok(())
}

fn lowercase_keys(table: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    table
        .iter()
        .map(|(k, w)| (k.to_lowercase(), *w))
        .collect()
}

/// Apply environment variable overrides
fn apply_env_config(config: &mut RouterSettings) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var("ROUTER_TARGET_MS") {
        if let Ok(ms) = value.parse::<u64>() {
            config.target = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(value) = std::env::var("ROUTER_EXECUTION") {
        config.execution = parse_execution(&value, race_width(config.execution))?;
        config.source = ConfigSource::Env;
    }
    if let Ok(value) = std::env::var("ROUTER_FALLBACK_CHAIN") {
        config.fallback_chain = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        config.source = ConfigSource::Env;
    }
    if let Ok(value) = std::env::var("ROUTER_BREAKER_THRESHOLD") {
        if let Ok(n) = value.parse::<u32>() {
            config.breaker.failure_threshold = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(value) = std::env::var("ROUTER_BREAKER_COOLDOWN_MS") {
        if let Ok(ms) = value.parse::<u64>() {
            config.breaker.cooldown = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(value) = std::env::var("ROUTER_REMOTE_ENDPOINT") {
        config.engines.remote_endpoint = Some(value);
        config.source = ConfigSource::Env;
    }
    if let Ok(value) = std::env::var("ROUTER_SAMPLE_RATE") {
        if let Ok(rate) = value.parse::<f64>() {
            config.metrics.sample_rate = rate;
            config.source = ConfigSource::Env;
        }
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Target response time in milliseconds
    pub target_ms: Option<u64>,
    /// "sequential" or "raced"
    pub execution: Option<String>,
    /// Concurrent candidates in raced mode
    pub race_width: Option<usize>,
    /// Remote engine URL
    pub remote_endpoint: Option<String>,
}

impl ConfigOverrides {
    /// Empty override set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the target response time
    #[must_use]
    pub fn with_target_ms(mut self, ms: u64) -> Self {
        self.target_ms = Some(ms);
        self
    }

    /// Override the execution policy
    #[must_use]
    pub fn with_execution(mut self, execution: impl Into<String>) -> Self {
        self.execution = Some(execution.into());
        self
    }

    /// Override the race width
    #[must_use]
    pub fn with_race_width(mut self, width: usize) -> Self {
        self.race_width = Some(width);
        self
    }

    /// Override the remote endpoint
    #[must_use]
    pub fn with_remote_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.remote_endpoint = Some(endpoint.into());
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns an error if an override names an unknown execution policy or
    /// leaves the settings invalid.
    pub fn apply(&self, config: &mut RouterSettings) -> Result<(), ConfigError> {
        if self.target_ms.is_some()
            || self.execution.is_some()
            || self.race_width.is_some()
            || self.remote_endpoint.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ms) = self.target_ms {
            config.target = Duration::from_millis(ms);
        }
        let width = self.race_width.unwrap_or_else(|| race_width(config.execution));
        if let Some(ref name) = self.execution {
            config.execution = parse_execution(name, width)?;
        } else if let (Some(width), ExecutionPolicy::Raced { .. }) =
            (self.race_width, config.execution)
        {
            config.execution = ExecutionPolicy::Raced {
                max_concurrent: width,
            };
        }
        if let Some(ref endpoint) = self.remote_endpoint {
            config.engines.remote_endpoint = Some(endpoint.clone());
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

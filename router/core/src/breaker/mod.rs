//! Circuit Breakers and Failure Handling
//!
//! - [`state`]: atomic per-engine breaker with a lazy half-open probe
//! - [`registry`]: breakers keyed by engine id, event history, admin ops
//! - [`fallback`]: candidate ordering and per-request attempt tracking
//! - [`category`]: error message classification and retry policy

pub mod category;
pub mod fallback;
pub mod registry;
pub mod state;

pub use category::ErrorCategory;
pub use fallback::{FallbackChain, FallbackContext};
pub use registry::{BreakerConfig, BreakerEvent, BreakerEventKind, BreakerRegistry, BreakerStatus};
pub use state::{Admission, BreakerSnapshot, CircuitState, EngineBreaker};

//! Core types shared by every gateway component
//!
//! Errors, the per-request context, the shared state store and the
//! container wiring the components together.

pub mod container;
pub mod context;
pub mod error;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types
pub use container::ServiceContainer;
pub use context::{RequestContext, Target};
pub use error::{GatewayError, GatewayResult};
pub use store::{MemoryStore, StateStore};

/// Wall-clock time as fractional unix seconds.
///
/// Every timing decision takes `now` as a parameter; this is the only place
/// the real clock is read.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

//! Process-wide tracing setup shared by every binary.

/// Initialize tracing with JSON output and an `info` default filter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    init_with(&ObservabilityConfig::default());
}

pub use self::tracing::{init_with, ObservabilityConfig};

/// Subscriber configuration (filters, formatting).
pub mod tracing;

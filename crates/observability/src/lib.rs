//! Process-wide tracing setup shared by the sync binaries.

/// Initialize structured logging for the process.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Subscriber construction (filter, format).
pub mod tracing;

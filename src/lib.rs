//! BracketBot Library
//!
//! Automated bracket-trading engine for crypto derivatives

pub mod candles;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod patterns;
pub mod types;

/// Initialize structured logging. Call once from the hosting binary;
/// `RUST_LOG` controls the filter.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

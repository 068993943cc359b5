//! Concentra - deterministic concentration analysis over tabular financial data
//!
//! The crate ingests spreadsheets or delimited text, normalizes them into a
//! typed columnar store, detects schema and temporal grain, and computes
//! ranked concentration distributions with auditable lineage. An optional
//! advisory layer attaches narrative commentary without ever touching the
//! numbers.

pub mod concentration;
pub mod config;
pub mod error;
pub mod export;
pub mod llm;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod ratelimit;
pub mod registry;
pub mod schema;
pub mod storage;
pub mod timegrain;

pub use config::Settings;
pub use error::{EngineError, Result};
pub use pipeline::Pipeline;

/// Initialize structured logging for the hosting process. Respects
/// `RUST_LOG`; defaults to `info`. Safe to call more than once.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

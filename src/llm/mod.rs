//! Advisory enrichment layer.
//!
//! Attaches narrative commentary to finished numeric results. Strictly
//! one-directional: advisory output lands in `llm/` artifacts and lineage
//! steps, and never feeds back into the deterministic math. Failures of any
//! kind degrade to structured placeholder artifacts.

pub mod client;
pub mod insights;
pub mod prompts;

pub use client::{LlmCallError, LlmClient, Provider};
pub use insights::{AdvisoryEngine, ADVISORY_FUNCTIONS};

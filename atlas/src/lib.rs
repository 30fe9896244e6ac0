//! ATLAS: an adaptive, OWASP-aware web reconnaissance agent.
//!
//! The core is a cyclic three-node state machine — Probe, Cortex, Router —
//! sharing one single-writer [`state::RunState`]. [`engine::run_once`] is
//! the entry point: it drives the hop loop against a single allowlisted
//! target and returns a [`trace::TraceReport`] ready for serialization.
//!
//! Tools are strictly observational. No module in this crate synthesizes
//! exploit payloads, performs authenticated brute force, or issues a
//! request outside the configured target origin.

pub mod config;
pub mod cortex;
pub mod engine;
pub mod error;
pub mod findings;
pub mod frontier;
pub mod http;
pub mod llm;
pub mod probe;
pub mod router;
pub mod state;
pub mod trace;

pub use config::AtlasConfig;
pub use engine::run_once;
pub use error::{AtlasError, Result};
pub use llm::{CortexOracle, OpenAiOracle, StubOracle};
pub use trace::TraceReport;

//! Error types for the ATLAS engine.
//!
//! Transport, budget, schema validation, LLM provider, unknown-tool, and
//! reporter I/O failures each get a distinct variant so callers (and tests)
//! can match on cause.

use thiserror::Error;

/// A type alias for `Result<T, AtlasError>`.
pub type Result<T> = std::result::Result<T, AtlasError>;

/// The error type for ATLAS engine operations.
#[derive(Debug, Error)]
pub enum AtlasError {
    /// A dispatched request could not be completed (timeout, DNS, refused).
    #[error("transport error dispatching {tool} {path}: {message}")]
    Transport {
        /// Tool that attempted the request.
        tool: String,
        /// Effective path that was targeted.
        path: String,
        /// Underlying error message.
        message: String,
    },

    /// The request budget for this run has been exhausted.
    #[error("request budget exhausted ({used}/{max})")]
    BudgetExceeded {
        /// Requests already issued.
        used: u32,
        /// Configured budget.
        max: u32,
    },

    /// Cortex's response failed schema validation.
    #[error("schema validation failed: {message}")]
    SchemaValidation {
        /// Description of the validation failure.
        message: String,
    },

    /// The LLM provider could not be reached or returned a protocol error.
    #[error("LLM provider error: {message}")]
    LlmProvider {
        /// Underlying error message.
        message: String,
    },

    /// An action named a tool outside `ALLOWED_TOOLS`.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The trace file could not be written; this is the only fatal variant.
    #[error("failed to write trace: {0}")]
    Reporter(String),

    /// Malformed or missing environment configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<serde_json::Error> for AtlasError {
    fn from(err: serde_json::Error) -> Self {
        Self::SchemaValidation {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for AtlasError {
    fn from(err: reqwest::Error) -> Self {
        Self::LlmProvider {
            message: err.to_string(),
        }
    }
}

// src/errors.rs

use thiserror::Error;

/// Result type alias for deblur operations
pub type Result<T> = std::result::Result<T, DeblurError>;

/// Error type for deblur operations
#[derive(Error, Debug)]
pub enum DeblurError {
    /// Malformed or inconsistent options (bad probabilities, mismatched
    /// reference/index counts, unparsable error distributions, ...)
    #[error("Invalid configuration '{parameter}': {reason}")]
    Config {
        /// The offending parameter name
        parameter: String,
        /// Explanation of why it's invalid
        reason: String,
    },

    /// A stage produced zero sequences where at least one is required
    #[error("Empty result at stage '{stage}': no sequences survived")]
    EmptyResult {
        /// The pipeline stage that came up empty
        stage: String,
    },

    /// Target output already exists and no overwrite was requested
    #[error("Output '{path}' already exists; pass overwrite to replace it")]
    ResourceConflict {
        /// The conflicting path
        path: String,
    },

    /// An external tool failed to run or produced unusable output
    #[error("External tool '{tool}' failed: {reason}")]
    ExternalTool {
        /// Tool name (e.g. "sortmerna", "mafft", "vsearch")
        tool: String,
        /// Non-zero exit, spawn failure, or malformed output
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeblurError {
    /// Shorthand for a `Config` error.
    pub fn config(parameter: &str, reason: impl Into<String>) -> Self {
        DeblurError::Config { parameter: parameter.to_string(), reason: reason.into() }
    }

    /// Shorthand for an `EmptyResult` error.
    pub fn empty(stage: &str) -> Self {
        DeblurError::EmptyResult { stage: stage.to_string() }
    }

    /// Shorthand for an `ExternalTool` error.
    pub fn tool(tool: &str, reason: impl Into<String>) -> Self {
        DeblurError::ExternalTool { tool: tool.to_string(), reason: reason.into() }
    }
}

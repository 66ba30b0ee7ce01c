//! Error types for fold-manifest.

use thiserror::Error;

/// All errors that can arise from building, validating or encoding a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O failure while writing the JSON encoding.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The method string is not one of GET, PUT, POST, DELETE, PATCH.
    #[error("unsupported http method '{0}'")]
    InvalidMethod(String),

    /// A route declared an empty path pattern.
    #[error("route for handler '{handler}' has an empty path")]
    EmptyPath { handler: String },

    /// A route declared an empty handler identifier.
    #[error("route at '{path}' has an empty handler")]
    EmptyHandler { path: String },

    /// The path pattern is malformed (no leading `/`, or a `:` segment without a name).
    #[error("invalid path pattern '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

//! Error types for PostForge.
//!
//! Library crates use [`PostForgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all PostForge operations.
#[derive(Debug, thiserror::Error)]
pub enum PostForgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transport-level HTTP failure.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed provider response or markup.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// An external provider answered with an error.
    #[error("{provider} error: {message}")]
    Provider { provider: String, message: String },

    /// Provider credits or quota are used up. Halts the whole batch.
    #[error("{provider} quota exhausted: {message}")]
    QuotaExhausted { provider: String, message: String },

    /// An external call exceeded its deadline.
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// A document with this slug already exists in the target collection.
    #[error("duplicate slug: {slug}")]
    DuplicateKey { slug: String },

    /// Lookup by id or name found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PostForgeError>;

impl PostForgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    pub fn quota(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::QuotaExhausted {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            secs,
        }
    }

    /// True when retrying cannot help until credits are topped up.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PostForgeError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = PostForgeError::quota("bfl", "credits exhausted");
        assert_eq!(err.to_string(), "bfl quota exhausted: credits exhausted");
        assert!(err.is_quota());

        let err = PostForgeError::timeout("search", 30);
        assert!(err.to_string().contains("30s"));
        assert!(!err.is_quota());
    }
}

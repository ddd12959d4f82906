//! Unified error type for the store
//!
//! Every fallible store operation returns [`StoreError`]. The type is
//! `Clone` so a single loader failure can be handed to every caller awaiting
//! the same shared run.

use serde::{Deserialize, Serialize};

/// Unified error type for all store operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum StoreError {
    /// A loader body failed
    #[error("Compute failed: {message}")]
    Compute {
        /// Error message produced by the loader body
        message: String,
    },

    /// An effect action failed
    #[error("Action failed: {message}")]
    Action {
        /// Error message produced by the action's run function
        message: String,
    },

    /// A block without a default was read before it ever held a value
    #[error("Block {block} accessed but it has no default value")]
    MissingDefault {
        /// Id of the offending block
        block: String,
    },

    /// A dependency cycle between loaders was found
    #[error("Dependency cycle detected: {path}")]
    CycleDetected {
        /// Loader ids forming the cycle, joined with ` -> `
        path: String,
    },

    /// Internal invariant violation
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl StoreError {
    /// Create a loader failure
    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute {
            message: message.into(),
        }
    }

    /// Create an effect action failure
    pub fn action(message: impl Into<String>) -> Self {
        Self::Action {
            message: message.into(),
        }
    }

    /// Create a missing default error
    pub fn missing_default(block: impl Into<String>) -> Self {
        Self::MissingDefault {
            block: block.into(),
        }
    }

    /// Create a cycle error from the ids along the cycle
    pub fn cycle<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let path = path
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(" -> ");
        Self::CycleDetected { path }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation can succeed.
    ///
    /// Configuration errors (missing defaults, cycles) are fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Compute { .. } | Self::Action { .. })
    }
}

/// Standard Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<Box<dyn std::error::Error + Send + Sync>> for StoreError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::compute(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = StoreError::compute("boom");
        assert!(matches!(err, StoreError::Compute { .. }));
        assert_eq!(err.to_string(), "Compute failed: boom");
    }

    #[test]
    fn test_cycle_path_formatting() {
        let err = StoreError::cycle(["a", "b", "a"]);
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_boxed_error_conversion() {
        let boxed: Box<dyn std::error::Error + Send + Sync> = "bad input".into();
        let err = StoreError::from(boxed);
        assert_eq!(err, StoreError::compute("bad input"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_error_serializes() {
        let err = StoreError::missing_default("block[1]");
        let json = serde_json::to_string(&err).unwrap();
        let back: StoreError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}

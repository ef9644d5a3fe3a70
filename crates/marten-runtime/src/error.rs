//! Runtime error types
//!
//! Cache-level conditions (misses, invalidated assumptions, reentrant
//! autoloads) are resolved internally and never appear here; only
//! resolver-level outcomes and user-visible range errors surface.

use thiserror::Error;

/// Errors surfaced by the resolution core.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No method binding was found and no hook handled it
    #[error("undefined method '{name}' for {receiver}")]
    NoMethod {
        /// Description of the receiver
        receiver: String,
        /// The requested method name
        name: String,
    },

    /// Constant resolution exhausted every scope, ancestor and autoload
    #[error("uninitialized constant {scope}::{name}")]
    NameError {
        /// The scope the lookup started from
        scope: String,
        /// The requested constant name
        name: String,
    },

    /// A feature load failed
    #[error("cannot load such file -- {path}")]
    LoadError {
        /// The requested feature path
        path: String,
    },

    /// Out-of-range identity lookup or similar user-visible range error
    #[error("RangeError: {0}")]
    Range(String),

    /// Internal invariant violation
    #[error("InternalError: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Create a no-method error.
    pub fn no_method(receiver: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NoMethod {
            receiver: receiver.into(),
            name: name.into(),
        }
    }

    /// Create an uninitialized-constant error.
    pub fn name_error(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NameError {
            scope: scope.into(),
            name: name.into(),
        }
    }

    /// Create a load error.
    pub fn load_error(path: impl Into<String>) -> Self {
        Self::LoadError { path: path.into() }
    }

    /// Create a range error.
    pub fn range(msg: impl Into<String>) -> Self {
        Self::Range(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

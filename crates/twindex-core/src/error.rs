//! Error types and result aliases for twindex.
//!
//! This module defines the shared error types used across all twindex
//! components. Errors are structured for programmatic handling and include
//! context for debugging.

use std::fmt;

/// The result type used throughout twindex.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in twindex domain operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid namespaced identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the id invalid.
        message: String,
    },

    /// An invalid JSON pointer was provided.
    #[error("invalid pointer: {message}")]
    InvalidPointer {
        /// Description of what made the pointer invalid.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The requested entity was not found.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The type of entity that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new invalid-id error with the given message.
    #[must_use]
    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::InvalidId {
            message: message.into(),
        }
    }

    /// Creates a new serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            message: value.to_string(),
        }
    }
}

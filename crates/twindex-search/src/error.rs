//! Error types for the search-index update pipeline.

use twindex_core::id::TwinId;

/// The result type used throughout twindex-search.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in update-pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A search-index store operation failed and may succeed when retried.
    #[error("transient store error: {message}")]
    TransientStore {
        /// Description of the failure.
        message: String,
    },

    /// A search-index store operation was rejected permanently.
    #[error("permanent store error: {message}")]
    PermanentStore {
        /// Description of the rejection.
        message: String,
    },

    /// An outbound ask timed out after all retries.
    #[error("ask '{operation}' timed out after {attempts} attempts")]
    AskTimeout {
        /// Name of the asked operation.
        operation: &'static str,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A cache loader failed.
    #[error("cache load failed: {message}")]
    CacheLoad {
        /// Description of the failure.
        message: String,
    },

    /// The updater task for a twin is no longer running.
    #[error("updater for twin {twin_id} has stopped")]
    UpdaterStopped {
        /// The twin whose updater is gone.
        twin_id: TwinId,
    },

    /// A configuration value was invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the invalid value.
        message: String,
    },

    /// An error from twindex-core.
    #[error("core error: {0}")]
    Core(#[from] twindex_core::error::Error),
}

impl Error {
    /// Creates a new transient store error.
    #[must_use]
    pub fn transient_store(message: impl Into<String>) -> Self {
        Self::TransientStore {
            message: message.into(),
        }
    }

    /// Creates a new permanent store error.
    #[must_use]
    pub fn permanent_store(message: impl Into<String>) -> Self {
        Self::PermanentStore {
            message: message.into(),
        }
    }

    /// Creates a new cache-load error.
    #[must_use]
    pub fn cache_load(message: impl Into<String>) -> Self {
        Self::CacheLoad {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true when retrying the failed operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientStore { .. } | Self::AskTimeout { .. } | Self::CacheLoad { .. }
        )
    }
}

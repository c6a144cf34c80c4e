//! Error types for chainsim.
//!
//! All fallible operations return `Result<T, ChainError>`. Classifier and
//! physics failures are surfaced as errors and propagated; nothing in the
//! pipeline recovers from them silently.

use thiserror::Error;

/// Result type alias for chainsim operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Unified error type for all chainsim operations.
#[derive(Debug, Error)]
pub enum ChainError {
    // ===== Scenario Errors =====
    /// Event kind name not present in the registry.
    #[error("Unknown event kind '{kind}' for event '{event}'")]
    UnknownEventKind {
        /// Event name.
        event: String,
        /// Offending kind tag.
        kind: String,
    },

    /// Event arguments do not match the kind's schema.
    #[error("Invalid arguments for event '{event}': {message}")]
    InvalidEventArgs {
        /// Event name.
        event: String,
        /// Deserialization message.
        message: String,
    },

    /// Causal graph is not a single-rooted DAG.
    #[error("Invalid causal graph: {0}")]
    InvalidGraph(String),

    /// An event argument names a body absent from the world.
    #[error("Event '{event}' references unknown body '{body}'")]
    UnknownBody {
        /// Event name.
        event: String,
        /// Body name.
        body: String,
    },

    /// Scenario description is malformed.
    #[error("Scenario error: {0}")]
    Scenario(String),

    /// Sample does not match the design space.
    #[error("Sample has {found} dimensions, design space has {expected}")]
    DimensionMismatch {
        /// Design space dimension.
        expected: usize,
        /// Sample dimension.
        found: usize,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration parameter.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    // ===== I/O Errors =====
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cached entry failed its integrity check.
    #[error("Label cache integrity violation: hash mismatch")]
    CacheIntegrity,

    /// Snapshot was written by a different build.
    #[error("Label cache written by build {found}, expected {expected}")]
    CacheBuildMismatch {
        /// Build id of the running binary.
        expected: String,
        /// Build id stored in the snapshot.
        found: String,
    },

    // ===== Domain Errors =====
    /// Physics backend error.
    #[error("Physics error: {0}")]
    Physics(String),

    /// Classifier training or evaluation error.
    #[error("Learning error: {0}")]
    Learning(String),

    /// Optimization error.
    #[error("Optimization error: {0}")]
    Optimization(String),
}

impl ChainError {
    /// Create a configuration error with a message.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a graph structure error.
    #[must_use]
    pub fn graph(message: impl Into<String>) -> Self {
        Self::InvalidGraph(message.into())
    }

    /// Create a scenario error.
    #[must_use]
    pub fn scenario(message: impl Into<String>) -> Self {
        Self::Scenario(message.into())
    }

    /// Create a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a physics backend error.
    #[must_use]
    pub fn physics(message: impl Into<String>) -> Self {
        Self::Physics(message.into())
    }

    /// Create a learning error.
    #[must_use]
    pub fn learning(message: impl Into<String>) -> Self {
        Self::Learning(message.into())
    }

    /// Create an optimization error.
    #[must_use]
    pub fn optimization(message: impl Into<String>) -> Self {
        Self::Optimization(message.into())
    }

    /// Check if this error comes from loading a scenario (fixable by
    /// editing the description rather than the code).
    #[must_use]
    pub const fn is_scenario_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownEventKind { .. }
                | Self::InvalidEventArgs { .. }
                | Self::InvalidGraph(_)
                | Self::UnknownBody { .. }
                | Self::Scenario(_)
        )
    }
}

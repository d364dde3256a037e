//! Error types for graph store operations

use thiserror::Error;

use crate::model::NodeId;

/// Result type alias for store operations.
pub type DagResult<T> = Result<T, DagError>;

/// Malformed input. Raised synchronously and never recovered by the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// An edge needs at least two arguments.
    #[error("edge requires at least 2 arguments, got {0}")]
    TooFewArguments(usize),

    /// An argument slot of an edge could not be resolved to a node or literal.
    #[error("edge argument {index} could not be resolved: {token:?}")]
    UnresolvedArgument { index: usize, token: String },

    #[error("invalid node name: {0:?}")]
    InvalidName(String),

    #[error("unbalanced parentheses in {0:?}")]
    Unbalanced(String),

    #[error("unterminated string literal in {0:?}")]
    UnterminatedString(String),

    #[error("invalid primitive literal: {0:?}")]
    InvalidPrimitive(String),
}

/// Error type for engine, persistence and configuration failures.
#[derive(Error, Debug)]
pub enum DagError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Filesystem failure on a specific path.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("node {0} does not exist")]
    NodeNotFound(NodeId),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A module name in the active module list has no known implementation.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// Snapshot data that decoded but is internally inconsistent.
    #[error("corrupted data in {location}: {details}")]
    Corrupt { location: String, details: String },
}

impl DagError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        DagError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

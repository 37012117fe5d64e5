//! Error taxonomy for the enumeration, dispatch and fold stages.

use thiserror::Error;

/// Result type used across the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; nothing was computed.
    Configuration,
    /// An oracle invocation failed; the batch was abandoned.
    Worker,
    /// External cancellation or an expired deadline.
    Interrupted,
    /// A resource ceiling was exceeded before dispatch.
    Overflow,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("the logic tree yields no realizations")]
    EmptyTree,

    #[error("branch weights of {level} sum to {sum}, expected 1")]
    InvalidWeight { level: String, sum: f64 },

    #[error("invalid branch {branch} in {level}: {reason}")]
    InvalidBranch {
        level: String,
        branch: String,
        reason: String,
    },

    #[error("there is no work to partition")]
    NoWork,

    #[error("realization #{ordinal} depends on no work group")]
    OrphanRealization { ordinal: usize },

    #[error("source path {path} declares group {group} with category {category:?}, which has no variant level")]
    MissingCategory {
        path: String,
        group: u32,
        category: String,
    },

    #[error("result for group {group} and variant {variant:?} matches no realization")]
    UnknownAssociation { group: u32, variant: String },

    #[error("value for key {key} has {got} levels, expected {expected}")]
    ShapeMismatch {
        key: u32,
        expected: usize,
        got: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("task #{task} ({label}) failed: {source:#}")]
    Worker {
        task: usize,
        label: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("interrupted after {completed} completed task(s); {} still outstanding", outstanding.len())]
    Interrupted {
        completed: usize,
        outstanding: Vec<usize>,
    },

    #[error("{what} is limited to {limit}, got {got}")]
    Overflow {
        what: &'static str,
        limit: usize,
        got: usize,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Worker { .. } => ErrorKind::Worker,
            Error::Interrupted { .. } => ErrorKind::Interrupted,
            Error::Overflow { .. } => ErrorKind::Overflow,
            _ => ErrorKind::Configuration,
        }
    }
}

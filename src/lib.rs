//! Weighted enumeration of a branching model, load-balanced execution of a
//! per-group computation, and order-independent recombination of the
//! partial results into one aggregate per realization.

pub mod aggregate;
pub mod assoc;
pub mod config;
pub mod driver;
pub mod error;
pub mod execution;
pub mod io;
pub mod logictree;
pub mod partition;
pub mod runtime;

pub use aggregate::{AggregateResult, AggregationOperator, Aggregator, PartialResult, ProbabilityMap};
pub use assoc::AssociationIndex;
pub use config::Config;
pub use driver::{BlockArgs, Stage, WorkItem};
pub use error::{Error, ErrorKind, Result};
pub use execution::CancelToken;
pub use logictree::LogicTree;

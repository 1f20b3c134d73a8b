pub use anyhow::{anyhow, bail, Context, Error, Result};

use std::time::Duration;

/// Fatal to the reduction of one node. The driver converts these into
/// warnings until the failure budget runs out.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// A section list was filled out of index order.
    #[error("section list {list} expected index {expected}, got {found} ({section})")]
    Bookkeeping {
        list: String,
        expected: usize,
        found: usize,
        section: String,
    },
    /// A non-axon section still branches after reduction.
    #[error("reduced section {section} has {children} children; only the axon may branch")]
    InvalidReduction { section: String, children: usize },
    /// The reductor reordered, duplicated or replaced connections.
    #[error("reductor returned connection {found} at position {index}, expected {expected}")]
    ReductionContractViolation {
        index: usize,
        expected: String,
        found: String,
    },
    #[error("expected exactly one cell to be instantiated, found {roots} root sections")]
    MultipleCells { roots: usize },
    #[error("unexpected section name <{0}>")]
    SectionName(String),
    #[error("saved morphology {path} does not reproduce section {id}: {expected} ./. {found}")]
    MorphologySelfCheck {
        path: String,
        id: usize,
        expected: String,
        found: String,
    },
    #[error("cannot instantiate morphology {path}: unsupported format")]
    UnsupportedMorphology { path: String },
    #[error("node {node_id} timed out after {timeout:?}")]
    Timeout { node_id: u64, timeout: Duration },
    #[error("worker for node {node_id} failed: {message}")]
    Worker { node_id: u64, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Other(err.into())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Other(err.into())
    }
}

/// Fatal to a whole population or network.
#[derive(Debug, thiserror::Error)]
pub enum ReductionError {
    #[error("population {population}: {failures} node reductions failed, budget of {budget} exhausted")]
    FailureBudgetExhausted {
        population: String,
        failures: usize,
        budget: usize,
    },
    #[error("invalid circuit: {0}")]
    InvalidCircuit(String),
    #[error("output {0} already exists, please delete it")]
    OutputExists(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for ReductionError {
    fn from(err: std::io::Error) -> Self {
        ReductionError::Other(err.into())
    }
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

use std::io;
use std::path::PathBuf;

use loader_common::budget::BudgetError;
use thiserror::Error;

/// Enumeration of errors that abort a load. Per-record and per-batch failures are not errors at
/// this level: they are written to the malformed and failed logs instead.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("invalid configuration: {0}")]
    Config(#[from] envconfig::Error),
    #[error("invalid write budget: {0}")]
    Budget(#[from] BudgetError),
    #[error("no input file given: set INPUT_PATH or pass the path as the first argument")]
    MissingInput,
    #[error("MAX_IN_FLIGHT_BATCHES must be at least 1")]
    InvalidMaxInFlight,
    #[error("failed to open {}: {}", .path.display(), .source)]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to read {}: {}", .path.display(), .source)]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {}: {}", .path.display(), .source)]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to set up metrics: {0}")]
    Metrics(String),
    #[error("the submitter stopped accepting batches")]
    SubmitterClosed,
    #[error("the reconciler stopped accepting batch outcomes")]
    ReconcilerClosed,
    #[error("the dispatch semaphore was closed")]
    DispatchClosed,
    #[error("a pipeline task did not run to completion")]
    Join(#[from] tokio::task::JoinError),
}

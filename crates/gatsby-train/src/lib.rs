#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

//! Training, checkpointing and hyperparameter search for GAT node
//! classification.
//!
//! - [`loss`]: cross-entropy / binary cross-entropy objectives
//! - [`evaluator`]: accuracy and mean ROC-AUC
//! - [`checkpoint`]: best-epoch snapshots and early stopping
//! - [`trainer`]: the epoch loop over a full graph or sampled mini-batches
//! - [`search`]: trials driven by a [`SuggestionSource`]

pub mod checkpoint;
pub mod error;
pub mod evaluator;
pub mod loss;
pub mod search;
pub mod trainer;

pub use checkpoint::{Checkpoint, EpochRecord, Monitor, ParameterSnapshot};
pub use error::{Error, Result};
pub use evaluator::{evaluator_for, Accuracy, Evaluator, RocAuc};
pub use loss::Objective;
pub use search::{
    apply_assignments, run_search, Assignments, QueueSuggestions, Suggestion, SuggestionSource,
    TrialOutcome, TrialStatus,
};
pub use trainer::{
    Outcome, TestMetrics, Trainer, TrainingConfig, TrainingMode, TrainingReport, TrainingRun,
};

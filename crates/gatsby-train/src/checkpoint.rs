//! Best-epoch tracking and early stopping.
//!
//! A [`Checkpoint`] compares every epoch against the best one so far on the
//! monitored metric. On improvement it replaces its [`ParameterSnapshot`] and
//! resets the patience counter; otherwise the counter grows until it reaches
//! the patience and training stops.

use crate::{Error, Result};
use candle_core::Tensor;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Metric deciding which epoch is best.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Monitor {
    /// Validation loss, lower is better.
    #[default]
    Loss,
    /// Validation score, higher is better.
    Score,
}

impl Monitor {
    /// Whether `candidate` strictly beats `best`.
    pub fn improves(self, candidate: &EpochRecord, best: &EpochRecord) -> bool {
        match self {
            Self::Loss => candidate.valid_loss < best.valid_loss,
            Self::Score => candidate.valid_score > best.valid_score,
        }
    }
}

impl FromStr for Monitor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "loss" => Ok(Self::Loss),
            "score" => Ok(Self::Score),
            other => Err(Error::InvalidConfig(format!("unknown monitor '{other}'"))),
        }
    }
}

impl fmt::Display for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Loss => "loss",
            Self::Score => "score",
        })
    }
}

/// Metrics of one epoch. Times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_time: f64,
    pub valid_time: f64,
    pub train_loss: f64,
    pub valid_loss: f64,
    pub train_score: f64,
    pub valid_score: f64,
}

/// Deep copy of every parameter in a [`VarMap`].
#[derive(Debug, Clone)]
pub struct ParameterSnapshot {
    tensors: HashMap<String, Tensor>,
}

impl ParameterSnapshot {
    pub fn capture(varmap: &VarMap) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| Error::Training("parameter store lock poisoned".into()))?;
        let mut tensors = HashMap::with_capacity(data.len());
        for (name, var) in data.iter() {
            tensors.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(Self { tensors })
    }

    /// Write the captured values back into `varmap`.
    pub fn restore(&self, varmap: &VarMap) -> Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| Error::Training("parameter store lock poisoned".into()))?;
        for (name, var) in data.iter() {
            let saved = self
                .tensors
                .get(name)
                .ok_or_else(|| Error::Training(format!("snapshot has no parameter '{name}'")))?;
            var.set(saved)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }
}

/// Best-so-far record plus patience counter.
#[derive(Debug)]
pub struct Checkpoint {
    monitor: Monitor,
    patience: usize,
    counter: usize,
    best: Option<(EpochRecord, ParameterSnapshot)>,
}

impl Checkpoint {
    pub fn new(monitor: Monitor, patience: usize) -> Self {
        Self {
            monitor,
            patience,
            counter: 0,
            best: None,
        }
    }

    /// Register an epoch. Returns `true` if it became the new best.
    pub fn update(&mut self, record: EpochRecord, varmap: &VarMap) -> Result<bool> {
        let improved = match &self.best {
            None => true,
            Some((best, _)) => self.monitor.improves(&record, best),
        };
        if improved {
            tracing::debug!(epoch = record.epoch, monitor = %self.monitor, "new best checkpoint");
            self.best = Some((record, ParameterSnapshot::capture(varmap)?));
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        Ok(improved)
    }

    /// True once `patience` consecutive epochs failed to improve.
    pub fn should_stop(&self) -> bool {
        self.counter >= self.patience
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn monitor(&self) -> Monitor {
        self.monitor
    }

    pub fn best_record(&self) -> Option<&EpochRecord> {
        self.best.as_ref().map(|(record, _)| record)
    }

    pub fn best_snapshot(&self) -> Option<&ParameterSnapshot> {
        self.best.as_ref().map(|(_, snapshot)| snapshot)
    }

    /// Restore the best parameters into `varmap`; no-op before any update.
    pub fn restore(&self, varmap: &VarMap) -> Result<()> {
        if let Some((_, snapshot)) = &self.best {
            snapshot.restore(varmap)?;
        }
        Ok(())
    }
}

//! Training loop for GAT node classification.
//!
//! Each epoch runs one training pass and one validation pass, then updates
//! the [`Checkpoint`]:
//!
//! ```text
//!            ┌─────────── improved / not yet patient ───────────┐
//!            ▼                                                  │
//!  Running ──► train pass ──► valid pass ──► checkpoint update ─┤
//!                                                               ├─► EarlyStopped
//!                                                               ├─► TimedOut
//!                                                               └─► Completed
//! ```
//!
//! Validation always runs on the full graph in evaluation mode, whichever
//! [`TrainingMode`] drives the training pass. After the loop the best
//! parameters are optionally restored and the test split evaluated.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use gatsby_core::synthetic::{planted_partition, SyntheticConfig};
//! use gatsby_nn::GatConfig;
//! use gatsby_train::{Trainer, TrainingConfig};
//!
//! let graph = Arc::new(planted_partition(&SyntheticConfig::default()).unwrap());
//! let config = TrainingConfig::default()
//!     .with_model(GatConfig::default().with_hidden(8, 0).with_heads(2).with_layers(1))
//!     .with_epochs(3);
//!
//! let run = Trainer::new(config).fit(graph).unwrap();
//! assert_eq!(run.report.epochs.len(), 3);
//! ```

use crate::checkpoint::{Checkpoint, EpochRecord, Monitor};
use crate::evaluator::{evaluator_for, Evaluator};
use crate::loss::Objective;
use crate::{Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use gatsby_core::{
    Fanout, Graph, LoaderConfig, MiniBatch, NeighborSampler, NodeDataLoader, NodeLabels,
};
use gatsby_nn::{Gat, GatConfig, GraphBatch};
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Edge encoder width used when the graph has edge features but none is set.
pub const DEFAULT_EDGE_HIDDEN_FEATS: usize = 16;

/// How the training pass visits the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainingMode {
    /// One step per epoch over the whole graph.
    FullGraph,
    /// One step per batch of sampled blocks.
    MiniBatch {
        batch_size: usize,
        /// One fanout per layer, input side first.
        fanouts: Vec<Fanout>,
        num_workers: usize,
    },
}

impl TrainingMode {
    /// Mini-batch mode with default batch size, fanouts and workers.
    pub fn mini_batch() -> Self {
        Self::MiniBatch {
            batch_size: 512,
            fanouts: vec![Fanout::Sample(10); 3],
            num_workers: 4,
        }
    }
}

/// Training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Network hyperparameters; input/output widths come from the graph.
    pub model: GatConfig,
    pub mode: TrainingMode,
    /// Maximum number of epochs (default: 500).
    pub epochs: usize,
    /// Adam learning rate (default: 0.001).
    pub learning_rate: f64,
    /// Decoupled weight decay (default: 0).
    pub weight_decay: f64,
    /// Epochs without improvement before stopping (default: 10).
    pub patience: usize,
    pub monitor: Monitor,
    /// Wall-clock limit checked after each epoch, in seconds.
    pub timeout_secs: Option<f64>,
    /// Load the best checkpoint back before returning (default: true).
    pub restore_best: bool,
    /// Evaluate the test split after training (default: true).
    pub evaluate_test: bool,
    /// Random seed for dropout and sampling (default: 13).
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model: GatConfig::default(),
            mode: TrainingMode::FullGraph,
            epochs: 500,
            learning_rate: 0.001,
            weight_decay: 0.0,
            patience: 10,
            monitor: Monitor::Loss,
            timeout_secs: None,
            restore_best: true,
            evaluate_test: true,
            seed: 13,
        }
    }
}

impl TrainingConfig {
    pub fn with_model(mut self, model: GatConfig) -> Self {
        self.model = model;
        self
    }

    pub fn with_mode(mut self, mode: TrainingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_timeout_secs(mut self, secs: Option<f64>) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_restore_best(mut self, restore_best: bool) -> Self {
        self.restore_best = restore_best;
        self
    }

    pub fn with_evaluate_test(mut self, evaluate_test: bool) -> Self {
        self.evaluate_test = evaluate_test;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Load from a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Check everything that does not depend on the graph.
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::InvalidConfig("epochs must be > 0".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning rate must be > 0, got {}",
                self.learning_rate
            )));
        }
        if let Some(t) = self.timeout_secs {
            if !(t > 0.0) {
                return Err(Error::InvalidConfig(format!("timeout must be > 0, got {t}")));
            }
        }
        if let TrainingMode::MiniBatch {
            batch_size,
            fanouts,
            num_workers,
        } = &self.mode
        {
            if *batch_size == 0 || *num_workers == 0 {
                return Err(Error::InvalidConfig(
                    "batch_size and num_workers must be > 0".into(),
                ));
            }
            if fanouts.len() != self.model.num_layers {
                return Err(Error::InvalidConfig(format!(
                    "{} fanouts for {} layers",
                    fanouts.len(),
                    self.model.num_layers
                )));
            }
        }
        Ok(())
    }
}

/// How the epoch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    EarlyStopped,
    TimedOut,
    Completed,
}

/// Test-split metrics after restoring the best parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMetrics {
    pub loss: f64,
    pub score: f64,
    pub time: f64,
}

/// Everything a run produced, minus the parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub outcome: Outcome,
    pub monitor: Monitor,
    pub evaluator: String,
    pub epochs: Vec<EpochRecord>,
    pub best: Option<EpochRecord>,
    pub test: Option<TestMetrics>,
    pub total_time: f64,
    /// The configuration actually trained, with widths filled in.
    pub config: TrainingConfig,
}

/// A finished run: report plus the (best) parameters.
pub struct TrainingRun {
    pub report: TrainingReport,
    pub varmap: VarMap,
}

impl TrainingRun {
    /// Write parameters as safetensors.
    pub fn save_parameters(&self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }
}

/// Split-level tensors built once per run.
struct SplitData {
    index: Tensor,
    targets: Tensor,
}

impl SplitData {
    fn new(labels: &NodeLabels, ids: &[u32], device: &Device) -> Result<Self> {
        Ok(Self {
            index: Tensor::from_slice(ids, ids.len(), device)?,
            targets: labels.gather_tensor(ids, device)?,
        })
    }
}

/// Loss/score/time of one pass.
struct PassMetrics {
    loss: f64,
    score: f64,
    time: f64,
}

/// GAT trainer.
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            device: Device::Cpu,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Complete the model config with the graph's widths.
    pub fn resolve_config(&self, graph: &Graph) -> Result<TrainingConfig> {
        let labels = graph
            .labels()
            .ok_or_else(|| Error::Dataset("graph has no labels".into()))?;
        let edge_in = graph.edge_features().map_or(0, |f| f.dim());

        let mut config = self.config.clone();
        config.model.node_in_feats = graph.node_features().dim();
        config.model.edge_in_feats = edge_in;
        config.model.out_feats = labels.num_outputs();
        if edge_in > 0 && config.model.edge_hidden_feats == 0 {
            config.model.edge_hidden_feats = DEFAULT_EDGE_HIDDEN_FEATS;
        }
        config.validate()?;
        config.model.validate()?;
        Ok(config)
    }

    /// Train on `graph` until early stop, timeout or the epoch limit.
    pub fn fit(&self, graph: Arc<Graph>) -> Result<TrainingRun> {
        let start = Instant::now();
        let config = self.resolve_config(&graph)?;
        let labels = graph
            .labels()
            .ok_or_else(|| Error::Dataset("graph has no labels".into()))?;
        let splits = graph.splits();
        if splits.train.is_empty() || splits.valid.is_empty() {
            return Err(Error::Dataset("train and valid splits must be non-empty".into()));
        }
        let device = &self.device;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Gat::new(config.model.clone(), vb)?;
        let mut optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..ParamsAdamW::default()
            },
        )?;

        let objective = Objective::for_labels(labels);
        let evaluator = evaluator_for(labels);
        let node_feats = graph.node_features().to_tensor(device)?;
        let edge_feats = if config.model.uses_edge_features() {
            graph.edge_features().map(|f| f.to_tensor(device)).transpose()?
        } else {
            None
        };
        let full = GraphBatch::Full {
            graph: &graph,
            node_feats: &node_feats,
            edge_feats: edge_feats.as_ref(),
        };
        let train_split = SplitData::new(labels, &splits.train, device)?;
        let valid_split = SplitData::new(labels, &splits.valid, device)?;

        let loader = match &config.mode {
            TrainingMode::FullGraph => None,
            TrainingMode::MiniBatch {
                batch_size,
                fanouts,
                num_workers,
            } => Some(NodeDataLoader::new(
                Arc::clone(&graph),
                splits.train.clone(),
                NeighborSampler::new(fanouts.clone()),
                LoaderConfig::default()
                    .with_batch_size(*batch_size)
                    .with_num_workers(*num_workers)
                    .with_seed(config.seed),
            )?),
        };

        let pass = Pass {
            model: &model,
            graph: &graph,
            labels,
            objective,
            evaluator: evaluator.as_ref(),
            device,
            use_edge_features: edge_feats.is_some(),
        };

        tracing::info!(
            nodes = graph.num_nodes(),
            train = splits.train.len(),
            valid = splits.valid.len(),
            params = varmap.all_vars().len(),
            mode = ?config.mode,
            "starting training"
        );

        let mut rng = XorShiftRng::seed_from_u64(config.seed);
        let mut checkpoint = Checkpoint::new(config.monitor, config.patience);
        let mut epochs = Vec::new();
        let mut outcome = Outcome::Completed;

        for epoch in 0..config.epochs {
            let train = match &loader {
                None => pass.train_full(&full, &train_split, &mut optimizer, &mut rng)?,
                Some(loader) => pass.train_mini_batch(loader, epoch as u64, &mut optimizer, &mut rng)?,
            };
            let valid = pass.evaluate(&full, &valid_split, &mut rng)?;

            let record = EpochRecord {
                epoch,
                train_time: train.time,
                valid_time: valid.time,
                train_loss: train.loss,
                valid_loss: valid.loss,
                train_score: train.score,
                valid_score: valid.score,
            };
            tracing::info!(
                epoch,
                train_loss = record.train_loss,
                train_score = record.train_score,
                valid_loss = record.valid_loss,
                valid_score = record.valid_score,
                train_time = record.train_time,
                "epoch finished"
            );
            checkpoint.update(record.clone(), &varmap)?;
            epochs.push(record);

            if checkpoint.should_stop() {
                tracing::warn!(epoch, patience = config.patience, "early stopping");
                outcome = Outcome::EarlyStopped;
                break;
            }
            if let Some(limit) = config.timeout_secs {
                if start.elapsed().as_secs_f64() >= limit {
                    tracing::warn!(epoch, limit, "training timed out");
                    outcome = Outcome::TimedOut;
                    break;
                }
            }
        }

        if config.restore_best {
            checkpoint.restore(&varmap)?;
        }
        let test = if config.evaluate_test && !splits.test.is_empty() {
            let test_split = SplitData::new(labels, &splits.test, device)?;
            let metrics = pass.evaluate(&full, &test_split, &mut rng)?;
            tracing::info!(loss = metrics.loss, score = metrics.score, "test evaluation");
            Some(TestMetrics {
                loss: metrics.loss,
                score: metrics.score,
                time: metrics.time,
            })
        } else {
            None
        };

        let report = TrainingReport {
            outcome,
            monitor: config.monitor,
            evaluator: evaluator.name().to_string(),
            best: checkpoint.best_record().cloned(),
            epochs,
            test,
            total_time: start.elapsed().as_secs_f64(),
            config,
        };
        Ok(TrainingRun { report, varmap })
    }
}

/// Shared state of the training and evaluation passes.
struct Pass<'a> {
    model: &'a Gat,
    graph: &'a Graph,
    labels: &'a NodeLabels,
    objective: Objective,
    evaluator: &'a dyn Evaluator,
    device: &'a Device,
    use_edge_features: bool,
}

impl Pass<'_> {
    fn train_full(
        &self,
        full: &GraphBatch<'_>,
        split: &SplitData,
        optimizer: &mut AdamW,
        rng: &mut XorShiftRng,
    ) -> Result<PassMetrics> {
        let start = Instant::now();
        let logits = self.model.forward_t(full, true, rng)?.index_select(&split.index, 0)?;
        let loss = self.objective.loss(&logits, &split.targets)?;
        optimizer.backward_step(&loss)?;
        let score = self.evaluator.score(&logits, &split.targets)?;
        Ok(PassMetrics {
            loss: f64::from(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?),
            score,
            time: start.elapsed().as_secs_f64(),
        })
    }

    fn train_mini_batch(
        &self,
        loader: &NodeDataLoader,
        epoch: u64,
        optimizer: &mut AdamW,
        rng: &mut XorShiftRng,
    ) -> Result<PassMetrics> {
        let start = Instant::now();
        let mut total_loss = 0.0;
        let mut total_score = 0.0;
        let mut steps = 0usize;
        let mut scored = 0usize;

        for batch in loader.epoch(epoch) {
            let batch = batch?;
            let (loss, score) = self.train_step(&batch, optimizer, rng)?;
            tracing::debug!(epoch, batch = batch.index, loss, score, "train step");
            total_loss += loss;
            steps += 1;
            if let Some(score) = score {
                total_score += score;
                scored += 1;
            }
        }
        if steps == 0 {
            return Err(Error::Training("loader produced no batches".into()));
        }
        Ok(PassMetrics {
            loss: total_loss / steps as f64,
            score: if scored == 0 { 0.0 } else { total_score / scored as f64 },
            time: start.elapsed().as_secs_f64(),
        })
    }

    /// One optimizer step. The score is `None` when the batch is too small
    /// for the evaluator (e.g. no task with both classes).
    fn train_step(&self, batch: &MiniBatch, optimizer: &mut AdamW, rng: &mut XorShiftRng) -> Result<(f64, Option<f64>)> {
        let input = self
            .graph
            .node_features()
            .gather_tensor(batch.input_nodes(), self.device)?;
        let edge_feats: Vec<Option<Tensor>> = match self.graph.edge_features() {
            Some(features) if self.use_edge_features => batch
                .blocks
                .iter()
                .map(|b| features.gather_tensor(b.edge_ids(), self.device).map(Some))
                .collect::<gatsby_core::Result<_>>()?,
            _ => Vec::new(),
        };
        let targets = self.labels.gather_tensor(batch.output_nodes(), self.device)?;

        let sampled = GraphBatch::Sampled {
            blocks: &batch.blocks,
            node_feats: &input,
            edge_feats: &edge_feats,
        };
        let logits = self.model.forward_t(&sampled, true, rng)?;
        let loss = self.objective.loss(&logits, &targets)?;
        optimizer.backward_step(&loss)?;
        let score = match self.evaluator.score(&logits, &targets) {
            Ok(score) => Some(score),
            Err(Error::Dataset(reason)) => {
                tracing::debug!(batch = batch.index, %reason, "batch not scored");
                None
            }
            Err(e) => return Err(e),
        };
        Ok((f64::from(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?), score))
    }

    /// Full-graph forward in evaluation mode; no parameter update.
    fn evaluate(&self, full: &GraphBatch<'_>, split: &SplitData, rng: &mut XorShiftRng) -> Result<PassMetrics> {
        let start = Instant::now();
        let logits = self.model.forward_t(full, false, rng)?.index_select(&split.index, 0)?;
        let loss = self.objective.loss(&logits, &split.targets)?;
        let score = self.evaluator.score(&logits, &split.targets)?;
        Ok(PassMetrics {
            loss: f64::from(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?),
            score,
            time: start.elapsed().as_secs_f64(),
        })
    }
}

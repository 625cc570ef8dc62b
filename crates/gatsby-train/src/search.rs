//! Hyperparameter search driven by an external suggestion source.
//!
//! A [`SuggestionSource`] hands out assignment maps; [`run_search`] applies
//! each one to a base [`TrainingConfig`], trains, and reports the outcome
//! back. Bad assignments abort the search. Failures inside a trial are
//! reported as [`TrialStatus::Failed`] and the search moves on.

use crate::trainer::{Trainer, TrainingConfig, TrainingMode, TrainingReport};
use crate::{Error, Result};
use candle_core::Device;
use gatsby_core::{parse_fanouts, Fanout, Graph};
use gatsby_nn::{Activation, Norm};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

/// Hyperparameter name to suggested value.
pub type Assignments = BTreeMap<String, Value>;

/// One suggested configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: usize,
    pub assignments: Assignments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialStatus {
    Completed,
    Failed { message: String },
}

/// What a trial produced, as reported to the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub suggestion: Suggestion,
    #[serde(flatten)]
    pub status: TrialStatus,
    /// Full report for completed trials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<TrainingReport>,
}

impl TrialOutcome {
    /// Best validation score, if the trial completed.
    pub fn best_valid_score(&self) -> Option<f64> {
        self.report.as_ref()?.best.as_ref().map(|b| b.valid_score)
    }
}

/// Supplier of suggestions and sink of observations.
pub trait SuggestionSource {
    /// Next suggestion, or `None` when the source is exhausted.
    fn next_suggestion(&mut self) -> Result<Option<Suggestion>>;

    fn report(&mut self, outcome: &TrialOutcome) -> Result<()>;
}

/// In-memory FIFO of predefined assignments.
#[derive(Debug, Default)]
pub struct QueueSuggestions {
    pending: VecDeque<Suggestion>,
    observations: Vec<TrialOutcome>,
}

impl QueueSuggestions {
    pub fn new(assignments: impl IntoIterator<Item = Assignments>) -> Self {
        let pending = assignments
            .into_iter()
            .enumerate()
            .map(|(id, assignments)| Suggestion { id, assignments })
            .collect();
        Self {
            pending,
            observations: Vec::new(),
        }
    }

    /// Load a JSON array of assignment objects.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let list: Vec<Assignments> = serde_json::from_str(&text)?;
        Ok(Self::new(list))
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn observations(&self) -> &[TrialOutcome] {
        &self.observations
    }
}

impl SuggestionSource for QueueSuggestions {
    fn next_suggestion(&mut self) -> Result<Option<Suggestion>> {
        Ok(self.pending.pop_front())
    }

    fn report(&mut self, outcome: &TrialOutcome) -> Result<()> {
        self.observations.push(outcome.clone());
        Ok(())
    }
}

fn invalid(name: &str, reason: impl Into<String>) -> Error {
    Error::Assignment {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn as_usize(name: &str, value: &Value) -> Result<usize> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .map(|v| v as usize)
            .ok_or_else(|| invalid(name, format!("expected a non-negative integer, got {n}"))),
        other => Err(invalid(name, format!("expected an integer, got {other}"))),
    }
}

fn as_f64(name: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| invalid(name, format!("expected a number, got {value}")))
}

fn as_dropout(name: &str, value: &Value) -> Result<f32> {
    let p = as_f64(name, value)?;
    if !(0.0..1.0).contains(&p) {
        return Err(invalid(name, format!("dropout must be in [0, 1), got {p}")));
    }
    Ok(p as f32)
}

/// `true`/`false`, or the integers `1`/`0` some search services send.
fn as_bool(name: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 1.0 => Ok(true),
            Some(v) if v == 0.0 => Ok(false),
            _ => Err(invalid(name, format!("expected 0 or 1, got {n}"))),
        },
        other => Err(invalid(name, format!("expected a boolean, got {other}"))),
    }
}

fn as_str<'v>(name: &str, value: &'v Value) -> Result<&'v str> {
    value
        .as_str()
        .ok_or_else(|| invalid(name, format!("expected a string, got {value}")))
}

/// Fanouts as `"5,10,15"` or `[5, 10, 15]`; `-1` means full.
fn as_fanouts(name: &str, value: &Value) -> Result<Vec<Fanout>> {
    match value {
        Value::String(s) => parse_fanouts(s).map_err(|e| invalid(name, e.to_string())),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_i64()
                    .map(Fanout::from)
                    .ok_or_else(|| invalid(name, format!("bad fanout {v}")))
            })
            .collect(),
        other => Err(invalid(name, format!("expected a list of fanouts, got {other}"))),
    }
}

/// Overlay `assignments` on `base`.
///
/// `batch_size` and `fanouts` switch a full-graph base into mini-batch
/// mode with the default loader settings.
pub fn apply_assignments(base: &TrainingConfig, assignments: &Assignments) -> Result<TrainingConfig> {
    let mut config = base.clone();
    for (name, value) in assignments {
        let model = &mut config.model;
        match name.as_str() {
            "lr" | "learning_rate" => config.learning_rate = as_f64(name, value)?,
            "node_hidden_feats" => model.node_hidden_feats = as_usize(name, value)?,
            "edge_hidden_feats" => model.edge_hidden_feats = as_usize(name, value)?,
            "num_heads" => model.num_heads = as_usize(name, value)?,
            "num_layers" => model.num_layers = as_usize(name, value)?,
            "norm" => {
                model.norm = as_str(name, value)?
                    .parse::<Norm>()
                    .map_err(|e| invalid(name, e.to_string()))?
            }
            "batch_norm" => model.batch_norm = as_bool(name, value)?,
            "input_dropout" => model.input_dropout = as_dropout(name, value)?,
            "attn_dropout" => model.attn_dropout = as_dropout(name, value)?,
            "edge_dropout" => model.edge_dropout = as_dropout(name, value)?,
            "dropout" => model.dropout = as_dropout(name, value)?,
            "negative_slope" => model.negative_slope = as_f64(name, value)?,
            "residual" => model.residual = as_bool(name, value)?,
            "activation" => {
                model.activation = as_str(name, value)?
                    .parse::<Activation>()
                    .map_err(|e| invalid(name, e.to_string()))?
            }
            "use_attn_dst" => model.use_attn_dst = as_bool(name, value)?,
            "bias" => model.bias = as_bool(name, value)?,
            "batch_size" => {
                let size = as_usize(name, value)?;
                if let TrainingMode::MiniBatch { batch_size, .. } = mini_batch_mode(&mut config.mode) {
                    *batch_size = size;
                }
            }
            "fanouts" => {
                let parsed = as_fanouts(name, value)?;
                if let TrainingMode::MiniBatch { fanouts, .. } = mini_batch_mode(&mut config.mode) {
                    *fanouts = parsed;
                }
            }
            _ => return Err(invalid(name, "unknown hyperparameter")),
        }
    }
    Ok(config)
}

fn mini_batch_mode(mode: &mut TrainingMode) -> &mut TrainingMode {
    if *mode == TrainingMode::FullGraph {
        *mode = TrainingMode::mini_batch();
    }
    mode
}

/// Run trials until the source is exhausted or `budget` trials have run.
pub fn run_search<S: SuggestionSource + ?Sized>(
    source: &mut S,
    base: &TrainingConfig,
    graph: Arc<Graph>,
    budget: Option<usize>,
    device: &Device,
) -> Result<Vec<TrialOutcome>> {
    let mut outcomes = Vec::new();
    while budget.map_or(true, |b| outcomes.len() < b) {
        let Some(suggestion) = source.next_suggestion()? else {
            break;
        };
        let config = apply_assignments(base, &suggestion.assignments)?;
        tracing::info!(trial = suggestion.id, assignments = ?suggestion.assignments, "starting trial");

        let outcome = match Trainer::new(config).with_device(device.clone()).fit(Arc::clone(&graph)) {
            Ok(run) => TrialOutcome {
                suggestion,
                status: TrialStatus::Completed,
                report: Some(run.report),
            },
            Err(e) => {
                tracing::warn!(trial = suggestion.id, error = %e, "trial failed");
                TrialOutcome {
                    suggestion,
                    status: TrialStatus::Failed {
                        message: e.to_string(),
                    },
                    report: None,
                }
            }
        };
        source.report(&outcome)?;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatsby_core::synthetic::{planted_partition, SyntheticConfig};
    use gatsby_nn::GatConfig;
    use serde_json::json;
    use std::io::Write;

    fn assignments(value: Value) -> Assignments {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_apply_assignments() {
        let base = TrainingConfig::default();
        let config = apply_assignments(
            &base,
            &assignments(json!({
                "lr": 0.01,
                "num_heads": 2,
                "norm": "both",
                "activation": "leaky_relu",
                "attn_dropout": 0.1,
                "residual": true,
                "fanouts": "4,-1,8",
                "batch_size": 32
            })),
        )
        .unwrap();
        assert_eq!(config.learning_rate, 0.01);
        assert_eq!(config.model.num_heads, 2);
        assert_eq!(config.model.norm, Norm::Both);
        assert_eq!(config.model.activation, Activation::LeakyRelu);
        assert!(config.model.residual);
        match config.mode {
            TrainingMode::MiniBatch {
                batch_size, fanouts, ..
            } => {
                assert_eq!(batch_size, 32);
                assert_eq!(fanouts, vec![Fanout::Sample(4), Fanout::Full, Fanout::Sample(8)]);
            }
            TrainingMode::FullGraph => panic!("expected mini-batch mode"),
        }
    }

    #[test]
    fn test_integer_flags_accepted() {
        let base = TrainingConfig::default();
        let config = apply_assignments(
            &base,
            &assignments(json!({"residual": 1, "batch_norm": 0, "use_attn_dst": 0, "bias": 1})),
        )
        .unwrap();
        assert!(config.model.residual);
        assert!(!config.model.batch_norm);
        assert!(!config.model.use_attn_dst);
        assert!(config.model.bias);

        for bad in [json!({"residual": 2}), json!({"bias": -1}), json!({"batch_norm": 0.5})] {
            let err = apply_assignments(&base, &assignments(bad.clone())).unwrap_err();
            assert!(matches!(err, Error::Assignment { .. }), "{bad}");
        }
    }

    #[test]
    fn test_integer_flags_do_not_abort_search() {
        let graph = Arc::new(
            planted_partition(&SyntheticConfig::default().with_num_nodes(40).with_feature_dim(4)).unwrap(),
        );
        let base = TrainingConfig::default()
            .with_model(GatConfig::default().with_hidden(4, 0).with_heads(1).with_layers(1))
            .with_epochs(1);
        let mut source = QueueSuggestions::new([
            assignments(json!({"residual": 1, "batch_norm": 0, "use_attn_dst": 1, "bias": 1})),
            assignments(json!({"lr": 0.01})),
        ]);
        let outcomes = run_search(&mut source, &base, graph, None, &Device::Cpu).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.status == TrialStatus::Completed));
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_bad_assignments_rejected() {
        let base = TrainingConfig::default();
        for bad in [
            json!({"learning_rat": 0.1}),
            json!({"num_heads": "four"}),
            json!({"num_heads": 2.5}),
            json!({"norm": "sideways"}),
            json!({"dropout": 1.0}),
            json!({"fanouts": [5, "x"]}),
        ] {
            let err = apply_assignments(&base, &assignments(bad.clone())).unwrap_err();
            assert!(matches!(err, Error::Assignment { .. }), "{bad}");
        }
    }

    #[test]
    fn test_run_search_reports_failures_and_continues() {
        let graph = Arc::new(
            planted_partition(&SyntheticConfig::default().with_num_nodes(60).with_feature_dim(4)).unwrap(),
        );
        let base = TrainingConfig::default()
            .with_model(GatConfig::default().with_hidden(4, 0).with_heads(1).with_layers(1))
            .with_epochs(2);
        let mut source = QueueSuggestions::new([
            assignments(json!({"lr": 0.01})),
            // one fanout per layer required; fails inside the trial
            assignments(json!({"fanouts": "3,3"})),
            assignments(json!({"num_heads": 2})),
        ]);

        let outcomes = run_search(&mut source, &base, graph, None, &Device::Cpu).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].status, TrialStatus::Completed);
        assert!(matches!(outcomes[1].status, TrialStatus::Failed { .. }));
        assert_eq!(outcomes[2].status, TrialStatus::Completed);
        assert!(outcomes[2].best_valid_score().is_some());
        assert_eq!(source.observations().len(), 3);
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_budget_limits_trials() {
        let graph = Arc::new(
            planted_partition(&SyntheticConfig::default().with_num_nodes(40).with_feature_dim(4)).unwrap(),
        );
        let base = TrainingConfig::default()
            .with_model(GatConfig::default().with_hidden(4, 0).with_heads(1).with_layers(1))
            .with_epochs(1);
        let mut source = QueueSuggestions::new(vec![Assignments::new(); 3]);
        let outcomes = run_search(&mut source, &base, graph, Some(1), &Device::Cpu).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(source.remaining(), 2);
    }

    #[test]
    fn test_queue_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"lr": 0.1}}, {{"num_layers": 2, "bias": false}}]"#).unwrap();
        let mut source = QueueSuggestions::from_json_file(file.path()).unwrap();
        assert_eq!(source.remaining(), 2);
        let first = source.next_suggestion().unwrap().unwrap();
        assert_eq!(first.id, 0);
        assert_eq!(first.assignments["lr"], json!(0.1));
    }
}

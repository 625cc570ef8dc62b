//! Pluggable scoring of predictions.
//!
//! | Labels | Evaluator | Score |
//! |--------|-----------|-------|
//! | one class per node | [`Accuracy`] | fraction of argmax hits |
//! | binary tasks per node | [`RocAuc`] | mean ROC-AUC over tasks with both classes |

use crate::{Error, Result};
use candle_core::{DType, Tensor, D};
use gatsby_core::NodeLabels;
use std::cmp::Ordering;

/// Scores logits against targets; higher is better.
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, logits: &Tensor, targets: &Tensor) -> Result<f64>;
}

/// Pick the evaluator for a label kind.
pub fn evaluator_for(labels: &NodeLabels) -> Box<dyn Evaluator> {
    if labels.is_multi_label() {
        Box::new(RocAuc)
    } else {
        Box::new(Accuracy)
    }
}

/// Top-1 accuracy for single-label classification.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accuracy;

impl Evaluator for Accuracy {
    fn name(&self) -> &'static str {
        "accuracy"
    }

    fn score(&self, logits: &Tensor, targets: &Tensor) -> Result<f64> {
        let n = targets.dims1()?;
        if n == 0 {
            return Ok(0.0);
        }
        let predicted = logits.argmax(D::Minus1)?.to_dtype(DType::U32)?;
        let hits = predicted
            .eq(&targets.to_dtype(DType::U32)?)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        Ok(f64::from(hits) / n as f64)
    }
}

/// Mean ROC-AUC over binary tasks.
///
/// Tasks whose targets are all positive or all negative are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct RocAuc;

impl Evaluator for RocAuc {
    fn name(&self) -> &'static str {
        "rocauc"
    }

    fn score(&self, logits: &Tensor, targets: &Tensor) -> Result<f64> {
        let scores = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let truth = targets.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let tasks = truth.first().map_or(0, Vec::len);

        let mut total = 0.0;
        let mut counted = 0usize;
        for t in 0..tasks {
            let column: Vec<(f32, bool)> = scores
                .iter()
                .zip(&truth)
                .map(|(s, y)| (s[t], y[t] > 0.5))
                .collect();
            if let Some(auc) = binary_auc(&column) {
                total += auc;
                counted += 1;
            }
        }
        if counted == 0 {
            return Err(Error::Dataset(
                "no task has both positive and negative targets".into(),
            ));
        }
        Ok(total / counted as f64)
    }
}

/// Mann-Whitney AUC with average ranks for ties; `None` if one class is absent.
fn binary_auc(column: &[(f32, bool)]) -> Option<f64> {
    let positives = column.iter().filter(|(_, y)| *y).count();
    let negatives = column.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..column.len()).collect();
    order.sort_by(|&a, &b| column[a].0.partial_cmp(&column[b].0).unwrap_or(Ordering::Equal));

    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && column[order[j + 1]].0 == column[order[i]].0 {
            j += 1;
        }
        // ranks are 1-based; tied block i..=j shares the average rank
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            if column[k].1 {
                rank_sum += avg_rank;
            }
        }
        i = j + 1;
    }

    let p = positives as f64;
    Some((rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}

//! Dense feature rows, node labels and dataset splits.

use crate::{Error, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

/// Row-major `rows x dim` feature buffer.
///
/// Node features and edge features are both stored this way; tensors are
/// materialised on demand for whichever device the model runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    rows: usize,
    dim: usize,
    data: Vec<f32>,
}

impl FeatureMatrix {
    /// Wrap a row-major buffer, checking that `data.len() == rows * dim`.
    pub fn new(rows: usize, dim: usize, data: Vec<f32>) -> Result<Self> {
        let matrix = Self { rows, dim, data };
        matrix.validate()?;
        Ok(matrix)
    }

    /// All-zero matrix.
    pub fn zeros(rows: usize, dim: usize) -> Self {
        Self {
            rows,
            dim,
            data: vec![0.0; rows * dim],
        }
    }

    /// Build from a list of equally sized rows.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let dim = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * dim);
        for row in rows {
            if row.len() != dim {
                return Err(Error::FeatureShape {
                    expected: dim,
                    got: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            dim,
            data,
        })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let expected = self.rows * self.dim;
        if self.data.len() != expected {
            return Err(Error::FeatureShape {
                expected,
                got: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Borrow row `i`.
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub(crate) fn push_row(&mut self, row: &[f32]) {
        debug_assert_eq!(row.len(), self.dim);
        self.data.extend_from_slice(row);
        self.rows += 1;
    }

    /// Copy the selected rows into a new matrix, in the given order.
    pub fn gather(&self, ids: &[u32]) -> Self {
        let mut data = Vec::with_capacity(ids.len() * self.dim);
        for &id in ids {
            data.extend_from_slice(self.row(id as usize));
        }
        Self {
            rows: ids.len(),
            dim: self.dim,
            data,
        }
    }

    /// `(rows, dim)` f32 tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.data, (self.rows, self.dim), device)?)
    }

    /// `(ids.len(), dim)` f32 tensor of the selected rows.
    pub fn gather_tensor(&self, ids: &[u32], device: &Device) -> Result<Tensor> {
        self.gather(ids).to_tensor(device)
    }
}

/// Per-node prediction targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLabels {
    /// One class id per node (arxiv, products).
    Classes { num_classes: usize, values: Vec<u32> },
    /// Row-major `num_nodes x num_tasks` binary targets (proteins).
    MultiLabel { num_tasks: usize, values: Vec<f32> },
}

impl NodeLabels {
    /// Number of labelled nodes.
    pub fn num_nodes(&self) -> usize {
        match self {
            Self::Classes { values, .. } => values.len(),
            Self::MultiLabel { num_tasks, values } => {
                if *num_tasks == 0 {
                    0
                } else {
                    values.len() / num_tasks
                }
            }
        }
    }

    /// Width of the prediction head needed for these labels.
    pub fn num_outputs(&self) -> usize {
        match self {
            Self::Classes { num_classes, .. } => *num_classes,
            Self::MultiLabel { num_tasks, .. } => *num_tasks,
        }
    }

    pub fn is_multi_label(&self) -> bool {
        matches!(self, Self::MultiLabel { .. })
    }

    pub(crate) fn validate(&self, num_nodes: usize) -> Result<()> {
        match self {
            Self::Classes {
                num_classes,
                values,
            } => {
                if values.len() != num_nodes {
                    return Err(Error::RowCount {
                        what: "labels",
                        expected: num_nodes,
                        got: values.len(),
                    });
                }
                if let Some(bad) = values.iter().find(|&&c| c as usize >= *num_classes) {
                    return Err(Error::InvalidGraph(format!(
                        "label {bad} outside 0..{num_classes}"
                    )));
                }
            }
            Self::MultiLabel { num_tasks, values } => {
                if *num_tasks == 0 {
                    return Err(Error::InvalidGraph("multi-label with zero tasks".into()));
                }
                if values.len() != num_nodes * num_tasks {
                    return Err(Error::FeatureShape {
                        expected: num_nodes * num_tasks,
                        got: values.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Targets of the selected nodes: `u32 (n,)` for classes, `f32 (n, tasks)`
    /// for multi-label.
    pub fn gather_tensor(&self, ids: &[u32], device: &Device) -> Result<Tensor> {
        match self {
            Self::Classes { values, .. } => {
                let picked: Vec<u32> = ids.iter().map(|&i| values[i as usize]).collect();
                Ok(Tensor::from_vec(picked, ids.len(), device)?)
            }
            Self::MultiLabel { num_tasks, values } => {
                let mut picked = Vec::with_capacity(ids.len() * num_tasks);
                for &i in ids {
                    let start = i as usize * num_tasks;
                    picked.extend_from_slice(&values[start..start + num_tasks]);
                }
                Ok(Tensor::from_vec(picked, (ids.len(), *num_tasks), device)?)
            }
        }
    }
}

/// Train / validation / test node indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Splits {
    pub train: Vec<u32>,
    pub valid: Vec<u32>,
    pub test: Vec<u32>,
}

impl Splits {
    pub(crate) fn validate(&self, num_nodes: usize) -> Result<()> {
        for &node in self.train.iter().chain(&self.valid).chain(&self.test) {
            if node as usize >= num_nodes {
                return Err(Error::NodeOutOfRange {
                    node: node as usize,
                    num_nodes,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_matrix_rejects_bad_length() {
        assert!(FeatureMatrix::new(2, 3, vec![0.0; 5]).is_err());
        assert!(FeatureMatrix::new(2, 3, vec![0.0; 6]).is_ok());
    }

    #[test]
    fn test_gather_preserves_order() {
        let m = FeatureMatrix::from_rows(&[vec![0.0, 1.0], vec![2.0, 3.0], vec![4.0, 5.0]]).unwrap();
        let g = m.gather(&[2, 0]);
        assert_eq!(g.rows(), 2);
        assert_eq!(g.as_slice(), &[4.0, 5.0, 0.0, 1.0]);
    }

    #[test]
    fn test_label_gather_shapes() {
        let device = Device::Cpu;
        let classes = NodeLabels::Classes {
            num_classes: 3,
            values: vec![0, 2, 1],
        };
        let t = classes.gather_tensor(&[1, 2], &device).unwrap();
        assert_eq!(t.to_vec1::<u32>().unwrap(), vec![2, 1]);

        let multi = NodeLabels::MultiLabel {
            num_tasks: 2,
            values: vec![0.0, 1.0, 1.0, 1.0, 0.0, 0.0],
        };
        assert_eq!(multi.num_nodes(), 3);
        let t = multi.gather_tensor(&[2, 0], &device).unwrap();
        assert_eq!(t.dims(), &[2, 2]);
        assert_eq!(t.to_vec2::<f32>().unwrap(), vec![vec![0.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_class_labels_out_of_range() {
        let labels = NodeLabels::Classes {
            num_classes: 2,
            values: vec![0, 2],
        };
        assert!(labels.validate(2).is_err());
    }
}

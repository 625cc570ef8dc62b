//! Training objectives.

use crate::Result;
use candle_core::Tensor;
use gatsby_core::NodeLabels;

/// Loss matching the label kind of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    /// Cross-entropy over class logits; targets are `u32 (n,)`.
    SingleLabel,
    /// Mean binary cross-entropy with logits; targets are `f32 (n, tasks)`.
    MultiLabel,
}

impl Objective {
    pub fn for_labels(labels: &NodeLabels) -> Self {
        if labels.is_multi_label() {
            Self::MultiLabel
        } else {
            Self::SingleLabel
        }
    }

    pub fn loss(self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        match self {
            Self::SingleLabel => Ok(candle_nn::loss::cross_entropy(logits, targets)?),
            Self::MultiLabel => bce_with_logits(logits, targets),
        }
    }
}

/// Numerically stable `mean(max(x, 0) - x*y + log(1 + exp(-|x|)))`.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let targets = targets.to_dtype(logits.dtype())?;
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    let loss = ((logits.relu()? - logits.mul(&targets)?)? + softplus)?;
    Ok(loss.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    #[test]
    fn test_bce_matches_naive_formula() {
        let device = Device::Cpu;
        let x = [0.3f32, -1.2, 2.0, -0.1];
        let y = [1.0f32, 0.0, 0.0, 1.0];
        let logits = Tensor::new(&x, &device).unwrap().reshape((2, 2)).unwrap();
        let targets = Tensor::new(&y, &device).unwrap().reshape((2, 2)).unwrap();
        let got = bce_with_logits(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();

        let naive: f32 = x
            .iter()
            .zip(&y)
            .map(|(&x, &y)| {
                let p = 1.0 / (1.0 + (-x).exp());
                -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
            })
            .sum::<f32>()
            / 4.0;
        assert_relative_eq!(got, naive, epsilon = 1e-5);
    }

    #[test]
    fn test_bce_large_logits_finite() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[200.0f32, -200.0]], &device).unwrap();
        let targets = Tensor::new(&[[0.0f32, 1.0]], &device).unwrap();
        let loss = bce_with_logits(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
        assert_relative_eq!(loss, 200.0, epsilon = 1e-3);
    }

    #[test]
    fn test_cross_entropy_uniform() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((3, 4), candle_core::DType::F32, &device).unwrap();
        let targets = Tensor::new(&[0u32, 1, 3], &device).unwrap();
        let loss = Objective::SingleLabel
            .loss(&logits, &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_relative_eq!(loss, 4f32.ln(), epsilon = 1e-6);
    }
}

//! Edge-level tensor operations used by the attention layer.
//!
//! - [`segment_softmax`]: softmax over the incoming edges of each destination
//! - [`dropout`]: inverted dropout driven by a caller-supplied RNG
//! - [`degree_scale`]: `max(deg, 1)^-p` factors for degree normalization
//! - [`Activation`]: the nonlinearities a network can be configured with
//!
//! # Segment Softmax
//!
//! ```text
//! edges:   e0  e1  e2  e3  e4
//! dst:      0   0   1   1   1
//!          \______/ \_________/
//!          softmax   softmax
//! ```
//!
//! Candle has no scatter-max, so the per-segment maximum used for numerical
//! stability is computed on the host. It is a constant with respect to the
//! autodiff graph, which leaves the softmax gradient unchanged.

use crate::{Error, Result};
use candle_core::{DType, Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Softmax of `logits` `(E, H)` grouped by destination.
///
/// `dst` is a `u32` tensor of shape `(E,)` with values in `0..num_dst`.
/// Each head is normalized independently. Destinations without edges simply
/// receive nothing.
pub fn segment_softmax(logits: &Tensor, dst: &Tensor, num_dst: usize) -> Result<Tensor> {
    let (num_edges, num_heads) = logits.dims2()?;
    if dst.dims1()? != num_edges {
        return Err(Error::DimensionMismatch {
            what: "segment ids",
            expected: num_edges,
            got: dst.dims1()?,
        });
    }
    if num_edges == 0 {
        return Ok(logits.clone());
    }

    let values = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let ids = dst.to_vec1::<u32>()?;
    let mut max = vec![f32::NEG_INFINITY; num_dst * num_heads];
    for (row, &d) in values.iter().zip(&ids) {
        let seg = &mut max[d as usize * num_heads..(d as usize + 1) * num_heads];
        for (m, &v) in seg.iter_mut().zip(row) {
            *m = m.max(v);
        }
    }
    for m in &mut max {
        if !m.is_finite() {
            *m = 0.0;
        }
    }
    let max = Tensor::from_vec(max, (num_dst, num_heads), logits.device())?.to_dtype(logits.dtype())?;

    let shifted = logits.sub(&max.index_select(dst, 0)?)?;
    let exp = shifted.exp()?;
    let sums = Tensor::zeros((num_dst, num_heads), exp.dtype(), exp.device())?.index_add(dst, &exp, 0)?;
    Ok(exp.div(&sums.index_select(dst, 0)?)?)
}

/// Inverted dropout: zero each element with probability `p`, scale the rest
/// by `1 / (1 - p)`.
pub fn dropout<R: Rng + ?Sized>(x: &Tensor, p: f32, rng: &mut R) -> Result<Tensor> {
    if p <= 0.0 {
        return Ok(x.clone());
    }
    if p >= 1.0 {
        return Ok(x.zeros_like()?);
    }
    let scale = 1.0 / (1.0 - p);
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.gen::<f32>() < p { 0.0 } else { scale })
        .collect();
    let mask = Tensor::from_vec(mask, x.shape(), x.device())?.to_dtype(x.dtype())?;
    Ok(x.mul(&mask)?)
}

/// Per-node factors `max(deg, 1)^-power` shaped `(n, 1, 1)` for broadcasting
/// over `(n, heads, feats)`.
pub fn degree_scale(degrees: &[usize], power: f64, dtype: DType, device: &Device) -> Result<Tensor> {
    let factors: Vec<f32> = degrees
        .iter()
        .map(|&d| (d.max(1) as f64).powf(-power) as f32)
        .collect();
    Ok(Tensor::from_vec(factors, (degrees.len(), 1, 1), device)?.to_dtype(dtype)?)
}

/// Nonlinearity applied between layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    /// Leaky ReLU with slope 0.01.
    LeakyRelu,
}

impl Activation {
    pub fn apply(self, x: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::Relu => x.relu()?,
            Self::LeakyRelu => candle_nn::ops::leaky_relu(x, 0.01)?,
        })
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relu" => Ok(Self::Relu),
            "leaky_relu" | "leaky-relu" => Ok(Self::LeakyRelu),
            other => Err(Error::InvalidConfig(format!("unknown activation '{other}'"))),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Relu => "relu",
            Self::LeakyRelu => "leaky_relu",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    #[test]
    fn test_segment_softmax_sums_to_one() {
        let device = Device::Cpu;
        let logits = Tensor::new(
            &[[1.0f32, 0.0], [2.0, 5.0], [0.5, -1.0], [3.0, 3.0], [-2.0, 0.0]],
            &device,
        )
        .unwrap();
        let dst = Tensor::new(&[0u32, 0, 2, 2, 2], &device).unwrap();
        let attn = segment_softmax(&logits, &dst, 3).unwrap().to_vec2::<f32>().unwrap();

        for head in 0..2 {
            assert_relative_eq!(attn[0][head] + attn[1][head], 1.0, epsilon = 1e-6);
            assert_relative_eq!(attn[2][head] + attn[3][head] + attn[4][head], 1.0, epsilon = 1e-6);
        }
        let e = (1.0f32 - 2.0).exp();
        assert_relative_eq!(attn[0][0], e / (1.0 + e), epsilon = 1e-6);
    }

    #[test]
    fn test_segment_softmax_large_logits_are_stable() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[1000.0f32], [1000.0]], &device).unwrap();
        let dst = Tensor::new(&[0u32, 0], &device).unwrap();
        let attn = segment_softmax(&logits, &dst, 1).unwrap().to_vec2::<f32>().unwrap();
        assert_relative_eq!(attn[0][0], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_dropout_zero_and_scale() {
        let device = Device::Cpu;
        let x = Tensor::ones((50, 4), DType::F32, &device).unwrap();
        let mut rng = XorShiftRng::seed_from_u64(3);

        let same = dropout(&x, 0.0, &mut rng).unwrap();
        assert_eq!(same.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());

        let dropped = dropout(&x, 0.5, &mut rng).unwrap().flatten_all().unwrap();
        let values = dropped.to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        let zeros = values.iter().filter(|&&v| v == 0.0).count();
        assert!(zeros > 50 && zeros < 150, "zeros = {zeros}");
    }

    #[test]
    fn test_degree_scale_floors_at_one() {
        let t = degree_scale(&[0, 1, 4], 0.5, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[3, 1, 1]);
        let v = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(v, vec![1.0, 1.0, 0.5]);
    }

    #[test]
    fn test_activation_parse() {
        assert_eq!("relu".parse::<Activation>().unwrap(), Activation::Relu);
        assert_eq!("leaky_relu".parse::<Activation>().unwrap(), Activation::LeakyRelu);
        assert!("gelu".parse::<Activation>().is_err());
        let x = Tensor::new(&[-1.0f32, 2.0], &Device::Cpu).unwrap();
        let y = Activation::LeakyRelu.apply(&x).unwrap().to_vec1::<f32>().unwrap();
        assert_relative_eq!(y[0], -0.01, epsilon = 1e-7);
        assert_relative_eq!(y[1], 2.0);
    }
}

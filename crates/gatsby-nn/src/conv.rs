//! Multi-head graph attention convolution.
//!
//! [`GatConv`] computes, for every destination node `i` and head `k`:
//!
//! ```text
//! e_ij   = LeakyReLU(a_src . x_j  +  a_dst . x_i  +  a_edge . f_ij)
//! α_ij   = softmax_j(e_ij)                      (over incoming edges of i)
//! h_i'   = Σ_j α_ij · W_src x_j                 (+ W_dst x_i  or  + b)
//! ```
//!
//! The attention scores are linear projections of the *input* features, not
//! of the projected messages. The destination and edge terms are optional.
//!
//! # Degree Normalization
//!
//! | norm | source side | destination side |
//! |------|-------------|------------------|
//! | `none` | - | - |
//! | `left` | `deg_out^-1` | - |
//! | `right` | - | `deg_in^-1` |
//! | `both` | `deg_out^-1/2` | `deg_in^-1/2` |
//!
//! Degrees are floored at 1 and always come from the full structure the
//! layer is given, even when edge dropout prunes some edges.
//!
//! # Reference
//!
//! Velickovic et al., "Graph Attention Networks", ICLR 2018.

use crate::ops::{degree_scale, dropout, segment_softmax, Activation};
use crate::{Error, Result};
use candle_core::{Tensor, D};
use candle_nn::{Init, Linear, Module, VarBuilder};
use gatsby_core::MessageGraph;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Degree normalization mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Norm {
    #[default]
    None,
    Left,
    Right,
    Both,
}

impl Norm {
    /// Exponent applied to source out-degrees, if any.
    fn source_power(self) -> Option<f64> {
        match self {
            Self::Left => Some(1.0),
            Self::Both => Some(0.5),
            Self::None | Self::Right => None,
        }
    }

    /// Exponent applied to destination in-degrees, if any.
    fn destination_power(self) -> Option<f64> {
        match self {
            Self::Right => Some(1.0),
            Self::Both => Some(0.5),
            Self::None | Self::Left => None,
        }
    }
}

impl FromStr for Norm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "both" => Ok(Self::Both),
            other => Err(Error::InvalidConfig(format!("unknown norm '{other}'"))),
        }
    }
}

impl fmt::Display for Norm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Left => "left",
            Self::Right => "right",
            Self::Both => "both",
        })
    }
}

/// Configuration of one [`GatConv`] layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatConvConfig {
    /// Input node feature width (source and destination).
    pub in_feats: usize,
    /// Input edge feature width; 0 disables the edge attention term.
    pub edge_feats: usize,
    /// Output width per head.
    pub out_feats: usize,
    pub num_heads: usize,
    pub norm: Norm,
    pub attn_dropout: f32,
    /// Fraction of edges removed before the softmax in training mode.
    pub edge_dropout: f32,
    pub negative_slope: f64,
    /// Add a projection of the destination features instead of a bias.
    pub residual: bool,
    /// Learn a bias when there is no residual path.
    pub bias: bool,
    pub activation: Option<Activation>,
    pub use_attn_dst: bool,
    pub allow_zero_in_degree: bool,
}

impl GatConvConfig {
    pub fn new(in_feats: usize, out_feats: usize, num_heads: usize) -> Self {
        Self {
            in_feats,
            edge_feats: 0,
            out_feats,
            num_heads,
            norm: Norm::None,
            attn_dropout: 0.0,
            edge_dropout: 0.0,
            negative_slope: 0.2,
            residual: false,
            bias: true,
            activation: None,
            use_attn_dst: true,
            allow_zero_in_degree: true,
        }
    }

    pub fn with_edge_feats(mut self, edge_feats: usize) -> Self {
        self.edge_feats = edge_feats;
        self
    }

    pub fn with_norm(mut self, norm: Norm) -> Self {
        self.norm = norm;
        self
    }

    pub fn with_attn_dropout(mut self, p: f32) -> Self {
        self.attn_dropout = p;
        self
    }

    pub fn with_edge_dropout(mut self, p: f32) -> Self {
        self.edge_dropout = p;
        self
    }

    pub fn with_negative_slope(mut self, slope: f64) -> Self {
        self.negative_slope = slope;
        self
    }

    pub fn with_residual(mut self, residual: bool) -> Self {
        self.residual = residual;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_activation(mut self, activation: Option<Activation>) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_attn_dst(mut self, use_attn_dst: bool) -> Self {
        self.use_attn_dst = use_attn_dst;
        self
    }

    pub fn with_allow_zero_in_degree(mut self, allow: bool) -> Self {
        self.allow_zero_in_degree = allow;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_feats == 0 || self.out_feats == 0 || self.num_heads == 0 {
            return Err(Error::InvalidConfig(
                "in_feats, out_feats and num_heads must be > 0".into(),
            ));
        }
        for (name, p) in [("attn_dropout", self.attn_dropout), ("edge_dropout", self.edge_dropout)] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::InvalidConfig(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        Ok(())
    }
}

/// Output of [`GatConv::forward_detailed`].
#[derive(Debug, Clone)]
pub struct ConvOutput {
    /// `(num_dst, heads, out_feats)`.
    pub features: Tensor,
    /// `(num_edges, heads)` attention logits after the leaky ReLU.
    pub logits: Tensor,
    /// `(num_edges, heads)` normalized attention; dropped edges hold 0.
    pub attention: Tensor,
    /// Number of edges that took part in the softmax.
    pub kept_edges: usize,
}

/// Xavier-normal initializer for a `(fan_out, fan_in)` weight.
fn xavier_normal(fan_in: usize, fan_out: usize, gain: f64) -> Init {
    Init::Randn {
        mean: 0.0,
        stdev: gain * (2.0 / (fan_in + fan_out) as f64).sqrt(),
    }
}

fn xavier_linear(fan_in: usize, fan_out: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (fan_out, fan_in),
        "weight",
        xavier_normal(fan_in, fan_out, std::f64::consts::SQRT_2),
    )?;
    Ok(Linear::new(weight, None))
}

/// Multi-head graph attention layer.
pub struct GatConv {
    config: GatConvConfig,
    fc_src: Linear,
    fc_dst: Option<Linear>,
    bias: Option<Tensor>,
    attn_src: Linear,
    attn_dst: Option<Linear>,
    attn_edge: Option<Linear>,
}

impl GatConv {
    /// Create the layer, registering its parameters under `vb`.
    ///
    /// Weights are Xavier-normal with the ReLU gain; the bias starts at zero.
    pub fn new(config: GatConvConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let width = config.num_heads * config.out_feats;

        let fc_src = xavier_linear(config.in_feats, width, vb.pp("fc_src"))?;
        let fc_dst = if config.residual {
            Some(xavier_linear(config.in_feats, width, vb.pp("fc_dst"))?)
        } else {
            None
        };
        let bias = if !config.residual && config.bias {
            Some(vb.get_with_hints(width, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        let attn_src = xavier_linear(config.in_feats, config.num_heads, vb.pp("attn_src"))?;
        let attn_dst = if config.use_attn_dst {
            Some(xavier_linear(config.in_feats, config.num_heads, vb.pp("attn_dst"))?)
        } else {
            None
        };
        let attn_edge = if config.edge_feats > 0 {
            Some(xavier_linear(config.edge_feats, config.num_heads, vb.pp("attn_edge"))?)
        } else {
            None
        };

        Ok(Self {
            config,
            fc_src,
            fc_dst,
            bias,
            attn_src,
            attn_dst,
            attn_edge,
        })
    }

    pub fn config(&self) -> &GatConvConfig {
        &self.config
    }

    /// Toggle the zero in-degree check.
    pub fn set_allow_zero_in_degree(&mut self, allow: bool) {
        self.config.allow_zero_in_degree = allow;
    }

    /// Forward pass returning `(num_dst, heads, out_feats)`.
    ///
    /// `feat` has one row per source node; for a block its first
    /// `num_dst_nodes` rows are the destination features. `edge_feat` has one
    /// row per edge. `train` enables edge and attention dropout, which draw
    /// from `rng`.
    pub fn forward_t<G, R>(
        &self,
        graph: &G,
        feat: &Tensor,
        edge_feat: Option<&Tensor>,
        train: bool,
        rng: &mut R,
    ) -> Result<Tensor>
    where
        G: MessageGraph + ?Sized,
        R: Rng + ?Sized,
    {
        Ok(self.forward_detailed(graph, feat, edge_feat, train, rng)?.features)
    }

    /// Forward pass that also returns the attention weights.
    pub fn forward_detailed<G, R>(
        &self,
        graph: &G,
        feat: &Tensor,
        edge_feat: Option<&Tensor>,
        train: bool,
        rng: &mut R,
    ) -> Result<ConvOutput>
    where
        G: MessageGraph + ?Sized,
        R: Rng + ?Sized,
    {
        let heads = self.config.num_heads;
        let out = self.config.out_feats;
        let num_src = graph.num_src_nodes();
        let num_dst = graph.num_dst_nodes();
        let num_edges = graph.num_edges();
        let device = feat.device();

        let (rows, width) = feat.dims2()?;
        if rows != num_src {
            return Err(Error::DimensionMismatch {
                what: "source feature rows",
                expected: num_src,
                got: rows,
            });
        }
        if width != self.config.in_feats {
            return Err(Error::DimensionMismatch {
                what: "node feature width",
                expected: self.config.in_feats,
                got: width,
            });
        }

        let in_degrees = graph.in_degrees();
        if !self.config.allow_zero_in_degree {
            let count = in_degrees.iter().filter(|&&d| d == 0).count();
            if count > 0 {
                return Err(Error::ZeroInDegree { count });
            }
        }

        let feat_dst = if graph.is_block() {
            feat.narrow(0, 0, num_dst)?
        } else {
            feat.clone()
        };

        let mut h_src = self.fc_src.forward(feat)?.reshape((num_src, heads, out))?;
        if let Some(power) = self.config.norm.source_power() {
            let scale = degree_scale(&graph.out_degrees(), power, h_src.dtype(), device)?;
            h_src = h_src.broadcast_mul(&scale)?;
        }

        let src_idx = Tensor::from_slice(graph.edge_sources(), num_edges, device)?;
        let dst_idx = Tensor::from_slice(graph.edge_destinations(), num_edges, device)?;

        let mut logits = self.attn_src.forward(feat)?.index_select(&src_idx, 0)?;
        if let Some(attn_dst) = &self.attn_dst {
            logits = logits.add(&attn_dst.forward(&feat_dst)?.index_select(&dst_idx, 0)?)?;
        }
        match (&self.attn_edge, edge_feat) {
            (Some(attn_edge), Some(ef)) => {
                let ef_rows = ef.dim(0)?;
                if ef_rows != num_edges {
                    return Err(Error::DimensionMismatch {
                        what: "edge feature rows",
                        expected: num_edges,
                        got: ef_rows,
                    });
                }
                logits = logits.add(&attn_edge.forward(ef)?)?;
            }
            (None, Some(_)) => {
                return Err(Error::InvalidConfig(
                    "edge features given to a layer built with edge_feats = 0".into(),
                ));
            }
            _ => {}
        }
        let logits = candle_nn::ops::leaky_relu(&logits, self.config.negative_slope)?;

        let edge_dropout = self.config.edge_dropout;
        let (attention, used_src, used_dst, kept_idx) = if train && edge_dropout > 0.0 && num_edges > 0 {
            let keep = ((num_edges as f64) * (1.0 - f64::from(edge_dropout))).round() as usize;
            let mut kept = rand::seq::index::sample(rng, num_edges, keep).into_vec();
            kept.sort_unstable();
            let sources = graph.edge_sources();
            let destinations = graph.edge_destinations();
            let kept_src: Vec<u32> = kept.iter().map(|&e| sources[e]).collect();
            let kept_dst: Vec<u32> = kept.iter().map(|&e| destinations[e]).collect();
            let kept: Vec<u32> = kept.into_iter().map(|e| e as u32).collect();

            let kept_idx = Tensor::from_slice(&kept, kept.len(), device)?;
            let used_src = Tensor::from_slice(&kept_src, kept_src.len(), device)?;
            let used_dst = Tensor::from_slice(&kept_dst, kept_dst.len(), device)?;
            let attention = if kept.is_empty() {
                Tensor::zeros((0, heads), logits.dtype(), device)?
            } else {
                segment_softmax(&logits.index_select(&kept_idx, 0)?, &used_dst, num_dst)?
            };
            (attention, used_src, used_dst, Some(kept_idx))
        } else {
            let attention = segment_softmax(&logits, &dst_idx, num_dst)?;
            (attention, src_idx, dst_idx, None)
        };
        let attention = if train {
            dropout(&attention, self.config.attn_dropout, rng)?
        } else {
            attention
        };
        let kept_edges = attention.dim(0)?;

        let mut x = Tensor::zeros((num_dst, heads, out), h_src.dtype(), device)?;
        if kept_edges > 0 {
            let messages = h_src
                .index_select(&used_src, 0)?
                .broadcast_mul(&attention.unsqueeze(D::Minus1)?)?;
            x = x.index_add(&used_dst, &messages, 0)?;
        }

        if let Some(power) = self.config.norm.destination_power() {
            x = x.broadcast_mul(&degree_scale(&in_degrees, power, x.dtype(), device)?)?;
        }

        if let Some(fc_dst) = &self.fc_dst {
            x = x.add(&fc_dst.forward(&feat_dst)?.reshape((num_dst, heads, out))?)?;
        } else if let Some(bias) = &self.bias {
            x = x.broadcast_add(&bias.reshape((1, heads, out))?)?;
        }

        if let Some(activation) = self.config.activation {
            x = activation.apply(&x)?;
        }

        let attention = match kept_idx {
            Some(idx) if kept_edges > 0 => {
                Tensor::zeros((num_edges, heads), attention.dtype(), device)?.index_add(&idx, &attention, 0)?
            }
            Some(_) => Tensor::zeros((num_edges, heads), attention.dtype(), device)?,
            None => attention,
        };

        Ok(ConvOutput {
            features: x,
            logits,
            attention,
            kept_edges,
        })
    }
}

//! Multi-layer graph attention network.
//!
//! ```text
//! node feats ─► node encoder ─► act ─► input dropout
//!              ┌──────────────────────────────────────────────┐
//!   × L layers │ edge encoder+act ─► GatConv ─► flatten heads │
//!              │ ─► batch norm? ─► act ─► dropout             │
//!              └──────────────────────────────────────────────┘
//!           ─► prediction head ─► logits
//! ```
//!
//! The same network runs on a whole graph or on a stack of sampled blocks;
//! see [`GraphBatch`].

use crate::conv::{GatConv, GatConvConfig, Norm};
use crate::ops::{dropout, Activation};
use crate::{Error, Result};
use candle_core::Tensor;
use candle_nn::{batch_norm, linear, BatchNorm, BatchNormConfig, Linear, Module, ModuleT, VarBuilder};
use gatsby_core::{Block, Graph, MessageGraph};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Hyperparameters of a [`Gat`] network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatConfig {
    pub node_in_feats: usize,
    /// Raw edge feature width; 0 when the graph has none.
    pub edge_in_feats: usize,
    pub node_hidden_feats: usize,
    /// Encoded edge feature width; 0 disables edge features.
    pub edge_hidden_feats: usize,
    pub out_feats: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub norm: Norm,
    pub batch_norm: bool,
    pub input_dropout: f32,
    pub attn_dropout: f32,
    pub edge_dropout: f32,
    pub dropout: f32,
    pub negative_slope: f64,
    pub residual: bool,
    pub activation: Activation,
    pub use_attn_dst: bool,
    pub bias: bool,
    pub allow_zero_in_degree: bool,
}

impl Default for GatConfig {
    fn default() -> Self {
        Self {
            node_in_feats: 0,
            edge_in_feats: 0,
            node_hidden_feats: 128,
            edge_hidden_feats: 0,
            out_feats: 0,
            num_heads: 4,
            num_layers: 3,
            norm: Norm::None,
            batch_norm: false,
            input_dropout: 0.0,
            attn_dropout: 0.0,
            edge_dropout: 0.0,
            dropout: 0.0,
            negative_slope: 0.2,
            residual: false,
            activation: Activation::Relu,
            use_attn_dst: true,
            bias: true,
            allow_zero_in_degree: true,
        }
    }
}

impl GatConfig {
    /// Fill in the input and output widths.
    pub fn with_dims(mut self, node_in_feats: usize, edge_in_feats: usize, out_feats: usize) -> Self {
        self.node_in_feats = node_in_feats;
        self.edge_in_feats = edge_in_feats;
        self.out_feats = out_feats;
        self
    }

    pub fn with_hidden(mut self, node_hidden_feats: usize, edge_hidden_feats: usize) -> Self {
        self.node_hidden_feats = node_hidden_feats;
        self.edge_hidden_feats = edge_hidden_feats;
        self
    }

    pub fn with_heads(mut self, num_heads: usize) -> Self {
        self.num_heads = num_heads;
        self
    }

    pub fn with_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    pub fn with_norm(mut self, norm: Norm) -> Self {
        self.norm = norm;
        self
    }

    pub fn with_batch_norm(mut self, batch_norm: bool) -> Self {
        self.batch_norm = batch_norm;
        self
    }

    pub fn with_residual(mut self, residual: bool) -> Self {
        self.residual = residual;
        self
    }

    /// Whether layers take edge features.
    pub fn uses_edge_features(&self) -> bool {
        self.edge_in_feats > 0 && self.edge_hidden_feats > 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_in_feats == 0 || self.out_feats == 0 {
            return Err(Error::InvalidConfig("input and output widths must be > 0".into()));
        }
        if self.node_hidden_feats == 0 || self.num_heads == 0 || self.num_layers == 0 {
            return Err(Error::InvalidConfig(
                "node_hidden_feats, num_heads and num_layers must be > 0".into(),
            ));
        }
        for (name, p) in [
            ("input_dropout", self.input_dropout),
            ("attn_dropout", self.attn_dropout),
            ("edge_dropout", self.edge_dropout),
            ("dropout", self.dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::InvalidConfig(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        Ok(())
    }

    fn conv_config(&self, layer: usize) -> GatConvConfig {
        let in_feats = if layer == 0 {
            self.node_hidden_feats
        } else {
            self.num_heads * self.node_hidden_feats
        };
        let edge_feats = if self.uses_edge_features() {
            self.edge_hidden_feats
        } else {
            0
        };
        GatConvConfig::new(in_feats, self.node_hidden_feats, self.num_heads)
            .with_edge_feats(edge_feats)
            .with_norm(self.norm)
            .with_attn_dropout(self.attn_dropout)
            .with_edge_dropout(self.edge_dropout)
            .with_negative_slope(self.negative_slope)
            .with_residual(self.residual)
            .with_bias(self.bias)
            .with_attn_dst(self.use_attn_dst)
            .with_allow_zero_in_degree(self.allow_zero_in_degree)
    }
}

/// Structure a forward pass runs over.
#[derive(Debug, Clone, Copy)]
pub enum GraphBatch<'a> {
    /// The same graph at every layer.
    Full {
        graph: &'a Graph,
        /// `(num_nodes, node_in_feats)`.
        node_feats: &'a Tensor,
        /// `(num_edges, edge_in_feats)`, shared by all layers.
        edge_feats: Option<&'a Tensor>,
    },
    /// One block per layer, input side first.
    Sampled {
        blocks: &'a [Block],
        /// `(blocks[0].num_src_nodes(), node_in_feats)`.
        node_feats: &'a Tensor,
        /// One entry per block, each `(block.num_edges(), edge_in_feats)`.
        edge_feats: &'a [Option<Tensor>],
    },
}

impl<'a> GraphBatch<'a> {
    fn node_feats(&self) -> &'a Tensor {
        match *self {
            Self::Full { node_feats, .. } | Self::Sampled { node_feats, .. } => node_feats,
        }
    }

    /// Structure and edge features seen by layer `i`.
    fn layer(&self, i: usize) -> (&'a dyn MessageGraph, Option<&'a Tensor>) {
        match *self {
            Self::Full {
                graph, edge_feats, ..
            } => (graph as &dyn MessageGraph, edge_feats),
            Self::Sampled {
                blocks, edge_feats, ..
            } => (
                &blocks[i] as &dyn MessageGraph,
                edge_feats.get(i).and_then(Option::as_ref),
            ),
        }
    }

    /// Number of rows the network outputs.
    pub fn num_outputs(&self) -> usize {
        match self {
            Self::Full { graph, .. } => graph.num_nodes(),
            Self::Sampled { blocks, .. } => blocks.last().map_or(0, MessageGraph::num_dst_nodes),
        }
    }

    fn check(&self, num_layers: usize) -> Result<()> {
        if let Self::Sampled {
            blocks, edge_feats, ..
        } = self
        {
            if blocks.len() != num_layers {
                return Err(Error::InvalidConfig(format!(
                    "got {} blocks for a {num_layers}-layer network",
                    blocks.len()
                )));
            }
            if !edge_feats.is_empty() && edge_feats.len() != blocks.len() {
                return Err(Error::InvalidConfig(format!(
                    "got {} edge feature tensors for {} blocks",
                    edge_feats.len(),
                    blocks.len()
                )));
            }
        }
        Ok(())
    }
}

/// Per-layer modules.
struct GatLayer {
    edge_encoder: Option<Linear>,
    conv: GatConv,
    batch_norm: Option<BatchNorm>,
}

/// Graph attention network with a linear prediction head.
///
/// # Example
///
/// ```rust
/// use candle_core::{DType, Device};
/// use candle_nn::{VarBuilder, VarMap};
/// use gatsby_core::synthetic::{planted_partition, SyntheticConfig};
/// use gatsby_nn::{Gat, GatConfig, GraphBatch};
/// use rand::SeedableRng;
///
/// let graph = planted_partition(&SyntheticConfig::default()).unwrap();
/// let device = Device::Cpu;
/// let feats = graph.node_features().to_tensor(&device).unwrap();
///
/// let varmap = VarMap::new();
/// let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
/// let config = GatConfig::default().with_dims(16, 0, 4).with_hidden(8, 0).with_layers(2);
/// let model = Gat::new(config, vb).unwrap();
///
/// let batch = GraphBatch::Full { graph: &graph, node_feats: &feats, edge_feats: None };
/// let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(0);
/// let logits = model.forward_t(&batch, false, &mut rng).unwrap();
/// assert_eq!(logits.dims(), &[200, 4]);
/// ```
pub struct Gat {
    config: GatConfig,
    node_encoder: Linear,
    layers: Vec<GatLayer>,
    prediction: Linear,
}

impl Gat {
    pub fn new(config: GatConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let node_encoder = linear(config.node_in_feats, config.node_hidden_feats, vb.pp("node_encoder"))?;
        let width = config.num_heads * config.node_hidden_feats;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let lvb = vb.pp(format!("layers.{i}"));
            let edge_encoder = if config.uses_edge_features() {
                Some(linear(config.edge_in_feats, config.edge_hidden_feats, lvb.pp("edge_encoder"))?)
            } else {
                None
            };
            let conv = GatConv::new(config.conv_config(i), lvb.pp("conv"))?;
            let batch_norm = if config.batch_norm {
                Some(batch_norm(width, BatchNormConfig::default(), lvb.pp("batch_norm"))?)
            } else {
                None
            };
            layers.push(GatLayer {
                edge_encoder,
                conv,
                batch_norm,
            });
        }
        let prediction = linear(width, config.out_feats, vb.pp("prediction"))?;
        tracing::debug!(
            layers = config.num_layers,
            heads = config.num_heads,
            hidden = config.node_hidden_feats,
            edge_hidden = config.edge_hidden_feats,
            "built GAT"
        );

        Ok(Self {
            config,
            node_encoder,
            layers,
            prediction,
        })
    }

    pub fn config(&self) -> &GatConfig {
        &self.config
    }

    /// Logits of shape `(batch.num_outputs(), out_feats)`.
    ///
    /// `train` enables every dropout and batch-norm statistics updates; all
    /// randomness is drawn from `rng`.
    pub fn forward_t<R: Rng + ?Sized>(&self, batch: &GraphBatch<'_>, train: bool, rng: &mut R) -> Result<Tensor> {
        batch.check(self.config.num_layers)?;
        let activation = self.config.activation;

        let mut x = activation.apply(&self.node_encoder.forward(batch.node_feats())?)?;
        if train {
            x = dropout(&x, self.config.input_dropout, rng)?;
        }

        for (i, layer) in self.layers.iter().enumerate() {
            let (graph, edge_feats) = batch.layer(i);
            let edge_embedding = match (&layer.edge_encoder, edge_feats) {
                (Some(encoder), Some(ef)) => Some(activation.apply(&encoder.forward(ef)?)?),
                _ => None,
            };

            x = layer
                .conv
                .forward_t(graph, &x, edge_embedding.as_ref(), train, rng)?
                .flatten_from(1)?;
            if let Some(bn) = &layer.batch_norm {
                x = bn.forward_t(&x, train)?;
            }
            x = activation.apply(&x)?;
            if train {
                x = dropout(&x, self.config.dropout, rng)?;
            }
        }

        Ok(self.prediction.forward(&x)?)
    }
}

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

//! Graph attention layers and networks.
//!
//! `gatsby-nn` sits between the graph store (`gatsby-core`) and the training
//! loop (`gatsby-train`). Everything here is built on `candle`, so a forward
//! pass is differentiable end to end.
//!
//! # Modules
//!
//! - [`ops`]: segment softmax, RNG-driven dropout, degree scaling, activations
//! - [`conv`]: [`GatConv`], one multi-head attention layer
//! - [`model`]: [`Gat`], encoder + stacked layers + prediction head, running
//!   over either a full graph or sampled blocks ([`GraphBatch`])
//!
//! # Randomness
//!
//! Every stochastic operation (feature dropout, attention dropout, edge
//! dropout) takes an explicit `&mut impl Rng`, so a training run is
//! reproducible from its seed.

pub mod conv;
pub mod error;
pub mod model;
pub mod ops;

pub use conv::{ConvOutput, GatConv, GatConvConfig, Norm};
pub use error::{Error, Result};
pub use model::{Gat, GatConfig, GraphBatch};
pub use ops::Activation;

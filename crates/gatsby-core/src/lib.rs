// Allow minor clippy style warnings at crate level
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

//! Graph data for attention-based node classification.
//!
//! This crate holds everything a GNN needs before any tensor math happens:
//!
//! - [`Graph`] - Directed node-classification graph with node/edge features,
//!   labels and train/valid/test splits
//! - [`MessageGraph`] - Edge-list view shared by full graphs and sampled blocks
//! - [`Block`] - One bipartite layer of a sampled computation graph
//! - [`NeighborSampler`] - Multi-layer fanout sampler producing blocks
//! - [`NodeDataLoader`] - Shuffled mini-batches sampled on a worker pool
//! - [`synthetic`] - Seeded planted-partition graphs for experiments and tests
//!
//! # Full Graph vs Blocks
//!
//! ```text
//! full graph:   src nodes == dst nodes == all N nodes
//!
//! block:        src nodes = [ d0 d1 .. dk | s0 s1 .. sm ]
//!                             ^^^^^^^^^^^^
//!                             dst nodes (prefix)
//! ```
//!
//! Because destinations are a prefix of the sources, a layer can read the
//! destination-side features of a block by slicing the first `num_dst_nodes`
//! rows of its input.
//!
//! # Example
//!
//! ```rust
//! use gatsby_core::synthetic::{planted_partition, SyntheticConfig};
//! use gatsby_core::{Fanout, MessageGraph, NeighborSampler};
//! use rand::SeedableRng;
//!
//! let graph = planted_partition(&SyntheticConfig::default()).unwrap();
//! let sampler = NeighborSampler::new(vec![Fanout::Sample(5), Fanout::Sample(10)]);
//! let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(0);
//!
//! let seeds = &graph.splits().train[..8];
//! let blocks = sampler.sample_blocks(&graph, seeds, &mut rng).unwrap();
//! assert_eq!(blocks[1].num_dst_nodes(), 8);
//! ```

mod block;
mod error;
mod features;
mod graph;
pub mod loader;
pub mod sampling;
pub mod synthetic;

pub use block::{Block, MessageGraph};
pub use error::{Error, Result};
pub use features::{FeatureMatrix, NodeLabels, Splits};
pub use graph::{Graph, GraphRecord, GraphStats};
pub use loader::{mix_seed, EpochBatches, LoaderConfig, MiniBatch, NodeDataLoader};
pub use sampling::{parse_fanouts, Fanout, NeighborSampler};

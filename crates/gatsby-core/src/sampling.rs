//! Neighbor sampling for mini-batch GNN training.
//!
//! # Key Types
//!
//! - [`Fanout`] - How many in-neighbors to keep per node at one layer
//! - [`sample_block`] - Sample one bipartite layer for a set of destination nodes
//! - [`NeighborSampler`] - Multi-layer sampler producing one [`Block`] per layer
//!
//! Sampling walks from the output (seed) nodes towards the inputs: the last
//! block's destinations are the seeds, and each block's source nodes become the
//! destinations of the block before it. Blocks are returned input-side first,
//! ready to be consumed layer by layer.

use crate::block::Block;
use crate::{Error, Graph, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Per-layer neighbor budget.
///
/// Serialized as an integer where `-1` means the full neighborhood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Fanout {
    /// Keep every incoming edge.
    Full,
    /// Keep at most this many incoming edges, sampled without replacement.
    Sample(usize),
}

impl From<i64> for Fanout {
    fn from(value: i64) -> Self {
        if value < 0 {
            Self::Full
        } else {
            Self::Sample(value as usize)
        }
    }
}

impl From<Fanout> for i64 {
    fn from(value: Fanout) -> Self {
        match value {
            Fanout::Full => -1,
            Fanout::Sample(k) => k as i64,
        }
    }
}

impl FromStr for Fanout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") || s.eq_ignore_ascii_case("full") {
            return Ok(Self::Full);
        }
        s.parse::<i64>()
            .map(Self::from)
            .map_err(|_| Error::InvalidSampler(format!("bad fanout '{s}'")))
    }
}

impl fmt::Display for Fanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "-1"),
            Self::Sample(k) => write!(f, "{k}"),
        }
    }
}

/// Parse a comma separated fanout list such as `"5,10,15"`.
pub fn parse_fanouts(s: &str) -> Result<Vec<Fanout>> {
    s.split(',').filter(|p| !p.trim().is_empty()).map(str::parse).collect()
}

/// Sample one block whose destination nodes are `dst_nodes`.
///
/// Duplicate destinations are collapsed (first occurrence wins). For each
/// destination up to `fanout` incoming edges are drawn without replacement;
/// their sources are appended to the source list after the destination
/// prefix, each distinct node once.
pub fn sample_block<R: Rng + ?Sized>(
    graph: &Graph,
    dst_nodes: &[u32],
    fanout: Fanout,
    rng: &mut R,
) -> Block {
    let mut src_nodes: Vec<u32> = Vec::with_capacity(dst_nodes.len());
    let mut local: HashMap<u32, u32> = HashMap::with_capacity(dst_nodes.len() * 2);
    for &v in dst_nodes {
        if !local.contains_key(&v) {
            local.insert(v, src_nodes.len() as u32);
            src_nodes.push(v);
        }
    }
    let num_dst = src_nodes.len();

    let mut edge_src = Vec::new();
    let mut edge_dst = Vec::new();
    let mut edge_ids = Vec::new();

    for dst_local in 0..num_dst {
        let v = src_nodes[dst_local];
        let incoming: Vec<(u32, u32)> = graph.in_edges(v).collect();
        let chosen: Vec<(u32, u32)> = match fanout {
            Fanout::Sample(k) if incoming.len() > k => {
                incoming.choose_multiple(rng, k).copied().collect()
            }
            _ => incoming,
        };

        for (eid, s) in chosen {
            let s_local = *local.entry(s).or_insert_with(|| {
                src_nodes.push(s);
                (src_nodes.len() - 1) as u32
            });
            edge_src.push(s_local);
            edge_dst.push(dst_local as u32);
            edge_ids.push(eid);
        }
    }

    Block {
        src_nodes,
        num_dst,
        edge_src,
        edge_dst,
        edge_ids,
    }
}

/// Multi-layer neighbor sampler.
///
/// `fanouts[i]` is the budget of layer `i`, counted from the input side, so
/// `fanouts.last()` applies to the seed nodes.
///
/// # Example
///
/// ```rust
/// use gatsby_core::{FeatureMatrix, Graph, MessageGraph};
/// use gatsby_core::sampling::{Fanout, NeighborSampler};
/// use rand::SeedableRng;
///
/// let feats = FeatureMatrix::zeros(4, 2);
/// let g = Graph::from_edges(feats, &[(1, 0), (2, 0), (3, 1), (3, 2)]).unwrap();
///
/// let sampler = NeighborSampler::new(vec![Fanout::Full, Fanout::Sample(1)]);
/// let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(7);
/// let blocks = sampler.sample_blocks(&g, &[0], &mut rng).unwrap();
///
/// assert_eq!(blocks.len(), 2);
/// assert_eq!(blocks[1].dst_nodes(), &[0]);
/// assert_eq!(blocks[1].num_edges(), 1);
/// assert_eq!(blocks[0].dst_nodes(), blocks[1].src_nodes());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSampler {
    fanouts: Vec<Fanout>,
}

impl NeighborSampler {
    pub fn new(fanouts: Vec<Fanout>) -> Self {
        Self { fanouts }
    }

    pub fn fanouts(&self) -> &[Fanout] {
        &self.fanouts
    }

    pub fn num_layers(&self) -> usize {
        self.fanouts.len()
    }

    /// Sample one block per layer for `seeds`, input-side block first.
    pub fn sample_blocks<R: Rng + ?Sized>(
        &self,
        graph: &Graph,
        seeds: &[u32],
        rng: &mut R,
    ) -> Result<Vec<Block>> {
        if self.fanouts.is_empty() {
            return Err(Error::InvalidSampler("no fanouts configured".into()));
        }
        let num_nodes = graph.num_nodes();
        if let Some(&bad) = seeds.iter().find(|&&s| s as usize >= num_nodes) {
            return Err(Error::NodeOutOfRange {
                node: bad as usize,
                num_nodes,
            });
        }

        let mut blocks = Vec::with_capacity(self.fanouts.len());
        let mut frontier = seeds.to_vec();
        for &fanout in self.fanouts.iter().rev() {
            let block = sample_block(graph, &frontier, fanout, rng);
            frontier = block.src_nodes.clone();
            blocks.push(block);
        }
        blocks.reverse();
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FeatureMatrix, MessageGraph};
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    /// Star: nodes 1..=5 all point at node 0; node 6 points at node 1.
    fn star() -> Graph {
        let feats = FeatureMatrix::zeros(7, 1);
        Graph::from_edges(feats, &[(1, 0), (2, 0), (3, 0), (4, 0), (5, 0), (6, 1)]).unwrap()
    }

    #[test]
    fn test_fanout_parse() {
        assert_eq!("all".parse::<Fanout>().unwrap(), Fanout::Full);
        assert_eq!("-1".parse::<Fanout>().unwrap(), Fanout::Full);
        assert_eq!(
            parse_fanouts("5, 10,15").unwrap(),
            vec![Fanout::Sample(5), Fanout::Sample(10), Fanout::Sample(15)]
        );
        assert!("x".parse::<Fanout>().is_err());
    }

    #[test]
    fn test_fanout_serde_as_integer() {
        let json = serde_json::to_string(&vec![Fanout::Full, Fanout::Sample(3)]).unwrap();
        assert_eq!(json, "[-1,3]");
        let back: Vec<Fanout> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![Fanout::Full, Fanout::Sample(3)]);
    }

    #[test]
    fn test_sample_block_respects_fanout() {
        let g = star();
        let mut rng = XorShiftRng::seed_from_u64(1);
        let block = sample_block(&g, &[0], Fanout::Sample(2), &mut rng);
        assert_eq!(block.num_dst_nodes(), 1);
        assert_eq!(block.num_edges(), 2);
        assert_eq!(block.num_src_nodes(), 3);
        assert_eq!(block.src_nodes()[0], 0);
    }

    #[test]
    fn test_full_fanout_keeps_all_edges() {
        let g = star();
        let mut rng = XorShiftRng::seed_from_u64(1);
        let block = sample_block(&g, &[0, 1], Fanout::Full, &mut rng);
        assert_eq!(block.num_edges(), 6);
        assert_eq!(block.in_degrees(), vec![5, 1]);
        // 0 and 1 are destinations; 1 is also a source of node 0
        assert_eq!(block.num_src_nodes(), 7);
    }

    #[test]
    fn test_duplicate_destinations_collapse() {
        let g = star();
        let mut rng = XorShiftRng::seed_from_u64(3);
        let block = sample_block(&g, &[1, 1, 0], Fanout::Full, &mut rng);
        assert_eq!(block.dst_nodes(), &[1, 0]);
    }

    #[test]
    fn test_edge_ids_point_to_parent_edges() {
        let g = star();
        let mut rng = XorShiftRng::seed_from_u64(9);
        let block = sample_block(&g, &[0], Fanout::Sample(3), &mut rng);
        for e in 0..block.num_edges() {
            let (s, d) = g.edge(block.edge_ids()[e] as usize);
            assert_eq!(block.src_nodes()[block.edge_sources()[e] as usize], s);
            assert_eq!(block.dst_nodes()[block.edge_destinations()[e] as usize], d);
        }
    }

    #[test]
    fn test_multi_layer_alignment() {
        let g = star();
        let sampler = NeighborSampler::new(vec![Fanout::Full, Fanout::Sample(2)]);
        let mut rng = XorShiftRng::seed_from_u64(5);
        let blocks = sampler.sample_blocks(&g, &[0], &mut rng).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].dst_nodes(), blocks[1].src_nodes());
        assert_eq!(blocks[1].dst_nodes(), &[0]);
    }

    #[test]
    fn test_seed_out_of_range() {
        let g = star();
        let sampler = NeighborSampler::new(vec![Fanout::Full]);
        let mut rng = XorShiftRng::seed_from_u64(5);
        assert!(sampler.sample_blocks(&g, &[99], &mut rng).is_err());
    }
}

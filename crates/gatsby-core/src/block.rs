//! Message graphs: the structure a convolution layer propagates over.
//!
//! A full [`Graph`](crate::Graph) and a sampled [`Block`] both expose a flat
//! edge list with local source/destination indices. For a block the
//! destination nodes are the first `num_dst_nodes` source nodes, so the
//! destination slice of a source feature tensor is a plain prefix.

use crate::{Error, Result};

/// Edge-list view consumed by message-passing layers.
pub trait MessageGraph {
    /// Number of rows expected in the source feature tensor.
    fn num_src_nodes(&self) -> usize;

    /// Number of destination (output) nodes.
    fn num_dst_nodes(&self) -> usize;

    /// Local source index of every edge.
    fn edge_sources(&self) -> &[u32];

    /// Local destination index of every edge.
    fn edge_destinations(&self) -> &[u32];

    fn num_edges(&self) -> usize {
        self.edge_sources().len()
    }

    /// In-degree of every destination node.
    fn in_degrees(&self) -> Vec<usize> {
        let mut degrees = vec![0usize; self.num_dst_nodes()];
        for &d in self.edge_destinations() {
            degrees[d as usize] += 1;
        }
        degrees
    }

    /// Out-degree of every source node.
    fn out_degrees(&self) -> Vec<usize> {
        let mut degrees = vec![0usize; self.num_src_nodes()];
        for &s in self.edge_sources() {
            degrees[s as usize] += 1;
        }
        degrees
    }

    /// Whether destination nodes are a strict prefix of the source nodes.
    fn is_block(&self) -> bool {
        false
    }
}

/// One layer of a sampled computation graph.
///
/// `src_nodes` holds global node ids; its first `num_dst` entries are the
/// destination nodes. Edge endpoints are local indices into `src_nodes`
/// (sources) and into its destination prefix (destinations). `edge_ids` maps
/// each block edge back to the parent graph so edge features can be gathered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub(crate) src_nodes: Vec<u32>,
    pub(crate) num_dst: usize,
    pub(crate) edge_src: Vec<u32>,
    pub(crate) edge_dst: Vec<u32>,
    pub(crate) edge_ids: Vec<u32>,
}

impl Block {
    /// Build a block from explicit parts.
    ///
    /// The first `num_dst` entries of `src_nodes` are the destination nodes.
    /// Edge endpoints are local indices; all three edge arrays must have the
    /// same length.
    pub fn new(
        src_nodes: Vec<u32>,
        num_dst: usize,
        edge_src: Vec<u32>,
        edge_dst: Vec<u32>,
        edge_ids: Vec<u32>,
    ) -> Result<Self> {
        if num_dst > src_nodes.len() {
            return Err(Error::InvalidGraph(format!(
                "{num_dst} destination nodes but only {} source nodes",
                src_nodes.len()
            )));
        }
        let num_edges = edge_src.len();
        for (what, got) in [("edge destinations", edge_dst.len()), ("edge ids", edge_ids.len())] {
            if got != num_edges {
                return Err(Error::RowCount {
                    what,
                    expected: num_edges,
                    got,
                });
            }
        }
        if let Some(&s) = edge_src.iter().find(|&&s| s as usize >= src_nodes.len()) {
            return Err(Error::NodeOutOfRange {
                node: s as usize,
                num_nodes: src_nodes.len(),
            });
        }
        if let Some(&d) = edge_dst.iter().find(|&&d| d as usize >= num_dst) {
            return Err(Error::NodeOutOfRange {
                node: d as usize,
                num_nodes: num_dst,
            });
        }
        Ok(Self {
            src_nodes,
            num_dst,
            edge_src,
            edge_dst,
            edge_ids,
        })
    }

    /// Global ids of all source nodes (destination prefix first).
    pub fn src_nodes(&self) -> &[u32] {
        &self.src_nodes
    }

    /// Global ids of the destination nodes.
    pub fn dst_nodes(&self) -> &[u32] {
        &self.src_nodes[..self.num_dst]
    }

    /// Parent-graph edge id of every block edge.
    pub fn edge_ids(&self) -> &[u32] {
        &self.edge_ids
    }
}

impl MessageGraph for Block {
    fn num_src_nodes(&self) -> usize {
        self.src_nodes.len()
    }

    fn num_dst_nodes(&self) -> usize {
        self.num_dst
    }

    fn edge_sources(&self) -> &[u32] {
        &self.edge_src
    }

    fn edge_destinations(&self) -> &[u32] {
        &self.edge_dst
    }

    fn is_block(&self) -> bool {
        true
    }
}

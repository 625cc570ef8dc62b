use crate::block::MessageGraph;
use crate::features::{FeatureMatrix, NodeLabels, Splits};
use crate::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// A node-classification graph.
///
/// Directed multigraph with per-node features, optional per-edge features,
/// optional labels and train/valid/test splits. Edge ids are insertion order
/// and index rows of the edge feature matrix.
///
/// Uses petgraph's directed graph internally for incoming-edge traversal
/// during neighbor sampling; the flat `src`/`dst` arrays back the
/// [`MessageGraph`] view used by full-graph message passing.
///
/// # Example
///
/// ```rust
/// use gatsby_core::{FeatureMatrix, Graph, MessageGraph};
///
/// let feats = FeatureMatrix::zeros(3, 4);
/// let g = Graph::from_edges(feats, &[(0, 1), (2, 1)]).unwrap();
///
/// assert_eq!(g.num_edges(), 2);
/// assert_eq!(g.in_degree(1), 2);
/// assert_eq!(g.in_degrees(), vec![0, 2, 0]);
/// ```
#[derive(Debug, Clone)]
pub struct Graph {
    adjacency: DiGraph<(), ()>,
    src: Vec<u32>,
    dst: Vec<u32>,
    node_features: FeatureMatrix,
    edge_features: Option<FeatureMatrix>,
    labels: Option<NodeLabels>,
    splits: Splits,
}

/// Summary statistics of a [`Graph`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphStats {
    pub num_nodes: usize,
    pub num_edges: usize,
    pub node_feature_dim: usize,
    pub edge_feature_dim: Option<usize>,
    pub num_outputs: Option<usize>,
    pub multi_label: bool,
    pub train_size: usize,
    pub valid_size: usize,
    pub test_size: usize,
    pub zero_in_degree: usize,
    pub self_loops: usize,
    pub mean_in_degree: f64,
}

/// On-disk form of a graph (JSON or bincode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    pub num_nodes: usize,
    pub edges: Vec<(u32, u32)>,
    pub node_features: FeatureMatrix,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_features: Option<FeatureMatrix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<NodeLabels>,
    #[serde(default)]
    pub splits: Splits,
}

impl Graph {
    /// Graph with the given node features and no edges.
    pub fn new(node_features: FeatureMatrix) -> Self {
        let num_nodes = node_features.rows();
        let mut adjacency = DiGraph::with_capacity(num_nodes, 0);
        for _ in 0..num_nodes {
            adjacency.add_node(());
        }
        Self {
            adjacency,
            src: Vec::new(),
            dst: Vec::new(),
            node_features,
            edge_features: None,
            labels: None,
            splits: Splits::default(),
        }
    }

    /// Graph with the given node features and `(src, dst)` edges.
    pub fn from_edges(node_features: FeatureMatrix, edges: &[(u32, u32)]) -> Result<Self> {
        let mut graph = Self::new(node_features);
        graph.adjacency.reserve_edges(edges.len());
        graph.src.reserve(edges.len());
        graph.dst.reserve(edges.len());
        for &(s, d) in edges {
            graph.push_edge(s, d)?;
        }
        Ok(graph)
    }

    fn push_edge(&mut self, src: u32, dst: u32) -> Result<usize> {
        let num_nodes = self.num_nodes();
        for node in [src, dst] {
            if node as usize >= num_nodes {
                return Err(Error::NodeOutOfRange {
                    node: node as usize,
                    num_nodes,
                });
            }
        }
        let id = self
            .adjacency
            .add_edge(NodeIndex::new(src as usize), NodeIndex::new(dst as usize), ())
            .index();
        self.src.push(src);
        self.dst.push(dst);
        Ok(id)
    }

    /// Attach per-edge features; one row per edge, in edge-id order.
    pub fn with_edge_features(mut self, features: FeatureMatrix) -> Result<Self> {
        if features.rows() != self.num_edges() {
            return Err(Error::RowCount {
                what: "edge features",
                expected: self.num_edges(),
                got: features.rows(),
            });
        }
        self.edge_features = Some(features);
        Ok(self)
    }

    pub fn with_labels(mut self, labels: NodeLabels) -> Result<Self> {
        labels.validate(self.num_nodes())?;
        self.labels = Some(labels);
        Ok(self)
    }

    pub fn with_splits(mut self, splits: Splits) -> Result<Self> {
        splits.validate(self.num_nodes())?;
        self.splits = splits;
        Ok(self)
    }

    pub fn num_nodes(&self) -> usize {
        self.node_features.rows()
    }

    pub fn node_features(&self) -> &FeatureMatrix {
        &self.node_features
    }

    pub fn edge_features(&self) -> Option<&FeatureMatrix> {
        self.edge_features.as_ref()
    }

    pub fn labels(&self) -> Option<&NodeLabels> {
        self.labels.as_ref()
    }

    pub fn splits(&self) -> &Splits {
        &self.splits
    }

    /// Endpoints of edge `id`.
    pub fn edge(&self, id: usize) -> (u32, u32) {
        (self.src[id], self.dst[id])
    }

    /// Incoming edges of `node` as `(edge_id, source)` pairs.
    pub fn in_edges(&self, node: u32) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.adjacency
            .edges_directed(NodeIndex::new(node as usize), Direction::Incoming)
            .map(|e| (e.id().index() as u32, e.source().index() as u32))
    }

    pub fn in_degree(&self, node: u32) -> usize {
        self.adjacency
            .edges_directed(NodeIndex::new(node as usize), Direction::Incoming)
            .count()
    }

    pub fn out_degree(&self, node: u32) -> usize {
        self.adjacency
            .edges_directed(NodeIndex::new(node as usize), Direction::Outgoing)
            .count()
    }

    /// Append the reverse of every edge (edge features are duplicated).
    pub fn with_reverse_edges(self) -> Result<Self> {
        let mut record = self.into_record();
        let forward = record.edges.clone();
        record.edges.extend(forward.iter().map(|&(s, d)| (d, s)));
        if let Some(features) = record.edge_features.as_mut() {
            let originals = features.clone();
            for i in 0..originals.rows() {
                features.push_row(originals.row(i));
            }
        }
        Self::from_record(record)
    }

    /// Drop existing self loops and add exactly one per node.
    ///
    /// New self-loop edges get all-zero edge features.
    pub fn with_self_loops(self) -> Result<Self> {
        let record = self.into_record();
        let num_nodes = record.num_nodes;
        let mut edges = Vec::with_capacity(record.edges.len() + num_nodes);
        let mut edge_features = record
            .edge_features
            .as_ref()
            .map(|f| FeatureMatrix::zeros(0, f.dim()));

        for (i, &(s, d)) in record.edges.iter().enumerate() {
            if s == d {
                continue;
            }
            edges.push((s, d));
            if let (Some(out), Some(src)) = (edge_features.as_mut(), record.edge_features.as_ref()) {
                out.push_row(src.row(i));
            }
        }
        for v in 0..num_nodes as u32 {
            edges.push((v, v));
            if let Some(out) = edge_features.as_mut() {
                let zeros = vec![0.0; out.dim()];
                out.push_row(&zeros);
            }
        }

        Self::from_record(GraphRecord {
            edges,
            edge_features,
            ..record
        })
    }

    /// Number of nodes without incoming edges.
    pub fn zero_in_degree_count(&self) -> usize {
        self.in_degrees().iter().filter(|&&d| d == 0).count()
    }

    pub fn stats(&self) -> GraphStats {
        let num_nodes = self.num_nodes();
        GraphStats {
            num_nodes,
            num_edges: self.num_edges(),
            node_feature_dim: self.node_features.dim(),
            edge_feature_dim: self.edge_features.as_ref().map(FeatureMatrix::dim),
            num_outputs: self.labels.as_ref().map(NodeLabels::num_outputs),
            multi_label: self.labels.as_ref().is_some_and(NodeLabels::is_multi_label),
            train_size: self.splits.train.len(),
            valid_size: self.splits.valid.len(),
            test_size: self.splits.test.len(),
            zero_in_degree: self.zero_in_degree_count(),
            self_loops: self.src.iter().zip(&self.dst).filter(|(s, d)| s == d).count(),
            mean_in_degree: if num_nodes == 0 {
                0.0
            } else {
                self.num_edges() as f64 / num_nodes as f64
            },
        }
    }

    /// Validate a record and build the graph from it.
    pub fn from_record(record: GraphRecord) -> Result<Self> {
        record.node_features.validate()?;
        if record.node_features.rows() != record.num_nodes {
            return Err(Error::RowCount {
                what: "node features",
                expected: record.num_nodes,
                got: record.node_features.rows(),
            });
        }
        let mut graph = Self::from_edges(record.node_features, &record.edges)?;
        if let Some(features) = record.edge_features {
            features.validate()?;
            graph = graph.with_edge_features(features)?;
        }
        if let Some(labels) = record.labels {
            graph = graph.with_labels(labels)?;
        }
        graph.with_splits(record.splits)
    }

    pub fn into_record(self) -> GraphRecord {
        GraphRecord {
            num_nodes: self.num_nodes(),
            edges: self.src.into_iter().zip(self.dst).collect(),
            node_features: self.node_features,
            edge_features: self.edge_features,
            labels: self.labels,
            splits: self.splits,
        }
    }

    /// Load from a JSON [`GraphRecord`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let record: GraphRecord = serde_json::from_reader(reader)?;
        Self::from_record(record)
    }

    /// Save as a JSON [`GraphRecord`].
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &self.clone().into_record())?;
        Ok(())
    }

    /// Load from binary file (bincode).
    pub fn from_binary_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let record: GraphRecord = bincode::deserialize_from(reader)?;
        Self::from_record(record)
    }

    /// Save to binary file (bincode).
    pub fn to_binary_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, &self.clone().into_record())?;
        Ok(())
    }

    /// Load by extension: `.bin` is bincode, anything else JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("bin") => Self::from_binary_file(path),
            _ => Self::from_json_file(path),
        }
    }

    /// Save by extension: `.bin` is bincode, anything else JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("bin") => self.to_binary_file(path),
            _ => self.to_json_file(path),
        }
    }
}

impl MessageGraph for Graph {
    fn num_src_nodes(&self) -> usize {
        self.num_nodes()
    }

    fn num_dst_nodes(&self) -> usize {
        self.num_nodes()
    }

    fn edge_sources(&self) -> &[u32] {
        &self.src
    }

    fn edge_destinations(&self) -> &[u32] {
        &self.dst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_graph() -> Graph {
        // 0 -> 1 -> 2, plus a self loop on 2
        let feats = FeatureMatrix::from_rows(&[vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let edge_feats = FeatureMatrix::from_rows(&[vec![0.5], vec![0.25], vec![1.0]]).unwrap();
        Graph::from_edges(feats, &[(0, 1), (1, 2), (2, 2)])
            .unwrap()
            .with_edge_features(edge_feats)
            .unwrap()
    }

    #[test]
    fn test_rejects_dangling_edge() {
        let feats = FeatureMatrix::zeros(2, 1);
        let err = Graph::from_edges(feats, &[(0, 5)]).unwrap_err();
        assert!(matches!(err, Error::NodeOutOfRange { node: 5, .. }));
    }

    #[test]
    fn test_edge_feature_rows_must_match() {
        let feats = FeatureMatrix::zeros(2, 1);
        let g = Graph::from_edges(feats, &[(0, 1)]).unwrap();
        assert!(g.with_edge_features(FeatureMatrix::zeros(2, 3)).is_err());
    }

    #[test]
    fn test_degrees_and_in_edges() {
        let g = path_graph();
        assert_eq!(g.in_degrees(), vec![0, 1, 2]);
        assert_eq!(g.out_degrees(), vec![1, 1, 1]);
        assert_eq!(g.out_degree(2), 1);
        let mut incoming: Vec<_> = g.in_edges(2).collect();
        incoming.sort_unstable();
        assert_eq!(incoming, vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn test_reverse_edges_duplicate_features() {
        let g = path_graph().with_reverse_edges().unwrap();
        assert_eq!(g.num_edges(), 6);
        assert_eq!(g.edge(3), (1, 0));
        let ef = g.edge_features().unwrap();
        assert_eq!(ef.row(3), ef.row(0));
        assert_eq!(g.zero_in_degree_count(), 0);
    }

    #[test]
    fn test_self_loops_replace_existing() {
        let g = path_graph().with_self_loops().unwrap();
        // two non-loop edges + one loop per node
        assert_eq!(g.num_edges(), 5);
        assert_eq!(g.stats().self_loops, 3);
        assert_eq!(g.zero_in_degree_count(), 0);
        let ef = g.edge_features().unwrap();
        assert_eq!(ef.rows(), 5);
        assert_eq!(ef.row(1), &[0.25]);
        assert_eq!(ef.row(4), &[0.0]);
    }

    #[test]
    fn test_record_roundtrip_json_and_binary() {
        let dir = tempfile::tempdir().unwrap();
        let g = path_graph()
            .with_labels(NodeLabels::Classes {
                num_classes: 2,
                values: vec![0, 1, 1],
            })
            .unwrap()
            .with_splits(Splits {
                train: vec![0],
                valid: vec![1],
                test: vec![2],
            })
            .unwrap();

        for name in ["g.json", "g.bin"] {
            let path = dir.path().join(name);
            g.save(&path).unwrap();
            let back = Graph::load(&path).unwrap();
            assert_eq!(back.num_edges(), g.num_edges());
            assert_eq!(back.labels(), g.labels());
            assert_eq!(back.splits(), g.splits());
            assert_eq!(back.edge_features(), g.edge_features());
        }
    }

    #[test]
    fn test_record_rejects_bad_split() {
        let record = GraphRecord {
            num_nodes: 2,
            edges: vec![(0, 1)],
            node_features: FeatureMatrix::zeros(2, 1),
            edge_features: None,
            labels: None,
            splits: Splits {
                train: vec![3],
                ..Splits::default()
            },
        };
        assert!(Graph::from_record(record).is_err());
    }
}

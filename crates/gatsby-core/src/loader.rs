//! Mini-batch data loading with a fixed-size sampling worker pool.
//!
//! Each epoch shuffles the seed nodes, cuts them into batches and samples the
//! blocks of every batch on a `rayon` pool. While the consumer trains on one
//! window of `num_workers` batches, the next window is already being sampled.
//!
//! Every batch draws from its own RNG derived from `(seed, epoch, batch)`, so
//! batch contents and order are reproducible regardless of worker count.

use crate::block::Block;
use crate::sampling::NeighborSampler;
use crate::{Error, Graph, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

/// Loader configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Seeds per batch (default: 512).
    pub batch_size: usize,
    /// Shuffle seeds every epoch (default: true).
    pub shuffle: bool,
    /// Drop the trailing partial batch (default: false).
    pub drop_last: bool,
    /// Sampling worker threads, also the prefetch window (default: 4).
    pub num_workers: usize,
    /// Base random seed (default: 13).
    pub seed: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            shuffle: true,
            drop_last: false,
            num_workers: 4,
            seed: 13,
        }
    }
}

impl LoaderConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Sampled computation graph for one batch of seed nodes.
#[derive(Debug, Clone)]
pub struct MiniBatch {
    /// Position of this batch within its epoch.
    pub index: usize,
    /// One block per layer, input side first.
    pub blocks: Vec<Block>,
}

impl MiniBatch {
    /// Global ids whose raw features feed the first layer.
    pub fn input_nodes(&self) -> &[u32] {
        self.blocks.first().map_or(&[], Block::src_nodes)
    }

    /// Global ids of the nodes the last layer produces outputs for.
    pub fn output_nodes(&self) -> &[u32] {
        self.blocks.last().map_or(&[], Block::dst_nodes)
    }
}

/// Iterates mini-batches of sampled blocks over a fixed seed set.
pub struct NodeDataLoader {
    graph: Arc<Graph>,
    sampler: Arc<NeighborSampler>,
    seeds: Vec<u32>,
    config: LoaderConfig,
    pool: Arc<ThreadPool>,
}

impl NodeDataLoader {
    pub fn new(
        graph: Arc<Graph>,
        seeds: Vec<u32>,
        sampler: NeighborSampler,
        config: LoaderConfig,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::InvalidSampler("batch_size must be > 0".into()));
        }
        if config.num_workers == 0 {
            return Err(Error::InvalidSampler("num_workers must be > 0".into()));
        }
        if sampler.num_layers() == 0 {
            return Err(Error::InvalidSampler("no fanouts configured".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers)
            .thread_name(|i| format!("gatsby-sampler-{i}"))
            .build()
            .map_err(|e| Error::InvalidSampler(format!("worker pool: {e}")))?;

        Ok(Self {
            graph,
            sampler: Arc::new(sampler),
            seeds,
            config,
            pool: Arc::new(pool),
        })
    }

    pub fn num_seeds(&self) -> usize {
        self.seeds.len()
    }

    pub fn num_batches(&self) -> usize {
        let full = self.seeds.len() / self.config.batch_size;
        if self.config.drop_last || self.seeds.len() % self.config.batch_size == 0 {
            full
        } else {
            full + 1
        }
    }

    /// Seed chunks of `epoch`, after the per-epoch shuffle.
    fn epoch_chunks(&self, epoch: u64) -> Vec<Vec<u32>> {
        let mut order = self.seeds.clone();
        if self.config.shuffle {
            let mut rng = XorShiftRng::seed_from_u64(mix_seed(self.config.seed, epoch, u64::MAX));
            order.shuffle(&mut rng);
        }
        order
            .chunks(self.config.batch_size)
            .take(self.num_batches())
            .map(<[u32]>::to_vec)
            .collect()
    }

    /// Batches of one epoch, sampled ahead on the worker pool.
    pub fn epoch(&self, epoch: u64) -> EpochBatches {
        EpochBatches {
            graph: Arc::clone(&self.graph),
            sampler: Arc::clone(&self.sampler),
            pool: Arc::clone(&self.pool),
            chunks: Arc::new(self.epoch_chunks(epoch)),
            window: self.config.num_workers,
            seed: self.config.seed,
            epoch,
            next_window: 0,
            ready: VecDeque::new(),
            in_flight: None,
        }
    }
}

/// Iterator over the mini-batches of one epoch.
pub struct EpochBatches {
    graph: Arc<Graph>,
    sampler: Arc<NeighborSampler>,
    pool: Arc<ThreadPool>,
    chunks: Arc<Vec<Vec<u32>>>,
    window: usize,
    seed: u64,
    epoch: u64,
    next_window: usize,
    ready: VecDeque<Result<MiniBatch>>,
    in_flight: Option<Receiver<Vec<Result<MiniBatch>>>>,
}

impl EpochBatches {
    fn has_pending_window(&self) -> bool {
        self.next_window * self.window < self.chunks.len()
    }

    /// Start sampling the next window in the background.
    fn launch_next(&mut self) {
        if self.in_flight.is_some() || !self.has_pending_window() {
            return;
        }
        let start = self.next_window * self.window;
        let end = (start + self.window).min(self.chunks.len());
        self.next_window += 1;

        let (tx, rx) = mpsc::channel();
        let graph = Arc::clone(&self.graph);
        let sampler = Arc::clone(&self.sampler);
        let chunks = Arc::clone(&self.chunks);
        let (seed, epoch) = (self.seed, self.epoch);

        // Runs on the pool, so the parallel iterator fans out over its workers.
        self.pool.spawn(move || {
            let batches: Vec<Result<MiniBatch>> = (start..end)
                .into_par_iter()
                .map(|i| sample_batch(&graph, &sampler, &chunks[i], seed, epoch, i))
                .collect();
            // The receiver is gone only if the epoch iterator was dropped early.
            let _ = tx.send(batches);
        });
        self.in_flight = Some(rx);
    }
}

impl Iterator for EpochBatches {
    type Item = Result<MiniBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ready.is_empty() {
            self.launch_next();
            let rx = self.in_flight.take()?;
            match rx.recv() {
                Ok(batches) => self.ready.extend(batches),
                Err(_) => {
                    return Some(Err(Error::InvalidSampler(
                        "sampling worker terminated".into(),
                    )))
                }
            }
            // Overlap: sample the following window while this one is consumed.
            self.launch_next();
        }
        self.ready.pop_front()
    }
}

fn sample_batch(
    graph: &Graph,
    sampler: &NeighborSampler,
    seeds: &[u32],
    seed: u64,
    epoch: u64,
    index: usize,
) -> Result<MiniBatch> {
    let mut rng = XorShiftRng::seed_from_u64(mix_seed(seed, epoch, index as u64));
    let blocks = sampler.sample_blocks(graph, seeds, &mut rng)?;
    tracing::trace!(epoch, batch = index, seeds = seeds.len(), "sampled batch");
    Ok(MiniBatch { index, blocks })
}

/// SplitMix64-style mixing of `(seed, epoch, stream)` into one RNG seed.
pub fn mix_seed(seed: u64, epoch: u64, stream: u64) -> u64 {
    let mut z = seed
        .wrapping_add(epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(stream.wrapping_mul(0xD1B5_4A32_D192_ED03));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::Fanout;
    use crate::FeatureMatrix;

    fn ring(n: u32) -> Arc<Graph> {
        let edges: Vec<(u32, u32)> = (0..n).flat_map(|i| [(i, (i + 1) % n), ((i + 1) % n, i)]).collect();
        Arc::new(Graph::from_edges(FeatureMatrix::zeros(n as usize, 2), &edges).unwrap())
    }

    fn loader(workers: usize) -> NodeDataLoader {
        NodeDataLoader::new(
            ring(50),
            (0..23).collect(),
            NeighborSampler::new(vec![Fanout::Sample(1), Fanout::Sample(2)]),
            LoaderConfig::default()
                .with_batch_size(5)
                .with_num_workers(workers)
                .with_seed(11),
        )
        .unwrap()
    }

    #[test]
    fn test_covers_every_seed_once() {
        let loader = loader(3);
        assert_eq!(loader.num_batches(), 5);
        let mut seen: Vec<u32> = loader
            .epoch(0)
            .flat_map(|b| b.unwrap().output_nodes().to_vec())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..23).collect::<Vec<_>>());
    }

    #[test]
    fn test_batches_are_in_order() {
        let indices: Vec<usize> = loader(2).epoch(1).map(|b| b.unwrap().index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_worker_count_does_not_change_batches() {
        let a: Vec<Vec<Block>> = loader(1).epoch(4).map(|b| b.unwrap().blocks).collect();
        let b: Vec<Vec<Block>> = loader(4).epoch(4).map(|b| b.unwrap().blocks).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_epochs_shuffle_differently() {
        let l = loader(2);
        let first: Vec<u32> = l.epoch(0).flat_map(|b| b.unwrap().output_nodes().to_vec()).collect();
        let second: Vec<u32> = l.epoch(1).flat_map(|b| b.unwrap().output_nodes().to_vec()).collect();
        assert_ne!(first, second);
    }

    #[test]
    fn test_drop_last() {
        let l = NodeDataLoader::new(
            ring(10),
            (0..7).collect(),
            NeighborSampler::new(vec![Fanout::Full]),
            LoaderConfig {
                batch_size: 3,
                drop_last: true,
                ..LoaderConfig::default()
            },
        )
        .unwrap();
        assert_eq!(l.num_batches(), 2);
        assert_eq!(l.epoch(0).count(), 2);
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let res = NodeDataLoader::new(
            ring(4),
            vec![0],
            NeighborSampler::new(vec![Fanout::Full]),
            LoaderConfig::default().with_batch_size(0),
        );
        assert!(res.is_err());
    }
}

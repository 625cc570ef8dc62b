//! Property-based tests for graph construction and neighbor sampling.
//!
//! These tests verify invariants that should hold for any graph:
//! - Block destinations are a prefix of block sources
//! - Sampled in-degrees never exceed the fanout
//! - Block edges map back to real parent edges
//! - Consecutive blocks line up layer to layer

use gatsby_core::{Fanout, FeatureMatrix, Graph, MessageGraph, NeighborSampler};
use proptest::prelude::*;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

/// Random graph with up to 30 nodes and 120 edges (duplicates and loops allowed).
fn arb_graph() -> impl Strategy<Value = Graph> {
    (2u32..30).prop_flat_map(|n| {
        prop::collection::vec((0..n, 0..n), 0..120).prop_map(move |edges| {
            Graph::from_edges(FeatureMatrix::zeros(n as usize, 1), &edges).unwrap()
        })
    })
}

fn arb_fanout() -> impl Strategy<Value = Fanout> {
    prop_oneof![Just(Fanout::Full), (0usize..6).prop_map(Fanout::Sample)]
}

mod sampler_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn dst_is_prefix_and_fanout_bounded(
            g in arb_graph(),
            fanouts in prop::collection::vec(arb_fanout(), 1..4),
            seed in any::<u64>(),
        ) {
            let n = g.num_nodes() as u32;
            let seeds: Vec<u32> = (0..n).step_by(3).collect();
            let sampler = NeighborSampler::new(fanouts.clone());
            let mut rng = XorShiftRng::seed_from_u64(seed);
            let blocks = sampler.sample_blocks(&g, &seeds, &mut rng).unwrap();

            prop_assert_eq!(blocks.len(), fanouts.len());
            prop_assert_eq!(blocks.last().unwrap().dst_nodes(), seeds.as_slice());

            for (block, fanout) in blocks.iter().zip(&fanouts) {
                prop_assert_eq!(&block.src_nodes()[..block.num_dst_nodes()], block.dst_nodes());
                for (local, &deg) in block.in_degrees().iter().enumerate() {
                    let full = g.in_degree(block.dst_nodes()[local]);
                    match fanout {
                        Fanout::Full => prop_assert_eq!(deg, full),
                        Fanout::Sample(k) => prop_assert_eq!(deg, full.min(*k)),
                    }
                }
            }
            for pair in blocks.windows(2) {
                prop_assert_eq!(pair[0].dst_nodes(), pair[1].src_nodes());
            }
        }

        #[test]
        fn block_edges_exist_in_parent(
            g in arb_graph(),
            fanout in arb_fanout(),
            seed in any::<u64>(),
        ) {
            let seeds: Vec<u32> = (0..g.num_nodes() as u32).collect();
            let mut rng = XorShiftRng::seed_from_u64(seed);
            let block = gatsby_core::sampling::sample_block(&g, &seeds, fanout, &mut rng);

            let mut ids = block.edge_ids().to_vec();
            ids.sort_unstable();
            ids.dedup();
            prop_assert_eq!(ids.len(), block.num_edges(), "edge sampled twice");

            for e in 0..block.num_edges() {
                let (s, d) = g.edge(block.edge_ids()[e] as usize);
                prop_assert_eq!(block.src_nodes()[block.edge_sources()[e] as usize], s);
                prop_assert_eq!(block.dst_nodes()[block.edge_destinations()[e] as usize], d);
            }
        }
    }
}

mod graph_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn self_loops_remove_zero_in_degree(g in arb_graph()) {
            let n = g.num_nodes();
            let looped = g.with_self_loops().unwrap();
            prop_assert_eq!(looped.zero_in_degree_count(), 0);
            prop_assert_eq!(looped.stats().self_loops, n);
        }

        #[test]
        fn reverse_edges_double_count(g in arb_graph()) {
            let e = g.num_edges();
            let expected: Vec<usize> = g
                .in_degrees()
                .iter()
                .zip(g.out_degrees())
                .map(|(i, o)| i + o)
                .collect();
            let reversed = g.with_reverse_edges().unwrap();
            prop_assert_eq!(reversed.num_edges(), 2 * e);
            prop_assert_eq!(reversed.in_degrees(), expected);
        }
    }
}

// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use divan::counter::ItemsCount;
use netdiag::latency::LatencyMatrix;
use netdiag::strategy::graph::{GraphConstructor, KmeansClustering, LatencyOptimization, kmeans};
use rand::prelude::*;

fn main() {
    // run registered benchmarks.
    divan::main();
}

/// Random symmetric round-trip times between 1 and 300 ms.
fn random_latencies(peers: usize) -> LatencyMatrix {
    let mut rng = rand::rng();
    let mut rows = vec![vec![Duration::ZERO; peers]; peers];
    for i in 0..peers {
        for j in (i + 1)..peers {
            let rtt = Duration::from_micros(rng.random_range(1_000..300_000));
            rows[i][j] = rtt;
            rows[j][i] = rtt;
        }
    }
    LatencyMatrix::from_rows(rows)
}

#[divan::bench(args = [50, 200, 1000])]
fn kmeans_points(bencher: divan::Bencher, points: usize) {
    bencher
        .counter(ItemsCount::new(points))
        .with_inputs(|| {
            let mut rng = rand::rng();
            (0..points)
                .map(|_| (0..8).map(|_| rng.random_range(0.0..300.0)).collect::<Vec<f64>>())
                .collect::<Vec<_>>()
        })
        .bench_refs(|points| kmeans::cluster(points, 6).unwrap());
}

#[divan::bench(args = [50, 200])]
fn kmeans_clustering(bencher: divan::Bencher, peers: usize) {
    bencher
        .with_inputs(|| random_latencies(peers))
        .bench_refs(|matrix| KmeansClustering::relative(6).construct(0, peers, matrix).unwrap());
}

#[divan::bench(args = [20, 50, 100])]
fn latency_optimization(bencher: divan::Bencher, peers: usize) {
    bencher
        .counter(ItemsCount::new(peers))
        .with_inputs(|| random_latencies(peers))
        .bench_refs(|matrix| LatencyOptimization::new(10).construct(0, peers, matrix).unwrap());
}

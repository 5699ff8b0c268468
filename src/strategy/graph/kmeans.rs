// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic k-means clustering.
//!
//! Seeding uses k-means++ with a fixed RNG seed, so every node computes the
//! same clusters from the same latency matrix. Refinement then runs Lloyd's
//! algorithm until assignments stop changing.

use rand::distr::weighted::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;

use crate::latency::GraphError;

const SEED: u64 = 0x6b6d_6561_6e73;
const MAX_ITERATIONS: usize = 100;

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index of the centroid closest to `point`, ties going to the lower index.
fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let distance = squared_distance(point, centroid);
        if distance < best_distance {
            best = i;
            best_distance = distance;
        }
    }
    best
}

fn seed_centroids(points: &[Vec<f64>], k: usize) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut centroids = vec![points[rng.random_range(0..points.len())].clone()];
    while centroids.len() < k {
        let weights: Vec<f64> = points
            .iter()
            .map(|p| squared_distance(p, &centroids[nearest(p, &centroids)]))
            .collect();
        // all remaining points coincide with a centroid
        let Ok(index) = WeightedIndex::new(&weights) else {
            break;
        };
        centroids.push(points[index.sample(&mut rng)].clone());
    }
    centroids
}

/// Partitions `points` into at most `k` clusters of point indices.
///
/// Empty clusters are dropped. Clusters are ordered by their lowest member,
/// members in ascending order.
///
/// # Errors
///
/// Returns [`GraphError::TooFewPeers`] if there are no points or `k` is zero,
/// and [`GraphError::InconsistentDimensions`] if points differ in length.
pub fn cluster(points: &[Vec<f64>], k: usize) -> Result<Vec<Vec<usize>>, GraphError> {
    if points.is_empty() || k == 0 {
        return Err(GraphError::TooFewPeers(points.len()));
    }
    let dim = points[0].len();
    if points.iter().any(|p| p.len() != dim) {
        return Err(GraphError::InconsistentDimensions);
    }

    let k = k.min(points.len());
    let mut centroids = seed_centroids(points, k);
    let mut assignment: Vec<usize> = points.iter().map(|p| nearest(p, &centroids)).collect();
    for _ in 0..MAX_ITERATIONS {
        for (c, centroid) in centroids.iter_mut().enumerate() {
            let mut count = 0usize;
            let mut sum = vec![0.0; dim];
            for (point, _) in points.iter().zip(&assignment).filter(|&(_, &a)| a == c) {
                count += 1;
                for (s, x) in sum.iter_mut().zip(point) {
                    *s += x;
                }
            }
            if count > 0 {
                *centroid = sum.into_iter().map(|s| s / count as f64).collect();
            }
        }
        let next: Vec<usize> = points.iter().map(|p| nearest(p, &centroids)).collect();
        if next == assignment {
            break;
        }
        assignment = next;
    }

    let mut clusters = vec![Vec::new(); centroids.len()];
    for (point, c) in assignment.into_iter().enumerate() {
        clusters[c].push(point);
    }
    clusters.retain(|members| !members.is_empty());
    clusters.sort_unstable_by_key(|members| members[0]);
    Ok(clusters)
}

use indexmap::IndexMap;

use crate::partitioning::partition::Restriction;

const PRIME_FACTORS: [u32; 5] = [11, 7, 5, 3, 2];
const MIN_LAST_DIM_EXTENT: u64 = 32;
const EPSILON: f64 = 1e-12;
const MAX_TILES: u64 = 256;
const MAX_TILES_PER_PIECE: u64 = 16;

/// Chooses how many pieces each axis of a store is split into.
#[derive(Debug)]
pub(crate) struct PartitionManager {
    min_shard_volume: u64,
    factors: IndexMap<u32, Vec<u32>>,
}

impl PartitionManager {
    pub fn new(min_shard_volume: u64) -> Self {
        Self {
            min_shard_volume: min_shard_volume.max(1),
            factors: IndexMap::new(),
        }
    }

    fn get_factors(&mut self, num_pieces: u32) -> Vec<u32> {
        self.factors
            .entry(num_pieces)
            .or_insert_with(|| {
                let mut remaining = num_pieces;
                let mut factors = vec![];
                for prime in PRIME_FACTORS {
                    while remaining > 0 && remaining % prime == 0 {
                        factors.push(prime);
                        remaining /= prime;
                    }
                }
                factors
            })
            .clone()
    }

    /// The color shape of a tiling of `extents` over `num_pieces` processors,
    /// or `None` when the store should not be partitioned.
    pub fn compute_launch_shape(
        &mut self,
        num_pieces: u32,
        restrictions: &[Restriction],
        extents: &[u64],
    ) -> Option<Vec<u64>> {
        if num_pieces <= 1 || extents.iter().all(|e| *e == 1) {
            return None;
        }
        let mut shape = vec![];
        let mut dims = vec![];
        let mut volume = 1u64;
        for (d, extent) in extents.iter().enumerate() {
            if *extent == 1 || restrictions.get(d) == Some(&Restriction::Forbid) {
                continue;
            }
            shape.push(*extent);
            dims.push(d);
            volume *= extent;
        }
        let max_pieces = volume.div_ceil(self.min_shard_volume);
        if max_pieces <= 1 || shape.is_empty() {
            return None;
        }
        let max_pieces = u64::from(num_pieces);
        let result = match shape.len() {
            1 => vec![shape[0].min(max_pieces)],
            2 => Self::split_2d(&shape, volume, max_pieces),
            _ => self.split_nd(&shape, num_pieces, max_pieces),
        };
        let mut launch_shape = vec![1; extents.len()];
        for (d, n) in dims.into_iter().zip(result) {
            launch_shape[d] = n;
        }
        Some(launch_shape)
    }

    /// Splits two axes into pieces as close to square as possible.
    fn split_2d(shape: &[u64], volume: u64, max_pieces: u64) -> Vec<u64> {
        if volume < max_pieces {
            return shape.to_vec();
        }
        let (mut nx, mut ny) = (shape[0], shape[1]);
        let swap = nx > ny;
        if swap {
            std::mem::swap(&mut nx, &mut ny);
        }
        let n = ((max_pieces * nx) as f64 / ny as f64).sqrt();
        let mut n1 = ((n + EPSILON).floor() as u64).max(1);
        while max_pieces % n1 != 0 {
            n1 -= 1;
        }
        let mut n2 = ((n - EPSILON).floor() as u64).max(1);
        while max_pieces % n2 != 0 {
            n2 += 1;
        }
        let side1 = (nx / n1).max(ny / (max_pieces / n1));
        let side2 = (nx / n2).max(ny / (max_pieces / n2));
        let px = if side1 <= side2 { n1 } else { n2 };
        let py = max_pieces / px;
        if swap {
            vec![py.min(shape[0]), px.min(shape[1])]
        } else {
            vec![px.min(shape[0]), py.min(shape[1])]
        }
    }

    /// Distributes the prime factors of the piece count round-robin onto the largest axis,
    /// keeping the last axis at least 32 elements long where possible.
    fn split_nd(&mut self, shape: &[u64], num_pieces: u32, max_pieces: u64) -> Vec<u64> {
        let ndim = shape.len();
        let mut result = vec![1u64; ndim];
        let mut product = 1u64;
        for factor in self.get_factors(num_pieces) {
            let factor = u64::from(factor);
            if factor * product > max_pieces {
                break;
            }
            product *= factor;
            let remaining = shape
                .iter()
                .zip(&result)
                .map(|(s, r)| s.div_ceil(*r))
                .collect::<Vec<_>>();
            let big_dim = argmax(&remaining);
            if big_dim < ndim - 1 {
                result[big_dim] *= factor;
            } else if remaining[big_dim] / factor >= MIN_LAST_DIM_EXTENT {
                result[big_dim] *= factor;
            } else {
                let next_big_dim = argmax(&remaining[..ndim - 1]);
                if remaining[next_big_dim] / factor > 0 {
                    result[next_big_dim] *= factor;
                } else {
                    result[big_dim] *= factor;
                }
            }
        }
        result
    }

    pub fn compute_tile_shape(extents: &[u64], launch_shape: &[u64]) -> Vec<u64> {
        extents
            .iter()
            .zip(launch_shape)
            .map(|(e, l)| e.div_ceil(*l))
            .collect()
    }

    /// Whether a tiling has few enough tiles to be treated as a complete partition.
    pub fn use_complete_tiling(extents: &[u64], tile_shape: &[u64], num_pieces: u32) -> bool {
        let num_tiles = extents
            .iter()
            .zip(tile_shape)
            .map(|(e, t)| if *t == 0 { 0 } else { e / t })
            .product::<u64>();
        num_tiles <= MAX_TILES || num_tiles <= MAX_TILES_PER_PIECE * u64::from(num_pieces)
    }
}

/// The index of the first maximum.
fn argmax(values: &[u64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(ndim: usize) -> Vec<Restriction> {
        vec![Restriction::Allow; ndim]
    }

    #[test]
    fn test_single_piece_or_point() {
        let mut manager = PartitionManager::new(1);
        assert_eq!(manager.compute_launch_shape(1, &allow(1), &[100]), None);
        assert_eq!(manager.compute_launch_shape(4, &allow(2), &[1, 1]), None);
    }

    #[test]
    fn test_one_dim() {
        let mut manager = PartitionManager::new(1);
        assert_eq!(manager.compute_launch_shape(4, &allow(1), &[100]), Some(vec![4]));
        assert_eq!(manager.compute_launch_shape(8, &allow(1), &[3]), Some(vec![3]));
        assert_eq!(
            manager.compute_launch_shape(4, &allow(2), &[10, 1]),
            Some(vec![4, 1])
        );
    }

    #[test]
    fn test_min_shard_volume() {
        let mut manager = PartitionManager::new(1000);
        assert_eq!(manager.compute_launch_shape(4, &allow(1), &[1000]), None);
        assert_eq!(manager.compute_launch_shape(4, &allow(1), &[1001]), Some(vec![4]));
    }

    #[test]
    fn test_two_dims() {
        let mut manager = PartitionManager::new(1);
        assert_eq!(
            manager.compute_launch_shape(4, &allow(2), &[100, 100]),
            Some(vec![2, 2])
        );
        assert_eq!(
            manager.compute_launch_shape(4, &allow(2), &[1000, 10]),
            Some(vec![4, 1])
        );
        assert_eq!(
            manager.compute_launch_shape(8, &allow(2), &[2, 2]),
            Some(vec![2, 2])
        );
    }

    #[test]
    fn test_forbidden_axes() {
        let mut manager = PartitionManager::new(1);
        let restrictions = [Restriction::Forbid, Restriction::Allow, Restriction::Allow];
        assert_eq!(
            manager.compute_launch_shape(4, &restrictions, &[100, 10, 10]),
            Some(vec![1, 2, 2])
        );
        let all = [Restriction::Forbid; 2];
        assert_eq!(manager.compute_launch_shape(4, &all, &[100, 10]), None);
    }

    #[test]
    fn test_three_dims() {
        let mut manager = PartitionManager::new(1);
        assert_eq!(
            manager.compute_launch_shape(8, &allow(3), &[64, 64, 64]),
            Some(vec![2, 2, 2])
        );
        assert_eq!(
            manager.compute_launch_shape(6, &allow(3), &[10, 10, 100]),
            Some(vec![2, 1, 3])
        );
    }

    #[test]
    fn test_tile_shape() {
        assert_eq!(
            PartitionManager::compute_tile_shape(&[10, 7], &[4, 2]),
            vec![3, 4]
        );
        assert!(PartitionManager::use_complete_tiling(&[100], &[1], 8));
        assert!(!PartitionManager::use_complete_tiling(&[1000], &[1], 8));
    }
}

//! Symbolic views over the storage of a store. Each transform maps coordinates of its parent
//! (the side closer to the storage) to coordinates of the child store.

use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::operation::projection::SymbolicExpr;
use crate::partitioning::partition::{Partition, Restriction, Tiling};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreTransform {
    /// Restricts axis `dim` to `start..start + extent`.
    Slice { dim: usize, start: i64, extent: u64 },
    /// Inserts a broadcast axis of size `extent` at `dim`.
    Promote { dim: usize, extent: u64 },
    /// Fixes axis `dim` at `coord` and removes it.
    Project { dim: usize, coord: i64 },
    /// Child axis `i` is parent axis `axes[i]`.
    Transpose { axes: Vec<usize> },
    /// Splits axis `dim` into axes of the given sizes in C order.
    Delinearize { dim: usize, sizes: Vec<u64> },
}

fn inner_strides(sizes: &[u64]) -> Vec<i64> {
    let mut strides = vec![1i64; sizes.len()];
    for k in (0..sizes.len().saturating_sub(1)).rev() {
        strides[k] = strides[k + 1] * sizes[k + 1] as i64;
    }
    strides
}

fn split(value: i64, sizes: &[u64]) -> Vec<i64> {
    inner_strides(sizes)
        .iter()
        .zip(sizes)
        .map(|(s, n)| (value / s).rem_euclid((*n).max(1) as i64))
        .collect()
}

fn inverse_axes(axes: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; axes.len()];
    for (i, a) in axes.iter().enumerate() {
        inverse[*a] = i;
    }
    inverse
}

fn permute<T: Clone>(values: &[T], axes: &[usize]) -> Vec<T> {
    axes.iter().map(|a| values[*a].clone()).collect()
}

impl StoreTransform {
    pub fn transform_shape(&self, shape: &[u64]) -> Vec<u64> {
        let mut shape = shape.to_vec();
        match self {
            StoreTransform::Slice { dim, extent, .. } => shape[*dim] = *extent,
            StoreTransform::Promote { dim, extent } => shape.insert(*dim, *extent),
            StoreTransform::Project { dim, .. } => {
                shape.remove(*dim);
            }
            StoreTransform::Transpose { axes } => shape = permute(&shape, axes),
            StoreTransform::Delinearize { dim, sizes } => {
                shape.splice(*dim..*dim + 1, sizes.iter().copied());
            }
        }
        shape
    }

    /// Maps a point of the child store to the parent.
    pub fn invert_point(&self, point: &[i64]) -> Vec<i64> {
        let mut point = point.to_vec();
        match self {
            StoreTransform::Slice { dim, start, .. } => point[*dim] += start,
            StoreTransform::Promote { dim, .. } => {
                point.remove(*dim);
            }
            StoreTransform::Project { dim, coord } => point.insert(*dim, *coord),
            StoreTransform::Transpose { axes } => point = permute(&point, &inverse_axes(axes)),
            StoreTransform::Delinearize { dim, sizes } => {
                let linear = point[*dim..*dim + sizes.len()]
                    .iter()
                    .zip(inner_strides(sizes))
                    .map(|(x, s)| x * s)
                    .sum();
                point.splice(*dim..*dim + sizes.len(), [linear]);
            }
        }
        point
    }

    /// Maps a rectangle of the parent to the child. Slices clip the rectangle.
    pub fn transform_rect(&self, lo: &[i64], hi: &[i64]) -> (Vec<i64>, Vec<i64>) {
        let (mut lo, mut hi) = (lo.to_vec(), hi.to_vec());
        match self {
            StoreTransform::Slice { dim, start, extent } => {
                lo[*dim] = (lo[*dim] - start).max(0);
                hi[*dim] = (hi[*dim] - start).min(*extent as i64 - 1);
            }
            StoreTransform::Promote { dim, extent } => {
                lo.insert(*dim, 0);
                hi.insert(*dim, *extent as i64 - 1);
            }
            StoreTransform::Project { dim, .. } => {
                lo.remove(*dim);
                hi.remove(*dim);
            }
            StoreTransform::Transpose { axes } => {
                lo = permute(&lo, axes);
                hi = permute(&hi, axes);
            }
            StoreTransform::Delinearize { dim, sizes } => {
                let (l, h) = (lo[*dim], hi[*dim]);
                if h < l {
                    lo.splice(*dim..*dim + 1, vec![0; sizes.len()]);
                    hi.splice(*dim..*dim + 1, vec![-1; sizes.len()]);
                } else {
                    lo.splice(*dim..*dim + 1, split(l, sizes));
                    hi.splice(*dim..*dim + 1, split(h, sizes));
                }
            }
        }
        (lo, hi)
    }

    /// Maps a rectangle of the child to the parent. The corners map independently
    /// since every transform is monotonic.
    pub fn invert_rect(&self, lo: &[i64], hi: &[i64]) -> (Vec<i64>, Vec<i64>) {
        (self.invert_point(lo), self.invert_point(hi))
    }

    /// Derives the restrictions of the child from those of the parent.
    pub fn transform_restrictions(&self, restrictions: &[Restriction]) -> Vec<Restriction> {
        let mut restrictions = restrictions.to_vec();
        match self {
            StoreTransform::Slice { .. } => {}
            StoreTransform::Promote { dim, .. } => restrictions.insert(*dim, Restriction::Forbid),
            StoreTransform::Project { dim, .. } => {
                restrictions.remove(*dim);
            }
            StoreTransform::Transpose { axes } => restrictions = permute(&restrictions, axes),
            StoreTransform::Delinearize { dim, sizes } => {
                let mut replacement = vec![Restriction::Forbid; sizes.len()];
                replacement[0] = restrictions[*dim];
                restrictions.splice(*dim..*dim + 1, replacement);
            }
        }
        restrictions
    }

    /// Maps a partition of the child to a partition of the parent.
    pub fn invert_partition(&self, partition: &Partition) -> CoreResult<Partition> {
        let tiling = match partition {
            Partition::NoPartition => return Ok(Partition::NoPartition),
            Partition::Tiling(x) => x,
            x => {
                return Err(CoreError::unsupported(format!(
                    "inverting {x} through {self}"
                )))
            }
        };
        let mut tile = tiling.tile_shape().to_vec();
        let mut colors = tiling.color_shape().to_vec();
        let mut offsets = tiling.offsets().to_vec();
        let mut strides = tiling.strides().to_vec();
        match self {
            StoreTransform::Slice { dim, start, .. } => offsets[*dim] += start,
            StoreTransform::Promote { dim, .. } => {
                if colors[*dim] != 1 {
                    return Err(CoreError::invalid(format!(
                        "promoted axis {dim} cannot be partitioned"
                    )));
                }
                tile.remove(*dim);
                colors.remove(*dim);
                offsets.remove(*dim);
                strides.remove(*dim);
            }
            StoreTransform::Project { dim, coord } => {
                tile.insert(*dim, 1);
                colors.insert(*dim, 1);
                offsets.insert(*dim, *coord);
                strides.insert(*dim, 1);
            }
            StoreTransform::Transpose { axes } => {
                let inverse = inverse_axes(axes);
                tile = permute(&tile, &inverse);
                colors = permute(&colors, &inverse);
                offsets = permute(&offsets, &inverse);
                strides = permute(&strides, &inverse);
            }
            StoreTransform::Delinearize { dim, sizes } => {
                let n = sizes.len();
                if colors[*dim + 1..*dim + n].iter().any(|c| *c != 1) {
                    return Err(CoreError::invalid(format!(
                        "only the leading axis of delinearized axis {dim} can be partitioned"
                    )));
                }
                let inner = sizes[1..].iter().product::<u64>();
                tile.splice(*dim..*dim + n, [tile[*dim] * inner]);
                colors.splice(*dim..*dim + n, [colors[*dim]]);
                offsets.splice(*dim..*dim + n, [offsets[*dim] * inner as i64]);
                strides.splice(*dim..*dim + n, [strides[*dim] * inner]);
            }
        }
        Ok(Partition::Tiling(Tiling::with_strides(
            tile, colors, offsets, strides,
        )))
    }

    /// Maps a partition of the parent to the child, if the child can express it.
    pub fn convert_partition(&self, partition: &Partition) -> Option<Partition> {
        let tiling = match partition {
            Partition::NoPartition => return Some(Partition::NoPartition),
            Partition::Tiling(x) => x,
            _ => return None,
        };
        let mut tile = tiling.tile_shape().to_vec();
        let mut colors = tiling.color_shape().to_vec();
        let mut offsets = tiling.offsets().to_vec();
        let mut strides = tiling.strides().to_vec();
        match self {
            StoreTransform::Slice { dim, start, .. } => offsets[*dim] -= start,
            StoreTransform::Promote { dim, extent } => {
                tile.insert(*dim, *extent);
                colors.insert(*dim, 1);
                offsets.insert(*dim, 0);
                strides.insert(*dim, *extent);
            }
            StoreTransform::Project { dim, .. } => {
                if colors[*dim] != 1 {
                    return None;
                }
                tile.remove(*dim);
                colors.remove(*dim);
                offsets.remove(*dim);
                strides.remove(*dim);
            }
            StoreTransform::Transpose { axes } => {
                tile = permute(&tile, axes);
                colors = permute(&colors, axes);
                offsets = permute(&offsets, axes);
                strides = permute(&strides, axes);
            }
            StoreTransform::Delinearize { dim, sizes } => {
                if colors[*dim] != 1 || offsets[*dim] != 0 {
                    return None;
                }
                tile.splice(*dim..*dim + 1, sizes.iter().copied());
                colors.splice(*dim..*dim + 1, vec![1; sizes.len()]);
                offsets.splice(*dim..*dim + 1, vec![0; sizes.len()]);
                strides.splice(*dim..*dim + 1, sizes.iter().copied());
            }
        }
        Some(Partition::Tiling(Tiling::with_strides(
            tile, colors, offsets, strides,
        )))
    }

    /// Maps the color expressions of the child to the parent.
    pub fn invert_symbolic_point(&self, exprs: Vec<SymbolicExpr>) -> Vec<SymbolicExpr> {
        let mut exprs = exprs;
        match self {
            StoreTransform::Slice { .. } => {}
            StoreTransform::Promote { dim, .. } => {
                exprs.remove(*dim);
            }
            StoreTransform::Project { dim, .. } => exprs.insert(*dim, SymbolicExpr::Const(0)),
            StoreTransform::Transpose { axes } => exprs = permute(&exprs, &inverse_axes(axes)),
            StoreTransform::Delinearize { dim, sizes } => {
                exprs.drain(*dim + 1..*dim + sizes.len());
            }
        }
        exprs
    }
}

impl fmt::Display for StoreTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreTransform::Slice { dim, start, extent } => {
                write!(f, "Slice(dim: {dim}, start: {start}, extent: {extent})")
            }
            StoreTransform::Promote { dim, extent } => {
                write!(f, "Promote(dim: {dim}, extent: {extent})")
            }
            StoreTransform::Project { dim, coord } => {
                write!(f, "Project(dim: {dim}, coord: {coord})")
            }
            StoreTransform::Transpose { axes } => write!(f, "Transpose({axes:?})"),
            StoreTransform::Delinearize { dim, sizes } => {
                write!(f, "Delinearize(dim: {dim}, sizes: {sizes:?})")
            }
        }
    }
}

/// The transforms of a store, in the order they apply starting from the storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TransformStack(Vec<StoreTransform>);

impl TransformStack {
    pub fn identity() -> Self {
        Self(vec![])
    }

    pub fn push(&self, transform: StoreTransform) -> Self {
        let mut transforms = self.0.clone();
        transforms.push(transform);
        Self(transforms)
    }

    pub fn is_identity(&self) -> bool {
        self.0.is_empty()
    }

    pub fn transforms(&self) -> &[StoreTransform] {
        &self.0
    }

    pub fn transform_shape(&self, shape: &[u64]) -> Vec<u64> {
        self.0
            .iter()
            .fold(shape.to_vec(), |shape, t| t.transform_shape(&shape))
    }

    pub fn invert_point(&self, point: &[i64]) -> Vec<i64> {
        self.0
            .iter()
            .rev()
            .fold(point.to_vec(), |point, t| t.invert_point(&point))
    }

    pub fn transform_rect(&self, lo: &[i64], hi: &[i64]) -> (Vec<i64>, Vec<i64>) {
        self.0
            .iter()
            .fold((lo.to_vec(), hi.to_vec()), |(lo, hi), t| {
                t.transform_rect(&lo, &hi)
            })
    }

    pub fn invert_rect(&self, lo: &[i64], hi: &[i64]) -> (Vec<i64>, Vec<i64>) {
        self.0
            .iter()
            .rev()
            .fold((lo.to_vec(), hi.to_vec()), |(lo, hi), t| t.invert_rect(&lo, &hi))
    }

    pub fn restrictions(&self, storage_ndim: usize) -> Vec<Restriction> {
        self.0.iter().fold(
            vec![Restriction::Allow; storage_ndim],
            |restrictions, t| t.transform_restrictions(&restrictions),
        )
    }

    pub fn invert_partition(&self, partition: &Partition) -> CoreResult<Partition> {
        self.0
            .iter()
            .rev()
            .try_fold(partition.clone(), |p, t| t.invert_partition(&p))
    }

    pub fn convert_partition(&self, partition: &Partition) -> Option<Partition> {
        self.0
            .iter()
            .try_fold(partition.clone(), |p, t| t.convert_partition(&p))
    }

    pub fn invert_symbolic_point(&self, exprs: Vec<SymbolicExpr>) -> Vec<SymbolicExpr> {
        self.0
            .iter()
            .rev()
            .fold(exprs, |exprs, t| t.invert_symbolic_point(exprs))
    }
}

impl fmt::Display for TransformStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, t) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{t}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_and_promote() {
        let stack = TransformStack::identity()
            .push(StoreTransform::Project { dim: 0, coord: 3 })
            .push(StoreTransform::Promote { dim: 1, extent: 5 });
        assert_eq!(stack.transform_shape(&[10, 4]), vec![4, 5]);
        assert_eq!(stack.invert_point(&[2, 4]), vec![3, 2]);
        assert_eq!(
            stack.restrictions(2),
            vec![Restriction::Allow, Restriction::Forbid]
        );
        let partition = Partition::tiling(vec![2, 5], vec![2, 1], vec![0, 0]);
        assert_eq!(
            stack.invert_partition(&partition).ok(),
            Some(Partition::Tiling(Tiling::with_strides(
                vec![1, 2],
                vec![1, 2],
                vec![3, 0],
                vec![1, 2]
            )))
        );
    }

    #[test]
    fn test_transpose_round_trip() {
        let stack =
            TransformStack::identity().push(StoreTransform::Transpose { axes: vec![2, 0, 1] });
        assert_eq!(stack.transform_shape(&[3, 4, 5]), vec![5, 3, 4]);
        assert_eq!(stack.invert_point(&[4, 2, 3]), vec![2, 3, 4]);
        let partition = Partition::tiling(vec![5, 2, 2], vec![1, 2, 2], vec![0, 0, 0]);
        let inverted = stack.invert_partition(&partition).ok();
        assert_eq!(
            inverted.as_ref().and_then(|x| stack.convert_partition(x)),
            Some(partition)
        );
    }

    #[test]
    fn test_delinearize() {
        let transform = StoreTransform::Delinearize {
            dim: 0,
            sizes: vec![3, 4],
        };
        assert_eq!(transform.transform_shape(&[12, 2]), vec![3, 4, 2]);
        assert_eq!(transform.invert_point(&[2, 1, 0]), vec![9, 0]);
        assert_eq!(
            transform.transform_rect(&[4, 0], &[11, 1]),
            (vec![1, 0, 0], vec![2, 3, 1])
        );
        let leading = Partition::tiling(vec![1, 4, 2], vec![3, 1, 1], vec![0, 0, 0]);
        assert_eq!(
            transform.invert_partition(&leading).ok(),
            Some(Partition::tiling(vec![4, 2], vec![3, 1], vec![0, 0]))
        );
        let inner = Partition::tiling(vec![3, 2, 2], vec![1, 2, 1], vec![0, 0, 0]);
        assert!(transform.invert_partition(&inner).is_err());
    }

    #[test]
    fn test_slice() {
        let transform = StoreTransform::Slice {
            dim: 0,
            start: 2,
            extent: 5,
        };
        assert_eq!(transform.transform_shape(&[10]), vec![5]);
        assert_eq!(transform.invert_point(&[0]), vec![2]);
        assert_eq!(transform.transform_rect(&[0], &[9]), (vec![0], vec![4]));
        let partition = Partition::tiling(vec![3], vec![2], vec![0]);
        assert_eq!(
            transform.invert_partition(&partition).ok(),
            Some(Partition::tiling(vec![3], vec![2], vec![2]))
        );
    }
}

use std::fmt;

use crate::domain::{Domain, Point};
use crate::error::{CoreError, CoreResult};

/// Whether an axis of a store may be partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Restriction {
    Allow,
    Forbid,
}

/// Joins the restrictions of two stores that share a partition.
pub fn join_restrictions(lhs: &mut [Restriction], rhs: &[Restriction]) {
    for (l, r) in lhs.iter_mut().zip(rhs) {
        if *r == Restriction::Forbid {
            *l = Restriction::Forbid;
        }
    }
}

/// A regular decomposition into tiles. Tile `c` starts at `offsets + c * strides`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tiling {
    tile_shape: Vec<u64>,
    color_shape: Vec<u64>,
    offsets: Vec<i64>,
    strides: Vec<u64>,
}

impl Tiling {
    pub fn new(tile_shape: Vec<u64>, color_shape: Vec<u64>, offsets: Vec<i64>) -> Self {
        let strides = tile_shape.clone();
        Self {
            tile_shape,
            color_shape,
            offsets,
            strides,
        }
    }

    pub fn with_strides(
        tile_shape: Vec<u64>,
        color_shape: Vec<u64>,
        offsets: Vec<i64>,
        strides: Vec<u64>,
    ) -> Self {
        Self {
            tile_shape,
            color_shape,
            offsets,
            strides,
        }
    }

    pub fn tile_shape(&self) -> &[u64] {
        &self.tile_shape
    }

    pub fn color_shape(&self) -> &[u64] {
        &self.color_shape
    }

    pub fn offsets(&self) -> &[i64] {
        &self.offsets
    }

    pub fn strides(&self) -> &[u64] {
        &self.strides
    }

    pub fn ndim(&self) -> usize {
        self.tile_shape.len()
    }

    /// Whether the tiles are pairwise disjoint.
    pub fn is_disjoint(&self) -> bool {
        self.tile_shape
            .iter()
            .zip(&self.strides)
            .zip(&self.color_shape)
            .all(|((t, s), c)| *c <= 1 || t <= s)
    }

    pub fn child_domain(&self, color: &Point, bounds: &Domain) -> CoreResult<Domain> {
        let colors = Domain::from_extents(&self.color_shape);
        if !colors.contains(color) {
            return Err(CoreError::invalid(format!(
                "color {color} is outside of color space {colors}"
            )));
        }
        let lo = (0..self.ndim())
            .map(|d| self.offsets[d] + color[d] * self.strides[d] as i64)
            .collect::<Vec<_>>();
        let child = Domain::from_origin(&lo, &self.tile_shape);
        Ok(bounds.intersection(&child))
    }
}

/// A 1-D decomposition into consecutive pieces of the given sizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Weighted {
    weights: Vec<u64>,
    offset: i64,
}

impl Weighted {
    pub fn new(weights: Vec<u64>) -> Self {
        Self { weights, offset: 0 }
    }

    pub fn weights(&self) -> &[u64] {
        &self.weights
    }

    pub fn child_domain(&self, color: &Point, bounds: &Domain) -> CoreResult<Domain> {
        if color.ndim() != 1 || color[0] < 0 || color[0] as usize >= self.weights.len() {
            return Err(CoreError::invalid(format!(
                "color {color} is outside of a weighted partition of {} pieces",
                self.weights.len()
            )));
        }
        let c = color[0] as usize;
        let lo = self.offset + self.weights[..c].iter().sum::<u64>() as i64;
        Ok(bounds.intersection(&Domain::from_origin(&[lo], &[self.weights[c]])))
    }
}

/// A partition computed from the contents of another store. Each color maps to a rectangle
/// that bounds the points the function store refers to under that color.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Image {
    color_shape: Vec<u64>,
    rects: Vec<Domain>,
}

impl Image {
    pub fn new(color_shape: Vec<u64>, rects: Vec<Domain>) -> CoreResult<Self> {
        let volume = color_shape.iter().product::<u64>();
        if volume != rects.len() as u64 {
            return Err(CoreError::internal(format!(
                "image over {} colors has {} rectangles",
                volume,
                rects.len()
            )));
        }
        Ok(Self { color_shape, rects })
    }

    pub fn color_shape(&self) -> &[u64] {
        &self.color_shape
    }

    pub fn rects(&self) -> &[Domain] {
        &self.rects
    }

    pub fn child_domain(&self, color: &Point, bounds: &Domain) -> CoreResult<Domain> {
        let index = Domain::from_extents(&self.color_shape).linearize(color)?;
        Ok(bounds.intersection(&self.rects[index as usize]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Partition {
    NoPartition,
    Tiling(Tiling),
    Weighted(Weighted),
    Image(Image),
}

impl Partition {
    pub fn tiling(tile_shape: Vec<u64>, color_shape: Vec<u64>, offsets: Vec<i64>) -> Self {
        Partition::Tiling(Tiling::new(tile_shape, color_shape, offsets))
    }

    pub fn has_launch_domain(&self) -> bool {
        !matches!(self, Partition::NoPartition)
    }

    pub fn color_shape(&self) -> Option<Vec<u64>> {
        match self {
            Partition::NoPartition => None,
            Partition::Tiling(x) => Some(x.color_shape.clone()),
            Partition::Weighted(x) => Some(vec![x.weights.len() as u64]),
            Partition::Image(x) => Some(x.color_shape.clone()),
        }
    }

    pub fn launch_domain(&self) -> Option<Domain> {
        self.color_shape().map(|x| Domain::from_extents(&x))
    }

    /// The part of `bounds` that the partition assigns to `color`.
    pub fn child_domain(&self, color: &Point, bounds: &Domain) -> CoreResult<Domain> {
        match self {
            Partition::NoPartition => Ok(bounds.clone()),
            Partition::Tiling(x) => x.child_domain(color, bounds),
            Partition::Weighted(x) => x.child_domain(color, bounds),
            Partition::Image(x) => x.child_domain(color, bounds),
        }
    }

    pub fn satisfies_restrictions(&self, restrictions: &[Restriction]) -> bool {
        let forbidden = |d: usize| restrictions.get(d) == Some(&Restriction::Forbid);
        match self {
            Partition::NoPartition => true,
            Partition::Tiling(x) => x
                .color_shape
                .iter()
                .enumerate()
                .all(|(d, c)| *c == 1 || !forbidden(d)),
            Partition::Weighted(x) => x.weights.len() == 1 || !forbidden(0),
            Partition::Image(x) => {
                x.rects.len() <= 1 || !restrictions.contains(&Restriction::Forbid)
            }
        }
    }

    /// Multiplies the tiles and offsets element-wise by `factors`.
    pub fn scale(&self, factors: &[u64]) -> CoreResult<Partition> {
        match self {
            Partition::NoPartition => Ok(Partition::NoPartition),
            Partition::Tiling(x) => {
                if factors.len() != x.ndim() {
                    return Err(CoreError::invalid(format!(
                        "cannot scale a {}-D tiling by {factors:?}",
                        x.ndim()
                    )));
                }
                Ok(Partition::Tiling(Tiling {
                    tile_shape: x.tile_shape.iter().zip(factors).map(|(t, f)| t * f).collect(),
                    color_shape: x.color_shape.clone(),
                    offsets: x
                        .offsets
                        .iter()
                        .zip(factors)
                        .map(|(o, f)| o * *f as i64)
                        .collect(),
                    strides: x.strides.iter().zip(factors).map(|(s, f)| s * f).collect(),
                }))
            }
            x => Err(CoreError::invalid(format!("cannot scale partition {x}"))),
        }
    }

    /// Extends every tile by the halos `low` and `high`, keeping the tile origins in place.
    pub fn bloat(&self, low: &[u64], high: &[u64]) -> CoreResult<Partition> {
        match self {
            Partition::NoPartition => Ok(Partition::NoPartition),
            Partition::Tiling(x) => {
                if low.len() != x.ndim() || high.len() != x.ndim() {
                    return Err(CoreError::invalid(format!(
                        "cannot bloat a {}-D tiling by {low:?} and {high:?}",
                        x.ndim()
                    )));
                }
                Ok(Partition::Tiling(Tiling {
                    tile_shape: (0..x.ndim())
                        .map(|d| x.tile_shape[d] + low[d] + high[d])
                        .collect(),
                    color_shape: x.color_shape.clone(),
                    offsets: (0..x.ndim())
                        .map(|d| x.offsets[d] - low[d] as i64)
                        .collect(),
                    strides: x.strides.clone(),
                }))
            }
            x => Err(CoreError::invalid(format!("cannot bloat partition {x}"))),
        }
    }

    /// Shifts every child by `offsets`.
    pub fn translate(&self, offsets: &[i64]) -> Partition {
        match self {
            Partition::NoPartition => Partition::NoPartition,
            Partition::Tiling(x) => Partition::Tiling(Tiling {
                offsets: x.offsets.iter().zip(offsets).map(|(o, t)| o + t).collect(),
                ..x.clone()
            }),
            Partition::Weighted(x) => Partition::Weighted(Weighted {
                weights: x.weights.clone(),
                offset: x.offset + offsets.first().copied().unwrap_or_default(),
            }),
            Partition::Image(x) => Partition::Image(Image {
                color_shape: x.color_shape.clone(),
                rects: x.rects.iter().map(|r| r.translate(offsets)).collect(),
            }),
        }
    }

    /// Whether the children are pairwise disjoint, which writers require.
    pub fn is_disjoint(&self) -> bool {
        match self {
            Partition::NoPartition | Partition::Weighted(_) => true,
            Partition::Tiling(x) => x.is_disjoint(),
            Partition::Image(_) => false,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::NoPartition => write!(f, "NoPartition"),
            Partition::Tiling(x) => write!(
                f,
                "Tiling(tile: {:?}, colors: {:?}, offsets: {:?}, strides: {:?})",
                x.tile_shape, x.color_shape, x.offsets, x.strides
            ),
            Partition::Weighted(x) => write!(f, "Weighted({:?})", x.weights),
            Partition::Image(x) => write!(f, "Image(colors: {:?})", x.color_shape),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiling_child_domain() -> CoreResult<()> {
        let tiling = Tiling::new(vec![4, 5], vec![3, 2], vec![0, 0]);
        let bounds = Domain::from_extents(&[10, 10]);
        let child = tiling.child_domain(&Point::from([2, 1]), &bounds)?;
        assert_eq!(child, Domain::new(Point::from([8, 5]), Point::from([9, 9]))?);
        assert!(tiling.child_domain(&Point::from([3, 0]), &bounds).is_err());
        Ok(())
    }

    #[test]
    fn test_scale_and_bloat() -> CoreResult<()> {
        let base = Partition::tiling(vec![2, 3], vec![4, 2], vec![0, 0]);
        let scaled = base.scale(&[2, 1])?;
        assert_eq!(scaled, Partition::tiling(vec![4, 3], vec![4, 2], vec![0, 0]));
        let bloated = base.bloat(&[1, 0], &[1, 2])?;
        let Partition::Tiling(tiling) = &bloated else {
            panic!("expected a tiling");
        };
        assert_eq!(tiling.tile_shape(), &[4, 5]);
        assert_eq!(tiling.offsets(), &[-1, 0]);
        assert_eq!(tiling.strides(), &[2, 3]);
        assert!(!bloated.is_disjoint());
        let bounds = Domain::from_extents(&[8, 6]);
        assert_eq!(
            bloated.child_domain(&Point::from([0, 0]), &bounds)?,
            Domain::new(Point::from([0, 0]), Point::from([2, 4]))?
        );
        Ok(())
    }

    #[test]
    fn test_restrictions() {
        let tiling = Partition::tiling(vec![10, 5], vec![1, 2], vec![0, 0]);
        assert!(tiling.satisfies_restrictions(&[Restriction::Forbid, Restriction::Allow]));
        assert!(!tiling.satisfies_restrictions(&[Restriction::Allow, Restriction::Forbid]));
        assert!(Partition::NoPartition.satisfies_restrictions(&[Restriction::Forbid]));
    }

    #[test]
    fn test_weighted() -> CoreResult<()> {
        let weighted = Weighted::new(vec![3, 0, 5]);
        let bounds = Domain::from_extents(&[8]);
        assert_eq!(
            weighted.child_domain(&Point::from([2]), &bounds)?,
            Domain::new(Point::from([3]), Point::from([7]))?
        );
        assert!(weighted.child_domain(&Point::from([1]), &bounds)?.is_empty());
        Ok(())
    }
}

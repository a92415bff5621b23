use std::fmt;
use std::ops::Index;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Point(Vec<i64>);

impl Point {
    pub fn new(coords: impl Into<Vec<i64>>) -> Self {
        Self(coords.into())
    }

    pub fn zeros(ndim: usize) -> Self {
        Self(vec![0; ndim])
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn coords(&self) -> &[i64] {
        &self.0
    }

    pub fn into_coords(self) -> Vec<i64> {
        self.0
    }
}

impl Index<usize> for Point {
    type Output = i64;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl From<Vec<i64>> for Point {
    fn from(coords: Vec<i64>) -> Self {
        Self(coords)
    }
}

impl<const N: usize> From<[i64; N]> for Point {
    fn from(coords: [i64; N]) -> Self {
        Self(coords.to_vec())
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, x) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{x}")?;
        }
        write!(f, ")")
    }
}

/// An inclusive rectangle `lo..=hi`.
/// The domain is empty when `hi < lo` on any axis; a 0-D domain holds exactly one point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Domain {
    lo: Point,
    hi: Point,
}

impl Domain {
    pub fn new(lo: Point, hi: Point) -> CoreResult<Self> {
        if lo.ndim() != hi.ndim() {
            return Err(CoreError::invalid(format!(
                "domain bounds {lo} and {hi} have different dimensions"
            )));
        }
        Ok(Self { lo, hi })
    }

    /// The domain `0..extent` on every axis.
    pub fn from_extents(extents: &[u64]) -> Self {
        Self::from_origin(&vec![0; extents.len()], extents)
    }

    pub fn from_origin(origin: &[i64], extents: &[u64]) -> Self {
        let lo = origin.to_vec();
        let hi = origin
            .iter()
            .zip(extents)
            .map(|(o, e)| o + *e as i64 - 1)
            .collect::<Vec<_>>();
        Self {
            lo: Point(lo),
            hi: Point(hi),
        }
    }

    /// An empty domain of the given dimension.
    pub fn empty(ndim: usize) -> Self {
        Self {
            lo: Point(vec![0; ndim]),
            hi: Point(vec![-1; ndim]),
        }
    }

    pub fn ndim(&self) -> usize {
        self.lo.ndim()
    }

    /// Shifts the domain by `offsets`, which must have one entry per axis.
    pub fn translate(&self, offsets: &[i64]) -> Domain {
        let shift = |p: &Point| Point(p.0.iter().zip(offsets).map(|(x, o)| x + o).collect());
        Domain {
            lo: shift(&self.lo),
            hi: shift(&self.hi),
        }
    }

    pub fn lo(&self) -> &Point {
        &self.lo
    }

    pub fn hi(&self) -> &Point {
        &self.hi
    }

    pub fn extents(&self) -> Vec<u64> {
        self.lo
            .0
            .iter()
            .zip(&self.hi.0)
            .map(|(l, h)| if h < l { 0 } else { (h - l + 1) as u64 })
            .collect()
    }

    pub fn volume(&self) -> u64 {
        self.extents().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.volume() == 0
    }

    pub fn contains(&self, point: &Point) -> bool {
        point.ndim() == self.ndim()
            && point
                .0
                .iter()
                .zip(self.lo.0.iter().zip(&self.hi.0))
                .all(|(p, (l, h))| l <= p && p <= h)
    }

    pub fn contains_domain(&self, other: &Domain) -> bool {
        other.is_empty()
            || (other.ndim() == self.ndim()
                && self.contains(&other.lo)
                && self.contains(&other.hi))
    }

    pub fn intersection(&self, other: &Domain) -> Domain {
        let lo = self
            .lo
            .0
            .iter()
            .zip(&other.lo.0)
            .map(|(a, b)| *a.max(b))
            .collect::<Vec<_>>();
        let hi = self
            .hi
            .0
            .iter()
            .zip(&other.hi.0)
            .map(|(a, b)| *a.min(b))
            .collect::<Vec<_>>();
        Domain {
            lo: Point(lo),
            hi: Point(hi),
        }
    }

    /// The C-order (last axis fastest) position of `point` within the domain.
    pub fn linearize(&self, point: &Point) -> CoreResult<u64> {
        if !self.contains(point) {
            return Err(CoreError::invalid(format!(
                "point {point} is outside of domain {self}"
            )));
        }
        let extents = self.extents();
        let mut index = 0u64;
        for (d, extent) in extents.iter().enumerate() {
            index = index * extent + (point[d] - self.lo[d]) as u64;
        }
        Ok(index)
    }

    pub fn delinearize(&self, mut index: u64) -> CoreResult<Point> {
        if index >= self.volume() {
            return Err(CoreError::invalid(format!(
                "index {index} is outside of domain {self}"
            )));
        }
        let extents = self.extents();
        let mut coords = vec![0; extents.len()];
        for d in (0..extents.len()).rev() {
            coords[d] = self.lo[d] + (index % extents[d]) as i64;
            index /= extents[d];
        }
        Ok(Point(coords))
    }

    /// Iterates over the points of the domain in C order.
    pub fn points(&self) -> DomainPoints {
        let next = if self.is_empty() {
            None
        } else {
            Some(self.lo.clone())
        };
        DomainPoints {
            domain: self.clone(),
            next,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.lo, self.hi)
    }
}

pub struct DomainPoints {
    domain: Domain,
    next: Option<Point>,
}

impl Iterator for DomainPoints {
    type Item = Point;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut next = current.clone();
        let mut d = next.ndim();
        loop {
            if d == 0 {
                break;
            }
            d -= 1;
            if next.0[d] < self.domain.hi[d] {
                next.0[d] += 1;
                self.next = Some(next);
                break;
            }
            next.0[d] = self.domain.lo[d];
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_in_c_order() {
        let domain = Domain::from_extents(&[2, 3]);
        let points = domain.points().collect::<Vec<_>>();
        assert_eq!(points.len(), 6);
        assert_eq!(points[0], Point::from([0, 0]));
        assert_eq!(points[1], Point::from([0, 1]));
        assert_eq!(points[3], Point::from([1, 0]));
        assert_eq!(points[5], Point::from([1, 2]));
    }

    #[test]
    fn test_zero_dim_domain() {
        let domain = Domain::from_extents(&[]);
        assert_eq!(domain.volume(), 1);
        assert_eq!(domain.points().collect::<Vec<_>>(), vec![Point::zeros(0)]);
    }

    #[test]
    fn test_empty_domain() {
        let domain = Domain::from_extents(&[4, 0]);
        assert!(domain.is_empty());
        assert_eq!(domain.points().count(), 0);
    }

    #[test]
    fn test_linearize_round_trip() -> CoreResult<()> {
        let domain = Domain::new(Point::from([1, 2, 3]), Point::from([2, 4, 6]))?;
        for (i, point) in domain.points().enumerate() {
            assert_eq!(domain.linearize(&point)?, i as u64);
            assert_eq!(domain.delinearize(i as u64)?, point);
        }
        assert!(domain.linearize(&Point::from([0, 0, 0])).is_err());
        Ok(())
    }

    #[test]
    fn test_intersection() -> CoreResult<()> {
        let a = Domain::from_extents(&[10, 10]);
        let b = Domain::new(Point::from([5, -3]), Point::from([12, 4]))?;
        let c = a.intersection(&b);
        assert_eq!(c, Domain::new(Point::from([5, 0]), Point::from([9, 4]))?);
        Ok(())
    }
}

use std::fmt;
use std::ops::Index;

/// The extents of a store. A 0-D shape has volume 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Shape {
    extents: Vec<u64>,
}

impl Shape {
    pub fn new(extents: impl Into<Vec<u64>>) -> Self {
        Self {
            extents: extents.into(),
        }
    }

    pub fn scalar() -> Self {
        Self { extents: vec![] }
    }

    pub fn ndim(&self) -> usize {
        self.extents.len()
    }

    pub fn volume(&self) -> u64 {
        self.extents.iter().product()
    }

    pub fn extents(&self) -> &[u64] {
        &self.extents
    }

    pub fn is_empty(&self) -> bool {
        self.volume() == 0
    }
}

impl Index<usize> for Shape {
    type Output = u64;

    fn index(&self, index: usize) -> &Self::Output {
        &self.extents[index]
    }
}

impl From<Vec<u64>> for Shape {
    fn from(extents: Vec<u64>) -> Self {
        Self { extents }
    }
}

impl<const N: usize> From<[u64; N]> for Shape {
    fn from(extents: [u64; N]) -> Self {
        Self {
            extents: extents.to_vec(),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape(")?;
        for (i, x) in self.extents.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{x}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume() {
        assert_eq!(Shape::scalar().volume(), 1);
        assert_eq!(Shape::from([10, 1]).volume(), 10);
        assert!(Shape::from([3, 0, 2]).is_empty());
        assert_eq!(Shape::from([100, 10, 10]).to_string(), "Shape(100, 10, 10)");
    }
}

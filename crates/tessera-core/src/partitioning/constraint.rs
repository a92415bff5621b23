use std::fmt;

use crate::id::OperationId;

/// A partition symbol of one task. Stores that share a variable share a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable {
    operation: OperationId,
    id: u32,
}

impl Variable {
    pub(crate) fn new(operation: OperationId, id: u32) -> Self {
        Self { operation, id }
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X{}{{op {}}}", self.id, self.operation)
    }
}

/// How the bounding rectangles of an image partition are computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ImageComputationHint {
    /// Take the bounding box of all points.
    #[default]
    None,
    /// The points of a color are not ordered; take the bounding box of all points.
    MinMax,
    /// The points of a color are sorted; take the first and the last one.
    FirstLast,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constraint {
    Alignment {
        lhs: Variable,
        rhs: Variable,
    },
    Broadcast {
        variable: Variable,
        axes: Option<Vec<usize>>,
    },
    Image {
        func: Variable,
        range: Variable,
        hint: ImageComputationHint,
    },
    Scale {
        factors: Vec<u64>,
        smaller: Variable,
        bigger: Variable,
    },
    Bloat {
        source: Variable,
        bloat: Variable,
        low: Vec<u64>,
        high: Vec<u64>,
    },
}

impl Constraint {
    pub fn variables(&self) -> Vec<Variable> {
        match self {
            Constraint::Alignment { lhs, rhs } => vec![*lhs, *rhs],
            Constraint::Broadcast { variable, .. } => vec![*variable],
            Constraint::Image { func, range, .. } => vec![*func, *range],
            Constraint::Scale {
                smaller, bigger, ..
            } => vec![*smaller, *bigger],
            Constraint::Bloat { source, bloat, .. } => vec![*source, *bloat],
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Alignment { lhs, rhs } => write!(f, "Align({lhs}, {rhs})"),
            Constraint::Broadcast { variable, axes } => match axes {
                Some(axes) => write!(f, "Broadcast({variable}, {axes:?})"),
                None => write!(f, "Broadcast({variable})"),
            },
            Constraint::Image { func, range, hint } => {
                write!(f, "Image({func}, {range}, {hint:?})")
            }
            Constraint::Scale {
                factors,
                smaller,
                bigger,
            } => write!(f, "Scale({factors:?}, {smaller}, {bigger})"),
            Constraint::Bloat {
                source,
                bloat,
                low,
                high,
            } => write!(f, "Bloat({source}, {bloat}, {low:?}, {high:?})"),
        }
    }
}

pub fn align(lhs: Variable, rhs: Variable) -> Constraint {
    Constraint::Alignment { lhs, rhs }
}

/// Forbids partitioning `variable` along any axis.
pub fn broadcast(variable: Variable) -> Constraint {
    Constraint::Broadcast {
        variable,
        axes: None,
    }
}

pub fn broadcast_axes(variable: Variable, axes: Vec<usize>) -> Constraint {
    Constraint::Broadcast {
        variable,
        axes: Some(axes),
    }
}

/// Derives the partition of `range` from the points or rectangles stored in `func`.
pub fn image(func: Variable, range: Variable, hint: ImageComputationHint) -> Constraint {
    Constraint::Image { func, range, hint }
}

pub fn scale(factors: Vec<u64>, smaller: Variable, bigger: Variable) -> Constraint {
    Constraint::Scale {
        factors,
        smaller,
        bigger,
    }
}

pub fn bloat(source: Variable, bloat: Variable, low: Vec<u64>, high: Vec<u64>) -> Constraint {
    Constraint::Bloat {
        source,
        bloat,
        low,
        high,
    }
}

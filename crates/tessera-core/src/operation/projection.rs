use std::fmt;

use indexmap::IndexMap;
use log::debug;

use crate::domain::{Domain, Point};
use crate::error::{CoreError, CoreResult};
use crate::library::Library;
use crate::substrate::Substrate;

/// The projection id every substrate interprets as the identity.
pub const IDENTITY_PROJECTION_ID: i64 = 0;

/// One coordinate of a projected color, as a function of the color.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymbolicExpr {
    Dim(usize),
    Const(i64),
}

impl fmt::Display for SymbolicExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolicExpr::Dim(d) => write!(f, "d{d}"),
            SymbolicExpr::Const(c) => write!(f, "{c}"),
        }
    }
}

/// Maps a point of the launch domain to the color of a store partition.
/// The launch point is first delinearized into `delinearize` when the partition
/// has a different color space than the launch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectionFunctor {
    launch_ndim: usize,
    delinearize: Option<Vec<u64>>,
    exprs: Vec<SymbolicExpr>,
}

impl ProjectionFunctor {
    pub fn new(
        launch_ndim: usize,
        delinearize: Option<Vec<u64>>,
        exprs: Vec<SymbolicExpr>,
    ) -> Self {
        Self {
            launch_ndim,
            delinearize,
            exprs,
        }
    }

    pub fn identity(ndim: usize) -> Self {
        Self::new(ndim, None, (0..ndim).map(SymbolicExpr::Dim).collect())
    }

    pub fn is_identity(&self) -> bool {
        self.delinearize.is_none()
            && self.exprs.len() == self.launch_ndim
            && self
                .exprs
                .iter()
                .enumerate()
                .all(|(i, e)| *e == SymbolicExpr::Dim(i))
    }

    pub fn launch_ndim(&self) -> usize {
        self.launch_ndim
    }

    pub fn exprs(&self) -> &[SymbolicExpr] {
        &self.exprs
    }

    pub fn project(&self, point: &Point, launch_domain: &Domain) -> CoreResult<Point> {
        if point.ndim() != self.launch_ndim {
            return Err(CoreError::internal(format!(
                "projection for {}-D launches applied to point {point}",
                self.launch_ndim
            )));
        }
        let color = match &self.delinearize {
            Some(shape) => {
                let index = launch_domain.linearize(point)?;
                Domain::from_extents(shape).delinearize(index)?.into_coords()
            }
            None => point
                .coords()
                .iter()
                .zip(launch_domain.lo().coords())
                .map(|(p, l)| p - l)
                .collect(),
        };
        let coords = self
            .exprs
            .iter()
            .map(|e| match e {
                SymbolicExpr::Dim(d) => color.get(*d).copied().ok_or_else(|| {
                    CoreError::internal(format!("projection refers to missing axis {d}"))
                }),
                SymbolicExpr::Const(c) => Ok(*c),
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Point::new(coords))
    }
}

impl fmt::Display for ProjectionFunctor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, e) in self.exprs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{e}")?;
        }
        write!(f, ")")?;
        if let Some(shape) = &self.delinearize {
            write!(f, " over {shape:?}")?;
        }
        Ok(())
    }
}

/// Hands out projection ids from the block of the core library and registers each
/// functor with the substrate once.
#[derive(Debug, Default)]
pub(crate) struct ProjectionRegistry {
    functors: IndexMap<ProjectionFunctor, i64>,
}

impl ProjectionRegistry {
    pub fn find_or_register(
        &mut self,
        functor: ProjectionFunctor,
        library: &Library,
        substrate: &dyn Substrate,
    ) -> CoreResult<i64> {
        if functor.is_identity() {
            return Ok(IDENTITY_PROJECTION_ID);
        }
        if let Some(id) = self.functors.get(&functor) {
            return Ok(*id);
        }
        let projection_id = library.get_projection_id(self.functors.len() as i64 + 1)?;
        debug!("registering projection {projection_id}: {functor}");
        substrate.register_projection(projection_id, functor.clone())?;
        self.functors.insert(functor, projection_id);
        Ok(projection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_with_constants() -> CoreResult<()> {
        let functor = ProjectionFunctor::new(
            2,
            None,
            vec![SymbolicExpr::Const(0), SymbolicExpr::Dim(1), SymbolicExpr::Dim(0)],
        );
        let domain = Domain::from_extents(&[2, 3]);
        assert_eq!(
            functor.project(&Point::from([1, 2]), &domain)?,
            Point::from([0, 2, 1])
        );
        assert!(!functor.is_identity());
        assert!(ProjectionFunctor::identity(3).is_identity());
        Ok(())
    }

    #[test]
    fn test_project_delinearized() -> CoreResult<()> {
        let functor = ProjectionFunctor::new(
            1,
            Some(vec![2, 4]),
            vec![SymbolicExpr::Dim(0), SymbolicExpr::Dim(1)],
        );
        let domain = Domain::from_extents(&[8]);
        assert_eq!(functor.project(&Point::from([6]), &domain)?, Point::from([1, 2]));
        Ok(())
    }
}

//! The contract between the control plane and the region-based execution substrate.

mod local;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub use local::LocalSubstrate;

use crate::data::external_allocation::ExternalAllocation;
use crate::domain::{Domain, Point};
use crate::error::{CoreError, CoreResult, ReturnedException};
use crate::id::{ExternalResourcesId, FieldId, PhysicalRegionId, RegionTreeId};
use crate::library::TaskInfo;
use crate::machine::Machine;
use crate::mapping::ArgumentKind;
use crate::operation::copy::CopyLaunch;
use crate::operation::fill::FillLaunch;
use crate::operation::launcher::TaskLaunch;
use crate::operation::projection::ProjectionFunctor;
use crate::reduction::ReductionOp;
use crate::scalar::Scalar;
use crate::types::{NativeType, Type};

/// A region of a region tree. Sub-regions share the tree and the coordinate system of the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalRegion {
    pub tree: RegionTreeId,
    pub domain: Domain,
}

/// A mapped (or previously mapped) instance of one field of a region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhysicalRegion {
    pub id: PhysicalRegionId,
    pub region: LogicalRegion,
    pub field: FieldId,
}

/// A set of external allocations attached to disjoint pieces of one field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalResources {
    pub id: ExternalResourcesId,
    pub region: LogicalRegion,
    pub field: FieldId,
    pub pieces: Vec<Domain>,
}

#[derive(Clone, Default)]
pub enum FutureValue {
    #[default]
    Empty,
    Buffer(Vec<u8>),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for FutureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FutureValue::Empty => write!(f, "Empty"),
            FutureValue::Buffer(x) => write!(f, "Buffer({} bytes)", x.len()),
            FutureValue::Opaque(_) => write!(f, "Opaque"),
        }
    }
}

/// The result of a substrate operation. Futures produced by an eager substrate are always ready.
#[derive(Debug, Clone, Default)]
pub struct Future(Arc<FutureValue>);

impl Future {
    pub fn ready(value: FutureValue) -> Self {
        Self(Arc::new(value))
    }

    pub fn empty() -> Self {
        Self::ready(FutureValue::Empty)
    }

    pub fn from_scalar(scalar: &Scalar) -> Self {
        Self::ready(FutureValue::Buffer(scalar.bytes().to_vec()))
    }

    /// Blocks until the value is available and returns it.
    pub fn wait(&self) -> &FutureValue {
        &self.0
    }

    pub fn buffer(&self) -> CoreResult<&[u8]> {
        match self.wait() {
            FutureValue::Buffer(x) => Ok(x),
            x => Err(CoreError::invalid(format!(
                "future does not hold a buffer: {x:?}"
            ))),
        }
    }

    pub fn get_scalar(&self, ty: &Type) -> CoreResult<Scalar> {
        Scalar::from_bytes(ty.clone(), self.buffer()?.to_vec())
    }

    pub fn get<T: NativeType>(&self) -> CoreResult<T> {
        self.get_scalar(&T::ty())?.value::<T>()
    }

    pub fn get_opaque<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self.wait() {
            FutureValue::Opaque(x) => x.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &Future) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug)]
struct FutureMapInner {
    domain: Domain,
    futures: Vec<Future>,
}

/// One future per point of a launch domain, stored in C order.
/// Clones share the same map, so [`FutureMap::ptr_eq`] identifies a map.
#[derive(Debug, Clone)]
pub struct FutureMap(Arc<FutureMapInner>);

impl FutureMap {
    pub fn new(domain: Domain, futures: Vec<Future>) -> CoreResult<Self> {
        if domain.volume() != futures.len() as u64 {
            return Err(CoreError::internal(format!(
                "future map over {domain} needs {} futures but got {}",
                domain.volume(),
                futures.len()
            )));
        }
        Ok(Self(Arc::new(FutureMapInner { domain, futures })))
    }

    pub fn domain(&self) -> &Domain {
        &self.0.domain
    }

    pub fn futures(&self) -> &[Future] {
        &self.0.futures
    }

    pub fn get(&self, point: &Point) -> CoreResult<&Future> {
        let index = self.0.domain.linearize(point)?;
        Ok(&self.0.futures[index as usize])
    }

    /// Views the same futures over `domain`, matching points by their C-order position.
    pub fn reproject(&self, domain: Domain) -> CoreResult<FutureMap> {
        FutureMap::new(domain, self.0.futures.clone())
    }

    pub fn ptr_eq(&self, other: &FutureMap) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A buffer bound to an unbound output store by one point task.
#[derive(Debug, Clone)]
pub struct BoundBuffer {
    pub extents: Vec<u64>,
    pub data: Vec<u8>,
}

/// What the substrate reports back after executing a task launch.
#[derive(Debug)]
pub struct LaunchOutcome {
    /// The value each point task returned, over the launch domain.
    pub returns: FutureMap,
    /// New values of future-backed output and reduction arguments.
    pub future_outputs: Vec<(ArgumentKind, usize, Future)>,
    /// Buffers bound to unbound outputs, keyed by output index, one per point in launch order.
    pub bound_outputs: Vec<(usize, Vec<BoundBuffer>)>,
    /// The first exception raised by a point task in launch order.
    pub exception: Option<ReturnedException>,
}

pub trait Substrate {
    /// The processors managed by the substrate.
    fn machine(&self) -> Machine;

    fn create_region(&self, domain: &Domain) -> CoreResult<LogicalRegion>;

    /// Allocates a field in the region tree. Local field ids are assigned deterministically.
    fn allocate_field(&self, region: &LogicalRegion, field_size: usize) -> CoreResult<FieldId>;

    /// Looks up the sub-region covering `rect`, which is a color of a (possibly incomplete)
    /// partition of `parent`.
    fn subregion(
        &self,
        parent: &LogicalRegion,
        rect: &Domain,
        complete: bool,
    ) -> CoreResult<LogicalRegion>;

    fn map_region(&self, region: &LogicalRegion, field: FieldId) -> CoreResult<PhysicalRegion>;

    fn is_mapped(&self, physical: &PhysicalRegion) -> bool;

    fn remap_region(&self, physical: &PhysicalRegion) -> CoreResult<()>;

    fn unmap_region(&self, physical: &PhysicalRegion) -> CoreResult<()>;

    /// Reads the contents of a mapped region in C order.
    fn read_region(&self, physical: &PhysicalRegion) -> CoreResult<Vec<u8>>;

    fn write_region(&self, physical: &PhysicalRegion, data: &[u8]) -> CoreResult<()>;

    fn attach(
        &self,
        region: &LogicalRegion,
        field: FieldId,
        allocation: &ExternalAllocation,
    ) -> CoreResult<PhysicalRegion>;

    fn attach_resources(
        &self,
        region: &LogicalRegion,
        field: FieldId,
        pieces: &[(Domain, ExternalAllocation)],
    ) -> CoreResult<ExternalResources>;

    /// Detaches an attached region. An unordered detach may be reordered against other
    /// unordered operations issued by other shards.
    fn detach(&self, physical: &PhysicalRegion, unordered: bool) -> CoreResult<Future>;

    fn detach_resources(&self, resources: &ExternalResources, unordered: bool)
        -> CoreResult<Future>;

    /// Returns the indices of the items that every shard has offered.
    fn consensus_match(&self, items: &[(RegionTreeId, FieldId)]) -> CoreResult<Vec<usize>>;

    fn register_task(&self, task_id: i64, info: Arc<TaskInfo>) -> CoreResult<()>;

    fn register_projection(&self, projection_id: i64, functor: ProjectionFunctor)
        -> CoreResult<()>;

    fn register_reduction_op(&self, redop_id: i64, op: Arc<dyn ReductionOp>) -> CoreResult<()>;

    fn execute_task(&self, launch: &TaskLaunch) -> CoreResult<LaunchOutcome>;

    fn execute_fill(&self, launch: &FillLaunch) -> CoreResult<()>;

    fn execute_copy(&self, launch: &CopyLaunch) -> CoreResult<()>;

    /// Orders later operations after every operation issued so far. The token completes
    /// once those operations have finished.
    fn issue_execution_fence(&self) -> CoreResult<Future>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_future_map_reproject() -> CoreResult<()> {
        let futures = (0..8i64)
            .map(|i| Future::from_scalar(&Scalar::new(i)))
            .collect::<Vec<_>>();
        let base = FutureMap::new(Domain::from_extents(&[8]), futures)?;
        let alias = base.reproject(Domain::from_extents(&[2, 4]))?;
        assert!(!alias.ptr_eq(&base));
        assert!(base.clone().ptr_eq(&base));
        assert_eq!(alias.get(&Point::from([1, 2]))?.get::<i64>()?, 6);
        assert!(alias.get(&Point::from([1, 2]))?.ptr_eq(base.get(&Point::from([6]))?));
        assert!(base.reproject(Domain::from_extents(&[3, 3])).is_err());
        Ok(())
    }
}

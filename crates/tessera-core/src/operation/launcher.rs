use crate::data::store::LogicalStore;
use crate::data::transform::TransformStack;
use crate::domain::{Domain, Point};
use crate::error::{CoreError, CoreResult};
use crate::id::FieldId;
use crate::library::Library;
use crate::machine::{Machine, VariantCode};
use crate::mapping::ArgumentKind;
use crate::operation::projection::{
    ProjectionFunctor, ProjectionRegistry, SymbolicExpr, IDENTITY_PROJECTION_ID,
};
use crate::partitioning::partition::Partition;
use crate::scalar::Scalar;
use crate::scope;
use crate::substrate::{Future, FutureMap, LogicalRegion, Substrate};
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Privilege {
    ReadOnly,
    WriteDiscard,
    ReadWrite,
    /// Reduction with the operator of the given global id.
    Reduce(i64),
}

impl Privilege {
    fn for_argument(kind: ArgumentKind, redop: Option<i64>) -> CoreResult<Self> {
        match (kind, redop) {
            (ArgumentKind::Input, _) => Ok(Privilege::ReadOnly),
            (ArgumentKind::Output, _) => Ok(Privilege::WriteDiscard),
            (ArgumentKind::Reduction, Some(redop)) => Ok(Privilege::Reduce(redop)),
            (ArgumentKind::Reduction, None) => {
                Err(CoreError::internal("reduction argument without an operator"))
            }
        }
    }

    fn merge(self, other: Privilege) -> Privilege {
        if self == other {
            self
        } else {
            Privilege::ReadWrite
        }
    }
}

/// A request for access to one or more fields of a region, partitioned by `partition`
/// (in the coordinates of the region tree) and indexed through `projection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRequirement {
    pub region: LogicalRegion,
    pub partition: Partition,
    pub projection: i64,
    pub privilege: Privilege,
    pub fields: Vec<FieldId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreArgData {
    /// Element `p` of the storage lives at `origin + p` in the region tree.
    Region {
        requirement: usize,
        field: FieldId,
        origin: Vec<i64>,
    },
    /// A store backed by the future at `index` of the launch.
    Future { index: usize, extents: Vec<u64> },
    Unbound { ndim: usize },
}

/// How a point task sees one store argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreArg {
    pub ty: Type,
    pub transform: TransformStack,
    pub privilege: Privilege,
    pub data: StoreArgData,
}

/// Describes the packed by-value scalars of a launch: the type and byte offset of each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalarLayout {
    pub count: usize,
    pub layout: Vec<(Type, usize)>,
}

/// A fully lowered task launch, ready for the substrate.
#[derive(Debug, Clone)]
pub struct TaskLaunch {
    pub library: String,
    pub task_id: i64,
    /// The variant code of the chosen target.
    pub tag: VariantCode,
    /// The launch domain of an index launch, or `None` for a single task.
    pub launch_domain: Option<Domain>,
    /// The index a single task observes.
    pub single_index: Point,
    pub requirements: Vec<RegionRequirement>,
    pub inputs: Vec<StoreArg>,
    pub outputs: Vec<StoreArg>,
    pub reductions: Vec<StoreArg>,
    pub scalar_layout: ScalarLayout,
    pub scalars: Vec<u8>,
    pub futures: Vec<Future>,
    pub communicators: Vec<FutureMap>,
    pub concurrent: bool,
    pub insert_barrier: bool,
    /// The upper bound in bytes of the output buffers a point task may create.
    pub pool_size: Option<usize>,
    pub priority: i32,
    pub provenance: Option<String>,
    pub machine: Machine,
}

impl TaskLaunch {
    pub fn is_index_launch(&self) -> bool {
        self.launch_domain.is_some()
    }

    pub fn num_communicators(&self) -> usize {
        self.communicators.len()
    }

    /// The points of the launch in launch order.
    pub fn points(&self) -> Vec<Point> {
        match &self.launch_domain {
            Some(domain) => domain.points().collect(),
            None => vec![self.single_index.clone()],
        }
    }

    /// Unpacks the by-value scalars.
    pub fn unpack_scalars(&self) -> CoreResult<Vec<Scalar>> {
        self.scalar_layout
            .layout
            .iter()
            .map(|(ty, offset)| {
                let end = offset + ty.size();
                let bytes = self.scalars.get(*offset..end).ok_or_else(|| {
                    CoreError::internal(format!("scalar at {offset} exceeds the scalar buffer"))
                })?;
                Scalar::from_bytes(ty.clone(), bytes.to_vec())
            })
            .collect()
    }
}

/// Accumulates the arguments of a launch in submission order.
pub(crate) struct TaskLauncher {
    library: String,
    task_id: i64,
    tag: VariantCode,
    launch_domain: Option<Domain>,
    single_index: Point,
    requirements: Vec<RegionRequirement>,
    inputs: Vec<StoreArg>,
    outputs: Vec<StoreArg>,
    reductions: Vec<StoreArg>,
    scalars: Vec<Scalar>,
    futures: Vec<Future>,
    communicators: Vec<FutureMap>,
    concurrent: bool,
    insert_barrier: bool,
    pool_size: Option<usize>,
    machine: Machine,
}

impl TaskLauncher {
    pub fn new(
        library: &Library,
        task_id: i64,
        tag: VariantCode,
        machine: Machine,
        launch_domain: Option<Domain>,
        single_dim: usize,
    ) -> Self {
        Self {
            library: library.name().to_string(),
            task_id,
            tag,
            launch_domain,
            single_index: Point::zeros(single_dim),
            requirements: vec![],
            inputs: vec![],
            outputs: vec![],
            reductions: vec![],
            scalars: vec![],
            futures: vec![],
            communicators: vec![],
            concurrent: false,
            insert_barrier: false,
            pool_size: None,
            machine,
        }
    }

    pub fn add_scalar(&mut self, scalar: Scalar) {
        self.scalars.push(scalar);
    }

    pub fn add_future(&mut self, future: Future) {
        self.futures.push(future);
    }

    pub fn add_communicator(&mut self, communicator: FutureMap) {
        self.communicators.push(communicator);
    }

    pub fn set_concurrent(&mut self, concurrent: bool) {
        self.concurrent = concurrent;
    }

    pub fn set_insert_barrier(&mut self, insert_barrier: bool) {
        self.insert_barrier = insert_barrier;
    }

    pub fn set_pool_size(&mut self, pool_size: Option<usize>) {
        self.pool_size = pool_size;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_store(
        &mut self,
        kind: ArgumentKind,
        store: &LogicalStore,
        partition: &Partition,
        redop: Option<i64>,
        projections: &mut ProjectionRegistry,
        core_library: &Library,
        substrate: &dyn Substrate,
    ) -> CoreResult<()> {
        let privilege = Privilege::for_argument(kind, redop)?;
        let data = if store.is_unbound() {
            StoreArgData::Unbound { ndim: store.dim() }
        } else if let Some(future) = store.future() {
            self.futures.push(future);
            StoreArgData::Future {
                index: self.futures.len() - 1,
                extents: store.storage().extents().unwrap_or_default(),
            }
        } else {
            let field = store
                .region_field()
                .ok_or_else(|| CoreError::internal(format!("{store:?} has no storage")))?;
            if kind == ArgumentKind::Output
                && self.launch_domain.is_some()
                && !(partition.has_launch_domain() && partition.is_disjoint())
            {
                return Err(CoreError::invalid(format!(
                    "an index launch cannot write {store:?} through the aliased partition \
                     {partition}"
                )));
            }
            let (partition, projection) =
                self.lower_partition(store, partition, projections, core_library, substrate)?;
            let origin = field.domain().lo().coords().to_vec();
            let requirement = self.add_requirement(
                field.region().clone(),
                partition.translate(&origin),
                projection,
                privilege,
                field.field_id(),
            );
            StoreArgData::Region {
                requirement,
                field: field.field_id(),
                origin,
            }
        };
        let arg = StoreArg {
            ty: store.ty().clone(),
            transform: store.transform().clone(),
            privilege,
            data,
        };
        match kind {
            ArgumentKind::Input => self.inputs.push(arg),
            ArgumentKind::Output => self.outputs.push(arg),
            ArgumentKind::Reduction => self.reductions.push(arg),
        }
        Ok(())
    }

    /// Expresses the partition of a store over its storage and finds the projection
    /// that maps launch points to the colors of that partition.
    fn lower_partition(
        &self,
        store: &LogicalStore,
        partition: &Partition,
        projections: &mut ProjectionRegistry,
        core_library: &Library,
        substrate: &dyn Substrate,
    ) -> CoreResult<(Partition, i64)> {
        let Some(launch_domain) = &self.launch_domain else {
            return Ok((Partition::NoPartition, IDENTITY_PROJECTION_ID));
        };
        let Some(color_domain) = partition.launch_domain() else {
            return Ok((Partition::NoPartition, IDENTITY_PROJECTION_ID));
        };
        let storage_partition = store.transform().invert_partition(partition)?;
        let delinearize = if color_domain != *launch_domain {
            Some(color_domain.extents())
        } else {
            None
        };
        let exprs = store
            .transform()
            .invert_symbolic_point((0..color_domain.ndim()).map(SymbolicExpr::Dim).collect());
        let functor = ProjectionFunctor::new(launch_domain.ndim(), delinearize, exprs);
        let projection = projections.find_or_register(functor, core_library, substrate)?;
        Ok((storage_partition, projection))
    }

    fn add_requirement(
        &mut self,
        region: LogicalRegion,
        partition: Partition,
        projection: i64,
        privilege: Privilege,
        field: FieldId,
    ) -> usize {
        let existing = self.requirements.iter().position(|r| {
            r.region == region && r.partition == partition && r.projection == projection
        });
        match existing {
            Some(index) => {
                let requirement = &mut self.requirements[index];
                requirement.privilege = requirement.privilege.merge(privilege);
                if !requirement.fields.contains(&field) {
                    requirement.fields.push(field);
                }
                index
            }
            None => {
                self.requirements.push(RegionRequirement {
                    region,
                    partition,
                    projection,
                    privilege,
                    fields: vec![field],
                });
                self.requirements.len() - 1
            }
        }
    }

    pub fn build(self) -> TaskLaunch {
        let mut layout = Vec::with_capacity(self.scalars.len());
        let mut buffer = Vec::new();
        for scalar in &self.scalars {
            let offset = buffer.len().next_multiple_of(scalar.ty().alignment().max(1));
            buffer.resize(offset, 0);
            buffer.extend_from_slice(scalar.bytes());
            layout.push((scalar.ty().clone(), offset));
        }
        TaskLaunch {
            library: self.library,
            task_id: self.task_id,
            tag: self.tag,
            launch_domain: self.launch_domain,
            single_index: self.single_index,
            requirements: self.requirements,
            inputs: self.inputs,
            outputs: self.outputs,
            reductions: self.reductions,
            scalar_layout: ScalarLayout {
                count: layout.len(),
                layout,
            },
            scalars: buffer,
            futures: self.futures,
            communicators: self.communicators,
            concurrent: self.concurrent,
            insert_barrier: self.insert_barrier,
            pool_size: self.pool_size,
            priority: scope::priority(),
            provenance: scope::provenance(),
            machine: self.machine,
        }
    }
}

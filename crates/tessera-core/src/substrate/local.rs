use std::cell::RefCell;
use std::sync::Arc;

use futures::future::join_all;
use indexmap::IndexMap;
use log::{debug, trace};
use tessera_common::config::SubstrateConfig;
use tessera_common::runtime::RuntimeHandle;

use crate::data::buffer::{read_rect, write_rect};
use crate::data::external_allocation::ExternalAllocation;
use crate::data::physical::PhysicalStore;
use crate::domain::{Domain, Point};
use crate::error::{CoreError, CoreResult, ReturnedException, TaskResult};
use crate::id::{ExternalResourcesId, FieldId, IdGenerator, PhysicalRegionId, RegionTreeId};
use crate::library::{TaskBody, TaskInfo};
use crate::machine::{Machine, ProcessorRange, TaskTarget};
use crate::mapping::ArgumentKind;
use crate::operation::context::TaskContext;
use crate::operation::copy::{CopyArg, CopyLaunch};
use crate::operation::fill::FillLaunch;
use crate::operation::launcher::{Privilege, RegionRequirement, StoreArg, StoreArgData, TaskLaunch};
use crate::operation::projection::{ProjectionFunctor, IDENTITY_PROJECTION_ID};
use crate::reduction::ReductionOp;
use crate::substrate::{
    BoundBuffer, ExternalResources, Future, FutureMap, FutureValue, LaunchOutcome, LogicalRegion,
    PhysicalRegion, Substrate,
};
use crate::types::NativeType;

enum FieldData {
    Owned(Vec<u8>),
    Attached(ExternalAllocation),
    Pieces(Vec<(Domain, ExternalAllocation)>),
}

struct FieldState {
    size: usize,
    data: FieldData,
}

impl FieldState {
    /// The contents of the field over the whole tree in C order.
    fn read(&self, domain: &Domain) -> CoreResult<Vec<u8>> {
        let len = domain.volume() as usize * self.size;
        match &self.data {
            FieldData::Owned(data) => Ok(data.clone()),
            FieldData::Attached(allocation) => allocation.read_bytes(len),
            FieldData::Pieces(pieces) => {
                let mut data = vec![0; len];
                for (rect, allocation) in pieces {
                    let bytes = allocation.read_bytes(rect.volume() as usize * self.size)?;
                    write_rect(&mut data, domain, rect, &bytes, self.size)?;
                }
                Ok(data)
            }
        }
    }

    fn write(&mut self, domain: &Domain, data: Vec<u8>) -> CoreResult<()> {
        match &mut self.data {
            FieldData::Owned(x) => *x = data,
            FieldData::Attached(allocation) => allocation.write_bytes(&data)?,
            FieldData::Pieces(pieces) => {
                for (rect, allocation) in pieces.iter() {
                    allocation.write_bytes(&read_rect(&data, domain, rect, self.size)?)?;
                }
            }
        }
        Ok(())
    }
}

struct TreeState {
    domain: Domain,
    fields: IndexMap<FieldId, FieldState>,
    field_ids: IdGenerator<FieldId>,
}

#[derive(Default)]
struct SubstrateState {
    tree_ids: IdGenerator<RegionTreeId>,
    physical_ids: IdGenerator<PhysicalRegionId>,
    resource_ids: IdGenerator<ExternalResourcesId>,
    trees: IndexMap<RegionTreeId, TreeState>,
    mapped: IndexMap<PhysicalRegionId, bool>,
    resources: IndexMap<ExternalResourcesId, (RegionTreeId, FieldId)>,
    tasks: IndexMap<i64, Arc<TaskInfo>>,
    projections: IndexMap<i64, ProjectionFunctor>,
    reduction_ops: IndexMap<i64, Arc<dyn ReductionOp>>,
    fences: u64,
}

/// A field loaded for the duration of one operation.
struct FieldBuffer {
    domain: Domain,
    size: usize,
    data: Vec<u8>,
    dirty: bool,
}

impl FieldBuffer {
    fn offset(&self, point: &Point) -> CoreResult<usize> {
        Ok(self.domain.linearize(point)? as usize * self.size)
    }

    fn element(&self, point: &Point) -> CoreResult<&[u8]> {
        let offset = self.offset(point)?;
        Ok(&self.data[offset..offset + self.size])
    }

    fn element_mut(&mut self, point: &Point) -> CoreResult<&mut [u8]> {
        let offset = self.offset(point)?;
        self.dirty = true;
        Ok(&mut self.data[offset..offset + self.size])
    }
}

impl SubstrateState {
    fn tree(&self, tree: RegionTreeId) -> CoreResult<&TreeState> {
        self.trees
            .get(&tree)
            .ok_or_else(|| CoreError::invalid(format!("unknown region tree {tree}")))
    }

    fn tree_mut(&mut self, tree: RegionTreeId) -> CoreResult<&mut TreeState> {
        self.trees
            .get_mut(&tree)
            .ok_or_else(|| CoreError::invalid(format!("unknown region tree {tree}")))
    }

    fn field_mut(&mut self, tree: RegionTreeId, field: FieldId) -> CoreResult<&mut FieldState> {
        self.tree_mut(tree)?
            .fields
            .get_mut(&field)
            .ok_or_else(|| CoreError::invalid(format!("unknown field {field} of tree {tree}")))
    }

    fn load(&self, tree: RegionTreeId, field: FieldId) -> CoreResult<FieldBuffer> {
        let state = self.tree(tree)?;
        let field_state = state
            .fields
            .get(&field)
            .ok_or_else(|| CoreError::invalid(format!("unknown field {field} of tree {tree}")))?;
        Ok(FieldBuffer {
            domain: state.domain.clone(),
            size: field_state.size,
            data: field_state.read(&state.domain)?,
            dirty: false,
        })
    }

    fn store(&mut self, tree: RegionTreeId, field: FieldId, buffer: FieldBuffer) -> CoreResult<()> {
        if !buffer.dirty {
            return Ok(());
        }
        self.field_mut(tree, field)?
            .write(&buffer.domain, buffer.data)
    }

    fn check_mapping(&self, id: PhysicalRegionId) -> CoreResult<bool> {
        self.mapped
            .get(&id)
            .copied()
            .ok_or_else(|| CoreError::invalid(format!("unknown physical region {id}")))
    }

    fn reduction_op(&self, redop: i64) -> CoreResult<Arc<dyn ReductionOp>> {
        self.reduction_ops
            .get(&redop)
            .cloned()
            .ok_or_else(|| CoreError::invalid(format!("unknown reduction operator {redop}")))
    }

    fn projection(&self, projection: i64, ndim: usize) -> CoreResult<ProjectionFunctor> {
        if projection == IDENTITY_PROJECTION_ID {
            return Ok(ProjectionFunctor::identity(ndim));
        }
        self.projections
            .get(&projection)
            .cloned()
            .ok_or_else(|| CoreError::invalid(format!("unknown projection {projection}")))
    }

    /// Turns an attached field back into an owned one holding the attached contents.
    fn flush_attachment(&mut self, tree: RegionTreeId, field: FieldId) -> CoreResult<()> {
        let domain = self.tree(tree)?.domain.clone();
        let field = self.field_mut(tree, field)?;
        let data = field.read(&domain)?;
        field.data = FieldData::Owned(data);
        Ok(())
    }
}

/// Identity-filled contents of a reduction buffer.
fn identity_buffer(op: &dyn ReductionOp, volume: u64) -> Vec<u8> {
    op.identity().bytes().repeat(volume as usize)
}

/// Runs a point task body and hands back the context so its outputs can be collected.
type PointResult = (TaskContext, TaskResult<()>);

/// An in-process substrate that keeps every field in host memory and runs the point tasks
/// of a launch on the blocking pool of a Tokio runtime.
pub struct LocalSubstrate {
    machine: Machine,
    runtime: RuntimeHandle,
    state: RefCell<SubstrateState>,
}

impl LocalSubstrate {
    pub fn new(config: &SubstrateConfig, runtime: RuntimeHandle) -> Self {
        let range = |count: u32| ProcessorRange::new(0, count, count);
        let machine = Machine::new([
            (TaskTarget::Gpu, range(config.gpus)),
            (TaskTarget::Omp, range(config.omps)),
            (TaskTarget::Cpu, range(config.cpus)),
        ]);
        debug!("created local substrate with {machine}");
        Self {
            machine,
            runtime,
            state: RefCell::new(SubstrateState::default()),
        }
    }

    /// The rectangle of `requirement` that the point task at `point` accesses.
    fn point_rect(
        state: &SubstrateState,
        launch: &TaskLaunch,
        requirement: &RegionRequirement,
        point: &Point,
    ) -> CoreResult<Domain> {
        let Some(launch_domain) = &launch.launch_domain else {
            return Ok(requirement.region.domain.clone());
        };
        if !requirement.partition.has_launch_domain() {
            return Ok(requirement.region.domain.clone());
        }
        let functor = state.projection(requirement.projection, launch_domain.ndim())?;
        let color = functor.project(point, launch_domain)?;
        requirement
            .partition
            .child_domain(&color, &requirement.region.domain)
    }

    fn physical_store(
        state: &SubstrateState,
        buffers: &mut IndexMap<(RegionTreeId, FieldId), FieldBuffer>,
        launch: &TaskLaunch,
        arg: &StoreArg,
        point: &Point,
    ) -> CoreResult<PhysicalStore> {
        let redop = match arg.privilege {
            Privilege::Reduce(redop) => Some(state.reduction_op(redop)?),
            _ => None,
        };
        let store = match &arg.data {
            StoreArgData::Unbound { ndim } => {
                return Ok(PhysicalStore::new_unbound(
                    arg.ty.clone(),
                    *ndim,
                    launch.pool_size,
                ))
            }
            StoreArgData::Future { index, extents } => {
                let rect = Domain::from_extents(extents);
                let data = match &redop {
                    Some(op) => identity_buffer(op.as_ref(), rect.volume()),
                    None => match launch.futures.get(*index).map(|f| f.wait()) {
                        Some(FutureValue::Buffer(x)) => x.clone(),
                        Some(FutureValue::Empty) => vec![0; rect.volume() as usize * arg.ty.size()],
                        _ => {
                            return Err(CoreError::internal(format!(
                                "future {index} of the launch holds no buffer"
                            )))
                        }
                    },
                };
                PhysicalStore::new(
                    arg.ty.clone(),
                    rect,
                    arg.transform.clone(),
                    data,
                    arg.privilege,
                    true,
                )?
            }
            StoreArgData::Region {
                requirement,
                field,
                origin,
            } => {
                let requirement = launch.requirements.get(*requirement).ok_or_else(|| {
                    CoreError::internal(format!("missing region requirement {requirement}"))
                })?;
                let rect = Self::point_rect(state, launch, requirement, point)?;
                let data = match &redop {
                    Some(op) => identity_buffer(op.as_ref(), rect.volume()),
                    None => {
                        let key = (requirement.region.tree, *field);
                        if !buffers.contains_key(&key) {
                            buffers.insert(key, state.load(key.0, key.1)?);
                        }
                        let buffer = &buffers[&key];
                        read_rect(&buffer.data, &buffer.domain, &rect, buffer.size)?
                    }
                };
                let relative = origin.iter().map(|x| -x).collect::<Vec<_>>();
                PhysicalStore::new(
                    arg.ty.clone(),
                    rect.translate(&relative),
                    arg.transform.clone(),
                    data,
                    arg.privilege,
                    false,
                )?
            }
        };
        Ok(match redop {
            Some(op) => store.with_reduction(op),
            None => store,
        })
    }

    fn run_points(
        &self,
        contexts: Vec<TaskContext>,
        body: TaskBody,
    ) -> CoreResult<Vec<PointResult>> {
        let handle = self.runtime.primary();
        let tasks = contexts
            .into_iter()
            .map(|mut context| {
                let body = body.clone();
                handle.spawn_blocking(move || {
                    let result = body(&mut context);
                    (context, result)
                })
            })
            .collect::<Vec<_>>();
        futures::executor::block_on(join_all(tasks))
            .into_iter()
            .map(|x| x.map_err(CoreError::from))
            .collect()
    }
}

impl Substrate for LocalSubstrate {
    fn machine(&self) -> Machine {
        self.machine.clone()
    }

    fn create_region(&self, domain: &Domain) -> CoreResult<LogicalRegion> {
        let mut state = self.state.borrow_mut();
        let tree = state.tree_ids.next()?;
        state.trees.insert(
            tree,
            TreeState {
                domain: domain.clone(),
                fields: IndexMap::new(),
                field_ids: IdGenerator::new(),
            },
        );
        Ok(LogicalRegion {
            tree,
            domain: domain.clone(),
        })
    }

    fn allocate_field(&self, region: &LogicalRegion, field_size: usize) -> CoreResult<FieldId> {
        let mut state = self.state.borrow_mut();
        let tree = state.tree_mut(region.tree)?;
        let field = tree.field_ids.next()?;
        let len = tree.domain.volume() as usize * field_size;
        tree.fields.insert(
            field,
            FieldState {
                size: field_size,
                data: FieldData::Owned(vec![0; len]),
            },
        );
        Ok(field)
    }

    fn subregion(
        &self,
        parent: &LogicalRegion,
        rect: &Domain,
        complete: bool,
    ) -> CoreResult<LogicalRegion> {
        if !parent.domain.contains_domain(rect) && !rect.is_empty() {
            return Err(CoreError::invalid(format!(
                "sub-region {rect} is outside of {}",
                parent.domain
            )));
        }
        if !complete {
            trace!("sub-region {rect} belongs to an incomplete partition of {}", parent.domain);
        }
        Ok(LogicalRegion {
            tree: parent.tree,
            domain: rect.clone(),
        })
    }

    fn map_region(&self, region: &LogicalRegion, field: FieldId) -> CoreResult<PhysicalRegion> {
        let mut state = self.state.borrow_mut();
        state.field_mut(region.tree, field)?;
        let id = state.physical_ids.next()?;
        state.mapped.insert(id, true);
        Ok(PhysicalRegion {
            id,
            region: region.clone(),
            field,
        })
    }

    fn is_mapped(&self, physical: &PhysicalRegion) -> bool {
        self.state
            .borrow()
            .mapped
            .get(&physical.id)
            .copied()
            .unwrap_or(false)
    }

    fn remap_region(&self, physical: &PhysicalRegion) -> CoreResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_mapping(physical.id)?;
        state.mapped.insert(physical.id, true);
        Ok(())
    }

    fn unmap_region(&self, physical: &PhysicalRegion) -> CoreResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_mapping(physical.id)?;
        state.mapped.insert(physical.id, false);
        Ok(())
    }

    fn read_region(&self, physical: &PhysicalRegion) -> CoreResult<Vec<u8>> {
        let state = self.state.borrow();
        if !state.check_mapping(physical.id)? {
            return Err(CoreError::invalid(format!(
                "physical region {} is not mapped",
                physical.id
            )));
        }
        let buffer = state.load(physical.region.tree, physical.field)?;
        if physical.region.domain == buffer.domain {
            return Ok(buffer.data);
        }
        read_rect(&buffer.data, &buffer.domain, &physical.region.domain, buffer.size)
    }

    fn write_region(&self, physical: &PhysicalRegion, data: &[u8]) -> CoreResult<()> {
        let mut state = self.state.borrow_mut();
        if !state.check_mapping(physical.id)? {
            return Err(CoreError::invalid(format!(
                "physical region {} is not mapped",
                physical.id
            )));
        }
        let (tree, field) = (physical.region.tree, physical.field);
        let mut buffer = state.load(tree, field)?;
        write_rect(
            &mut buffer.data,
            &buffer.domain,
            &physical.region.domain,
            data,
            buffer.size,
        )?;
        buffer.dirty = true;
        state.store(tree, field, buffer)
    }

    fn attach(
        &self,
        region: &LogicalRegion,
        field: FieldId,
        allocation: &ExternalAllocation,
    ) -> CoreResult<PhysicalRegion> {
        let mut state = self.state.borrow_mut();
        if state.tree(region.tree)?.domain != region.domain {
            return Err(CoreError::invalid("only a root region can be attached"));
        }
        state.field_mut(region.tree, field)?.data = FieldData::Attached(allocation.clone());
        let id = state.physical_ids.next()?;
        state.mapped.insert(id, true);
        debug!(
            "attached {} bytes of {} to field {field} of {:?}",
            allocation.size(),
            allocation.target(),
            region.tree
        );
        Ok(PhysicalRegion {
            id,
            region: region.clone(),
            field,
        })
    }

    fn attach_resources(
        &self,
        region: &LogicalRegion,
        field: FieldId,
        pieces: &[(Domain, ExternalAllocation)],
    ) -> CoreResult<ExternalResources> {
        let mut state = self.state.borrow_mut();
        if state.tree(region.tree)?.domain != region.domain {
            return Err(CoreError::invalid("only a root region can be attached"));
        }
        state.field_mut(region.tree, field)?.data = FieldData::Pieces(pieces.to_vec());
        let id = state.resource_ids.next()?;
        state.resources.insert(id, (region.tree, field));
        Ok(ExternalResources {
            id,
            region: region.clone(),
            field,
            pieces: pieces.iter().map(|(x, _)| x.clone()).collect(),
        })
    }

    fn detach(&self, physical: &PhysicalRegion, unordered: bool) -> CoreResult<Future> {
        let mut state = self.state.borrow_mut();
        state.check_mapping(physical.id)?;
        state.flush_attachment(physical.region.tree, physical.field)?;
        state.mapped.shift_remove(&physical.id);
        debug!(
            "detached field {} of {:?} ({})",
            physical.field,
            physical.region.tree,
            if unordered { "unordered" } else { "ordered" }
        );
        Ok(Future::empty())
    }

    fn detach_resources(
        &self,
        resources: &ExternalResources,
        _unordered: bool,
    ) -> CoreResult<Future> {
        let mut state = self.state.borrow_mut();
        let Some((tree, field)) = state.resources.shift_remove(&resources.id) else {
            return Err(CoreError::invalid(format!(
                "unknown external resources {}",
                resources.id
            )));
        };
        state.flush_attachment(tree, field)?;
        Ok(Future::empty())
    }

    fn consensus_match(&self, items: &[(RegionTreeId, FieldId)]) -> CoreResult<Vec<usize>> {
        Ok((0..items.len()).collect())
    }

    fn register_task(&self, task_id: i64, info: Arc<TaskInfo>) -> CoreResult<()> {
        let mut state = self.state.borrow_mut();
        if state.tasks.contains_key(&task_id) {
            return Err(CoreError::invalid(format!("task {task_id} is already registered")));
        }
        state.tasks.insert(task_id, info);
        Ok(())
    }

    fn register_projection(
        &self,
        projection_id: i64,
        functor: ProjectionFunctor,
    ) -> CoreResult<()> {
        let mut state = self.state.borrow_mut();
        if state.projections.contains_key(&projection_id) {
            return Err(CoreError::invalid(format!(
                "projection {projection_id} is already registered"
            )));
        }
        state.projections.insert(projection_id, functor);
        Ok(())
    }

    fn register_reduction_op(&self, redop_id: i64, op: Arc<dyn ReductionOp>) -> CoreResult<()> {
        let mut state = self.state.borrow_mut();
        if state.reduction_ops.contains_key(&redop_id) {
            return Err(CoreError::invalid(format!(
                "reduction operator {redop_id} is already registered"
            )));
        }
        state.reduction_ops.insert(redop_id, op);
        Ok(())
    }

    fn execute_task(&self, launch: &TaskLaunch) -> CoreResult<LaunchOutcome> {
        let points = launch.points();
        let target = launch.tag.target();
        let (body, contexts) = {
            let state = self.state.borrow();
            let info = state.tasks.get(&launch.task_id).ok_or_else(|| {
                CoreError::invalid(format!("task {} is not registered", launch.task_id))
            })?;
            let variant = info.find_variant(launch.tag).ok_or_else(|| {
                CoreError::invalid(format!("task {} has no {target} variant", info.name()))
            })?;
            let available = launch.machine.count(target);
            if available == 0 {
                return Err(CoreError::invalid(format!(
                    "no {target} processors in {}",
                    launch.machine
                )));
            }
            if launch.concurrent && points.len() > available as usize {
                return Err(CoreError::invalid(format!(
                    "concurrent launch of {} points exceeds the {available} {target} processors",
                    points.len()
                )));
            }
            if launch.insert_barrier {
                debug!("inserting a barrier before task {}", info.name());
            }
            let scalars = launch.unpack_scalars()?;
            let mut buffers = IndexMap::new();
            let mut contexts = Vec::with_capacity(points.len());
            for point in &points {
                let mut stores = |args: &[StoreArg]| {
                    args.iter()
                        .map(|arg| Self::physical_store(&state, &mut buffers, launch, arg, point))
                        .collect::<CoreResult<Vec<_>>>()
                };
                let inputs = stores(&launch.inputs)?;
                let outputs = stores(&launch.outputs)?;
                let reductions = stores(&launch.reductions)?;
                let communicators = match &launch.launch_domain {
                    Some(_) => launch
                        .communicators
                        .iter()
                        .map(|x| x.get(point).cloned())
                        .collect::<CoreResult<Vec<_>>>()?,
                    None => vec![],
                };
                contexts.push(TaskContext::new(
                    launch.task_id,
                    launch.tag,
                    point.clone(),
                    launch.launch_domain.clone(),
                    inputs,
                    outputs,
                    reductions,
                    scalars.clone(),
                    launch.futures.clone(),
                    communicators,
                ));
            }
            (variant.body.clone(), contexts)
        };

        let results = self.run_points(contexts, body)?;

        let returns_domain = match &launch.launch_domain {
            Some(domain) => domain.clone(),
            None => Domain::from_origin(
                launch.single_index.coords(),
                &vec![1u64; launch.single_index.ndim()],
            ),
        };
        let mut exception: Option<ReturnedException> = None;
        let mut parts = Vec::with_capacity(results.len());
        for (context, result) in results {
            if let Err(e) = result {
                exception.get_or_insert(e.into());
            }
            parts.push(context.into_parts());
        }
        let returns = FutureMap::new(
            returns_domain,
            parts.iter().map(|(_, _, x)| Future::ready(x.clone())).collect(),
        )?;
        if exception.is_some() {
            return Ok(LaunchOutcome {
                returns,
                future_outputs: vec![],
                bound_outputs: vec![],
                exception,
            });
        }

        let mut state = self.state.borrow_mut();
        let mut buffers: IndexMap<(RegionTreeId, FieldId), FieldBuffer> = IndexMap::new();
        let mut future_outputs = vec![];
        let mut bound_outputs = vec![];
        for (i, arg) in launch.outputs.iter().enumerate() {
            match &arg.data {
                StoreArgData::Region {
                    requirement,
                    field,
                    origin,
                } => {
                    let tree = launch.requirements[*requirement].region.tree;
                    let key = (tree, *field);
                    if !buffers.contains_key(&key) {
                        buffers.insert(key, state.load(tree, *field)?);
                    }
                    let buffer = &mut buffers[&key];
                    for (outputs, _, _) in parts.iter_mut() {
                        let store = std::mem::replace(
                            &mut outputs[i],
                            PhysicalStore::new_unbound(arg.ty.clone(), 0, None),
                        );
                        let rect = store.storage_rect().translate(origin);
                        write_rect(
                            &mut buffer.data,
                            &buffer.domain,
                            &rect,
                            &store.into_data(),
                            buffer.size,
                        )?;
                        buffer.dirty = true;
                    }
                }
                StoreArgData::Future { .. } => {
                    if let Some((outputs, _, _)) = parts.first_mut() {
                        let store = std::mem::replace(
                            &mut outputs[i],
                            PhysicalStore::new_unbound(arg.ty.clone(), 0, None),
                        );
                        let future = Future::ready(FutureValue::Buffer(store.into_data()));
                        future_outputs.push((ArgumentKind::Output, i, future));
                    }
                }
                StoreArgData::Unbound { .. } => {
                    let mut bound = Vec::with_capacity(parts.len());
                    for (point, (outputs, _, _)) in points.iter().zip(parts.iter_mut()) {
                        let Some((extents, data)) = outputs[i].take_bound() else {
                            return Err(CoreError::invalid(format!(
                                "point task {point} did not bind unbound output {i}"
                            )));
                        };
                        bound.push(BoundBuffer { extents, data });
                    }
                    bound_outputs.push((i, bound));
                }
            }
        }
        for (i, arg) in launch.reductions.iter().enumerate() {
            let Privilege::Reduce(redop) = arg.privilege else {
                return Err(CoreError::internal(format!(
                    "reduction argument {i} has {:?} privilege",
                    arg.privilege
                )));
            };
            let op = state.reduction_op(redop)?;
            match &arg.data {
                StoreArgData::Region {
                    requirement,
                    field,
                    origin,
                } => {
                    let tree = launch.requirements[*requirement].region.tree;
                    let key = (tree, *field);
                    if !buffers.contains_key(&key) {
                        buffers.insert(key, state.load(tree, *field)?);
                    }
                    let buffer = &mut buffers[&key];
                    for (_, reductions, _) in parts.iter() {
                        let store = &reductions[i];
                        let rect = store.storage_rect().translate(origin);
                        let size = buffer.size;
                        for (k, point) in rect.points().enumerate() {
                            let rhs = store_element(store, k, size)?;
                            op.apply(buffer.element_mut(&point)?, rhs);
                        }
                    }
                }
                StoreArgData::Future { index, .. } => {
                    let size = arg.ty.size();
                    let mut folded = op.identity().bytes().to_vec();
                    for (_, reductions, _) in parts.iter() {
                        let rhs = store_element(&reductions[i], 0, size)?;
                        op.fold(&mut folded, rhs);
                    }
                    let value = match launch.futures.get(*index).map(|f| f.wait()) {
                        Some(FutureValue::Buffer(current)) => {
                            let mut value = current.clone();
                            op.apply(&mut value, &folded);
                            value
                        }
                        _ => folded,
                    };
                    let future = Future::ready(FutureValue::Buffer(value));
                    future_outputs.push((ArgumentKind::Reduction, i, future));
                }
                StoreArgData::Unbound { .. } => {
                    return Err(CoreError::internal("unbound reduction argument"));
                }
            }
        }
        for ((tree, field), buffer) in buffers {
            state.store(tree, field, buffer)?;
        }
        Ok(LaunchOutcome {
            returns,
            future_outputs,
            bound_outputs,
            exception: None,
        })
    }

    fn execute_fill(&self, launch: &FillLaunch) -> CoreResult<()> {
        let mut state = self.state.borrow_mut();
        let (tree, field) = (launch.region.tree, launch.field);
        let mut buffer = state.load(tree, field)?;
        if buffer.size != launch.value.len() {
            return Err(CoreError::invalid(format!(
                "fill value of {} bytes for a field of {}-byte elements",
                launch.value.len(),
                buffer.size
            )));
        }
        if !buffer.domain.contains_domain(&launch.rect) {
            return Err(CoreError::invalid(format!(
                "fill rectangle {} is outside of {}",
                launch.rect, buffer.domain
            )));
        }
        for point in launch.rect.points() {
            buffer.element_mut(&point)?.copy_from_slice(&launch.value);
        }
        state.store(tree, field, buffer)
    }

    fn execute_copy(&self, launch: &CopyLaunch) -> CoreResult<()> {
        let mut state = self.state.borrow_mut();
        let load = |arg: &CopyArg| state.load(arg.region.tree, arg.field);
        let source = load(&launch.source)?;
        let mut target = load(&launch.target)?;
        let source_points = match &launch.source_indirect {
            Some(indirect) => indirect_points(&load(indirect)?, indirect, &launch.source.rect)?,
            None => launch.source.rect.points().collect(),
        };
        let target_points = match &launch.target_indirect {
            Some(indirect) => indirect_points(&load(indirect)?, indirect, &launch.target.rect)?,
            None => launch.target.rect.points().collect(),
        };
        if source_points.len() != target_points.len() {
            return Err(CoreError::invalid(format!(
                "copy moves {} source elements into {} target elements",
                source_points.len(),
                target_points.len()
            )));
        }
        let redop = launch.redop.map(|x| state.reduction_op(x)).transpose()?;
        for (s, t) in source_points.iter().zip(&target_points) {
            for (point, rect) in [(s, &launch.source.rect), (t, &launch.target.rect)] {
                if !rect.contains(point) {
                    return Err(CoreError::invalid(format!(
                        "copy point {point} is outside of {rect}"
                    )));
                }
            }
            let value = source.element(s)?;
            let element = target.element_mut(t)?;
            match &redop {
                Some(op) => op.apply(element, value),
                None => element.copy_from_slice(value),
            }
        }
        state.store(launch.target.region.tree, launch.target.field, target)
    }

    fn issue_execution_fence(&self) -> CoreResult<Future> {
        let mut state = self.state.borrow_mut();
        state.fences += 1;
        trace!("execution fence {}", state.fences);
        Ok(Future::empty())
    }
}

fn store_element(store: &PhysicalStore, index: usize, size: usize) -> CoreResult<&[u8]> {
    store.raw_data().get(index * size..(index + 1) * size).ok_or_else(|| {
        CoreError::internal(format!("element {index} is outside of the reduction buffer"))
    })
}

/// Decodes the points held by an indirection field, shifted into the region tree of the
/// indexed store whose covered rectangle is `indexed`.
fn indirect_points(
    buffer: &FieldBuffer,
    indirect: &CopyArg,
    indexed: &Domain,
) -> CoreResult<Vec<Point>> {
    let ndim = indexed.ndim();
    if buffer.size != ndim * std::mem::size_of::<i64>() {
        return Err(CoreError::invalid(format!(
            "indirection of {}-byte elements cannot address a {ndim}-D store",
            buffer.size
        )));
    }
    let origin = indexed.lo().coords();
    indirect
        .rect
        .points()
        .map(|p| {
            let coords = buffer
                .element(&p)?
                .chunks_exact(std::mem::size_of::<i64>())
                .zip(origin)
                .map(|(x, o)| i64::read_bytes(x) + o)
                .collect::<Vec<_>>();
            Ok(Point::new(coords))
        })
        .collect()
}

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use fastrace::Span;
use indexmap::IndexMap;
use log::{debug, error, warn};
use tessera_common::config::AppConfig;
use tessera_common::runtime::RuntimeManager;
use tessera_telemetry::common::SpanAttribute;
use tessera_telemetry::recorder::{record_error, record_launch};

use crate::comm::{self, CommunicatorFactory, CommunicatorManager, CommunicatorStats, CoreLauncher};
use crate::data::external_allocation::ExternalAllocation;
use crate::data::field_manager::{FieldManager, FreeFieldInfo};
use crate::data::region_field::LogicalRegionField;
use crate::data::store::{LogicalStore, Storage, StorageKind};
use crate::domain::{Domain, Point};
use crate::error::{CoreError, CoreResult, ReturnedException};
use crate::id::{IdGenerator, OperationId, StorageId};
use crate::library::{Library, ResourceBases, ResourceConfig, VariantOptions};
use crate::machine::{Machine, TaskTarget, VariantCode};
use crate::mapping::{
    memory_options, validate_store_mappings, ArgumentKind, DefaultMapper, Mapper, MapperTask,
};
use crate::operation::copy::{lower_copy, CopyPlan};
use crate::operation::fill::{lower_fill, FillPlan};
use crate::operation::launcher::TaskLauncher;
use crate::operation::projection::ProjectionRegistry;
use crate::operation::task::{AutoTask, ManualTask};
use crate::partitioning::launch_shape::PartitionManager;
use crate::partitioning::partition::{Image, Partition, Weighted};
use crate::partitioning::solver::{ConstraintSolver, Launch};
use crate::scalar::Scalar;
use crate::scope::{self, ExceptionMode};
use crate::shape::Shape;
use crate::substrate::{BoundBuffer, Future, FutureMap, LaunchOutcome, LocalSubstrate, Substrate};
use crate::types::{Type, MAX_DIM};

pub const CORE_LIBRARY_NAME: &str = "tessera.core";

/// The id blocks of the core library, which owns the communicator tasks and every
/// projection functor the launcher registers.
const CORE_RESOURCES: ResourceConfig = ResourceConfig {
    max_tasks: 64,
    max_dyn_tasks: 0,
    max_reduction_ops: 0,
    max_projections: 4096,
    max_shardings: 0,
};

pub(crate) struct RuntimeInner {
    config: AppConfig,
    substrate: Rc<dyn Substrate>,
    core_library: Library,
    libraries: RefCell<IndexMap<String, Library>>,
    next_bases: Cell<ResourceBases>,
    next_mapper_id: Cell<i64>,
    field_managers: RefCell<IndexMap<(Vec<u64>, usize), FieldManager>>,
    /// Fields released while the field managers were borrowed.
    pending_frees: RefCell<Vec<(FreeFieldInfo, usize, bool)>>,
    partition_manager: RefCell<PartitionManager>,
    projections: RefCell<ProjectionRegistry>,
    communicators: RefCell<CommunicatorManager>,
    storage_ids: RefCell<IdGenerator<StorageId>>,
    operation_ids: RefCell<IdGenerator<OperationId>>,
    pending_exceptions: RefCell<VecDeque<ReturnedException>>,
    /// The scope machine to restore at shutdown, if the runtime installed its own.
    installed_machine: RefCell<Option<Option<Machine>>>,
    destroyed: Cell<bool>,
    /// Keeps the worker threads of the local substrate alive.
    _manager: Option<RuntimeManager>,
}

impl RuntimeInner {
    pub fn substrate(&self) -> &dyn Substrate {
        self.substrate.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    pub fn next_storage_id(&self) -> CoreResult<StorageId> {
        self.storage_ids.borrow_mut().next()
    }

    /// Returns a released field to the manager of its shape. A field released while the
    /// managers are in use is queued until the next allocation.
    pub fn free_field(&self, info: FreeFieldInfo, field_size: usize, unordered: bool) {
        let Ok(mut managers) = self.field_managers.try_borrow_mut() else {
            debug!("queueing a field released while field managers are busy");
            self.pending_frees
                .borrow_mut()
                .push((info, field_size, unordered));
            return;
        };
        self.return_field(&mut managers, info, field_size, unordered);
    }

    fn return_field(
        &self,
        managers: &mut IndexMap<(Vec<u64>, usize), FieldManager>,
        info: FreeFieldInfo,
        field_size: usize,
        unordered: bool,
    ) {
        let extents = info.extents();
        managers
            .entry((extents.clone(), field_size))
            .or_insert_with(|| {
                FieldManager::new(extents, field_size, self.config.core.field_reuse_frequency)
            })
            .free_field(info, unordered);
    }

    fn drain_pending_frees(&self, managers: &mut IndexMap<(Vec<u64>, usize), FieldManager>) {
        let pending = std::mem::take(&mut *self.pending_frees.borrow_mut());
        for (info, field_size, unordered) in pending {
            self.return_field(managers, info, field_size, unordered);
        }
    }
}

/// A store argument of a launch with the partition it is accessed through.
struct LaunchArgument<'a> {
    kind: ArgumentKind,
    store: &'a LogicalStore,
    partition: &'a Partition,
    redop: Option<i64>,
}

/// A task whose partitions and launch domain are decided.
struct LaunchRequest<'a> {
    library: &'a Library,
    task_name: &'a str,
    local_task_id: i64,
    target: TaskTarget,
    machine: Machine,
    mapper: Rc<dyn Mapper>,
    mapper_task: MapperTask,
    launch_domain: Option<Domain>,
    single_dim: usize,
    arguments: Vec<LaunchArgument<'a>>,
    scalars: &'a [Scalar],
    communicators: &'a [String],
    concurrent: bool,
}

/// The entry point of the control plane. It owns the libraries, the field managers, the
/// communicator caches and the substrate, and lowers every operation issued by the client.
///
/// The runtime is confined to the thread that created it.
pub struct Runtime(Rc<RuntimeInner>);

impl Runtime {
    /// Creates a runtime over a [`LocalSubstrate`] configured from `config`.
    pub fn try_new(config: &AppConfig) -> CoreResult<Self> {
        let manager = RuntimeManager::try_new(&config.substrate)?;
        let substrate = Rc::new(LocalSubstrate::new(&config.substrate, manager.handle()));
        Self::build(config, substrate, Some(manager))
    }

    pub fn with_substrate(config: &AppConfig, substrate: Rc<dyn Substrate>) -> CoreResult<Self> {
        Self::build(config, substrate, None)
    }

    fn build(
        config: &AppConfig,
        substrate: Rc<dyn Substrate>,
        manager: Option<RuntimeManager>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let core_library = Library::try_new(
            CORE_LIBRARY_NAME,
            &CORE_RESOURCES,
            ResourceBases::default(),
            Rc::new(DefaultMapper),
            0,
            BTreeMap::new(),
            substrate.clone(),
        )?;
        comm::register_tasks(&core_library)?;
        let mut communicators = CommunicatorManager::default();
        comm::register_factories(&mut communicators, config.core.disable_mpi);
        let installed_machine = match scope::machine() {
            Some(_) => None,
            None => Some(scope::exchange_machine(Some(substrate.machine()))),
        };
        debug!("runtime started with {}", substrate.machine());
        Ok(Self(Rc::new(RuntimeInner {
            config: config.clone(),
            substrate,
            core_library,
            libraries: RefCell::new(IndexMap::new()),
            next_bases: Cell::new(ResourceBases::default().advance(&CORE_RESOURCES)),
            next_mapper_id: Cell::new(1),
            field_managers: RefCell::new(IndexMap::new()),
            pending_frees: RefCell::new(Vec::new()),
            partition_manager: RefCell::new(PartitionManager::new(config.core.min_shard_volume)),
            projections: RefCell::new(ProjectionRegistry::default()),
            communicators: RefCell::new(communicators),
            storage_ids: RefCell::new(IdGenerator::new()),
            operation_ids: RefCell::new(IdGenerator::new()),
            pending_exceptions: RefCell::new(VecDeque::new()),
            installed_machine: RefCell::new(installed_machine),
            destroyed: Cell::new(false),
            _manager: manager,
        })))
    }

    pub fn config(&self) -> &AppConfig {
        &self.0.config
    }

    pub fn substrate(&self) -> &dyn Substrate {
        self.0.substrate()
    }

    pub fn core_library(&self) -> &Library {
        &self.0.core_library
    }

    /// The machine of the current scope, or every processor of the substrate.
    pub fn get_machine(&self) -> Machine {
        scope::machine().unwrap_or_else(|| self.0.substrate.machine())
    }

    /// Creates a library that reserves the id blocks described by `config`,
    /// or the blocks of the `library` configuration section if `config` is `None`.
    pub fn create_library(
        &self,
        name: &str,
        config: Option<ResourceConfig>,
        mapper: Option<Rc<dyn Mapper>>,
        default_options: BTreeMap<VariantCode, VariantOptions>,
    ) -> CoreResult<Library> {
        if name == CORE_LIBRARY_NAME || self.0.libraries.borrow().contains_key(name) {
            return Err(CoreError::invalid(format!("library {name} already exists")));
        }
        let config = config.unwrap_or_else(|| ResourceConfig::from(&self.0.config.library));
        let bases = self.0.next_bases.get();
        let mapper_id = self.0.next_mapper_id.get();
        let library = Library::try_new(
            name,
            &config,
            bases,
            mapper.unwrap_or_else(|| Rc::new(DefaultMapper)),
            mapper_id,
            default_options,
            self.0.substrate.clone(),
        )?;
        self.0.next_bases.set(bases.advance(&config));
        self.0.next_mapper_id.set(mapper_id + 1);
        self.0
            .libraries
            .borrow_mut()
            .insert(name.to_string(), library.clone());
        Ok(library)
    }

    pub fn find_library(&self, name: &str) -> Option<Library> {
        if name == CORE_LIBRARY_NAME {
            return Some(self.0.core_library.clone());
        }
        self.0.libraries.borrow().get(name).cloned()
    }

    pub fn find_or_create_library(&self, name: &str) -> CoreResult<Library> {
        match self.find_library(name) {
            Some(library) => Ok(library),
            None => self.create_library(name, None, None, BTreeMap::new()),
        }
    }

    fn new_store(&self, ty: Type, kind: StorageKind) -> CoreResult<LogicalStore> {
        let storage = Storage::new(self.0.next_storage_id()?, ty, kind, Rc::downgrade(&self.0));
        Ok(LogicalStore::new(Rc::new(storage)))
    }

    fn allocate_field(
        &self,
        extents: &[u64],
        field_size: usize,
    ) -> CoreResult<Rc<LogicalRegionField>> {
        let runtime = Rc::downgrade(&self.0);
        let mut managers = self.0.field_managers.borrow_mut();
        self.0.drain_pending_frees(&mut managers);
        managers
            .entry((extents.to_vec(), field_size))
            .or_insert_with(|| {
                FieldManager::new(
                    extents.to_vec(),
                    field_size,
                    self.0.config.core.field_reuse_frequency,
                )
            })
            .allocate_field(self.0.substrate(), &runtime)
    }

    fn check_field_type(ty: &Type) -> CoreResult<()> {
        if ty.is_variable_size() {
            return Err(CoreError::invalid(format!(
                "stores of variable-size type {ty} cannot be backed by a region field"
            )));
        }
        Ok(())
    }

    /// Creates a store backed by a region field of `shape`.
    pub fn create_store(&self, shape: impl Into<Shape>, ty: Type) -> CoreResult<LogicalStore> {
        let shape = shape.into();
        Self::check_field_type(&ty)?;
        let field = self.allocate_field(shape.extents(), ty.size())?;
        self.new_store(ty, StorageKind::RegionField(field))
    }

    /// Creates a store whose extents are decided by the single task that writes it.
    pub fn create_unbound_store(&self, ty: Type, ndim: usize) -> CoreResult<LogicalStore> {
        Self::check_field_type(&ty)?;
        self.new_store(ty, StorageKind::Unbound { ndim })
    }

    /// Creates a future-backed store of volume 1 holding `value`.
    pub fn create_scalar_store(
        &self,
        value: &Scalar,
        shape: impl Into<Shape>,
    ) -> CoreResult<LogicalStore> {
        let shape = shape.into();
        if shape.volume() != 1 {
            return Err(CoreError::invalid(format!(
                "a scalar store must have volume 1, not shape {shape}"
            )));
        }
        let kind = StorageKind::Future {
            future: Future::from_scalar(value),
            extents: shape.extents().to_vec(),
        };
        self.new_store(value.ty().clone(), kind)
    }

    /// Creates a store of `shape` over user memory.
    pub fn attach(
        &self,
        shape: impl Into<Shape>,
        ty: Type,
        allocation: ExternalAllocation,
    ) -> CoreResult<LogicalStore> {
        let store = self.create_store(shape, ty)?;
        let Some(field) = store.region_field() else {
            return Err(CoreError::internal("a new store has no region field"));
        };
        field.attach(allocation)?;
        Ok(store)
    }

    /// Creates a store of `shape` over several user allocations, each covering one
    /// rectangle of the store.
    pub fn attach_resources(
        &self,
        shape: impl Into<Shape>,
        ty: Type,
        pieces: Vec<(Domain, ExternalAllocation)>,
    ) -> CoreResult<LogicalStore> {
        let store = self.create_store(shape, ty)?;
        let Some(field) = store.region_field() else {
            return Err(CoreError::internal("a new store has no region field"));
        };
        field.attach_resources(pieces)?;
        Ok(store)
    }

    fn next_operation_id(&self) -> CoreResult<OperationId> {
        self.0.operation_ids.borrow_mut().next()
    }

    /// Creates a task of `library` that runs on the machine of the current scope.
    pub fn create_task(&self, library: &Library, local_task_id: i64) -> CoreResult<AutoTask> {
        let info = library.find_task(local_task_id)?;
        let machine = self.get_machine();
        if !machine
            .valid_targets()
            .iter()
            .any(|t| info.has_variant(t.variant()))
        {
            return Err(CoreError::invalid(format!(
                "task {} has no variant for any processor of {machine}",
                info.name()
            )));
        }
        let operation_id = self.next_operation_id()?;
        Ok(AutoTask::new(
            library.clone(),
            local_task_id,
            info,
            operation_id,
            machine,
            scope::provenance(),
        ))
    }

    /// Creates a task of `library` launched over `launch_shape` with the partitions the
    /// caller picks.
    pub fn create_manual_task(
        &self,
        library: &Library,
        local_task_id: i64,
        launch_shape: &[u64],
    ) -> CoreResult<ManualTask> {
        if launch_shape.is_empty() || launch_shape.len() > MAX_DIM {
            return Err(CoreError::invalid(format!(
                "launch shape {launch_shape:?} must have between 1 and {MAX_DIM} dimensions"
            )));
        }
        let info = library.find_task(local_task_id)?;
        let machine = self.get_machine();
        let operation_id = self.next_operation_id()?;
        Ok(ManualTask::new(
            library.clone(),
            local_task_id,
            info,
            operation_id,
            machine,
            scope::provenance(),
            launch_shape.to_vec(),
        ))
    }

    fn select_target(
        mapper: &dyn Mapper,
        mapper_task: &MapperTask,
        forced: Option<TaskTarget>,
        options: &[TaskTarget],
        task_name: &str,
    ) -> CoreResult<TaskTarget> {
        let target = match forced {
            Some(target) => target,
            None => mapper.task_target(mapper_task, options)?,
        };
        if !options.contains(&target) {
            return Err(CoreError::internal(format!(
                "mapper chose {target} for task {task_name} but it can only run on {options:?}"
            )));
        }
        Ok(target)
    }

    /// Partitions, lowers and launches a task.
    pub fn submit(&self, task: AutoTask) -> CoreResult<()> {
        let library = task.library().clone();
        let mapper = library.get_mapper();
        let mapper_task = task.to_mapper_task()?;
        let target = Self::select_target(
            mapper.as_ref(),
            &mapper_task,
            task.target(),
            &task.target_options(),
            task.info().name(),
        )?;
        let machine = task.machine().only(&[target]);

        let strategy = ConstraintSolver::new(
            task.arguments(),
            task.constraints(),
            self.0.config.core.log_partitioning_decisions,
        )
        .solve(
            machine.count(target),
            &mut self.0.partition_manager.borrow_mut(),
        )?;
        let launch_domain = match strategy.launch() {
            Launch::Empty => {
                debug!(
                    "skipping task {} of operation {} over an empty store",
                    task.info().name(),
                    task.operation_id()
                );
                return Ok(());
            }
            Launch::Single => None,
            Launch::Index(domain) => Some(domain.clone()),
        };
        let mut redops = task.reduction_ops().iter();
        let mut arguments = Vec::with_capacity(task.arguments().len());
        for argument in task.arguments() {
            let redop = match argument.kind {
                ArgumentKind::Reduction => Some(*redops.next().ok_or_else(|| {
                    CoreError::internal("reduction argument without an operator")
                })?),
                _ => None,
            };
            arguments.push(LaunchArgument {
                kind: argument.kind,
                store: &argument.store,
                partition: strategy.partition(&argument.variable),
                redop,
            });
        }
        self.launch(LaunchRequest {
            library: &library,
            task_name: task.info().name(),
            local_task_id: task.local_task_id(),
            target,
            machine,
            mapper,
            mapper_task,
            launch_domain,
            single_dim: strategy.single_dim(),
            arguments,
            scalars: task.scalars(),
            communicators: task.communicators(),
            concurrent: task.is_concurrent(),
        })
    }

    /// Launches a manual task over its launch shape. A launch shape of a single point runs
    /// as a single task.
    pub fn submit_manual(&self, task: ManualTask) -> CoreResult<()> {
        let library = task.library().clone();
        let mapper = library.get_mapper();
        let mapper_task = task.to_mapper_task()?;
        let target = Self::select_target(
            mapper.as_ref(),
            &mapper_task,
            task.target(),
            &task.target_options(),
            task.info().name(),
        )?;
        let machine = task.machine().only(&[target]);
        let domain = Domain::from_extents(task.launch_shape());
        let launch_domain = match domain.volume() {
            0 => {
                debug!(
                    "skipping task {} of operation {} over an empty launch shape",
                    task.info().name(),
                    task.operation_id()
                );
                return Ok(());
            }
            1 => None,
            _ => Some(domain),
        };
        let mut redops = task.reduction_ops().iter();
        let mut arguments = Vec::with_capacity(task.arguments().len());
        for argument in task.arguments() {
            let redop = match argument.kind {
                ArgumentKind::Reduction => Some(*redops.next().ok_or_else(|| {
                    CoreError::internal("reduction argument without an operator")
                })?),
                _ => None,
            };
            arguments.push(LaunchArgument {
                kind: argument.kind,
                store: &argument.store,
                partition: &argument.partition,
                redop,
            });
        }
        self.launch(LaunchRequest {
            library: &library,
            task_name: task.info().name(),
            local_task_id: task.local_task_id(),
            target,
            machine,
            mapper,
            mapper_task,
            launch_domain,
            single_dim: task.launch_shape().len(),
            arguments,
            scalars: task.scalars(),
            communicators: task.communicators(),
            concurrent: task.is_concurrent(),
        })
    }

    /// Lowers a task whose partitions are decided and hands it to the substrate.
    fn launch(&self, request: LaunchRequest<'_>) -> CoreResult<()> {
        let LaunchRequest {
            library,
            task_name,
            local_task_id,
            target,
            machine,
            mapper,
            mapper_task,
            launch_domain,
            single_dim,
            arguments,
            scalars,
            communicators,
            concurrent,
        } = request;
        let task_id = library.get_task_id(local_task_id)?;
        if let Some(domain) = &launch_domain {
            if concurrent && domain.volume() > u64::from(machine.count(target)) {
                return Err(CoreError::invalid(format!(
                    "concurrent launch over {domain} needs more than the {} {target} processors",
                    machine.count(target)
                )));
            }
        }

        let mut launcher = TaskLauncher::new(
            library,
            task_id,
            target.variant(),
            machine.clone(),
            launch_domain.clone(),
            single_dim,
        );
        {
            let mut projections = self.0.projections.borrow_mut();
            for kind in [ArgumentKind::Input, ArgumentKind::Output, ArgumentKind::Reduction] {
                for argument in arguments.iter().filter(|x| x.kind == kind) {
                    launcher.add_store(
                        kind,
                        argument.store,
                        argument.partition,
                        argument.redop,
                        &mut projections,
                        &self.0.core_library,
                        self.0.substrate(),
                    )?;
                }
            }
        }
        for scalar in scalars {
            launcher.add_scalar(scalar.clone());
        }
        if let Some(domain) = &launch_domain {
            let mut manager = self.0.communicators.borrow_mut();
            let core = CoreLauncher::new(&self.0.core_library, self.0.substrate());
            let range = machine.processor_range(target);
            for name in communicators {
                let Some(factory) = manager.find_factory(name) else {
                    return Err(CoreError::invalid(format!("unknown communicator {name}")));
                };
                if !factory.is_supported_target(target) {
                    debug!("communicator {name} does not support {target}");
                    continue;
                }
                launcher.add_communicator(factory.find_or_create(&core, target, range, domain)?);
                if factory.needs_barrier() {
                    launcher.set_insert_barrier(true);
                }
            }
        }
        launcher.set_concurrent(concurrent);

        let memories = memory_options(target);
        let mappings = mapper.store_mappings(&mapper_task, &memories)?;
        validate_store_mappings(&mapper_task, target, &mappings)?;
        let pool_size = match memories.first() {
            Some(memory) => mapper.allocation_pool_size(&mapper_task, *memory)?,
            None => None,
        };
        launcher.set_pool_size(pool_size);
        let launch = launcher.build();

        let span = Span::enter_with_local_parent("Runtime::submit").with_properties(|| {
            [
                (SpanAttribute::LIBRARY_NAME, library.name().to_string()),
                (SpanAttribute::TASK_VARIANT, target.to_string()),
                (
                    SpanAttribute::TASK_PROVENANCE,
                    launch.provenance.clone().unwrap_or_default(),
                ),
            ]
        });
        let _guard = span.set_local_parent();
        let domain_name = launch.launch_domain.as_ref().map(|x| x.to_string());
        record_launch(&span, task_id, domain_name.as_deref(), launch.concurrent);
        let result = self.0.substrate.execute_task(&launch);
        record_error(&span, &result);
        let outcome = result?;
        self.complete(task_name, &arguments, launch_domain.is_some(), outcome)
    }

    /// Applies the outcome of a launch to the stores of the task.
    fn complete(
        &self,
        task_name: &str,
        arguments: &[LaunchArgument<'_>],
        index_launch: bool,
        outcome: LaunchOutcome,
    ) -> CoreResult<()> {
        if let Some(exception) = outcome.exception {
            return match scope::exception_mode() {
                ExceptionMode::Immediate => Err(CoreError::UserTaskException(exception)),
                ExceptionMode::Deferred => {
                    self.0.pending_exceptions.borrow_mut().push_back(exception);
                    Ok(())
                }
                ExceptionMode::Ignored => {
                    warn!("ignoring exception of task {task_name}: {exception}");
                    Ok(())
                }
            };
        }
        let outputs = arguments
            .iter()
            .filter(|x| x.kind == ArgumentKind::Output)
            .collect::<Vec<_>>();
        let reductions = arguments
            .iter()
            .filter(|x| x.kind == ArgumentKind::Reduction)
            .collect::<Vec<_>>();
        for (kind, index, future) in outcome.future_outputs {
            let arguments = match kind {
                ArgumentKind::Reduction => &reductions,
                _ => &outputs,
            };
            let Some(argument) = arguments.get(index) else {
                return Err(CoreError::internal(format!(
                    "substrate returned a value for missing {kind:?} argument {index}"
                )));
            };
            let storage = argument.store.storage();
            let extents = storage.extents().unwrap_or_default();
            storage.set_kind(StorageKind::Future { future, extents });
        }
        for (index, buffers) in outcome.bound_outputs {
            let Some(argument) = outputs.get(index) else {
                return Err(CoreError::internal(format!(
                    "substrate bound missing output {index}"
                )));
            };
            self.bind_output(argument.store, index_launch, buffers)?;
        }
        if index_launch {
            for argument in outputs.iter().chain(reductions.iter()) {
                if matches!(argument.partition, Partition::Tiling(_))
                    && !argument.store.is_unbound()
                {
                    argument.store.set_key_partition(argument.partition)?;
                }
            }
        }
        Ok(())
    }

    /// Turns the buffers bound by the point tasks into the region field of an unbound store.
    fn bind_output(
        &self,
        store: &LogicalStore,
        index_launch: bool,
        buffers: Vec<BoundBuffer>,
    ) -> CoreResult<()> {
        let ndim = store.dim();
        let extents = match buffers.as_slice() {
            [buffer] => buffer.extents.clone(),
            _ if ndim == 1 => vec![buffers.iter().map(|x| x.extents[0]).sum::<u64>()],
            _ => {
                return Err(CoreError::unsupported(format!(
                    "{ndim}-D unbound stores cannot be written by index launches"
                )))
            }
        };
        let weights = buffers.iter().map(|x| x.extents.first().copied().unwrap_or(1));
        let weights = weights.collect::<Vec<_>>();
        let data = buffers.into_iter().flat_map(|x| x.data).collect::<Vec<_>>();
        let field = self.allocate_field(&extents, store.ty().size())?;
        let mapping = field.map()?;
        self.0.substrate.write_region(&mapping.physical, &data)?;
        let storage = store.storage();
        storage.set_kind(StorageKind::RegionField(field));
        if index_launch && ndim == 1 {
            storage.set_key_partition(Partition::Weighted(Weighted::new(weights)));
        }
        debug!("bound {:?} to extents {extents:?}", store.storage_id());
        Ok(())
    }

    /// Writes `value` into every element of `store`.
    pub fn issue_fill(&self, store: &LogicalStore, value: &Scalar) -> CoreResult<()> {
        let operation_id = self.next_operation_id()?;
        match lower_fill(store, value)? {
            FillPlan::Future(future) => {
                let storage = store.storage();
                let extents = storage.extents().unwrap_or_default();
                storage.set_kind(StorageKind::Future { future, extents });
            }
            FillPlan::Launch(launch) => {
                debug!("operation {operation_id} fills {}", launch.rect);
                self.0.substrate.execute_fill(&launch)?;
            }
            FillPlan::Empty => debug!("operation {operation_id} fills an empty store"),
        }
        Ok(())
    }

    /// Fills `store` with the single element of `value`, which must have volume 1.
    pub fn issue_fill_with_store(&self, store: &LogicalStore, value: &LogicalStore) -> CoreResult<()> {
        if value.is_unbound() || value.volume()? != 1 {
            return Err(CoreError::invalid(format!(
                "a fill value must be a store of volume 1, not {value:?}"
            )));
        }
        let scalar = match value.future() {
            Some(future) => future.get_scalar(value.ty())?,
            None => {
                let physical = value.get_physical_store()?;
                let bytes = physical.read_bytes(physical.domain().lo())?;
                Scalar::from_bytes(value.ty().clone(), bytes.to_vec())?
            }
        };
        self.issue_fill(store, &scalar)
    }

    /// Orders every later operation after the operations issued so far. A blocking fence
    /// also waits for them to finish.
    pub fn issue_execution_fence(&self, block: bool) -> CoreResult<()> {
        let operation_id = self.next_operation_id()?;
        debug!("operation {operation_id} is an execution fence (block: {block})");
        let token = self.0.substrate.issue_execution_fence()?;
        if block {
            token.wait();
        }
        Ok(())
    }

    /// Reduces the 1-D `store` with the task `local_task_id` of `library`. Each round
    /// launches one point task per group of `radix` consecutive pieces. A point task reads
    /// its group through input 0 and binds its partial result to the unbound output 0.
    /// Rounds repeat over the partial results until a single task remains, whose output
    /// is returned.
    pub fn tree_reduce(
        &self,
        library: &Library,
        local_task_id: i64,
        store: &LogicalStore,
        radix: usize,
    ) -> CoreResult<LogicalStore> {
        if radix < 2 {
            return Err(CoreError::invalid(format!("radix must be at least 2, not {radix}")));
        }
        if store.is_unbound() || store.dim() != 1 {
            return Err(CoreError::invalid(format!(
                "tree reduction needs a bound 1-D store, not {store:?}"
            )));
        }
        let extent = store.extents()?[0];
        let num_pieces = u64::from(self.get_machine().preferred_count().max(1));
        let tile = extent.div_ceil(num_pieces).max(1) * radix as u64;
        let num_tasks = extent.div_ceil(tile).max(1);
        let mut partition = Partition::tiling(vec![tile], vec![num_tasks], vec![0]);
        let mut input = store.clone();
        let mut round = 0;
        loop {
            let shape = partition.color_shape().unwrap_or_else(|| vec![1]);
            debug!("tree reduction round {round} launches {} tasks", shape[0]);
            let output = self.create_unbound_store(store.ty().clone(), 1)?;
            let mut task = self.create_manual_task(library, local_task_id, &shape)?;
            task.add_input_with(&input, partition)?;
            task.add_output(&output)?;
            self.submit_manual(task)?;
            if shape[0] == 1 {
                return Ok(output);
            }
            partition = Self::group_pieces(&output, radix)?;
            input = output;
            round += 1;
        }
    }

    /// Groups the pieces of the key partition of a store written by an index launch into
    /// one image rectangle per `radix` consecutive pieces.
    fn group_pieces(store: &LogicalStore, radix: usize) -> CoreResult<Partition> {
        let bounds = Domain::from_extents(&store.extents()?);
        let pieces = match store.key_partition() {
            Some(partition @ Partition::Weighted(_)) => {
                let colors = partition.launch_domain().map(|x| x.volume()).unwrap_or(1);
                (0..colors as i64)
                    .map(|c| partition.child_domain(&Point::new([c]), &bounds))
                    .collect::<CoreResult<Vec<_>>>()?
            }
            _ => vec![bounds.clone()],
        };
        let rects = pieces
            .chunks(radix)
            .map(|group| {
                let nonempty = group.iter().filter(|x| !x.is_empty());
                let lo = nonempty.clone().map(|x| x.lo()[0]).min();
                let hi = nonempty.map(|x| x.hi()[0]).max();
                match (lo, hi) {
                    (Some(lo), Some(hi)) => Domain::new(Point::new([lo]), Point::new([hi])),
                    _ => Ok(Domain::empty(1)),
                }
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Partition::Image(Image::new(vec![rects.len() as u64], rects)?))
    }

    fn issue_copy_with(
        &self,
        target: &LogicalStore,
        target_indirect: Option<&LogicalStore>,
        source: &LogicalStore,
        source_indirect: Option<&LogicalStore>,
        redop: Option<i64>,
    ) -> CoreResult<()> {
        let operation_id = self.next_operation_id()?;
        match lower_copy(target, target_indirect, source, source_indirect, redop)? {
            CopyPlan::Future(future) => {
                let storage = target.storage();
                let extents = storage.extents().unwrap_or_default();
                storage.set_kind(StorageKind::Future { future, extents });
            }
            CopyPlan::Launch(launch) => {
                debug!(
                    "operation {operation_id} copies {} elements",
                    launch.volume()
                );
                self.0.substrate.execute_copy(&launch)?;
            }
            CopyPlan::Empty => debug!("operation {operation_id} copies nothing"),
        }
        Ok(())
    }

    /// Copies `source` into `target`, reducing with the operator `redop` if given.
    pub fn issue_copy(
        &self,
        target: &LogicalStore,
        source: &LogicalStore,
        redop: Option<i64>,
    ) -> CoreResult<()> {
        self.issue_copy_with(target, None, source, None, redop)
    }

    /// `target[p] = source[source_indirect[p]]`
    pub fn issue_gather(
        &self,
        target: &LogicalStore,
        source: &LogicalStore,
        source_indirect: &LogicalStore,
        redop: Option<i64>,
    ) -> CoreResult<()> {
        self.issue_copy_with(target, None, source, Some(source_indirect), redop)
    }

    /// `target[target_indirect[p]] = source[p]`
    pub fn issue_scatter(
        &self,
        target: &LogicalStore,
        target_indirect: &LogicalStore,
        source: &LogicalStore,
        redop: Option<i64>,
    ) -> CoreResult<()> {
        self.issue_copy_with(target, Some(target_indirect), source, None, redop)
    }

    /// `target[target_indirect[p]] = source[source_indirect[p]]`
    pub fn issue_scatter_gather(
        &self,
        target: &LogicalStore,
        target_indirect: &LogicalStore,
        source: &LogicalStore,
        source_indirect: &LogicalStore,
        redop: Option<i64>,
    ) -> CoreResult<()> {
        self.issue_copy_with(
            target,
            Some(target_indirect),
            source,
            Some(source_indirect),
            redop,
        )
    }

    /// Raises the oldest exception deferred by a task launched in the deferred mode.
    pub fn raise_pending_exception(&self) -> CoreResult<()> {
        match self.0.pending_exceptions.borrow_mut().pop_front() {
            Some(exception) => Err(CoreError::UserTaskException(exception)),
            None => Ok(()),
        }
    }

    pub fn get_tunable(&self, library: &Library, tunable_id: i64) -> CoreResult<Scalar> {
        Ok(library.get_mapper().tunable_value(tunable_id)?)
    }

    pub fn register_communicator_factory(
        &self,
        name: &str,
        factory: Box<dyn CommunicatorFactory>,
    ) {
        self.0
            .communicators
            .borrow_mut()
            .register_factory(name, factory);
    }

    /// Returns the communicator of backend `name` for a launch over `launch_domain`
    /// on the preferred processors of the current scope.
    pub fn find_or_create_communicator(
        &self,
        name: &str,
        launch_domain: &Domain,
    ) -> CoreResult<FutureMap> {
        let machine = self.get_machine();
        let target = machine.preferred_target()?;
        let range = machine.processor_range(target);
        let mut manager = self.0.communicators.borrow_mut();
        let Some(factory) = manager.find_factory(name) else {
            return Err(CoreError::invalid(format!("unknown communicator {name}")));
        };
        if !factory.is_supported_target(target) {
            return Err(CoreError::invalid(format!(
                "communicator {name} does not support {target}"
            )));
        }
        let core = CoreLauncher::new(&self.0.core_library, self.0.substrate());
        factory.find_or_create(&core, target, range, launch_domain)
    }

    pub fn communicator_stats(&self, name: &str) -> Option<CommunicatorStats> {
        self.0.communicators.borrow().stats(name)
    }

    pub fn num_free_fields(&self) -> usize {
        let managed = self
            .0
            .field_managers
            .borrow()
            .values()
            .map(|x| x.num_free_fields())
            .sum::<usize>();
        managed + self.0.pending_frees.borrow().len()
    }

    /// Finalizes the communicators and releases the free fields. Region fields dropped
    /// afterwards are leaked. Later calls do nothing.
    pub fn destroy(&self) {
        if self.0.destroyed.get() {
            return;
        }
        debug!("destroying runtime");
        let core = CoreLauncher::new(&self.0.core_library, self.0.substrate());
        self.0.communicators.borrow_mut().destroy(&core);
        let mut managers = self.0.field_managers.borrow_mut();
        self.0.drain_pending_frees(&mut managers);
        for manager in managers.values_mut() {
            manager.destroy();
        }
        drop(managers);
        if let Some(exception) = self.0.pending_exceptions.borrow_mut().pop_front() {
            error!("runtime destroyed with a pending exception: {exception}");
        }
        self.0.destroyed.set(true);
        if let Some(machine) = self.0.installed_machine.borrow_mut().take() {
            scope::exchange_machine(machine);
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.destroy();
    }
}

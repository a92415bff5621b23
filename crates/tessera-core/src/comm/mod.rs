//! Communicators for tasks that exchange data among their point tasks.

mod cached;
mod cal;
mod cpu;
mod manager;
mod mpi;
mod nccl;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use fastrace::Span;
use log::debug;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tessera_telemetry::common::SpanAttribute;
use tessera_telemetry::recorder::record_error;

pub use cached::CommunicatorStats;
pub(crate) use manager::CommunicatorManager;

use crate::domain::Domain;
use crate::error::{CoreError, CoreResult, TaskError, TaskResult};
use crate::library::{Library, TaskInfo, VariantOptions};
use crate::machine::{Machine, TaskTarget};
use crate::operation::context::TaskContext;
use crate::operation::launcher::TaskLauncher;
use crate::scalar::Scalar;
use crate::substrate::{Future, FutureMap, FutureValue, Substrate};

/// The tasks of the core library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[num_enum(error_type(name = CoreError, constructor = CoreTask::invalid))]
#[repr(i64)]
pub enum CoreTask {
    CpuCommMapping = 1,
    CpuCommInit = 2,
    CpuCommFinalize = 3,
    MpiCommMapping = 4,
    MpiCommInit = 5,
    MpiCommFinalize = 6,
    NcclCommInit = 7,
    NcclCommFinalize = 8,
    CalCommInit = 9,
    CalCommFinalize = 10,
}

impl CoreTask {
    fn invalid(value: i64) -> CoreError {
        CoreError::invalid(format!("core task: {value}"))
    }

    pub fn local_id(self) -> i64 {
        self.into()
    }
}

/// The handle a communicator init task returns to each participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Communicator {
    backend: &'static str,
    comm_id: i32,
    rank: u32,
    num_ranks: u32,
}

impl Communicator {
    pub fn backend(&self) -> &str {
        self.backend
    }

    pub fn comm_id(&self) -> i32 {
        self.comm_id
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn num_ranks(&self) -> u32 {
        self.num_ranks
    }
}

static NEXT_COMM_ID: AtomicI32 = AtomicI32::new(0);

/// Generates a process-unique communicator id.
fn next_comm_id() -> Future {
    Future::from_scalar(&Scalar::new(NEXT_COMM_ID.fetch_add(1, Ordering::Relaxed)))
}

/// Launches core-library tasks over `0..num_tasks` on behalf of communicator factories.
pub struct CoreLauncher<'a> {
    core_library: &'a Library,
    substrate: &'a dyn Substrate,
}

impl<'a> CoreLauncher<'a> {
    pub(crate) fn new(core_library: &'a Library, substrate: &'a dyn Substrate) -> Self {
        Self {
            core_library,
            substrate,
        }
    }

    /// Runs `task` as a concurrent index launch on the preferred target of `machine`.
    pub fn execute(
        &self,
        task: CoreTask,
        machine: &Machine,
        num_tasks: u32,
        futures: Vec<Future>,
        communicators: Vec<FutureMap>,
    ) -> CoreResult<FutureMap> {
        let tag = machine.preferred_target()?.variant();
        let task_id = self.core_library.get_task_id(task.local_id())?;
        let domain = Domain::from_extents(&[num_tasks as u64]);
        let mut launcher = TaskLauncher::new(
            self.core_library,
            task_id,
            tag,
            machine.clone(),
            Some(domain),
            1,
        );
        for future in futures {
            launcher.add_future(future);
        }
        for communicator in communicators {
            launcher.add_communicator(communicator);
        }
        launcher.set_concurrent(true);
        let outcome = self.substrate.execute_task(&launcher.build())?;
        if let Some(exception) = outcome.exception {
            return Err(CoreError::internal(format!("{task:?} failed: {exception}")));
        }
        Ok(outcome.returns)
    }
}

/// Creates and destroys communicators of one backend.
pub trait CommunicatorFactory {
    /// Whether launches using the communicator need a barrier before they start.
    fn needs_barrier(&self) -> bool;

    fn is_supported_target(&self, target: TaskTarget) -> bool;

    /// Creates a communicator over `num_tasks` participants on the processors of `machine`
    /// and returns one handle per participant.
    fn initialize(
        &self,
        launcher: &CoreLauncher<'_>,
        machine: &Machine,
        num_tasks: u32,
    ) -> CoreResult<FutureMap>;

    fn finalize(
        &self,
        launcher: &CoreLauncher<'_>,
        machine: &Machine,
        num_tasks: u32,
        communicator: &FutureMap,
    ) -> CoreResult<()>;
}

fn point_rank(context: &TaskContext) -> TaskResult<u32> {
    let rank = context.task_index().coords().first().copied().unwrap_or(0);
    u32::try_from(rank).map_err(|_| TaskError::new(0, format!("invalid rank {rank}")))
}

/// Creates the communicator handle of one participant.
/// Futures are the communicator id followed, if any, by the rank mapping of all participants.
fn init_body(backend: &'static str, context: &mut TaskContext) -> TaskResult<()> {
    let rank = point_rank(context)?;
    let num_ranks = context.launch_domain().volume() as u32;
    let comm_id = context.future(0)?.get::<i32>()?;
    let mapping = context.futures().get(1..).unwrap_or_default();
    if !mapping.is_empty() {
        if mapping.len() != num_ranks as usize {
            return Err(TaskError::new(
                0,
                format!("{backend} mapping has {} entries for {num_ranks} ranks", mapping.len()),
            ));
        }
        let mapped = mapping[rank as usize].get::<i32>()?;
        if mapped != rank as i32 {
            return Err(TaskError::new(
                0,
                format!("{backend} rank {rank} is mapped to {mapped}"),
            ));
        }
    }
    let communicator = Communicator {
        backend,
        comm_id,
        rank,
        num_ranks,
    };
    context.set_return_value(FutureValue::Opaque(Arc::new(communicator)));
    Ok(())
}

fn mapping_body(context: &mut TaskContext) -> TaskResult<()> {
    let rank = point_rank(context)? as i32;
    context.set_return_value(FutureValue::Buffer(Scalar::new(rank).into_bytes()));
    Ok(())
}

fn finalize_body(backend: &'static str, context: &mut TaskContext) -> TaskResult<()> {
    let rank = point_rank(context)?;
    let Some(communicator) = context.communicator(0)?.get_opaque::<Communicator>() else {
        return Err(TaskError::new(0, format!("{backend} finalize got no communicator")));
    };
    if communicator.backend != backend || communicator.rank != rank {
        return Err(TaskError::new(
            0,
            format!("{backend} finalize at rank {rank} got communicator {communicator:?}"),
        ));
    }
    Ok(())
}

fn concurrent_task<F>(name: &str, targets: &[TaskTarget], body: F) -> TaskInfo
where
    F: Fn(&mut TaskContext) -> TaskResult<()> + Send + Sync + Clone + 'static,
{
    let options = VariantOptions::default().with_concurrent(true);
    targets.iter().fold(TaskInfo::new(name), |info, target| {
        info.with_variant_options(target.variant(), body.clone(), options)
    })
}

const ALL_TARGETS: [TaskTarget; 3] = [TaskTarget::Gpu, TaskTarget::Omp, TaskTarget::Cpu];
const HOST_TARGETS: [TaskTarget; 2] = [TaskTarget::Omp, TaskTarget::Cpu];
const GPU_TARGETS: [TaskTarget; 1] = [TaskTarget::Gpu];

/// Registers the communicator tasks with the core library.
pub(crate) fn register_tasks(core_library: &Library) -> CoreResult<()> {
    let tasks = [
        (
            CoreTask::CpuCommMapping,
            concurrent_task("cpu_comm_mapping", &ALL_TARGETS, mapping_body),
        ),
        (
            CoreTask::CpuCommInit,
            concurrent_task("cpu_comm_init", &ALL_TARGETS, |c: &mut TaskContext| {
                init_body(cpu::NAME, c)
            }),
        ),
        (
            CoreTask::CpuCommFinalize,
            concurrent_task("cpu_comm_finalize", &ALL_TARGETS, |c: &mut TaskContext| {
                finalize_body(cpu::NAME, c)
            }),
        ),
        (
            CoreTask::MpiCommMapping,
            concurrent_task("mpi_comm_mapping", &HOST_TARGETS, mapping_body),
        ),
        (
            CoreTask::MpiCommInit,
            concurrent_task("mpi_comm_init", &HOST_TARGETS, |c: &mut TaskContext| {
                init_body(mpi::NAME, c)
            }),
        ),
        (
            CoreTask::MpiCommFinalize,
            concurrent_task("mpi_comm_finalize", &HOST_TARGETS, |c: &mut TaskContext| {
                finalize_body(mpi::NAME, c)
            }),
        ),
        (
            CoreTask::NcclCommInit,
            concurrent_task("nccl_comm_init", &GPU_TARGETS, |c: &mut TaskContext| {
                init_body(nccl::NAME, c)
            }),
        ),
        (
            CoreTask::NcclCommFinalize,
            concurrent_task("nccl_comm_finalize", &GPU_TARGETS, |c: &mut TaskContext| {
                finalize_body(nccl::NAME, c)
            }),
        ),
        (
            CoreTask::CalCommInit,
            concurrent_task("cal_comm_init", &GPU_TARGETS, |c: &mut TaskContext| {
                init_body(cal::NAME, c)
            }),
        ),
        (
            CoreTask::CalCommFinalize,
            concurrent_task("cal_comm_finalize", &GPU_TARGETS, |c: &mut TaskContext| {
                finalize_body(cal::NAME, c)
            }),
        ),
    ];
    for (task, info) in tasks {
        core_library.register_task(task.local_id(), info)?;
    }
    Ok(())
}

/// Registers the built-in factories. The MPI factory is left out when MPI is disabled.
pub(crate) fn register_factories(manager: &mut CommunicatorManager, disable_mpi: bool) {
    manager.register_factory(cpu::NAME, Box::new(cpu::CpuFactory));
    if !disable_mpi {
        manager.register_factory(mpi::NAME, Box::new(mpi::MpiFactory));
    }
    manager.register_factory(nccl::NAME, Box::new(nccl::NcclFactory));
    manager.register_factory(cal::NAME, Box::new(cal::CalFactory));
}

/// Runs the init task of a backend, passing the communicator id and the given extra futures.
fn initialize_with(
    backend: &'static str,
    task: CoreTask,
    launcher: &CoreLauncher<'_>,
    machine: &Machine,
    num_tasks: u32,
    mapping: Option<CoreTask>,
) -> CoreResult<FutureMap> {
    let span = Span::enter_with_local_parent("CommunicatorFactory::initialize").with_properties(
        || {
            [
                (SpanAttribute::COMMUNICATOR_BACKEND, backend.to_string()),
                (SpanAttribute::COMMUNICATOR_NUM_TASKS, num_tasks.to_string()),
            ]
        },
    );
    let _guard = span.set_local_parent();
    let result = (|| {
        let comm_id = next_comm_id();
        let mut futures = vec![comm_id.clone()];
        if let Some(mapping) = mapping {
            let ranks = launcher.execute(mapping, machine, num_tasks, vec![comm_id], vec![])?;
            futures.extend(ranks.futures().iter().cloned());
        }
        debug!("initializing {backend} communicator over {num_tasks} tasks on {machine}");
        launcher.execute(task, machine, num_tasks, futures, vec![])
    })();
    record_error(&span, &result);
    result
}

fn finalize_with(
    backend: &'static str,
    task: CoreTask,
    launcher: &CoreLauncher<'_>,
    machine: &Machine,
    num_tasks: u32,
    communicator: &FutureMap,
) -> CoreResult<()> {
    debug!("finalizing {backend} communicator over {num_tasks} tasks on {machine}");
    launcher.execute(task, machine, num_tasks, vec![], vec![communicator.clone()])?;
    Ok(())
}


use crate::comm::{finalize_with, initialize_with, CommunicatorFactory, CoreLauncher, CoreTask};
use crate::error::CoreResult;
use crate::machine::{Machine, TaskTarget};
use crate::substrate::FutureMap;

pub(super) const NAME: &str = "mpi";

pub(super) struct MpiFactory;

impl CommunicatorFactory for MpiFactory {
    fn needs_barrier(&self) -> bool {
        false
    }

    fn is_supported_target(&self, target: TaskTarget) -> bool {
        matches!(target, TaskTarget::Cpu | TaskTarget::Omp)
    }

    fn initialize(
        &self,
        launcher: &CoreLauncher<'_>,
        machine: &Machine,
        num_tasks: u32,
    ) -> CoreResult<FutureMap> {
        initialize_with(
            NAME,
            CoreTask::MpiCommInit,
            launcher,
            machine,
            num_tasks,
            Some(CoreTask::MpiCommMapping),
        )
    }

    fn finalize(
        &self,
        launcher: &CoreLauncher<'_>,
        machine: &Machine,
        num_tasks: u32,
        communicator: &FutureMap,
    ) -> CoreResult<()> {
        finalize_with(
            NAME,
            CoreTask::MpiCommFinalize,
            launcher,
            machine,
            num_tasks,
            communicator,
        )
    }
}

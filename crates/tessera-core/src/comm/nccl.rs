use crate::comm::{finalize_with, initialize_with, CommunicatorFactory, CoreLauncher, CoreTask};
use crate::error::CoreResult;
use crate::machine::{Machine, TaskTarget};
use crate::substrate::FutureMap;

pub(super) const NAME: &str = "nccl";

/// GPU collectives. Launches using the communicator wait on a barrier so that all
/// participants enter their collective calls together.
pub(super) struct NcclFactory;

impl CommunicatorFactory for NcclFactory {
    fn needs_barrier(&self) -> bool {
        true
    }

    fn is_supported_target(&self, target: TaskTarget) -> bool {
        target == TaskTarget::Gpu
    }

    fn initialize(
        &self,
        launcher: &CoreLauncher<'_>,
        machine: &Machine,
        num_tasks: u32,
    ) -> CoreResult<FutureMap> {
        initialize_with(NAME, CoreTask::NcclCommInit, launcher, machine, num_tasks, None)
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
            CoreTask::NcclCommFinalize,
            launcher,
            machine,
            num_tasks,
            communicator,
        )
    }
}

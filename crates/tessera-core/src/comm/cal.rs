use crate::comm::{finalize_with, initialize_with, CommunicatorFactory, CoreLauncher, CoreTask};
use crate::error::CoreResult;
use crate::machine::{Machine, TaskTarget};
use crate::substrate::FutureMap;

pub(super) const NAME: &str = "cal";

pub(super) struct CalFactory;

impl CommunicatorFactory for CalFactory {
    fn needs_barrier(&self) -> bool {
        false
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
        initialize_with(NAME, CoreTask::CalCommInit, launcher, machine, num_tasks, None)
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
            CoreTask::CalCommFinalize,
            launcher,
            machine,
            num_tasks,
            communicator,
        )
    }
}

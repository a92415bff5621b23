use crate::comm::{finalize_with, initialize_with, CommunicatorFactory, CoreLauncher, CoreTask};
use crate::error::CoreResult;
use crate::machine::{Machine, TaskTarget};
use crate::substrate::FutureMap;

pub(super) const NAME: &str = "cpu";

/// The in-process collective. Participants first report their ranks, then create
/// their handles from the collected mapping.
pub(super) struct CpuFactory;

impl CommunicatorFactory for CpuFactory {
    fn needs_barrier(&self) -> bool {
        false
    }

    fn is_supported_target(&self, _target: TaskTarget) -> bool {
        true
    }

    fn initialize(
        &self,
        launcher: &CoreLauncher<'_>,
        machine: &Machine,
        num_tasks: u32,
    ) -> CoreResult<FutureMap> {
        initialize_with(
            NAME,
            CoreTask::CpuCommInit,
            launcher,
            machine,
            num_tasks,
            Some(CoreTask::CpuCommMapping),
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
            CoreTask::CpuCommFinalize,
            launcher,
            machine,
            num_tasks,
            communicator,
        )
    }
}

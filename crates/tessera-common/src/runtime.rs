use tokio::runtime::{Handle, Runtime};

use crate::config::SubstrateConfig;
use crate::error::{CommonError, CommonResult};

/// Owns the worker threads that execute point tasks.
#[derive(Debug)]
pub struct RuntimeManager {
    primary: Runtime,
}

impl RuntimeManager {
    pub fn try_new(config: &SubstrateConfig) -> CommonResult<Self> {
        let primary = Self::build_runtime(config.worker_threads, config.stack_size)?;
        Ok(Self { primary })
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            primary: self.primary.handle().clone(),
        }
    }

    fn build_runtime(worker_threads: usize, stack_size: usize) -> CommonResult<Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_stack_size(stack_size)
            .thread_name("tessera-worker")
            .enable_all()
            .build()
            .map_err(|e| CommonError::internal(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    primary: Handle,
}

impl RuntimeHandle {
    pub fn primary(&self) -> &Handle {
        &self.primary
    }
}

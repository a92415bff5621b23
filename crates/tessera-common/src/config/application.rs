use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

/// The prefix of environment variables that override configuration values.
/// Nested keys are separated by `__`, e.g. `TESSERA__CORE__DISABLE_MPI=true`.
pub const ENV_PREFIX: &str = "TESSERA__";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub core: CoreConfig,
    pub library: LibraryConfig,
    pub substrate: SubstrateConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        let config: Self = Figment::from(Toml::string(DEFAULT_CONFIG))
            .admerge(Env::prefixed(ENV_PREFIX).map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the embedded defaults without consulting the environment.
    pub fn defaults() -> CommonResult<Self> {
        let config: Self = Figment::from(Toml::string(DEFAULT_CONFIG))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CommonResult<()> {
        if self.core.min_shard_volume == 0 {
            return Err(CommonError::invalid("core.min_shard_volume must be positive"));
        }
        if self.core.field_reuse_frequency == 0 {
            return Err(CommonError::invalid(
                "core.field_reuse_frequency must be positive",
            ));
        }
        if self.library.max_dyn_tasks > self.library.max_tasks {
            return Err(CommonError::invalid(format!(
                "library.max_dyn_tasks ({}) exceeds library.max_tasks ({})",
                self.library.max_dyn_tasks, self.library.max_tasks
            )));
        }
        if self.substrate.cpus == 0 {
            return Err(CommonError::invalid("substrate.cpus must be positive"));
        }
        if self.substrate.worker_threads == 0 {
            return Err(CommonError::invalid(
                "substrate.worker_threads must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub min_shard_volume: u64,
    pub field_reuse_frequency: u32,
    pub disable_mpi: bool,
    pub log_partitioning_decisions: bool,
}

/// The default resource blocks reserved for a library
/// when the library is created without an explicit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub max_tasks: u32,
    pub max_dyn_tasks: u32,
    pub max_reduction_ops: u32,
    pub max_projections: u32,
    pub max_shardings: u32,
}

/// Configuration of the in-process substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateConfig {
    pub cpus: u32,
    pub omps: u32,
    pub gpus: u32,
    pub worker_threads: usize,
    pub stack_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub export_traces: bool,
    pub log_span_events: bool,
    pub traces_report_interval_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() -> CommonResult<()> {
        let config = AppConfig::defaults()?;
        assert_eq!(config.core.min_shard_volume, 1);
        assert!(!config.core.disable_mpi);
        assert_eq!(config.library.max_tasks, 1024);
        assert_eq!(config.substrate.cpus, 4);
        Ok(())
    }

    #[test]
    fn test_invalid_dynamic_task_budget() -> CommonResult<()> {
        let mut config = AppConfig::defaults()?;
        config.library.max_dyn_tasks = config.library.max_tasks + 1;
        assert!(matches!(
            config.validate(),
            Err(CommonError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("TESSERA__CORE__DISABLE_MPI", "true");
            jail.set_env("TESSERA__SUBSTRATE__CPUS", "8");
            let config = AppConfig::load().map_err(|e| e.to_string())?;
            assert!(config.core.disable_mpi);
            assert_eq!(config.substrate.cpus, 8);
            Ok(())
        });
    }
}

#![allow(dead_code, clippy::expect_used)]

use std::collections::BTreeMap;

use tessera_common::config::AppConfig;
use tessera_core::reduction::ReductionOp;
use tessera_core::types::NativeType;
use tessera_core::{CoreResult, Library, ResourceConfig, Runtime, Scalar, Type};
use tessera_telemetry::telemetry::init_telemetry;

/// Installs the control-plane logger and span reporter.
pub fn init_logging() {
    let config = AppConfig::defaults().expect("default configuration").telemetry;
    // Every test after the first one in a binary gets an error here.
    let _ = init_telemetry(&config);
}

pub fn config(cpus: u32, gpus: u32) -> AppConfig {
    let mut config = AppConfig::defaults().expect("default configuration");
    config.substrate.cpus = cpus;
    config.substrate.gpus = gpus;
    config
}

pub fn runtime(cpus: u32, gpus: u32) -> Runtime {
    init_logging();
    Runtime::try_new(&config(cpus, gpus)).expect("runtime")
}

pub fn library(runtime: &Runtime, name: &str) -> Library {
    let resources = ResourceConfig {
        max_tasks: 32,
        max_dyn_tasks: 0,
        max_reduction_ops: 4,
        max_projections: 0,
        max_shardings: 0,
    };
    runtime
        .create_library(name, Some(resources), None, BTreeMap::new())
        .expect("library")
}

/// Sums `i64` elements.
pub struct SumOp;

impl ReductionOp for SumOp {
    fn value_type(&self) -> Type {
        Type::int64()
    }

    fn identity(&self) -> Scalar {
        Scalar::new(0i64)
    }

    fn apply(&self, lhs: &mut [u8], rhs: &[u8]) {
        let value = i64::read_bytes(lhs) + i64::read_bytes(rhs);
        value.write_bytes(lhs);
    }

    fn fold(&self, rhs1: &mut [u8], rhs2: &[u8]) {
        self.apply(rhs1, rhs2);
    }
}

/// The C-order values of a store.
pub fn values<T: NativeType>(store: &tessera_core::LogicalStore) -> CoreResult<Vec<T>> {
    store.get_physical_store()?.values::<T>()
}

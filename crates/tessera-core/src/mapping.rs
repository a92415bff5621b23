//! The strategy interface the core consults while lowering operations.

use thiserror::Error;

use crate::error::{CoreError, CoreResult};
use crate::machine::{Machine, StoreTarget, TaskTarget};
use crate::scalar::Scalar;
use crate::types::Type;

pub type MapperResult<T> = Result<T, MapperError>;

#[derive(Debug, Error)]
#[error("mapper error: {0}")]
pub struct MapperError(pub String);

impl From<MapperError> for CoreError {
    fn from(error: MapperError) -> Self {
        CoreError::InternalError(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentKind {
    Input,
    Output,
    Reduction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperStore {
    pub ty: Type,
    /// The extents of the store, or `None` for an unbound store.
    pub extents: Option<Vec<u64>>,
    pub is_future: bool,
}

/// The view of a task that a mapper can inspect.
#[derive(Debug, Clone)]
pub struct MapperTask {
    pub library: String,
    pub task_id: i64,
    pub inputs: Vec<MapperStore>,
    pub outputs: Vec<MapperStore>,
    pub reductions: Vec<MapperStore>,
    pub num_scalars: usize,
    pub machine: Machine,
}

impl MapperTask {
    fn arguments(&self, kind: ArgumentKind) -> &[MapperStore] {
        match kind {
            ArgumentKind::Input => &self.inputs,
            ArgumentKind::Output => &self.outputs,
            ArgumentKind::Reduction => &self.reductions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimOrdering {
    C,
    Fortran,
}

/// The placement of one store argument of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMapping {
    pub kind: ArgumentKind,
    pub index: usize,
    pub target: StoreTarget,
    pub ordering: DimOrdering,
    pub exact: bool,
}

impl StoreMapping {
    pub fn default_for(kind: ArgumentKind, index: usize, target: StoreTarget) -> Self {
        Self {
            kind,
            index,
            target,
            ordering: DimOrdering::C,
            exact: false,
        }
    }
}

pub trait Mapper {
    /// Chooses the target among `options`, which are listed in preference order.
    fn task_target(&self, task: &MapperTask, options: &[TaskTarget]) -> MapperResult<TaskTarget>;

    fn store_mappings(
        &self,
        task: &MapperTask,
        options: &[StoreTarget],
    ) -> MapperResult<Vec<StoreMapping>>;

    /// The upper bound in bytes of the output buffers a task creates in `memory`.
    /// `None` means the pool is unbounded.
    fn allocation_pool_size(
        &self,
        task: &MapperTask,
        memory: StoreTarget,
    ) -> MapperResult<Option<usize>>;

    fn tunable_value(&self, tunable_id: i64) -> MapperResult<Scalar>;
}

/// Chooses the preferred target and leaves every placement to the substrate.
#[derive(Debug, Default)]
pub struct DefaultMapper;

impl Mapper for DefaultMapper {
    fn task_target(&self, _task: &MapperTask, options: &[TaskTarget]) -> MapperResult<TaskTarget> {
        options
            .first()
            .copied()
            .ok_or_else(|| MapperError("no task target available".to_string()))
    }

    fn store_mappings(
        &self,
        _task: &MapperTask,
        _options: &[StoreTarget],
    ) -> MapperResult<Vec<StoreMapping>> {
        Ok(vec![])
    }

    fn allocation_pool_size(
        &self,
        _task: &MapperTask,
        _memory: StoreTarget,
    ) -> MapperResult<Option<usize>> {
        Ok(None)
    }

    fn tunable_value(&self, tunable_id: i64) -> MapperResult<Scalar> {
        Err(MapperError(format!("unknown tunable: {tunable_id}")))
    }
}

/// The memories a task running on `target` may place its stores in, in preference order.
pub fn memory_options(target: TaskTarget) -> Vec<StoreTarget> {
    match target {
        TaskTarget::Gpu => vec![StoreTarget::Fbmem, StoreTarget::Zcmem],
        TaskTarget::Omp => vec![StoreTarget::Socketmem, StoreTarget::Sysmem, StoreTarget::Zcmem],
        TaskTarget::Cpu => vec![StoreTarget::Sysmem, StoreTarget::Zcmem],
    }
}

/// Checks the mappings returned by a mapper against the task.
/// Any violation is reported as an internal error, as the mapper is at fault.
pub fn validate_store_mappings(
    task: &MapperTask,
    target: TaskTarget,
    mappings: &[StoreMapping],
) -> CoreResult<()> {
    let mut seen = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        let count = task.arguments(mapping.kind).len();
        if mapping.index >= count {
            return Err(CoreError::internal(format!(
                "mapper returned a mapping for {:?} {} but the task has {count}",
                mapping.kind, mapping.index
            )));
        }
        let key = (mapping.kind, mapping.index);
        if seen.contains(&key) {
            return Err(CoreError::internal(format!(
                "mapper returned multiple mappings for {:?} {}",
                mapping.kind, mapping.index
            )));
        }
        seen.push(key);
        if !mapping.target.is_accessible_from(target) {
            return Err(CoreError::internal(format!(
                "mapper placed {:?} {} in {} which is not accessible from {target}",
                mapping.kind, mapping.index, mapping.target
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> MapperTask {
        MapperTask {
            library: "test".to_string(),
            task_id: 0,
            inputs: vec![MapperStore {
                ty: Type::int64(),
                extents: Some(vec![10]),
                is_future: false,
            }],
            outputs: vec![],
            reductions: vec![],
            num_scalars: 0,
            machine: Machine::default(),
        }
    }

    #[test]
    fn test_validate_store_mappings() {
        let task = task();
        let valid = StoreMapping::default_for(ArgumentKind::Input, 0, StoreTarget::Sysmem);
        assert!(validate_store_mappings(&task, TaskTarget::Cpu, &[valid.clone()]).is_ok());
        assert!(matches!(
            validate_store_mappings(&task, TaskTarget::Cpu, &[valid.clone(), valid]),
            Err(CoreError::InternalError(_))
        ));
        let out_of_range = StoreMapping::default_for(ArgumentKind::Output, 0, StoreTarget::Sysmem);
        assert!(validate_store_mappings(&task, TaskTarget::Cpu, &[out_of_range]).is_err());
        let inaccessible = StoreMapping::default_for(ArgumentKind::Input, 0, StoreTarget::Fbmem);
        assert!(validate_store_mappings(&task, TaskTarget::Cpu, &[inaccessible]).is_err());
    }

    #[test]
    fn test_default_mapper() {
        let mapper = DefaultMapper;
        let target = mapper.task_target(&task(), &[TaskTarget::Omp, TaskTarget::Cpu]);
        assert_eq!(target.ok(), Some(TaskTarget::Omp));
        assert!(mapper.tunable_value(0).is_err());
    }
}

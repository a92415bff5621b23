use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;
use tessera_common::config::LibraryConfig;

use crate::error::{CoreError, CoreResult, TaskResult};
use crate::machine::VariantCode;
use crate::mapping::Mapper;
use crate::operation::context::TaskContext;
use crate::reduction::ReductionOp;
use crate::substrate::Substrate;

/// The id blocks a library reserves when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceConfig {
    pub max_tasks: i64,
    /// The number of task ids at the tail of the task block that are handed out dynamically.
    pub max_dyn_tasks: i64,
    pub max_reduction_ops: i64,
    pub max_projections: i64,
    pub max_shardings: i64,
}

impl ResourceConfig {
    pub fn validate(&self) -> CoreResult<()> {
        let blocks = [
            self.max_tasks,
            self.max_dyn_tasks,
            self.max_reduction_ops,
            self.max_projections,
            self.max_shardings,
        ];
        if blocks.iter().any(|x| *x < 0) {
            return Err(CoreError::invalid(format!(
                "resource block sizes must not be negative: {self:?}"
            )));
        }
        if self.max_dyn_tasks > self.max_tasks {
            return Err(CoreError::invalid(format!(
                "the number of dynamic tasks ({}) exceeds the number of tasks ({})",
                self.max_dyn_tasks, self.max_tasks
            )));
        }
        Ok(())
    }
}

impl From<&LibraryConfig> for ResourceConfig {
    fn from(config: &LibraryConfig) -> Self {
        Self {
            max_tasks: config.max_tasks.into(),
            max_dyn_tasks: config.max_dyn_tasks.into(),
            max_reduction_ops: config.max_reduction_ops.into(),
            max_projections: config.max_projections.into(),
            max_shardings: config.max_shardings.into(),
        }
    }
}

/// A contiguous block of global ids owned by one library.
#[derive(Debug)]
pub struct ResourceIdScope {
    base: i64,
    size: i64,
    dyn_size: i64,
    next_dyn_id: Cell<i64>,
}

impl ResourceIdScope {
    pub fn new(base: i64, size: i64, dyn_size: i64) -> Self {
        Self {
            base,
            size,
            dyn_size,
            next_dyn_id: Cell::new(size - dyn_size),
        }
    }

    pub fn base(&self) -> i64 {
        self.base
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn translate(&self, local_id: i64) -> CoreResult<i64> {
        if local_id < 0 || local_id >= self.size {
            return Err(CoreError::out_of_range(format!(
                "local id {local_id} is outside the resource block of size {}",
                self.size
            )));
        }
        Ok(self.base + local_id)
    }

    pub fn invert(&self, global_id: i64) -> Option<i64> {
        self.in_scope(global_id).then(|| global_id - self.base)
    }

    pub fn in_scope(&self, global_id: i64) -> bool {
        global_id >= self.base && global_id < self.base + self.size
    }

    pub fn generate_dynamic_id(&self) -> CoreResult<i64> {
        let id = self.next_dyn_id.get();
        if self.dyn_size == 0 || id >= self.size {
            return Err(CoreError::out_of_range(format!(
                "the library ran out of its {} dynamic ids",
                self.dyn_size
            )));
        }
        self.next_dyn_id.set(id + 1);
        Ok(id)
    }
}

pub type TaskBody = Arc<dyn Fn(&mut TaskContext) -> TaskResult<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct VariantOptions {
    /// Requires the substrate to admit every point task of a launch at once.
    pub concurrent: bool,
    /// Declares that the task body creates output buffers.
    pub has_allocations: bool,
}

impl VariantOptions {
    pub fn with_concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn with_has_allocations(mut self, has_allocations: bool) -> Self {
        self.has_allocations = has_allocations;
        self
    }
}

#[derive(Clone)]
pub struct TaskVariant {
    pub code: VariantCode,
    pub body: TaskBody,
    pub options: Option<VariantOptions>,
}

impl TaskVariant {
    /// The options of the variant, falling back to the defaults of the library.
    pub fn options(&self) -> VariantOptions {
        self.options.unwrap_or_default()
    }
}

impl fmt::Debug for TaskVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskVariant")
            .field("code", &self.code)
            .field("options", &self.options)
            .finish()
    }
}

/// The variants of one task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    name: String,
    variants: BTreeMap<VariantCode, TaskVariant>,
}

impl TaskInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variants: BTreeMap::new(),
        }
    }

    pub fn with_variant<F>(mut self, code: VariantCode, body: F) -> Self
    where
        F: Fn(&mut TaskContext) -> TaskResult<()> + Send + Sync + 'static,
    {
        self.variants.insert(
            code,
            TaskVariant {
                code,
                body: Arc::new(body),
                options: None,
            },
        );
        self
    }

    pub fn with_variant_options<F>(
        mut self,
        code: VariantCode,
        body: F,
        options: VariantOptions,
    ) -> Self
    where
        F: Fn(&mut TaskContext) -> TaskResult<()> + Send + Sync + 'static,
    {
        self.variants.insert(
            code,
            TaskVariant {
                code,
                body: Arc::new(body),
                options: Some(options),
            },
        );
        self
    }

    pub fn add_variant(
        &mut self,
        code: VariantCode,
        body: TaskBody,
        options: Option<VariantOptions>,
    ) -> CoreResult<()> {
        if self.variants.contains_key(&code) {
            return Err(CoreError::invalid(format!(
                "task {} already has a {code:?} variant",
                self.name
            )));
        }
        self.variants.insert(
            code,
            TaskVariant {
                code,
                body,
                options,
            },
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn find_variant(&self, code: VariantCode) -> Option<&TaskVariant> {
        self.variants.get(&code)
    }

    pub fn has_variant(&self, code: VariantCode) -> bool {
        self.variants.contains_key(&code)
    }

    pub fn variant_codes(&self) -> impl Iterator<Item = VariantCode> + '_ {
        self.variants.keys().copied()
    }

    fn with_default_options(mut self, defaults: &BTreeMap<VariantCode, VariantOptions>) -> Self {
        for (code, variant) in self.variants.iter_mut() {
            if variant.options.is_none() {
                variant.options = Some(defaults.get(code).copied().unwrap_or_default());
            }
        }
        self
    }
}

struct LibraryInner {
    name: String,
    task_scope: ResourceIdScope,
    redop_scope: ResourceIdScope,
    projection_scope: ResourceIdScope,
    sharding_scope: ResourceIdScope,
    tasks: RefCell<IndexMap<i64, Arc<TaskInfo>>>,
    mapper: RefCell<Rc<dyn Mapper>>,
    mapper_id: i64,
    default_options: BTreeMap<VariantCode, VariantOptions>,
    substrate: Rc<dyn Substrate>,
}

/// A namespace of tasks, reduction operators, projections and shardings.
/// Clones refer to the same library.
#[derive(Clone)]
pub struct Library(Rc<LibraryInner>);

/// The global id bases a new library starts its blocks from.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ResourceBases {
    pub tasks: i64,
    pub reduction_ops: i64,
    pub projections: i64,
    pub shardings: i64,
}

impl ResourceBases {
    pub fn advance(&self, config: &ResourceConfig) -> ResourceBases {
        ResourceBases {
            tasks: self.tasks + config.max_tasks,
            reduction_ops: self.reduction_ops + config.max_reduction_ops,
            projections: self.projections + config.max_projections,
            shardings: self.shardings + config.max_shardings,
        }
    }
}

impl Library {
    pub(crate) fn try_new(
        name: impl Into<String>,
        config: &ResourceConfig,
        bases: ResourceBases,
        mapper: Rc<dyn Mapper>,
        mapper_id: i64,
        default_options: BTreeMap<VariantCode, VariantOptions>,
        substrate: Rc<dyn Substrate>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let name = name.into();
        debug!("creating library {name} with {config:?} at {bases:?}");
        Ok(Self(Rc::new(LibraryInner {
            name,
            task_scope: ResourceIdScope::new(bases.tasks, config.max_tasks, config.max_dyn_tasks),
            redop_scope: ResourceIdScope::new(bases.reduction_ops, config.max_reduction_ops, 0),
            projection_scope: ResourceIdScope::new(bases.projections, config.max_projections, 0),
            sharding_scope: ResourceIdScope::new(bases.shardings, config.max_shardings, 0),
            tasks: RefCell::new(IndexMap::new()),
            mapper: RefCell::new(mapper),
            mapper_id,
            default_options,
            substrate,
        })))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn get_task_id(&self, local_task_id: i64) -> CoreResult<i64> {
        self.0.task_scope.translate(local_task_id)
    }

    pub fn get_local_task_id(&self, task_id: i64) -> Option<i64> {
        self.0.task_scope.invert(task_id)
    }

    pub fn get_reduction_op_id(&self, local_redop_id: i64) -> CoreResult<i64> {
        self.0.redop_scope.translate(local_redop_id)
    }

    pub fn get_projection_id(&self, local_projection_id: i64) -> CoreResult<i64> {
        self.0.projection_scope.translate(local_projection_id)
    }

    pub fn get_sharding_id(&self, local_sharding_id: i64) -> CoreResult<i64> {
        self.0.sharding_scope.translate(local_sharding_id)
    }

    pub fn valid_task_id(&self, task_id: i64) -> bool {
        self.0.task_scope.in_scope(task_id)
    }

    pub fn valid_projection_id(&self, projection_id: i64) -> bool {
        self.0.projection_scope.in_scope(projection_id)
    }

    /// Hands out a local task id from the dynamic tail of the task block.
    pub fn get_new_task_id(&self) -> CoreResult<i64> {
        self.0.task_scope.generate_dynamic_id()
    }

    pub fn register_task(&self, local_task_id: i64, info: TaskInfo) -> CoreResult<()> {
        let task_id = self.get_task_id(local_task_id)?;
        if self.0.tasks.borrow().contains_key(&local_task_id) {
            return Err(CoreError::invalid(format!(
                "task {local_task_id} already exists in library {}",
                self.0.name
            )));
        }
        if info.variants.is_empty() {
            return Err(CoreError::invalid(format!(
                "task {} of library {} has no variant",
                info.name, self.0.name
            )));
        }
        let info = Arc::new(info.with_default_options(&self.0.default_options));
        debug!(
            "registering task {} ({local_task_id} -> {task_id}) in library {}",
            info.name, self.0.name
        );
        self.0.substrate.register_task(task_id, info.clone())?;
        self.0.tasks.borrow_mut().insert(local_task_id, info);
        Ok(())
    }

    pub fn find_task(&self, local_task_id: i64) -> CoreResult<Arc<TaskInfo>> {
        self.0
            .tasks
            .borrow()
            .get(&local_task_id)
            .cloned()
            .ok_or_else(|| {
                CoreError::out_of_range(format!(
                    "library {} does not have task {local_task_id}",
                    self.0.name
                ))
            })
    }

    /// Registers a reduction operator and returns its global id.
    pub fn register_reduction_operator(
        &self,
        local_redop_id: i64,
        op: Arc<dyn ReductionOp>,
    ) -> CoreResult<i64> {
        let redop_id = self.get_reduction_op_id(local_redop_id)?;
        self.0.substrate.register_reduction_op(redop_id, op)?;
        Ok(redop_id)
    }

    pub fn get_mapper(&self) -> Rc<dyn Mapper> {
        self.0.mapper.borrow().clone()
    }

    /// Replaces the mapper. The mapper id stays the same.
    pub fn register_mapper(&self, mapper: Rc<dyn Mapper>) {
        *self.0.mapper.borrow_mut() = mapper;
    }

    pub fn get_mapper_id(&self) -> i64 {
        self.0.mapper_id
    }

    pub fn get_default_variant_options(&self) -> &BTreeMap<VariantCode, VariantOptions> {
        &self.0.default_options
    }

    pub fn ptr_eq(&self, other: &Library) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.0.name)
            .field("task_scope", &self.0.task_scope)
            .field("mapper_id", &self.0.mapper_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_scope() -> CoreResult<()> {
        let scope = ResourceIdScope::new(100, 10, 2);
        assert_eq!(scope.translate(3)?, 103);
        assert!(matches!(scope.translate(10), Err(CoreError::OutOfRange(_))));
        assert!(matches!(scope.translate(-1), Err(CoreError::OutOfRange(_))));
        assert_eq!(scope.invert(109), Some(9));
        assert_eq!(scope.invert(110), None);
        assert_eq!(scope.generate_dynamic_id()?, 8);
        assert_eq!(scope.generate_dynamic_id()?, 9);
        assert!(scope.generate_dynamic_id().is_err());
        Ok(())
    }

    #[test]
    fn test_resource_config_validation() {
        let config = ResourceConfig {
            max_tasks: 4,
            max_dyn_tasks: 5,
            max_reduction_ops: 0,
            max_projections: 0,
            max_shardings: 0,
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_task_info_variants() {
        let mut info = TaskInfo::new("noop").with_variant(VariantCode::Cpu, |_| Ok(()));
        assert!(info.has_variant(VariantCode::Cpu));
        assert!(!info.has_variant(VariantCode::Gpu));
        let body: TaskBody = Arc::new(|_| Ok(()));
        assert!(info
            .add_variant(VariantCode::Cpu, body.clone(), None)
            .is_err());
        assert!(info.add_variant(VariantCode::Gpu, body, None).is_ok());
        assert_eq!(
            info.variant_codes().collect::<Vec<_>>(),
            vec![VariantCode::Cpu, VariantCode::Gpu]
        );
    }
}

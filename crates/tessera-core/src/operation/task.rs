use std::fmt;
use std::sync::Arc;

use crate::data::store::{LogicalStore, LogicalStorePartition};
use crate::error::{CoreError, CoreResult};
use crate::id::OperationId;
use crate::library::{Library, TaskInfo};
use crate::machine::{Machine, TaskTarget};
use crate::mapping::{ArgumentKind, MapperStore, MapperTask};
use crate::partitioning::constraint::{broadcast, Constraint, Variable};
use crate::partitioning::partition::Partition;
use crate::partitioning::solver::SolverArgument;
use crate::scalar::Scalar;

/// A task whose partitioning is inferred from constraints at submission.
///
/// Stores are added with a partition symbol. Adding the same store again reuses its symbol.
pub struct AutoTask {
    library: Library,
    local_task_id: i64,
    info: Arc<TaskInfo>,
    operation_id: OperationId,
    machine: Machine,
    provenance: Option<String>,
    arguments: Vec<SolverArgument>,
    reduction_ops: Vec<i64>,
    scalars: Vec<Scalar>,
    constraints: Vec<Constraint>,
    communicators: Vec<String>,
    next_variable: u32,
    target: Option<TaskTarget>,
    concurrent: bool,
}

impl AutoTask {
    pub(crate) fn new(
        library: Library,
        local_task_id: i64,
        info: Arc<TaskInfo>,
        operation_id: OperationId,
        machine: Machine,
        provenance: Option<String>,
    ) -> Self {
        Self {
            library,
            local_task_id,
            info,
            operation_id,
            machine,
            provenance,
            arguments: vec![],
            reduction_ops: vec![],
            scalars: vec![],
            constraints: vec![],
            communicators: vec![],
            next_variable: 0,
            target: None,
            concurrent: false,
        }
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn local_task_id(&self) -> i64 {
        self.local_task_id
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn provenance(&self) -> Option<&str> {
        self.provenance.as_deref()
    }

    /// Creates a fresh partition symbol of this task.
    pub fn declare_partition(&mut self) -> Variable {
        let variable = Variable::new(self.operation_id, self.next_variable);
        self.next_variable += 1;
        variable
    }

    /// The symbol of `store` if it was added before, or a fresh one.
    pub fn find_or_declare_partition(&mut self, store: &LogicalStore) -> Variable {
        match self.arguments.iter().find(|x| x.store.ptr_eq(store)) {
            Some(argument) => argument.variable,
            None => self.declare_partition(),
        }
    }

    fn check_variable(&self, variable: Variable) -> CoreResult<()> {
        if variable.operation() != self.operation_id || variable.id() >= self.next_variable {
            return Err(CoreError::invalid(format!(
                "{variable} was not declared by operation {}",
                self.operation_id
            )));
        }
        Ok(())
    }

    fn push_argument(
        &mut self,
        kind: ArgumentKind,
        store: &LogicalStore,
        variable: Variable,
    ) -> CoreResult<()> {
        self.check_variable(variable)?;
        self.arguments.push(SolverArgument {
            variable,
            store: store.clone(),
            kind,
        });
        Ok(())
    }

    pub fn add_input(&mut self, store: &LogicalStore) -> CoreResult<Variable> {
        let variable = self.find_or_declare_partition(store);
        self.add_input_with(store, variable)?;
        Ok(variable)
    }

    pub fn add_input_with(&mut self, store: &LogicalStore, variable: Variable) -> CoreResult<()> {
        if store.is_unbound() {
            return Err(CoreError::invalid("unbound stores cannot be used as input"));
        }
        self.push_argument(ArgumentKind::Input, store, variable)
    }

    pub fn add_output(&mut self, store: &LogicalStore) -> CoreResult<Variable> {
        let variable = self.find_or_declare_partition(store);
        self.add_output_with(store, variable)?;
        Ok(variable)
    }

    pub fn add_output_with(&mut self, store: &LogicalStore, variable: Variable) -> CoreResult<()> {
        if store.is_unbound() && store.is_transformed() {
            return Err(CoreError::invalid("an unbound output cannot be transformed"));
        }
        self.push_argument(ArgumentKind::Output, store, variable)?;
        if store.has_scalar_storage() {
            self.constraints.push(broadcast(variable));
        }
        Ok(())
    }

    /// Adds a reduction argument with the operator of global id `redop`.
    pub fn add_reduction(&mut self, store: &LogicalStore, redop: i64) -> CoreResult<Variable> {
        let variable = self.find_or_declare_partition(store);
        self.add_reduction_with(store, redop, variable)?;
        Ok(variable)
    }

    pub fn add_reduction_with(
        &mut self,
        store: &LogicalStore,
        redop: i64,
        variable: Variable,
    ) -> CoreResult<()> {
        check_reducible(store)?;
        self.push_argument(ArgumentKind::Reduction, store, variable)?;
        self.reduction_ops.push(redop);
        Ok(())
    }

    pub fn add_scalar_arg(&mut self, scalar: Scalar) {
        self.scalars.push(scalar);
    }

    pub fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    /// Requests a communicator of the named backend for index launches of this task.
    pub fn add_communicator(&mut self, name: impl Into<String>) {
        self.communicators.push(name.into());
        self.concurrent = true;
    }

    /// Requires all point tasks of an index launch to run at the same time.
    pub fn set_concurrent(&mut self, concurrent: bool) {
        self.concurrent = concurrent;
    }

    /// Forces the task to run on `target`, bypassing the mapper.
    pub fn set_target(&mut self, target: TaskTarget) -> CoreResult<()> {
        check_target(&self.info, &self.machine, target)?;
        self.target = Some(target);
        Ok(())
    }

    pub fn num_inputs(&self) -> usize {
        self.count(ArgumentKind::Input)
    }

    pub fn num_outputs(&self) -> usize {
        self.count(ArgumentKind::Output)
    }

    pub fn num_reductions(&self) -> usize {
        self.count(ArgumentKind::Reduction)
    }

    fn count(&self, kind: ArgumentKind) -> usize {
        self.arguments.iter().filter(|x| x.kind == kind).count()
    }

    pub(crate) fn info(&self) -> &Arc<TaskInfo> {
        &self.info
    }

    pub(crate) fn arguments(&self) -> &[SolverArgument] {
        &self.arguments
    }

    pub(crate) fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub(crate) fn scalars(&self) -> &[Scalar] {
        &self.scalars
    }

    pub(crate) fn communicators(&self) -> &[String] {
        &self.communicators
    }

    pub(crate) fn reduction_ops(&self) -> &[i64] {
        &self.reduction_ops
    }

    pub(crate) fn target(&self) -> Option<TaskTarget> {
        self.target
    }

    pub(crate) fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    /// The targets the task can run on, in preference order.
    pub(crate) fn target_options(&self) -> Vec<TaskTarget> {
        target_options(&self.info, &self.machine)
    }

    pub(crate) fn to_mapper_task(&self) -> CoreResult<MapperTask> {
        mapper_task(
            &self.library,
            self.local_task_id,
            self.arguments.iter().map(|x| (x.kind, &x.store)),
            self.scalars.len(),
            &self.machine,
        )
    }
}

fn check_target(info: &TaskInfo, machine: &Machine, target: TaskTarget) -> CoreResult<()> {
    if !info.has_variant(target.variant()) {
        return Err(CoreError::invalid(format!(
            "task {} has no {target} variant",
            info.name()
        )));
    }
    if machine.count(target) == 0 {
        return Err(CoreError::invalid(format!(
            "{target} is not available in {machine}"
        )));
    }
    Ok(())
}

fn target_options(info: &TaskInfo, machine: &Machine) -> Vec<TaskTarget> {
    machine
        .valid_targets()
        .into_iter()
        .filter(|t| info.has_variant(t.variant()))
        .collect()
}

fn mapper_task<'a>(
    library: &Library,
    local_task_id: i64,
    arguments: impl Iterator<Item = (ArgumentKind, &'a LogicalStore)>,
    num_scalars: usize,
    machine: &Machine,
) -> CoreResult<MapperTask> {
    let mut task = MapperTask {
        library: library.name().to_string(),
        task_id: library.get_task_id(local_task_id)?,
        inputs: vec![],
        outputs: vec![],
        reductions: vec![],
        num_scalars,
        machine: machine.clone(),
    };
    for (kind, store) in arguments {
        let store = MapperStore {
            ty: store.ty().clone(),
            extents: store.extents().ok(),
            is_future: store.has_scalar_storage(),
        };
        match kind {
            ArgumentKind::Input => task.inputs.push(store),
            ArgumentKind::Output => task.outputs.push(store),
            ArgumentKind::Reduction => task.reductions.push(store),
        }
    }
    Ok(task)
}

fn check_reducible(store: &LogicalStore) -> CoreResult<()> {
    if store.is_unbound() {
        return Err(CoreError::invalid("unbound stores cannot be used for reductions"));
    }
    if store.ty().is_variable_size() {
        return Err(CoreError::invalid(format!(
            "stores of variable-size type {} cannot be used for reductions",
            store.ty()
        )));
    }
    Ok(())
}

/// A store argument of a manual task and the partition its point tasks see it through.
#[derive(Debug, Clone)]
pub(crate) struct ManualArgument {
    pub kind: ArgumentKind,
    pub store: LogicalStore,
    pub partition: Partition,
}

/// A task launched over an explicit launch shape. Stores are passed whole, so every point
/// task sees all of them, or as partitions whose colors match the launch shape.
pub struct ManualTask {
    library: Library,
    local_task_id: i64,
    info: Arc<TaskInfo>,
    operation_id: OperationId,
    machine: Machine,
    provenance: Option<String>,
    launch_shape: Vec<u64>,
    arguments: Vec<ManualArgument>,
    reduction_ops: Vec<i64>,
    scalars: Vec<Scalar>,
    communicators: Vec<String>,
    target: Option<TaskTarget>,
    concurrent: bool,
}

impl ManualTask {
    pub(crate) fn new(
        library: Library,
        local_task_id: i64,
        info: Arc<TaskInfo>,
        operation_id: OperationId,
        machine: Machine,
        provenance: Option<String>,
        launch_shape: Vec<u64>,
    ) -> Self {
        Self {
            library,
            local_task_id,
            info,
            operation_id,
            machine,
            provenance,
            launch_shape,
            arguments: vec![],
            reduction_ops: vec![],
            scalars: vec![],
            communicators: vec![],
            target: None,
            concurrent: false,
        }
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn local_task_id(&self) -> i64 {
        self.local_task_id
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn provenance(&self) -> Option<&str> {
        self.provenance.as_deref()
    }

    pub fn launch_shape(&self) -> &[u64] {
        &self.launch_shape
    }

    fn check_colors(&self, partition: &LogicalStorePartition) -> CoreResult<()> {
        if partition.color_shape() != self.launch_shape.as_slice() {
            return Err(CoreError::invalid(format!(
                "partition with colors {:?} does not match launch shape {:?}",
                partition.color_shape(),
                self.launch_shape
            )));
        }
        Ok(())
    }

    fn push(&mut self, kind: ArgumentKind, store: &LogicalStore, partition: Partition) {
        self.arguments.push(ManualArgument {
            kind,
            store: store.clone(),
            partition,
        });
    }

    pub fn add_input(&mut self, store: &LogicalStore) -> CoreResult<()> {
        if store.is_unbound() {
            return Err(CoreError::invalid("unbound stores cannot be used as input"));
        }
        self.push(ArgumentKind::Input, store, Partition::NoPartition);
        Ok(())
    }

    pub fn add_input_partition(&mut self, partition: &LogicalStorePartition) -> CoreResult<()> {
        self.check_colors(partition)?;
        self.push(
            ArgumentKind::Input,
            partition.store(),
            Partition::Tiling(partition.tiling().clone()),
        );
        Ok(())
    }

    /// Reads `store` through an arbitrary partition over the launch shape.
    pub(crate) fn add_input_with(
        &mut self,
        store: &LogicalStore,
        partition: Partition,
    ) -> CoreResult<()> {
        if partition.color_shape().as_deref() != Some(self.launch_shape.as_slice()) {
            return Err(CoreError::internal(format!(
                "{partition} does not match launch shape {:?}",
                self.launch_shape
            )));
        }
        self.push(ArgumentKind::Input, store, partition);
        Ok(())
    }

    pub fn add_output(&mut self, store: &LogicalStore) -> CoreResult<()> {
        if store.is_unbound() && store.is_transformed() {
            return Err(CoreError::invalid("an unbound output cannot be transformed"));
        }
        self.push(ArgumentKind::Output, store, Partition::NoPartition);
        Ok(())
    }

    pub fn add_output_partition(&mut self, partition: &LogicalStorePartition) -> CoreResult<()> {
        self.check_colors(partition)?;
        self.push(
            ArgumentKind::Output,
            partition.store(),
            Partition::Tiling(partition.tiling().clone()),
        );
        Ok(())
    }

    /// Adds a reduction argument with the operator of global id `redop`.
    pub fn add_reduction(&mut self, store: &LogicalStore, redop: i64) -> CoreResult<()> {
        check_reducible(store)?;
        self.push(ArgumentKind::Reduction, store, Partition::NoPartition);
        self.reduction_ops.push(redop);
        Ok(())
    }

    pub fn add_reduction_partition(
        &mut self,
        partition: &LogicalStorePartition,
        redop: i64,
    ) -> CoreResult<()> {
        self.check_colors(partition)?;
        check_reducible(partition.store())?;
        self.push(
            ArgumentKind::Reduction,
            partition.store(),
            Partition::Tiling(partition.tiling().clone()),
        );
        self.reduction_ops.push(redop);
        Ok(())
    }

    pub fn add_scalar_arg(&mut self, scalar: Scalar) {
        self.scalars.push(scalar);
    }

    pub fn add_communicator(&mut self, name: impl Into<String>) {
        self.communicators.push(name.into());
        self.concurrent = true;
    }

    pub fn set_concurrent(&mut self, concurrent: bool) {
        self.concurrent = concurrent;
    }

    pub fn set_target(&mut self, target: TaskTarget) -> CoreResult<()> {
        check_target(&self.info, &self.machine, target)?;
        self.target = Some(target);
        Ok(())
    }

    pub fn num_inputs(&self) -> usize {
        self.count(ArgumentKind::Input)
    }

    pub fn num_outputs(&self) -> usize {
        self.count(ArgumentKind::Output)
    }

    pub fn num_reductions(&self) -> usize {
        self.count(ArgumentKind::Reduction)
    }

    fn count(&self, kind: ArgumentKind) -> usize {
        self.arguments.iter().filter(|x| x.kind == kind).count()
    }

    pub(crate) fn info(&self) -> &Arc<TaskInfo> {
        &self.info
    }

    pub(crate) fn arguments(&self) -> &[ManualArgument] {
        &self.arguments
    }

    pub(crate) fn scalars(&self) -> &[Scalar] {
        &self.scalars
    }

    pub(crate) fn communicators(&self) -> &[String] {
        &self.communicators
    }

    pub(crate) fn reduction_ops(&self) -> &[i64] {
        &self.reduction_ops
    }

    pub(crate) fn target(&self) -> Option<TaskTarget> {
        self.target
    }

    pub(crate) fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    pub(crate) fn target_options(&self) -> Vec<TaskTarget> {
        target_options(&self.info, &self.machine)
    }

    pub(crate) fn to_mapper_task(&self) -> CoreResult<MapperTask> {
        mapper_task(
            &self.library,
            self.local_task_id,
            self.arguments.iter().map(|x| (x.kind, &x.store)),
            self.scalars.len(),
            &self.machine,
        )
    }
}

impl fmt::Debug for ManualTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTask")
            .field("library", &self.library.name())
            .field("task", &self.info.name())
            .field("operation_id", &self.operation_id)
            .field("launch_shape", &self.launch_shape)
            .field("num_arguments", &self.arguments.len())
            .finish()
    }
}

impl fmt::Debug for AutoTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoTask")
            .field("library", &self.library.name())
            .field("task", &self.info.name())
            .field("operation_id", &self.operation_id)
            .field("num_arguments", &self.arguments.len())
            .field("num_constraints", &self.constraints.len())
            .finish()
    }
}

use crate::data::physical::PhysicalStore;
use crate::domain::{Domain, Point};
use crate::error::{CoreError, CoreResult};
use crate::machine::VariantCode;
use crate::scalar::Scalar;
use crate::substrate::{Future, FutureValue};

/// Everything one point task can see: its index, its stores, scalars, futures and
/// communicators. Contexts are moved onto worker threads, so all contents are `Send`.
#[derive(Debug)]
pub struct TaskContext {
    task_id: i64,
    variant: VariantCode,
    index: Point,
    launch_domain: Option<Domain>,
    inputs: Vec<PhysicalStore>,
    outputs: Vec<PhysicalStore>,
    reductions: Vec<PhysicalStore>,
    scalars: Vec<Scalar>,
    futures: Vec<Future>,
    communicators: Vec<Future>,
    return_value: FutureValue,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        task_id: i64,
        variant: VariantCode,
        index: Point,
        launch_domain: Option<Domain>,
        inputs: Vec<PhysicalStore>,
        outputs: Vec<PhysicalStore>,
        reductions: Vec<PhysicalStore>,
        scalars: Vec<Scalar>,
        futures: Vec<Future>,
        communicators: Vec<Future>,
    ) -> Self {
        Self {
            task_id,
            variant,
            index,
            launch_domain,
            inputs,
            outputs,
            reductions,
            scalars,
            futures,
            communicators,
            return_value: FutureValue::Empty,
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn variant_kind(&self) -> VariantCode {
        self.variant
    }

    pub fn task_index(&self) -> &Point {
        &self.index
    }

    /// The launch domain, or the single point of a single task.
    pub fn launch_domain(&self) -> Domain {
        match &self.launch_domain {
            Some(domain) => domain.clone(),
            None => Domain::from_origin(self.index.coords(), &vec![1; self.index.ndim()]),
        }
    }

    pub fn is_single_task(&self) -> bool {
        self.launch_domain.is_none()
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn num_reductions(&self) -> usize {
        self.reductions.len()
    }

    pub fn input(&self, index: usize) -> CoreResult<&PhysicalStore> {
        self.inputs
            .get(index)
            .ok_or_else(|| CoreError::out_of_range(format!("input {index}")))
    }

    pub fn output(&mut self, index: usize) -> CoreResult<&mut PhysicalStore> {
        self.outputs
            .get_mut(index)
            .ok_or_else(|| CoreError::out_of_range(format!("output {index}")))
    }

    pub fn reduction(&mut self, index: usize) -> CoreResult<&mut PhysicalStore> {
        self.reductions
            .get_mut(index)
            .ok_or_else(|| CoreError::out_of_range(format!("reduction {index}")))
    }

    pub fn scalar(&self, index: usize) -> CoreResult<&Scalar> {
        self.scalars
            .get(index)
            .ok_or_else(|| CoreError::out_of_range(format!("scalar {index}")))
    }

    pub fn scalars(&self) -> &[Scalar] {
        &self.scalars
    }

    pub fn future(&self, index: usize) -> CoreResult<&Future> {
        self.futures
            .get(index)
            .ok_or_else(|| CoreError::out_of_range(format!("future {index}")))
    }

    pub fn futures(&self) -> &[Future] {
        &self.futures
    }

    pub fn num_communicators(&self) -> usize {
        self.communicators.len()
    }

    /// The handle of communicator `index` for this point.
    pub fn communicator(&self, index: usize) -> CoreResult<&Future> {
        self.communicators
            .get(index)
            .ok_or_else(|| CoreError::out_of_range(format!("communicator {index}")))
    }

    /// Sets the value this point task returns to the submitter.
    pub fn set_return_value(&mut self, value: FutureValue) {
        self.return_value = value;
    }

    pub(crate) fn into_parts(self) -> (Vec<PhysicalStore>, Vec<PhysicalStore>, FutureValue) {
        (self.outputs, self.reductions, self.return_value)
    }
}

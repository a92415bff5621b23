/// Span attribute names used by the control plane.
pub struct SpanAttribute;

impl SpanAttribute {
    pub const EXCEPTION_MESSAGE: &'static str = "exception.message";
    pub const LIBRARY_NAME: &'static str = "library.name";
    pub const TASK_ID: &'static str = "task.id";
    pub const TASK_VARIANT: &'static str = "task.variant";
    pub const TASK_PROVENANCE: &'static str = "task.provenance";
    pub const LAUNCH_DOMAIN: &'static str = "launch.domain";
    pub const LAUNCH_CONCURRENT: &'static str = "launch.concurrent";
    pub const COMMUNICATOR_BACKEND: &'static str = "communicator.backend";
    pub const COMMUNICATOR_NUM_TASKS: &'static str = "communicator.num_tasks";
}

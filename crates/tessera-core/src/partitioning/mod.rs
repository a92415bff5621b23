pub mod constraint;
pub(crate) mod launch_shape;
pub mod partition;
pub(crate) mod solver;

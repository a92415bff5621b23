pub mod context;
pub mod copy;
pub mod fill;
pub mod launcher;
pub mod projection;
pub mod task;

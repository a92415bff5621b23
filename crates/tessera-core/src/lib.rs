pub mod comm;
pub mod data;
pub mod domain;
pub mod error;
pub mod id;
pub mod io;
pub mod library;
pub mod machine;
pub mod mapping;
pub mod operation;
pub mod partitioning;
pub mod reduction;
pub mod runtime;
pub mod scalar;
pub mod scope;
pub mod shape;
pub mod substrate;
pub mod types;

pub use data::external_allocation::ExternalAllocation;
pub use data::physical::PhysicalStore;
pub use data::store::{LogicalStore, LogicalStorePartition};
pub use domain::{Domain, Point};
pub use error::{CoreError, CoreResult};
pub use library::{Library, ResourceConfig, TaskInfo, VariantOptions};
pub use machine::{Machine, ProcessorRange, TaskTarget, VariantCode};
pub use operation::context::TaskContext;
pub use operation::task::{AutoTask, ManualTask};
pub use runtime::Runtime;
pub use scalar::Scalar;
pub use scope::{ExceptionMode, Scope};
pub use shape::Shape;
pub use types::{Type, TypeCode};

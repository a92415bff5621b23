pub(crate) mod attachment;
pub(crate) mod buffer;
pub mod external_allocation;
pub(crate) mod field_manager;
pub mod physical;
pub mod region_field;
pub mod store;
pub mod transform;

use crate::data::store::{LogicalStore, StorageKind};
use crate::domain::Domain;
use crate::error::{CoreError, CoreResult};
use crate::id::FieldId;
use crate::scalar::Scalar;
use crate::scope;
use crate::substrate::{Future, LogicalRegion};

/// Writes one value into every element of a rectangle of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillLaunch {
    pub region: LogicalRegion,
    pub field: FieldId,
    /// The filled rectangle in the coordinates of the region tree.
    pub rect: Domain,
    pub value: Vec<u8>,
    pub priority: i32,
    pub provenance: Option<String>,
}

/// What a fill turns into once the storage of the target is known.
#[derive(Debug)]
pub(crate) enum FillPlan {
    /// The target is future-backed and simply takes the new value.
    Future(Future),
    Launch(FillLaunch),
    /// The target has no elements.
    Empty,
}

pub(crate) fn lower_fill(store: &LogicalStore, value: &Scalar) -> CoreResult<FillPlan> {
    if store.ty() != value.ty() {
        return Err(CoreError::invalid(format!(
            "fill value of type {} does not match store type {}",
            value.ty(),
            store.ty()
        )));
    }
    match store.storage().kind() {
        StorageKind::Unbound { .. } => Err(CoreError::invalid("an unbound store cannot be filled")),
        StorageKind::Future { .. } => Ok(FillPlan::Future(Future::from_scalar(value))),
        StorageKind::RegionField(_) => {
            let (field, rect) = store.covered_rect()?;
            if rect.is_empty() {
                return Ok(FillPlan::Empty);
            }
            Ok(FillPlan::Launch(FillLaunch {
                region: field.region().clone(),
                field: field.field_id(),
                rect,
                value: value.bytes().to_vec(),
                priority: scope::priority(),
                provenance: scope::provenance(),
            }))
        }
    }
}

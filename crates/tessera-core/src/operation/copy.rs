use crate::data::store::{LogicalStore, StorageKind};
use crate::domain::Domain;
use crate::error::{CoreError, CoreResult};
use crate::id::FieldId;
use crate::scope;
use crate::substrate::{Future, LogicalRegion};
use crate::types::Type;

/// One store operand of a copy, resolved to the field and rectangle it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyArg {
    pub region: LogicalRegion,
    pub field: FieldId,
    pub ty: Type,
    /// The covered rectangle in the coordinates of the region tree.
    pub rect: Domain,
}

/// A copy between fields, optionally through indirection fields of points.
///
/// Element `i` in C order of the iteration space moves from `source` (or from the source
/// point at `source_indirect[i]`) to `target` (or to the target point at
/// `target_indirect[i]`). Indirect points are relative to the origin of the indexed store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyLaunch {
    pub target: CopyArg,
    pub source: CopyArg,
    pub source_indirect: Option<CopyArg>,
    pub target_indirect: Option<CopyArg>,
    /// Reduces into the target with the operator of this global id instead of overwriting.
    pub redop: Option<i64>,
    pub priority: i32,
    pub provenance: Option<String>,
}

impl CopyLaunch {
    /// The number of elements moved by the copy.
    pub fn volume(&self) -> u64 {
        match (&self.source_indirect, &self.target_indirect) {
            (Some(indirect), _) | (None, Some(indirect)) => indirect.rect.volume(),
            (None, None) => self.source.rect.volume(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum CopyPlan {
    Future(Future),
    Launch(CopyLaunch),
    Empty,
}

fn check_operand(store: &LogicalStore, role: &str) -> CoreResult<()> {
    if store.is_unbound() || store.is_transformed() {
        return Err(CoreError::invalid(format!(
            "copy {role} must be a normal untransformed store"
        )));
    }
    Ok(())
}

fn copy_arg(store: &LogicalStore) -> CoreResult<CopyArg> {
    let (field, rect) = store.covered_rect()?;
    Ok(CopyArg {
        region: field.region().clone(),
        field: field.field_id(),
        ty: store.ty().clone(),
        rect,
    })
}

fn check_indirect(indirect: &LogicalStore, indexed: &LogicalStore, role: &str) -> CoreResult<()> {
    check_operand(indirect, role)?;
    if indirect.ty().as_point() != Some(indexed.dim()) {
        return Err(CoreError::invalid(format!(
            "{role} of type {} cannot index a {}-D store",
            indirect.ty(),
            indexed.dim()
        )));
    }
    if indirect.has_scalar_storage() {
        return Err(CoreError::unsupported(format!(
            "future-backed {role} stores are not supported"
        )));
    }
    Ok(())
}

fn check_aligned(lhs: &LogicalStore, rhs: &LogicalStore) -> CoreResult<()> {
    let (lhs, rhs) = (lhs.extents()?, rhs.extents()?);
    if lhs != rhs {
        return Err(CoreError::invalid(format!(
            "aligned copy operands have different extents {lhs:?} and {rhs:?}"
        )));
    }
    Ok(())
}

/// Lowers a copy. The two stores that are iterated together must have equal extents:
/// target and source for a plain copy, target and source indirection for a gather,
/// source and target indirection for a scatter, and both indirections otherwise.
pub(crate) fn lower_copy(
    target: &LogicalStore,
    target_indirect: Option<&LogicalStore>,
    source: &LogicalStore,
    source_indirect: Option<&LogicalStore>,
    redop: Option<i64>,
) -> CoreResult<CopyPlan> {
    if source.ty() != target.ty() {
        return Err(CoreError::invalid(format!(
            "copy source of type {} does not match target type {}",
            source.ty(),
            target.ty()
        )));
    }
    check_operand(target, "target")?;
    check_operand(source, "source")?;
    if let Some(indirect) = source_indirect {
        check_indirect(indirect, source, "source indirection")?;
    }
    if let Some(indirect) = target_indirect {
        check_indirect(indirect, target, "target indirection")?;
    }
    match (target_indirect, source_indirect) {
        (None, None) => check_aligned(target, source)?,
        (None, Some(src)) => check_aligned(target, src)?,
        (Some(tgt), None) => check_aligned(source, tgt)?,
        (Some(tgt), Some(src)) => check_aligned(tgt, src)?,
    }

    if target.has_scalar_storage() != source.has_scalar_storage() {
        return Err(CoreError::unsupported(
            "copies are only supported between stores of the same kind",
        ));
    }
    if target.has_scalar_storage() {
        if redop.is_some() {
            return Err(CoreError::unsupported(
                "reduction copies into future-backed stores are not supported",
            ));
        }
        if target_indirect.is_some() || source_indirect.is_some() {
            return Err(CoreError::unsupported(
                "indirect copies between future-backed stores are not supported",
            ));
        }
        return match source.storage().kind() {
            StorageKind::Future { future, .. } => Ok(CopyPlan::Future(future)),
            _ => Err(CoreError::internal("future-backed store without a future")),
        };
    }

    let launch = CopyLaunch {
        target: copy_arg(target)?,
        source: copy_arg(source)?,
        source_indirect: source_indirect.map(copy_arg).transpose()?,
        target_indirect: target_indirect.map(copy_arg).transpose()?,
        redop,
        priority: scope::priority(),
        provenance: scope::provenance(),
    };
    if launch.volume() == 0 {
        return Ok(CopyPlan::Empty);
    }
    Ok(CopyPlan::Launch(launch))
}

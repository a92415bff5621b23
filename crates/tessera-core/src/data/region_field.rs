use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::rc::{Rc, Weak};

use log::{debug, error, warn};

use crate::data::attachment::Attachment;
use crate::data::external_allocation::ExternalAllocation;
use crate::data::field_manager::FreeFieldInfo;
use crate::domain::{Domain, Point};
use crate::error::{CoreError, CoreResult};
use crate::id::FieldId;
use crate::partitioning::partition::Tiling;
use crate::runtime::RuntimeInner;
use crate::substrate::{Future, LogicalRegion, PhysicalRegion};

/// The physical region backing a region field, as returned by [`LogicalRegionField::map`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionFieldMapping {
    pub dim: usize,
    pub physical: PhysicalRegion,
    pub field_id: FieldId,
}

type InvalidationCallback = Box<dyn FnOnce()>;

/// State that only the root of a region field tree carries.
#[derive(Default)]
struct RootState {
    physical: Option<PhysicalRegion>,
    attachment: Option<Attachment>,
    callbacks: Vec<InvalidationCallback>,
}

/// One field of a logical region. Children are sub-regions derived by tiling
/// and keep their parent alive.
pub struct LogicalRegionField {
    runtime: Weak<RuntimeInner>,
    field_size: usize,
    region: LogicalRegion,
    field_id: FieldId,
    parent: Option<Rc<LogicalRegionField>>,
    state: RefCell<RootState>,
    destroyed_out_of_order: Cell<bool>,
}

impl LogicalRegionField {
    pub(crate) fn new_root(
        runtime: Weak<RuntimeInner>,
        field_size: usize,
        region: LogicalRegion,
        field_id: FieldId,
    ) -> Self {
        Self {
            runtime,
            field_size,
            region,
            field_id,
            parent: None,
            state: RefCell::new(RootState::default()),
            destroyed_out_of_order: Cell::new(false),
        }
    }

    fn runtime(&self) -> CoreResult<Rc<RuntimeInner>> {
        self.runtime
            .upgrade()
            .ok_or_else(|| CoreError::invalid("the runtime has been destroyed"))
    }

    pub fn region(&self) -> &LogicalRegion {
        &self.region
    }

    pub fn field_id(&self) -> FieldId {
        self.field_id
    }

    pub fn field_size(&self) -> usize {
        self.field_size
    }

    pub fn domain(&self) -> &Domain {
        &self.region.domain
    }

    pub fn extents(&self) -> Vec<u64> {
        self.region.domain.extents()
    }

    pub fn dim(&self) -> usize {
        self.region.domain.ndim()
    }

    pub fn parent(&self) -> Option<&Rc<LogicalRegionField>> {
        self.parent.as_ref()
    }

    pub fn root(&self) -> &LogicalRegionField {
        let mut node = self;
        while let Some(parent) = &node.parent {
            node = parent;
        }
        node
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_attached(&self) -> bool {
        self.root().state.borrow().attachment.is_some()
    }

    pub fn is_mapped(&self) -> bool {
        let root = self.root();
        let state = root.state.borrow();
        match (&state.physical, root.runtime.upgrade()) {
            (Some(physical), Some(runtime)) => runtime.substrate().is_mapped(physical),
            _ => false,
        }
    }

    /// Materializes the physical region of the root, remapping it if it was unmapped.
    pub fn map(&self) -> CoreResult<RegionFieldMapping> {
        if let Some(parent) = &self.parent {
            return parent.map();
        }
        let runtime = self.runtime()?;
        let substrate = runtime.substrate();
        let mut state = self.state.borrow_mut();
        let physical = match &state.physical {
            Some(physical) => {
                if !substrate.is_mapped(physical) {
                    substrate.remap_region(physical)?;
                }
                physical.clone()
            }
            None => {
                let physical = substrate.map_region(&self.region, self.field_id)?;
                state.physical = Some(physical.clone());
                physical
            }
        };
        Ok(RegionFieldMapping {
            dim: self.dim(),
            physical,
            field_id: self.field_id,
        })
    }

    pub(crate) fn unmap(&self) -> CoreResult<()> {
        let root = self.root();
        let runtime = root.runtime()?;
        let state = root.state.borrow();
        if let Some(physical) = &state.physical {
            if runtime.substrate().is_mapped(physical) {
                runtime.substrate().unmap_region(physical)?;
            }
        }
        Ok(())
    }

    fn check_attachable(&self) -> CoreResult<()> {
        if self.parent.is_some() {
            return Err(CoreError::invalid("only a root region field can be attached"));
        }
        let state = self.state.borrow();
        if state.attachment.is_some() {
            return Err(CoreError::invalid("region field is already attached"));
        }
        if state.physical.is_some() {
            return Err(CoreError::invalid(
                "region field already has a physical region",
            ));
        }
        Ok(())
    }

    fn check_allocation_size(&self, domain: &Domain, available: usize) -> CoreResult<()> {
        let required = usize::try_from(domain.volume())
            .ok()
            .and_then(|x| x.checked_mul(self.field_size))
            .ok_or_else(|| CoreError::invalid(format!("{domain} is too large to attach")))?;
        if available < required {
            return Err(CoreError::invalid(format!(
                "external allocation of {available} bytes is smaller than the {required}-byte field"
            )));
        }
        Ok(())
    }

    pub fn attach(&self, allocation: ExternalAllocation) -> CoreResult<()> {
        self.check_attachable()?;
        self.check_allocation_size(&self.region.domain, allocation.size())?;
        let runtime = self.runtime()?;
        let physical = runtime
            .substrate()
            .attach(&self.region, self.field_id, &allocation)?;
        let mut state = self.state.borrow_mut();
        state.physical = Some(physical.clone());
        state.attachment = Some(Attachment::single(physical, allocation));
        Ok(())
    }

    /// Attaches one allocation per piece. The pieces are rectangles of the root domain.
    pub fn attach_resources(&self, pieces: Vec<(Domain, ExternalAllocation)>) -> CoreResult<()> {
        self.check_attachable()?;
        if pieces.is_empty() {
            return Err(CoreError::invalid("at least one piece must be attached"));
        }
        for (domain, allocation) in pieces.iter() {
            if !self.region.domain.contains_domain(domain) {
                return Err(CoreError::invalid(format!(
                    "attached piece {domain} is outside of {}",
                    self.region.domain
                )));
            }
            self.check_allocation_size(domain, allocation.size())?;
        }
        let runtime = self.runtime()?;
        let resources = runtime
            .substrate()
            .attach_resources(&self.region, self.field_id, &pieces)?;
        let allocations = pieces.into_iter().map(|(_, x)| x).collect();
        self.state.borrow_mut().attachment = Some(Attachment::index(resources, allocations));
        Ok(())
    }

    /// Flushes the attached memory and turns the field into a plain field.
    pub fn detach(&self) -> CoreResult<()> {
        if self.parent.is_some() {
            return Err(CoreError::invalid("only a root region field can be detached"));
        }
        let runtime = self.runtime()?;
        let substrate = runtime.substrate();
        let mut state = self.state.borrow_mut();
        if state.attachment.is_none() {
            return Err(CoreError::invalid("region field is not attached"));
        }
        if let Some(physical) = &state.physical {
            if substrate.is_mapped(physical) {
                substrate.unmap_region(physical)?;
            }
        }
        let Some(mut attachment) = state.attachment.take() else {
            return Err(CoreError::invalid("region field is not attached"));
        };
        let token = match attachment.detach(substrate, false) {
            Ok(x) => x,
            Err(e) => {
                error!("failed to detach {:?}: {e}", self.region);
                std::process::abort();
            }
        };
        token.wait();
        attachment.maybe_deallocate()?;
        state.physical = None;
        Ok(())
    }

    pub fn allow_out_of_order_destruction(&self) {
        self.root().destroyed_out_of_order.set(true);
    }

    /// Derives the field of the sub-region at `color` of `tiling`.
    /// The tiling is expressed relative to the lower corner of this field's domain.
    pub fn get_child(
        self: &Rc<Self>,
        tiling: &Tiling,
        color: &Point,
        complete: bool,
    ) -> CoreResult<Rc<LogicalRegionField>> {
        let rect = tiling
            .child_domain(color, &Domain::from_extents(&self.extents()))?
            .translate(self.region.domain.lo().coords());
        let runtime = self.runtime()?;
        let region = runtime
            .substrate()
            .subregion(&self.region, &rect, complete)?;
        Ok(Rc::new(LogicalRegionField {
            runtime: self.runtime.clone(),
            field_size: self.field_size,
            region,
            field_id: self.field_id,
            parent: Some(self.clone()),
            state: RefCell::new(RootState::default()),
            destroyed_out_of_order: Cell::new(false),
        }))
    }

    /// Registers a callback that runs once when the root is destroyed. It must not panic.
    pub fn add_invalidation_callback(&self, callback: impl FnOnce() + 'static) {
        self.root()
            .state
            .borrow_mut()
            .callbacks
            .push(Box::new(callback));
    }
}

impl Drop for LogicalRegionField {
    fn drop(&mut self) {
        if self.parent.is_some() {
            return;
        }
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        if runtime.is_destroyed() {
            debug!("leaking {:?} after runtime shutdown", self.region);
            return;
        }
        let state = self.state.get_mut();
        for callback in state.callbacks.drain(..) {
            if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!("an invalidation callback of {:?} panicked", self.region);
                std::process::abort();
            }
        }
        let substrate = runtime.substrate();
        if let Some(physical) = state.physical.take() {
            if substrate.is_mapped(&physical) {
                if let Err(e) = substrate.unmap_region(&physical) {
                    warn!("failed to unmap {:?}: {e}", physical.region);
                }
            }
        }
        let unordered = self.destroyed_out_of_order.get();
        let mut attachment = state.attachment.take();
        let token = match attachment.as_mut() {
            Some(attachment) => match attachment.detach(substrate, unordered) {
                Ok(x) => x,
                Err(e) => {
                    error!("failed to detach {:?}: {e}", self.region);
                    std::process::abort();
                }
            },
            None => Future::empty(),
        };
        runtime.free_field(
            FreeFieldInfo::new(self.region.clone(), self.field_id, token, attachment),
            self.field_size,
            unordered,
        );
    }
}

impl fmt::Debug for LogicalRegionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalRegionField")
            .field("region", &self.region)
            .field("field_id", &self.field_id)
            .field("field_size", &self.field_size)
            .field("is_root", &self.parent.is_none())
            .finish()
    }
}

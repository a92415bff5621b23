use crate::data::external_allocation::ExternalAllocation;
use crate::error::{CoreError, CoreResult};
use crate::substrate::{ExternalResources, Future, PhysicalRegion, Substrate};

#[derive(Debug)]
enum AttachmentKind {
    Single {
        physical: PhysicalRegion,
        allocation: ExternalAllocation,
    },
    Index {
        resources: ExternalResources,
        allocations: Vec<ExternalAllocation>,
    },
}

/// The binding between external memory and the field of a root region field.
#[derive(Debug)]
pub(crate) struct Attachment {
    kind: AttachmentKind,
    detached: Option<Future>,
    deallocated: bool,
}

impl Attachment {
    pub fn single(physical: PhysicalRegion, allocation: ExternalAllocation) -> Self {
        Self {
            kind: AttachmentKind::Single {
                physical,
                allocation,
            },
            detached: None,
            deallocated: false,
        }
    }

    pub fn index(resources: ExternalResources, allocations: Vec<ExternalAllocation>) -> Self {
        Self {
            kind: AttachmentKind::Index {
                resources,
                allocations,
            },
            detached: None,
            deallocated: false,
        }
    }

    /// Issues the substrate detach and returns its completion token.
    pub fn detach(&mut self, substrate: &dyn Substrate, unordered: bool) -> CoreResult<Future> {
        if self.detached.is_some() {
            return Err(CoreError::internal("attachment was already detached"));
        }
        let token = match &self.kind {
            AttachmentKind::Single { physical, .. } => substrate.detach(physical, unordered)?,
            AttachmentKind::Index { resources, .. } => {
                substrate.detach_resources(resources, unordered)?
            }
        };
        self.detached = Some(token.clone());
        Ok(token)
    }

    /// Releases the read-only allocations once the detach has completed.
    pub fn maybe_deallocate(&mut self) -> CoreResult<()> {
        let Some(token) = &self.detached else {
            return Err(CoreError::internal(
                "attachment must be detached before it is deallocated",
            ));
        };
        if self.deallocated {
            return Err(CoreError::internal("attachment was already deallocated"));
        }
        token.wait();
        match &self.kind {
            AttachmentKind::Single { allocation, .. } => allocation.maybe_deallocate(),
            AttachmentKind::Index { allocations, .. } => {
                allocations.iter().for_each(|x| x.maybe_deallocate())
            }
        }
        self.deallocated = true;
        Ok(())
    }
}

use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::data::attachment::Attachment;
use crate::data::region_field::LogicalRegionField;
use crate::domain::Domain;
use crate::error::CoreResult;
use crate::id::FieldId;
use crate::runtime::RuntimeInner;
use crate::substrate::{Future, LogicalRegion, Substrate};

/// A field released by its last region field, waiting to be reused.
#[derive(Debug)]
pub(crate) struct FreeFieldInfo {
    region: LogicalRegion,
    field_id: FieldId,
    can_dealloc: Future,
    attachment: Option<Attachment>,
}

impl FreeFieldInfo {
    pub fn new(
        region: LogicalRegion,
        field_id: FieldId,
        can_dealloc: Future,
        attachment: Option<Attachment>,
    ) -> Self {
        Self {
            region,
            field_id,
            can_dealloc,
            attachment,
        }
    }

    pub fn extents(&self) -> Vec<u64> {
        self.region.domain.extents()
    }

    /// Waits for the pending detach and releases the attached memory.
    fn reclaim(&mut self) -> CoreResult<()> {
        self.can_dealloc.wait();
        if let Some(mut attachment) = self.attachment.take() {
            attachment.maybe_deallocate()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PendingMatch {
    infos: Vec<FreeFieldInfo>,
    matched: Vec<usize>,
}

/// Recycles the fields of one `(shape, field size)` pair.
///
/// Fields freed in program order go straight to the ordered free list. Fields freed out of
/// order may be released in different orders on different shards, so they only become
/// reusable once a consensus match confirms that every shard has released them.
#[derive(Debug)]
pub(crate) struct FieldManager {
    extents: Vec<u64>,
    field_size: usize,
    region: Option<LogicalRegion>,
    ordered_free: VecDeque<FreeFieldInfo>,
    unordered_free: Vec<FreeFieldInfo>,
    matches: VecDeque<PendingMatch>,
    match_counter: u32,
    reuse_frequency: u32,
}

impl FieldManager {
    pub fn new(extents: Vec<u64>, field_size: usize, reuse_frequency: u32) -> Self {
        Self {
            extents,
            field_size,
            region: None,
            ordered_free: VecDeque::new(),
            unordered_free: Vec::new(),
            matches: VecDeque::new(),
            match_counter: 0,
            reuse_frequency: reuse_frequency.max(1),
        }
    }

    pub fn allocate_field(
        &mut self,
        substrate: &dyn Substrate,
        runtime: &Weak<RuntimeInner>,
    ) -> CoreResult<Rc<LogicalRegionField>> {
        self.issue_field_match(substrate)?;
        loop {
            if let Some(field) = self.try_reuse_field(runtime)? {
                return Ok(field);
            }
            if !self.process_next_field_match() {
                break;
            }
        }
        self.create_new_field(substrate, runtime)
    }

    pub fn free_field(&mut self, info: FreeFieldInfo, unordered: bool) {
        debug!(
            "freeing field {} of {:?} ({})",
            info.field_id,
            info.region.tree,
            if unordered { "unordered" } else { "ordered" }
        );
        if unordered {
            self.unordered_free.push(info);
        } else {
            self.ordered_free.push_back(info);
        }
    }

    fn issue_field_match(&mut self, substrate: &dyn Substrate) -> CoreResult<()> {
        self.match_counter += 1;
        if self.match_counter < self.reuse_frequency {
            return Ok(());
        }
        self.match_counter = 0;
        if self.unordered_free.is_empty() {
            return Ok(());
        }
        let infos = std::mem::take(&mut self.unordered_free);
        let items = infos
            .iter()
            .map(|x| (x.region.tree, x.field_id))
            .collect::<Vec<_>>();
        let matched = substrate.consensus_match(&items)?;
        debug!(
            "consensus match over {} free fields matched {}",
            items.len(),
            matched.len()
        );
        self.matches.push_back(PendingMatch { infos, matched });
        Ok(())
    }

    fn process_next_field_match(&mut self) -> bool {
        let Some(PendingMatch { infos, matched }) = self.matches.pop_front() else {
            return false;
        };
        for (i, info) in infos.into_iter().enumerate() {
            if matched.contains(&i) {
                self.ordered_free.push_back(info);
            } else {
                self.unordered_free.push(info);
            }
        }
        true
    }

    fn try_reuse_field(
        &mut self,
        runtime: &Weak<RuntimeInner>,
    ) -> CoreResult<Option<Rc<LogicalRegionField>>> {
        let Some(mut info) = self.ordered_free.pop_front() else {
            return Ok(None);
        };
        info.reclaim()?;
        debug!(
            "reusing field {} of {:?} for shape {:?}",
            info.field_id, info.region.tree, self.extents
        );
        Ok(Some(Rc::new(LogicalRegionField::new_root(
            runtime.clone(),
            self.field_size,
            info.region,
            info.field_id,
        ))))
    }

    fn create_new_field(
        &mut self,
        substrate: &dyn Substrate,
        runtime: &Weak<RuntimeInner>,
    ) -> CoreResult<Rc<LogicalRegionField>> {
        let region = match &self.region {
            Some(x) => x.clone(),
            None => {
                let region = substrate.create_region(&Domain::from_extents(&self.extents))?;
                self.region = Some(region.clone());
                region
            }
        };
        let field_id = substrate.allocate_field(&region, self.field_size)?;
        debug!(
            "created field {field_id} of size {} in {:?} for shape {:?}",
            self.field_size, region.tree, self.extents
        );
        Ok(Rc::new(LogicalRegionField::new_root(
            runtime.clone(),
            self.field_size,
            region,
            field_id,
        )))
    }

    /// Releases the memory still held by free fields.
    pub fn destroy(&mut self) {
        let pending = self.matches.drain(..).flat_map(|x| x.infos);
        let infos = self
            .ordered_free
            .drain(..)
            .chain(self.unordered_free.drain(..))
            .chain(pending)
            .collect::<Vec<_>>();
        for mut info in infos {
            if let Err(e) = info.reclaim() {
                warn!("failed to reclaim field {}: {e}", info.field_id);
            }
        }
    }

    pub fn num_free_fields(&self) -> usize {
        self.ordered_free.len()
            + self.unordered_free.len()
            + self.matches.iter().map(|x| x.infos.len()).sum::<usize>()
    }
}

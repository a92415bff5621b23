use std::cell::RefCell;
use std::fmt;
use std::ops::Range;
use std::rc::{Rc, Weak};

use crate::data::buffer::read_rect;
use crate::data::physical::PhysicalStore;
use crate::data::region_field::LogicalRegionField;
use crate::data::transform::{StoreTransform, TransformStack};
use crate::domain::{Domain, Point};
use crate::error::{CoreError, CoreResult};
use crate::id::StorageId;
use crate::operation::launcher::Privilege;
use crate::partitioning::launch_shape::PartitionManager;
use crate::partitioning::partition::{Partition, Restriction, Tiling};
use crate::runtime::RuntimeInner;
use crate::shape::Shape;
use crate::substrate::Future;
use crate::types::Type;

#[derive(Debug, Clone)]
pub(crate) enum StorageKind {
    /// An output-only placeholder whose extents are decided by the task that writes it.
    Unbound { ndim: usize },
    RegionField(Rc<LogicalRegionField>),
    Future { future: Future, extents: Vec<u64> },
}

/// The backing storage shared by a store and all stores derived from it by transforms.
pub(crate) struct Storage {
    id: StorageId,
    ty: Type,
    kind: RefCell<StorageKind>,
    key_partition: RefCell<Option<Partition>>,
    runtime: Weak<RuntimeInner>,
}

impl Storage {
    pub fn new(id: StorageId, ty: Type, kind: StorageKind, runtime: Weak<RuntimeInner>) -> Self {
        Self {
            id,
            ty,
            kind: RefCell::new(kind),
            key_partition: RefCell::new(None),
            runtime,
        }
    }

    pub fn kind(&self) -> StorageKind {
        self.kind.borrow().clone()
    }

    pub fn ndim(&self) -> usize {
        match &*self.kind.borrow() {
            StorageKind::Unbound { ndim } => *ndim,
            StorageKind::RegionField(field) => field.dim(),
            StorageKind::Future { extents, .. } => extents.len(),
        }
    }

    pub fn extents(&self) -> Option<Vec<u64>> {
        match &*self.kind.borrow() {
            StorageKind::Unbound { .. } => None,
            StorageKind::RegionField(field) => Some(field.extents()),
            StorageKind::Future { extents, .. } => Some(extents.clone()),
        }
    }

    /// Replaces an unbound placeholder or an outdated future with new contents.
    pub fn set_kind(&self, kind: StorageKind) {
        *self.kind.borrow_mut() = kind;
        self.key_partition.borrow_mut().take();
    }

    pub fn key_partition(&self) -> Option<Partition> {
        self.key_partition.borrow().clone()
    }

    pub fn set_key_partition(&self, partition: Partition) {
        *self.key_partition.borrow_mut() = Some(partition);
    }

    fn runtime(&self) -> CoreResult<Rc<RuntimeInner>> {
        self.runtime
            .upgrade()
            .ok_or_else(|| CoreError::invalid("the runtime has been destroyed"))
    }
}

struct StoreInner {
    storage: Rc<Storage>,
    transform: TransformStack,
}

/// A handle to an n-dimensional array. Transforms create new handles over the same storage.
#[derive(Clone)]
pub struct LogicalStore(Rc<StoreInner>);

impl LogicalStore {
    pub(crate) fn new(storage: Rc<Storage>) -> Self {
        Self(Rc::new(StoreInner {
            storage,
            transform: TransformStack::identity(),
        }))
    }

    fn derive(&self, transform: StoreTransform) -> CoreResult<Self> {
        if self.is_unbound() {
            return Err(CoreError::invalid("an unbound store cannot be transformed"));
        }
        Ok(Self(Rc::new(StoreInner {
            storage: self.0.storage.clone(),
            transform: self.0.transform.push(transform),
        })))
    }

    pub(crate) fn storage(&self) -> &Rc<Storage> {
        &self.0.storage
    }

    pub(crate) fn transform(&self) -> &TransformStack {
        &self.0.transform
    }

    pub fn storage_id(&self) -> StorageId {
        self.0.storage.id
    }

    pub fn ty(&self) -> &Type {
        &self.0.storage.ty
    }

    pub fn dim(&self) -> usize {
        match self.0.storage.extents() {
            Some(extents) => self.0.transform.transform_shape(&extents).len(),
            None => self.0.storage.ndim(),
        }
    }

    pub fn extents(&self) -> CoreResult<Vec<u64>> {
        let extents = self
            .0
            .storage
            .extents()
            .ok_or_else(|| CoreError::invalid("an unbound store has no extents"))?;
        Ok(self.0.transform.transform_shape(&extents))
    }

    pub fn shape(&self) -> CoreResult<Shape> {
        Ok(Shape::new(self.extents()?))
    }

    pub fn volume(&self) -> CoreResult<u64> {
        Ok(self.extents()?.iter().product())
    }

    pub fn is_unbound(&self) -> bool {
        matches!(*self.0.storage.kind.borrow(), StorageKind::Unbound { .. })
    }

    pub fn has_scalar_storage(&self) -> bool {
        matches!(*self.0.storage.kind.borrow(), StorageKind::Future { .. })
    }

    pub fn is_transformed(&self) -> bool {
        !self.0.transform.is_identity()
    }

    pub fn same_storage(&self, other: &LogicalStore) -> bool {
        Rc::ptr_eq(&self.0.storage, &other.0.storage)
    }

    pub fn ptr_eq(&self, other: &LogicalStore) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn region_field(&self) -> Option<Rc<LogicalRegionField>> {
        match &*self.0.storage.kind.borrow() {
            StorageKind::RegionField(field) => Some(field.clone()),
            _ => None,
        }
    }

    pub fn future(&self) -> Option<Future> {
        match &*self.0.storage.kind.borrow() {
            StorageKind::Future { future, .. } => Some(future.clone()),
            _ => None,
        }
    }

    /// The per-axis restrictions that the transforms impose on partitioning.
    pub(crate) fn restrictions(&self) -> Vec<Restriction> {
        self.0.transform.restrictions(self.0.storage.ndim())
    }

    /// The key partition of the storage expressed over this store, if it can be.
    pub(crate) fn key_partition(&self) -> Option<Partition> {
        let partition = self.0.storage.key_partition()?;
        self.0.transform.convert_partition(&partition)
    }

    pub(crate) fn set_key_partition(&self, partition: &Partition) -> CoreResult<()> {
        let partition = self.0.transform.invert_partition(partition)?;
        self.0.storage.set_key_partition(partition);
        Ok(())
    }

    /// Removes axis `dim` by fixing it at `index`.
    pub fn project(&self, dim: usize, index: i64) -> CoreResult<Self> {
        let extents = self.extents()?;
        if dim >= extents.len() || index < 0 || index as u64 >= extents[dim] {
            return Err(CoreError::invalid(format!(
                "cannot project axis {dim} at {index} of a store with extents {extents:?}"
            )));
        }
        self.derive(StoreTransform::Project { dim, coord: index })
    }

    /// Adds a broadcast axis of size `dim_size` at `extra_dim`.
    pub fn promote(&self, extra_dim: usize, dim_size: u64) -> CoreResult<Self> {
        let ndim = self.dim();
        if extra_dim > ndim {
            return Err(CoreError::invalid(format!(
                "cannot promote axis {extra_dim} of a {ndim}-D store"
            )));
        }
        self.derive(StoreTransform::Promote {
            dim: extra_dim,
            extent: dim_size,
        })
    }

    pub fn slice(&self, dim: usize, range: Range<i64>) -> CoreResult<Self> {
        let extents = self.extents()?;
        if dim >= extents.len()
            || range.start < 0
            || range.start > range.end
            || range.end as u64 > extents[dim]
        {
            return Err(CoreError::invalid(format!(
                "cannot slice axis {dim} with {range:?} of a store with extents {extents:?}"
            )));
        }
        self.derive(StoreTransform::Slice {
            dim,
            start: range.start,
            extent: (range.end - range.start) as u64,
        })
    }

    pub fn transpose(&self, axes: Vec<usize>) -> CoreResult<Self> {
        let ndim = self.dim();
        let mut sorted = axes.clone();
        sorted.sort_unstable();
        if sorted != (0..ndim).collect::<Vec<_>>() {
            return Err(CoreError::invalid(format!(
                "{axes:?} is not a permutation of the axes of a {ndim}-D store"
            )));
        }
        self.derive(StoreTransform::Transpose { axes })
    }

    pub fn delinearize(&self, dim: usize, sizes: Vec<u64>) -> CoreResult<Self> {
        let extents = self.extents()?;
        if dim >= extents.len()
            || sizes.is_empty()
            || sizes.iter().product::<u64>() != extents[dim]
        {
            return Err(CoreError::invalid(format!(
                "cannot delinearize axis {dim} into {sizes:?} of a store with extents {extents:?}"
            )));
        }
        self.derive(StoreTransform::Delinearize { dim, sizes })
    }

    /// Partitions an untransformed store into tiles of `tile_shape`.
    pub fn partition_by_tiling(&self, tile_shape: Vec<u64>) -> CoreResult<LogicalStorePartition> {
        let extents = self.extents()?;
        if self.region_field().is_none() || self.is_transformed() {
            return Err(CoreError::unsupported(
                "tiling is only supported for untransformed region-backed stores",
            ));
        }
        if tile_shape.len() != extents.len() || tile_shape.iter().any(|t| *t == 0) {
            return Err(CoreError::invalid(format!(
                "invalid tile shape {tile_shape:?} for extents {extents:?}"
            )));
        }
        let color_shape = extents
            .iter()
            .zip(&tile_shape)
            .map(|(e, t)| e.div_ceil(*t))
            .collect::<Vec<_>>();
        let runtime = self.0.storage.runtime()?;
        let num_pieces = crate::scope::machine()
            .unwrap_or_else(|| runtime.substrate().machine())
            .preferred_count();
        let complete = PartitionManager::use_complete_tiling(&extents, &tile_shape, num_pieces);
        let offsets = vec![0; extents.len()];
        Ok(LogicalStorePartition {
            store: self.clone(),
            tiling: Tiling::new(tile_shape, color_shape, offsets),
            complete,
        })
    }

    /// The rectangle of the region tree covered by this store.
    pub(crate) fn covered_rect(&self) -> CoreResult<(Rc<LogicalRegionField>, Domain)> {
        let field = self
            .region_field()
            .ok_or_else(|| {
                CoreError::invalid(format!("{self:?} is not backed by a region field"))
            })?;
        let extents = self.extents()?;
        if extents.iter().any(|e| *e == 0) {
            return Ok((field.clone(), Domain::empty(field.dim())));
        }
        let hi = extents.iter().map(|e| *e as i64 - 1).collect::<Vec<_>>();
        let (lo, hi) = self.0.transform.invert_rect(&vec![0; extents.len()], &hi);
        let rect = Domain::new(Point::new(lo), Point::new(hi))?;
        let origin = field.domain().lo().coords().to_vec();
        Ok((field, rect.translate(&origin)))
    }

    /// Maps the store inline and returns a read-only snapshot of its contents.
    pub fn get_physical_store(&self) -> CoreResult<PhysicalStore> {
        let kind = self.0.storage.kind();
        let ty = self.ty().clone();
        let (rect, data, is_future) = match kind {
            StorageKind::Unbound { .. } => {
                return Err(CoreError::invalid("an unbound store cannot be mapped"))
            }
            StorageKind::Future { future, extents } => {
                let data = future.buffer()?.to_vec();
                (Domain::from_extents(&extents), data, true)
            }
            StorageKind::RegionField(field) => {
                let runtime = self.0.storage.runtime()?;
                let mapping = field.map()?;
                let root_data = runtime.substrate().read_region(&mapping.physical)?;
                let data = read_rect(
                    &root_data,
                    &mapping.physical.region.domain,
                    field.domain(),
                    ty.size(),
                )?;
                (Domain::from_extents(&field.extents()), data, false)
            }
        };
        PhysicalStore::new(
            ty,
            rect,
            self.0.transform.clone(),
            data,
            Privilege::ReadOnly,
            is_future,
        )
    }

    /// Detaches the external allocation attached to the storage.
    pub fn detach(&self) -> CoreResult<()> {
        let field = self
            .region_field()
            .ok_or_else(|| CoreError::invalid("store is not backed by a region field"))?;
        field.detach()
    }

    pub fn allow_out_of_order_destruction(&self) {
        if let Some(field) = self.region_field() {
            field.allow_out_of_order_destruction();
        }
    }
}

impl fmt::Debug for LogicalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("LogicalStore");
        s.field("storage", &self.0.storage.id)
            .field("ty", &self.0.storage.ty);
        match self.0.storage.extents() {
            Some(extents) => s.field("extents", &self.0.transform.transform_shape(&extents)),
            None => s.field("extents", &"unbound"),
        };
        s.field("transform", &format_args!("{}", self.0.transform))
            .finish()
    }
}

/// A tiling of a store whose children are stores themselves.
#[derive(Debug, Clone)]
pub struct LogicalStorePartition {
    store: LogicalStore,
    tiling: Tiling,
    complete: bool,
}

impl LogicalStorePartition {
    pub fn store(&self) -> &LogicalStore {
        &self.store
    }

    pub fn tiling(&self) -> &Tiling {
        &self.tiling
    }

    pub fn color_shape(&self) -> &[u64] {
        self.tiling.color_shape()
    }

    /// Whether the substrate may treat the tiling as a complete partition.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The store over the sub-region of the tile at `color`.
    pub fn get_child_store(&self, color: &Point) -> CoreResult<LogicalStore> {
        let field = self
            .store
            .region_field()
            .ok_or_else(|| CoreError::invalid("store is no longer backed by a region field"))?;
        let child = field.get_child(&self.tiling, color, self.complete)?;
        let runtime = self.store.0.storage.runtime()?;
        let storage = Storage::new(
            runtime.next_storage_id()?,
            self.store.ty().clone(),
            StorageKind::RegionField(child),
            self.store.0.storage.runtime.clone(),
        );
        Ok(LogicalStore::new(Rc::new(storage)))
    }
}

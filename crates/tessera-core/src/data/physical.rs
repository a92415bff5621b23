use std::fmt;
use std::sync::Arc;

use crate::data::transform::TransformStack;
use crate::domain::{Domain, Point};
use crate::error::{CoreError, CoreResult};
use crate::operation::launcher::Privilege;
use crate::reduction::ReductionOp;
use crate::types::{NativeType, Type};

fn check_type<T: NativeType>(ty: &Type) -> CoreResult<()> {
    if T::ty() != *ty {
        return Err(CoreError::invalid(format!(
            "store of type {ty} accessed as {}",
            T::ty()
        )));
    }
    Ok(())
}

/// A buffer created by a task body to hold the contents of an unbound output.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    ty: Type,
    extents: Vec<u64>,
    data: Vec<u8>,
}

impl OutputBuffer {
    pub fn extents(&self) -> &[u64] {
        &self.extents
    }

    fn offset(&self, point: &Point) -> CoreResult<usize> {
        let index = Domain::from_extents(&self.extents).linearize(point)?;
        Ok(index as usize * self.ty.size())
    }

    pub fn read<T: NativeType>(&self, point: &Point) -> CoreResult<T> {
        check_type::<T>(&self.ty)?;
        let offset = self.offset(point)?;
        Ok(T::read_bytes(&self.data[offset..]))
    }

    pub fn write<T: NativeType>(&mut self, point: &Point, value: T) -> CoreResult<()> {
        check_type::<T>(&self.ty)?;
        let offset = self.offset(point)?;
        value.write_bytes(&mut self.data[offset..]);
        Ok(())
    }
}

#[derive(Debug)]
struct UnboundOutput {
    ndim: usize,
    pool_size: Option<usize>,
    bound: Option<(Vec<u64>, Vec<u8>)>,
}

/// The view of one store that a point task reads and writes.
///
/// The data covers `storage_rect`, a rectangle in the coordinates of the storage,
/// and the store coordinates map to it through the transforms of the store.
pub struct PhysicalStore {
    ty: Type,
    domain: Domain,
    storage_rect: Domain,
    transform: TransformStack,
    data: Vec<u8>,
    privilege: Privilege,
    redop: Option<Arc<dyn ReductionOp>>,
    is_future: bool,
    unbound: Option<UnboundOutput>,
}

impl PhysicalStore {
    pub(crate) fn new(
        ty: Type,
        storage_rect: Domain,
        transform: TransformStack,
        data: Vec<u8>,
        privilege: Privilege,
        is_future: bool,
    ) -> CoreResult<Self> {
        if data.len() != storage_rect.volume() as usize * ty.size() {
            return Err(CoreError::internal(format!(
                "{} bytes do not cover {storage_rect} of type {ty}",
                data.len()
            )));
        }
        let domain = if storage_rect.is_empty() {
            Domain::empty(transform.transform_shape(&storage_rect.extents()).len())
        } else {
            let (lo, hi) =
                transform.transform_rect(storage_rect.lo().coords(), storage_rect.hi().coords());
            Domain::new(Point::new(lo), Point::new(hi))?
        };
        Ok(Self {
            ty,
            domain,
            storage_rect,
            transform,
            data,
            privilege,
            redop: None,
            is_future,
            unbound: None,
        })
    }

    pub(crate) fn new_unbound(ty: Type, ndim: usize, pool_size: Option<usize>) -> Self {
        Self {
            ty,
            domain: Domain::empty(ndim),
            storage_rect: Domain::empty(ndim),
            transform: TransformStack::identity(),
            data: vec![],
            privilege: Privilege::WriteDiscard,
            redop: None,
            is_future: false,
            unbound: Some(UnboundOutput {
                ndim,
                pool_size,
                bound: None,
            }),
        }
    }

    pub(crate) fn with_reduction(mut self, redop: Arc<dyn ReductionOp>) -> Self {
        self.redop = Some(redop);
        self
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn dim(&self) -> usize {
        self.domain.ndim()
    }

    /// The part of the store this point task operates on, in store coordinates.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn is_future(&self) -> bool {
        self.is_future
    }

    pub fn is_unbound(&self) -> bool {
        self.unbound.is_some()
    }

    pub fn is_readable(&self) -> bool {
        matches!(self.privilege, Privilege::ReadOnly | Privilege::ReadWrite)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.privilege, Privilege::WriteDiscard | Privilege::ReadWrite)
    }

    pub fn is_reducible(&self) -> bool {
        matches!(self.privilege, Privilege::Reduce(_))
    }

    fn offset(&self, point: &Point) -> CoreResult<usize> {
        if self.unbound.is_some() {
            return Err(CoreError::invalid(
                "an unbound store has no data until it is bound",
            ));
        }
        if !self.domain.contains(point) {
            return Err(CoreError::invalid(format!(
                "point {point} is outside of store domain {}",
                self.domain
            )));
        }
        let storage_point = Point::new(self.transform.invert_point(point.coords()));
        let index = self.storage_rect.linearize(&storage_point)?;
        Ok(index as usize * self.ty.size())
    }

    /// The raw bytes of the element at `point`.
    pub fn read_bytes(&self, point: &Point) -> CoreResult<&[u8]> {
        let offset = self.offset(point)?;
        Ok(&self.data[offset..offset + self.ty.size()])
    }

    pub fn read<T: NativeType>(&self, point: &Point) -> CoreResult<T> {
        check_type::<T>(&self.ty)?;
        Ok(T::read_bytes(self.read_bytes(point)?))
    }

    /// Reads the value of a store holding a single element.
    pub fn scalar<T: NativeType>(&self) -> CoreResult<T> {
        if self.domain.volume() != 1 {
            return Err(CoreError::invalid(format!(
                "store over {} holds more than one element",
                self.domain
            )));
        }
        self.read(self.domain.lo())
    }

    /// All elements of the store in C order.
    pub fn values<T: NativeType>(&self) -> CoreResult<Vec<T>> {
        self.domain.points().map(|p| self.read::<T>(&p)).collect()
    }

    pub fn write<T: NativeType>(&mut self, point: &Point, value: T) -> CoreResult<()> {
        check_type::<T>(&self.ty)?;
        if !self.is_writable() {
            return Err(CoreError::invalid(format!(
                "store with {:?} privilege cannot be written",
                self.privilege
            )));
        }
        let offset = self.offset(point)?;
        value.write_bytes(&mut self.data[offset..]);
        Ok(())
    }

    /// Folds `value` into the element at `point` with the reduction operator of the store.
    pub fn reduce<T: NativeType>(&mut self, point: &Point, value: T) -> CoreResult<()> {
        check_type::<T>(&self.ty)?;
        let Some(redop) = self.redop.clone() else {
            return Err(CoreError::invalid("store is not a reduction argument"));
        };
        let offset = self.offset(point)?;
        let mut rhs = vec![0; self.ty.size()];
        value.write_bytes(&mut rhs);
        redop.fold(&mut self.data[offset..offset + self.ty.size()], &rhs);
        Ok(())
    }

    pub fn create_output_buffer(&self, extents: &[u64]) -> CoreResult<OutputBuffer> {
        let Some(unbound) = &self.unbound else {
            return Err(CoreError::invalid(
                "output buffers can only be created for unbound stores",
            ));
        };
        if extents.len() != unbound.ndim {
            return Err(CoreError::invalid(format!(
                "{}-D output buffer requested for a {}-D store",
                extents.len(),
                unbound.ndim
            )));
        }
        let size = extents.iter().product::<u64>() as usize * self.ty.size();
        if let Some(limit) = unbound.pool_size {
            if size > limit {
                return Err(CoreError::invalid(format!(
                    "output buffer of {size} bytes exceeds the allocation pool of {limit} bytes"
                )));
            }
        }
        Ok(OutputBuffer {
            ty: self.ty.clone(),
            extents: extents.to_vec(),
            data: vec![0; size],
        })
    }

    /// Binds the leading `extents` of `buffer` as the contents of this unbound store.
    pub fn bind_data(&mut self, buffer: OutputBuffer, extents: &[u64]) -> CoreResult<()> {
        let Some(unbound) = &mut self.unbound else {
            return Err(CoreError::invalid("only an unbound store can be bound"));
        };
        if unbound.bound.is_some() {
            return Err(CoreError::invalid("unbound store was already bound"));
        }
        if buffer.ty != self.ty
            || extents.len() != buffer.extents.len()
            || extents.iter().zip(&buffer.extents).any(|(e, b)| e > b)
        {
            return Err(CoreError::invalid(format!(
                "cannot bind extents {extents:?} of a buffer with extents {:?}",
                buffer.extents
            )));
        }
        let data = if extents == buffer.extents.as_slice() {
            buffer.data
        } else {
            crate::data::buffer::read_rect(
                &buffer.data,
                &Domain::from_extents(&buffer.extents),
                &Domain::from_extents(extents),
                self.ty.size(),
            )?
        };
        unbound.bound = Some((extents.to_vec(), data));
        Ok(())
    }

    pub fn bind_empty_data(&mut self) -> CoreResult<()> {
        let ndim = self.unbound.as_ref().map(|x| x.ndim).unwrap_or_default();
        let buffer = self.create_output_buffer(&vec![0; ndim])?;
        self.bind_data(buffer, &vec![0; ndim])
    }

    pub(crate) fn storage_rect(&self) -> &Domain {
        &self.storage_rect
    }

    pub(crate) fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub(crate) fn take_bound(&mut self) -> Option<(Vec<u64>, Vec<u8>)> {
        self.unbound.as_mut().and_then(|x| x.bound.take())
    }
}

impl fmt::Debug for PhysicalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalStore")
            .field("ty", &self.ty)
            .field("domain", &self.domain)
            .field("storage_rect", &self.storage_rect)
            .field("privilege", &self.privilege)
            .field("is_future", &self.is_future)
            .field("is_unbound", &self.unbound.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::transform::StoreTransform;

    #[test]
    fn test_transformed_access() -> CoreResult<()> {
        let storage = Domain::from_extents(&[2, 3]);
        let data = (0..6i64).flat_map(|x| x.to_ne_bytes()).collect::<Vec<_>>();
        let transform =
            TransformStack::identity().push(StoreTransform::Transpose { axes: vec![1, 0] });
        let mut store = PhysicalStore::new(
            Type::int64(),
            storage,
            transform,
            data,
            Privilege::ReadWrite,
            false,
        )?;
        assert_eq!(store.domain(), &Domain::from_extents(&[3, 2]));
        assert_eq!(store.read::<i64>(&Point::from([2, 1]))?, 5);
        store.write(&Point::from([0, 1]), 42i64)?;
        assert_eq!(store.values::<i64>()?, vec![0, 42, 1, 4, 2, 5]);
        assert!(store.read::<i32>(&Point::from([0, 0])).is_err());
        Ok(())
    }

    #[test]
    fn test_read_only_store() -> CoreResult<()> {
        let mut store = PhysicalStore::new(
            Type::int32(),
            Domain::from_extents(&[1]),
            TransformStack::identity(),
            7i32.to_ne_bytes().to_vec(),
            Privilege::ReadOnly,
            true,
        )?;
        assert_eq!(store.scalar::<i32>()?, 7);
        assert!(matches!(
            store.write(&Point::from([0]), 1i32),
            Err(CoreError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_bind_once() -> CoreResult<()> {
        let mut store = PhysicalStore::new_unbound(Type::int64(), 1, None);
        let mut buffer = store.create_output_buffer(&[4])?;
        buffer.write(&Point::from([1]), 9i64)?;
        store.bind_data(buffer.clone(), &[2])?;
        assert!(store.bind_data(buffer, &[4]).is_err());
        let (extents, data) = store.take_bound().ok_or_else(|| CoreError::internal("unbound"))?;
        assert_eq!(extents, vec![2]);
        assert_eq!(i64::read_bytes(&data[8..]), 9);
        Ok(())
    }
}

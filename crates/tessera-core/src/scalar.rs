use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::types::{NativeType, Type};

/// A typed value held in host-native bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scalar {
    ty: Type,
    data: Vec<u8>,
}

impl Scalar {
    pub fn new<T: NativeType>(value: T) -> Self {
        let ty = T::ty();
        let mut data = vec![0; ty.size()];
        value.write_bytes(&mut data);
        Self { ty, data }
    }

    /// Creates a fixed-size array scalar from `values`.
    pub fn from_slice<T: NativeType>(values: &[T]) -> Self {
        let element = T::ty();
        let size = element.size();
        let mut data = vec![0; size * values.len()];
        for (i, v) in values.iter().enumerate() {
            v.write_bytes(&mut data[i * size..(i + 1) * size]);
        }
        Self {
            ty: Type::FixedArray {
                element: element.into(),
                n: values.len() as u32,
            },
            data,
        }
    }

    pub fn from_bytes(ty: Type, data: Vec<u8>) -> CoreResult<Self> {
        if ty.is_variable_size() {
            return Err(CoreError::invalid(format!(
                "scalar of variable-size type {ty}"
            )));
        }
        if data.len() != ty.size() {
            return Err(CoreError::invalid(format!(
                "scalar of type {ty} needs {} bytes but got {}",
                ty.size(),
                data.len()
            )));
        }
        Ok(Self { ty, data })
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn value<T: NativeType>(&self) -> CoreResult<T> {
        if T::ty() != self.ty {
            return Err(CoreError::invalid(format!(
                "scalar of type {} cannot be read as {}",
                self.ty,
                T::ty()
            )));
        }
        Ok(T::read_bytes(&self.data))
    }

    pub fn values<T: NativeType>(&self) -> CoreResult<Vec<T>> {
        match &self.ty {
            Type::FixedArray { element, n } if element.as_ref() == &T::ty() => {
                let size = T::size();
                Ok((0..*n as usize)
                    .map(|i| T::read_bytes(&self.data[i * size..(i + 1) * size]))
                    .collect())
            }
            _ => Err(CoreError::invalid(format!(
                "scalar of type {} is not an array of {}",
                self.ty,
                T::ty()
            ))),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scalar({}, {} bytes)", self.ty, self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_value() -> CoreResult<()> {
        let scalar = Scalar::new(42i64);
        assert_eq!(scalar.size(), 8);
        assert_eq!(scalar.value::<i64>()?, 42);
        assert!(scalar.value::<i32>().is_err());
        Ok(())
    }

    #[test]
    fn test_scalar_array() -> CoreResult<()> {
        let scalar = Scalar::from_slice(&[0i32, 2]);
        assert_eq!(scalar.values::<i32>()?, vec![0, 2]);
        assert!(scalar.values::<i64>().is_err());
        Ok(())
    }

    #[test]
    fn test_scalar_from_bytes() {
        assert!(Scalar::from_bytes(Type::int32(), vec![0; 3]).is_err());
        assert!(Scalar::from_bytes(Type::String, vec![]).is_err());
    }
}

use std::fmt;
use std::sync::Arc;

use half::f16;
use num::complex::Complex;
use num_enum::TryFromPrimitive;

use crate::error::{CoreError, CoreResult};

/// The largest store dimensionality that [`double_dispatch`] specializes for.
pub const MAX_DIM: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive)]
#[num_enum(error_type(name = CoreError, constructor = TypeCode::invalid))]
#[repr(i32)]
pub enum TypeCode {
    Bool = 0,
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,
    Uint8 = 5,
    Uint16 = 6,
    Uint32 = 7,
    Uint64 = 8,
    Float16 = 9,
    Float32 = 10,
    Float64 = 11,
    Complex64 = 12,
    Complex128 = 13,
    Binary = 15,
    FixedArray = 16,
    Struct = 17,
    String = 18,
}

impl TypeCode {
    fn invalid(value: i32) -> CoreError {
        CoreError::invalid(format!("type code: {value}"))
    }

    pub fn is_primitive(&self) -> bool {
        (*self as i32) <= TypeCode::Complex128 as i32
    }

    fn primitive_size(&self) -> usize {
        match self {
            TypeCode::Bool | TypeCode::Int8 | TypeCode::Uint8 => 1,
            TypeCode::Int16 | TypeCode::Uint16 | TypeCode::Float16 => 2,
            TypeCode::Int32 | TypeCode::Uint32 | TypeCode::Float32 => 4,
            TypeCode::Int64 | TypeCode::Uint64 | TypeCode::Float64 | TypeCode::Complex64 => 8,
            TypeCode::Complex128 => 16,
            TypeCode::Binary | TypeCode::FixedArray | TypeCode::Struct | TypeCode::String => 0,
        }
    }

    fn primitive_alignment(&self) -> usize {
        match self {
            TypeCode::Complex64 => 4,
            TypeCode::Complex128 => 8,
            x => x.primitive_size(),
        }
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeCode::Bool => "bool",
            TypeCode::Int8 => "int8",
            TypeCode::Int16 => "int16",
            TypeCode::Int32 => "int32",
            TypeCode::Int64 => "int64",
            TypeCode::Uint8 => "uint8",
            TypeCode::Uint16 => "uint16",
            TypeCode::Uint32 => "uint32",
            TypeCode::Uint64 => "uint64",
            TypeCode::Float16 => "float16",
            TypeCode::Float32 => "float32",
            TypeCode::Float64 => "float64",
            TypeCode::Complex64 => "complex64",
            TypeCode::Complex128 => "complex128",
            TypeCode::Binary => "binary",
            TypeCode::FixedArray => "fixed_array",
            TypeCode::Struct => "struct",
            TypeCode::String => "string",
        };
        write!(f, "{name}")
    }
}

/// The element type of a store or scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Primitive(TypeCode),
    FixedArray { element: Arc<Type>, n: u32 },
    Struct { fields: Arc<[Type]>, align: bool },
    String,
    Binary,
}

impl Type {
    pub fn primitive(code: TypeCode) -> CoreResult<Self> {
        if code.is_primitive() {
            Ok(Type::Primitive(code))
        } else {
            Err(CoreError::invalid(format!("{code} is not a primitive type")))
        }
    }

    pub fn bool() -> Self {
        Type::Primitive(TypeCode::Bool)
    }

    pub fn int32() -> Self {
        Type::Primitive(TypeCode::Int32)
    }

    pub fn int64() -> Self {
        Type::Primitive(TypeCode::Int64)
    }

    pub fn uint64() -> Self {
        Type::Primitive(TypeCode::Uint64)
    }

    pub fn float32() -> Self {
        Type::Primitive(TypeCode::Float32)
    }

    pub fn float64() -> Self {
        Type::Primitive(TypeCode::Float64)
    }

    pub fn fixed_array(element: Type, n: u32) -> CoreResult<Self> {
        if element.is_variable_size() {
            return Err(CoreError::invalid(
                "fixed-size array cannot have a variable-size element type",
            ));
        }
        Ok(Type::FixedArray {
            element: Arc::new(element),
            n,
        })
    }

    pub fn struct_type(fields: Vec<Type>, align: bool) -> CoreResult<Self> {
        if fields.is_empty() {
            return Err(CoreError::invalid("struct type must have at least one field"));
        }
        if fields.iter().any(|x| x.is_variable_size()) {
            return Err(CoreError::invalid(
                "struct type cannot have a variable-size field",
            ));
        }
        Ok(Type::Struct {
            fields: fields.into(),
            align,
        })
    }

    /// An `ndim`-dimensional point, stored as `ndim` 64-bit integers.
    pub fn point(ndim: usize) -> Self {
        Type::FixedArray {
            element: Arc::new(Type::int64()),
            n: ndim as u32,
        }
    }

    /// An `ndim`-dimensional rectangle, stored as the `lo` point followed by the `hi` point.
    pub fn rect(ndim: usize) -> Self {
        Type::Struct {
            fields: vec![Type::point(ndim), Type::point(ndim)].into(),
            align: true,
        }
    }

    pub fn code(&self) -> TypeCode {
        match self {
            Type::Primitive(code) => *code,
            Type::FixedArray { .. } => TypeCode::FixedArray,
            Type::Struct { .. } => TypeCode::Struct,
            Type::String => TypeCode::String,
            Type::Binary => TypeCode::Binary,
        }
    }

    pub fn is_variable_size(&self) -> bool {
        matches!(self, Type::String | Type::Binary)
    }

    /// The size of one element in bytes, or zero for variable-size types.
    pub fn size(&self) -> usize {
        match self {
            Type::Primitive(code) => code.primitive_size(),
            Type::FixedArray { element, n } => element.size() * (*n as usize),
            Type::Struct { fields, align } => {
                let mut offset: usize = 0;
                for field in fields.iter() {
                    if *align {
                        offset = offset.next_multiple_of(field.alignment());
                    }
                    offset += field.size();
                }
                if *align {
                    offset.next_multiple_of(self.alignment())
                } else {
                    offset
                }
            }
            Type::String | Type::Binary => 0,
        }
    }

    pub fn alignment(&self) -> usize {
        match self {
            Type::Primitive(code) => code.primitive_alignment(),
            Type::FixedArray { element, .. } => element.alignment(),
            Type::Struct { fields, align } => {
                if *align {
                    fields.iter().map(|x| x.alignment()).max().unwrap_or(1)
                } else {
                    1
                }
            }
            Type::String | Type::Binary => 1,
        }
    }

    /// Returns the dimensionality if this is a point type created by [`Type::point`].
    pub fn as_point(&self) -> Option<usize> {
        match self {
            Type::FixedArray { element, n } if element.as_ref() == &Type::int64() => {
                Some(*n as usize)
            }
            _ => None,
        }
    }

    /// Returns the dimensionality if this is a rectangle type created by [`Type::rect`].
    pub fn as_rect(&self) -> Option<usize> {
        match self {
            Type::Struct { fields, .. } if fields.len() == 2 && fields[0] == fields[1] => {
                fields[0].as_point()
            }
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Primitive(code) => write!(f, "{code}"),
            Type::FixedArray { element, n } => write!(f, "{element}[{n}]"),
            Type::Struct { fields, align } => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, "}}{}", if *align { "" } else { ":packed" })
            }
            Type::String => write!(f, "string"),
            Type::Binary => write!(f, "binary"),
        }
    }
}

/// A Rust type that can be stored in a store or a scalar.
/// Values are encoded in host-native byte order.
pub trait NativeType: Copy + Send + Sync + 'static {
    fn ty() -> Type;
    fn write_bytes(&self, out: &mut [u8]);
    fn read_bytes(bytes: &[u8]) -> Self;

    fn size() -> usize {
        Self::ty().size()
    }
}

macro_rules! impl_native_type {
    ($type:ty, $code:expr) => {
        impl NativeType for $type {
            fn ty() -> Type {
                Type::Primitive($code)
            }

            fn write_bytes(&self, out: &mut [u8]) {
                out[..std::mem::size_of::<$type>()].copy_from_slice(&self.to_ne_bytes());
            }

            fn read_bytes(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$type>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$type>()]);
                <$type>::from_ne_bytes(buf)
            }
        }
    };
}

impl_native_type!(i8, TypeCode::Int8);
impl_native_type!(i16, TypeCode::Int16);
impl_native_type!(i32, TypeCode::Int32);
impl_native_type!(i64, TypeCode::Int64);
impl_native_type!(u8, TypeCode::Uint8);
impl_native_type!(u16, TypeCode::Uint16);
impl_native_type!(u32, TypeCode::Uint32);
impl_native_type!(u64, TypeCode::Uint64);
impl_native_type!(f16, TypeCode::Float16);
impl_native_type!(f32, TypeCode::Float32);
impl_native_type!(f64, TypeCode::Float64);

impl NativeType for bool {
    fn ty() -> Type {
        Type::bool()
    }

    fn write_bytes(&self, out: &mut [u8]) {
        out[0] = u8::from(*self);
    }

    fn read_bytes(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

macro_rules! impl_complex_native_type {
    ($part:ty, $code:expr) => {
        impl NativeType for Complex<$part> {
            fn ty() -> Type {
                Type::Primitive($code)
            }

            fn write_bytes(&self, out: &mut [u8]) {
                let n = std::mem::size_of::<$part>();
                self.re.write_bytes(&mut out[..n]);
                self.im.write_bytes(&mut out[n..2 * n]);
            }

            fn read_bytes(bytes: &[u8]) -> Self {
                let n = std::mem::size_of::<$part>();
                Complex::new(
                    <$part>::read_bytes(&bytes[..n]),
                    <$part>::read_bytes(&bytes[n..2 * n]),
                )
            }
        }
    };
}

impl_complex_native_type!(f32, TypeCode::Complex64);
impl_complex_native_type!(f64, TypeCode::Complex128);

impl<const N: usize> NativeType for [i64; N] {
    fn ty() -> Type {
        Type::point(N)
    }

    fn write_bytes(&self, out: &mut [u8]) {
        for (i, x) in self.iter().enumerate() {
            x.write_bytes(&mut out[i * 8..(i + 1) * 8]);
        }
    }

    fn read_bytes(bytes: &[u8]) -> Self {
        let mut result = [0i64; N];
        for (i, x) in result.iter_mut().enumerate() {
            *x = i64::read_bytes(&bytes[i * 8..(i + 1) * 8]);
        }
        result
    }
}

/// A visitor specialized on an element type and a dimensionality.
pub trait TypeDimVisitor {
    type Output;

    fn visit<T: NativeType, const DIM: usize>(self) -> Self::Output;
}

fn dispatch_dim<T: NativeType, V: TypeDimVisitor>(
    ndim: usize,
    visitor: V,
) -> CoreResult<V::Output> {
    match ndim {
        1 => Ok(visitor.visit::<T, 1>()),
        2 => Ok(visitor.visit::<T, 2>()),
        3 => Ok(visitor.visit::<T, 3>()),
        4 => Ok(visitor.visit::<T, 4>()),
        _ => Err(CoreError::unsupported(format!(
            "dimension {ndim} (supported dimensions are 1 to {MAX_DIM})"
        ))),
    }
}

/// Invokes `visitor` specialized on the native type of `code` and on `ndim`.
pub fn double_dispatch<V: TypeDimVisitor>(
    code: TypeCode,
    ndim: usize,
    visitor: V,
) -> CoreResult<V::Output> {
    match code {
        TypeCode::Bool => dispatch_dim::<bool, V>(ndim, visitor),
        TypeCode::Int8 => dispatch_dim::<i8, V>(ndim, visitor),
        TypeCode::Int16 => dispatch_dim::<i16, V>(ndim, visitor),
        TypeCode::Int32 => dispatch_dim::<i32, V>(ndim, visitor),
        TypeCode::Int64 => dispatch_dim::<i64, V>(ndim, visitor),
        TypeCode::Uint8 => dispatch_dim::<u8, V>(ndim, visitor),
        TypeCode::Uint16 => dispatch_dim::<u16, V>(ndim, visitor),
        TypeCode::Uint32 => dispatch_dim::<u32, V>(ndim, visitor),
        TypeCode::Uint64 => dispatch_dim::<u64, V>(ndim, visitor),
        TypeCode::Float16 => dispatch_dim::<f16, V>(ndim, visitor),
        TypeCode::Float32 => dispatch_dim::<f32, V>(ndim, visitor),
        TypeCode::Float64 => dispatch_dim::<f64, V>(ndim, visitor),
        TypeCode::Complex64 => dispatch_dim::<Complex<f32>, V>(ndim, visitor),
        TypeCode::Complex128 => dispatch_dim::<Complex<f64>, V>(ndim, visitor),
        TypeCode::Binary | TypeCode::FixedArray | TypeCode::Struct | TypeCode::String => Err(
            CoreError::unsupported(format!("dispatch on non-primitive type {code}")),
        ),
    }
}

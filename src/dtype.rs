//! Element types, scalar values and host-resident arrays.
//!
//! Host arrays keep their contents as raw bytes behind a shared lock so the
//! same storage can be handed to a device that uses host-pointer semantics.

use crate::error::{Error, Result};
use bytemuck::Pod;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Element type of a buffer or scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// `u8`.
    U8,
    /// `i32`.
    I32,
    /// `u32`.
    U32,
    /// `i64`.
    I64,
    /// `u64`.
    U64,
    /// `f32`.
    F32,
    /// `f64`.
    F64,
}

impl DType {
    /// Size in bytes of one element.
    pub const fn size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
        }
    }

    /// Whether the type is a floating point type.
    pub const fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Whether a device needs double-precision arithmetic for this type.
    pub const fn requires_double(self) -> bool {
        matches!(self, DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::U8 => "uchar",
            DType::I32 => "int",
            DType::U32 => "uint",
            DType::I64 => "long",
            DType::U64 => "ulong",
            DType::F32 => "float",
            DType::F64 => "double",
        };
        f.write_str(name)
    }
}

/// Rust types that map onto a [`DType`].
pub trait Element: Pod + Send + Sync + fmt::Debug {
    /// The matching [`DType`].
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;
            }
        )*
    };
}

impl_element!(
    u8 => U8,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
);

/// A single value passed to a kernel by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    /// A `u8` value.
    U8(u8),
    /// A `i32` value.
    I32(i32),
    /// A `u32` value.
    U32(u32),
    /// A `i64` value.
    I64(i64),
    /// A `u64` value.
    U64(u64),
    /// A `f32` value.
    F32(f32),
    /// A `f64` value.
    F64(f64),
}

impl ScalarValue {
    /// Type of the value.
    pub fn dtype(&self) -> DType {
        match self {
            ScalarValue::U8(_) => DType::U8,
            ScalarValue::I32(_) => DType::I32,
            ScalarValue::U32(_) => DType::U32,
            ScalarValue::I64(_) => DType::I64,
            ScalarValue::U64(_) => DType::U64,
            ScalarValue::F32(_) => DType::F32,
            ScalarValue::F64(_) => DType::F64,
        }
    }

    /// Lossy conversion used by kernels that do their arithmetic in f64.
    pub fn as_f64(&self) -> f64 {
        match *self {
            ScalarValue::U8(v) => v as f64,
            ScalarValue::I32(v) => v as f64,
            ScalarValue::U32(v) => v as f64,
            ScalarValue::I64(v) => v as f64,
            ScalarValue::U64(v) => v as f64,
            ScalarValue::F32(v) => v as f64,
            ScalarValue::F64(v) => v,
        }
    }

    /// Integer view, `None` for floating point values.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            ScalarValue::U8(v) => Some(v as i64),
            ScalarValue::I32(v) => Some(v as i64),
            ScalarValue::U32(v) => Some(v as i64),
            ScalarValue::I64(v) => Some(v),
            ScalarValue::U64(v) => i64::try_from(v).ok(),
            ScalarValue::F32(_) | ScalarValue::F64(_) => None,
        }
    }
}

macro_rules! impl_scalar_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for ScalarValue {
                fn from(v: $ty) -> Self {
                    ScalarValue::$variant(v)
                }
            }
        )*
    };
}

impl_scalar_from!(
    u8 => U8,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
);

/// Shared byte storage. Cloning shares the allocation.
pub type SharedBytes = Arc<RwLock<Vec<u8>>>;

/// A host-resident n-dimensional array.
///
/// The first axis is the instance axis: row `i` holds the data of problem
/// instance `i`. Clones share storage.
#[derive(Clone)]
pub struct HostArray {
    dtype: DType,
    shape: Vec<usize>,
    storage: SharedBytes,
}

impl HostArray {
    /// Build an array from typed data. `shape` must multiply out to `data.len()`.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::argument(format!(
                "shape {:?} holds {} elements but {} were given",
                shape,
                expected,
                data.len()
            )));
        }
        let bytes = bytemuck::cast_slice::<T, u8>(&data).to_vec();
        Ok(Self {
            dtype: T::DTYPE,
            shape,
            storage: Arc::new(RwLock::new(bytes)),
        })
    }

    /// A one dimensional array with one element per instance.
    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        let shape = vec![data.len()];
        Self {
            dtype: T::DTYPE,
            shape,
            storage: Arc::new(RwLock::new(bytemuck::cast_slice::<T, u8>(data).to_vec())),
        }
    }

    /// A zero-filled array.
    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let len: usize = shape.iter().product::<usize>() * dtype.size();
        Self {
            dtype,
            shape,
            storage: Arc::new(RwLock::new(vec![0u8; len])),
        }
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Dimensions, instance axis first.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of rows along the instance axis. Zero-dimensional arrays have one.
    pub fn nmr_rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Elements per row.
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the storage in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * self.dtype.size()
    }

    /// Bytes occupied by one row.
    pub fn row_bytes(&self) -> usize {
        self.row_len() * self.dtype.size()
    }

    /// Shared storage handle; used by drivers for zero-copy bindings.
    pub fn storage(&self) -> &SharedBytes {
        &self.storage
    }

    /// Copy the contents out as typed values.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.check_dtype::<T>()?;
        let bytes = self.storage.read();
        Ok(bytes
            .chunks_exact(self.dtype.size())
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }

    /// Copy raw bytes for rows `[start, end)`.
    pub fn read_rows(&self, start: usize, end: usize) -> Result<Vec<u8>> {
        let row = self.row_bytes();
        let storage = self.storage.read();
        storage
            .get(start * row..end * row)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                Error::argument(format!(
                    "rows [{}, {}) are outside an array of {} rows",
                    start,
                    end,
                    self.nmr_rows()
                ))
            })
    }

    /// Overwrite rows starting at `start` with raw bytes.
    pub fn write_rows(&self, start: usize, bytes: &[u8]) -> Result<()> {
        let offset = start * self.row_bytes();
        let mut storage = self.storage.write();
        if offset + bytes.len() > storage.len() {
            return Err(Error::argument(format!(
                "write of {} bytes at offset {} exceeds array of {} bytes",
                bytes.len(),
                offset,
                storage.len()
            )));
        }
        storage[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(Error::argument(format!(
                "array holds {} but {} was requested",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostArray")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::U8.size(), 1);
        assert_eq!(DType::F32.size(), 4);
        assert_eq!(DType::F64.size(), 8);
        assert!(DType::F64.requires_double());
        assert!(!DType::F32.requires_double());
        assert_eq!(DType::F64.to_string(), "double");
    }

    #[test]
    fn test_host_array_rows() {
        let arr = HostArray::from_vec((0..12).map(|v| v as f64).collect(), vec![4, 3]).unwrap();
        assert_eq!(arr.nmr_rows(), 4);
        assert_eq!(arr.row_len(), 3);
        assert_eq!(arr.row_bytes(), 24);

        let rows = arr.read_rows(1, 3).unwrap();
        let values: Vec<f64> = rows.chunks_exact(8).map(bytemuck::pod_read_unaligned).collect();
        assert_eq!(values, vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        assert!(matches!(arr.read_rows(2, 5), Err(Error::InvalidArgument(_))));
        assert!(matches!(arr.read_rows(3, 1), Err(Error::InvalidArgument(_))));
        assert_eq!(arr.read_rows(3, 3).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_host_array_shape_mismatch() {
        assert!(HostArray::from_vec(vec![1.0f32; 5], vec![2, 3]).is_err());
    }

    #[test]
    fn test_write_rows_and_dtype_check() {
        let arr = HostArray::zeros(DType::I32, vec![3]);
        arr.write_rows(1, bytemuck::bytes_of(&7i32)).unwrap();
        assert_eq!(arr.to_vec::<i32>().unwrap(), vec![0, 7, 0]);
        assert!(arr.to_vec::<f32>().is_err());
        assert!(arr.write_rows(3, bytemuck::bytes_of(&1i32)).is_err());
    }

    #[test]
    fn test_clones_share_storage() {
        let a = HostArray::from_slice(&[1u32, 2, 3]);
        let b = a.clone();
        a.write_rows(0, bytemuck::bytes_of(&9u32)).unwrap();
        assert_eq!(b.to_vec::<u32>().unwrap()[0], 9);
    }

    #[test]
    fn test_scalar_value() {
        let v: ScalarValue = 2.5f64.into();
        assert_eq!(v.dtype(), DType::F64);
        assert_eq!(v.as_f64(), 2.5);
        assert_eq!(v.as_i64(), None);
        assert_eq!(ScalarValue::from(7u32).as_i64(), Some(7));
    }
}

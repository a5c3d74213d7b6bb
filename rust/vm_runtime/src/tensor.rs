//! Tensor data model for the Lattice VM.
//!
//! Tensors are shape/dtype/device descriptors over a reference-counted byte
//! buffer handed out by an allocator.  Copies between devices are always
//! explicit (see [`crate::memory`]); sharing a tensor is a cheap `Arc` clone.
//! The [`ExternalTensorView`] type covers raw DLPack-style views supplied by
//! an embedder, whose memory the runtime never aliases: views are deep-copied
//! into a managed tensor the first time they are marshalled.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Element type category in the DLPack convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataTypeCode {
    Int = 0,
    UInt = 1,
    Float = 2,
    BFloat = 4,
}

/// Element type descriptor as a `(code, bits, lanes)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataType {
    pub code: DataTypeCode,
    pub bits: u8,
    pub lanes: u16,
}

impl DataType {
    pub const F32: DataType = DataType::new(DataTypeCode::Float, 32, 1);
    pub const F64: DataType = DataType::new(DataTypeCode::Float, 64, 1);
    pub const I32: DataType = DataType::new(DataTypeCode::Int, 32, 1);
    pub const I64: DataType = DataType::new(DataTypeCode::Int, 64, 1);
    pub const U8: DataType = DataType::new(DataTypeCode::UInt, 8, 1);
    pub const BOOL: DataType = DataType::new(DataTypeCode::UInt, 1, 1);

    pub const fn new(code: DataTypeCode, bits: u8, lanes: u16) -> Self {
        Self { code, bits, lanes }
    }

    /// Storage footprint of a single (possibly vectorized) element.
    pub fn bytes_per_element(&self) -> usize {
        (self.bits as usize * self.lanes as usize).div_ceil(8)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.code {
            DataTypeCode::Int => "int",
            DataTypeCode::UInt => "uint",
            DataTypeCode::Float => "float",
            DataTypeCode::BFloat => "bfloat",
        };
        if self.lanes == 1 {
            write!(f, "{prefix}{}", self.bits)
        } else {
            write!(f, "{prefix}{}x{}", self.bits, self.lanes)
        }
    }
}

/// Physical device category, extending the DLPack device enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Cpu = 1,
    Cuda = 2,
    CudaHost = 3,
    OpenCl = 4,
    Vulkan = 7,
    Metal = 8,
    Rocm = 10,
    RocmHost = 11,
    ExtDev = 12,
    CudaManaged = 13,
    OneApi = 14,
    WebGpu = 15,
    Hexagon = 16,
}

impl DeviceKind {
    /// Decode the integer representation used on the packed-argument surface.
    pub fn from_code(code: i64) -> Option<Self> {
        let kind = match code {
            1 => Self::Cpu,
            2 => Self::Cuda,
            3 => Self::CudaHost,
            4 => Self::OpenCl,
            7 => Self::Vulkan,
            8 => Self::Metal,
            10 => Self::Rocm,
            11 => Self::RocmHost,
            12 => Self::ExtDev,
            13 => Self::CudaManaged,
            14 => Self::OneApi,
            15 => Self::WebGpu,
            16 => Self::Hexagon,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::CudaHost => "cuda_host",
            Self::OpenCl => "opencl",
            Self::Vulkan => "vulkan",
            Self::Metal => "metal",
            Self::Rocm => "rocm",
            Self::RocmHost => "rocm_host",
            Self::ExtDev => "ext_dev",
            Self::CudaManaged => "cuda_managed",
            Self::OneApi => "oneapi",
            Self::WebGpu => "webgpu",
            Self::Hexagon => "hexagon",
        };
        f.write_str(name)
    }
}

/// A device: kind plus ordinal within that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub id: i32,
}

impl Device {
    pub const fn new(kind: DeviceKind, id: i32) -> Self {
        Self { kind, id }
    }

    pub const fn cpu(id: i32) -> Self {
        Self::new(DeviceKind::Cpu, id)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Errors raised by tensor construction and data movement.
#[derive(Debug, Error)]
pub enum TensorError {
    #[error("data length {actual} does not match shape {shape:?} of {dtype} ({expected} bytes)")]
    LengthMismatch {
        shape: Vec<i64>,
        dtype: DataType,
        expected: usize,
        actual: usize,
    },
    #[error("shape mismatch: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<i64>, Vec<i64>),
    #[error("dtype mismatch: {0} vs {1}")]
    DtypeMismatch(DataType, DataType),
    #[error("negative dimension in shape {0:?}")]
    NegativeDimension(Vec<i64>),
    #[error("cannot write through a shared tensor buffer")]
    BufferShared,
    #[error("tensor data is not {0}")]
    UnsupportedDtype(DataType),
}

/// Backing storage for a tensor: a device tag plus raw bytes.
#[derive(Debug)]
pub struct TensorBuffer {
    device: Device,
    bytes: Vec<u8>,
}

/// A managed multi-dimensional array.
///
/// Cloning shares the underlying buffer; equality compares shape, dtype and
/// contents (not residency, so a migrated copy still compares equal to its
/// source).
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Arc<[i64]>,
    dtype: DataType,
    buffer: Arc<TensorBuffer>,
}

impl Tensor {
    /// Number of bytes a tensor of `shape`/`dtype` occupies, or `None` when a
    /// dimension is negative.
    pub fn storage_size(shape: &[i64], dtype: DataType) -> Option<usize> {
        let mut elements = 1usize;
        for &dim in shape {
            if dim < 0 {
                return None;
            }
            elements = elements.checked_mul(dim as usize)?;
        }
        elements.checked_mul(dtype.bytes_per_element())
    }

    /// Construct a tensor over existing bytes (host-side construction; device
    /// placement is a tag, actual residency is the allocator's business).
    pub fn from_bytes(
        shape: Vec<i64>,
        dtype: DataType,
        device: Device,
        bytes: Vec<u8>,
    ) -> Result<Self, TensorError> {
        let expected = Self::storage_size(&shape, dtype)
            .ok_or_else(|| TensorError::NegativeDimension(shape.clone()))?;
        if bytes.len() != expected {
            return Err(TensorError::LengthMismatch {
                shape,
                dtype,
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            shape: shape.into(),
            dtype,
            buffer: Arc::new(TensorBuffer { device, bytes }),
        })
    }

    /// Convenience constructor for `float32` payloads.
    pub fn from_f32(shape: Vec<i64>, values: &[f32], device: Device) -> Result<Self, TensorError> {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_ne_bytes());
        }
        Self::from_bytes(shape, DataType::F32, device, bytes)
    }

    /// An uninitialized (zero-filled) tensor; the allocator entry point.
    pub fn empty(shape: &[i64], dtype: DataType, device: Device) -> Result<Self, TensorError> {
        let size = Self::storage_size(shape, dtype)
            .ok_or_else(|| TensorError::NegativeDimension(shape.to_vec()))?;
        Ok(Self {
            shape: shape.into(),
            dtype,
            buffer: Arc::new(TensorBuffer {
                device,
                bytes: vec![0; size],
            }),
        })
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.buffer.device
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().map(|&d| d as usize).product()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer.bytes
    }

    /// Overwrite this tensor's contents from raw bytes.  Only valid while the
    /// buffer is still uniquely held, i.e. right after allocation.
    pub fn copy_from_bytes(&mut self, src: &[u8]) -> Result<(), TensorError> {
        let buffer = Arc::get_mut(&mut self.buffer).ok_or(TensorError::BufferShared)?;
        if buffer.bytes.len() != src.len() {
            return Err(TensorError::LengthMismatch {
                shape: self.shape.to_vec(),
                dtype: self.dtype,
                expected: buffer.bytes.len(),
                actual: src.len(),
            });
        }
        buffer.bytes.copy_from_slice(src);
        Ok(())
    }

    /// Overwrite this tensor's contents from another tensor of identical
    /// shape and dtype.
    pub fn copy_from(&mut self, src: &Tensor) -> Result<(), TensorError> {
        if self.shape != src.shape {
            return Err(TensorError::ShapeMismatch(
                self.shape.to_vec(),
                src.shape.to_vec(),
            ));
        }
        if self.dtype != src.dtype {
            return Err(TensorError::DtypeMismatch(self.dtype, src.dtype));
        }
        self.copy_from_bytes(src.bytes())
    }

    /// Decode the payload as `float32` values.
    pub fn f32_values(&self) -> Result<Vec<f32>, TensorError> {
        if self.dtype != DataType::F32 {
            return Err(TensorError::UnsupportedDtype(self.dtype));
        }
        Ok(self
            .bytes()
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.dtype == other.dtype && self.bytes() == other.bytes()
    }
}

/// A borrowed DLPack-style tensor view handed in by an embedder.
///
/// The runtime does not know how long the pointed-to memory lives, so views
/// are never aliased into managed storage: the memory orchestrator copies
/// them into a freshly allocated tensor on first use.
#[derive(Debug, Clone)]
pub struct ExternalTensorView {
    shape: Arc<[i64]>,
    dtype: DataType,
    device: Device,
    data: *const u8,
    len: usize,
}

// The constructor contract below guarantees the pointed-to memory stays valid
// and immutable until the view is marshalled.
unsafe impl Send for ExternalTensorView {}
unsafe impl Sync for ExternalTensorView {}

impl ExternalTensorView {
    /// # Safety
    ///
    /// `data` must point to `len` readable bytes that remain valid and
    /// unmodified for the lifetime of the view.
    pub unsafe fn new(
        shape: Vec<i64>,
        dtype: DataType,
        device: Device,
        data: *const u8,
        len: usize,
    ) -> Self {
        Self {
            shape: shape.into(),
            dtype,
            device,
            data,
            len,
        }
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn bytes(&self) -> &[u8] {
        // Safety: upheld by the `new` contract.
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }
}

//! Memory orchestration for the Lattice VM.
//!
//! A process-wide [`MemoryManager`] hands out allocators keyed by
//! `(device, allocator kind)`; virtual machines hold references to them but
//! never own them.  The conversion helpers at the bottom enforce the device
//! placement contract of the interpreter: every tensor an instruction
//! consumes must live on the expected device, and externally supplied raw
//! views are always deep-copied because their lifetime is unknown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::{DataType, Device, Tensor, TensorError};
use crate::value::Value;

/// Allocation strategy selector, one per device entry at VM initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    Naive = 1,
    Pooled = 2,
}

impl AllocatorKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Naive),
            2 => Some(Self::Pooled),
            _ => None,
        }
    }
}

/// Errors raised by allocation and device marshalling.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
}

/// A tensor allocator bound to one device.
pub trait Allocator: Send + Sync {
    fn kind(&self) -> AllocatorKind;

    /// Allocate an uninitialized tensor of the given shape and dtype on
    /// `device`.
    fn empty(&self, shape: &[i64], dtype: DataType, device: Device)
        -> Result<Tensor, MemoryError>;
}

/// Allocates exactly the requested storage, every time.
struct NaiveAllocator;

impl Allocator for NaiveAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Naive
    }

    fn empty(
        &self,
        shape: &[i64],
        dtype: DataType,
        device: Device,
    ) -> Result<Tensor, MemoryError> {
        Ok(Tensor::empty(shape, dtype, device)?)
    }
}

/// Rounds request sizes up to page multiples so repeated same-shape
/// allocations land in equal size classes.
struct PooledAllocator {
    page_bytes: usize,
}

impl PooledAllocator {
    const DEFAULT_PAGE_BYTES: usize = 4096;

    fn new() -> Self {
        Self {
            page_bytes: Self::DEFAULT_PAGE_BYTES,
        }
    }

    fn rounded_capacity(&self, nbytes: usize) -> usize {
        nbytes.div_ceil(self.page_bytes).max(1) * self.page_bytes
    }
}

impl Allocator for PooledAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Pooled
    }

    fn empty(
        &self,
        shape: &[i64],
        dtype: DataType,
        device: Device,
    ) -> Result<Tensor, MemoryError> {
        let size = Tensor::storage_size(shape, dtype)
            .ok_or_else(|| TensorError::NegativeDimension(shape.to_vec()))?;
        // Capacity comes from the size class; the tensor keeps its exact
        // logical extent.
        let mut bytes = Vec::with_capacity(self.rounded_capacity(size));
        bytes.resize(size, 0);
        Ok(Tensor::from_bytes(shape.to_vec(), dtype, device, bytes)?)
    }
}

/// The process-wide allocator table.
pub struct MemoryManager {
    allocators: Mutex<HashMap<(Device, AllocatorKind), Arc<dyn Allocator>>>,
}

impl MemoryManager {
    /// The singleton manager; allocators live as long as the process.
    pub fn global() -> &'static MemoryManager {
        static GLOBAL: OnceLock<MemoryManager> = OnceLock::new();
        GLOBAL.get_or_init(|| MemoryManager {
            allocators: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch the allocator for `(device, kind)`, creating it on first use.
    pub fn get_or_create_allocator(
        &self,
        device: Device,
        kind: AllocatorKind,
    ) -> Arc<dyn Allocator> {
        let mut table = match self.allocators.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        table
            .entry((device, kind))
            .or_insert_with(|| match kind {
                AllocatorKind::Naive => Arc::new(NaiveAllocator),
                AllocatorKind::Pooled => Arc::new(PooledAllocator::new()),
            })
            .clone()
    }
}

fn copy_tensor_to_device(
    src: &Tensor,
    device: Device,
    alloc: &dyn Allocator,
) -> Result<Tensor, MemoryError> {
    if src.device() == device {
        return Ok(src.clone());
    }
    let mut dst = alloc.empty(src.shape(), src.dtype(), device)?;
    dst.copy_from(src)?;
    Ok(dst)
}

/// Marshal an externally supplied argument onto `device`.
///
/// Raw tensor views are copied into freshly allocated managed tensors even
/// when their device already matches; managed tensors are copied only across
/// devices; lists recurse element-wise; everything else passes through
/// unchanged.  The original value is never modified.
pub fn convert_arg_to_device(
    value: &Value,
    device: Device,
    alloc: &dyn Allocator,
) -> Result<Value, MemoryError> {
    match value {
        Value::TensorView(view) => {
            let mut dst = alloc.empty(view.shape(), view.dtype(), device)?;
            dst.copy_from_bytes(view.bytes())?;
            Ok(Value::Tensor(dst))
        }
        Value::Tensor(tensor) => Ok(Value::Tensor(copy_tensor_to_device(tensor, device, alloc)?)),
        Value::List(items) => {
            let converted = items
                .iter()
                .map(|item| convert_arg_to_device(item, device, alloc))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::list(converted))
        }
        other => Ok(other.clone()),
    }
}

/// Marshal an interpreter-managed value onto `device`.  Same semantics as
/// [`convert_arg_to_device`] minus the forced copy of raw views.
pub fn convert_reg_to_device(
    value: &Value,
    device: Device,
    alloc: &dyn Allocator,
) -> Result<Value, MemoryError> {
    match value {
        Value::Tensor(tensor) => Ok(Value::Tensor(copy_tensor_to_device(tensor, device, alloc)?)),
        Value::List(items) => {
            let converted = items
                .iter()
                .map(|item| convert_reg_to_device(item, device, alloc))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::list(converted))
        }
        other => Ok(other.clone()),
    }
}

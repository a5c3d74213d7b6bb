//! Kernel libraries: the native compute functions the interpreter calls into.
//!
//! A [`KernelLibrary`] is a name-indexed table of callables an executable
//! imports.  Two entry conventions exist: ordinary packed functions, and
//! lowered tensor-IR entries registered under the `__vmtir__<name>` symbol
//! convention, which receive the caller-allocated register file directly.
//! The standard library below keeps its surface small and deterministic;
//! each kernel takes already-evaluated arguments and returns a value or an
//! error that bubbles up through the interpreter.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::tensor::{DataType, Tensor};
use crate::value::{PackedFn, TirFn, Value};

/// Runtime error surfaced when a kernel rejects its arguments.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("expected {expected} arguments but received {actual}")]
    Arity { expected: usize, actual: usize },
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("shape mismatch: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<i64>, Vec<i64>),
    #[error("unsupported dtype {0} (kernels operate on float32 tensors)")]
    UnsupportedDtype(DataType),
    #[error("kernel computation failed: {0}")]
    InvalidState(&'static str),
}

/// One entry of a kernel library.
#[derive(Clone)]
pub enum KernelFn {
    Packed(PackedFn),
    Tir(TirFn),
}

/// A name-indexed library of native entries, as imported by an executable.
#[derive(Clone, Default)]
pub struct KernelLibrary {
    name: String,
    entries: HashMap<String, KernelFn>,
}

impl KernelLibrary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_packed(&mut self, symbol: impl Into<String>, func: PackedFn) {
        self.entries.insert(symbol.into(), KernelFn::Packed(func));
    }

    pub fn register_tir(&mut self, symbol: impl Into<String>, func: TirFn) {
        self.entries.insert(symbol.into(), KernelFn::Tir(func));
    }

    pub fn get(&self, symbol: &str) -> Option<&KernelFn> {
        self.entries.get(symbol)
    }

    pub fn get_packed(&self, symbol: &str) -> Option<PackedFn> {
        match self.get(symbol) {
            Some(KernelFn::Packed(func)) => Some(func.clone()),
            _ => None,
        }
    }

    pub fn get_tir(&self, symbol: &str) -> Option<TirFn> {
        match self.get(symbol) {
            Some(KernelFn::Tir(func)) => Some(func.clone()),
            _ => None,
        }
    }

    /// The default arithmetic library used by tests and examples.
    pub fn standard() -> Self {
        let mut lib = Self::new("standard");
        lib.register_packed("identity", Arc::new(|_, args| kernel_identity(args)));
        lib.register_packed("add", Arc::new(|_, args| kernel_add(args)));
        lib.register_packed("sub", Arc::new(|_, args| kernel_sub(args)));
        lib.register_packed("mul", Arc::new(|_, args| kernel_mul(args)));
        lib.register_packed("pack", Arc::new(|_, args| kernel_pack(args)));
        lib
    }
}

impl fmt::Debug for KernelLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut symbols: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        symbols.sort_unstable();
        f.debug_struct("KernelLibrary")
            .field("name", &self.name)
            .field("symbols", &symbols)
            .finish()
    }
}

fn ensure_arity(args: &[Value], expected: usize) -> Result<(), KernelError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(KernelError::Arity {
            expected,
            actual: args.len(),
        })
    }
}

fn kernel_identity(args: &[Value]) -> Result<Value, crate::vm::VmError> {
    ensure_arity(args, 1)?;
    Ok(args[0].clone())
}

fn kernel_add(args: &[Value]) -> Result<Value, crate::vm::VmError> {
    numeric_binary(args, |a, b| a + b, |a, b| a + b, |a, b| a + b)
}

fn kernel_sub(args: &[Value]) -> Result<Value, crate::vm::VmError> {
    numeric_binary(args, |a, b| a - b, |a, b| a - b, |a, b| a - b)
}

fn kernel_mul(args: &[Value]) -> Result<Value, crate::vm::VmError> {
    numeric_binary(args, |a, b| a * b, |a, b| a * b, |a, b| a * b)
}

/// Bundle the arguments into an ordered list, the callee-side counterpart of
/// a multi-output function.
fn kernel_pack(args: &[Value]) -> Result<Value, crate::vm::VmError> {
    Ok(Value::list(args.to_vec()))
}

fn numeric_binary(
    args: &[Value],
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
    elem_op: impl Fn(f32, f32) -> f32,
) -> Result<Value, crate::vm::VmError> {
    ensure_arity(args, 2)?;
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(*a, *b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_op(*a as f64, *b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_op(*a, *b as f64))),
        (Value::Tensor(a), Value::Tensor(b)) => {
            Ok(Value::Tensor(tensor_elementwise(a, b, elem_op)?))
        }
        (lhs, rhs) => Err(KernelError::TypeMismatch {
            expected: "two numbers or two tensors",
            found: if matches!(lhs, Value::Int(_) | Value::Float(_) | Value::Tensor(_)) {
                rhs.kind()
            } else {
                lhs.kind()
            },
        }
        .into()),
    }
}

fn tensor_elementwise(
    lhs: &Tensor,
    rhs: &Tensor,
    op: impl Fn(f32, f32) -> f32,
) -> Result<Tensor, KernelError> {
    if lhs.shape() != rhs.shape() {
        return Err(KernelError::ShapeMismatch(
            lhs.shape().to_vec(),
            rhs.shape().to_vec(),
        ));
    }
    if lhs.dtype() != DataType::F32 {
        return Err(KernelError::UnsupportedDtype(lhs.dtype()));
    }
    if rhs.dtype() != DataType::F32 {
        return Err(KernelError::UnsupportedDtype(rhs.dtype()));
    }
    let a = lhs
        .f32_values()
        .map_err(|_| KernelError::UnsupportedDtype(lhs.dtype()))?;
    let b = rhs
        .f32_values()
        .map_err(|_| KernelError::UnsupportedDtype(rhs.dtype()))?;
    let out: Vec<f32> = a.iter().zip(b.iter()).map(|(x, y)| op(*x, *y)).collect();
    Tensor::from_f32(lhs.shape().to_vec(), &out, lhs.device())
        .map_err(|_| KernelError::InvalidState("result tensor construction failed"))
}

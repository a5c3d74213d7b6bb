//! Tagged value model for registers and packed arguments.
//!
//! Every register, constant and call argument in the VM is a [`Value`]: a
//! tagged union with one case per type code of the packed calling convention.
//! Values are cheap to copy; heap payloads (strings, byte blobs, lists,
//! tensor buffers) are shared under reference counting.  `Value::Null` is the
//! default register content.

use std::fmt;
use std::sync::Arc;

use crate::tensor::{DataType, Device, ExternalTensorView, Tensor};
use crate::vm::{VirtualMachine, VmError};

/// Uniform signature of every native callable: the context (the VM the call
/// runs under) plus the packed argument list.
pub type PackedFn = Arc<dyn Fn(&mut VirtualMachine, &[Value]) -> Result<Value, VmError> + Send + Sync>;

/// Entry signature of a lowered tensor-IR function: the context plus the
/// caller-allocated register file.  The constant and function pools are
/// reached through the context.
pub type TirFn = Arc<dyn Fn(&mut VirtualMachine, &mut [Value]) -> Result<(), VmError> + Send + Sync>;

/// Integer type codes of the packed-argument convention.  The payload travels
/// in a parallel [`Value`]; consumers that inspect codes must handle every
/// case or reject explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ArgTypeCode {
    Int = 0,
    Float = 1,
    Bool = 2,
    Null = 3,
    OpaqueHandle = 4,
    DataType = 5,
    Device = 6,
    TensorView = 7,
    ObjectHandle = 8,
    ModuleHandle = 9,
    Callable = 10,
    Str = 11,
    Bytes = 12,
    Tensor = 13,
    RValueRef = 14,
}

/// An address-sized token for embedder data the VM never interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpaqueHandle(pub usize);

/// The narrow interface of a parameter-pack module: `get_params` produces the
/// tail of an argument vector for `set_input_with_param_module`.
pub trait ParamModule: Send + Sync {
    fn get_params(&self) -> Result<Value, VmError>;
}

/// A named callable whose context is supplied at call time.
///
/// Closures never capture the VM they run under; a bytecode closure captures
/// only its function index and recovers everything else from the context
/// argument.
pub struct VmClosure {
    pub func_name: String,
    pub body: PackedFn,
}

impl VmClosure {
    pub fn new(func_name: impl Into<String>, body: PackedFn) -> Self {
        Self {
            func_name: func_name.into(),
            body,
        }
    }

    /// Wrap `func` so that every invocation appends `last_args` after the
    /// caller-supplied arguments.  Ordering matters: captured arguments go
    /// last.
    pub fn bind_last_args(func: PackedFn, last_args: Vec<Value>) -> PackedFn {
        Arc::new(move |vm, args| {
            let mut full = Vec::with_capacity(args.len() + last_args.len());
            full.extend_from_slice(args);
            full.extend(last_args.iter().cloned());
            func.as_ref()(vm, &full)
        })
    }
}

impl fmt::Debug for VmClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmClosure")
            .field("func_name", &self.func_name)
            .finish_non_exhaustive()
    }
}

/// Either a bare packed function or a named VM closure.
#[derive(Clone)]
pub enum Callable {
    Packed(PackedFn),
    Closure(Arc<VmClosure>),
}

impl Callable {
    pub fn name(&self) -> Option<&str> {
        match self {
            Callable::Packed(_) => None,
            Callable::Closure(clo) => Some(&clo.func_name),
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Packed(_) => f.write_str("Callable::Packed"),
            Callable::Closure(clo) => write!(f, "Callable::Closure({:?})", clo.func_name),
        }
    }
}

/// The register/argument value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    DataType(DataType),
    Device(Device),
    Tensor(Tensor),
    TensorView(ExternalTensorView),
    List(Arc<[Value]>),
    Opaque(OpaqueHandle),
    Func(Callable),
    Module(Arc<dyn ParamModule>),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn bytes(b: impl Into<Arc<[u8]>>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn list(items: impl Into<Arc<[Value]>>) -> Value {
        Value::List(items.into())
    }

    /// Short variant name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::DataType(_) => "dtype",
            Value::Device(_) => "device",
            Value::Tensor(_) => "tensor",
            Value::TensorView(_) => "tensor_view",
            Value::List(_) => "list",
            Value::Opaque(_) => "opaque",
            Value::Func(_) => "callable",
            Value::Module(_) => "module",
        }
    }

    pub fn type_code(&self) -> ArgTypeCode {
        match self {
            Value::Null => ArgTypeCode::Null,
            Value::Int(_) => ArgTypeCode::Int,
            Value::Float(_) => ArgTypeCode::Float,
            Value::Bool(_) => ArgTypeCode::Bool,
            Value::Str(_) => ArgTypeCode::Str,
            Value::Bytes(_) => ArgTypeCode::Bytes,
            Value::DataType(_) => ArgTypeCode::DataType,
            Value::Device(_) => ArgTypeCode::Device,
            Value::Tensor(_) => ArgTypeCode::Tensor,
            Value::TensorView(_) => ArgTypeCode::TensorView,
            Value::List(_) => ArgTypeCode::ObjectHandle,
            Value::Opaque(_) => ArgTypeCode::OpaqueHandle,
            Value::Func(_) => ArgTypeCode::Callable,
            Value::Module(_) => ArgTypeCode::ModuleHandle,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Value::Func(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_device(&self) -> Option<Device> {
        match self {
            Value::Device(v) => Some(*v),
            _ => None,
        }
    }

    /// Read the value as a 64-bit branch condition.
    pub fn as_condition(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Str(v) => write!(f, "Str({v:?})"),
            Value::Bytes(v) => write!(f, "Bytes({} bytes)", v.len()),
            Value::DataType(v) => write!(f, "DataType({v})"),
            Value::Device(v) => write!(f, "Device({v})"),
            Value::Tensor(v) => write!(f, "Tensor({:?} {} on {})", v.shape(), v.dtype(), v.device()),
            Value::TensorView(v) => write!(f, "TensorView({:?} {})", v.shape(), v.dtype()),
            Value::List(v) => f.debug_list().entries(v.iter()).finish(),
            Value::Opaque(v) => write!(f, "Opaque({:#x})", v.0),
            Value::Func(v) => write!(f, "{v:?}"),
            Value::Module(_) => f.write_str("Module"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::str(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::str(v)
    }
}

impl From<Tensor> for Value {
    fn from(v: Tensor) -> Self {
        Value::Tensor(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::list(v)
    }
}

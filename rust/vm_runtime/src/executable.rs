//! Executable model for the Lattice VM.
//!
//! An executable is the immutable unit the VM loads: a function table, a
//! constant pool, and a flat instruction stream addressed by program counter.
//! The types below mirror what a compiler emits; the on-disk loader lives
//! outside this crate and hands over a fully built [`Executable`].

use serde::{Deserialize, Serialize};

use crate::kernels::KernelLibrary;
use crate::tensor::{DataType, Device};
use crate::value::Value;

/// Register identifier within a frame's register file.
pub type RegName = usize;

/// Register names at or above this bound are special identifiers, not slots
/// in the physical register file.
pub const SPECIAL_REG_BASE: RegName = 1 << 54;

/// Writes are discarded, reads produce null.
pub const VOID_REGISTER: RegName = SPECIAL_REG_BASE;

/// Reads yield a stable handle to the executing VM, used as the hidden
/// context argument of closures.
pub const VM_REGISTER: RegName = SPECIAL_REG_BASE + 1;

/// How a function-table entry is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuncKind {
    /// Interpreted bytecode starting at `start_instr`.
    Bytecode,
    /// Lowered tensor-IR function, paired with a compiled `__vmtir__<name>`
    /// entry resolved from the executable's imports.
    Tir,
    /// Externally registered packed function; no bytecode.
    Packed,
}

/// One entry of the function table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncInfo {
    pub name: String,
    pub kind: FuncKind,
    pub num_args: usize,
    pub register_file_size: usize,
    pub start_instr: usize,
    pub param_names: Vec<String>,
}

/// A call-instruction argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Arg {
    Register(RegName),
    Immediate(i64),
    ConstIdx(usize),
    FuncIdx(usize),
}

/// The four-opcode instruction set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    Call {
        dst: RegName,
        func_idx: usize,
        args: Vec<Arg>,
    },
    Ret {
        result: RegName,
    },
    Goto {
        pc_offset: i64,
    },
    If {
        cond: RegName,
        false_offset: i64,
    },
}

/// A tensor constant in its serialized form; materialized onto the canonical
/// device through an allocator at VM initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorLiteral {
    pub shape: Vec<i64>,
    pub dtype: DataType,
    pub data: Vec<u8>,
}

/// A constant-pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Constant {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    DataType(DataType),
    Device(Device),
    Shape(Vec<i64>),
    Tensor(TensorLiteral),
}

impl Constant {
    /// The register value of a non-tensor constant, stored verbatim.  Tensor
    /// constants have no direct value; they go through the allocator.
    pub fn scalar_value(&self) -> Option<Value> {
        match self {
            Constant::Int(v) => Some(Value::Int(*v)),
            Constant::Float(v) => Some(Value::Float(*v)),
            Constant::Bool(v) => Some(Value::Bool(*v)),
            Constant::Str(v) => Some(Value::str(v.as_str())),
            Constant::Bytes(v) => Some(Value::bytes(v.as_slice())),
            Constant::DataType(v) => Some(Value::DataType(*v)),
            Constant::Device(v) => Some(Value::Device(*v)),
            Constant::Shape(dims) => Some(Value::list(
                dims.iter().map(|&d| Value::Int(d)).collect::<Vec<_>>(),
            )),
            Constant::Tensor(_) => None,
        }
    }
}

/// The loaded program: function table, constant pool, instruction stream and
/// kernel imports.  Immutable once handed to a VM.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Executable {
    pub func_table: Vec<FuncInfo>,
    pub constants: Vec<Constant>,
    pub instructions: Vec<Instruction>,
    #[serde(skip)]
    pub imports: Vec<KernelLibrary>,
}

impl Executable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function-table entry, returning its function index.
    pub fn push_function(&mut self, info: FuncInfo) -> usize {
        self.func_table.push(info);
        self.func_table.len() - 1
    }

    /// Append an instruction, returning its program counter.
    pub fn push_instruction(&mut self, instruction: Instruction) -> usize {
        self.instructions.push(instruction);
        self.instructions.len() - 1
    }

    /// Add a constant-pool entry, returning its constant index.
    pub fn push_constant(&mut self, constant: Constant) -> usize {
        self.constants.push(constant);
        self.constants.len() - 1
    }

    /// Attach an imported kernel library.
    pub fn push_import(&mut self, library: KernelLibrary) {
        self.imports.push(library);
    }

    pub fn find_function(&self, name: &str) -> Option<usize> {
        self.func_table.iter().position(|f| f.name == name)
    }

    /// Bounds-checked instruction fetch.
    pub fn instruction(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }
}

//! The Lattice virtual machine: frame stack, closure pool and the
//! Call/Ret/Goto/If dispatch loop.
//!
//! A VM owns one executable plus the mutable state of execution: the constant
//! and function pools built at initialization, the frame stack with its
//! free-list of recycled frames, the stateful inference tables, and the
//! segment-runner state (see [`crate::segment`]).  A VM instance is
//! single-threaded with respect to its own dispatch loop; run independent VMs
//! on independent threads.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::executable::{
    Arg, Constant, Executable, FuncInfo, FuncKind, Instruction, RegName, SPECIAL_REG_BASE,
    VM_REGISTER, VOID_REGISTER,
};
use crate::kernels::KernelError;
use crate::memory::{
    convert_arg_to_device, Allocator, AllocatorKind, MemoryError, MemoryManager,
};
use crate::registry;
use crate::segment::{SegmentError, SegmentState};
use crate::tensor::{Device, TensorError};
use crate::value::{Callable, OpaqueHandle, PackedFn, Value, VmClosure};

fn join_params(param_names: &[String]) -> String {
    param_names.join(", ")
}

/// Action codes understood from an instrumentation callable.  Unknown codes
/// are treated as [`InstrumentAction::NoOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentAction {
    NoOp = 0,
    SkipRun = 1,
}

impl InstrumentAction {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::SkipRun,
            _ => Self::NoOp,
        }
    }
}

/// Errors surfaced by the virtual machine.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("cannot find packed function '{0}' in the executable imports or the process registry")]
    UnknownSymbol(String),
    #[error("cannot find compiled entry '{symbol}' for lowered function '{name}'")]
    MissingTirEntry { name: String, symbol: String },
    #[error(
        "function '{function}' expects {expected} arguments ({}), but {actual} were provided",
        join_params(.param_names)
    )]
    ArityMismatch {
        function: String,
        expected: usize,
        actual: usize,
        param_names: Vec<String>,
    },
    #[error("no inputs set for stateful call of '{0}'; use `set_input` first")]
    MissingInput(String),
    #[error("no output saved for call of '{0}'; use `invoke_stateful` first")]
    MissingOutput(String),
    #[error("program counter {0} is outside the instruction stream")]
    InvalidPc(usize),
    #[error("jump target {0} is outside the instruction stream")]
    InvalidJump(i64),
    #[error("`If` requires a false branch offset greater than 1, got {0}")]
    InvalidFalseOffset(i64),
    #[error("register {register} out of range for a register file of {size}")]
    RegisterOutOfBounds { register: usize, size: usize },
    #[error("function index {0} outside the function pool")]
    FunctionIndexOutOfBounds(usize),
    #[error("constant index {0} outside the constant pool")]
    ConstantOutOfBounds(usize),
    #[error("no active frame")]
    NoActiveFrame,
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("attempted to index into a {0} value; only lists can be indexed")]
    IndexIntoNonList(&'static str),
    #[error("index {index} out of range for a list of {len}")]
    ListIndexOutOfRange { index: usize, len: usize },
    #[error("`get_output` cannot return a list; specify another index")]
    OutputIsList,
    #[error("parameter index {index} out of range for '{function}' ({len} parameters)")]
    ParamIndexOutOfRange {
        function: String,
        index: usize,
        len: usize,
    },
    #[error("the executable is not loaded yet")]
    ExecutableNotLoaded,
    #[error("the virtual machine is not initialized; call `vm_initialization` first")]
    Uninitialized,
    #[error("devices and allocator kinds must pair up ({devices} devices, {allocators} allocator kinds)")]
    DeviceAllocatorMismatch { devices: usize, allocators: usize },
    #[error("unknown module operation '{0}'")]
    UnknownOperation(String),
    #[error("invalid argument for {op}: {message}")]
    InvalidArgument { op: &'static str, message: String },
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
    #[error("segment runner error: {0}")]
    Segment(#[from] SegmentError),
}

/// A record of one active function invocation.
///
/// Frames are recycled through a free-list: `clear` nulls every register so
/// heap payloads are released without giving up capacity, and
/// `reset_for_recycle` re-arms a retired frame for its next call.
#[derive(Debug, Default)]
pub struct Frame {
    pub(crate) return_pc: usize,
    pub(crate) register_file: Vec<Value>,
    pub(crate) caller_return_register: RegName,
    pub(crate) scratch_args: Vec<Value>,
}

impl Frame {
    pub(crate) fn new(return_pc: usize, register_file_size: usize) -> Self {
        Self {
            return_pc,
            register_file: vec![Value::Null; register_file_size],
            caller_return_register: 0,
            scratch_args: Vec::new(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.caller_return_register = 0;
        self.scratch_args.clear();
        for reg in &mut self.register_file {
            *reg = Value::Null;
        }
    }

    pub(crate) fn reset_for_recycle(&mut self, return_pc: usize, register_file_size: usize) {
        self.return_pc = return_pc;
        self.register_file.resize(register_file_size, Value::Null);
    }

    pub(crate) fn read(&self, reg: RegName) -> Result<Value, VmError> {
        self.register_file
            .get(reg)
            .cloned()
            .ok_or(VmError::RegisterOutOfBounds {
                register: reg,
                size: self.register_file.len(),
            })
    }

    /// Write a register; writes to special register names are discarded.
    pub(crate) fn write(&mut self, reg: RegName, value: Value) -> Result<(), VmError> {
        if reg >= SPECIAL_REG_BASE {
            return Ok(());
        }
        let size = self.register_file.len();
        match self.register_file.get_mut(reg) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::RegisterOutOfBounds {
                register: reg,
                size,
            }),
        }
    }
}

/// The virtual machine.
#[derive(Default)]
pub struct VirtualMachine {
    exec: Option<Arc<Executable>>,
    /// Runtime physical device list, declaration order; `devices[0]` is the
    /// canonical device constants and inputs migrate to.
    pub devices: Vec<Device>,
    /// Allocator handles paired with `devices`.
    pub allocators: Vec<Arc<dyn Allocator>>,
    const_pool: Vec<Value>,
    func_pool: Vec<Callable>,
    inputs: HashMap<String, Vec<Value>>,
    outputs: HashMap<String, Value>,
    saved_closures: HashMap<String, Arc<VmClosure>>,
    pub(crate) frames: Vec<Box<Frame>>,
    frame_free_list: Vec<Box<Frame>>,
    pub(crate) pc: usize,
    return_value: Value,
    instrument: Option<Callable>,
    pub(crate) segments: SegmentState,
}

impl VirtualMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the executable this VM will run.  References into it stay valid
    /// for the VM's lifetime.
    pub fn load_executable(&mut self, exec: Arc<Executable>) {
        self.exec = Some(exec);
    }

    pub(crate) fn exec(&self) -> Result<&Arc<Executable>, VmError> {
        self.exec.as_ref().ok_or(VmError::ExecutableNotLoaded)
    }

    /// Initialize the VM for a set of devices: acquire allocators, build the
    /// constant pool (tensor constants materialize on `devices[0]`), and
    /// resolve the function pool.
    pub fn init(
        &mut self,
        devices: &[Device],
        alloc_kinds: &[AllocatorKind],
    ) -> Result<(), VmError> {
        if devices.len() != alloc_kinds.len() {
            return Err(VmError::DeviceAllocatorMismatch {
                devices: devices.len(),
                allocators: alloc_kinds.len(),
            });
        }
        if devices.is_empty() {
            return Err(VmError::InvalidArgument {
                op: "vm_initialization",
                message: "at least one device is required".to_string(),
            });
        }
        let exec = self.exec()?.clone();

        self.devices = devices.to_vec();
        self.allocators = devices
            .iter()
            .zip(alloc_kinds)
            .map(|(&dev, &kind)| MemoryManager::global().get_or_create_allocator(dev, kind))
            .collect();

        let canonical = self.devices[0];
        let alloc = self.allocators[0].clone();
        let mut const_pool = Vec::with_capacity(exec.constants.len());
        for constant in &exec.constants {
            let value = match constant {
                Constant::Tensor(literal) => {
                    let mut tensor = alloc.empty(&literal.shape, literal.dtype, canonical)?;
                    tensor.copy_from_bytes(&literal.data)?;
                    Value::Tensor(tensor)
                }
                other => other.scalar_value().ok_or_else(|| VmError::InvalidArgument {
                    op: "vm_initialization",
                    message: "constant has no register value".to_string(),
                })?,
            };
            const_pool.push(value);
        }
        self.const_pool = const_pool;

        self.init_func_pool()
    }

    fn init_func_pool(&mut self) -> Result<(), VmError> {
        let exec = self.exec()?.clone();
        let mut pool = Vec::with_capacity(exec.func_table.len());
        for (func_idx, info) in exec.func_table.iter().enumerate() {
            let callable = match info.kind {
                FuncKind::Packed => {
                    let func = exec
                        .imports
                        .iter()
                        .find_map(|lib| lib.get_packed(&info.name))
                        .or_else(|| registry::get(&info.name))
                        .ok_or_else(|| VmError::UnknownSymbol(info.name.clone()))?;
                    Callable::Packed(func)
                }
                _ => self.make_closure(func_idx, info, &exec)?,
            };
            pool.push(callable);
        }
        self.func_pool = pool;
        Ok(())
    }

    /// Build the closure for a bytecode or lowered function-table entry.
    /// Closure bodies capture the function index, never the VM itself; the
    /// executing VM arrives as the context argument at call time.
    fn make_closure(
        &self,
        func_idx: usize,
        info: &FuncInfo,
        exec: &Arc<Executable>,
    ) -> Result<Callable, VmError> {
        match info.kind {
            FuncKind::Bytecode => {
                let body: PackedFn = Arc::new(move |vm, args| vm.invoke_bytecode(func_idx, args));
                Ok(Callable::Closure(Arc::new(VmClosure::new(
                    info.name.clone(),
                    body,
                ))))
            }
            FuncKind::Tir => {
                let symbol = format!("__vmtir__{}", info.name);
                let tir = exec
                    .imports
                    .iter()
                    .find_map(|lib| lib.get_tir(&symbol))
                    .ok_or_else(|| VmError::MissingTirEntry {
                        name: info.name.clone(),
                        symbol: symbol.clone(),
                    })?;
                if info.register_file_size < info.num_args + 1 {
                    return Err(VmError::InvalidArgument {
                        op: "closure resolution",
                        message: format!(
                            "lowered function '{}' needs a register file of at least {} slots",
                            info.name,
                            info.num_args + 1
                        ),
                    });
                }
                let name = info.name.clone();
                let param_names = info.param_names.clone();
                let num_args = info.num_args;
                let file_size = info.register_file_size;
                let body: PackedFn = Arc::new(move |vm, args| {
                    if args.len() != num_args {
                        return Err(VmError::ArityMismatch {
                            function: name.clone(),
                            expected: num_args,
                            actual: args.len(),
                            param_names: param_names.clone(),
                        });
                    }
                    let mut reg_file = vec![Value::Null; file_size];
                    reg_file[..num_args].clone_from_slice(args);
                    tir.as_ref()(vm, &mut reg_file)?;
                    // Return value is stored right after the inputs.
                    Ok(reg_file[num_args].clone())
                });
                Ok(Callable::Closure(Arc::new(VmClosure::new(
                    info.name.clone(),
                    body,
                ))))
            }
            FuncKind::Packed => Err(VmError::InvalidArgument {
                op: "closure resolution",
                message: format!("'{}' is a packed function, not a closure", info.name),
            }),
        }
    }

    fn get_closure_internal(
        &self,
        func_name: &str,
        allow_missing: bool,
    ) -> Result<Option<Callable>, VmError> {
        if let Some(clo) = self.saved_closures.get(func_name) {
            return Ok(Some(Callable::Closure(clo.clone())));
        }
        let exec = self.exec()?.clone();
        let Some(func_idx) = exec.find_function(func_name) else {
            if allow_missing {
                return Ok(None);
            }
            return Err(VmError::UnknownFunction(func_name.to_string()));
        };
        let info = &exec.func_table[func_idx];
        self.make_closure(func_idx, info, &exec).map(Some)
    }

    /// Resolve a named function to a closure; saved closures shadow the
    /// executable function table.
    pub fn get_closure(&self, func_name: &str) -> Result<Callable, VmError> {
        self.get_closure_internal(func_name, false)?
            .ok_or_else(|| VmError::UnknownFunction(func_name.to_string()))
    }

    /// Name lookup that tolerates absence, the default resolution path of the
    /// module facade.
    pub fn lookup_function(&self, func_name: &str) -> Option<Callable> {
        self.get_closure_internal(func_name, true).ok().flatten()
    }

    /// Invoke a closure or packed function with the uniform convention: the
    /// executing VM is the context, `args` are the user arguments.
    pub fn invoke_closure_packed(
        &mut self,
        func: &Callable,
        args: &[Value],
    ) -> Result<Value, VmError> {
        match func {
            Callable::Packed(f) => f.as_ref()(self, args),
            Callable::Closure(clo) => clo.body.as_ref()(self, args),
        }
    }

    /// Fully bind trailing arguments of a named function and save the result
    /// under `save_name`.  Bound arguments are migrated to the canonical
    /// device first; with `include_return` false the saved closure discards
    /// the callee's result.
    pub fn save_closure(
        &mut self,
        func_name: &str,
        save_name: &str,
        include_return: bool,
        args: &[Value],
    ) -> Result<(), VmError> {
        let source = self.get_closure(func_name)?;
        let inner = match &source {
            Callable::Closure(clo) => clo.body.clone(),
            Callable::Packed(f) => f.clone(),
        };
        let (device, alloc) = self.canonical_device()?;
        let bound = args
            .iter()
            .map(|a| convert_arg_to_device(a, device, alloc.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let mut body = VmClosure::bind_last_args(inner, bound);
        if !include_return {
            let forwarded = body;
            body = Arc::new(move |vm, args| {
                forwarded.as_ref()(vm, args)?;
                Ok(Value::Null)
            });
        }
        self.saved_closures.insert(
            save_name.to_string(),
            Arc::new(VmClosure::new(save_name, body)),
        );
        Ok(())
    }

    /// Install (or replace) the per-Call instrumentation hook.
    pub fn set_instrument(&mut self, instrument: Callable) {
        self.instrument = Some(instrument);
    }

    fn canonical_device(&self) -> Result<(Device, Arc<dyn Allocator>), VmError> {
        match (self.devices.first(), self.allocators.first()) {
            (Some(&device), Some(alloc)) => Ok((device, alloc.clone())),
            _ => Err(VmError::Uninitialized),
        }
    }

    fn func_info(&self, func_name: &str) -> Result<FuncInfo, VmError> {
        let exec = self.exec()?;
        let idx = exec
            .find_function(func_name)
            .ok_or_else(|| VmError::UnknownFunction(func_name.to_string()))?;
        Ok(exec.func_table[idx].clone())
    }

    //-------------------------------------------------------------
    // Bytecode interpretation.
    //-------------------------------------------------------------

    /// Invoke a bytecode function by index, running the dispatch loop until
    /// its frame returns.
    pub fn invoke_bytecode(&mut self, func_idx: usize, args: &[Value]) -> Result<Value, VmError> {
        let exec = self.exec()?.clone();
        let info = exec
            .func_table
            .get(func_idx)
            .ok_or(VmError::FunctionIndexOutOfBounds(func_idx))?
            .clone();
        if info.kind != FuncKind::Bytecode {
            return Err(VmError::InvalidArgument {
                op: "invoke_bytecode",
                message: format!("'{}' has no bytecode", info.name),
            });
        }
        if args.len() != info.num_args {
            return Err(VmError::ArityMismatch {
                function: info.name.clone(),
                expected: info.num_args,
                actual: args.len(),
                param_names: info.param_names.clone(),
            });
        }

        // When this invocation comes from a Call instruction, remember the
        // caller's destination register so Ret can forward the result.
        let caller_return_register = match exec.instruction(self.pc) {
            Some(Instruction::Call { dst, .. }) => *dst,
            _ => 0,
        };

        let return_pc = self.pc;
        self.with_frame(return_pc, info.register_file_size, |vm| {
            {
                let frame = vm.frames.last_mut().ok_or(VmError::NoActiveFrame)?;
                frame.caller_return_register = caller_return_register;
                for (i, arg) in args.iter().enumerate() {
                    frame.write(i, arg.clone())?;
                }
            }
            vm.pc = info.start_instr;
            vm.run_loop()?;
            Ok(vm.return_value.clone())
        })
    }

    /// Push a frame (recycling from the free-list when possible), run `body`,
    /// then pop: the caller's PC is restored and the cleared frame retired to
    /// the free-list on every exit path.
    pub(crate) fn with_frame<R>(
        &mut self,
        return_pc: usize,
        register_file_size: usize,
        body: impl FnOnce(&mut Self) -> Result<R, VmError>,
    ) -> Result<R, VmError> {
        let frame = match self.frame_free_list.pop() {
            Some(mut recycled) => {
                recycled.reset_for_recycle(return_pc, register_file_size);
                recycled
            }
            None => Box::new(Frame::new(return_pc, register_file_size)),
        };
        self.frames.push(frame);
        let result = body(self);
        if let Some(mut frame) = self.frames.pop() {
            self.pc = frame.return_pc;
            frame.clear();
            self.frame_free_list.push(frame);
        }
        result
    }

    /// Read a register of the current frame; special register names resolve
    /// to null (void) or the VM context handle.
    pub(crate) fn read_register(&self, reg: RegName) -> Result<Value, VmError> {
        if reg < SPECIAL_REG_BASE {
            let frame = self.frames.last().ok_or(VmError::NoActiveFrame)?;
            return frame.read(reg);
        }
        if reg == VOID_REGISTER {
            Ok(Value::Null)
        } else if reg == VM_REGISTER {
            Ok(Value::Opaque(OpaqueHandle(self as *const Self as usize)))
        } else {
            Err(VmError::RegisterOutOfBounds {
                register: reg,
                size: SPECIAL_REG_BASE,
            })
        }
    }

    fn write_register(&mut self, reg: RegName, value: Value) -> Result<(), VmError> {
        if reg >= SPECIAL_REG_BASE {
            return Ok(());
        }
        let frame = self.frames.last_mut().ok_or(VmError::NoActiveFrame)?;
        frame.write(reg, value)
    }

    pub(crate) fn take_goto(&mut self, pc_offset: i64) -> Result<(), VmError> {
        let target = self.pc as i64 + pc_offset;
        if target < 0 {
            return Err(VmError::InvalidJump(target));
        }
        self.pc = target as usize;
        Ok(())
    }

    pub(crate) fn take_if(&mut self, cond: RegName, false_offset: i64) -> Result<(), VmError> {
        let value = self.read_register(cond)?;
        let cond_val = value.as_condition().ok_or(VmError::TypeMismatch {
            expected: "integer condition",
            found: value.kind(),
        })?;
        if cond_val != 0 {
            self.pc += 1;
        } else {
            if false_offset <= 1 {
                return Err(VmError::InvalidFalseOffset(false_offset));
            }
            self.take_goto(false_offset)?;
        }
        Ok(())
    }

    fn run_loop(&mut self) -> Result<(), VmError> {
        let exec = self.exec()?.clone();
        loop {
            let instruction = exec
                .instruction(self.pc)
                .ok_or(VmError::InvalidPc(self.pc))?
                .clone();
            match instruction {
                Instruction::Call {
                    dst,
                    func_idx,
                    args,
                } => {
                    self.run_instr_call(dst, func_idx, &args)?;
                }
                Instruction::Ret { result } => {
                    self.return_value = self.read_register(result)?;
                    let caller_return_register = self
                        .frames
                        .last()
                        .ok_or(VmError::NoActiveFrame)?
                        .caller_return_register;
                    if self.frames.len() > 1 {
                        let value = self.return_value.clone();
                        let parent = self.frames.len() - 2;
                        self.frames[parent].write(caller_return_register, value)?;
                    }
                    return Ok(());
                }
                Instruction::Goto { pc_offset } => {
                    self.take_goto(pc_offset)?;
                }
                Instruction::If { cond, false_offset } => {
                    self.take_if(cond, false_offset)?;
                }
            }
        }
    }

    /// Execute one Call instruction against the current frame: materialize
    /// the arguments, invoke the pooled callable (through the instrumentation
    /// hook when one is installed), store the result and advance the PC.
    pub(crate) fn run_instr_call(
        &mut self,
        dst: RegName,
        func_idx: usize,
        args: &[Arg],
    ) -> Result<(), VmError> {
        let exec = self.exec()?.clone();
        let func_name = exec
            .func_table
            .get(func_idx)
            .map(|f| f.name.clone())
            .ok_or(VmError::FunctionIndexOutOfBounds(func_idx))?;
        debug!("pc = {}, execute: {}", self.pc, func_name);

        // Reuse the current frame's argument scratch space across calls.
        let mut call_args = match self.frames.last_mut() {
            Some(frame) => std::mem::take(&mut frame.scratch_args),
            None => Vec::new(),
        };
        call_args.clear();

        let mut materialized: Result<(), VmError> = Ok(());
        for arg in args {
            match self.materialize_arg(arg) {
                Ok(value) => call_args.push(value),
                Err(err) => {
                    materialized = Err(err);
                    break;
                }
            }
        }

        let result = materialized.and_then(|()| {
            let callable = self
                .func_pool
                .get(func_idx)
                .cloned()
                .ok_or(VmError::FunctionIndexOutOfBounds(func_idx))?;
            match self.instrument.clone() {
                None => self.invoke_closure_packed(&callable, &call_args),
                Some(hook) => {
                    self.run_instrumented_call(&hook, &callable, &func_name, &call_args)
                }
            }
        });

        // Hand the scratch space back before propagating any error.
        call_args.clear();
        if let Some(frame) = self.frames.last_mut() {
            frame.scratch_args = call_args;
        }

        let ret = result?;
        self.write_register(dst, ret)?;
        self.pc += 1;
        Ok(())
    }

    fn materialize_arg(&self, arg: &Arg) -> Result<Value, VmError> {
        match arg {
            Arg::Register(reg) => self.read_register(*reg),
            Arg::Immediate(imm) => Ok(Value::Int(*imm)),
            Arg::ConstIdx(idx) => self
                .const_pool
                .get(*idx)
                .cloned()
                .ok_or(VmError::ConstantOutOfBounds(*idx)),
            Arg::FuncIdx(idx) => Ok(Value::Func(
                self.func_pool
                    .get(*idx)
                    .cloned()
                    .ok_or(VmError::FunctionIndexOutOfBounds(*idx))?,
            )),
        }
    }

    /// Wrap one call in the instrumentation hook: invoked with
    /// `(callable, func_name, before, ret, args…)` before and after the call;
    /// a `SkipRun` verdict from the before-hook vetoes the call.
    fn run_instrumented_call(
        &mut self,
        hook: &Callable,
        callable: &Callable,
        func_name: &str,
        args: &[Value],
    ) -> Result<Value, VmError> {
        let mut payload = Vec::with_capacity(args.len() + 4);
        payload.push(Value::Func(callable.clone()));
        payload.push(Value::str(func_name));
        payload.push(Value::Bool(true));
        payload.push(Value::Null);
        for arg in args {
            // Stringify dtypes: instrumentation callbacks are frequently
            // foreign and cannot handle the descriptor triple.
            payload.push(match arg {
                Value::DataType(dtype) => Value::str(dtype.to_string()),
                other => other.clone(),
            });
        }

        let verdict = self.invoke_closure_packed(hook, &payload)?;
        let action = match verdict {
            Value::Int(code) => InstrumentAction::from_code(code),
            _ => InstrumentAction::NoOp,
        };
        if action == InstrumentAction::SkipRun {
            return Ok(Value::Null);
        }

        let ret = self.invoke_closure_packed(callable, args)?;
        payload[2] = Value::Bool(false);
        payload[3] = ret.clone();
        self.invoke_closure_packed(hook, &payload)?;
        Ok(ret)
    }

    //-------------------------------------------------------------
    // Stateful inference interface.
    //-------------------------------------------------------------

    /// Stage inputs for a later `invoke_stateful`.  Arity is validated
    /// against the function declaration and every argument is migrated to
    /// the canonical device.  With `with_param_module`, the trailing argument
    /// is a parameter-pack module whose `get_params` result replaces it.
    pub fn set_input(
        &mut self,
        func_name: &str,
        with_param_module: bool,
        args: &[Value],
    ) -> Result<(), VmError> {
        let info = self.func_info(func_name)?;
        if args.len() != info.num_args {
            return Err(VmError::ArityMismatch {
                function: info.name.clone(),
                expected: info.num_args,
                actual: args.len(),
                param_names: info.param_names.clone(),
            });
        }
        let (device, alloc) = self.canonical_device()?;
        let mut staged = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            if with_param_module && i == args.len() - 1 {
                let Value::Module(module) = arg else {
                    return Err(VmError::TypeMismatch {
                        expected: "parameter module",
                        found: arg.kind(),
                    });
                };
                staged.push(module.get_params()?);
            } else {
                staged.push(convert_arg_to_device(arg, device, alloc.as_ref())?);
            }
        }
        self.inputs.insert(func_name.to_string(), staged);
        Ok(())
    }

    /// Invoke a named function with its staged inputs, recording the output.
    pub fn invoke_stateful(&mut self, func_name: &str) -> Result<(), VmError> {
        let exec = self.exec()?.clone();
        let func_idx = exec
            .find_function(func_name)
            .ok_or_else(|| VmError::UnknownFunction(func_name.to_string()))?;
        let args = self
            .inputs
            .get(func_name)
            .cloned()
            .ok_or_else(|| VmError::MissingInput(func_name.to_string()))?;
        let callable = self
            .func_pool
            .get(func_idx)
            .cloned()
            .ok_or(VmError::Uninitialized)?;
        let output = self.invoke_closure_packed(&callable, &args)?;
        self.outputs.insert(func_name.to_string(), output);
        Ok(())
    }

    pub fn inputs_for(&self, func_name: &str) -> Option<&[Value]> {
        self.inputs.get(func_name).map(Vec::as_slice)
    }

    pub fn clear_inputs_for(&mut self, func_name: &str) {
        self.inputs.remove(func_name);
    }

    fn lookup_output(&self, func_name: &str) -> Result<&Value, VmError> {
        self.outputs
            .get(func_name)
            .ok_or_else(|| VmError::MissingOutput(func_name.to_string()))
    }

    fn index_into_nested<'a>(value: &'a Value, path: &[usize]) -> Result<&'a Value, VmError> {
        let mut current = value;
        for &index in path {
            let Value::List(items) = current else {
                return Err(VmError::IndexIntoNonList(current.kind()));
            };
            current = items.get(index).ok_or(VmError::ListIndexOutOfRange {
                index,
                len: items.len(),
            })?;
        }
        Ok(current)
    }

    /// Size of the list reached by the index path, or -1 when the resolved
    /// object is not a list.
    pub fn get_output_arity(&self, func_name: &str, path: &[usize]) -> Result<i64, VmError> {
        let output = self.lookup_output(func_name)?;
        match Self::index_into_nested(output, path)? {
            Value::List(items) => Ok(items.len() as i64),
            _ => Ok(-1),
        }
    }

    /// The output element reached by the index path; lists must be indexed
    /// further.
    pub fn get_output(&self, func_name: &str, path: &[usize]) -> Result<Value, VmError> {
        let output = self.lookup_output(func_name)?;
        let resolved = Self::index_into_nested(output, path)?;
        if matches!(resolved, Value::List(_)) {
            return Err(VmError::OutputIsList);
        }
        Ok(resolved.clone())
    }

    pub fn get_function_arity(&self, func_name: &str) -> Result<usize, VmError> {
        Ok(self.func_info(func_name)?.param_names.len())
    }

    pub fn get_function_param_name(
        &self,
        func_name: &str,
        index: usize,
    ) -> Result<String, VmError> {
        let info = self.func_info(func_name)?;
        info.param_names
            .get(index)
            .cloned()
            .ok_or(VmError::ParamIndexOutOfRange {
                function: info.name.clone(),
                index,
                len: info.param_names.len(),
            })
    }

    //-------------------------------------------------------------
    // Module facade.
    //-------------------------------------------------------------

    /// Name-indexed dispatch of the module operation table.  Unknown names
    /// fall back to function lookup, so `call_op("main", …)` invokes `main`.
    pub fn call_op(&mut self, op: &str, args: &[Value]) -> Result<Value, VmError> {
        match op {
            "vm_initialization" => self.op_init(args),
            "invoke_closure" => {
                let target = match args.first() {
                    Some(Value::Func(callable)) => callable.clone(),
                    Some(Value::Str(name)) => self
                        .lookup_function(name)
                        .ok_or_else(|| VmError::UnknownFunction(name.to_string()))?,
                    Some(other) => {
                        return Err(VmError::InvalidArgument {
                            op: "invoke_closure",
                            message: format!("expected a callable, got {}", other.kind()),
                        })
                    }
                    None => {
                        return Err(VmError::InvalidArgument {
                            op: "invoke_closure",
                            message: "missing callable argument".to_string(),
                        })
                    }
                };
                self.invoke_closure_packed(&target, &args[1..])
            }
            "save_function" => {
                let func_name = expect_str(args, 0, "save_function")?;
                let save_name = expect_str(args, 1, "save_function")?;
                let include_return = expect_bool(args, 2, "save_function")?;
                self.save_closure(func_name, save_name, include_return, &args[3..])?;
                Ok(Value::Null)
            }
            "invoke_stateful" => {
                let func_name = expect_str(args, 0, "invoke_stateful")?;
                self.invoke_stateful(func_name)?;
                Ok(Value::Null)
            }
            "set_input" => {
                let func_name = expect_str(args, 0, "set_input")?;
                self.set_input(func_name, false, &args[1..])?;
                Ok(Value::Null)
            }
            "set_input_with_param_module" => {
                let func_name = expect_str(args, 0, "set_input_with_param_module")?;
                self.set_input(func_name, true, &args[1..])?;
                Ok(Value::Null)
            }
            "get_output_arity" => {
                let func_name = expect_str(args, 0, "get_output_arity")?;
                let path = index_path(args, 1, "get_output_arity")?;
                Ok(Value::Int(self.get_output_arity(func_name, &path)?))
            }
            "get_output" => {
                let func_name = expect_str(args, 0, "get_output")?;
                let path = index_path(args, 1, "get_output")?;
                self.get_output(func_name, &path)
            }
            "get_function_arity" => {
                let func_name = expect_str(args, 0, "get_function_arity")?;
                Ok(Value::Int(self.get_function_arity(func_name)? as i64))
            }
            "get_function_param_name" => {
                let func_name = expect_str(args, 0, "get_function_param_name")?;
                let index = expect_int(args, 1, "get_function_param_name")?;
                if index < 0 {
                    return Err(VmError::InvalidArgument {
                        op: "get_function_param_name",
                        message: format!("negative parameter index {index}"),
                    });
                }
                Ok(Value::str(
                    self.get_function_param_name(func_name, index as usize)?,
                ))
            }
            "set_instrument" => {
                let hook = match args.first() {
                    Some(Value::Func(callable)) => callable.clone(),
                    Some(Value::Str(name)) => Callable::Packed(
                        registry::get(name).ok_or_else(|| VmError::UnknownSymbol(name.to_string()))?,
                    ),
                    _ => {
                        return Err(VmError::InvalidArgument {
                            op: "set_instrument",
                            message: "expected a callable or registry name".to_string(),
                        })
                    }
                };
                self.set_instrument(hook);
                Ok(Value::Null)
            }
            "segment_runner.get_skeleton" => Ok(Value::str(self.segment_get_skeleton()?)),
            "segment_runner.load" => {
                let text = expect_str(args, 0, "segment_runner.load")?;
                Ok(Value::Int(self.segment_load(text)))
            }
            "segment_runner.set_input" => {
                let Some((input, params)) = args.split_first() else {
                    return Err(VmError::InvalidArgument {
                        op: "segment_runner.set_input",
                        message: "missing input tensor".to_string(),
                    });
                };
                self.segment_set_input(input, params)?;
                Ok(Value::Int(0))
            }
            "segment_runner.run" => {
                let segment_id = expect_int(args, 0, "segment_runner.run")?;
                if segment_id < 0 {
                    return Err(VmError::InvalidArgument {
                        op: "segment_runner.run",
                        message: format!("negative segment id {segment_id}"),
                    });
                }
                self.segment_run(segment_id as usize)?;
                Ok(Value::Int(segment_id))
            }
            "segment_runner.get_output" => {
                let tensors = self.segment_get_output()?;
                Ok(Value::list(
                    tensors.into_iter().map(Value::Tensor).collect::<Vec<_>>(),
                ))
            }
            other => match self.lookup_function(other) {
                Some(callable) => self.invoke_closure_packed(&callable, args),
                None => Err(VmError::UnknownOperation(other.to_string())),
            },
        }
    }

    fn op_init(&mut self, args: &[Value]) -> Result<Value, VmError> {
        if args.len() % 3 != 0 {
            return Err(VmError::InvalidArgument {
                op: "vm_initialization",
                message: "arguments must be (device_kind, device_id, alloc_kind) triples"
                    .to_string(),
            });
        }
        let mut devices = Vec::with_capacity(args.len() / 3);
        let mut kinds = Vec::with_capacity(args.len() / 3);
        for triple in args.chunks_exact(3) {
            let device_kind = triple[0]
                .as_int()
                .and_then(crate::tensor::DeviceKind::from_code)
                .ok_or_else(|| VmError::InvalidArgument {
                    op: "vm_initialization",
                    message: format!("bad device kind {:?}", triple[0]),
                })?;
            let device_id = triple[1].as_int().ok_or_else(|| VmError::InvalidArgument {
                op: "vm_initialization",
                message: format!("bad device id {:?}", triple[1]),
            })?;
            let alloc_kind = triple[2]
                .as_int()
                .and_then(AllocatorKind::from_code)
                .ok_or_else(|| VmError::InvalidArgument {
                    op: "vm_initialization",
                    message: format!("bad allocator kind {:?}", triple[2]),
                })?;
            devices.push(Device::new(device_kind, device_id as i32));
            kinds.push(alloc_kind);
        }
        self.init(&devices, &kinds)?;
        Ok(Value::Null)
    }
}

fn expect_arg<'a>(args: &'a [Value], index: usize, op: &'static str) -> Result<&'a Value, VmError> {
    args.get(index).ok_or_else(|| VmError::InvalidArgument {
        op,
        message: format!("missing argument {index}"),
    })
}

fn expect_str<'a>(args: &'a [Value], index: usize, op: &'static str) -> Result<&'a str, VmError> {
    let value = expect_arg(args, index, op)?;
    value.as_str().ok_or_else(|| VmError::InvalidArgument {
        op,
        message: format!("argument {index} must be a string, got {}", value.kind()),
    })
}

fn expect_int(args: &[Value], index: usize, op: &'static str) -> Result<i64, VmError> {
    let value = expect_arg(args, index, op)?;
    value.as_int().ok_or_else(|| VmError::InvalidArgument {
        op,
        message: format!("argument {index} must be an integer, got {}", value.kind()),
    })
}

fn expect_bool(args: &[Value], index: usize, op: &'static str) -> Result<bool, VmError> {
    let value = expect_arg(args, index, op)?;
    value.as_bool().ok_or_else(|| VmError::InvalidArgument {
        op,
        message: format!("argument {index} must be a bool, got {}", value.kind()),
    })
}

fn index_path(args: &[Value], from: usize, op: &'static str) -> Result<Vec<usize>, VmError> {
    let mut path = Vec::with_capacity(args.len().saturating_sub(from));
    for (offset, value) in args[from.min(args.len())..].iter().enumerate() {
        let index = value.as_int().ok_or_else(|| VmError::InvalidArgument {
            op,
            message: format!(
                "index argument {} must be an integer, got {}",
                from + offset,
                value.kind()
            ),
        })?;
        if index < 0 {
            return Err(VmError::InvalidArgument {
                op,
                message: format!("negative index {index}"),
            });
        }
        path.push(index as usize);
    }
    Ok(path)
}

//! Minimal C-compatible bridge between host bindings and the Lattice VM.
//!
//! The execution entry point uses JSON payloads so bindings can evolve
//! independently of the Rust ABI: callers pass a request describing the
//! executable, device/allocator pairs, the entry function and its arguments;
//! the runtime responds with either a result or an error descriptor.
//!
//! The bridge also carries the runtime's last-error channel.  Every failure
//! that crosses the boundary is recorded in a thread-local slot the binding
//! can query (message, optional backtrace, optional foreign exception
//! object); `lattice_drop_last_error` clears the slot and releases the
//! foreign reference, if any.
//!
//! Executables arriving through JSON have no kernel imports attached, so
//! their `Packed`-kind functions resolve through the process-wide registry.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Arc;

use libc::{c_char, c_void};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lattice_vm_runtime::executable::Executable;
use lattice_vm_runtime::memory::AllocatorKind;
use lattice_vm_runtime::tensor::{DataType, Device, DeviceKind, Tensor};
use lattice_vm_runtime::value::Value;
use lattice_vm_runtime::vm::{VirtualMachine, VmError};

//-------------------------------------------------------------
// Last-error channel.
//-------------------------------------------------------------

/// Destructor for a foreign exception object carried through the channel.
pub type ForeignRelease = Option<unsafe extern "C" fn(*mut c_void)>;

struct ForeignObject {
    handle: *mut c_void,
    release: ForeignRelease,
}

impl Drop for ForeignObject {
    fn drop(&mut self) {
        if let Some(release) = self.release {
            // Safety: the producer of the object supplied this destructor.
            unsafe { release(self.handle) };
        }
    }
}

struct LastError {
    message: CString,
    backtrace: Option<CString>,
    foreign: Option<ForeignObject>,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<LastError>> = const { RefCell::new(None) };
}

fn record_error(message: &str) {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(LastError {
            message,
            backtrace: None,
            foreign: None,
        });
    });
}

/// Record an error message from the host side of the boundary.
///
/// # Safety
///
/// `message` must be a valid null-terminated string pointer.
#[no_mangle]
pub unsafe extern "C" fn lattice_set_last_error(message: *const c_char) {
    if message.is_null() {
        return;
    }
    let text = CStr::from_ptr(message).to_string_lossy().into_owned();
    record_error(&text);
}

/// Record an error together with a backtrace and a foreign exception object
/// the binding can re-raise natively.  `release` is invoked when the slot is
/// dropped or overwritten.
///
/// # Safety
///
/// `message` must be valid; `backtrace` may be null; `object` ownership
/// transfers to the channel.
#[no_mangle]
pub unsafe extern "C" fn lattice_set_last_error_with_object(
    message: *const c_char,
    backtrace: *const c_char,
    object: *mut c_void,
    release: ForeignRelease,
) {
    if message.is_null() {
        return;
    }
    let message = CString::new(CStr::from_ptr(message).to_string_lossy().replace('\0', " "))
        .unwrap_or_default();
    let backtrace = if backtrace.is_null() {
        None
    } else {
        CString::new(CStr::from_ptr(backtrace).to_string_lossy().replace('\0', " ")).ok()
    };
    let foreign = if object.is_null() {
        None
    } else {
        Some(ForeignObject {
            handle: object,
            release,
        })
    };
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(LastError {
            message,
            backtrace,
            foreign,
        });
    });
}

/// The current error message, or null when the slot is empty.  The pointer
/// stays valid until the slot is overwritten or dropped.
#[no_mangle]
pub extern "C" fn lattice_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(ptr::null(), |err| err.message.as_ptr())
    })
}

/// The current error backtrace, or null when absent.
#[no_mangle]
pub extern "C" fn lattice_last_error_backtrace() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .and_then(|err| err.backtrace.as_ref())
            .map_or(ptr::null(), |bt| bt.as_ptr())
    })
}

/// The foreign exception object carried by the current error, or null.
#[no_mangle]
pub extern "C" fn lattice_last_error_object() -> *mut c_void {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .and_then(|err| err.foreign.as_ref())
            .map_or(ptr::null_mut(), |obj| obj.handle)
    })
}

/// Clear the last-error slot, releasing the foreign reference if one is
/// attached.
#[no_mangle]
pub extern "C" fn lattice_drop_last_error() {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = None;
    });
}

//-------------------------------------------------------------
// Execution entry point.
//-------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExecutionRequest {
    executable: Executable,
    #[serde(default)]
    devices: Vec<DeviceRequest>,
    entry: String,
    #[serde(default)]
    args: Vec<ValueLiteral>,
}

#[derive(Debug, Deserialize)]
struct DeviceRequest {
    device_kind: i64,
    device_id: i64,
    alloc_kind: i64,
}

/// JSON-representable subset of the runtime value model.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum ValueLiteral {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Tensor(TensorPayload),
    List(Vec<ValueLiteral>),
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorPayload {
    shape: Vec<i64>,
    dtype: DataType,
    data: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct ExecutionResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<ValueLiteral>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorPayload>,
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    kind: String,
    message: String,
}

#[derive(Debug, Error)]
enum BridgeError {
    #[error("received null pointer from caller")]
    NullPointer,
    #[error("ffi payload was not valid UTF-8")]
    InvalidUtf8,
    #[error("failed to parse request JSON: {0}")]
    Parse(serde_json::Error),
    #[error("unsupported value in request or response: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Execution(#[from] VmError),
}

impl ValueLiteral {
    fn into_value(self) -> Result<Value, BridgeError> {
        let value = match self {
            ValueLiteral::Null => Value::Null,
            ValueLiteral::Int(v) => Value::Int(v),
            ValueLiteral::Float(v) => Value::Float(v),
            ValueLiteral::Bool(v) => Value::Bool(v),
            ValueLiteral::Str(v) => Value::str(v),
            ValueLiteral::Tensor(payload) => Value::Tensor(
                Tensor::from_bytes(payload.shape, payload.dtype, Device::cpu(0), payload.data)
                    .map_err(VmError::from)?,
            ),
            ValueLiteral::List(items) => Value::list(
                items
                    .into_iter()
                    .map(ValueLiteral::into_value)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        };
        Ok(value)
    }

    fn from_value(value: &Value) -> Result<Self, BridgeError> {
        let literal = match value {
            Value::Null => ValueLiteral::Null,
            Value::Int(v) => ValueLiteral::Int(*v),
            Value::Float(v) => ValueLiteral::Float(*v),
            Value::Bool(v) => ValueLiteral::Bool(*v),
            Value::Str(v) => ValueLiteral::Str(v.to_string()),
            Value::Tensor(tensor) => ValueLiteral::Tensor(TensorPayload {
                shape: tensor.shape().to_vec(),
                dtype: tensor.dtype(),
                data: tensor.bytes().to_vec(),
            }),
            Value::List(items) => ValueLiteral::List(
                items
                    .iter()
                    .map(ValueLiteral::from_value)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            _ => return Err(BridgeError::Unsupported("value kind has no JSON form")),
        };
        Ok(literal)
    }
}

/// Execute a JSON request against a fresh VM.
///
/// # Safety
///
/// `request` must be a valid null-terminated UTF-8 string pointer.  The
/// returned pointer owns a heap allocation and must be released with
/// [`lattice_free`].
#[no_mangle]
pub unsafe extern "C" fn lattice_execute(request: *const c_char) -> *mut c_char {
    let response = match execute_internal(request) {
        Ok(response) => response,
        Err(error) => {
            record_error(&error.to_string());
            error_response(error)
        }
    };
    to_c_string(&response)
}

/// Release a string returned by this bridge.
///
/// # Safety
///
/// `ptr` must originate from [`lattice_execute`] (or be null).
#[no_mangle]
pub unsafe extern "C" fn lattice_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        let _ = CString::from_raw(ptr);
    }
}

unsafe fn execute_internal(request: *const c_char) -> Result<ExecutionResponse, BridgeError> {
    if request.is_null() {
        return Err(BridgeError::NullPointer);
    }
    let raw = CStr::from_ptr(request)
        .to_str()
        .map_err(|_| BridgeError::InvalidUtf8)?;
    let payload: ExecutionRequest = serde_json::from_str(raw).map_err(BridgeError::Parse)?;

    let (devices, kinds) = resolve_devices(&payload.devices)?;
    let mut vm = VirtualMachine::new();
    vm.load_executable(Arc::new(payload.executable));
    vm.init(&devices, &kinds)?;

    let args = payload
        .args
        .into_iter()
        .map(ValueLiteral::into_value)
        .collect::<Result<Vec<_>, _>>()?;
    let callable = vm
        .lookup_function(&payload.entry)
        .ok_or(VmError::UnknownFunction(payload.entry))?;
    let result = vm.invoke_closure_packed(&callable, &args)?;

    let value = match result {
        Value::Null => None,
        other => Some(ValueLiteral::from_value(&other)?),
    };
    Ok(ExecutionResponse {
        ok: true,
        value,
        error: None,
    })
}

fn resolve_devices(
    requests: &[DeviceRequest],
) -> Result<(Vec<Device>, Vec<AllocatorKind>), BridgeError> {
    if requests.is_empty() {
        return Ok((vec![Device::cpu(0)], vec![AllocatorKind::Naive]));
    }
    let mut devices = Vec::with_capacity(requests.len());
    let mut kinds = Vec::with_capacity(requests.len());
    for request in requests {
        let kind = DeviceKind::from_code(request.device_kind)
            .ok_or(BridgeError::Unsupported("unknown device kind"))?;
        let alloc = AllocatorKind::from_code(request.alloc_kind)
            .ok_or(BridgeError::Unsupported("unknown allocator kind"))?;
        devices.push(Device::new(kind, request.device_id as i32));
        kinds.push(alloc);
    }
    Ok((devices, kinds))
}

fn error_response(error: BridgeError) -> ExecutionResponse {
    let payload = match &error {
        BridgeError::NullPointer => ErrorPayload {
            kind: "null_pointer".to_string(),
            message: error.to_string(),
        },
        BridgeError::InvalidUtf8 => ErrorPayload {
            kind: "invalid_utf8".to_string(),
            message: error.to_string(),
        },
        BridgeError::Parse(err) => ErrorPayload {
            kind: "parse_error".to_string(),
            message: err.to_string(),
        },
        BridgeError::Unsupported(message) => ErrorPayload {
            kind: "unsupported".to_string(),
            message: (*message).to_string(),
        },
        BridgeError::Execution(vm_error) => ErrorPayload {
            kind: vm_error_kind(vm_error).to_string(),
            message: vm_error.to_string(),
        },
    };
    ExecutionResponse {
        ok: false,
        value: None,
        error: Some(payload),
    }
}

fn vm_error_kind(error: &VmError) -> &'static str {
    match error {
        VmError::UnknownFunction(_) => "unknown_function",
        VmError::UnknownSymbol(_) => "unknown_symbol",
        VmError::MissingTirEntry { .. } => "missing_tir_entry",
        VmError::ArityMismatch { .. } => "arity_mismatch",
        VmError::MissingInput(_) => "missing_input",
        VmError::MissingOutput(_) => "missing_output",
        VmError::InvalidPc(_) | VmError::InvalidJump(_) => "invalid_pc",
        VmError::InvalidFalseOffset(_) => "invalid_false_offset",
        VmError::RegisterOutOfBounds { .. } => "register_out_of_bounds",
        VmError::FunctionIndexOutOfBounds(_) => "function_index_out_of_bounds",
        VmError::ConstantOutOfBounds(_) => "constant_out_of_bounds",
        VmError::NoActiveFrame => "no_active_frame",
        VmError::TypeMismatch { .. } => "type_mismatch",
        VmError::IndexIntoNonList(_) => "index_into_non_list",
        VmError::ListIndexOutOfRange { .. } => "list_index_out_of_range",
        VmError::OutputIsList => "output_is_list",
        VmError::ParamIndexOutOfRange { .. } => "param_index_out_of_range",
        VmError::ExecutableNotLoaded => "executable_not_loaded",
        VmError::Uninitialized => "uninitialized",
        VmError::DeviceAllocatorMismatch { .. } => "device_allocator_mismatch",
        VmError::UnknownOperation(_) => "unknown_operation",
        VmError::InvalidArgument { .. } => "invalid_argument",
        VmError::Kernel(_) => "kernel_error",
        VmError::Memory(_) => "memory_error",
        VmError::Tensor(_) => "tensor_error",
        VmError::Segment(_) => "segment_error",
    }
}

fn to_c_string(response: &ExecutionResponse) -> *mut c_char {
    match serde_json::to_string(response) {
        Ok(serialised) => CString::new(serialised)
            .map(CString::into_raw)
            .unwrap_or(ptr::null_mut()),
        Err(_) => ptr::null_mut(),
    }
}

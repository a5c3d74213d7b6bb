use std::sync::{Arc, Mutex};

use lattice_vm_runtime::executable::{Arg, Constant, Executable, FuncInfo, FuncKind, Instruction};
use lattice_vm_runtime::kernels::KernelLibrary;
use lattice_vm_runtime::memory::AllocatorKind;
use lattice_vm_runtime::registry;
use lattice_vm_runtime::tensor::{DataType, Device};
use lattice_vm_runtime::value::{Callable, Value};
use lattice_vm_runtime::vm::VirtualMachine;

/// single_call(x) = x + 1, one Call followed by Ret of the destination.
fn single_call_executable() -> Executable {
    let mut exec = Executable::new();
    exec.push_import(KernelLibrary::standard());
    let add_idx = exec.push_function(FuncInfo {
        name: "add".to_string(),
        kind: FuncKind::Packed,
        num_args: 2,
        register_file_size: 0,
        start_instr: 0,
        param_names: vec!["lhs".to_string(), "rhs".to_string()],
    });
    exec.push_function(FuncInfo {
        name: "single_call".to_string(),
        kind: FuncKind::Bytecode,
        num_args: 1,
        register_file_size: 2,
        start_instr: 0,
        param_names: vec!["x".to_string()],
    });
    exec.push_instruction(Instruction::Call {
        dst: 1,
        func_idx: add_idx,
        args: vec![Arg::Register(0), Arg::Immediate(1)],
    });
    exec.push_instruction(Instruction::Ret { result: 1 });
    exec
}

fn boot(exec: Executable) -> VirtualMachine {
    let mut vm = VirtualMachine::new();
    vm.load_executable(Arc::new(exec));
    vm.init(&[Device::cpu(0)], &[AllocatorKind::Naive])
        .expect("initialization");
    vm
}

#[derive(Debug, Clone, PartialEq)]
struct Event {
    func_name: String,
    before: bool,
    ret_kind: &'static str,
}

fn recording_hook(log: Arc<Mutex<Vec<Event>>>, verdict: i64) -> Callable {
    Callable::Packed(Arc::new(move |_, args| {
        let func_name = args[1].as_str().unwrap_or_default().to_string();
        let before = args[2].as_bool().unwrap_or_default();
        log.lock().expect("log lock").push(Event {
            func_name,
            before,
            ret_kind: args[3].kind(),
        });
        Ok(Value::Int(if before { verdict } else { 0 }))
    }))
}

#[test]
fn skip_run_vetoes_the_call() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut vm = boot(single_call_executable());
    vm.set_instrument(recording_hook(log.clone(), 1));

    let result = vm
        .call_op("invoke_closure", &[Value::str("single_call"), Value::Int(5)])
        .expect("skipped call still completes");
    // The destination register was never written, so Ret sees null.
    assert!(result.is_null());

    let events = log.lock().expect("log lock");
    assert_eq!(events.len(), 1, "no after-hook for a vetoed call");
    assert!(events[0].before);
    assert_eq!(events[0].func_name, "add");
}

#[test]
fn noop_instrumentation_wraps_before_and_after() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut vm = boot(single_call_executable());
    vm.set_instrument(recording_hook(log.clone(), 0));

    let result = vm
        .call_op("invoke_closure", &[Value::str("single_call"), Value::Int(5)])
        .expect("instrumented call");
    assert_eq!(result.as_int(), Some(6));

    let events = log.lock().expect("log lock");
    assert_eq!(events.len(), 2);
    assert!(events[0].before);
    assert_eq!(events[0].ret_kind, "null");
    assert!(!events[1].before);
    // The after-hook observes the concrete return value.
    assert_eq!(events[1].ret_kind, "int");
}

#[test]
fn unknown_action_codes_run_the_call() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut vm = boot(single_call_executable());
    vm.set_instrument(recording_hook(log.clone(), 42));

    let result = vm
        .call_op("invoke_closure", &[Value::str("single_call"), Value::Int(5)])
        .expect("unknown verdict is a no-op");
    assert_eq!(result.as_int(), Some(6));
    assert_eq!(log.lock().expect("log lock").len(), 2);
}

#[test]
fn dtype_arguments_are_stringified_for_the_hook() {
    let mut exec = Executable::new();
    let mut lib = KernelLibrary::standard();
    lib.register_packed("dtype_sink", Arc::new(|_, _| Ok(Value::Int(0))));
    exec.push_import(lib);
    let sink_idx = exec.push_function(FuncInfo {
        name: "dtype_sink".to_string(),
        kind: FuncKind::Packed,
        num_args: 1,
        register_file_size: 0,
        start_instr: 0,
        param_names: vec!["dtype".to_string()],
    });
    exec.push_function(FuncInfo {
        name: "main".to_string(),
        kind: FuncKind::Bytecode,
        num_args: 0,
        register_file_size: 1,
        start_instr: 0,
        param_names: Vec::new(),
    });
    let dtype_const = exec.push_constant(Constant::DataType(DataType::F32));
    exec.push_instruction(Instruction::Call {
        dst: 0,
        func_idx: sink_idx,
        args: vec![Arg::ConstIdx(dtype_const)],
    });
    exec.push_instruction(Instruction::Ret { result: 0 });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_hook = seen.clone();
    let mut vm = boot(exec);
    vm.set_instrument(Callable::Packed(Arc::new(move |_, args| {
        seen_in_hook
            .lock()
            .expect("lock")
            .push(args[4].as_str().map(str::to_string));
        Ok(Value::Int(0))
    })));

    vm.call_op("invoke_closure", &[Value::str("main")])
        .expect("instrumented call");
    let seen = seen.lock().expect("lock");
    assert_eq!(seen[0].as_deref(), Some("float32"));
}

#[test]
fn instrument_can_be_installed_by_registry_name() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let log_in_hook = log.clone();
    registry::register(
        "test.counting_instrument",
        Arc::new(move |_, _| {
            log_in_hook.lock().expect("lock").push(());
            Ok(Value::Int(0))
        }),
    );

    let mut vm = boot(single_call_executable());
    vm.call_op("set_instrument", &[Value::str("test.counting_instrument")])
        .expect("install by name");
    vm.call_op("invoke_closure", &[Value::str("single_call"), Value::Int(1)])
        .expect("run");
    assert_eq!(log.lock().expect("lock").len(), 2);

    registry::remove("test.counting_instrument");
}

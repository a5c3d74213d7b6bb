use std::sync::Arc;

use lattice_vm_runtime::executable::{
    Arg, Constant, Executable, FuncInfo, FuncKind, Instruction, TensorLiteral,
};
use lattice_vm_runtime::kernels::KernelLibrary;
use lattice_vm_runtime::memory::AllocatorKind;
use lattice_vm_runtime::tensor::{DataType, Device, DeviceKind, ExternalTensorView, Tensor};
use lattice_vm_runtime::value::{ParamModule, Value};
use lattice_vm_runtime::vm::{VirtualMachine, VmError};

fn packed(name: &str) -> FuncInfo {
    FuncInfo {
        name: name.to_string(),
        kind: FuncKind::Packed,
        num_args: 2,
        register_file_size: 0,
        start_instr: 0,
        param_names: vec!["lhs".to_string(), "rhs".to_string()],
    }
}

/// main(x, y) = pack(x + y, x)
fn multi_output_executable() -> Executable {
    let mut exec = Executable::new();
    exec.push_import(KernelLibrary::standard());
    let add_idx = exec.push_function(packed("add"));
    let pack_idx = exec.push_function(packed("pack"));
    exec.push_function(FuncInfo {
        name: "main".to_string(),
        kind: FuncKind::Bytecode,
        num_args: 2,
        register_file_size: 4,
        start_instr: 0,
        param_names: vec!["x".to_string(), "y".to_string()],
    });
    exec.push_instruction(Instruction::Call {
        dst: 2,
        func_idx: add_idx,
        args: vec![Arg::Register(0), Arg::Register(1)],
    });
    exec.push_instruction(Instruction::Call {
        dst: 3,
        func_idx: pack_idx,
        args: vec![Arg::Register(2), Arg::Register(0)],
    });
    exec.push_instruction(Instruction::Ret { result: 3 });
    exec
}

fn boot(exec: Executable, devices: &[Device], kinds: &[AllocatorKind]) -> VirtualMachine {
    let mut vm = VirtualMachine::new();
    vm.load_executable(Arc::new(exec));
    vm.init(devices, kinds).expect("initialization");
    vm
}

fn tensor(values: &[f32]) -> Tensor {
    Tensor::from_f32(vec![values.len() as i64], values, Device::cpu(0)).expect("tensor")
}

#[test]
fn stateful_round_trip_matches_direct_invocation() {
    let exec = Arc::new(multi_output_executable());
    let mut vm = VirtualMachine::new();
    vm.load_executable(exec.clone());
    vm.init(&[Device::cpu(0)], &[AllocatorKind::Naive])
        .expect("init");

    let x = tensor(&[1.0, 2.0]);
    let y = tensor(&[10.0, 20.0]);
    vm.call_op(
        "set_input",
        &[
            Value::str("main"),
            Value::Tensor(x.clone()),
            Value::Tensor(y.clone()),
        ],
    )
    .expect("set_input");
    vm.call_op("invoke_stateful", &[Value::str("main")])
        .expect("invoke_stateful");

    let direct = vm
        .call_op(
            "invoke_closure",
            &[Value::str("main"), Value::Tensor(x), Value::Tensor(y)],
        )
        .expect("direct call");

    let stored_first = vm
        .call_op("get_output", &[Value::str("main"), Value::Int(0)])
        .expect("first output");
    let direct_first = direct.as_list().expect("list result")[0].clone();
    assert_eq!(
        stored_first.as_tensor().expect("tensor"),
        direct_first.as_tensor().expect("tensor")
    );
}

#[test]
fn set_input_migrates_tensors_and_leaves_originals() {
    let mut vm = boot(
        multi_output_executable(),
        &[Device::new(DeviceKind::Cuda, 0), Device::cpu(0)],
        &[AllocatorKind::Pooled, AllocatorKind::Naive],
    );

    let host_x = tensor(&[1.0, 2.0]);
    let host_y = tensor(&[3.0, 4.0]);
    vm.set_input(
        "main",
        false,
        &[Value::Tensor(host_x.clone()), Value::Tensor(host_y.clone())],
    )
    .expect("set_input");

    let staged = vm.inputs_for("main").expect("inputs stored");
    for value in staged {
        let stored = value.as_tensor().expect("tensor argument");
        assert_eq!(stored.device(), Device::new(DeviceKind::Cuda, 0));
    }
    // Originals keep their residency and contents.
    assert_eq!(host_x.device(), Device::cpu(0));
    assert_eq!(host_x, *staged[0].as_tensor().expect("tensor"));
    assert_eq!(host_y.device(), Device::cpu(0));
}

#[test]
fn external_views_are_deep_copied_on_set_input() {
    let mut vm = boot(
        multi_output_executable(),
        &[Device::cpu(0)],
        &[AllocatorKind::Naive],
    );

    let backing: Vec<u8> = [2.0f32, 4.0]
        .iter()
        .flat_map(|v| v.to_ne_bytes())
        .collect();
    let view = unsafe {
        ExternalTensorView::new(
            vec![2],
            DataType::F32,
            Device::cpu(0),
            backing.as_ptr(),
            backing.len(),
        )
    };
    vm.set_input(
        "main",
        false,
        &[Value::TensorView(view), Value::Tensor(tensor(&[0.0, 0.0]))],
    )
    .expect("set_input");

    let staged = vm.inputs_for("main").expect("inputs stored");
    let copied = staged[0].as_tensor().expect("view becomes managed tensor");
    assert_eq!(copied.bytes(), backing.as_slice());
}

#[test]
fn set_input_validates_arity() {
    let mut vm = boot(
        multi_output_executable(),
        &[Device::cpu(0)],
        &[AllocatorKind::Naive],
    );
    let err = vm
        .set_input("main", false, &[Value::Tensor(tensor(&[1.0]))])
        .expect_err("one argument short");
    assert!(matches!(err, VmError::ArityMismatch { .. }));
}

#[test]
fn stateful_invocation_requires_staged_inputs() {
    let mut vm = boot(
        multi_output_executable(),
        &[Device::cpu(0)],
        &[AllocatorKind::Naive],
    );
    let err = vm
        .invoke_stateful("main")
        .expect_err("no inputs were staged");
    assert!(matches!(err, VmError::MissingInput(_)));

    let err = vm
        .get_output("main", &[])
        .expect_err("no output recorded yet");
    assert!(matches!(err, VmError::MissingOutput(_)));
}

#[test]
fn nested_output_navigation() {
    let mut vm = boot(
        multi_output_executable(),
        &[Device::cpu(0)],
        &[AllocatorKind::Naive],
    );
    vm.set_input(
        "main",
        false,
        &[
            Value::Tensor(tensor(&[1.0, 2.0])),
            Value::Tensor(tensor(&[3.0, 4.0])),
        ],
    )
    .expect("set_input");
    vm.invoke_stateful("main").expect("invoke");

    // The result is a two-element list.
    assert_eq!(vm.get_output_arity("main", &[]).expect("arity"), 2);
    // A resolved leaf is not a list, so its arity is -1.
    assert_eq!(vm.get_output_arity("main", &[0]).expect("leaf"), -1);

    let err = vm.get_output("main", &[]).expect_err("list needs an index");
    assert!(matches!(err, VmError::OutputIsList));

    let first = vm.get_output("main", &[0]).expect("indexed output");
    assert_eq!(
        first.as_tensor().expect("tensor").f32_values().expect("f32"),
        vec![4.0, 6.0]
    );

    let err = vm
        .get_output("main", &[0, 0])
        .expect_err("indexing into a tensor");
    assert!(matches!(err, VmError::IndexIntoNonList(_)));

    let err = vm.get_output("main", &[5]).expect_err("index past the list");
    assert!(matches!(err, VmError::ListIndexOutOfRange { .. }));
}

struct FixedParams(Vec<Value>);

impl ParamModule for FixedParams {
    fn get_params(&self) -> Result<Value, VmError> {
        Ok(Value::list(self.0.clone()))
    }
}

#[test]
fn param_module_supplies_the_trailing_argument() {
    let mut vm = boot(
        multi_output_executable(),
        &[Device::cpu(0)],
        &[AllocatorKind::Naive],
    );
    let params = FixedParams(vec![Value::Tensor(tensor(&[9.0, 9.0]))]);
    vm.set_input(
        "main",
        true,
        &[
            Value::Tensor(tensor(&[1.0, 1.0])),
            Value::Module(Arc::new(params)),
        ],
    )
    .expect("set_input with module");

    let staged = vm.inputs_for("main").expect("inputs stored");
    let tail = staged[1].as_list().expect("get_params result");
    assert_eq!(tail.len(), 1);
}

#[test]
fn conversion_helpers_distinguish_views_from_managed_tensors() {
    use lattice_vm_runtime::memory::{
        convert_arg_to_device, convert_reg_to_device, MemoryManager,
    };

    let device = Device::new(DeviceKind::Cuda, 0);
    let alloc = MemoryManager::global().get_or_create_allocator(device, AllocatorKind::Naive);

    let backing: Vec<u8> = [1.0f32, 2.0]
        .iter()
        .flat_map(|v| v.to_ne_bytes())
        .collect();
    let view = unsafe {
        ExternalTensorView::new(
            vec![2],
            DataType::F32,
            Device::cpu(0),
            backing.as_ptr(),
            backing.len(),
        )
    };

    // Argument marshalling always deep-copies raw views.
    let as_arg = convert_arg_to_device(&Value::TensorView(view.clone()), device, alloc.as_ref())
        .expect("arg conversion");
    assert_eq!(as_arg.as_tensor().expect("managed copy").device(), device);

    // Register marshalling assumes managed inputs and passes views through.
    let as_reg = convert_reg_to_device(&Value::TensorView(view), device, alloc.as_ref())
        .expect("reg conversion");
    assert!(matches!(as_reg, Value::TensorView(_)));

    // Managed tensors move across devices either way; lists recurse, scalars
    // pass through untouched.
    let nested = Value::list(vec![Value::Tensor(tensor(&[3.0])), Value::Int(4)]);
    let moved = convert_reg_to_device(&nested, device, alloc.as_ref()).expect("list conversion");
    let items = moved.as_list().expect("list");
    assert_eq!(items[0].as_tensor().expect("tensor").device(), device);
    assert_eq!(items[1].as_int(), Some(4));
}

#[test]
fn cleared_inputs_are_gone() {
    let mut vm = boot(
        multi_output_executable(),
        &[Device::cpu(0)],
        &[AllocatorKind::Naive],
    );
    vm.set_input(
        "main",
        false,
        &[
            Value::Tensor(tensor(&[1.0, 2.0])),
            Value::Tensor(tensor(&[3.0, 4.0])),
        ],
    )
    .expect("set_input");
    vm.clear_inputs_for("main");
    let err = vm.invoke_stateful("main").expect_err("inputs were cleared");
    assert!(matches!(err, VmError::MissingInput(_)));
}

#[test]
fn tensor_constants_materialize_on_the_canonical_device() {
    let mut exec = Executable::new();
    exec.push_import(KernelLibrary::standard());
    let identity_idx = exec.push_function(FuncInfo {
        name: "identity".to_string(),
        kind: FuncKind::Packed,
        num_args: 1,
        register_file_size: 0,
        start_instr: 0,
        param_names: vec!["x".to_string()],
    });
    exec.push_function(FuncInfo {
        name: "constant_source".to_string(),
        kind: FuncKind::Bytecode,
        num_args: 0,
        register_file_size: 1,
        start_instr: 0,
        param_names: Vec::new(),
    });
    let const_idx = exec.push_constant(Constant::Tensor(TensorLiteral {
        shape: vec![2],
        dtype: DataType::F32,
        data: [5.0f32, 6.0].iter().flat_map(|v| v.to_ne_bytes()).collect(),
    }));
    exec.push_constant(Constant::Int(7));
    exec.push_instruction(Instruction::Call {
        dst: 0,
        func_idx: identity_idx,
        args: vec![Arg::ConstIdx(const_idx)],
    });
    exec.push_instruction(Instruction::Ret { result: 0 });

    let mut vm = boot(
        exec,
        &[Device::new(DeviceKind::Cuda, 0)],
        &[AllocatorKind::Pooled],
    );
    let result = vm
        .call_op("invoke_closure", &[Value::str("constant_source")])
        .expect("constant fetch");
    let out = result.as_tensor().expect("tensor constant");
    assert_eq!(out.device(), Device::new(DeviceKind::Cuda, 0));
    assert_eq!(out.f32_values().expect("f32"), vec![5.0, 6.0]);
}

use std::sync::Arc;

use lattice_vm_runtime::executable::{Arg, Executable, FuncInfo, FuncKind, Instruction};
use lattice_vm_runtime::kernels::KernelLibrary;
use lattice_vm_runtime::memory::AllocatorKind;
use lattice_vm_runtime::segment::SegmentError;
use lattice_vm_runtime::tensor::{Device, Tensor};
use lattice_vm_runtime::value::Value;
use lattice_vm_runtime::vm::{VirtualMachine, VmError};

fn packed(name: &str, num_args: usize) -> FuncInfo {
    FuncInfo {
        name: name.to_string(),
        kind: FuncKind::Packed,
        num_args,
        register_file_size: 0,
        start_instr: 0,
        param_names: (0..num_args).map(|i| format!("arg{i}")).collect(),
    }
}

/// main(x): r1 = x + x; r2 = r1 * r1; r3 = r2 + r1; return r3
fn chained_executable() -> Executable {
    let mut exec = Executable::new();
    exec.push_import(KernelLibrary::standard());
    let add_idx = exec.push_function(packed("add", 2));
    let mul_idx = exec.push_function(packed("mul", 2));
    exec.push_function(FuncInfo {
        name: "main".to_string(),
        kind: FuncKind::Bytecode,
        num_args: 1,
        register_file_size: 4,
        start_instr: 0,
        param_names: vec!["x".to_string()],
    });
    exec.push_instruction(Instruction::Call {
        dst: 1,
        func_idx: add_idx,
        args: vec![Arg::Register(0), Arg::Register(0)],
    });
    exec.push_instruction(Instruction::Call {
        dst: 2,
        func_idx: mul_idx,
        args: vec![Arg::Register(1), Arg::Register(1)],
    });
    exec.push_instruction(Instruction::Call {
        dst: 3,
        func_idx: add_idx,
        args: vec![Arg::Register(2), Arg::Register(1)],
    });
    exec.push_instruction(Instruction::Ret { result: 3 });
    exec
}

/// main(x) with three mutually independent calls, so segments can be skipped.
fn independent_executable() -> Executable {
    let mut exec = Executable::new();
    exec.push_import(KernelLibrary::standard());
    let add_idx = exec.push_function(packed("add", 2));
    let mul_idx = exec.push_function(packed("mul", 2));
    let id_idx = exec.push_function(packed("identity", 1));
    exec.push_function(FuncInfo {
        name: "main".to_string(),
        kind: FuncKind::Bytecode,
        num_args: 1,
        register_file_size: 4,
        start_instr: 0,
        param_names: vec!["x".to_string()],
    });
    exec.push_instruction(Instruction::Call {
        dst: 1,
        func_idx: add_idx,
        args: vec![Arg::Register(0), Arg::Register(0)],
    });
    exec.push_instruction(Instruction::Call {
        dst: 2,
        func_idx: mul_idx,
        args: vec![Arg::Register(0), Arg::Register(0)],
    });
    exec.push_instruction(Instruction::Call {
        dst: 3,
        func_idx: id_idx,
        args: vec![Arg::Register(0)],
    });
    exec.push_instruction(Instruction::Ret { result: 3 });
    exec
}

fn boot(exec: Arc<Executable>) -> VirtualMachine {
    let mut vm = VirtualMachine::new();
    vm.load_executable(exec);
    vm.init(&[Device::cpu(0)], &[AllocatorKind::Naive])
        .expect("initialization");
    vm
}

fn input_tensor() -> Tensor {
    Tensor::from_f32(vec![2], &[1.5, 2.0], Device::cpu(0)).expect("tensor")
}

#[test]
fn skeleton_lists_every_call_in_program_order() {
    let mut vm = boot(Arc::new(chained_executable()));
    let skeleton = vm.segment_get_skeleton().expect("skeleton");
    let lines: Vec<&str> = skeleton.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "pc = 0, execute: add");
    assert_eq!(lines[1], "pc = 1, execute: mul");
    assert_eq!(lines[2], "pc = 2, execute: add");
}

#[test]
fn annotated_skeleton_round_trips_through_load() {
    let mut vm = boot(Arc::new(chained_executable()));
    let skeleton = vm.segment_get_skeleton().expect("skeleton");
    let lines: Vec<&str> = skeleton.lines().collect();

    // Boundaries before line 0, before line 2, and after line 2.
    let map = format!(
        "@seg\n{}\n{}\n@seg\n{}\n@seg\n",
        lines[0], lines[1], lines[2]
    );
    let count = vm
        .call_op("segment_runner.load", &[Value::str(map)])
        .expect("load");
    assert_eq!(count.as_int(), Some(2));
}

#[test]
fn segment_execution_matches_stateful_invocation() {
    let exec = Arc::new(chained_executable());
    let x = input_tensor();

    let mut segmented = boot(exec.clone());
    let map = "@seg\npc = 0\npc = 1\n@seg\npc = 2\n@seg\n";
    assert_eq!(segmented.segment_load(map), 2);
    segmented
        .call_op(
            "segment_runner.set_input",
            &[Value::Tensor(x.clone())],
        )
        .expect("set_input");
    segmented
        .call_op("segment_runner.run", &[Value::Int(0)])
        .expect("segment 0");
    segmented
        .call_op("segment_runner.run", &[Value::Int(1)])
        .expect("segment 1");
    let output = segmented
        .call_op("segment_runner.get_output", &[])
        .expect("output");
    let flat = output.as_list().expect("flat tensor list");
    assert_eq!(flat.len(), 1);

    let mut direct = boot(exec);
    direct
        .set_input("main", false, &[Value::Tensor(x)])
        .expect("set_input");
    direct.invoke_stateful("main").expect("invoke_stateful");
    let expected = direct.get_output("main", &[]).expect("output");

    assert_eq!(
        flat[0].as_tensor().expect("tensor"),
        expected.as_tensor().expect("tensor")
    );
}

#[test]
fn parse_errors_report_minus_one() {
    let mut vm = boot(Arc::new(chained_executable()));

    // Empty text.
    assert_eq!(vm.segment_load(""), -1);
    // Missing leading separator.
    assert_eq!(vm.segment_load("pc = 0\n@seg\n"), -1);
    // Missing trailing separator.
    assert_eq!(vm.segment_load("@seg\npc = 0\n"), -1);
    // A line with no program counter.
    assert_eq!(vm.segment_load("@seg\nexecute: add\n@seg\n"), -1);
    // A line with two program counters.
    assert_eq!(vm.segment_load("@seg\npc = 0 pc = 1\n@seg\n"), -1);

    // The facade reports the same -1 without raising.
    let result = vm
        .call_op("segment_runner.load", &[Value::str("")])
        .expect("load never raises on parse errors");
    assert_eq!(result.as_int(), Some(-1));
}

#[test]
fn surrounding_prose_is_ignored_when_parsing() {
    let mut vm = boot(Arc::new(chained_executable()));
    let map = "\n  @seg  \n  pc = 0, execute: add  \n\npc=1, execute: mul\n@seg\n pc  =  2 \n@seg\n";
    assert_eq!(vm.segment_load(map), 2);
}

#[test]
fn reloading_replaces_previous_segments() {
    let mut vm = boot(Arc::new(chained_executable()));
    let map = "@seg\npc = 0\npc = 1\n@seg\npc = 2\n@seg\n";
    assert_eq!(vm.segment_load(map), 2);
    assert_eq!(vm.segment_load(map), 2);
}

#[test]
fn running_past_the_last_segment_is_fatal() {
    let mut vm = boot(Arc::new(chained_executable()));
    let map = "@seg\npc = 0\npc = 1\n@seg\npc = 2\n@seg\n";
    assert_eq!(vm.segment_load(map), 2);
    let err = vm
        .call_op("segment_runner.run", &[Value::Int(2)])
        .expect_err("segment id == segment count");
    assert!(matches!(
        err,
        VmError::Segment(SegmentError::SegmentOutOfRange { id: 2, len: 2 })
    ));
}

#[test]
fn running_before_load_is_fatal() {
    let mut vm = boot(Arc::new(chained_executable()));
    let err = vm
        .call_op("segment_runner.run", &[Value::Int(0)])
        .expect_err("segments were never loaded");
    assert!(matches!(err, VmError::Segment(SegmentError::NotLoaded)));
}

#[test]
fn skipping_a_segment_warns_but_proceeds() {
    let mut vm = boot(Arc::new(independent_executable()));
    let map = "@seg\npc = 0\n@seg\npc = 1\n@seg\npc = 2\n@seg\n";
    assert_eq!(vm.segment_load(map), 3);
    let x = input_tensor();
    vm.segment_set_input(&Value::Tensor(x.clone()), &[])
        .expect("set_input");

    vm.segment_run(0).expect("segment 0");
    // Jumping straight to the final segment only warns.
    vm.segment_run(2).expect("skipped segment is not fatal");

    let output = vm.segment_get_output().expect("output after final segment");
    assert_eq!(output.len(), 1);
    assert_eq!(output[0], x);
}

#[test]
fn ret_inside_a_segment_is_fatal() {
    let mut vm = boot(Arc::new(chained_executable()));
    // pc 3 is the entry function's Ret.
    let map = "@seg\npc = 0\npc = 3\n@seg\n";
    assert_eq!(vm.segment_load(map), 1);
    vm.segment_set_input(&Value::Tensor(input_tensor()), &[])
        .expect("set_input");
    let err = vm.segment_run(0).expect_err("Ret before completion");
    assert!(matches!(
        err,
        VmError::Segment(SegmentError::RetBeforeCompletion)
    ));
}

#[test]
fn output_is_unavailable_until_the_final_ret() {
    let mut vm = boot(Arc::new(chained_executable()));
    let map = "@seg\npc = 0\npc = 1\n@seg\npc = 2\n@seg\n";
    assert_eq!(vm.segment_load(map), 2);
    let err = vm
        .segment_get_output()
        .expect_err("pc still points at the first call");
    assert!(matches!(
        err,
        VmError::Segment(SegmentError::OutputNotReady)
    ));
}

#[test]
fn runner_resets_for_the_next_inference() {
    let mut vm = boot(Arc::new(chained_executable()));
    let map = "@seg\npc = 0\npc = 1\n@seg\npc = 2\n@seg\n";
    assert_eq!(vm.segment_load(map), 2);

    for _ in 0..2 {
        vm.segment_set_input(&Value::Tensor(input_tensor()), &[])
            .expect("set_input");
        vm.segment_run(0).expect("segment 0");
        vm.segment_run(1).expect("segment 1");
        let output = vm.segment_get_output().expect("output");
        assert_eq!(output.len(), 1);
    }
}

//! Segment-by-segment execution of the entry function.
//!
//! The segment runner lets an external scheduler drive one inference in
//! slices: a dry run of `main` produces a textual skeleton of every Call it
//! would reach, the user annotates that text with `@seg` separators to choose
//! segment boundaries, and `load` turns the annotated map back into per-
//! segment program-counter lists executed one at a time against a single
//! persistent frame.
//!
//! Lifecycle: `load` → `set_input` → `run(0..n)` → `get_output`, after which
//! the runner is ready for the next inference.  Segment progression is
//! tracked per runner; skipping ahead is a warning, not an error.

use std::sync::OnceLock;

use log::{error, warn};
use regex::Regex;
use thiserror::Error;

use crate::executable::Instruction;
use crate::tensor::Tensor;
use crate::value::Value;
use crate::vm::{Frame, VirtualMachine, VmError};

/// The distinguished function the segment runner partitions.
pub const ENTRY_FUNCTION: &str = "main";

/// Errors raised by segment-map parsing and segment execution.  Parse
/// variants are recoverable (`load` reports them as -1); the rest abort the
/// call.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("segment map is empty")]
    EmptyMap,
    #[error("segment map does not start with an `@seg` line")]
    MissingLeadingSeparator,
    #[error("segment map does not end with an `@seg` line")]
    MissingTrailingSeparator,
    #[error("no program counter found in line {line:?}")]
    MissingPc { line: String },
    #[error("multiple program counters in line {line:?}")]
    MultiplePcs { line: String },
    #[error("program counter out of range in line {line:?}")]
    PcOutOfRange { line: String },
    #[error("segments are not loaded; call `segment_runner.load` first")]
    NotLoaded,
    #[error("segment id {id} is out of range ({len} segments)")]
    SegmentOutOfRange { id: usize, len: usize },
    #[error("reached a return before the final segment completed")]
    RetBeforeCompletion,
    #[error("inference has not reached the final return yet")]
    OutputNotReady,
    #[error("persistent frame does not exist; call `segment_runner.load` first")]
    MissingFrame,
}

/// Per-VM segment runner state.
#[derive(Debug, Default)]
pub(crate) struct SegmentState {
    /// One ordered program-counter list per segment.
    per_segment_pcs: Vec<Vec<usize>>,
    /// Id of the segment executed last, -1 at the start of an inference.
    prev_segment_id: i64,
    /// The frame all segments execute against.
    frame: Option<Box<Frame>>,
    initialized: bool,
}

impl SegmentState {
    fn reset(&mut self) {
        self.per_segment_pcs.clear();
        self.prev_segment_id = -1;
        self.frame = None;
        self.initialized = false;
    }
}

fn pc_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"pc\s*=\s*(\d+)").expect("pc pattern is valid"))
}

/// Parse an annotated segment map into per-segment PC lists.
fn parse_segment_map(text: &str) -> Result<Vec<Vec<usize>>, SegmentError> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    match lines.first() {
        None => return Err(SegmentError::EmptyMap),
        Some(&"@seg") => {}
        Some(_) => return Err(SegmentError::MissingLeadingSeparator),
    }
    match lines.last() {
        Some(&"@seg") => {}
        _ => return Err(SegmentError::MissingTrailingSeparator),
    }

    let mut segments: Vec<Vec<usize>> = Vec::new();
    for line in lines {
        if line == "@seg" {
            segments.push(Vec::new());
            continue;
        }
        let matches: Vec<_> = pc_pattern().captures_iter(line).collect();
        match matches.len() {
            0 => {
                return Err(SegmentError::MissingPc {
                    line: line.to_string(),
                })
            }
            1 => {
                let pc = matches[0][1]
                    .parse::<usize>()
                    .map_err(|_| SegmentError::PcOutOfRange {
                        line: line.to_string(),
                    })?;
                if let Some(segment) = segments.last_mut() {
                    segment.push(pc);
                }
            }
            _ => {
                return Err(SegmentError::MultiplePcs {
                    line: line.to_string(),
                })
            }
        }
    }

    // The trailing `@seg` opens an empty segment; drop it.
    if segments.last().is_some_and(Vec::is_empty) {
        segments.pop();
    }
    Ok(segments)
}

impl VirtualMachine {
    /// Dry-run the entry function, emitting one `pc = N, execute: <callee>`
    /// line per Call it would reach.  Goto and If are followed exactly as the
    /// interpreter would follow them; no kernels are invoked.
    pub fn segment_get_skeleton(&mut self) -> Result<String, VmError> {
        let exec = self.exec()?.clone();
        let func_idx = exec
            .find_function(ENTRY_FUNCTION)
            .ok_or_else(|| VmError::UnknownFunction(ENTRY_FUNCTION.to_string()))?;
        let info = exec.func_table[func_idx].clone();

        let return_pc = self.pc;
        self.with_frame(return_pc, info.register_file_size, |vm| {
            vm.pc = info.start_instr;
            let mut skeleton = String::new();
            loop {
                let instruction = exec
                    .instruction(vm.pc)
                    .ok_or(VmError::InvalidPc(vm.pc))?
                    .clone();
                match instruction {
                    Instruction::Call { func_idx, .. } => {
                        let callee = exec
                            .func_table
                            .get(func_idx)
                            .map(|f| f.name.as_str())
                            .ok_or(VmError::FunctionIndexOutOfBounds(func_idx))?;
                        skeleton.push_str(&format!("pc = {}, execute: {}\n", vm.pc, callee));
                        vm.pc += 1;
                    }
                    Instruction::Ret { .. } => break,
                    Instruction::Goto { pc_offset } => vm.take_goto(pc_offset)?,
                    Instruction::If { cond, false_offset } => vm.take_if(cond, false_offset)?,
                }
            }
            Ok(skeleton)
        })
    }

    /// Load an annotated segment map.  Returns the segment count, or -1 on
    /// any parse error (recoverable: the previous state is simply cleared).
    pub fn segment_load(&mut self, segment_map: &str) -> i64 {
        match self.try_segment_load(segment_map) {
            Ok(count) => count as i64,
            Err(err) => {
                error!("segment map rejected: {err}");
                -1
            }
        }
    }

    fn try_segment_load(&mut self, segment_map: &str) -> Result<usize, VmError> {
        self.segments.reset();
        let parsed = parse_segment_map(segment_map)?;

        let exec = self.exec()?.clone();
        let func_idx = exec
            .find_function(ENTRY_FUNCTION)
            .ok_or_else(|| VmError::UnknownFunction(ENTRY_FUNCTION.to_string()))?;
        let info = &exec.func_table[func_idx];

        self.segments.per_segment_pcs = parsed;
        self.segments.frame = Some(Box::new(Frame::new(0, info.register_file_size)));
        self.segments.initialized = true;
        self.pc = info.start_instr;
        Ok(self.segments.per_segment_pcs.len())
    }

    /// Prime the persistent frame: the input tensor lands in register 0 and
    /// each parameter in the registers after it.
    pub fn segment_set_input(&mut self, input: &Value, params: &[Value]) -> Result<(), VmError> {
        let frame = self
            .segments
            .frame
            .as_mut()
            .ok_or(SegmentError::MissingFrame)?;
        frame.write(0, input.clone())?;
        for (i, param) in params.iter().enumerate() {
            frame.write(i + 1, param.clone())?;
        }
        Ok(())
    }

    /// Execute one segment's program counters against the persistent frame.
    ///
    /// The persistent frame joins the regular frame stack for the duration of
    /// the run, so nested bytecode calls behave exactly as in the normal
    /// dispatch loop.  Reaching a Ret inside a segment means the segment map
    /// disagrees with the executable and is an error; only `get_output`
    /// observes the final Ret.
    pub fn segment_run(&mut self, segment_id: usize) -> Result<(), VmError> {
        if !self.segments.initialized {
            return Err(SegmentError::NotLoaded.into());
        }
        let segment_count = self.segments.per_segment_pcs.len();
        if segment_id >= segment_count {
            return Err(SegmentError::SegmentOutOfRange {
                id: segment_id,
                len: segment_count,
            }
            .into());
        }
        if segment_id as i64 > self.segments.prev_segment_id + 1 {
            warn!(
                "segment skipped (segment_id: {}, prev_segment_id: {})",
                segment_id, self.segments.prev_segment_id
            );
        }

        let frame = self
            .segments
            .frame
            .take()
            .ok_or(SegmentError::MissingFrame)?;
        self.frames.push(frame);
        let result = self.run_segment_pcs(segment_id);
        // Reclaim the persistent frame with its contents intact, even when a
        // program counter faulted mid-segment.
        if let Some(frame) = self.frames.pop() {
            self.segments.frame = Some(frame);
        }
        result?;

        self.segments.prev_segment_id = if segment_id == segment_count - 1 {
            -1
        } else {
            segment_id as i64
        };
        Ok(())
    }

    fn run_segment_pcs(&mut self, segment_id: usize) -> Result<(), VmError> {
        let exec = self.exec()?.clone();
        let pcs = self.segments.per_segment_pcs[segment_id].clone();
        for pc in pcs {
            self.pc = pc;
            let instruction = exec
                .instruction(pc)
                .ok_or(VmError::InvalidPc(pc))?
                .clone();
            match instruction {
                Instruction::Call {
                    dst,
                    func_idx,
                    args,
                } => self.run_instr_call(dst, func_idx, &args)?,
                Instruction::Ret { .. } => return Err(SegmentError::RetBeforeCompletion.into()),
                Instruction::Goto { pc_offset } => self.take_goto(pc_offset)?,
                Instruction::If { cond, false_offset } => self.take_if(cond, false_offset)?,
            }
        }
        Ok(())
    }

    /// Read the inference result: the current PC must point at the entry
    /// function's Ret.  List results are unwrapped one level into a flat
    /// tensor vector.
    pub fn segment_get_output(&mut self) -> Result<Vec<Tensor>, VmError> {
        let exec = self.exec()?.clone();
        let instruction = exec
            .instruction(self.pc)
            .ok_or(VmError::InvalidPc(self.pc))?
            .clone();
        let Instruction::Ret { result } = instruction else {
            return Err(SegmentError::OutputNotReady.into());
        };
        let frame = self
            .segments
            .frame
            .as_ref()
            .ok_or(SegmentError::MissingFrame)?;
        let value = frame.read(result)?;

        let mut output = Vec::new();
        match &value {
            Value::Tensor(tensor) => output.push(tensor.clone()),
            Value::List(items) => {
                for item in items.iter() {
                    if let Value::Tensor(tensor) = item {
                        output.push(tensor.clone());
                    }
                }
            }
            other => {
                return Err(VmError::TypeMismatch {
                    expected: "tensor or list of tensors",
                    found: other.kind(),
                })
            }
        }
        Ok(output)
    }
}

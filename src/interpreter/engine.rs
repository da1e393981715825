// Execution engine for the bytecode VM

use crate::gc::{self, GcStats};
use crate::interpreter::config::VmConfig;
use crate::interpreter::constants::GLOBALS_SCRIPT;
use crate::interpreter::context::{
    ExecFrame, ExecState, ExecutionContext, FrameKind, RunOutcome, StopHandle,
};
use crate::interpreter::errors::{RuntimeError, StopRequest};
use crate::interpreter::kernel::KernelTable;
use crate::interpreter::opcodes::{self, DecodeError, Instruction};
use crate::interpreter::send::{lookup, SelectorLookup};
use crate::memory::segment::SegmentKind;
use crate::memory::value::{Address, SegmentId};
use crate::memory::SegmentManager;
use crate::script::disasm::{self, Symbols};
use crate::script::{ClassTable, ResourceSource, ScriptLayout};
use log::{debug, error, trace};

/// The bytecode interpreter
///
/// Owns the heap, the registers and the kernel table. Every entry point
/// ([`Interpreter::send_selector`], [`Interpreter::call_export`]) may be called
/// again from inside a kernel function; the nested run returns when its own
/// frames have finished and leaves the caller's frames untouched.
pub struct Interpreter {
    pub(crate) config: VmConfig,
    pub(crate) segments: SegmentManager,
    pub(crate) context: ExecutionContext,
    pub(crate) kernel: KernelTable,
    pub(crate) resources: Box<dyn ResourceSource>,
    pub(crate) selector_names: Vec<String>,
    pub(crate) stop: StopHandle,
    pub(crate) state: ExecState,
    pub(crate) strings_segment: SegmentId,
    /// Kernel calls left before the next automatic collection
    pub(crate) gc_countdown: u32,
    pub(crate) steps: u64,
}

impl Interpreter {
    /// Create an interpreter over `resources`
    ///
    /// Allocates the operand stack and the system strings. No script is
    /// loaded yet; see [`Interpreter::game_object`].
    pub fn new(config: VmConfig, resources: Box<dyn ResourceSource>) -> Result<Self, RuntimeError> {
        let mut segments = SegmentManager::new(config.layout());
        *segments.classes_mut() = ClassTable::with_scripts(&resources.class_scripts());
        let stack_segment = segments.allocate_stack(config.stack_size)?;
        let strings_segment = segments.allocate_system_strings()?;

        let kernel_names = resources.kernel_names();
        let kernel = if kernel_names.is_empty() {
            KernelTable::with_builtins()
        } else {
            KernelTable::from_names(&kernel_names)
        };

        debug!(
            "interpreter ready: {} layout, {} kernel functions, stack of {} entries",
            config.version.name(),
            kernel.len(),
            config.stack_size
        );

        Ok(Interpreter {
            gc_countdown: config.gc_interval,
            selector_names: resources.selector_names(),
            config,
            segments,
            context: ExecutionContext::new(stack_segment),
            kernel,
            resources,
            stop: StopHandle::new(),
            state: ExecState::Halted,
            strings_segment,
            steps: 0,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn layout(&self) -> &ScriptLayout {
        self.segments.layout()
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut SegmentManager {
        &mut self.segments
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn acc(&self) -> Address {
        self.context.acc
    }

    pub fn kernel(&self) -> &KernelTable {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut KernelTable {
        &mut self.kernel
    }

    /// Instructions executed so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Handle for stopping the interpreter from another thread
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Ask the running script to unwind before its next instruction
    pub fn request_stop(&self, request: StopRequest) {
        self.stop.request(request);
    }

    pub fn system_strings_segment(&self) -> SegmentId {
        self.strings_segment
    }

    pub fn selector_name(&self, selector: u16) -> Option<&str> {
        self.selector_names
            .get(selector as usize)
            .map(String::as_str)
            .filter(|n| !n.is_empty())
    }

    pub fn selector_id(&self, name: &str) -> Option<u16> {
        self.selector_names
            .iter()
            .position(|n| n == name)
            .map(|i| i as u16)
    }

    // =====================================================================
    // Scripts
    // =====================================================================

    /// Load a script and take a lock on it
    pub fn instantiate_script(&mut self, number: u16) -> Result<SegmentId, RuntimeError> {
        self.segments
            .instantiate_script(number, self.resources.as_ref())
    }

    /// Release a lock taken by [`Interpreter::instantiate_script`]
    pub fn uninstantiate_script(&mut self, number: u16) {
        self.segments.uninstantiate_script(number);
    }

    /// Segment of `number`, instantiating it if it is not resident
    pub fn ensure_script(&mut self, number: u16) -> Result<SegmentId, RuntimeError> {
        match self.segments.script_segment(number) {
            Some(id) => Ok(id),
            None => self.instantiate_script(number),
        }
    }

    /// Address of export `index` of script `number`
    pub fn script_export(&mut self, number: u16, index: usize) -> Result<Address, RuntimeError> {
        let id = self.ensure_script(number)?;
        self.segments
            .script(id)?
            .export_address(index)
            .ok_or_else(|| RuntimeError::KernelArgument {
                name: "export".to_string(),
                message: format!("script {} has no export {}", number, index),
            })
    }

    /// Export 0 of script 0: the game object
    pub fn game_object(&mut self) -> Result<Address, RuntimeError> {
        self.script_export(GLOBALS_SCRIPT, 0)
    }

    /// Address of the class object for `species`, loading its script if needed
    pub fn resolve_class(&mut self, species: u16) -> Result<Address, RuntimeError> {
        if let Some(address) = self.segments.classes().address(species) {
            return Ok(address);
        }
        let script = self
            .segments
            .classes()
            .script(species)
            .ok_or(RuntimeError::ClassNotFound { species })?;
        self.ensure_script(script)?;
        self.segments
            .classes()
            .address(species)
            .ok_or(RuntimeError::ClassNotFound { species })
    }

    // =====================================================================
    // Entry points
    // =====================================================================

    /// Send `selector` with `args` to `object` and run to completion
    ///
    /// Re-entrant: kernel functions use this to call back into scripts.
    pub fn send_selector(
        &mut self,
        object: Address,
        selector: u16,
        args: &[Address],
    ) -> Result<Address, RuntimeError> {
        let depth = self.context.depth();
        let base = self.context.stack_top();
        let saved_rest = std::mem::take(&mut self.context.rest);

        let result = self
            .write_message(base, selector, args)
            .and_then(|words| self.dispatch_send(object, object, base, words))
            .and_then(|_| self.run_frames(depth));

        self.context.rest = saved_rest;
        if result.is_err() {
            self.context.frames.truncate(depth);
        }
        result.map(|_| self.context.acc)
    }

    /// Call export `index` of script `number` as a procedure
    pub fn call_export(
        &mut self,
        number: u16,
        index: usize,
        args: &[Address],
    ) -> Result<Address, RuntimeError> {
        let target = self.script_export(number, index)?;
        let depth = self.context.depth();
        let base = self.context.stack_top();
        let saved_rest = std::mem::take(&mut self.context.rest);

        self.stack_set(base, Address::from_u16(args.len() as u16))?;
        for (i, arg) in args.iter().enumerate() {
            self.stack_set(base + 1 + i, *arg)?;
        }
        let top = base + 1 + args.len();
        let (objp, sendp) = self
            .context
            .current()
            .map_or((Address::NULL, Address::NULL), |f| (f.objp, f.sendp));
        let local_segment = self.segments.script(target.segment)?.locals_segment();
        let result = self
            .push_frame(ExecFrame {
                kind: FrameKind::Call,
                pc: target,
                sp: top,
                fp: top,
                argp: base,
                argc: args.len(),
                objp,
                sendp,
                local_segment,
                selector: None,
            })
            .and_then(|_| self.run_frames(depth));

        self.context.rest = saved_rest;
        if result.is_err() {
            self.context.frames.truncate(depth);
        }
        result.map(|_| self.context.acc)
    }

    /// Top-level send that never fails: errors end in the returned state
    pub fn execute(&mut self, object: Address, selector: u16, args: &[Address]) -> RunOutcome {
        let steps = self.steps;
        let result = self.send_selector(object, selector, args);
        let steps = self.steps - steps;
        match result {
            Ok(acc) => RunOutcome {
                state: ExecState::Halted,
                acc,
                steps,
                error: None,
            },
            Err(RuntimeError::Interrupted(request)) => {
                debug!("run stopped by {:?} after {} steps", request, steps);
                RunOutcome {
                    state: ExecState::for_stop(request),
                    acc: self.context.acc,
                    steps,
                    error: None,
                }
            }
            Err(err) => {
                error!("script aborted: {}", err);
                self.state = ExecState::Aborted;
                RunOutcome {
                    state: ExecState::Aborted,
                    acc: self.context.acc,
                    steps,
                    error: Some(err),
                }
            }
        }
    }

    /// Look up `selector` on `object` and read the property it names
    pub fn get_property(&self, object: Address, selector: u16) -> Result<Address, RuntimeError> {
        match lookup(&self.segments, object, selector)? {
            SelectorLookup::Variable { index, .. } => self.segments.read_property(object, index),
            _ => Err(self.selector_not_found(object, selector)),
        }
    }

    /// Look up `selector` on `object` and write the property it names
    pub fn set_property(
        &mut self,
        object: Address,
        selector: u16,
        value: Address,
    ) -> Result<(), RuntimeError> {
        match lookup(&self.segments, object, selector)? {
            SelectorLookup::Variable { index, .. } => {
                self.segments.write_property(object, index, value)
            }
            _ => Err(self.selector_not_found(object, selector)),
        }
    }

    pub(crate) fn selector_not_found(&self, object: Address, selector: u16) -> RuntimeError {
        RuntimeError::SelectorNotFound {
            object,
            selector,
            name: self.selector_name(selector).map(str::to_string),
        }
    }

    /// Run a collection now
    pub fn collect_garbage(&mut self) -> GcStats {
        self.gc_countdown = self.config.gc_interval;
        gc::run_gc(&mut self.segments, &self.context)
    }

    // =====================================================================
    // Run loop
    // =====================================================================

    /// Execute until the execution stack is back to `base_depth` frames
    pub(crate) fn run_frames(&mut self, base_depth: usize) -> Result<(), RuntimeError> {
        let outer = self.state;
        self.state = ExecState::Running;

        let result = loop {
            if self.context.depth() <= base_depth {
                break Ok(());
            }
            if let Some(request) = self.stop.take() {
                break Err(RuntimeError::Interrupted(request));
            }
            if let Err(err) = self.step() {
                break Err(err);
            }
        };

        match &result {
            Ok(()) => {
                self.state = if outer == ExecState::AwaitingKernelCall {
                    ExecState::AwaitingKernelCall
                } else {
                    ExecState::Halted
                };
            }
            Err(err) => {
                self.context.frames.truncate(base_depth);
                self.state = match err {
                    RuntimeError::Interrupted(request) => ExecState::for_stop(*request),
                    _ => ExecState::Aborted,
                };
            }
        }
        result
    }

    /// Execute one instruction of the current frame
    fn step(&mut self) -> Result<(), RuntimeError> {
        let frame = *self.frame()?;
        if let FrameKind::VarSelector { index } = frame.kind {
            return self.finish_var_selector(&frame, index);
        }

        let pc = frame.pc;
        let inst = {
            let script = self
                .segments
                .script(pc.segment)
                .map_err(|_| RuntimeError::invalid(pc, self.segments.kind(pc.segment), 1))?;
            let inst = opcodes::decode(script.buf(), pc.offset as usize).map_err(|e| match e {
                DecodeError::Invalid(opcode) => RuntimeError::InvalidOpcode { opcode, pc },
                DecodeError::Truncated => RuntimeError::invalid(pc, Some(SegmentKind::Script), 1),
            })?;
            if self.config.trace_instructions {
                let symbols = Symbols {
                    kernels: &[],
                    selectors: &self.selector_names,
                };
                if let Ok((text, _)) =
                    disasm::disassemble_instruction(script.buf(), pc.offset as usize, symbols)
                {
                    trace!(
                        "[{}] {:04x}:{} acc={} sp={}",
                        self.context.depth(),
                        pc.segment,
                        text,
                        self.context.acc,
                        frame.sp
                    );
                }
            }
            inst
        };

        self.frame_mut()?.pc = pc.with_offset_delta(inst.len as i32);
        self.steps += 1;
        self.execute_instruction(&inst, pc)
    }

    fn execute_instruction(&mut self, inst: &Instruction, pc: Address) -> Result<(), RuntimeError> {
        let next = pc.with_offset_delta(inst.len as i32);
        match inst.op {
            opcodes::BNOT..=opcodes::ULE => self.exec_arithmetic(inst.op),

            opcodes::BT | opcodes::BNT | opcodes::JMP => {
                let taken = match inst.op {
                    opcodes::BT => self.context.acc.is_truthy(),
                    opcodes::BNT => !self.context.acc.is_truthy(),
                    _ => true,
                };
                if taken {
                    self.frame_mut()?.pc = next.with_offset_delta(inst.operand(0));
                }
                Ok(())
            }
            opcodes::LDI => {
                self.context.acc = Address::from_i16(inst.operand(0) as i16);
                Ok(())
            }
            opcodes::PUSH => self.push(self.context.acc),
            opcodes::PUSHI => self.push(Address::from_i16(inst.operand(0) as i16)),
            opcodes::TOSS => self.pop().map(|_| ()),
            opcodes::DUP => {
                let top = self.peek()?;
                self.push(top)
            }
            opcodes::LINK => self.exec_link(inst.operand(0) as usize),

            opcodes::CALL => self.exec_call(next, inst.operand(0), inst.operand(1) as usize),
            opcodes::CALLK => self.exec_callk(inst.operand(0) as usize, inst.operand(1) as usize),
            opcodes::CALLB => {
                self.exec_call_export(GLOBALS_SCRIPT, inst.operand(0) as usize, inst.operand(1) as usize)
            }
            opcodes::CALLE => self.exec_call_export(
                inst.operand(0) as u16,
                inst.operand(1) as usize,
                inst.operand(2) as usize,
            ),
            opcodes::RET => self.exec_ret(),
            opcodes::SEND => {
                let target = self.context.acc;
                self.exec_send(target, None, inst.operand(0) as usize)
            }
            opcodes::SELF => {
                let objp = self.frame()?.objp;
                self.exec_send(objp, None, inst.operand(0) as usize)
            }
            opcodes::SUPER => {
                let class = self.resolve_class(inst.operand(0) as u16)?;
                let objp = self.frame()?.objp;
                self.exec_send(class, Some(objp), inst.operand(1) as usize)
            }
            opcodes::CLASS => {
                self.context.acc = self.resolve_class(inst.operand(0) as u16)?;
                Ok(())
            }
            opcodes::REST => self.exec_rest(inst.operand(0) as usize),
            opcodes::LEA => self.exec_lea(inst.operand(0) as u16, inst.operand(1) as usize),

            opcodes::SELF_ID => {
                self.context.acc = self.frame()?.objp;
                Ok(())
            }
            opcodes::PUSH_SELF => {
                let objp = self.frame()?.objp;
                self.push(objp)
            }
            opcodes::PPREV => self.push(self.context.prev),
            opcodes::P_TO_A..=opcodes::DP_TO_S => {
                self.exec_property(inst.op, inst.operand(0) as usize / 2)
            }

            opcodes::LOFSA | opcodes::LOFSS => {
                let offset = if self.layout().lofs_absolute {
                    inst.operand(0) as u16
                } else {
                    next.with_offset_delta(inst.operand(0)).offset
                };
                let address = Address::new(pc.segment, offset);
                if inst.op == opcodes::LOFSA {
                    self.context.acc = address;
                    Ok(())
                } else {
                    self.push(address)
                }
            }
            opcodes::PUSH0 => self.push(Address::from_u16(0)),
            opcodes::PUSH1 => self.push(Address::from_u16(1)),
            opcodes::PUSH2 => self.push(Address::from_u16(2)),

            opcodes::VAR_OPS..=0x7f => self.exec_variable(inst.op, inst.operand(0) as usize),

            _ => Err(RuntimeError::InvalidOpcode {
                opcode: inst.op << 1 | inst.byte_form as u8,
                pc,
            }),
        }
    }

    // =====================================================================
    // Frames and the operand stack
    // =====================================================================

    pub(crate) fn frame(&self) -> Result<&ExecFrame, RuntimeError> {
        self.context
            .current()
            .ok_or_else(|| RuntimeError::invalid(Address::NULL, Some(SegmentKind::Stack), 0))
    }

    pub(crate) fn frame_mut(&mut self) -> Result<&mut ExecFrame, RuntimeError> {
        self.context
            .current_mut()
            .ok_or_else(|| RuntimeError::invalid(Address::NULL, Some(SegmentKind::Stack), 0))
    }

    pub(crate) fn push_frame(&mut self, frame: ExecFrame) -> Result<(), RuntimeError> {
        let depth = self.context.depth() + 1;
        if depth > self.config.max_call_depth {
            return Err(RuntimeError::StackOverflow {
                depth,
                limit: self.config.max_call_depth,
            });
        }
        self.context.frames.push(frame);
        Ok(())
    }

    pub(crate) fn stack_get(&self, index: usize) -> Result<Address, RuntimeError> {
        let stack = self.segments.stack(self.context.stack_segment)?;
        stack.get(index).ok_or(RuntimeError::ValueStackExhausted {
            capacity: stack.capacity(),
        })
    }

    pub(crate) fn stack_set(&mut self, index: usize, value: Address) -> Result<(), RuntimeError> {
        let stack = self.segments.stack_mut(self.context.stack_segment)?;
        if stack.set(index, value) {
            Ok(())
        } else {
            Err(RuntimeError::ValueStackExhausted {
                capacity: stack.capacity(),
            })
        }
    }

    pub(crate) fn push(&mut self, value: Address) -> Result<(), RuntimeError> {
        let sp = self.frame()?.sp;
        self.stack_set(sp, value)?;
        self.frame_mut()?.sp = sp + 1;
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Address, RuntimeError> {
        let sp = self.frame()?.sp;
        if sp == 0 {
            let capacity = self.segments.stack(self.context.stack_segment)?.capacity();
            return Err(RuntimeError::ValueStackExhausted { capacity });
        }
        let value = self.stack_get(sp - 1)?;
        self.frame_mut()?.sp = sp - 1;
        Ok(value)
    }

    pub(crate) fn peek(&self) -> Result<Address, RuntimeError> {
        let sp = self.frame()?.sp;
        if sp == 0 {
            return Ok(Address::NULL);
        }
        self.stack_get(sp - 1)
    }

    /// Store one message (selector, argc, args) at `base`; returns its size in words
    fn write_message(&mut self, base: usize, selector: u16, args: &[Address]) -> Result<usize, RuntimeError> {
        self.stack_set(base, Address::from_u16(selector))?;
        self.stack_set(base + 1, Address::from_u16(args.len() as u16))?;
        for (i, arg) in args.iter().enumerate() {
            self.stack_set(base + 2 + i, *arg)?;
        }
        Ok(2 + args.len())
    }

    fn exec_link(&mut self, temps: usize) -> Result<(), RuntimeError> {
        let sp = self.frame()?.sp;
        for i in 0..temps {
            self.stack_set(sp + i, Address::NULL)?;
        }
        self.frame_mut()?.sp = sp + temps;
        Ok(())
    }

    fn finish_var_selector(&mut self, frame: &ExecFrame, index: usize) -> Result<(), RuntimeError> {
        self.context.frames.pop();
        if frame.argc == 0 {
            self.context.acc = self.segments.read_property(frame.objp, index)?;
        } else {
            let value = self.stack_get(frame.argp + 1)?;
            self.segments.write_property(frame.objp, index, value)?;
        }
        Ok(())
    }

    /// Count down to the next automatic collection
    pub(crate) fn maybe_collect(&mut self) {
        if self.config.gc_interval == 0 {
            return;
        }
        self.gc_countdown = self.gc_countdown.saturating_sub(1);
        if self.gc_countdown == 0 {
            self.collect_garbage();
        }
    }
}

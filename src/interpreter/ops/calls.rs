use crate::interpreter::context::{ExecFrame, ExecState, FrameKind};
use crate::interpreter::engine::Interpreter;
use crate::interpreter::errors::RuntimeError;
use crate::memory::value::Address;
use log::trace;

impl Interpreter {
    /// Locate the argument block of a call with a frame of `frame_bytes`
    ///
    /// Pending `&rest` arguments are folded into the block and its argc.
    /// Returns the index of the argc slot and the final argc.
    fn call_base(&mut self, frame_bytes: usize) -> Result<(usize, usize), RuntimeError> {
        let rest = std::mem::take(&mut self.context.rest);
        let sp = self.frame()?.sp;
        let base = sp
            .checked_sub(frame_bytes / 2 + 1 + rest)
            .ok_or(RuntimeError::ValueStackExhausted {
                capacity: self.segments.stack(self.context.stack_segment)?.capacity(),
            })?;
        let argc = self.stack_get(base)?.offset as usize + rest;
        if rest > 0 {
            self.stack_set(base, Address::from_u16(argc as u16))?;
        }
        Ok((base, argc))
    }

    /// Start a procedure frame at `target`, inheriting the caller's object
    fn enter_procedure(
        &mut self,
        target: Address,
        frame_bytes: usize,
        local_segment: Option<u16>,
    ) -> Result<(), RuntimeError> {
        let (base, argc) = self.call_base(frame_bytes)?;
        let caller = *self.frame()?;
        let top = caller.sp;
        self.push_frame(ExecFrame {
            kind: FrameKind::Call,
            pc: target,
            sp: top,
            fp: top,
            argp: base,
            argc,
            objp: caller.objp,
            sendp: caller.sendp,
            local_segment: local_segment.unwrap_or(caller.local_segment),
            selector: None,
        })?;
        // Caller resumes with the arguments popped
        let depth = self.context.depth();
        self.context.frames[depth - 2].sp = base;
        Ok(())
    }

    /// `call`: local procedure in the current script
    pub(crate) fn exec_call(
        &mut self,
        next: Address,
        displacement: i32,
        frame_bytes: usize,
    ) -> Result<(), RuntimeError> {
        self.enter_procedure(next.with_offset_delta(displacement), frame_bytes, None)
    }

    /// `callb` / `calle`: exported procedure of another script
    ///
    /// The script is loaded if needed but not locked.
    pub(crate) fn exec_call_export(
        &mut self,
        script: u16,
        export: usize,
        frame_bytes: usize,
    ) -> Result<(), RuntimeError> {
        let id = self.segments.load_script(script, self.resources.as_ref())?;
        let loaded = self.segments.script(id)?;
        let target = loaded
            .export_address(export)
            .ok_or_else(|| RuntimeError::ScriptCorrupt {
                script,
                field: "exports",
                detail: format!("no export {}", export),
            })?;
        let locals = loaded.locals_segment();
        self.enter_procedure(target, frame_bytes, Some(locals))
    }

    /// `callk`: run kernel function `index` on the stacked arguments
    ///
    /// The arguments stay on the stack while the function runs so that
    /// re-entrant sends build above them.
    pub(crate) fn exec_callk(&mut self, index: usize, frame_bytes: usize) -> Result<(), RuntimeError> {
        self.maybe_collect();

        let (base, argc) = self.call_base(frame_bytes)?;
        let args = (1..=argc)
            .map(|i| self.stack_get(base + i))
            .collect::<Result<Vec<_>, _>>()?;
        let entry = self
            .kernel
            .get(index)
            .ok_or(RuntimeError::UnknownKernelCall { index })?;
        let func = entry.func.clone();
        trace!("kernel {}({} args)", entry.name, argc);

        let depth = self.context.depth();
        self.state = ExecState::AwaitingKernelCall;
        let result = func(self, &args);
        self.state = ExecState::Running;
        self.context.frames.truncate(depth);

        self.context.acc = result?;
        self.frame_mut()?.sp = base;
        Ok(())
    }

    pub(crate) fn exec_ret(&mut self) -> Result<(), RuntimeError> {
        self.context.frames.pop();
        Ok(())
    }

    /// `&rest`: forward parameters `first..=argc` to the next call
    pub(crate) fn exec_rest(&mut self, first: usize) -> Result<(), RuntimeError> {
        let frame = *self.frame()?;
        let mut count = 0;
        for i in first..=frame.argc {
            let value = self.stack_get(frame.argp + i)?;
            self.push(value)?;
            count += 1;
        }
        self.context.rest = count;
        Ok(())
    }
}

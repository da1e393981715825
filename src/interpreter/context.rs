//! Interpreter registers and the execution stack
//!
//! All mutable per-run state lives in one [`ExecutionContext`]: the
//! accumulator, the previous-value register, the pending `&rest` count and the
//! stack of [`ExecFrame`]s. The operand stack itself is a heap segment; frames
//! only record indices into it.
//!
//! # Frame layout on the operand stack
//!
//! ```text
//! argp ─▶ argc            param 0
//!         arg 1 .. argc   params 1..
//! fp   ─▶ temp 0 ..       reserved by `link`
//! sp   ─▶ next free slot
//! ```

use super::errors::{RuntimeError, StopRequest};
use crate::memory::value::{Address, SegmentId};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Coarse interpreter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Running,
    /// A kernel function is executing (and may re-enter the interpreter)
    AwaitingKernelCall,
    Halted,
    Aborted,
    Restarting,
    LoadingSavedState,
}

impl ExecState {
    pub(crate) fn for_stop(request: StopRequest) -> Self {
        match request {
            StopRequest::Abort => ExecState::Aborted,
            StopRequest::Restart => ExecState::Restarting,
            StopRequest::RestoreGame => ExecState::LoadingSavedState,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `call`, `callb` or `calle` into a procedure
    Call,
    /// Method invoked by a send
    Method,
    /// Pending property access from a send; `index` is the property slot
    VarSelector { index: usize },
}

/// One execution stack entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecFrame {
    pub kind: FrameKind,
    pub pc: Address,
    /// Operand stack pointer (next free slot)
    pub sp: usize,
    /// First temporary
    pub fp: usize,
    /// Slot holding argc; parameters follow it
    pub argp: usize,
    pub argc: usize,
    /// Object whose properties `self` refers to
    pub objp: Address,
    /// Object the message was sent to
    pub sendp: Address,
    /// Locals segment of the script owning the code, 0 if none
    pub local_segment: SegmentId,
    /// Selector that started this frame
    pub selector: Option<u16>,
}

/// Registers and execution stack of one VM
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub stack_segment: SegmentId,
    pub frames: Vec<ExecFrame>,
    pub acc: Address,
    pub prev: Address,
    /// Extra arguments pushed by `&rest` for the next call
    pub rest: usize,
}

impl ExecutionContext {
    pub fn new(stack_segment: SegmentId) -> Self {
        ExecutionContext {
            stack_segment,
            frames: Vec::new(),
            acc: Address::NULL,
            prev: Address::NULL,
            rest: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// First free operand stack slot
    pub fn stack_top(&self) -> usize {
        self.frames.last().map_or(0, |f| f.sp)
    }

    pub fn current(&self) -> Option<&ExecFrame> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut ExecFrame> {
        self.frames.last_mut()
    }
}

const STOP_NONE: u8 = 0;
const STOP_ABORT: u8 = 1;
const STOP_RESTART: u8 = 2;
const STOP_RESTORE: u8 = 3;

/// Cross-thread handle used to stop a running interpreter
///
/// The interpreter polls it before every instruction.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicU8>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, request: StopRequest) {
        let value = match request {
            StopRequest::Abort => STOP_ABORT,
            StopRequest::Restart => STOP_RESTART,
            StopRequest::RestoreGame => STOP_RESTORE,
        };
        self.flag.store(value, Ordering::SeqCst);
    }

    pub fn abort(&self) {
        self.request(StopRequest::Abort);
    }

    pub fn pending(&self) -> Option<StopRequest> {
        match self.flag.load(Ordering::SeqCst) {
            STOP_ABORT => Some(StopRequest::Abort),
            STOP_RESTART => Some(StopRequest::Restart),
            STOP_RESTORE => Some(StopRequest::RestoreGame),
            _ => None,
        }
    }

    /// Consume the pending request
    pub fn take(&self) -> Option<StopRequest> {
        let request = self.pending();
        if request.is_some() {
            self.clear();
        }
        request
    }

    pub fn clear(&self) {
        self.flag.store(STOP_NONE, Ordering::SeqCst);
    }
}

/// How a top-level run ended
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub state: ExecState,
    pub acc: Address,
    /// Instructions executed
    pub steps: u64,
    /// The fatal error, for `Aborted` runs that failed
    pub error: Option<RuntimeError>,
}

impl RunOutcome {
    pub fn is_halted(&self) -> bool {
        self.state == ExecState::Halted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_handle_is_shared() {
        let handle = StopHandle::new();
        let other = handle.clone();
        assert_eq!(handle.pending(), None);
        other.request(StopRequest::Restart);
        assert_eq!(handle.pending(), Some(StopRequest::Restart));
        handle.clear();
        assert_eq!(other.pending(), None);
    }

    #[test]
    fn test_empty_context_top_is_zero() {
        let ctx = ExecutionContext::new(3);
        assert_eq!(ctx.stack_top(), 0);
        assert!(ctx.current().is_none());
        assert_eq!(ExecState::for_stop(StopRequest::RestoreGame), ExecState::LoadingSavedState);
    }
}

//! Bytecode interpreter
//!
//! This module provides the execution side of the VM:
//! - [`engine`]: the [`Interpreter`], its run loop and entry points
//! - [`send`]: selector lookup and message dispatch
//! - [`ops`]: instruction handlers by family
//! - [`opcodes`]: instruction encoding and decoding
//! - [`kernel`] and [`builtins`]: the `callk` function table
//! - [`context`]: registers, frames and the stop handle
//! - [`errors`]: runtime error types
//!
//! # Execution Model
//!
//! Execution is driven by the frame stack. A top-level call (or a kernel
//! function calling back into scripts) records the current depth and steps
//! instructions until the stack unwinds to that depth, so nested runs finish
//! before their caller resumes. Errors unwind only the frames the failing run
//! pushed.

pub mod builtins;
pub mod config;
pub mod constants;
pub mod context;
pub mod engine;
pub mod errors;
pub mod kernel;
pub mod opcodes;
pub mod ops;
pub mod send;

pub use config::VmConfig;
pub use context::{ExecState, RunOutcome, StopHandle};
pub use engine::Interpreter;
pub use errors::{RuntimeError, StopRequest};
pub use kernel::{KernelFn, KernelTable};
pub use send::{lookup, SelectorLookup};

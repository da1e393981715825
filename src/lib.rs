//! # Introduction
//!
//! scivm runs the compiled object-oriented bytecode of retro adventure games.
//! Every value a script can see is a `segment:offset` address into a
//! segmented heap; the interpreter sends messages between objects whose
//! layout is read straight out of the script resources.
//!
//! ## Execution pipeline
//!
//! ```text
//! Resources → Loader → Segments → Interpreter ⇄ Kernel
//!                          ↑            │
//!                          └──── GC ────┘
//! ```
//!
//! 1. [`script`]: loads script resources in either supported format,
//!    instantiates their objects and classes, and builds or disassembles
//!    bytecode.
//! 2. [`memory`]: the [`memory::value::Address`] type and the
//!    [`memory::SegmentManager`] that owns every segment: scripts, locals,
//!    the operand stack, clone/list/node/hunk pools, dynamic memory and
//!    system strings.
//! 3. [`interpreter`]: decodes and executes instructions, resolves selectors
//!    along the superclass chain and calls kernel functions.
//! 4. [`gc`]: mark-and-sweep over canonical addresses, triggered
//!    periodically from kernel calls or on request.
//!
//! ## Supported formats
//!
//! Pre-1.1 scripts (one block-structured resource per script) and 1.1+
//! scripts (separate script and heap resources), selected by
//! [`script::ScriptVersion`].

pub mod gc;
pub mod interpreter;
pub mod memory;
pub mod script;

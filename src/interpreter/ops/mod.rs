//! Instruction handlers, grouped by family
//!
//! Each submodule adds `impl Interpreter` methods called from the dispatch
//! in the engine.

pub mod arith;
pub mod calls;
pub mod props;
pub mod vars;

use crate::interpreter::constants::{
    DEFAULT_GC_INTERVAL, DEFAULT_MAX_CALL_DEPTH, DEFAULT_STACK_SIZE,
};
use crate::script::{ScriptLayout, ScriptVersion};

/// Interpreter settings, fixed for the lifetime of a VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Script format of the game; selects the [`ScriptLayout`]
    pub version: ScriptVersion,
    /// Operand stack size in entries
    pub stack_size: usize,
    /// Deepest execution stack allowed before `StackOverflow`
    pub max_call_depth: usize,
    /// Kernel calls between automatic collections; 0 disables them
    pub gc_interval: u32,
    /// Skip sends to missing selectors instead of aborting
    pub continue_on_invalid_selector: bool,
    /// Log every executed instruction at trace level
    pub trace_instructions: bool,
}

impl VmConfig {
    pub fn layout(&self) -> ScriptLayout {
        ScriptLayout::for_version(self.version)
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            version: ScriptVersion::Sci0,
            stack_size: DEFAULT_STACK_SIZE,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            gc_interval: DEFAULT_GC_INTERVAL,
            continue_on_invalid_selector: false,
            trace_instructions: false,
        }
    }
}

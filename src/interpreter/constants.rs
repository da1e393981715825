// Constants for the VM

/// Magic word at the start of every object record
pub const OBJECT_MAGIC: u16 = 0x1234;

/// Info word bit marking a class
pub const INFO_FLAG_CLASS: u16 = 0x8000;

/// Info word bit marking a clone
pub const INFO_FLAG_CLONE: u16 = 0x0001;

/// Superclass slot value meaning "root of the hierarchy"
pub const NO_SUPERCLASS: u16 = 0xffff;

/// Default operand stack size in entries
pub const DEFAULT_STACK_SIZE: usize = 0x1000;

/// Default execution stack depth limit
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Kernel calls between automatic garbage collections
pub const DEFAULT_GC_INTERVAL: u32 = 500;

/// Script whose locals are the global variables
pub const GLOBALS_SCRIPT: u16 = 0;

/// Accumulator value left behind when an invalid selector is skipped
pub const INVALID_SELECTOR_RESULT: crate::memory::value::Address =
    crate::memory::value::Address::NULL;

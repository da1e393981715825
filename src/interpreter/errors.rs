//! Runtime error types for the VM
//!
//! This module defines [`RuntimeError`], which represents every failure the
//! heap manager, the script loader and the interpreter can report.
//!
//! Most errors are fatal: they unwind the running script to the `Aborted`
//! state. [`RuntimeError::SelectorNotFound`] is the exception; the interpreter
//! may resolve it locally when configured to continue past invalid selectors.
//! [`RuntimeError::Interrupted`] is not a failure at all but the signal used to
//! unwind nested runs after an abort, restart or restore request.

use crate::memory::segment::SegmentKind;
use crate::memory::value::Address;
use std::fmt;

/// Why a run was stopped from outside the instruction stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    Abort,
    Restart,
    RestoreGame,
}

/// Which variable array an access targeted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Global,
    Local,
    Temp,
    Param,
}

impl VariableKind {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => VariableKind::Global,
            1 => VariableKind::Local,
            2 => VariableKind::Temp,
            _ => VariableKind::Param,
        }
    }

    /// Two-bit encoding used by variable ops and `lea`
    pub fn bits(&self) -> u8 {
        match self {
            VariableKind::Global => 0,
            VariableKind::Local => 1,
            VariableKind::Temp => 2,
            VariableKind::Param => 3,
        }
    }
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VariableKind::Global => "global",
            VariableKind::Local => "local",
            VariableKind::Temp => "temp",
            VariableKind::Param => "param",
        };
        f.write_str(name)
    }
}

/// Errors raised by the heap, the loader and the interpreter
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Dereference of a freed or out-of-range segment, slot or offset
    InvalidAddress {
        address: Address,
        kind: Option<SegmentKind>,
        requested: usize,
    },

    /// Object or table extents do not fit the script buffer
    ScriptCorrupt {
        script: u16,
        field: &'static str,
        detail: String,
    },

    /// The resource collaborator has no bytes for this script
    ScriptNotFound { script: u16 },

    /// Selector lookup reached the end of the superclass chain
    SelectorNotFound {
        object: Address,
        selector: u16,
        name: Option<String>,
    },

    /// Execution stack exceeded its configured depth
    StackOverflow { depth: usize, limit: usize },

    /// Operand stack pointer left the stack segment
    ValueStackExhausted { capacity: usize },

    /// Segment table or pool exhausted
    OutOfMemory { requested: usize, context: String },

    /// Property index beyond the object's property array
    PropertyOutOfRange {
        object: Address,
        index: usize,
        count: usize,
    },

    /// Variable index beyond its array
    VariableOutOfRange {
        kind: VariableKind,
        index: usize,
        count: usize,
    },

    /// Arithmetic or comparison applied to an operand it cannot take
    InvalidOperand { opcode: &'static str, value: Address },

    /// Undefined opcode byte
    InvalidOpcode { opcode: u8, pc: Address },

    /// `callk` index beyond the kernel table
    UnknownKernelCall { index: usize },

    /// A kernel function rejected its arguments
    KernelArgument { name: String, message: String },

    /// Species number with no class registered or loadable
    ClassNotFound { species: u16 },

    /// Address expected to name an object does not
    NotAnObject { address: Address },

    /// Run unwound by an abort, restart or restore request
    Interrupted(StopRequest),
}

impl RuntimeError {
    /// Errors the interpreter can resolve without aborting
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RuntimeError::SelectorNotFound { .. })
    }

    /// Errors raised while loading a script rather than running it
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            RuntimeError::ScriptCorrupt { .. }
                | RuntimeError::ScriptNotFound { .. }
                | RuntimeError::OutOfMemory { .. }
        )
    }

    pub(crate) fn invalid(address: Address, kind: Option<SegmentKind>, requested: usize) -> Self {
        RuntimeError::InvalidAddress {
            address,
            kind,
            requested,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::InvalidAddress {
                address,
                kind,
                requested,
            } => {
                write!(f, "Invalid address {}", address)?;
                if let Some(kind) = kind {
                    write!(f, " in {} segment", kind)?;
                }
                write!(f, " ({} bytes requested)", requested)
            }
            RuntimeError::ScriptCorrupt {
                script,
                field,
                detail,
            } => {
                write!(f, "Script {} corrupt: {}: {}", script, field, detail)
            }
            RuntimeError::ScriptNotFound { script } => {
                write!(f, "Script {} not found", script)
            }
            RuntimeError::SelectorNotFound {
                object,
                selector,
                name,
            } => match name {
                Some(name) => write!(
                    f,
                    "Object {} has no selector '{}' ({})",
                    object, name, selector
                ),
                None => write!(f, "Object {} has no selector {}", object, selector),
            },
            RuntimeError::StackOverflow { depth, limit } => {
                write!(
                    f,
                    "Stack overflow: call depth {} exceeds limit {}",
                    depth, limit
                )
            }
            RuntimeError::ValueStackExhausted { capacity } => {
                write!(f, "Operand stack exhausted ({} entries)", capacity)
            }
            RuntimeError::OutOfMemory { requested, context } => {
                write!(
                    f,
                    "Out of memory: {} ({} requested)",
                    context, requested
                )
            }
            RuntimeError::PropertyOutOfRange {
                object,
                index,
                count,
            } => {
                write!(
                    f,
                    "Property {} out of range for object {} with {} properties",
                    index, object, count
                )
            }
            RuntimeError::VariableOutOfRange { kind, index, count } => {
                write!(
                    f,
                    "{} variable {} out of range ({} available)",
                    kind, index, count
                )
            }
            RuntimeError::InvalidOperand { opcode, value } => {
                write!(f, "Invalid operand {} for {}", value, opcode)
            }
            RuntimeError::InvalidOpcode { opcode, pc } => {
                write!(f, "Invalid opcode 0x{:02x} at {}", opcode, pc)
            }
            RuntimeError::UnknownKernelCall { index } => {
                write!(f, "Kernel call {} is not in the kernel table", index)
            }
            RuntimeError::KernelArgument { name, message } => {
                write!(f, "Kernel {}: {}", name, message)
            }
            RuntimeError::ClassNotFound { species } => {
                write!(f, "Class {} is not registered", species)
            }
            RuntimeError::NotAnObject { address } => {
                write!(f, "{} is not an object", address)
            }
            RuntimeError::Interrupted(request) => {
                write!(f, "Execution interrupted: {:?}", request)
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

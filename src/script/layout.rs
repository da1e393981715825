//! Version-dependent binary layout
//!
//! Script resources come in two on-disk shapes. Everything that differs
//! between them (buffer sizing, header offsets, which property slot holds the
//! species or the info word, how `lofsa` operands are interpreted) is
//! collected here in a single [`ScriptLayout`] chosen once per game and passed
//! explicitly to the loader, the object model and the interpreter.

use crate::interpreter::errors::RuntimeError;

/// On-disk script format family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptVersion {
    /// Block-structured scripts with a two-word header (pre-1.1)
    Sci0,
    /// Separate script and heap resources combined into one buffer (1.1+)
    Sci11,
}

impl ScriptVersion {
    pub fn name(&self) -> &'static str {
        match self {
            ScriptVersion::Sci0 => "sci0",
            ScriptVersion::Sci11 => "sci11",
        }
    }
}

impl std::str::FromStr for ScriptVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sci0" | "0" => Ok(ScriptVersion::Sci0),
            "sci11" | "sci1.1" | "1.1" => Ok(ScriptVersion::Sci11),
            other => Err(format!("unknown script version '{}'", other)),
        }
    }
}

/// Block types of a pre-1.1 script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Terminator = 0,
    Object = 1,
    Code = 2,
    Synonyms = 3,
    Said = 4,
    Strings = 5,
    Class = 6,
    Exports = 7,
    Pointers = 8,
    PreloadText = 9,
    LocalVars = 10,
}

impl BlockType {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => BlockType::Terminator,
            1 => BlockType::Object,
            2 => BlockType::Code,
            3 => BlockType::Synonyms,
            4 => BlockType::Said,
            5 => BlockType::Strings,
            6 => BlockType::Class,
            7 => BlockType::Exports,
            8 => BlockType::Pointers,
            9 => BlockType::PreloadText,
            10 => BlockType::LocalVars,
            _ => return None,
        })
    }
}

/// Property slot positions and header constants for one format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptLayout {
    pub version: ScriptVersion,
    /// Bytes before the first block (pre-1.1) or the export table (1.1)
    pub header_size: usize,
    pub species_slot: usize,
    pub superclass_slot: usize,
    pub info_slot: usize,
    pub name_slot: usize,
    /// Fewest property slots a well-formed object can declare
    pub min_var_count: usize,
    /// Bytes between an object block's body and the object base (pre-1.1)
    pub object_header_size: usize,
    /// `lofsa`/`lofss` operands are absolute buffer offsets rather than
    /// relative to the next instruction
    pub lofs_absolute: bool,
}

impl ScriptLayout {
    pub const SCI0: ScriptLayout = ScriptLayout {
        version: ScriptVersion::Sci0,
        header_size: 4,
        species_slot: 0,
        superclass_slot: 1,
        info_slot: 2,
        name_slot: 3,
        min_var_count: 4,
        object_header_size: 8,
        lofs_absolute: false,
    };

    pub const SCI11: ScriptLayout = ScriptLayout {
        version: ScriptVersion::Sci11,
        header_size: 8,
        species_slot: 5,
        superclass_slot: 6,
        info_slot: 7,
        name_slot: 8,
        min_var_count: 9,
        object_header_size: 0,
        lofs_absolute: true,
    };

    pub const fn for_version(version: ScriptVersion) -> ScriptLayout {
        match version {
            ScriptVersion::Sci0 => ScriptLayout::SCI0,
            ScriptVersion::Sci11 => ScriptLayout::SCI11,
        }
    }

    /// Declared local-variable count of a pre-1.1 script (header word 0)
    pub fn declared_locals(script: &[u8]) -> Option<usize> {
        read_u16(script, 0).map(|n| n as usize)
    }

    /// Padding inserted after the script part so the heap stays word-aligned
    pub fn heap_padding(script_len: usize) -> usize {
        script_len & 1
    }

    /// Size of the combined in-memory buffer for a script
    ///
    /// Pre-1.1: `script_bytes + 2 * declared_locals`.
    /// 1.1+: `script_bytes + padding + heap_bytes`.
    pub fn buffer_size(
        &self,
        script_number: u16,
        script: &[u8],
        heap: Option<&[u8]>,
    ) -> Result<usize, RuntimeError> {
        match self.version {
            ScriptVersion::Sci0 => {
                let locals =
                    Self::declared_locals(script).ok_or_else(|| RuntimeError::ScriptCorrupt {
                        script: script_number,
                        field: "header",
                        detail: format!("resource is {} bytes, header needs 2", script.len()),
                    })?;
                Ok(script.len() + 2 * locals)
            }
            ScriptVersion::Sci11 => {
                let heap = heap.ok_or(RuntimeError::ScriptNotFound {
                    script: script_number,
                })?;
                Ok(script.len() + Self::heap_padding(script.len()) + heap.len())
            }
        }
    }
}

impl Default for ScriptLayout {
    fn default() -> Self {
        ScriptLayout::SCI0
    }
}

/// Little-endian word at `offset`, if in bounds
pub fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Store a little-endian word, returning `false` if out of bounds
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) -> bool {
    match offset
        .checked_add(2)
        .and_then(|end| buf.get_mut(offset..end))
    {
        Some(slot) => {
            slot.copy_from_slice(&value.to_le_bytes());
            true
        }
        None => false,
    }
}

//! Raw byte blocks
//!
//! This module provides the byte-addressed storage used by three segment
//! kinds:
//! - [`MemBlock`]: one buffer with a human-readable description, used for
//!   script-requested dynamic memory and for hunk pool entries
//! - [`SystemStrings`]: the small fixed table of kernel scratch strings
//!
//! # Error Handling
//!
//! Reads and writes never clip silently. An access that does not fit the
//! buffer returns `None`/`false` and the segment manager turns that into an
//! `InvalidAddress` error carrying the requested size.

/// A block of raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemBlock {
    pub description: String,
    pub data: Vec<u8>,
}

impl MemBlock {
    pub fn new(size: usize, description: impl Into<String>) -> Self {
        MemBlock {
            description: description.into(),
            data: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Read bytes from the block
    pub fn read_bytes(&self, offset: usize, size: usize) -> Option<&[u8]> {
        let end = offset.checked_add(size)?;
        self.data.get(offset..end)
    }

    /// Write bytes to the block
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> bool {
        match offset
            .checked_add(bytes.len())
            .and_then(|end| self.data.get_mut(offset..end))
        {
            Some(slot) => {
                slot.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }
}

/// Number of system string slots
pub const SYS_STRINGS_MAX: usize = 4;
/// Capacity of each system string, including the terminator
pub const SYS_STRING_SIZE: usize = 1024;

pub const SYS_STRING_SAVEDIR: usize = 0;
pub const SYS_STRING_PARSER_BASE: usize = 1;

/// One mutable kernel scratch string
#[derive(Debug, Clone)]
pub struct SystemString {
    pub name: &'static str,
    pub data: Vec<u8>,
}

impl SystemString {
    fn new(name: &'static str) -> Self {
        SystemString {
            name,
            data: vec![0; SYS_STRING_SIZE],
        }
    }

    /// Contents up to the first NUL
    pub fn value(&self) -> &[u8] {
        let end = self.data.iter().position(|&b| b == 0).unwrap_or(self.data.len());
        &self.data[..end]
    }

    /// Replace the contents, truncating to fit with a terminator
    pub fn set(&mut self, value: &[u8]) {
        let len = value.len().min(SYS_STRING_SIZE - 1);
        self.data.fill(0);
        self.data[..len].copy_from_slice(&value[..len]);
    }
}

/// Fixed-size table of scratch strings; string `i` is addressed at offset `i`
#[derive(Debug, Clone)]
pub struct SystemStrings {
    pub strings: Vec<SystemString>,
}

impl SystemStrings {
    pub fn new() -> Self {
        let names = ["savedir", "parser-base", "scratch-1", "scratch-2"];
        SystemStrings {
            strings: names.iter().map(|n| SystemString::new(n)).collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&SystemString> {
        self.strings.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut SystemString> {
        self.strings.get_mut(index)
    }
}

impl Default for SystemStrings {
    fn default() -> Self {
        Self::new()
    }
}

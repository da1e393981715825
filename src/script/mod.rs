//! Scripts: compiled code plus the objects and classes defined with it
//!
//! - [`layout`]: version-dependent header offsets and buffer sizing
//! - [`loader`]: turning resource bytes into a [`Script`] segment payload
//! - [`object`]: the instantiated [`Object`] records
//! - [`classes`]: the global species → class table
//! - [`resource`]: the collaborator that supplies script bytes
//! - [`builder`]: assembling script resources in either format
//! - [`disasm`]: instruction listing for traces and tooling

pub mod builder;
pub mod classes;
pub mod disasm;
pub mod layout;
pub mod loader;
pub mod object;
pub mod resource;

pub use builder::{Asm, BuildError, Label, ObjectDef, PropValue, ScriptBuilder};
pub use classes::{ClassEntry, ClassTable};
pub use layout::{ScriptLayout, ScriptVersion};
pub use object::{Method, Object};
pub use resource::{DirectoryResources, MemoryResources, ResourceSource};

use crate::interpreter::errors::RuntimeError;
use crate::memory::value::{Address, SegmentId};
use rustc_hash::FxHashMap;
use std::ops::Range;

/// Said-parser word substitution declared by a script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Synonym {
    pub replaced: u16,
    pub replacement: u16,
}

/// A loaded script: its buffer, exports and instantiated objects
#[derive(Debug, Clone)]
pub struct Script {
    number: u16,
    segment: SegmentId,
    buf: Vec<u8>,
    /// Length of the script part; equals the resource size for pre-1.1
    script_size: usize,
    /// Offset of the heap part (1.1+) or of the locals image (pre-1.1)
    heap_start: usize,
    exports: Vec<u16>,
    synonyms: Vec<Synonym>,
    objects: Vec<Object>,
    object_offsets: FxHashMap<u16, usize>,
    locals_segment: SegmentId,
    code_ranges: Vec<Range<usize>>,
    lockers: u32,
    marked_deleted: bool,
    /// Holds locks on the scripts defining its superclasses
    holds_superclasses: bool,
}

impl Script {
    /// A script with no buffer yet
    pub fn empty(number: u16) -> Self {
        Script {
            number,
            segment: 0,
            buf: Vec::new(),
            script_size: 0,
            heap_start: 0,
            exports: Vec::new(),
            synonyms: Vec::new(),
            objects: Vec::new(),
            object_offsets: FxHashMap::default(),
            locals_segment: 0,
            code_ranges: Vec::new(),
            lockers: 0,
            marked_deleted: false,
            holds_superclasses: false,
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn script_size(&self) -> usize {
        self.script_size
    }

    pub fn heap_start(&self) -> usize {
        self.heap_start
    }

    pub fn exports(&self) -> &[u16] {
        &self.exports
    }

    /// Address of export `index`, if declared
    pub fn export_address(&self, index: usize) -> Option<Address> {
        self.exports
            .get(index)
            .map(|&offset| Address::new(self.segment, offset))
    }

    pub fn synonyms(&self) -> &[Synonym] {
        &self.synonyms
    }

    pub fn code_ranges(&self) -> &[Range<usize>] {
        &self.code_ranges
    }

    pub fn objects(&self) -> &[Object] {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut [Object] {
        &mut self.objects
    }

    pub fn object(&self, id: usize) -> Option<&Object> {
        self.objects.get(id)
    }

    /// Object index for the record based at `offset`
    pub fn object_index(&self, offset: u16) -> Option<usize> {
        self.object_offsets.get(&offset).copied()
    }

    pub fn object_at(&self, offset: u16) -> Option<&Object> {
        self.object_index(offset).map(|i| &self.objects[i])
    }

    pub fn object_at_mut(&mut self, offset: u16) -> Option<&mut Object> {
        let index = self.object_index(offset)?;
        self.objects.get_mut(index)
    }

    /// Instantiate the record based at `offset`, once
    ///
    /// A second call for the same offset returns the existing index without
    /// touching the object list.
    pub fn instantiate_object(
        &mut self,
        layout: &ScriptLayout,
        offset: u16,
    ) -> Result<usize, RuntimeError> {
        if let Some(index) = self.object_index(offset) {
            return Ok(index);
        }
        let object = Object::parse(
            layout,
            self.number,
            self.segment,
            &self.buf,
            self.script_size,
            offset as usize,
        )?;
        let index = self.objects.len();
        self.objects.push(object);
        self.object_offsets.insert(offset, index);
        Ok(index)
    }

    pub fn locals_segment(&self) -> SegmentId {
        self.locals_segment
    }

    pub(crate) fn set_locals_segment(&mut self, segment: SegmentId) {
        self.locals_segment = segment;
    }

    pub fn lockers(&self) -> u32 {
        self.lockers
    }

    pub fn increment_lockers(&mut self) {
        self.lockers += 1;
    }

    pub fn decrement_lockers(&mut self) {
        self.lockers = self.lockers.saturating_sub(1);
    }

    pub fn is_marked_deleted(&self) -> bool {
        self.marked_deleted
    }

    pub fn mark_deleted(&mut self) {
        self.marked_deleted = true;
    }

    pub fn unmark_deleted(&mut self) {
        self.marked_deleted = false;
    }

    pub fn holds_superclasses(&self) -> bool {
        self.holds_superclasses
    }

    pub(crate) fn set_holds_superclasses(&mut self, holds: bool) {
        self.holds_superclasses = holds;
    }

    /// NUL-terminated string starting at `offset`
    pub fn read_cstring(&self, offset: usize) -> Option<String> {
        let bytes = self.buf.get(offset..)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

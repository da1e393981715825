//! Segment manager
//!
//! The [`SegmentManager`] owns every heap segment and is the only way to turn
//! an [`Address`] into data. It keeps:
//! - the segment table (index = segment id, slot 0 permanently empty so that
//!   `0:n` can mean "the number n")
//! - the reverse map from script number to segment id
//! - the class table, since class addresses point into script segments
//! - the current pool segment for clones, lists, nodes and hunks
//!
//! # Dereferencing
//!
//! [`SegmentManager::dereference`] fails with `InvalidAddress` for a missing
//! segment, a freed pool slot or an offset beyond the segment's data. It never
//! wraps, clips or fabricates data; bulk readers use the reported maximum
//! length to stay in bounds.

use super::heap::{MemBlock, SystemStrings};
use super::segment::{List, Node, Segment, SegmentKind};
use super::stack::{DataStack, LocalsTable};
use super::value::{Address, SegmentId};
use crate::interpreter::constants::GLOBALS_SCRIPT;
use crate::interpreter::errors::RuntimeError;
use crate::script::loader::LoadedScript;
use crate::script::{ClassTable, Object, ResourceSource, Script, ScriptLayout, ScriptVersion};
use log::{debug, warn};
use rustc_hash::FxHashMap;

/// A typed view of the data an address points at
#[derive(Debug, Clone, Copy)]
pub enum Deref<'a> {
    /// Bytes from the address to the end of the region
    Bytes(&'a [u8]),
    /// Value slots from the address to the end of the table
    Values(&'a [Address]),
    Object(&'a Object),
    List(&'a List),
    Node(&'a Node),
}

impl Deref<'_> {
    /// Largest number of bytes a caller may read from this view
    pub fn max_size(&self) -> usize {
        match self {
            Deref::Bytes(bytes) => bytes.len(),
            Deref::Values(values) => values.len() * 2,
            Deref::Object(object) => object.var_count() * 2,
            Deref::List(_) => 4,
            Deref::Node(_) => 8,
        }
    }
}

/// Live entity counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub segments: usize,
    pub scripts: usize,
    pub clones: usize,
    pub lists: usize,
    pub nodes: usize,
    pub hunks: usize,
    pub dynmem_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct SegmentManager {
    segments: Vec<Option<Segment>>,
    script_map: FxHashMap<u16, SegmentId>,
    classes: ClassTable,
    layout: ScriptLayout,
    clones_segment: SegmentId,
    lists_segment: SegmentId,
    nodes_segment: SegmentId,
    hunks_segment: SegmentId,
}

impl SegmentManager {
    pub fn new(layout: ScriptLayout) -> Self {
        SegmentManager {
            segments: vec![None],
            script_map: FxHashMap::default(),
            classes: ClassTable::new(),
            layout,
            clones_segment: 0,
            lists_segment: 0,
            nodes_segment: 0,
            hunks_segment: 0,
        }
    }

    pub fn layout(&self) -> &ScriptLayout {
        &self.layout
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn classes_mut(&mut self) -> &mut ClassTable {
        &mut self.classes
    }

    // ---------------------------------------------------------------------
    // Segment table
    // ---------------------------------------------------------------------

    /// Reserve an id and construct an empty segment of `kind` in it
    pub fn allocate_segment(&mut self, kind: SegmentKind) -> Result<SegmentId, RuntimeError> {
        self.insert(Segment::empty(kind))
    }

    /// Place `segment` in the first free slot, growing the table if needed
    pub fn insert(&mut self, segment: Segment) -> Result<SegmentId, RuntimeError> {
        let reserved = |id: usize, map: &FxHashMap<u16, SegmentId>| {
            map.values().any(|&s| s as usize == id)
        };
        let free = (1..self.segments.len())
            .find(|&id| self.segments[id].is_none() && !reserved(id, &self.script_map));
        let id = match free {
            Some(id) => id,
            None => {
                if self.segments.len() > SegmentId::MAX as usize {
                    return Err(RuntimeError::OutOfMemory {
                        requested: 1,
                        context: format!("segment table full allocating {}", segment.kind()),
                    });
                }
                self.segments.push(None);
                self.segments.len() - 1
            }
        };
        debug!("allocated {} segment {}", segment.kind(), id);
        self.segments[id] = Some(segment);
        Ok(id as SegmentId)
    }

    /// Free a segment; a script takes its locals table with it
    pub fn deallocate(&mut self, id: SegmentId) -> Result<(), RuntimeError> {
        let segment = self
            .segments
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or_else(|| RuntimeError::invalid(Address::new(id, 0), None, 0))?;

        debug!("freeing {} segment {}", segment.kind(), id);
        match segment {
            Segment::Script(script) => {
                if script.locals_segment() != 0 {
                    self.deallocate(script.locals_segment())?;
                }
                if self.script_map.get(&script.number()) == Some(&id) {
                    self.script_map.remove(&script.number());
                }
                self.classes.forget_segment(id);
            }
            Segment::Clones(_) if self.clones_segment == id => self.clones_segment = 0,
            Segment::Lists(_) if self.lists_segment == id => self.lists_segment = 0,
            Segment::Nodes(_) if self.nodes_segment == id => self.nodes_segment = 0,
            Segment::Hunks(_) if self.hunks_segment == id => self.hunks_segment = 0,
            _ => {}
        }
        Ok(())
    }

    pub fn get(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        self.segments.get_mut(id as usize)?.as_mut()
    }

    pub fn is_valid_segment(&self, id: SegmentId) -> bool {
        self.get(id).is_some()
    }

    pub fn kind(&self, id: SegmentId) -> Option<SegmentKind> {
        self.get(id).map(Segment::kind)
    }

    /// Ids of all live segments, ascending
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        (1..self.segments.len())
            .filter(|&id| self.segments[id].is_some())
            .map(|id| id as SegmentId)
            .collect()
    }

    /// First live segment of `kind`
    pub fn find_segment_by_kind(&self, kind: SegmentKind) -> Option<SegmentId> {
        self.segment_ids()
            .into_iter()
            .find(|&id| self.kind(id) == Some(kind))
    }

    /// Whether `address` names live data
    pub fn is_valid_address(&self, address: Address) -> bool {
        self.get(address.segment)
            .is_some_and(|s| s.is_valid_offset(address.offset))
    }

    /// Allocate the operand stack
    pub fn allocate_stack(&mut self, capacity: usize) -> Result<SegmentId, RuntimeError> {
        self.insert(Segment::Stack(DataStack::new(capacity)))
    }

    pub fn allocate_system_strings(&mut self) -> Result<SegmentId, RuntimeError> {
        self.insert(Segment::SystemStrings(SystemStrings::new()))
    }

    pub fn stack(&self, id: SegmentId) -> Result<&DataStack, RuntimeError> {
        match self.get(id) {
            Some(Segment::Stack(stack)) => Ok(stack),
            other => Err(RuntimeError::invalid(Address::new(id, 0), other.map(Segment::kind), 0)),
        }
    }

    pub fn stack_mut(&mut self, id: SegmentId) -> Result<&mut DataStack, RuntimeError> {
        match self.get_mut(id) {
            Some(Segment::Stack(stack)) => Ok(stack),
            other => {
                let kind = other.map(|s| s.kind());
                Err(RuntimeError::invalid(Address::new(id, 0), kind, 0))
            }
        }
    }

    pub fn system_strings_mut(&mut self, id: SegmentId) -> Result<&mut SystemStrings, RuntimeError> {
        match self.get_mut(id) {
            Some(Segment::SystemStrings(strings)) => Ok(strings),
            other => {
                let kind = other.map(|s| s.kind());
                Err(RuntimeError::invalid(Address::new(id, 0), kind, 0))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Scripts
    // ---------------------------------------------------------------------

    /// Segment of a resident script
    pub fn script_segment(&self, number: u16) -> Option<SegmentId> {
        self.script_map.get(&number).copied()
    }

    pub fn script(&self, id: SegmentId) -> Result<&Script, RuntimeError> {
        match self.get(id) {
            Some(Segment::Script(script)) => Ok(script),
            other => Err(RuntimeError::invalid(Address::new(id, 0), other.map(Segment::kind), 0)),
        }
    }

    pub fn script_mut(&mut self, id: SegmentId) -> Result<&mut Script, RuntimeError> {
        match self.get_mut(id) {
            Some(Segment::Script(script)) => Ok(script),
            other => {
                let kind = other.map(|s| s.kind());
                Err(RuntimeError::invalid(Address::new(id, 0), kind, 0))
            }
        }
    }

    pub fn script_by_number(&self, number: u16) -> Option<&Script> {
        self.script_segment(number).and_then(|id| self.script(id).ok())
    }

    /// Resident segment for `number`, loading it if needed
    ///
    /// A resident script is returned as is; callers account for the extra
    /// user through the lock count. A failed load leaves nothing behind.
    pub fn load_script(
        &mut self,
        number: u16,
        resources: &dyn ResourceSource,
    ) -> Result<SegmentId, RuntimeError> {
        if let Some(id) = self.script_segment(number) {
            return Ok(id);
        }

        let bytes = resources
            .script(number)
            .ok_or(RuntimeError::ScriptNotFound { script: number })?;
        let heap = match self.layout.version {
            ScriptVersion::Sci0 => None,
            ScriptVersion::Sci11 => Some(
                resources
                    .heap(number)
                    .ok_or(RuntimeError::ScriptNotFound { script: number })?,
            ),
        };

        let id = self.insert(Segment::Script(Box::new(Script::empty(number))))?;
        let LoadedScript { mut script, locals } =
            match Script::load(&self.layout, number, id, &bytes, heap.as_deref()) {
                Ok(loaded) => loaded,
                Err(err) => {
                    self.segments[id as usize] = None;
                    return Err(err);
                }
            };

        if !locals.is_empty() {
            match self.insert(Segment::Locals(LocalsTable::new(number, locals))) {
                Ok(locals_id) => script.set_locals_segment(locals_id),
                Err(err) => {
                    self.segments[id as usize] = None;
                    return Err(err);
                }
            }
        }

        for object in script.objects().iter().filter(|o| o.is_class()) {
            self.classes.register(object.species(), number, object.pos());
        }

        debug!(
            "loaded script {} into segment {} ({} bytes, {} objects)",
            number,
            id,
            script.len(),
            script.objects().len()
        );
        self.segments[id as usize] = Some(Segment::Script(Box::new(script)));
        self.script_map.insert(number, id);
        Ok(id)
    }

    /// Load a script for use, taking a lock on it
    ///
    /// A script that does not yet hold its superclass scripts locks them too,
    /// loading them through the class table if necessary. Scripts loaded
    /// unlocked by `callb`/`calle`, or revived after being marked for
    /// deletion, take those locks on their next instantiation.
    pub fn instantiate_script(
        &mut self,
        number: u16,
        resources: &dyn ResourceSource,
    ) -> Result<SegmentId, RuntimeError> {
        let resident = self.script_segment(number).is_some();
        let id = self.load_script(number, resources)?;
        let holds = {
            let script = self.script_mut(id)?;
            script.increment_lockers();
            script.unmark_deleted();
            let holds = script.holds_superclasses();
            // Set before recursing so superclass cycles terminate
            script.set_holds_superclasses(true);
            holds
        };
        if holds {
            return Ok(id);
        }

        let mut locked = Vec::new();
        for species in self.superclass_species(id)? {
            let Some(owner) = self.classes.script(species) else {
                warn!("script {}: superclass species {} has no known script", number, species);
                continue;
            };
            if owner == number || locked.contains(&owner) {
                continue;
            }
            if let Err(err) = self.instantiate_script(owner, resources) {
                for &s in &locked {
                    self.uninstantiate_script(s);
                }
                if resident {
                    let script = self.script_mut(id)?;
                    script.decrement_lockers();
                    script.set_holds_superclasses(false);
                    if script.lockers() == 0 {
                        script.mark_deleted();
                    }
                } else {
                    self.deallocate(id)?;
                }
                return Err(err);
            }
            locked.push(owner);
        }
        Ok(id)
    }

    /// Drop a lock; at zero the script is marked for the collector
    ///
    /// Superclass scripts are released only if this script took locks on them.
    pub fn uninstantiate_script(&mut self, number: u16) {
        let Some(id) = self.script_segment(number) else {
            warn!("uninstantiate of script {} which is not loaded", number);
            return;
        };
        let Ok(script) = self.script_mut(id) else {
            return;
        };
        if script.lockers() == 0 && script.is_marked_deleted() {
            return;
        }
        script.decrement_lockers();
        if script.lockers() > 0 {
            return;
        }
        script.mark_deleted();
        let holds = script.holds_superclasses();
        script.set_holds_superclasses(false);
        debug!("script {} marked for deletion", number);
        if !holds {
            return;
        }

        let supers = self.superclass_species(id).unwrap_or_default();
        let mut released = Vec::new();
        for species in supers {
            if let Some(owner) = self.classes.script(species) {
                if owner != number && !released.contains(&owner) {
                    released.push(owner);
                    self.uninstantiate_script(owner);
                }
            }
        }
    }

    fn superclass_species(&self, id: SegmentId) -> Result<Vec<u16>, RuntimeError> {
        let script = self.script(id)?;
        let mut species: Vec<u16> = script
            .objects()
            .iter()
            .filter(|o| o.has_superclass())
            .map(|o| o.superclass_species())
            .collect();
        species.dedup();
        Ok(species)
    }

    /// Instantiate the object record at `offset` of a resident script
    pub fn instantiate_object(
        &mut self,
        script_segment: SegmentId,
        offset: u16,
    ) -> Result<usize, RuntimeError> {
        let layout = self.layout;
        let script = self.script_mut(script_segment)?;
        let index = script.instantiate_object(&layout, offset)?;
        let object = &script.objects()[index];
        if object.is_class() {
            let (species, number, pos) = (object.species(), script.number(), object.pos());
            self.classes.register(species, number, pos);
        }
        Ok(index)
    }

    // ---------------------------------------------------------------------
    // Locals and globals
    // ---------------------------------------------------------------------

    pub fn locals(&self, id: SegmentId) -> Result<&LocalsTable, RuntimeError> {
        match self.get(id) {
            Some(Segment::Locals(locals)) => Ok(locals),
            other => Err(RuntimeError::invalid(Address::new(id, 0), other.map(Segment::kind), 0)),
        }
    }

    pub fn locals_mut(&mut self, id: SegmentId) -> Result<&mut LocalsTable, RuntimeError> {
        match self.get_mut(id) {
            Some(Segment::Locals(locals)) => Ok(locals),
            other => {
                let kind = other.map(|s| s.kind());
                Err(RuntimeError::invalid(Address::new(id, 0), kind, 0))
            }
        }
    }

    /// Locals segment of script 0, which holds the global variables
    pub fn globals_segment(&self) -> Option<SegmentId> {
        let script = self.script_by_number(GLOBALS_SCRIPT)?;
        (script.locals_segment() != 0).then(|| script.locals_segment())
    }

    // ---------------------------------------------------------------------
    // Dereferencing
    // ---------------------------------------------------------------------

    /// Resolve `address` to the data it names
    pub fn dereference(&self, address: Address) -> Result<Deref<'_>, RuntimeError> {
        let segment = self
            .get(address.segment)
            .ok_or_else(|| RuntimeError::invalid(address, None, 0))?;
        let kind = Some(segment.kind());
        let offset = address.offset as usize;
        let invalid = || RuntimeError::invalid(address, kind, 0);

        match segment {
            Segment::Script(script) => script.buf().get(offset..).filter(|b| !b.is_empty()).map(Deref::Bytes),
            Segment::Locals(locals) if offset % 2 == 0 => {
                locals.values.get(offset / 2..).filter(|v| !v.is_empty()).map(Deref::Values)
            }
            Segment::Stack(stack) if offset % 2 == 0 => {
                stack.slice_from(offset / 2).filter(|v| !v.is_empty()).map(Deref::Values)
            }
            Segment::Clones(pool) => pool.get(offset).map(Deref::Object),
            Segment::Lists(pool) => pool.get(offset).map(Deref::List),
            Segment::Nodes(pool) => pool.get(offset).map(Deref::Node),
            Segment::Hunks(pool) => pool.get(offset).map(|b| Deref::Bytes(&b.data)),
            Segment::DynMem(block) => block.data.get(offset..).filter(|b| !b.is_empty()).map(Deref::Bytes),
            Segment::SystemStrings(strings) => strings.get(offset).map(|s| Deref::Bytes(&s.data)),
            _ => None,
        }
        .ok_or_else(invalid)
    }

    /// Read one value slot (or a raw word from byte-addressed memory)
    pub fn read_value(&self, address: Address) -> Result<Address, RuntimeError> {
        match self.dereference(address)? {
            Deref::Values(values) => Ok(values[0]),
            Deref::Bytes(bytes) if bytes.len() >= 2 => {
                Ok(Address::from_u16(u16::from_le_bytes([bytes[0], bytes[1]])))
            }
            _ => Err(RuntimeError::invalid(address, self.kind(address.segment), 2)),
        }
    }

    /// Write one value slot (or a raw word into byte-addressed memory)
    pub fn write_value(&mut self, address: Address, value: Address) -> Result<(), RuntimeError> {
        let kind = self.kind(address.segment);
        if matches!(kind, Some(SegmentKind::Script | SegmentKind::DynMem)) {
            if value.is_pointer() {
                warn!("storing pointer {} as raw word at {}", value, address);
            }
            return self.write_bytes(address, &value.offset.to_le_bytes());
        }

        let offset = address.offset as usize;
        let stored = match self.get_mut(address.segment) {
            Some(Segment::Locals(locals)) if offset % 2 == 0 => locals.set(offset / 2, value),
            Some(Segment::Stack(stack)) if offset % 2 == 0 => stack.set(offset / 2, value),
            _ => false,
        };
        stored
            .then_some(())
            .ok_or_else(|| RuntimeError::invalid(address, kind, 2))
    }

    /// Copy `len` bytes starting at `address`
    pub fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>, RuntimeError> {
        match self.dereference(address)? {
            Deref::Bytes(bytes) if bytes.len() >= len => Ok(bytes[..len].to_vec()),
            _ => Err(RuntimeError::invalid(address, self.kind(address.segment), len)),
        }
    }

    /// Overwrite bytes starting at `address`
    pub fn write_bytes(&mut self, address: Address, data: &[u8]) -> Result<(), RuntimeError> {
        let kind = self.kind(address.segment);
        let offset = address.offset as usize;
        let ok = match self.get_mut(address.segment) {
            Some(Segment::Script(script)) => {
                let buf = script.buf_mut();
                match buf.get_mut(offset..offset + data.len()) {
                    Some(slot) => {
                        slot.copy_from_slice(data);
                        true
                    }
                    None => false,
                }
            }
            Some(Segment::DynMem(block)) => block.write_bytes(offset, data),
            Some(Segment::Hunks(pool)) => pool.get_mut(offset).is_some_and(|b| b.write_bytes(0, data)),
            Some(Segment::SystemStrings(strings)) => match strings.get_mut(offset) {
                Some(s) if data.len() <= s.data.len() => {
                    s.data[..data.len()].copy_from_slice(data);
                    true
                }
                _ => false,
            },
            _ => false,
        };
        ok.then_some(())
            .ok_or_else(|| RuntimeError::invalid(address, kind, data.len()))
    }

    /// NUL-terminated string at `address`
    pub fn read_string(&self, address: Address) -> Result<Vec<u8>, RuntimeError> {
        match self.dereference(address)? {
            Deref::Bytes(bytes) => {
                let end = bytes.iter().position(|&b| b == 0).unwrap_or_else(|| {
                    warn!("string at {} is not terminated", address);
                    bytes.len()
                });
                Ok(bytes[..end].to_vec())
            }
            _ => Err(RuntimeError::invalid(address, self.kind(address.segment), 1)),
        }
    }

    /// Store `value` plus a terminator at `address`
    pub fn write_string(&mut self, address: Address, value: &[u8]) -> Result<(), RuntimeError> {
        let mut data = value.to_vec();
        data.push(0);
        self.write_bytes(address, &data)
    }

    // ---------------------------------------------------------------------
    // Objects
    // ---------------------------------------------------------------------

    /// Object (script object or clone) at `address`
    pub fn object(&self, address: Address) -> Option<&Object> {
        match self.get(address.segment)? {
            Segment::Script(script) => script.object_at(address.offset),
            Segment::Clones(pool) => pool.get(address.offset as usize),
            _ => None,
        }
    }

    pub fn object_mut(&mut self, address: Address) -> Option<&mut Object> {
        match self.get_mut(address.segment)? {
            Segment::Script(script) => script.object_at_mut(address.offset),
            Segment::Clones(pool) => pool.get_mut(address.offset as usize),
            _ => None,
        }
    }

    pub fn is_object(&self, address: Address) -> bool {
        self.object(address).is_some()
    }

    pub fn require_object(&self, address: Address) -> Result<&Object, RuntimeError> {
        self.object(address)
            .ok_or(RuntimeError::NotAnObject { address })
    }

    /// Read property `index` of the object at `address`
    pub fn read_property(&self, address: Address, index: usize) -> Result<Address, RuntimeError> {
        let object = self.require_object(address)?;
        object
            .get_var(index)
            .ok_or(RuntimeError::PropertyOutOfRange {
                object: address,
                index,
                count: object.var_count(),
            })
    }

    pub fn write_property(
        &mut self,
        address: Address,
        index: usize,
        value: Address,
    ) -> Result<(), RuntimeError> {
        let object = self
            .object_mut(address)
            .ok_or(RuntimeError::NotAnObject { address })?;
        let count = object.var_count();
        if object.set_var(index, value) {
            Ok(())
        } else {
            Err(RuntimeError::PropertyOutOfRange {
                object: address,
                index,
                count,
            })
        }
    }

    /// Object name for diagnostics
    pub fn object_name(&self, address: Address) -> String {
        let Some(object) = self.object(address) else {
            return format!("<invalid {}>", address);
        };
        let name = object.name_address();
        match self.read_string(name) {
            Ok(bytes) if name.is_pointer() => String::from_utf8_lossy(&bytes).into_owned(),
            _ => format!("<obj {}>", address),
        }
    }

    // ---------------------------------------------------------------------
    // Pools
    // ---------------------------------------------------------------------

    fn pool_segment(&mut self, kind: SegmentKind) -> Result<SegmentId, RuntimeError> {
        let current = match kind {
            SegmentKind::Clones => self.clones_segment,
            SegmentKind::Lists => self.lists_segment,
            SegmentKind::Nodes => self.nodes_segment,
            _ => self.hunks_segment,
        };
        if current != 0 {
            return Ok(current);
        }
        let id = self.allocate_segment(kind)?;
        match kind {
            SegmentKind::Clones => self.clones_segment = id,
            SegmentKind::Lists => self.lists_segment = id,
            SegmentKind::Nodes => self.nodes_segment = id,
            _ => self.hunks_segment = id,
        }
        Ok(id)
    }

    fn pool_full(kind: SegmentKind) -> RuntimeError {
        RuntimeError::OutOfMemory {
            requested: 1,
            context: format!("{} pool full", kind),
        }
    }

    /// Copy the object at `origin` into a new clone
    pub fn alloc_clone(&mut self, origin: Address) -> Result<Address, RuntimeError> {
        let clone = self.require_object(origin)?.make_clone();
        let seg = self.pool_segment(SegmentKind::Clones)?;
        let Some(Segment::Clones(pool)) = self.get_mut(seg) else {
            return Err(RuntimeError::invalid(Address::new(seg, 0), None, 0));
        };
        let index = pool.alloc(clone).ok_or_else(|| Self::pool_full(SegmentKind::Clones))?;
        let address = Address::new(seg, index as u16);
        if let Some(object) = pool.get_mut(index) {
            object.set_pos(address);
        }
        Ok(address)
    }

    pub fn free_clone(&mut self, address: Address) -> Result<(), RuntimeError> {
        self.free_pool_entry(address, SegmentKind::Clones)
    }

    pub fn alloc_list(&mut self) -> Result<Address, RuntimeError> {
        let seg = self.pool_segment(SegmentKind::Lists)?;
        let Some(Segment::Lists(pool)) = self.get_mut(seg) else {
            return Err(RuntimeError::invalid(Address::new(seg, 0), None, 0));
        };
        let index = pool
            .alloc(List::default())
            .ok_or_else(|| Self::pool_full(SegmentKind::Lists))?;
        Ok(Address::new(seg, index as u16))
    }

    pub fn alloc_node(&mut self, value: Address, key: Address) -> Result<Address, RuntimeError> {
        let seg = self.pool_segment(SegmentKind::Nodes)?;
        let Some(Segment::Nodes(pool)) = self.get_mut(seg) else {
            return Err(RuntimeError::invalid(Address::new(seg, 0), None, 0));
        };
        let node = Node {
            value,
            key,
            ..Node::default()
        };
        let index = pool.alloc(node).ok_or_else(|| Self::pool_full(SegmentKind::Nodes))?;
        Ok(Address::new(seg, index as u16))
    }

    pub fn list(&self, address: Address) -> Result<&List, RuntimeError> {
        match self.dereference(address)? {
            Deref::List(list) => Ok(list),
            _ => Err(RuntimeError::invalid(address, self.kind(address.segment), 0)),
        }
    }

    pub fn list_mut(&mut self, address: Address) -> Result<&mut List, RuntimeError> {
        let kind = self.kind(address.segment);
        match self.get_mut(address.segment) {
            Some(Segment::Lists(pool)) => pool.get_mut(address.offset as usize),
            _ => None,
        }
        .ok_or_else(|| RuntimeError::invalid(address, kind, 0))
    }

    pub fn node(&self, address: Address) -> Result<&Node, RuntimeError> {
        match self.dereference(address)? {
            Deref::Node(node) => Ok(node),
            _ => Err(RuntimeError::invalid(address, self.kind(address.segment), 0)),
        }
    }

    pub fn node_mut(&mut self, address: Address) -> Result<&mut Node, RuntimeError> {
        let kind = self.kind(address.segment);
        match self.get_mut(address.segment) {
            Some(Segment::Nodes(pool)) => pool.get_mut(address.offset as usize),
            _ => None,
        }
        .ok_or_else(|| RuntimeError::invalid(address, kind, 0))
    }

    pub fn free_list(&mut self, address: Address) -> Result<(), RuntimeError> {
        self.free_pool_entry(address, SegmentKind::Lists)
    }

    pub fn free_node(&mut self, address: Address) -> Result<(), RuntimeError> {
        self.free_pool_entry(address, SegmentKind::Nodes)
    }

    /// Allocate a hunk of raw memory for an embedder service
    pub fn alloc_hunk(&mut self, size: usize, description: &str) -> Result<Address, RuntimeError> {
        let seg = self.pool_segment(SegmentKind::Hunks)?;
        let Some(Segment::Hunks(pool)) = self.get_mut(seg) else {
            return Err(RuntimeError::invalid(Address::new(seg, 0), None, 0));
        };
        let index = pool
            .alloc(MemBlock::new(size, description))
            .ok_or_else(|| Self::pool_full(SegmentKind::Hunks))?;
        Ok(Address::new(seg, index as u16))
    }

    pub fn free_hunk(&mut self, address: Address) -> Result<(), RuntimeError> {
        self.free_pool_entry(address, SegmentKind::Hunks)
    }

    fn free_pool_entry(&mut self, address: Address, expected: SegmentKind) -> Result<(), RuntimeError> {
        let kind = self.kind(address.segment);
        let index = address.offset as usize;
        let freed = match self.get_mut(address.segment) {
            Some(Segment::Clones(pool)) if expected == SegmentKind::Clones => pool.free(index).is_some(),
            Some(Segment::Lists(pool)) if expected == SegmentKind::Lists => pool.free(index).is_some(),
            Some(Segment::Nodes(pool)) if expected == SegmentKind::Nodes => pool.free(index).is_some(),
            Some(Segment::Hunks(pool)) if expected == SegmentKind::Hunks => pool.free(index).is_some(),
            _ => false,
        };
        freed
            .then_some(())
            .ok_or_else(|| RuntimeError::invalid(address, kind, 0))
    }

    /// Allocate a dynamic memory block in a segment of its own
    pub fn alloc_dynmem(&mut self, size: usize, description: &str) -> Result<Address, RuntimeError> {
        if size == 0 || size > u16::MAX as usize {
            return Err(RuntimeError::OutOfMemory {
                requested: size,
                context: format!("dynamic memory '{}'", description),
            });
        }
        let id = self.insert(Segment::DynMem(MemBlock::new(size, description)))?;
        Ok(Address::new(id, 0))
    }

    pub fn free_dynmem(&mut self, address: Address) -> Result<(), RuntimeError> {
        match self.kind(address.segment) {
            Some(SegmentKind::DynMem) if address.offset == 0 => self.deallocate(address.segment),
            kind => Err(RuntimeError::invalid(address, kind, 0)),
        }
    }

    // ---------------------------------------------------------------------
    // Collector support
    // ---------------------------------------------------------------------

    /// Normalise `address` to the entity reachability is tracked for
    pub fn find_canonic_address(&self, address: Address) -> Option<Address> {
        let segment = self.get(address.segment)?;
        match segment {
            Segment::Locals(locals) => {
                let owner = self.script_segment(locals.script_number)?;
                Some(Address::new(owner, 0))
            }
            _ => Some(Address::new(
                address.segment,
                segment.canonical_offset(address.offset),
            )),
        }
    }

    /// Every address held by the entity at canonical `address`
    pub fn outgoing_references(&self, address: Address) -> Vec<Address> {
        let mut refs = Vec::new();
        match self.get(address.segment) {
            Some(Segment::Script(script)) => {
                for object in script.objects() {
                    refs.extend_from_slice(object.variables());
                }
                if let Ok(locals) = self.locals(script.locals_segment()) {
                    refs.extend_from_slice(&locals.values);
                }
            }
            Some(Segment::Locals(locals)) => refs.extend_from_slice(&locals.values),
            Some(Segment::Stack(stack)) => refs.extend_from_slice(stack.live(stack.capacity())),
            Some(Segment::Clones(pool)) => {
                if let Some(clone) = pool.get(address.offset as usize) {
                    refs.extend_from_slice(clone.variables());
                    if let Some(origin) = clone.origin() {
                        refs.push(origin);
                    }
                }
            }
            Some(Segment::Lists(pool)) => {
                if let Some(list) = pool.get(address.offset as usize) {
                    refs.extend([list.first, list.last]);
                }
            }
            Some(Segment::Nodes(pool)) => {
                if let Some(node) = pool.get(address.offset as usize) {
                    refs.extend([node.pred, node.succ, node.key, node.value]);
                }
            }
            _ => {}
        }
        refs.retain(|a| a.is_pointer());
        refs
    }

    /// Entities the collector may reclaim if unreachable
    ///
    /// Every live pool entry, plus scripts whose lock count is zero and which
    /// are marked for deletion.
    pub fn deallocatable(&self) -> Vec<Address> {
        let mut out = Vec::new();
        for id in self.segment_ids() {
            match self.get(id) {
                Some(Segment::Clones(pool)) => {
                    out.extend(pool.live_indices().into_iter().map(|i| Address::new(id, i as u16)))
                }
                Some(Segment::Lists(pool)) => {
                    out.extend(pool.live_indices().into_iter().map(|i| Address::new(id, i as u16)))
                }
                Some(Segment::Nodes(pool)) => {
                    out.extend(pool.live_indices().into_iter().map(|i| Address::new(id, i as u16)))
                }
                Some(Segment::Hunks(pool)) => {
                    out.extend(pool.live_indices().into_iter().map(|i| Address::new(id, i as u16)))
                }
                Some(Segment::Script(script))
                    if script.is_marked_deleted() && script.lockers() == 0 =>
                {
                    out.push(Address::new(id, 0))
                }
                _ => {}
            }
        }
        out
    }

    /// Reclaim a deallocatable entity
    pub fn free_at(&mut self, address: Address) -> Result<(), RuntimeError> {
        match self.kind(address.segment) {
            Some(SegmentKind::Script) => self.deallocate(address.segment),
            Some(kind) if kind.is_pool() => self.free_pool_entry(address, kind),
            kind => Err(RuntimeError::invalid(address, kind, 0)),
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        for id in self.segment_ids() {
            stats.segments += 1;
            match self.get(id) {
                Some(Segment::Script(_)) => stats.scripts += 1,
                Some(Segment::Clones(pool)) => stats.clones += pool.len(),
                Some(Segment::Lists(pool)) => stats.lists += pool.len(),
                Some(Segment::Nodes(pool)) => stats.nodes += pool.len(),
                Some(Segment::Hunks(pool)) => stats.hunks += pool.len(),
                Some(Segment::DynMem(block)) => stats.dynmem_bytes += block.size(),
                _ => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SegmentManager {
        SegmentManager::new(ScriptLayout::SCI0)
    }

    #[test]
    fn test_segment_zero_is_never_allocated() {
        let mut seg = manager();
        let id = seg.allocate_segment(SegmentKind::Lists).unwrap();
        assert_eq!(id, 1);
        assert!(seg.dereference(Address::new(0, 0)).is_err());
    }

    #[test]
    fn test_freed_ids_are_reused_only_when_free() {
        let mut seg = manager();
        let a = seg.allocate_segment(SegmentKind::DynMem).unwrap();
        let b = seg.allocate_segment(SegmentKind::DynMem).unwrap();
        assert_ne!(a, b);
        seg.deallocate(a).unwrap();
        let c = seg.allocate_segment(SegmentKind::Lists).unwrap();
        assert_eq!(c, a);
        assert!(seg.deallocate(a).is_ok());
        assert!(seg.deallocate(a).is_err());
    }

    #[test]
    fn test_dynmem_bounds() {
        let mut seg = manager();
        let block = seg.alloc_dynmem(4, "test").unwrap();
        seg.write_bytes(block, b"ab\0").unwrap();
        assert_eq!(seg.read_string(block).unwrap(), b"ab");
        assert!(seg.write_bytes(block.with_offset_delta(3), b"xy").is_err());
        let view = seg.dereference(block.with_offset_delta(1)).unwrap();
        assert_eq!(view.max_size(), 3);
        assert!(seg.dereference(block.with_offset_delta(4)).is_err());
    }

    #[test]
    fn test_system_strings_are_addressable() {
        let mut seg = manager();
        let id = seg.allocate_system_strings().unwrap();
        seg.write_string(Address::new(id, 1), b"hello").unwrap();
        assert_eq!(seg.read_string(Address::new(id, 1)).unwrap(), b"hello");
        assert!(seg.read_string(Address::new(id, 9)).is_err());
    }

    #[test]
    fn test_find_segment_by_kind() {
        let mut seg = manager();
        assert_eq!(seg.find_segment_by_kind(SegmentKind::Stack), None);
        seg.allocate_segment(SegmentKind::Lists).unwrap();
        let stack = seg.allocate_stack(16).unwrap();
        assert_eq!(seg.find_segment_by_kind(SegmentKind::Stack), Some(stack));
    }

    #[test]
    fn test_node_pool_round_trip() {
        let mut seg = manager();
        let node = seg.alloc_node(Address::from_u16(5), Address::from_u16(6)).unwrap();
        assert_eq!(seg.node(node).unwrap().value, Address::from_u16(5));
        seg.node_mut(node).unwrap().succ = Address::new(9, 9);
        assert_eq!(seg.node(node).unwrap().succ, Address::new(9, 9));
        seg.free_node(node).unwrap();
        assert!(seg.node(node).is_err());
        assert!(seg.free_node(node).is_err());
    }
}

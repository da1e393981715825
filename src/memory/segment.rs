//! Heap segments
//!
//! A [`Segment`] is one typed region of the VM heap. The variants own their
//! storage outright; nothing outside the segment manager sees a raw buffer.

use super::heap::{MemBlock, SystemStrings};
use super::pool::Pool;
use super::stack::{DataStack, LocalsTable};
use super::value::Address;
use crate::script::{Object, Script};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Script,
    Locals,
    Stack,
    Clones,
    Lists,
    Nodes,
    Hunks,
    DynMem,
    SystemStrings,
}

impl SegmentKind {
    /// Pool kinds whose entries are individually swept by the collector
    pub fn is_pool(&self) -> bool {
        matches!(
            self,
            SegmentKind::Clones | SegmentKind::Lists | SegmentKind::Nodes | SegmentKind::Hunks
        )
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SegmentKind::Script => "script",
            SegmentKind::Locals => "locals",
            SegmentKind::Stack => "stack",
            SegmentKind::Clones => "clones",
            SegmentKind::Lists => "lists",
            SegmentKind::Nodes => "nodes",
            SegmentKind::Hunks => "hunks",
            SegmentKind::DynMem => "dynmem",
            SegmentKind::SystemStrings => "system strings",
        };
        f.write_str(name)
    }
}

/// Head and tail of a doubly linked list of nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct List {
    pub first: Address,
    pub last: Address,
}

/// A list node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Node {
    pub pred: Address,
    pub succ: Address,
    pub key: Address,
    pub value: Address,
}

#[derive(Debug, Clone)]
pub enum Segment {
    Script(Box<Script>),
    Locals(LocalsTable),
    Stack(DataStack),
    Clones(Pool<Object>),
    Lists(Pool<List>),
    Nodes(Pool<Node>),
    Hunks(Pool<MemBlock>),
    DynMem(MemBlock),
    SystemStrings(SystemStrings),
}

impl Segment {
    pub fn kind(&self) -> SegmentKind {
        match self {
            Segment::Script(_) => SegmentKind::Script,
            Segment::Locals(_) => SegmentKind::Locals,
            Segment::Stack(_) => SegmentKind::Stack,
            Segment::Clones(_) => SegmentKind::Clones,
            Segment::Lists(_) => SegmentKind::Lists,
            Segment::Nodes(_) => SegmentKind::Nodes,
            Segment::Hunks(_) => SegmentKind::Hunks,
            Segment::DynMem(_) => SegmentKind::DynMem,
            Segment::SystemStrings(_) => SegmentKind::SystemStrings,
        }
    }

    /// An empty segment of the given kind
    pub fn empty(kind: SegmentKind) -> Self {
        match kind {
            SegmentKind::Script => Segment::Script(Box::new(Script::empty(0))),
            SegmentKind::Locals => Segment::Locals(LocalsTable::new(0, Vec::new())),
            SegmentKind::Stack => {
                Segment::Stack(DataStack::new(crate::interpreter::constants::DEFAULT_STACK_SIZE))
            }
            SegmentKind::Clones => Segment::Clones(Pool::new()),
            SegmentKind::Lists => Segment::Lists(Pool::new()),
            SegmentKind::Nodes => Segment::Nodes(Pool::new()),
            SegmentKind::Hunks => Segment::Hunks(Pool::new()),
            SegmentKind::DynMem => Segment::DynMem(MemBlock::new(0, "")),
            SegmentKind::SystemStrings => Segment::SystemStrings(SystemStrings::new()),
        }
    }

    /// Normalise an address into this segment to the entity it belongs to
    ///
    /// Pool entries are tracked per slot; every other kind is one entity at
    /// offset 0. Locals canonicalise to their script in the manager, which
    /// knows the script's segment.
    pub fn canonical_offset(&self, offset: u16) -> u16 {
        match self {
            Segment::Clones(_) | Segment::Lists(_) | Segment::Nodes(_) | Segment::Hunks(_) => {
                offset
            }
            _ => 0,
        }
    }

    /// Whether `offset` names something live in this segment
    pub fn is_valid_offset(&self, offset: u16) -> bool {
        let offset_usize = offset as usize;
        match self {
            Segment::Script(script) => offset_usize < script.len(),
            Segment::Locals(locals) => offset_usize / 2 < locals.len(),
            Segment::Stack(stack) => offset_usize / 2 < stack.capacity(),
            Segment::Clones(pool) => pool.is_valid(offset_usize),
            Segment::Lists(pool) => pool.is_valid(offset_usize),
            Segment::Nodes(pool) => pool.is_valid(offset_usize),
            Segment::Hunks(pool) => pool.is_valid(offset_usize),
            Segment::DynMem(block) => offset_usize < block.size(),
            Segment::SystemStrings(strings) => offset_usize < strings.strings.len(),
        }
    }
}

//! Segmented heap for the VM
//!
//! Every VM-visible value is an [`value::Address`]: a segment id plus a 16-bit
//! offset. This module provides:
//! - [`value`]: the address type itself
//! - [`segment`]: the typed [`segment::Segment`] variants
//! - [`pool`]: fixed-slot pools for clones, lists, nodes and hunks
//! - [`heap`]: raw memory blocks and the system string table
//! - [`stack`]: the operand stack and script local tables
//! - [`manager`]: the [`manager::SegmentManager`] owning all of the above
//!
//! # Addressing
//!
//! How an offset is interpreted depends on the segment kind:
//! ```text
//! Script, DynMem        byte offset into the buffer
//! Locals, Stack         2 * slot index
//! Clones/Lists/Nodes    pool slot index
//! Hunks                 pool slot index (data starts at byte 0)
//! SystemStrings         string index
//! ```
//!
//! Segment 0 is never allocated. An address in segment 0 is a plain number.

pub mod heap;
pub mod manager;
pub mod pool;
pub mod segment;
pub mod stack;
pub mod value;

pub use manager::{Deref, HeapStats, SegmentManager};
pub use segment::{List, Node, Segment, SegmentKind};
pub use value::{Address, SegmentId};

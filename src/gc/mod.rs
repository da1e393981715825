//! Mark-and-sweep garbage collection
//!
//! Reachability is tracked per *canonical address*: one per pool entry
//! (clone, list, node, hunk) and one per script, with a script's locals
//! counted as part of the script. The collector
//!
//! 1. gathers the roots from the registers, the live operand stack, every
//!    execution frame, the globals and every locked script,
//! 2. walks outgoing references breadth-first from those roots,
//! 3. frees every deallocatable entity that was not reached.
//!
//! Only pool entries and scripts that are unlocked and marked for deletion are
//! deallocatable. Dynamic memory blocks are freed explicitly by their owners
//! and are never swept.

use crate::interpreter::context::ExecutionContext;
use crate::memory::segment::SegmentKind;
use crate::memory::value::Address;
use crate::memory::SegmentManager;
use log::{debug, warn};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;

/// What one collection did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcStats {
    pub roots: usize,
    /// Canonical addresses reached
    pub marked: usize,
    pub freed_clones: usize,
    pub freed_lists: usize,
    pub freed_nodes: usize,
    pub freed_hunks: usize,
    pub freed_scripts: usize,
}

impl GcStats {
    pub fn freed(&self) -> usize {
        self.freed_clones + self.freed_lists + self.freed_nodes + self.freed_hunks + self.freed_scripts
    }
}

/// Every address the running program can reach directly
pub fn collect_roots(segments: &SegmentManager, context: &ExecutionContext) -> Vec<Address> {
    let mut roots = vec![context.acc, context.prev];

    if let Ok(stack) = segments.stack(context.stack_segment) {
        roots.extend_from_slice(stack.live(context.stack_top()));
    }

    for frame in &context.frames {
        roots.push(frame.objp);
        roots.push(frame.sendp);
        if frame.pc.is_pointer() {
            roots.push(Address::new(frame.pc.segment, 0));
        }
        if frame.local_segment != 0 {
            roots.push(Address::new(frame.local_segment, 0));
        }
    }

    if let Some(globals) = segments.globals_segment() {
        roots.push(Address::new(globals, 0));
    }

    for id in segments.segment_ids() {
        if let Ok(script) = segments.script(id) {
            if script.lockers() > 0 {
                roots.push(Address::new(id, 0));
            }
        }
    }

    roots.retain(|a| a.is_pointer());
    roots
}

/// Run one full collection
pub fn run_gc(segments: &mut SegmentManager, context: &ExecutionContext) -> GcStats {
    let roots = collect_roots(segments, context);
    let mut stats = GcStats {
        roots: roots.len(),
        ..GcStats::default()
    };

    let mut reached: FxHashSet<Address> = FxHashSet::default();
    let mut queue: VecDeque<Address> = roots.into_iter().collect();
    while let Some(address) = queue.pop_front() {
        let Some(canonic) = segments.find_canonic_address(address) else {
            warn!("dangling reference to {}", address);
            continue;
        };
        if !segments.is_valid_address(canonic) && !is_whole_segment(segments, canonic) {
            warn!("dangling reference to {}", address);
            continue;
        }
        if !reached.insert(canonic) {
            continue;
        }
        queue.extend(segments.outgoing_references(canonic));
    }
    stats.marked = reached.len();

    for candidate in segments.deallocatable() {
        if reached.contains(&candidate) {
            continue;
        }
        let kind = segments.kind(candidate.segment);
        if let Err(err) = segments.free_at(candidate) {
            warn!("could not free {}: {}", candidate, err);
            continue;
        }
        match kind {
            Some(SegmentKind::Clones) => stats.freed_clones += 1,
            Some(SegmentKind::Lists) => stats.freed_lists += 1,
            Some(SegmentKind::Nodes) => stats.freed_nodes += 1,
            Some(SegmentKind::Hunks) => stats.freed_hunks += 1,
            _ => stats.freed_scripts += 1,
        }
    }

    debug!(
        "gc: {} roots, {} reachable, freed {} clones, {} lists, {} nodes, {} hunks, {} scripts",
        stats.roots,
        stats.marked,
        stats.freed_clones,
        stats.freed_lists,
        stats.freed_nodes,
        stats.freed_hunks,
        stats.freed_scripts
    );
    stats
}

/// Canonical addresses of non-pool segments are offset 0 even when the
/// segment itself has no byte 0 (an empty locals table, for instance)
fn is_whole_segment(segments: &SegmentManager, canonic: Address) -> bool {
    canonic.offset == 0
        && segments
            .kind(canonic.segment)
            .is_some_and(|kind| !kind.is_pool())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptLayout;

    fn setup() -> (SegmentManager, ExecutionContext) {
        let mut segments = SegmentManager::new(ScriptLayout::SCI0);
        let stack = segments.allocate_stack(64).unwrap();
        (segments, ExecutionContext::new(stack))
    }

    #[test]
    fn test_unreachable_entries_are_freed() {
        let (mut segments, ctx) = setup();
        let list = segments.alloc_list().unwrap();
        let node = segments.alloc_node(Address::from_u16(5), Address::from_u16(5)).unwrap();
        segments.list_mut(list).unwrap().first = node;

        let stats = run_gc(&mut segments, &ctx);
        assert_eq!(stats.freed_lists, 1);
        assert_eq!(stats.freed_nodes, 1);
        assert!(!segments.is_valid_address(list));
        assert!(!segments.is_valid_address(node));
    }

    #[test]
    fn test_accumulator_keeps_list_alive() {
        let (mut segments, mut ctx) = setup();
        let list = segments.alloc_list().unwrap();
        let node = segments.alloc_node(Address::from_u16(5), Address::from_u16(5)).unwrap();
        let orphan = segments.alloc_node(Address::NULL, Address::NULL).unwrap();
        segments.list_mut(list).unwrap().first = node;
        segments.list_mut(list).unwrap().last = node;
        ctx.acc = list;

        let stats = run_gc(&mut segments, &ctx);
        assert_eq!(stats.freed(), 1);
        assert!(segments.is_valid_address(list));
        assert!(segments.is_valid_address(node));
        assert!(!segments.is_valid_address(orphan));
    }

    #[test]
    fn test_dynmem_is_never_swept() {
        let (mut segments, ctx) = setup();
        let block = segments.alloc_dynmem(32, "scratch").unwrap();
        run_gc(&mut segments, &ctx);
        assert!(segments.is_valid_address(block));
    }
}

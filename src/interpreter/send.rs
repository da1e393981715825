//! Selector lookup and message sends
//!
//! # Lookup order
//!
//! For each object on the superclass chain, starting at the receiver:
//!
//! 1. its method table
//! 2. its property selector list (pre-1.1 instances use their class's list)
//! 3. its superclass, found by species through the class table
//!
//! A property found anywhere on the chain names a slot of the *receiver*.
//!
//! # Message frames
//!
//! A `send` with a frame of `n` words finds on the stack one or more messages,
//! each laid out as `selector, argc, arg 1 .. argc`. Every message is resolved
//! before any of them runs; the resulting frames execute in message order.

use super::constants::INVALID_SELECTOR_RESULT;
use super::context::{ExecFrame, FrameKind};
use super::engine::Interpreter;
use super::errors::RuntimeError;
use crate::memory::value::Address;
use crate::memory::SegmentManager;
use log::warn;

/// Longest superclass chain followed before giving up
const MAX_CHAIN: usize = 256;

/// Result of resolving a selector on an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorLookup {
    /// Property slot `index` of `object`
    Variable { object: Address, index: usize },
    /// Method code, found on `owner`
    Method { address: Address, owner: Address },
    NotFound,
}

/// Resolve `selector` on `object`, walking its superclass chain
pub fn lookup(
    segments: &SegmentManager,
    object: Address,
    selector: u16,
) -> Result<SelectorLookup, RuntimeError> {
    let mut current = object;
    for _ in 0..MAX_CHAIN {
        let obj = segments.require_object(current)?;

        if let Some(address) = obj.find_method(selector) {
            return Ok(SelectorLookup::Method {
                address,
                owner: current,
            });
        }

        let own = obj.var_selectors();
        let borrowed = match own {
            Some(_) => None,
            None => segments
                .classes()
                .address(obj.species())
                .and_then(|class| segments.object(class))
                .and_then(|class| class.var_selectors()),
        };
        if let Some(index) = own
            .or(borrowed)
            .and_then(|sels| sels.iter().position(|&s| s == selector))
        {
            return Ok(SelectorLookup::Variable { object, index });
        }

        if !obj.has_superclass() {
            return Ok(SelectorLookup::NotFound);
        }
        let species = obj.superclass_species();
        current = match segments.classes().address(species) {
            Some(class) if class != current => class,
            Some(_) => return Ok(SelectorLookup::NotFound),
            None => {
                warn!(
                    "superclass {} of {} is not loaded; selector {} unresolved",
                    species,
                    segments.object_name(current),
                    selector
                );
                return Ok(SelectorLookup::NotFound);
            }
        };
    }
    warn!("superclass chain of {} is too deep", object);
    Ok(SelectorLookup::NotFound)
}

/// One message decoded from a send frame
struct Message {
    selector: u16,
    argp: usize,
    argc: usize,
}

impl Interpreter {
    /// Whether `object` resolves `selector` to anything
    pub fn responds_to(&self, object: Address, selector: u16) -> bool {
        matches!(
            lookup(&self.segments, object, selector),
            Ok(SelectorLookup::Variable { .. } | SelectorLookup::Method { .. })
        )
    }

    /// Execute a `send`, `self` or `super` with a frame of `frame_bytes`
    ///
    /// `work` is the object whose properties the methods see; it defaults to
    /// the target and differs only for `super`.
    pub(crate) fn exec_send(
        &mut self,
        target: Address,
        work: Option<Address>,
        frame_bytes: usize,
    ) -> Result<(), RuntimeError> {
        let rest = std::mem::take(&mut self.context.rest);
        let words = frame_bytes / 2 + rest;
        let sp = self.frame()?.sp;
        let base = sp
            .checked_sub(words)
            .ok_or(RuntimeError::ValueStackExhausted {
                capacity: self.segments.stack(self.context.stack_segment)?.capacity(),
            })?;
        if rest > 0 {
            // &rest arguments extend the final message
            let last = self.last_message_argc_slot(base, frame_bytes / 2)?;
            let argc = self.stack_get(last)?;
            self.stack_set(last, argc.with_offset_delta(rest as i32))?;
        }
        self.dispatch_send(target, work.unwrap_or(target), base, words)
    }

    fn last_message_argc_slot(&self, base: usize, words: usize) -> Result<usize, RuntimeError> {
        let mut pos = base;
        let mut last = base + 1;
        while pos + 1 < base + words {
            last = pos + 1;
            let argc = self.stack_get(last)?.offset as usize;
            pos += 2 + argc;
        }
        Ok(last)
    }

    /// Resolve every message in `words` stack slots at `base` and push their frames
    pub(crate) fn dispatch_send(
        &mut self,
        send_obj: Address,
        work_obj: Address,
        base: usize,
        words: usize,
    ) -> Result<(), RuntimeError> {
        let top = base + words;
        let mut messages = Vec::new();
        let mut pos = base;
        while pos + 1 < top {
            let selector = self.stack_get(pos)?.offset;
            let argc = self.stack_get(pos + 1)?.offset as usize;
            messages.push(Message {
                selector,
                argp: pos + 1,
                argc,
            });
            pos += 2 + argc;
        }
        if pos > top {
            warn!(
                "send to {} overruns its frame by {} words",
                self.segments.object_name(send_obj),
                pos - top
            );
        }

        if let Some(caller) = self.context.current_mut() {
            caller.sp = base;
        }

        let mut frames = Vec::with_capacity(messages.len());
        for message in &messages {
            let frame = match lookup(&self.segments, send_obj, message.selector)? {
                SelectorLookup::Method { address, .. } => {
                    let local_segment = self.segments.script(address.segment)?.locals_segment();
                    if let Some(obj) = self.segments.object_mut(send_obj) {
                        obj.mark_sent(message.selector);
                    }
                    ExecFrame {
                        kind: FrameKind::Method,
                        pc: address,
                        sp: top,
                        fp: top,
                        argp: message.argp,
                        argc: message.argc,
                        objp: work_obj,
                        sendp: send_obj,
                        local_segment,
                        selector: Some(message.selector),
                    }
                }
                SelectorLookup::Variable { index, .. } => ExecFrame {
                    kind: FrameKind::VarSelector { index },
                    pc: Address::NULL,
                    sp: top,
                    fp: top,
                    argp: message.argp,
                    argc: message.argc,
                    objp: work_obj,
                    sendp: send_obj,
                    local_segment: 0,
                    selector: Some(message.selector),
                },
                SelectorLookup::NotFound => {
                    let err = self.selector_not_found(send_obj, message.selector);
                    if self.config.continue_on_invalid_selector && err.is_recoverable() {
                        warn!("{}; continuing", err);
                        self.context.acc = INVALID_SELECTOR_RESULT;
                        continue;
                    }
                    return Err(err);
                }
            };
            frames.push(frame);
        }

        for frame in frames.into_iter().rev() {
            self.push_frame(frame)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{ClassTable, MemoryResources, ObjectDef, ScriptBuilder, ScriptLayout, ScriptVersion};

    const MOVE: u16 = 20;
    const SPEED: u16 = 21;

    fn resources(version: ScriptVersion) -> MemoryResources {
        let mut builder = ScriptBuilder::new(version, 5);
        let walk = builder.asm().label();
        builder.asm().bind(walk);
        builder.asm().ret();
        builder.object(
            ObjectDef::class("Actor", 3)
                .property(SPEED, 6)
                .method(MOVE, walk),
        );
        builder.object(ObjectDef::instance("ego", 3).property(SPEED, 2));
        builder.export_object("ego");

        let mut res = MemoryResources::new();
        res.add(5, builder.build().unwrap());
        res.add_class_script(3, 5);
        res
    }

    fn loaded(version: ScriptVersion) -> (SegmentManager, Address) {
        let res = resources(version);
        let mut segments = SegmentManager::new(ScriptLayout::for_version(version));
        *segments.classes_mut() = ClassTable::with_scripts(&[(3, 5)]);
        let seg = segments.instantiate_script(5, &res).unwrap();
        let ego = segments.script(seg).unwrap().export_address(0).unwrap();
        (segments, ego)
    }

    #[test]
    fn test_method_found_on_class() {
        for version in [ScriptVersion::Sci0, ScriptVersion::Sci11] {
            let (segments, ego) = loaded(version);
            match lookup(&segments, ego, MOVE).unwrap() {
                SelectorLookup::Method { owner, .. } => {
                    assert_eq!(Some(owner), segments.classes().address(3));
                }
                other => panic!("expected method, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_property_resolves_to_receiver_slot() {
        for version in [ScriptVersion::Sci0, ScriptVersion::Sci11] {
            let (segments, ego) = loaded(version);
            let result = lookup(&segments, ego, SPEED).unwrap();
            let SelectorLookup::Variable { object, index } = result else {
                panic!("expected variable, got {:?}", result);
            };
            assert_eq!(object, ego);
            assert_eq!(segments.read_property(ego, index).unwrap(), Address::from_u16(2));
        }
    }

    #[test]
    fn test_unknown_selector() {
        let (segments, ego) = loaded(ScriptVersion::Sci0);
        assert_eq!(lookup(&segments, ego, 99).unwrap(), SelectorLookup::NotFound);
    }

    #[test]
    fn test_lookup_on_number_is_not_an_object() {
        let (segments, _) = loaded(ScriptVersion::Sci0);
        assert!(matches!(
            lookup(&segments, Address::from_u16(7), MOVE),
            Err(RuntimeError::NotAnObject { .. })
        ));
    }
}

//! Object model
//!
//! An [`Object`] is the instantiated form of an object or class record found
//! in a script's bytes: its property values copied into a flat slot array, its
//! method table decoded into (selector, code offset) pairs and the selector ids
//! of its properties when the format stores them per object.
//!
//! Instantiation happens once per record. After that the property array never
//! moves and slots are addressed by index only.
//!
//! # Layouts
//!
//! Pre-1.1 records (offsets relative to the object base, which is the first
//! property value):
//! ```text
//! base-8  magic 0x1234
//! base-6  locals offset (unused)
//! base-4  function area offset (relative to base)
//! base-2  property count N
//! base    N property values
//!         N property selector ids        (classes only)
//! func    method count M, M selectors, 0, M code offsets
//! ```
//! 1.1+ records live in the heap part; the base is the magic word itself and
//! slots 1-3 carry the count and the offsets of the property and method
//! dictionaries in the script part.

use crate::interpreter::constants::{INFO_FLAG_CLASS, INFO_FLAG_CLONE, OBJECT_MAGIC, NO_SUPERCLASS};
use crate::interpreter::errors::RuntimeError;
use crate::memory::value::{Address, SegmentId};
use crate::script::layout::{read_u16, ScriptLayout, ScriptVersion};

/// One method table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Method {
    pub selector: u16,
    /// Code offset inside the owning script's buffer
    pub offset: u16,
}

/// An instantiated script object, class or clone
#[derive(Debug, Clone)]
pub struct Object {
    pos: Address,
    code_segment: SegmentId,
    layout: ScriptLayout,
    variables: Vec<Address>,
    /// `None` for pre-1.1 instances, which borrow their class's list
    var_selectors: Option<Vec<u16>>,
    methods: Vec<Method>,
    /// Object a clone was copied from
    origin: Option<Address>,
    /// Selector most recently dispatched to this object
    last_sent: Option<u16>,
}

impl Object {
    pub fn pos(&self) -> Address {
        self.pos
    }

    pub fn layout(&self) -> &ScriptLayout {
        &self.layout
    }

    /// Segment holding this object's method code
    pub fn code_segment(&self) -> SegmentId {
        self.code_segment
    }

    pub fn var_count(&self) -> usize {
        self.variables.len()
    }

    pub fn variables(&self) -> &[Address] {
        &self.variables
    }

    pub fn get_var(&self, index: usize) -> Option<Address> {
        self.variables.get(index).copied()
    }

    pub fn set_var(&mut self, index: usize, value: Address) -> bool {
        match self.variables.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn slot_u16(&self, index: usize) -> u16 {
        self.variables.get(index).map_or(0, |v| v.offset)
    }

    pub fn species(&self) -> u16 {
        self.slot_u16(self.layout.species_slot)
    }

    /// Species number of the superclass, or `NO_SUPERCLASS`
    pub fn superclass_species(&self) -> u16 {
        self.slot_u16(self.layout.superclass_slot)
    }

    pub fn has_superclass(&self) -> bool {
        self.superclass_species() != NO_SUPERCLASS
    }

    pub fn info(&self) -> u16 {
        self.slot_u16(self.layout.info_slot)
    }

    pub fn is_class(&self) -> bool {
        self.info() & INFO_FLAG_CLASS != 0
    }

    pub fn is_clone(&self) -> bool {
        self.info() & INFO_FLAG_CLONE != 0
    }

    /// Address of the name string, null if unnamed
    pub fn name_address(&self) -> Address {
        self.get_var(self.layout.name_slot).unwrap_or(Address::NULL)
    }

    pub fn origin(&self) -> Option<Address> {
        self.origin
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn var_selectors(&self) -> Option<&[u16]> {
        self.var_selectors.as_deref()
    }

    pub fn last_sent(&self) -> Option<u16> {
        self.last_sent
    }

    pub(crate) fn mark_sent(&mut self, selector: u16) {
        self.last_sent = Some(selector);
    }

    /// Linear scan of the method table
    pub fn find_method(&self, selector: u16) -> Option<Address> {
        self.methods
            .iter()
            .find(|m| m.selector == selector)
            .map(|m| Address::new(self.code_segment, m.offset))
    }

    /// Byte range of the property values inside the script buffer
    pub fn var_range(&self) -> std::ops::Range<usize> {
        let start = self.pos.offset as usize;
        start..start + 2 * self.variables.len()
    }

    /// Copy this object's instance data for a clone
    ///
    /// The copy keeps the method table and selector list, records its origin
    /// and is flagged as a clone. A cloned class becomes an instance of it.
    pub fn make_clone(&self) -> Object {
        let mut clone = self.clone();
        clone.origin = Some(self.pos);
        clone.last_sent = None;
        let info = (self.info() & !INFO_FLAG_CLASS) | INFO_FLAG_CLONE;
        clone.variables[self.layout.info_slot] = Address::from_u16(info);
        if self.is_class() {
            clone.variables[self.layout.superclass_slot] = Address::from_u16(self.species());
        }
        clone
    }

    pub(crate) fn set_pos(&mut self, pos: Address) {
        self.pos = pos;
    }

    pub(crate) fn relocate_var(&mut self, index: usize, segment: SegmentId, delta: u16) -> bool {
        match self.variables.get_mut(index) {
            Some(slot) => {
                *slot = Address::new(segment, slot.offset.wrapping_add(delta));
                true
            }
            None => false,
        }
    }

    /// Instantiate the record whose base is at `base` in `buf`
    ///
    /// `script_size` is the length of the script part (the whole buffer for
    /// pre-1.1 scripts); 1.1+ dictionaries must lie inside it.
    pub(crate) fn parse(
        layout: &ScriptLayout,
        script_number: u16,
        segment: SegmentId,
        buf: &[u8],
        script_size: usize,
        base: usize,
    ) -> Result<Object, RuntimeError> {
        match layout.version {
            ScriptVersion::Sci0 => parse_sci0(layout, script_number, segment, buf, base),
            ScriptVersion::Sci11 => {
                parse_sci11(layout, script_number, segment, buf, script_size, base)
            }
        }
    }
}

fn corrupt(script: u16, field: &'static str, detail: String) -> RuntimeError {
    RuntimeError::ScriptCorrupt {
        script,
        field,
        detail,
    }
}

fn word(buf: &[u8], script: u16, offset: usize, field: &'static str) -> Result<u16, RuntimeError> {
    read_u16(buf, offset).ok_or_else(|| {
        corrupt(
            script,
            field,
            format!("offset 0x{:04x} beyond buffer of {} bytes", offset, buf.len()),
        )
    })
}

fn words(
    buf: &[u8],
    script: u16,
    start: usize,
    count: usize,
    limit: usize,
    field: &'static str,
) -> Result<Vec<u16>, RuntimeError> {
    let end = start + 2 * count;
    if end > limit.min(buf.len()) {
        return Err(corrupt(
            script,
            field,
            format!(
                "{} words at 0x{:04x} end at 0x{:04x}, limit 0x{:04x}",
                count, start, end, limit
            ),
        ));
    }
    Ok((0..count)
        .filter_map(|i| read_u16(buf, start + 2 * i))
        .collect())
}

fn check_var_count(layout: &ScriptLayout, script: u16, count: usize) -> Result<(), RuntimeError> {
    if count < layout.min_var_count {
        return Err(corrupt(
            script,
            "property count",
            format!("{} properties, at least {} required", count, layout.min_var_count),
        ));
    }
    Ok(())
}

fn parse_sci0(
    layout: &ScriptLayout,
    script: u16,
    segment: SegmentId,
    buf: &[u8],
    base: usize,
) -> Result<Object, RuntimeError> {
    let header = base
        .checked_sub(layout.object_header_size)
        .ok_or_else(|| corrupt(script, "object header", format!("base 0x{:04x}", base)))?;

    let magic = word(buf, script, header, "object magic")?;
    if magic != OBJECT_MAGIC {
        return Err(corrupt(
            script,
            "object magic",
            format!("0x{:04x} at 0x{:04x}", magic, header),
        ));
    }
    let func_area = word(buf, script, header + 4, "function area offset")? as usize;
    let var_count = word(buf, script, header + 6, "property count")? as usize;
    check_var_count(layout, script, var_count)?;

    let values = words(buf, script, base, var_count, buf.len(), "property values")?;
    let variables: Vec<Address> = values.into_iter().map(Address::from_u16).collect();

    let info = variables[layout.info_slot].offset;
    let var_selectors = if info & INFO_FLAG_CLASS != 0 {
        Some(words(
            buf,
            script,
            base + 2 * var_count,
            var_count,
            buf.len(),
            "property selectors",
        )?)
    } else {
        None
    };

    let func = base + func_area;
    let method_count = word(buf, script, func, "method count")? as usize;
    let selectors = words(buf, script, func + 2, method_count, buf.len(), "method selectors")?;
    let offsets_start = func + 2 + 2 * method_count + 2;
    let offsets = words(
        buf,
        script,
        offsets_start,
        method_count,
        buf.len(),
        "method offsets",
    )?;

    let methods = selectors
        .into_iter()
        .zip(offsets)
        .map(|(selector, offset)| Method { selector, offset })
        .collect();

    Ok(Object {
        pos: Address::new(segment, base as u16),
        code_segment: segment,
        layout: *layout,
        variables,
        var_selectors,
        methods,
        origin: None,
        last_sent: None,
    })
}

fn parse_sci11(
    layout: &ScriptLayout,
    script: u16,
    segment: SegmentId,
    buf: &[u8],
    script_size: usize,
    base: usize,
) -> Result<Object, RuntimeError> {
    let magic = word(buf, script, base, "object magic")?;
    if magic != OBJECT_MAGIC {
        return Err(corrupt(
            script,
            "object magic",
            format!("0x{:04x} at 0x{:04x}", magic, base),
        ));
    }
    let var_count = word(buf, script, base + 2, "property count")? as usize;
    check_var_count(layout, script, var_count)?;

    let values = words(buf, script, base, var_count, buf.len(), "property values")?;
    let variables: Vec<Address> = values.into_iter().map(Address::from_u16).collect();

    let prop_dict = variables[2].offset as usize;
    let method_dict = variables[3].offset as usize;

    let var_selectors = words(
        buf,
        script,
        prop_dict,
        var_count,
        script_size,
        "property dictionary",
    )?;

    let method_count = word(buf, script, method_dict, "method count")? as usize;
    let pairs = words(
        buf,
        script,
        method_dict + 2,
        2 * method_count,
        script_size,
        "method dictionary",
    )?;
    let methods = pairs
        .chunks_exact(2)
        .map(|pair| Method {
            selector: pair[0],
            offset: pair[1],
        })
        .collect();

    Ok(Object {
        pos: Address::new(segment, base as u16),
        code_segment: segment,
        layout: *layout,
        variables,
        var_selectors: Some(var_selectors),
        methods,
        origin: None,
        last_sent: None,
    })
}

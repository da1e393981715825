//! Script loading
//!
//! Builds a [`Script`] from resource bytes: sizes and fills the buffer,
//! collects exports, synonyms and code regions, instantiates every object
//! record and applies relocation so pointer-valued properties and locals
//! become addresses into the script's own segment.
//!
//! Loading is all-or-nothing. Any validation failure returns
//! [`RuntimeError::ScriptCorrupt`] and the caller discards the partial result.

use super::layout::{read_u16, write_u16, BlockType, ScriptLayout, ScriptVersion};
use super::{Script, Synonym};
use crate::interpreter::constants::OBJECT_MAGIC;
use crate::interpreter::errors::RuntimeError;
use crate::memory::value::{Address, SegmentId};
use log::{trace, warn};
use std::ops::Range;

/// A parsed script and the initial values of its local variables
#[derive(Debug)]
pub struct LoadedScript {
    pub script: Script,
    pub locals: Vec<Address>,
}

struct Parsed {
    exports: Vec<u16>,
    synonyms: Vec<Synonym>,
    code_ranges: Vec<Range<usize>>,
    object_bases: Vec<usize>,
    locals: Vec<Address>,
    locals_range: Option<Range<usize>>,
    /// Buffer offsets of relocated words
    relocations: Vec<usize>,
    /// Added to relocated values
    relocation_delta: u16,
}

fn corrupt(script: u16, field: &'static str, detail: String) -> RuntimeError {
    RuntimeError::ScriptCorrupt {
        script,
        field,
        detail,
    }
}

fn word_at(buf: &[u8], limit: usize, script: u16, offset: usize, field: &'static str) -> Result<u16, RuntimeError> {
    if offset + 2 > limit {
        return Err(corrupt(
            script,
            field,
            format!("offset 0x{:04x} beyond 0x{:04x}", offset, limit),
        ));
    }
    read_u16(buf, offset).ok_or_else(|| corrupt(script, field, format!("offset 0x{:04x}", offset)))
}

impl Script {
    /// Parse `script` (and `heap` for 1.1+) into a script living in `segment`
    pub fn load(
        layout: &ScriptLayout,
        number: u16,
        segment: SegmentId,
        script: &[u8],
        heap: Option<&[u8]>,
    ) -> Result<LoadedScript, RuntimeError> {
        let size = layout.buffer_size(number, script, heap)?;
        if size > u16::MAX as usize + 1 {
            return Err(corrupt(
                number,
                "size",
                format!("{} bytes do not fit a segment", size),
            ));
        }

        let mut buf = vec![0u8; size];
        buf[..script.len()].copy_from_slice(script);
        let heap_start = match (layout.version, heap) {
            (ScriptVersion::Sci11, Some(heap)) => {
                let start = script.len() + ScriptLayout::heap_padding(script.len());
                buf[start..start + heap.len()].copy_from_slice(heap);
                start
            }
            _ => script.len(),
        };

        let parsed = match layout.version {
            ScriptVersion::Sci0 => parse_sci0(number, &buf, script.len())?,
            ScriptVersion::Sci11 => parse_sci11(number, &mut buf, script.len(), heap_start)?,
        };

        let mut result = Script {
            segment,
            buf,
            script_size: script.len(),
            heap_start,
            exports: parsed.exports,
            synonyms: parsed.synonyms,
            code_ranges: parsed.code_ranges,
            ..Script::empty(number)
        };

        for base in &parsed.object_bases {
            result.instantiate_object(layout, *base as u16)?;
        }

        let mut locals = parsed.locals;
        for &offset in &parsed.relocations {
            relocate(
                &mut result,
                &mut locals,
                parsed.locals_range.as_ref(),
                offset,
                parsed.relocation_delta,
            );
        }

        Ok(LoadedScript {
            script: result,
            locals,
        })
    }
}

fn relocate(
    script: &mut Script,
    locals: &mut [Address],
    locals_range: Option<&Range<usize>>,
    offset: usize,
    delta: u16,
) {
    let segment = script.segment;
    if let Some(range) = locals_range {
        if range.contains(&offset) {
            let index = (offset - range.start) / 2;
            if let Some(slot) = locals.get_mut(index) {
                *slot = Address::new(segment, slot.offset.wrapping_add(delta));
            }
            return;
        }
    }

    for object in script.objects_mut() {
        let range = object.var_range();
        if range.contains(&offset) {
            let index = (offset - range.start) / 2;
            object.relocate_var(index, segment, delta);
            return;
        }
    }
    trace!(
        "script {}: relocation at 0x{:04x} outside objects and locals",
        script.number,
        offset
    );
}

fn parse_sci0(number: u16, buf: &[u8], script_len: usize) -> Result<Parsed, RuntimeError> {
    let layout = ScriptLayout::SCI0;
    let declared = ScriptLayout::declared_locals(buf).unwrap_or(0);
    let mut parsed = Parsed {
        exports: Vec::new(),
        synonyms: Vec::new(),
        code_ranges: Vec::new(),
        object_bases: Vec::new(),
        locals: vec![Address::NULL; declared],
        locals_range: None,
        relocations: Vec::new(),
        relocation_delta: 0,
    };

    let mut pos = layout.header_size;
    while pos + 2 <= script_len {
        let kind = word_at(buf, script_len, number, pos, "block type")?;
        if kind == BlockType::Terminator as u16 {
            break;
        }
        let size = word_at(buf, script_len, number, pos + 2, "block size")? as usize;
        if size < 4 || pos + size > script_len {
            return Err(corrupt(
                number,
                "block size",
                format!("block type {} at 0x{:04x} has size {}", kind, pos, size),
            ));
        }
        let body = pos + 4..pos + size;

        match BlockType::from_u16(kind) {
            Some(BlockType::Object) | Some(BlockType::Class) => {
                parsed.object_bases.push(body.start + layout.object_header_size);
            }
            Some(BlockType::Code) => parsed.code_ranges.push(body.clone()),
            Some(BlockType::Synonyms) => {
                let mut at = body.start;
                while at + 4 <= body.end {
                    parsed.synonyms.push(Synonym {
                        replaced: word_at(buf, body.end, number, at, "synonyms")?,
                        replacement: word_at(buf, body.end, number, at + 2, "synonyms")?,
                    });
                    at += 4;
                }
            }
            Some(BlockType::Exports) => {
                let count = word_at(buf, body.end, number, body.start, "export count")? as usize;
                for i in 0..count {
                    parsed.exports.push(word_at(
                        buf,
                        body.end,
                        number,
                        body.start + 2 + 2 * i,
                        "export table",
                    )?);
                }
            }
            Some(BlockType::Pointers) => {
                let count =
                    word_at(buf, body.end, number, body.start, "relocation count")? as usize;
                for i in 0..count {
                    let offset = word_at(
                        buf,
                        body.end,
                        number,
                        body.start + 2 + 2 * i,
                        "relocation table",
                    )?;
                    parsed.relocations.push(offset as usize);
                }
            }
            Some(BlockType::LocalVars) => {
                let available = body.len() / 2;
                if available > declared {
                    warn!(
                        "script {}: {} local values for {} declared locals",
                        number, available, declared
                    );
                }
                for i in 0..available.min(declared) {
                    parsed.locals[i] =
                        Address::from_u16(word_at(buf, body.end, number, body.start + 2 * i, "locals")?);
                }
                parsed.locals_range = Some(body.start..body.start + 2 * available);
            }
            Some(_) => {}
            None => {
                return Err(corrupt(
                    number,
                    "block type",
                    format!("unknown block type {} at 0x{:04x}", kind, pos),
                ));
            }
        }
        pos += size;
    }

    Ok(parsed)
}

fn parse_sci11(
    number: u16,
    buf: &mut [u8],
    script_len: usize,
    heap_start: usize,
) -> Result<Parsed, RuntimeError> {
    let reloc_offset = word_at(buf, script_len, number, 0, "relocation offset")? as usize;
    if reloc_offset != 0 {
        let count = word_at(buf, script_len, number, reloc_offset, "relocation count")? as usize;
        for i in 0..count {
            let target =
                word_at(buf, script_len, number, reloc_offset + 2 + 2 * i, "relocation table")?
                    as usize;
            let value = word_at(buf, script_len, number, target, "relocated word")?;
            write_u16(buf, target, value.wrapping_add(heap_start as u16));
        }
    }

    let export_count = word_at(buf, script_len, number, 6, "export count")? as usize;
    let mut exports = Vec::with_capacity(export_count);
    for i in 0..export_count {
        exports.push(word_at(buf, script_len, number, 8 + 2 * i, "export table")?);
    }
    let code_start = 8 + 2 * export_count;
    let code_end = if reloc_offset != 0 { reloc_offset } else { script_len };

    let limit = buf.len();
    let heap_reloc = word_at(buf, limit, number, heap_start, "heap relocation offset")? as usize;
    let local_count = word_at(buf, limit, number, heap_start + 2, "local count")? as usize;
    let locals_start = heap_start + 4;
    let mut locals = Vec::with_capacity(local_count);
    for i in 0..local_count {
        locals.push(Address::from_u16(word_at(
            buf,
            limit,
            number,
            locals_start + 2 * i,
            "locals",
        )?));
    }

    let mut object_bases = Vec::new();
    let mut pos = locals_start + 2 * local_count;
    loop {
        let magic = word_at(buf, limit, number, pos, "object magic")?;
        if magic == 0 {
            break;
        }
        if magic != OBJECT_MAGIC {
            return Err(corrupt(
                number,
                "object magic",
                format!("0x{:04x} at 0x{:04x}", magic, pos),
            ));
        }
        let var_count = word_at(buf, limit, number, pos + 2, "property count")? as usize;
        if var_count == 0 {
            return Err(corrupt(
                number,
                "property count",
                format!("empty object at 0x{:04x}", pos),
            ));
        }
        object_bases.push(pos);
        pos += 2 * var_count;
    }

    let mut relocations = Vec::new();
    if heap_reloc != 0 {
        let table = heap_start + heap_reloc;
        let count = word_at(buf, limit, number, table, "heap relocation count")? as usize;
        for i in 0..count {
            let entry =
                word_at(buf, limit, number, table + 2 + 2 * i, "heap relocation table")? as usize;
            relocations.push(heap_start + entry);
        }
    }

    Ok(Parsed {
        exports,
        synonyms: Vec::new(),
        code_ranges: vec![code_start..code_end.max(code_start)],
        object_bases,
        locals,
        locals_range: Some(locals_start..locals_start + 2 * local_count),
        relocations,
        relocation_delta: heap_start as u16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{ObjectDef, ScriptBuilder};

    const NAME: u16 = 30;
    const TITLE: u16 = 31;

    fn load(version: ScriptVersion, builder: &ScriptBuilder) -> Result<LoadedScript, RuntimeError> {
        let (script, heap) = builder.build().unwrap();
        Script::load(
            &ScriptLayout::for_version(version),
            builder.number(),
            3,
            &script,
            heap.as_deref(),
        )
    }

    #[test]
    fn test_string_properties_are_relocated() {
        for version in [ScriptVersion::Sci0, ScriptVersion::Sci11] {
            let mut builder = ScriptBuilder::new(version, 12);
            builder.asm().ret();
            builder
                .object(ObjectDef::class("Sign", 2).string_property(TITLE, "Welcome"))
                .local_string("Welcome")
                .local(4);
            let loaded = load(version, &builder).unwrap();
            let script = &loaded.script;

            let object = &script.objects()[0];
            let title = object.get_var(ScriptLayout::for_version(version).min_var_count).unwrap();
            assert_eq!(title.segment, 3);
            assert_eq!(script.read_cstring(title.offset as usize).as_deref(), Some("Welcome"));
            assert_eq!(object.name_address().segment, 3);

            assert_eq!(loaded.locals[0], title);
            assert_eq!(loaded.locals[1], Address::from_u16(4));
        }
    }

    #[test]
    fn test_exports_and_code_ranges() {
        let mut builder = ScriptBuilder::new(ScriptVersion::Sci0, 12);
        let entry = builder.asm().here();
        builder.asm().ldi(1).ret();
        builder.export_code(entry).synonym(40, 41);
        let loaded = load(ScriptVersion::Sci0, &builder).unwrap();
        let script = &loaded.script;

        assert_eq!(script.exports().len(), 1);
        let target = script.export_address(0).unwrap();
        assert!(script
            .code_ranges()
            .iter()
            .any(|r| r.contains(&(target.offset as usize))));
        assert_eq!(script.synonyms().len(), 1);
    }

    #[test]
    fn test_unknown_block_type_is_corrupt() {
        let mut builder = ScriptBuilder::new(ScriptVersion::Sci0, 12);
        builder.asm().ret();
        builder.object(ObjectDef::class("Thing", 1).property(NAME, 0));
        let (mut script, _) = builder.build().unwrap();
        script[4..6].copy_from_slice(&42u16.to_le_bytes());
        let result = Script::load(&ScriptLayout::SCI0, 12, 3, &script, None);
        assert!(matches!(result, Err(RuntimeError::ScriptCorrupt { script: 12, .. })));
    }

    #[test]
    fn test_missing_heap_is_reported() {
        let mut builder = ScriptBuilder::new(ScriptVersion::Sci11, 12);
        builder.asm().ret();
        let (script, _) = builder.build().unwrap();
        let result = Script::load(&ScriptLayout::SCI11, 12, 3, &script, None);
        assert!(matches!(result, Err(RuntimeError::ScriptNotFound { script: 12 })));
    }
}

//! Script assembler
//!
//! [`ScriptBuilder`] produces script resources in either on-disk layout from
//! a list of object definitions, local values and a block of assembled code.
//! [`Asm`] emits instructions with symbolic labels; jumps and calls are
//! resolved when the script is built, as are `lofsa`/`lofss` references to
//! objects and strings.
//!
//! Word-sized operands are always emitted in their word form.
//!
//! # Example
//!
//! ```
//! use scivm::script::{ObjectDef, ScriptBuilder, ScriptVersion};
//!
//! let mut builder = ScriptBuilder::new(ScriptVersion::Sci0, 10);
//! let look = builder.asm().here();
//! builder.asm().ldi(1).ret();
//! builder.object(ObjectDef::class("Thing", 7).property(30, 0).method(40, look));
//! let (script, heap) = builder.build().unwrap();
//! assert!(heap.is_none());
//! assert!(!script.is_empty());
//! ```

use super::layout::ScriptVersion;
use crate::interpreter::constants::{INFO_FLAG_CLASS, NO_SUPERCLASS, OBJECT_MAGIC};
use crate::interpreter::errors::VariableKind;
use crate::interpreter::opcodes::{self, VarAction, VarOp};
use rustc_hash::FxHashMap;
use std::fmt;

/// Selector ids given to the fixed header slots: slot `i` gets base + i
pub const HEADER_SELECTOR_BASE: u16 = 0x1000;

/// Error raised while laying out a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildError {
    pub message: String,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script build error: {}", self.message)
    }
}

impl std::error::Error for BuildError {}

fn build_error(message: impl Into<String>) -> BuildError {
    BuildError {
        message: message.into(),
    }
}

/// A code position, bound with [`Asm::bind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Initial value of a property or local variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Number(u16),
    /// Pointer to a string stored in the script
    Str(String),
    /// Pointer to a named object of the same script
    Object(String),
}

#[derive(Debug, Clone)]
enum Target {
    Label(Label),
    Object(String),
    Str(String),
}

#[derive(Debug, Clone)]
struct Fixup {
    /// Position of the operand word
    at: usize,
    /// Position of the following instruction
    next: usize,
    target: Target,
    lofs: bool,
}

/// Instruction emitter
#[derive(Debug, Clone, Default)]
pub struct Asm {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// A new, unbound label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position
    pub fn bind(&mut self, label: Label) -> &mut Self {
        if let Some(slot) = self.labels.get_mut(label.0) {
            *slot = Some(self.code.len());
        }
        self
    }

    /// A label bound to the current position
    pub fn here(&mut self) -> Label {
        let label = self.label();
        self.bind(label);
        label
    }

    /// Code offset of a bound label
    pub fn position(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0).copied().flatten()
    }

    fn word(&mut self, value: u16) -> &mut Self {
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn byte(&mut self, value: u8) -> &mut Self {
        self.code.push(value);
        self
    }

    /// Emit a no-operand op
    pub fn op(&mut self, op: u8) -> &mut Self {
        self.code.push(op << 1);
        self
    }

    /// Emit bytes verbatim
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    fn fixup(&mut self, target: Target, lofs: bool, trailing: usize) {
        let at = self.code.len();
        self.word(0);
        self.fixups.push(Fixup {
            at,
            next: at + 2 + trailing,
            target,
            lofs,
        });
    }

    pub fn ldi(&mut self, value: i16) -> &mut Self {
        self.op(opcodes::LDI).word(value as u16)
    }

    pub fn pushi(&mut self, value: i16) -> &mut Self {
        self.op(opcodes::PUSHI).word(value as u16)
    }

    pub fn push(&mut self) -> &mut Self {
        self.op(opcodes::PUSH)
    }

    pub fn push0(&mut self) -> &mut Self {
        self.op(opcodes::PUSH0)
    }

    pub fn push1(&mut self) -> &mut Self {
        self.op(opcodes::PUSH1)
    }

    pub fn push2(&mut self) -> &mut Self {
        self.op(opcodes::PUSH2)
    }

    pub fn push_self(&mut self) -> &mut Self {
        self.op(opcodes::PUSH_SELF)
    }

    pub fn toss(&mut self) -> &mut Self {
        self.op(opcodes::TOSS)
    }

    pub fn dup(&mut self) -> &mut Self {
        self.op(opcodes::DUP)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(opcodes::RET)
    }

    pub fn self_id(&mut self) -> &mut Self {
        self.op(opcodes::SELF_ID)
    }

    pub fn pprev(&mut self) -> &mut Self {
        self.op(opcodes::PPREV)
    }

    fn branch(&mut self, op: u8, target: Label) -> &mut Self {
        self.op(op);
        self.fixup(Target::Label(target), false, 0);
        self
    }

    pub fn bt(&mut self, target: Label) -> &mut Self {
        self.branch(opcodes::BT, target)
    }

    pub fn bnt(&mut self, target: Label) -> &mut Self {
        self.branch(opcodes::BNT, target)
    }

    pub fn jmp(&mut self, target: Label) -> &mut Self {
        self.branch(opcodes::JMP, target)
    }

    /// Reserve `temps` temporary variables
    pub fn link(&mut self, temps: u16) -> &mut Self {
        self.op(opcodes::LINK).word(temps)
    }

    /// Call a local procedure with `argc` arguments already pushed after argc
    pub fn call(&mut self, target: Label, argc: u8) -> &mut Self {
        self.op(opcodes::CALL);
        self.fixup(Target::Label(target), false, 1);
        self.byte(argc * 2)
    }

    pub fn callk(&mut self, kernel: u16, argc: u8) -> &mut Self {
        self.op(opcodes::CALLK).word(kernel).byte(argc * 2)
    }

    pub fn callb(&mut self, export: u16, argc: u8) -> &mut Self {
        self.op(opcodes::CALLB).word(export).byte(argc * 2)
    }

    pub fn calle(&mut self, script: u16, export: u16, argc: u8) -> &mut Self {
        self.op(opcodes::CALLE)
            .word(script)
            .word(export)
            .byte(argc * 2)
    }

    /// Send to the accumulator; `words` counts every pushed selector,
    /// argc and argument
    pub fn send(&mut self, words: u8) -> &mut Self {
        self.op(opcodes::SEND).byte(words * 2)
    }

    pub fn send_self(&mut self, words: u8) -> &mut Self {
        self.op(opcodes::SELF).byte(words * 2)
    }

    pub fn send_super(&mut self, species: u16, words: u8) -> &mut Self {
        self.op(opcodes::SUPER).word(species).byte(words * 2)
    }

    pub fn class(&mut self, species: u16) -> &mut Self {
        self.op(opcodes::CLASS).word(species)
    }

    /// Push parameters `first..=argc` for the next call
    pub fn rest(&mut self, first: u16) -> &mut Self {
        self.op(opcodes::REST).word(first)
    }

    pub fn lea(&mut self, kind: VariableKind, index: u16) -> &mut Self {
        self.op(opcodes::LEA)
            .word((kind.bits() as u16) << 1)
            .word(index)
    }

    fn prop(&mut self, op: u8, index: u16) -> &mut Self {
        self.op(op).word(index * 2)
    }

    pub fn p_to_a(&mut self, index: u16) -> &mut Self {
        self.prop(opcodes::P_TO_A, index)
    }

    pub fn a_to_p(&mut self, index: u16) -> &mut Self {
        self.prop(opcodes::A_TO_P, index)
    }

    pub fn p_to_s(&mut self, index: u16) -> &mut Self {
        self.prop(opcodes::P_TO_S, index)
    }

    pub fn s_to_p(&mut self, index: u16) -> &mut Self {
        self.prop(opcodes::S_TO_P, index)
    }

    pub fn ip_to_a(&mut self, index: u16) -> &mut Self {
        self.prop(opcodes::IP_TO_A, index)
    }

    pub fn dp_to_a(&mut self, index: u16) -> &mut Self {
        self.prop(opcodes::DP_TO_A, index)
    }

    pub fn ip_to_s(&mut self, index: u16) -> &mut Self {
        self.prop(opcodes::IP_TO_S, index)
    }

    pub fn dp_to_s(&mut self, index: u16) -> &mut Self {
        self.prop(opcodes::DP_TO_S, index)
    }

    pub fn lofsa_object(&mut self, name: &str) -> &mut Self {
        self.op(opcodes::LOFSA);
        self.fixup(Target::Object(name.to_string()), true, 0);
        self
    }

    pub fn lofss_object(&mut self, name: &str) -> &mut Self {
        self.op(opcodes::LOFSS);
        self.fixup(Target::Object(name.to_string()), true, 0);
        self
    }

    pub fn lofsa_string(&mut self, text: &str) -> &mut Self {
        self.op(opcodes::LOFSA);
        self.fixup(Target::Str(text.to_string()), true, 0);
        self
    }

    pub fn lofss_string(&mut self, text: &str) -> &mut Self {
        self.op(opcodes::LOFSS);
        self.fixup(Target::Str(text.to_string()), true, 0);
        self
    }

    pub fn var(&mut self, action: VarAction, kind: VariableKind, index: u16) -> &mut Self {
        let op = VarOp {
            action,
            kind,
            acc_indexed: false,
        };
        self.op(op.encode()).word(index)
    }

    /// Variable op whose index is offset by the accumulator
    pub fn var_indexed(&mut self, action: VarAction, kind: VariableKind, index: u16) -> &mut Self {
        let op = VarOp {
            action,
            kind,
            acc_indexed: true,
        };
        self.op(op.encode()).word(index)
    }

    pub fn load(&mut self, kind: VariableKind, index: u16) -> &mut Self {
        self.var(VarAction::LoadAcc, kind, index)
    }

    pub fn store(&mut self, kind: VariableKind, index: u16) -> &mut Self {
        self.var(VarAction::StoreAcc, kind, index)
    }

    pub fn push_var(&mut self, kind: VariableKind, index: u16) -> &mut Self {
        self.var(VarAction::LoadStack, kind, index)
    }

    fn strings(&self) -> impl Iterator<Item = &str> {
        self.fixups.iter().filter_map(|f| match &f.target {
            Target::Str(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Code with every fixup applied, placed at `code_base` in the buffer
    fn link_code(
        &self,
        code_base: usize,
        lofs_absolute: bool,
        symbols: &Symbols,
    ) -> Result<Vec<u8>, BuildError> {
        let mut code = self.code.clone();
        for fixup in &self.fixups {
            let value: i64 = match &fixup.target {
                Target::Label(label) if !fixup.lofs => {
                    let pos = self
                        .position(*label)
                        .ok_or_else(|| build_error(format!("label {} is not bound", label.0)))?;
                    pos as i64 - fixup.next as i64
                }
                target => {
                    let absolute = match target {
                        Target::Label(label) => {
                            code_base
                                + self.position(*label).ok_or_else(|| {
                                    build_error(format!("label {} is not bound", label.0))
                                })?
                        }
                        Target::Object(name) => symbols.object(name)?,
                        Target::Str(text) => symbols.string(text)?,
                    };
                    if lofs_absolute {
                        absolute as i64
                    } else {
                        absolute as i64 - (code_base + fixup.next) as i64
                    }
                }
            };
            if !(i16::MIN as i64..=u16::MAX as i64).contains(&value) {
                return Err(build_error(format!(
                    "operand {} at 0x{:04x} does not fit a word",
                    value, fixup.at
                )));
            }
            code[fixup.at..fixup.at + 2].copy_from_slice(&(value as u16).to_le_bytes());
        }
        Ok(code)
    }
}

/// An object or class record to be emitted
#[derive(Debug, Clone)]
pub struct ObjectDef {
    name: String,
    species: u16,
    superclass: u16,
    is_class: bool,
    properties: Vec<(u16, PropValue)>,
    methods: Vec<(u16, Label)>,
}

impl ObjectDef {
    /// A class with species number `species` and no superclass
    pub fn class(name: &str, species: u16) -> Self {
        ObjectDef {
            name: name.to_string(),
            species,
            superclass: NO_SUPERCLASS,
            is_class: true,
            properties: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// An instance of class `species`
    pub fn instance(name: &str, species: u16) -> Self {
        ObjectDef {
            name: name.to_string(),
            species,
            superclass: species,
            is_class: false,
            properties: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn superclass(mut self, species: u16) -> Self {
        self.superclass = species;
        self
    }

    pub fn property(mut self, selector: u16, value: u16) -> Self {
        self.properties.push((selector, PropValue::Number(value)));
        self
    }

    pub fn string_property(mut self, selector: u16, text: &str) -> Self {
        self.properties
            .push((selector, PropValue::Str(text.to_string())));
        self
    }

    pub fn object_property(mut self, selector: u16, object: &str) -> Self {
        self.properties
            .push((selector, PropValue::Object(object.to_string())));
        self
    }

    pub fn method(mut self, selector: u16, code: Label) -> Self {
        self.methods.push((selector, code));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
enum Export {
    Code(Label),
    Object(String),
}

/// Resolved buffer offsets of named objects and strings
#[derive(Debug, Default)]
struct Symbols {
    objects: FxHashMap<String, usize>,
    strings: FxHashMap<String, usize>,
}

impl Symbols {
    fn object(&self, name: &str) -> Result<usize, BuildError> {
        self.objects
            .get(name)
            .copied()
            .ok_or_else(|| build_error(format!("unknown object '{}'", name)))
    }

    fn string(&self, text: &str) -> Result<usize, BuildError> {
        self.strings
            .get(text)
            .copied()
            .ok_or_else(|| build_error(format!("unknown string '{}'", text)))
    }

    fn value(&self, value: &PropValue) -> Result<(u16, bool), BuildError> {
        Ok(match value {
            PropValue::Number(n) => (*n, false),
            PropValue::Str(text) => (self.string(text)? as u16, true),
            PropValue::Object(name) => (self.object(name)? as u16, true),
        })
    }
}

/// Little-endian word sink with relocation bookkeeping
#[derive(Debug, Default)]
struct Image {
    bytes: Vec<u8>,
}

impl Image {
    fn word(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn pad_even(&mut self) {
        if self.bytes.len() % 2 == 1 {
            self.bytes.push(0);
        }
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }
}

fn string_block_size(strings: &[String]) -> usize {
    let raw: usize = strings.iter().map(|s| s.len() + 1).sum();
    raw + (raw & 1)
}

/// Assembles one script resource
#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    version: ScriptVersion,
    number: u16,
    asm: Asm,
    objects: Vec<ObjectDef>,
    locals: Vec<PropValue>,
    exports: Vec<Export>,
    synonyms: Vec<(u16, u16)>,
}

impl ScriptBuilder {
    pub fn new(version: ScriptVersion, number: u16) -> Self {
        ScriptBuilder {
            version,
            number,
            asm: Asm::new(),
            objects: Vec::new(),
            locals: Vec::new(),
            exports: Vec::new(),
            synonyms: Vec::new(),
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn version(&self) -> ScriptVersion {
        self.version
    }

    /// The script's code
    pub fn asm(&mut self) -> &mut Asm {
        &mut self.asm
    }

    pub fn object(&mut self, def: ObjectDef) -> &mut Self {
        self.objects.push(def);
        self
    }

    pub fn local(&mut self, value: u16) -> &mut Self {
        self.locals.push(PropValue::Number(value));
        self
    }

    pub fn local_string(&mut self, text: &str) -> &mut Self {
        self.locals.push(PropValue::Str(text.to_string()));
        self
    }

    pub fn local_object(&mut self, name: &str) -> &mut Self {
        self.locals.push(PropValue::Object(name.to_string()));
        self
    }

    /// Append `count` zeroed locals
    pub fn locals(&mut self, count: usize) -> &mut Self {
        self.locals
            .extend(std::iter::repeat(PropValue::Number(0)).take(count));
        self
    }

    pub fn export_code(&mut self, label: Label) -> &mut Self {
        self.exports.push(Export::Code(label));
        self
    }

    pub fn export_object(&mut self, name: &str) -> &mut Self {
        self.exports.push(Export::Object(name.to_string()));
        self
    }

    /// Said-word synonym (pre-1.1 only)
    pub fn synonym(&mut self, replaced: u16, replacement: u16) -> &mut Self {
        self.synonyms.push((replaced, replacement));
        self
    }

    /// Unique strings in first-use order
    fn string_table(&self) -> Vec<String> {
        let mut table: Vec<String> = Vec::new();
        let mut add = |s: &str| {
            if !table.iter().any(|t| t == s) {
                table.push(s.to_string());
            }
        };
        for def in &self.objects {
            add(&def.name);
            for (_, value) in &def.properties {
                if let PropValue::Str(s) = value {
                    add(s);
                }
            }
        }
        for value in &self.locals {
            if let PropValue::Str(s) = value {
                add(s);
            }
        }
        for s in self.asm.strings() {
            add(s);
        }
        table
    }

    fn header_slots(&self) -> usize {
        match self.version {
            ScriptVersion::Sci0 => 4,
            ScriptVersion::Sci11 => 9,
        }
    }

    fn selectors(&self, def: &ObjectDef) -> Vec<u16> {
        (0..self.header_slots() as u16)
            .map(|i| HEADER_SELECTOR_BASE + i)
            .chain(def.properties.iter().map(|(sel, _)| *sel))
            .collect()
    }

    fn export_value(&self, export: &Export, code_base: usize, symbols: &Symbols) -> Result<u16, BuildError> {
        Ok(match export {
            Export::Code(label) => {
                let pos = self
                    .asm
                    .position(*label)
                    .ok_or_else(|| build_error("exported label is not bound"))?;
                (code_base + pos) as u16
            }
            Export::Object(name) => symbols.object(name)? as u16,
        })
    }

    fn method_offset(&self, label: Label, code_base: usize) -> Result<u16, BuildError> {
        self.asm
            .position(label)
            .map(|pos| (code_base + pos) as u16)
            .ok_or_else(|| build_error("method label is not bound"))
    }

    /// The script resource and, for 1.1+, the heap resource
    pub fn build(&self) -> Result<(Vec<u8>, Option<Vec<u8>>), BuildError> {
        let result = match self.version {
            ScriptVersion::Sci0 => (self.build_sci0()?, None),
            ScriptVersion::Sci11 => {
                let (script, heap) = self.build_sci11()?;
                (script, Some(heap))
            }
        };
        let total = result.0.len() + result.1.as_ref().map_or(0, |h| h.len() + 1);
        if total > u16::MAX as usize {
            return Err(build_error(format!("script is {} bytes", total)));
        }
        Ok(result)
    }

    fn build_sci0(&self) -> Result<Vec<u8>, BuildError> {
        const BLOCK_HEADER: usize = 4;
        let strings = self.string_table();
        let mut symbols = Symbols::default();

        // First pass: positions
        let mut pos = 4;
        if !self.exports.is_empty() {
            pos += BLOCK_HEADER + 2 + 2 * self.exports.len();
        }
        if !self.synonyms.is_empty() {
            pos += BLOCK_HEADER + 4 * self.synonyms.len();
        }
        let mut object_blocks = Vec::with_capacity(self.objects.len());
        for def in &self.objects {
            let vars = self.header_slots() + def.properties.len();
            let selectors = if def.is_class { 2 * vars } else { 0 };
            let size = BLOCK_HEADER + 8 + 2 * vars + selectors + 4 + 4 * def.methods.len();
            object_blocks.push((pos, size));
            symbols
                .objects
                .insert(def.name.clone(), pos + BLOCK_HEADER + 8);
            pos += size;
        }
        let mut at = pos + BLOCK_HEADER;
        for s in &strings {
            symbols.strings.insert(s.clone(), at);
            at += s.len() + 1;
        }
        pos += BLOCK_HEADER + string_block_size(&strings);
        let code_base = pos + BLOCK_HEADER;
        pos += BLOCK_HEADER + self.asm.len() + (self.asm.len() & 1);
        let locals_base = pos + BLOCK_HEADER;

        let code = self.asm.link_code(code_base, false, &symbols)?;

        // Second pass: emit
        let mut image = Image::default();
        let mut relocations = Vec::new();
        image.word(self.locals.len() as u16);
        image.word(0);

        if !self.exports.is_empty() {
            image.word(7);
            image.word((BLOCK_HEADER + 2 + 2 * self.exports.len()) as u16);
            image.word(self.exports.len() as u16);
            for export in &self.exports {
                image.word(self.export_value(export, code_base, &symbols)?);
            }
        }
        if !self.synonyms.is_empty() {
            image.word(3);
            image.word((BLOCK_HEADER + 4 * self.synonyms.len()) as u16);
            for &(replaced, replacement) in &self.synonyms {
                image.word(replaced);
                image.word(replacement);
            }
        }

        for (def, &(block_pos, size)) in self.objects.iter().zip(&object_blocks) {
            debug_assert_eq!(image.len(), block_pos);
            let vars = self.header_slots() + def.properties.len();
            let base = block_pos + BLOCK_HEADER + 8;
            let selectors = if def.is_class { 2 * vars } else { 0 };
            image.word(if def.is_class { 6 } else { 1 });
            image.word(size as u16);
            image.word(OBJECT_MAGIC);
            image.word(0);
            image.word((2 * vars + selectors) as u16);
            image.word(vars as u16);

            let info = if def.is_class { INFO_FLAG_CLASS } else { 0 };
            image.word(def.species);
            image.word(def.superclass);
            image.word(info);
            relocations.push(image.len());
            image.word(symbols.string(&def.name)? as u16);
            for (_, value) in &def.properties {
                let (word, relocated) = symbols.value(value)?;
                if relocated {
                    relocations.push(image.len());
                }
                image.word(word);
            }
            debug_assert_eq!(base + 2 * vars, image.len());
            if def.is_class {
                for selector in self.selectors(def) {
                    image.word(selector);
                }
            }
            image.word(def.methods.len() as u16);
            for (selector, _) in &def.methods {
                image.word(*selector);
            }
            image.word(0);
            for (_, label) in &def.methods {
                image.word(self.method_offset(*label, code_base)?);
            }
        }

        image.word(5);
        image.word((BLOCK_HEADER + string_block_size(&strings)) as u16);
        for s in &strings {
            image.bytes.extend_from_slice(s.as_bytes());
            image.bytes.push(0);
        }
        image.pad_even();

        image.word(2);
        image.word((BLOCK_HEADER + code.len() + (code.len() & 1)) as u16);
        image.bytes.extend_from_slice(&code);
        image.pad_even();

        if !self.locals.is_empty() {
            debug_assert_eq!(image.len() + BLOCK_HEADER, locals_base);
            image.word(10);
            image.word((BLOCK_HEADER + 2 * self.locals.len()) as u16);
            for value in &self.locals {
                let (word, relocated) = symbols.value(value)?;
                if relocated {
                    relocations.push(image.len());
                }
                image.word(word);
            }
        }

        image.word(8);
        image.word((BLOCK_HEADER + 2 + 2 * relocations.len()) as u16);
        image.word(relocations.len() as u16);
        for offset in &relocations {
            image.word(*offset as u16);
        }
        image.word(0);
        Ok(image.bytes)
    }

    fn build_sci11(&self) -> Result<(Vec<u8>, Vec<u8>), BuildError> {
        let strings = self.string_table();
        let mut symbols = Symbols::default();

        // Script part positions
        let code_base = 8 + 2 * self.exports.len();
        let code_end = code_base + self.asm.len() + (self.asm.len() & 1);
        let object_exports = self
            .exports
            .iter()
            .filter(|e| matches!(e, Export::Object(_)))
            .count();
        let reloc_table = code_end;
        let mut pos = reloc_table + 2 + 2 * object_exports;
        let mut dicts = Vec::with_capacity(self.objects.len());
        for def in &self.objects {
            let vars = self.header_slots() + def.properties.len();
            let prop_dict = pos;
            let method_dict = prop_dict + 2 * vars;
            pos = method_dict + 2 + 4 * def.methods.len();
            dicts.push((prop_dict, method_dict));
        }
        let script_size = pos;
        let heap_start = script_size + (script_size & 1);

        // Heap part positions, heap-relative
        let mut hpos = 4 + 2 * self.locals.len();
        for def in &self.objects {
            symbols.objects.insert(def.name.clone(), hpos);
            hpos += 2 * (self.header_slots() + def.properties.len());
        }
        hpos += 2;
        for s in &strings {
            symbols.strings.insert(s.clone(), hpos);
            hpos += s.len() + 1;
        }
        hpos += hpos & 1;
        let heap_reloc_table = hpos;

        // lofs operands are absolute buffer offsets
        let absolute = Symbols {
            objects: symbols
                .objects
                .iter()
                .map(|(k, v)| (k.clone(), heap_start + v))
                .collect(),
            strings: symbols
                .strings
                .iter()
                .map(|(k, v)| (k.clone(), heap_start + v))
                .collect(),
        };
        let code = self.asm.link_code(code_base, true, &absolute)?;

        // Script part
        let mut script = Image::default();
        script.word(reloc_table as u16);
        script.word(0);
        script.word(0);
        script.word(self.exports.len() as u16);
        let mut script_relocs = Vec::new();
        for export in &self.exports {
            if matches!(export, Export::Object(_)) {
                script_relocs.push(script.len());
            }
            script.word(self.export_value(export, code_base, &symbols)?);
        }
        script.bytes.extend_from_slice(&code);
        script.pad_even();
        script.word(script_relocs.len() as u16);
        for offset in &script_relocs {
            script.word(*offset as u16);
        }
        for def in &self.objects {
            for selector in self.selectors(def) {
                script.word(selector);
            }
            script.word(def.methods.len() as u16);
            for (selector, label) in &def.methods {
                script.word(*selector);
                script.word(self.method_offset(*label, code_base)?);
            }
        }
        debug_assert_eq!(script.len(), script_size);

        // Heap part
        let mut heap = Image::default();
        let mut heap_relocs = Vec::new();
        heap.word(heap_reloc_table as u16);
        heap.word(self.locals.len() as u16);
        for value in &self.locals {
            let (word, relocated) = symbols.value(value)?;
            if relocated {
                heap_relocs.push(heap.len());
            }
            heap.word(word);
        }
        for (def, &(prop_dict, method_dict)) in self.objects.iter().zip(&dicts) {
            let vars = self.header_slots() + def.properties.len();
            let info = if def.is_class { INFO_FLAG_CLASS } else { 0 };
            heap.word(OBJECT_MAGIC);
            heap.word(vars as u16);
            heap.word(prop_dict as u16);
            heap.word(method_dict as u16);
            heap.word(self.number);
            heap.word(def.species);
            heap.word(def.superclass);
            heap.word(info);
            heap_relocs.push(heap.len());
            heap.word(symbols.string(&def.name)? as u16);
            for (_, value) in &def.properties {
                let (word, relocated) = symbols.value(value)?;
                if relocated {
                    heap_relocs.push(heap.len());
                }
                heap.word(word);
            }
        }
        heap.word(0);
        for s in &strings {
            heap.bytes.extend_from_slice(s.as_bytes());
            heap.bytes.push(0);
        }
        heap.pad_even();
        debug_assert_eq!(heap.len(), heap_reloc_table);
        heap.word(heap_relocs.len() as u16);
        for offset in &heap_relocs {
            heap.word(*offset as u16);
        }
        Ok((script.bytes, heap.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::layout::read_u16;

    #[test]
    fn test_branch_is_relative_to_next_instruction() {
        let mut asm = Asm::new();
        let end = asm.label();
        asm.jmp(end).ldi(1).bind(end).ret();
        let code = asm.link_code(0, false, &Symbols::default()).unwrap();
        // jmp skips the 3-byte ldi
        assert_eq!(read_u16(&code, 1), Some(3));
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut asm = Asm::new();
        let nowhere = asm.label();
        asm.jmp(nowhere);
        assert!(asm.link_code(0, false, &Symbols::default()).is_err());
    }

    #[test]
    fn test_sci0_header_declares_locals() {
        let mut builder = ScriptBuilder::new(ScriptVersion::Sci0, 1);
        builder.locals(3);
        builder.asm().ret();
        let (script, heap) = builder.build().unwrap();
        assert!(heap.is_none());
        assert_eq!(read_u16(&script, 0), Some(3));
    }

    #[test]
    fn test_sci11_heap_lists_locals() {
        let mut builder = ScriptBuilder::new(ScriptVersion::Sci11, 1);
        builder.local(5).local(6);
        builder.asm().ret();
        let (_, heap) = builder.build().unwrap();
        let heap = heap.unwrap();
        assert_eq!(read_u16(&heap, 2), Some(2));
        assert_eq!(read_u16(&heap, 4), Some(5));
    }

    #[test]
    fn test_unknown_object_reference() {
        let mut builder = ScriptBuilder::new(ScriptVersion::Sci0, 1);
        builder.asm().lofsa_object("missing").ret();
        let err = builder.build().unwrap_err();
        assert!(err.message.contains("missing"));
    }
}

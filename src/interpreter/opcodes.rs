//! Instruction encoding
//!
//! An opcode byte is `op << 1 | byte_flag`. With the flag set, word-sized
//! operands are stored as single bytes; `Byte` operands are always one byte.
//!
//! Ops `0x40..=0x7f` are the variable families, decoded by [`VarOp::decode`].

use super::errors::VariableKind;

pub const BNOT: u8 = 0x00;
pub const ADD: u8 = 0x01;
pub const SUB: u8 = 0x02;
pub const MUL: u8 = 0x03;
pub const DIV: u8 = 0x04;
pub const MOD: u8 = 0x05;
pub const SHR: u8 = 0x06;
pub const SHL: u8 = 0x07;
pub const XOR: u8 = 0x08;
pub const AND: u8 = 0x09;
pub const OR: u8 = 0x0a;
pub const NEG: u8 = 0x0b;
pub const NOT: u8 = 0x0c;
pub const EQ: u8 = 0x0d;
pub const NE: u8 = 0x0e;
pub const GT: u8 = 0x0f;
pub const GE: u8 = 0x10;
pub const LT: u8 = 0x11;
pub const LE: u8 = 0x12;
pub const UGT: u8 = 0x13;
pub const UGE: u8 = 0x14;
pub const ULT: u8 = 0x15;
pub const ULE: u8 = 0x16;
pub const BT: u8 = 0x17;
pub const BNT: u8 = 0x18;
pub const JMP: u8 = 0x19;
pub const LDI: u8 = 0x1a;
pub const PUSH: u8 = 0x1b;
pub const PUSHI: u8 = 0x1c;
pub const TOSS: u8 = 0x1d;
pub const DUP: u8 = 0x1e;
pub const LINK: u8 = 0x1f;
pub const CALL: u8 = 0x20;
pub const CALLK: u8 = 0x21;
pub const CALLB: u8 = 0x22;
pub const CALLE: u8 = 0x23;
pub const RET: u8 = 0x24;
pub const SEND: u8 = 0x25;
pub const CLASS: u8 = 0x28;
pub const SELF: u8 = 0x2a;
pub const SUPER: u8 = 0x2b;
pub const REST: u8 = 0x2c;
pub const LEA: u8 = 0x2d;
pub const SELF_ID: u8 = 0x2e;
pub const PPREV: u8 = 0x30;
pub const P_TO_A: u8 = 0x31;
pub const A_TO_P: u8 = 0x32;
pub const P_TO_S: u8 = 0x33;
pub const S_TO_P: u8 = 0x34;
pub const IP_TO_A: u8 = 0x35;
pub const DP_TO_A: u8 = 0x36;
pub const IP_TO_S: u8 = 0x37;
pub const DP_TO_S: u8 = 0x38;
pub const LOFSA: u8 = 0x39;
pub const LOFSS: u8 = 0x3a;
pub const PUSH0: u8 = 0x3b;
pub const PUSH1: u8 = 0x3c;
pub const PUSH2: u8 = 0x3d;
pub const PUSH_SELF: u8 = 0x3e;

/// First op of the variable families
pub const VAR_OPS: u8 = 0x40;

/// Operand kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Signed branch/call displacement from the next instruction
    Rel,
    /// Signed immediate
    SVar,
    /// Unsigned immediate
    Var,
    /// Always a single unsigned byte
    Byte,
}

impl Operand {
    pub fn size(&self, byte_form: bool) -> usize {
        match self {
            Operand::Byte => 1,
            _ if byte_form => 1,
            _ => 2,
        }
    }
}

use Operand::*;

const NAMES: [&str; 0x40] = [
    "bnot", "add", "sub", "mul", "div", "mod", "shr", "shl", "xor", "and", "or", "neg", "not",
    "eq?", "ne?", "gt?", "ge?", "lt?", "le?", "ugt?", "uge?", "ult?", "ule?", "bt", "bnt", "jmp",
    "ldi", "push", "pushi", "toss", "dup", "link", "call", "callk", "callb", "calle", "ret",
    "send", "", "", "class", "", "self", "super", "&rest", "lea", "selfID", "", "pprev", "pToa",
    "aTop", "pTos", "sTop", "ipToa", "dpToa", "ipTos", "dpTos", "lofsa", "lofss", "push0",
    "push1", "push2", "pushSelf", "",
];

/// Mnemonic for `op`
pub fn name(op: u8) -> Option<String> {
    if op >= VAR_OPS {
        return VarOp::decode(op).map(|v| v.mnemonic());
    }
    NAMES
        .get(op as usize)
        .filter(|n| !n.is_empty())
        .map(|n| n.to_string())
}

/// Operand kinds of `op`, `None` for undefined ops
pub fn operands(op: u8) -> Option<&'static [Operand]> {
    Some(match op {
        BNOT..=ULE => &[],
        BT | BNT | JMP => &[Rel],
        LDI | PUSHI => &[SVar],
        PUSH | TOSS | DUP => &[],
        LINK => &[Var],
        CALL => &[Rel, Byte],
        CALLK | CALLB => &[Var, Byte],
        CALLE => &[Var, Var, Byte],
        RET => &[],
        SEND => &[Byte],
        CLASS => &[Var],
        SELF => &[Byte],
        SUPER => &[Var, Byte],
        REST => &[Var],
        LEA => &[Var, Var],
        SELF_ID | PPREV => &[],
        P_TO_A..=DP_TO_S => &[Var],
        LOFSA | LOFSS => &[Rel],
        PUSH0..=PUSH_SELF => &[],
        VAR_OPS..=0x7f => &[Var],
        _ => return None,
    })
}

/// A decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: u8,
    pub byte_form: bool,
    pub operands: [i32; 3],
    pub operand_count: usize,
    /// Encoded length including the opcode byte
    pub len: usize,
}

impl Instruction {
    pub fn operand(&self, index: usize) -> i32 {
        self.operands[index]
    }
}

/// Why decoding failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Undefined opcode byte
    Invalid(u8),
    /// Instruction runs past the end of the code
    Truncated,
}

/// Decode the instruction at `pc`
pub fn decode(code: &[u8], pc: usize) -> Result<Instruction, DecodeError> {
    let opcode = *code.get(pc).ok_or(DecodeError::Truncated)?;
    let op = opcode >> 1;
    let byte_form = opcode & 1 != 0;
    let kinds = operands(op).ok_or(DecodeError::Invalid(opcode))?;

    let mut inst = Instruction {
        op,
        byte_form,
        operands: [0; 3],
        operand_count: kinds.len(),
        len: 1,
    };
    for (i, kind) in kinds.iter().enumerate() {
        let at = pc + inst.len;
        let value = match (kind.size(byte_form), kind) {
            (1, Rel | SVar) => *code.get(at).ok_or(DecodeError::Truncated)? as i8 as i32,
            (1, _) => *code.get(at).ok_or(DecodeError::Truncated)? as i32,
            (_, kind) => {
                let bytes = code.get(at..at + 2).ok_or(DecodeError::Truncated)?;
                let word = u16::from_le_bytes([bytes[0], bytes[1]]);
                match kind {
                    Rel | SVar => word as i16 as i32,
                    _ => word as i32,
                }
            }
        };
        inst.operands[i] = value;
        inst.len += kind.size(byte_form);
    }
    Ok(inst)
}

/// What a variable op does with the variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarAction {
    LoadAcc,
    LoadStack,
    StoreAcc,
    StoreStack,
    IncAcc,
    IncStack,
    DecAcc,
    DecStack,
}

/// A decoded variable-family op
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarOp {
    pub action: VarAction,
    pub kind: VariableKind,
    /// Index is offset by the accumulator
    pub acc_indexed: bool,
}

impl VarOp {
    pub fn decode(op: u8) -> Option<VarOp> {
        if !(VAR_OPS..=0x7f).contains(&op) {
            return None;
        }
        let action = match (op >> 3) & 7 {
            0 => VarAction::LoadAcc,
            1 => VarAction::LoadStack,
            2 => VarAction::StoreAcc,
            3 => VarAction::StoreStack,
            4 => VarAction::IncAcc,
            5 => VarAction::IncStack,
            6 => VarAction::DecAcc,
            _ => VarAction::DecStack,
        };
        Some(VarOp {
            action,
            kind: VariableKind::from_bits(op),
            acc_indexed: op & 4 != 0,
        })
    }

    pub fn encode(&self) -> u8 {
        let family = match self.action {
            VarAction::LoadAcc => 0,
            VarAction::LoadStack => 1,
            VarAction::StoreAcc => 2,
            VarAction::StoreStack => 3,
            VarAction::IncAcc => 4,
            VarAction::IncStack => 5,
            VarAction::DecAcc => 6,
            VarAction::DecStack => 7,
        };
        VAR_OPS | family << 3 | (self.acc_indexed as u8) << 2 | self.kind.bits()
    }

    pub fn mnemonic(&self) -> String {
        let prefix = match self.action {
            VarAction::LoadAcc => "la",
            VarAction::LoadStack => "ls",
            VarAction::StoreAcc => "sa",
            VarAction::StoreStack => "ss",
            VarAction::IncAcc => "+a",
            VarAction::IncStack => "+s",
            VarAction::DecAcc => "-a",
            VarAction::DecStack => "-s",
        };
        let kind = match self.kind {
            VariableKind::Global => 'g',
            VariableKind::Local => 'l',
            VariableKind::Temp => 't',
            VariableKind::Param => 'p',
        };
        let indexed = if self.acc_indexed { "i" } else { "" };
        format!("{}{}{}", prefix, kind, indexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_word_and_byte_forms() {
        // ldi -2 (word form), then pushi 5 (byte form)
        let code = [LDI << 1, 0xfe, 0xff, PUSHI << 1 | 1, 5];
        let ldi = decode(&code, 0).unwrap();
        assert_eq!(ldi.op, LDI);
        assert_eq!(ldi.operand(0), -2);
        assert_eq!(ldi.len, 3);

        let pushi = decode(&code, 3).unwrap();
        assert!(pushi.byte_form);
        assert_eq!(pushi.operand(0), 5);
        assert_eq!(pushi.len, 2);
    }

    #[test]
    fn test_frame_operand_is_always_a_byte() {
        let code = [CALLK << 1, 0x03, 0x00, 0x04];
        let inst = decode(&code, 0).unwrap();
        assert_eq!(inst.operands[..2], [3, 4]);
        assert_eq!(inst.len, 4);
    }

    #[test]
    fn test_undefined_and_truncated() {
        assert_eq!(decode(&[0x26 << 1], 0), Err(DecodeError::Invalid(0x4c)));
        assert_eq!(decode(&[JMP << 1, 0x01], 0), Err(DecodeError::Truncated));
        assert_eq!(decode(&[], 0), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_var_op_families() {
        let op = VarOp::decode(0x40).unwrap();
        assert_eq!(op.action, VarAction::LoadAcc);
        assert_eq!(op.kind, VariableKind::Global);
        assert_eq!(op.mnemonic(), "lag");

        // store-acc, temp, acc-indexed
        let op = VarOp::decode(0x56).unwrap();
        assert_eq!(op.action, VarAction::StoreAcc);
        assert_eq!(op.kind, VariableKind::Temp);
        assert!(op.acc_indexed);
        assert_eq!(op.encode(), 0x56);
        assert_eq!(name(0x7f).as_deref(), Some("-spi"));
    }
}

//! Instruction listing
//!
//! Used by the interpreter's instruction trace and by the `disasm` command.

use super::Script;
use crate::interpreter::opcodes::{self, DecodeError, Operand};

/// Names shown in place of kernel and selector numbers, when known
#[derive(Debug, Clone, Copy, Default)]
pub struct Symbols<'a> {
    pub kernels: &'a [String],
    pub selectors: &'a [String],
}

/// Format the instruction at `pc`; returns the text and the encoded length
pub fn disassemble_instruction(
    code: &[u8],
    pc: usize,
    symbols: Symbols<'_>,
) -> Result<(String, usize), DecodeError> {
    let inst = opcodes::decode(code, pc)?;
    let name = opcodes::name(inst.op).unwrap_or_else(|| "???".to_string());
    let bytes: Vec<String> = code[pc..pc + inst.len]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    let kinds = opcodes::operands(inst.op).unwrap_or(&[]);
    let next = pc + inst.len;
    let mut args = Vec::with_capacity(kinds.len());
    for (i, kind) in kinds.iter().enumerate() {
        let value = inst.operand(i);
        let text = match (inst.op, i, kind) {
            (opcodes::CALLK, 0, _) => match symbols.kernels.get(value as usize) {
                Some(name) => format!("{} ({})", name, value),
                None => format!("k{}", value),
            },
            (opcodes::LOFSA | opcodes::LOFSS, _, _) => format!("{:04x}", value as u16),
            (_, _, Operand::Rel) => format!("{:04x}", (next as i32 + value) as u16),
            (_, _, Operand::Byte) => format!("{}", value),
            (opcodes::PUSHI | opcodes::LDI, _, _) => match symbols.selectors.get(value as usize) {
                Some(name) if value >= 0 => format!("{} ; {}", value, name),
                _ => format!("{}", value),
            },
            _ => format!("{}", value),
        };
        args.push(text);
    }

    Ok((
        format!("{:04x}: {:<14} {:<8} {}", pc, bytes.join(" "), name, args.join(", "))
            .trim_end()
            .to_string(),
        inst.len,
    ))
}

/// List every code region of a script
///
/// Undecodable bytes are shown as `db` lines and skipped one at a time.
pub fn disassemble(script: &Script, symbols: Symbols<'_>) -> Vec<String> {
    let mut lines = Vec::new();
    let buf = script.buf();
    for range in script.code_ranges() {
        let end = range.end.min(buf.len());
        let code = &buf[..end];
        let mut pc = range.start;
        while pc < end {
            match disassemble_instruction(code, pc, symbols) {
                Ok((text, len)) => {
                    lines.push(text);
                    pc += len;
                }
                Err(_) => {
                    lines.push(format!("{:04x}: {:02x}             db", pc, buf[pc]));
                    pc += 1;
                }
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::opcodes::{CALLK, JMP, PUSHI};

    #[test]
    fn test_branch_target_is_absolute() {
        let code = [0, 0, JMP << 1, 0x02, 0x00];
        let (text, len) = disassemble_instruction(&code, 2, Symbols::default()).unwrap();
        assert_eq!(len, 3);
        assert!(text.contains("jmp"), "{}", text);
        assert!(text.ends_with("0007"), "{}", text);
    }

    #[test]
    fn test_kernel_names() {
        let kernels = vec!["Clone".to_string()];
        let symbols = Symbols {
            kernels: &kernels,
            selectors: &[],
        };
        let code = [CALLK << 1, 0, 0, 2];
        let (text, _) = disassemble_instruction(&code, 0, symbols).unwrap();
        assert!(text.contains("Clone (0), 2"), "{}", text);
    }

    #[test]
    fn test_selector_annotation() {
        let selectors = vec!["x".to_string(), "y".to_string()];
        let symbols = Symbols {
            kernels: &[],
            selectors: &selectors,
        };
        let code = [PUSHI << 1 | 1, 1];
        let (text, _) = disassemble_instruction(&code, 0, symbols).unwrap();
        assert!(text.ends_with("1 ; y"), "{}", text);
    }
}

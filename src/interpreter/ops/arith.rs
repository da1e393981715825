use crate::interpreter::engine::Interpreter;
use crate::interpreter::errors::RuntimeError;
use crate::interpreter::opcodes;
use crate::memory::value::Address;
use log::warn;

/// Mnemonic used in operand errors
fn op_name(op: u8) -> &'static str {
    match op {
        opcodes::BNOT => "bnot",
        opcodes::ADD => "add",
        opcodes::SUB => "sub",
        opcodes::MUL => "mul",
        opcodes::DIV => "div",
        opcodes::MOD => "mod",
        opcodes::SHR => "shr",
        opcodes::SHL => "shl",
        opcodes::XOR => "xor",
        opcodes::AND => "and",
        opcodes::OR => "or",
        opcodes::NEG => "neg",
        opcodes::NOT => "not",
        opcodes::EQ => "eq?",
        opcodes::NE => "ne?",
        opcodes::GT => "gt?",
        opcodes::GE => "ge?",
        opcodes::LT => "lt?",
        opcodes::LE => "le?",
        opcodes::UGT => "ugt?",
        opcodes::UGE => "uge?",
        opcodes::ULT => "ult?",
        _ => "ule?",
    }
}

fn number(op: u8, value: Address) -> Result<u16, RuntimeError> {
    value.as_u16().ok_or(RuntimeError::InvalidOperand {
        opcode: op_name(op),
        value,
    })
}

impl Interpreter {
    /// Ops `bnot` through `ule?`
    ///
    /// Binary ops combine the popped value (left) with the accumulator
    /// (right). Comparisons first copy the accumulator into `prev`.
    pub(crate) fn exec_arithmetic(&mut self, op: u8) -> Result<(), RuntimeError> {
        let acc = self.context.acc;
        let result = match op {
            opcodes::BNOT => Address::from_u16(!number(op, acc)?),
            opcodes::NEG => Address::from_i16((number(op, acc)? as i16).wrapping_neg()),
            opcodes::NOT => Address::from_bool(!acc.is_truthy()),
            opcodes::EQ..=opcodes::ULE => {
                self.context.prev = acc;
                let left = self.pop()?;
                Address::from_bool(compare(op, left, acc)?)
            }
            _ => {
                let left = self.pop()?;
                binary(op, left, acc)?
            }
        };
        self.context.acc = result;
        Ok(())
    }
}

fn binary(op: u8, left: Address, right: Address) -> Result<Address, RuntimeError> {
    // Pointer arithmetic: pointer +/- number, pointer - pointer in one segment
    match op {
        opcodes::ADD if left.is_pointer() && right.is_number() => {
            return Ok(left.with_offset_delta(right.offset as i16 as i32));
        }
        opcodes::ADD if left.is_number() && right.is_pointer() => {
            return Ok(right.with_offset_delta(left.offset as i16 as i32));
        }
        opcodes::SUB if left.is_pointer() && right.is_number() => {
            return Ok(left.with_offset_delta(-(right.offset as i16 as i32)));
        }
        opcodes::SUB if left.is_pointer() && right.segment == left.segment => {
            return Ok(Address::from_u16(left.offset.wrapping_sub(right.offset)));
        }
        _ => {}
    }

    let a = number(op, left)?;
    let b = number(op, right)?;
    let value = match op {
        opcodes::ADD => a.wrapping_add(b),
        opcodes::SUB => a.wrapping_sub(b),
        opcodes::MUL => (a as i16).wrapping_mul(b as i16) as u16,
        opcodes::DIV | opcodes::MOD if b == 0 => {
            warn!("{} by zero; result is 0", op_name(op));
            0
        }
        opcodes::DIV => (a as i16).wrapping_div(b as i16) as u16,
        opcodes::MOD => (a as i16).wrapping_rem(b as i16) as u16,
        opcodes::SHR if b >= 16 => 0,
        opcodes::SHR => a >> b,
        opcodes::SHL if b >= 16 => 0,
        opcodes::SHL => a << b,
        opcodes::XOR => a ^ b,
        opcodes::AND => a & b,
        _ => a | b,
    };
    Ok(Address::from_u16(value))
}

fn compare(op: u8, left: Address, right: Address) -> Result<bool, RuntimeError> {
    match op {
        opcodes::EQ => return Ok(left == right),
        opcodes::NE => return Ok(left != right),
        _ => {}
    }

    let (a, b) = if left.is_pointer() || right.is_pointer() {
        if left.segment != right.segment {
            let value = if left.is_pointer() { right } else { left };
            return Err(RuntimeError::InvalidOperand {
                opcode: op_name(op),
                value,
            });
        }
        // Offsets within one segment order like unsigned numbers
        (left.offset as i32, right.offset as i32)
    } else if op >= opcodes::UGT {
        (left.offset as i32, right.offset as i32)
    } else {
        (left.offset as i16 as i32, right.offset as i16 as i32)
    };

    Ok(match op {
        opcodes::GT | opcodes::UGT => a > b,
        opcodes::GE | opcodes::UGE => a >= b,
        opcodes::LT | opcodes::ULT => a < b,
        _ => a <= b,
    })
}

use crate::interpreter::engine::Interpreter;
use crate::interpreter::errors::{RuntimeError, VariableKind};
use crate::interpreter::opcodes::{VarAction, VarOp};
use crate::memory::value::{Address, SegmentId};
use log::warn;

/// Where a variable lives
#[derive(Debug, Clone, Copy)]
enum VarSlot {
    Locals(SegmentId, usize),
    Stack(usize),
}

impl Interpreter {
    fn locals_of(&self, kind: VariableKind) -> Result<SegmentId, RuntimeError> {
        let segment = match kind {
            VariableKind::Global => self.segments.globals_segment(),
            _ => Some(self.frame()?.local_segment).filter(|&s| s != 0),
        };
        segment.ok_or(RuntimeError::VariableOutOfRange {
            kind,
            index: 0,
            count: 0,
        })
    }

    fn var_slot(&self, kind: VariableKind, index: usize) -> Result<VarSlot, RuntimeError> {
        match kind {
            VariableKind::Global | VariableKind::Local => {
                let segment = self.locals_of(kind).map_err(|_| RuntimeError::VariableOutOfRange {
                    kind,
                    index,
                    count: 0,
                })?;
                let count = self.segments.locals(segment)?.len();
                if index >= count {
                    return Err(RuntimeError::VariableOutOfRange { kind, index, count });
                }
                Ok(VarSlot::Locals(segment, index))
            }
            VariableKind::Temp => Ok(VarSlot::Stack(self.frame()?.fp + index)),
            VariableKind::Param => {
                let frame = self.frame()?;
                if index > frame.argc {
                    return Err(RuntimeError::VariableOutOfRange {
                        kind,
                        index,
                        count: frame.argc + 1,
                    });
                }
                Ok(VarSlot::Stack(frame.argp + index))
            }
        }
    }

    /// Read a variable; parameters past argc read as 0
    pub(crate) fn read_var(&self, kind: VariableKind, index: usize) -> Result<Address, RuntimeError> {
        match self.var_slot(kind, index) {
            Ok(VarSlot::Locals(segment, i)) => {
                let locals = self.segments.locals(segment)?;
                locals.get(i).ok_or(RuntimeError::VariableOutOfRange {
                    kind,
                    index,
                    count: locals.len(),
                })
            }
            Ok(VarSlot::Stack(i)) => self.stack_get(i),
            Err(RuntimeError::VariableOutOfRange { .. }) if kind == VariableKind::Param => {
                warn!("read of param {} past argc; using 0", index);
                Ok(Address::NULL)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn write_var(
        &mut self,
        kind: VariableKind,
        index: usize,
        value: Address,
    ) -> Result<(), RuntimeError> {
        match self.var_slot(kind, index)? {
            VarSlot::Locals(segment, i) => {
                let locals = self.segments.locals_mut(segment)?;
                if locals.set(i, value) {
                    Ok(())
                } else {
                    Err(RuntimeError::VariableOutOfRange {
                        kind,
                        index,
                        count: locals.len(),
                    })
                }
            }
            VarSlot::Stack(i) => self.stack_set(i, value),
        }
    }

    fn indexed(&self, base: usize, indexed: bool) -> Result<usize, RuntimeError> {
        if !indexed {
            return Ok(base);
        }
        let acc = self.context.acc;
        let offset = acc.as_u16().ok_or(RuntimeError::InvalidOperand {
            opcode: "indexed variable",
            value: acc,
        })?;
        Ok(base + offset as usize)
    }

    /// Ops `0x40..=0x7f`
    pub(crate) fn exec_variable(&mut self, op: u8, operand: usize) -> Result<(), RuntimeError> {
        let var = VarOp::decode(op).ok_or(RuntimeError::InvalidOpcode {
            opcode: op << 1,
            pc: self.frame()?.pc,
        })?;
        let index = self.indexed(operand, var.acc_indexed)?;
        let kind = var.kind;

        match var.action {
            VarAction::LoadAcc => {
                self.context.acc = self.read_var(kind, index)?;
            }
            VarAction::LoadStack => {
                let value = self.read_var(kind, index)?;
                self.push(value)?;
            }
            VarAction::StoreAcc => {
                if var.acc_indexed {
                    let value = self.pop()?;
                    self.context.acc = value;
                }
                self.write_var(kind, index, self.context.acc)?;
            }
            VarAction::StoreStack => {
                let value = self.pop()?;
                self.write_var(kind, index, value)?;
            }
            VarAction::IncAcc | VarAction::IncStack | VarAction::DecAcc | VarAction::DecStack => {
                let delta = match var.action {
                    VarAction::IncAcc | VarAction::IncStack => 1,
                    _ => -1,
                };
                let value = self.read_var(kind, index)?.with_offset_delta(delta);
                self.write_var(kind, index, value)?;
                if matches!(var.action, VarAction::IncAcc | VarAction::DecAcc) {
                    self.context.acc = value;
                } else {
                    self.push(value)?;
                }
            }
        }
        Ok(())
    }

    /// `lea`: address of a variable
    ///
    /// Bits 1-2 of `type_word` select the variable kind; bit 4 adds the
    /// accumulator to the index.
    pub(crate) fn exec_lea(&mut self, type_word: u16, index: usize) -> Result<(), RuntimeError> {
        let kind = VariableKind::from_bits((type_word >> 1) as u8);
        let index = self.indexed(index, type_word & 0x10 != 0)?;
        let address = match kind {
            VariableKind::Global | VariableKind::Local => {
                Address::new(self.locals_of(kind)?, (index * 2) as u16)
            }
            VariableKind::Temp => {
                let fp = self.frame()?.fp;
                Address::new(self.context.stack_segment, ((fp + index) * 2) as u16)
            }
            VariableKind::Param => {
                let argp = self.frame()?.argp;
                Address::new(self.context.stack_segment, ((argp + index) * 2) as u16)
            }
        };
        self.context.acc = address;
        Ok(())
    }
}

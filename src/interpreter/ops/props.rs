use crate::interpreter::engine::Interpreter;
use crate::interpreter::errors::RuntimeError;
use crate::interpreter::opcodes;

impl Interpreter {
    /// Ops `pToa` through `dpTos` on property `index` of the current object
    pub(crate) fn exec_property(&mut self, op: u8, index: usize) -> Result<(), RuntimeError> {
        let objp = self.frame()?.objp;
        match op {
            opcodes::P_TO_A => {
                self.context.acc = self.segments.read_property(objp, index)?;
            }
            opcodes::A_TO_P => {
                self.segments.write_property(objp, index, self.context.acc)?;
            }
            opcodes::P_TO_S => {
                let value = self.segments.read_property(objp, index)?;
                self.push(value)?;
            }
            opcodes::S_TO_P => {
                let value = self.pop()?;
                self.segments.write_property(objp, index, value)?;
            }
            _ => {
                let delta = match op {
                    opcodes::IP_TO_A | opcodes::IP_TO_S => 1,
                    _ => -1,
                };
                let value = self
                    .segments
                    .read_property(objp, index)?
                    .with_offset_delta(delta);
                self.segments.write_property(objp, index, value)?;
                if matches!(op, opcodes::IP_TO_A | opcodes::DP_TO_A) {
                    self.context.acc = value;
                } else {
                    self.push(value)?;
                }
            }
        }
        Ok(())
    }
}

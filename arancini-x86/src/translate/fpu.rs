//! x87 family: only the control-word accessors are lifted.

use iced_x86::Mnemonic;

use arancini_ir::ValueType;

use crate::error::LiftError;
use crate::state::offsets;
use crate::translate::PacketLifter;

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn translate_fpu(&mut self) -> Result<(), LiftError> {
        match self.iclass() {
            Mnemonic::Fnstcw => {
                let control = self.read_reg(ValueType::u16(), offsets::X87_CTRL)?;
                self.write_operand(0, control)
            }

            Mnemonic::Fldcw => {
                let value = self.read_operand(0)?;
                self.write_reg(offsets::X87_CTRL, value)
            }

            _ => self.unsupported(),
        }
    }
}

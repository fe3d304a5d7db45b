//! Unary operations without flag effects: NOT.

use iced_x86::Mnemonic;

use crate::error::LiftError;
use crate::translate::PacketLifter;

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn translate_unop(&mut self) -> Result<(), LiftError> {
        match self.iclass() {
            // NOT leaves every flag alone.
            Mnemonic::Not => {
                let value = self.read_operand(0)?;
                let result = self.builder().insert_not(value)?;
                self.write_operand(0, result)
            }

            _ => self.unsupported(),
        }
    }
}

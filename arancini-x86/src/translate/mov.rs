//! Data movement family: MOV, MOVZX, MOVSX, MOVSXD, LEA; NOP lifts to an
//! empty packet.

use iced_x86::Mnemonic;

use arancini_ir::ValueType;

use crate::error::LiftError;
use crate::translate::PacketLifter;

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn translate_mov(&mut self) -> Result<(), LiftError> {
        match self.iclass() {
            Mnemonic::Mov => {
                let value = self.read_operand(1)?;
                self.write_operand(0, value)
            }

            Mnemonic::Movzx => {
                let value = self.read_operand(1)?;
                let dst = self.operand_type(0)?;
                let wide = self.builder().insert_zero_extend(ValueType::unsigned(dst.width()), value)?;
                self.write_operand(0, wide)
            }

            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let value = self.read_operand(1)?;
                let dst = self.operand_type(0)?;
                let wide = self.builder().insert_sign_extend(ValueType::unsigned(dst.width()), value)?;
                self.write_operand(0, wide)
            }

            Mnemonic::Lea => {
                let ea = self.effective_address()?;
                let dst = self.operand_type(0)?;
                let value = if dst.width() < 64 {
                    self.builder().insert_bit_extract(ea, 0, dst.width())?
                } else {
                    ea
                };
                self.write_operand(0, value)
            }

            Mnemonic::Nop => Ok(()),

            _ => self.unsupported(),
        }
    }
}

//! Stack family: PUSH and POP over the 64-bit stack pointer.

use iced_x86::Mnemonic;

use arancini_ir::ValueType;

use crate::error::LiftError;
use crate::state::offsets;
use crate::translate::PacketLifter;

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn translate_stack(&mut self) -> Result<(), LiftError> {
        match self.iclass() {
            Mnemonic::Push => {
                let value = self.read_operand(0)?;
                // Only full-width pushes have a rule; immediates already
                // arrive sign-extended to 64 bits.
                if value.ty() != ValueType::u64() {
                    return self.unsupported();
                }

                let rsp = self.read_reg(ValueType::u64(), offsets::RSP)?;
                let eight = self.builder().insert_constant_u64(8)?;
                let new_rsp = self.builder().insert_sub(rsp, eight)?;

                self.write_reg(offsets::RSP, new_rsp)?;
                self.builder().insert_write_mem(new_rsp, value)?;
                Ok(())
            }

            Mnemonic::Pop => {
                if self.operand_type(0)? != ValueType::u64() {
                    return self.unsupported();
                }

                let rsp = self.read_reg(ValueType::u64(), offsets::RSP)?;
                let value = self.builder().insert_read_mem(ValueType::u64(), rsp)?;
                self.write_operand(0, value)?;

                let eight = self.builder().insert_constant_u64(8)?;
                let new_rsp = self.builder().insert_add(rsp, eight)?;
                self.write_reg(offsets::RSP, new_rsp)?;
                Ok(())
            }

            _ => self.unsupported(),
        }
    }
}

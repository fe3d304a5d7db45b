//! Interrupt family: INT and INT3 call out to the interrupt handler.

use iced_x86::Mnemonic;

use crate::error::LiftError;
use crate::translate::PacketLifter;

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn translate_interrupt(&mut self) -> Result<(), LiftError> {
        let vector = match self.iclass() {
            Mnemonic::Int => self.instr().immediate8() as u32,
            Mnemonic::Int3 => 3,
            _ => return self.unsupported(),
        };

        // Resume after the trap.
        let next = self.instr().next_ip();
        let next = self.builder().insert_constant_u64(next)?;
        self.builder().insert_write_pc(next)?;

        let imm = self.builder().insert_constant_u32(vector)?;
        self.builder().insert_internal_call("handle_int", &[imm])?;
        Ok(())
    }
}

//! System family: SYSCALL and HLT call their named helpers.

use iced_x86::Mnemonic;

use crate::error::LiftError;
use crate::translate::PacketLifter;

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn translate_syscall(&mut self) -> Result<(), LiftError> {
        let helper = match self.iclass() {
            Mnemonic::Syscall => "handle_syscall",
            Mnemonic::Hlt => "hlt",
            _ => return self.unsupported(),
        };

        let next = self.instr().next_ip();
        let next = self.builder().insert_constant_u64(next)?;
        self.builder().insert_write_pc(next)?;

        self.builder().insert_internal_call(helper, &[])?;
        Ok(())
    }
}

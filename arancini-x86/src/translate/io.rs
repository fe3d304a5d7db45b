//! Port-IO family. User-space guests have no business doing port IO, so
//! these lift to a poison call rather than failing the translation.

use crate::error::LiftError;
use crate::translate::PacketLifter;

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn translate_io(&mut self) -> Result<(), LiftError> {
        // The argument identifies the poisoned instruction.
        let site = self.instr().ip();
        let site = self.builder().insert_constant_u64(site)?;
        self.builder().insert_internal_call("handle_poison", &[site])?;
        Ok(())
    }
}

//! Flag-control family: STD, CLD, STC, CLC, CMC. Action nodes only.

use iced_x86::Mnemonic;

use crate::error::LiftError;
use crate::state::offsets;
use crate::translate::PacketLifter;

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn translate_control(&mut self) -> Result<(), LiftError> {
        match self.iclass() {
            Mnemonic::Std => self.set_single_flag(offsets::DF, true),
            Mnemonic::Cld => self.set_single_flag(offsets::DF, false),
            Mnemonic::Stc => self.set_single_flag(offsets::CF, true),
            Mnemonic::Clc => self.set_single_flag(offsets::CF, false),

            Mnemonic::Cmc => {
                let cf = self.read_flag(offsets::CF)?;
                let flipped = self.flag_not(cf)?;
                self.store_flag(offsets::CF, flipped)
            }

            _ => self.unsupported(),
        }
    }

    fn set_single_flag(&mut self, offset: u32, bit: bool) -> Result<(), LiftError> {
        let value = self.builder().insert_constant_u1(bit)?;
        self.store_flag(offset, value)
    }
}

//! SSE family: 128-bit moves and a packed-integer subset.

use iced_x86::Mnemonic;

use arancini_ir::ValueType;

use crate::error::LiftError;
use crate::translate::PacketLifter;

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn translate_sse(&mut self) -> Result<(), LiftError> {
        match self.iclass() {
            // Alignment is not modeled; aligned and unaligned moves lift
            // identically.
            Mnemonic::Movaps | Mnemonic::Movups | Mnemonic::Movdqa | Mnemonic::Movdqu => {
                let value = self.read_operand(1)?;
                self.write_operand(0, value)
            }

            Mnemonic::Paddd => {
                let lanes = ValueType::vector(ValueType::u32(), 4);

                let dst = self.read_operand(0)?;
                let src = self.read_operand(1)?;
                let dst = self.builder().insert_bitcast(lanes, dst)?;
                let src = self.builder().insert_bitcast(lanes, src)?;

                let sum = self.builder().insert_add(dst, src)?;
                let out = self.builder().insert_bitcast(ValueType::vector(ValueType::u64(), 2), sum)?;
                self.write_operand(0, out)
            }

            Mnemonic::Pxor => {
                let dst = self.read_operand(0)?;
                let src = self.read_operand(1)?;
                let result = self.builder().insert_xor(dst, src)?;
                self.write_operand(0, result)
            }

            _ => self.unsupported(),
        }
    }
}

//! Shift family: SHL, SHR, SAR. The amount is masked to the operand
//! width; a zero amount leaves destination flags unchanged.

use iced_x86::{Mnemonic, OpKind, Register};

use arancini_ir::{Port, ShiftOp, ValueType};

use crate::error::LiftError;
use crate::state::offsets;
use crate::translate::PacketLifter;

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn translate_shifts(&mut self) -> Result<(), LiftError> {
        let op = match self.iclass() {
            Mnemonic::Sar => ShiftOp::Asr,
            Mnemonic::Shr => ShiftOp::Lsr,
            Mnemonic::Shl => ShiftOp::Lsl,
            _ => return self.unsupported(),
        };

        let value = self.read_operand(0)?;
        let width = value.ty().width();
        let count_mask = if width == 64 { 0x3f } else { 0x1f };

        match self.instr().op_kind(1) {
            OpKind::Immediate8 => {
                let amount = (self.instr().immediate8() & count_mask) as u16;
                if amount >= width {
                    // Only reachable for 8- and 16-bit operands; the
                    // shifted-through-zero corner has no rule.
                    return self.unsupported();
                }
                self.shift_static(op, value, amount)
            }
            OpKind::Register if self.instr().op_register(1) == Register::CL => {
                self.shift_dynamic(op, value, count_mask)
            }
            _ => self.unsupported(),
        }
    }

    /// Amount known at lift time.
    fn shift_static(&mut self, op: ShiftOp, value: Port, amount: u16) -> Result<(), LiftError> {
        if amount == 0 {
            // Destination and flags both stay as they are.
            return Ok(());
        }

        let width = value.ty().width();
        let amt = self.builder().insert_constant_u8(amount as u8)?;
        let result = self.builder().insert_shift(op, value, amt)?;
        self.write_operand(0, result)?;

        // CF is the last bit shifted out.
        let cf_index = match op {
            ShiftOp::Lsl => width - amount,
            ShiftOp::Lsr | ShiftOp::Asr => amount - 1,
        };
        let cf = self.builder().insert_bit_extract(value, cf_index, 1)?;
        self.store_flag(offsets::CF, cf)?;

        // OF is only defined for single-bit shifts.
        if amount == 1 {
            let of = match op {
                ShiftOp::Lsl => {
                    let msb = self.builder().insert_bit_extract(result, width - 1, 1)?;
                    self.builder().insert_xor(msb, cf)?
                }
                ShiftOp::Lsr => self.builder().insert_bit_extract(value, width - 1, 1)?,
                ShiftOp::Asr => self.builder().insert_constant_u1(false)?,
            };
            self.store_flag(offsets::OF, of)?;
        }

        self.result_flags(result, None)
    }

    /// Amount taken from CL; every flag write is predicated on the
    /// masked amount being non-zero.
    fn shift_dynamic(&mut self, op: ShiftOp, value: Port, count_mask: u8) -> Result<(), LiftError> {
        let width = value.ty().width();

        let cl = self.read_reg(ValueType::u8(), offsets::RCX)?;
        let mask = self.builder().insert_constant_u8(count_mask)?;
        let amount = self.builder().insert_and(cl, mask)?;

        // A zero shift is the identity, so the destination write is
        // unconditional.
        let result = self.builder().insert_shift(op, value, amount)?;
        self.write_operand(0, result)?;

        let zero = self.builder().insert_constant_u8(0)?;
        let amount_is_zero = self.builder().insert_cmp_eq(amount, zero)?;

        // CF: last bit shifted out, garbage when the amount is zero and
        // the select keeps the old flag instead.
        let wide_amount = if width > 8 {
            self.builder().insert_zero_extend(value.ty(), amount)?
        } else {
            amount
        };
        let cf_bits = match op {
            ShiftOp::Lsl => {
                let total = self.builder().insert_constant(value.ty(), width as u64)?;
                let back = self.builder().insert_sub(total, wide_amount)?;
                self.builder().insert_lsr(value, back)?
            }
            ShiftOp::Lsr | ShiftOp::Asr => {
                let one = self.builder().insert_constant(value.ty(), 1)?;
                let back = self.builder().insert_sub(wide_amount, one)?;
                self.builder().insert_lsr(value, back)?
            }
        };
        let cf_new = self.builder().insert_bit_extract(cf_bits, 0, 1)?;
        let cf_old = self.read_flag(offsets::CF)?;
        let cf = self.builder().insert_select(amount_is_zero, cf_old, cf_new)?;
        self.store_flag(offsets::CF, cf)?;

        self.result_flags(result, Some(amount_is_zero))
    }

    /// ZF/SF/PF from the shifted result, optionally predicated.
    fn result_flags(&mut self, result: Port, keep_old: Option<Port>) -> Result<(), LiftError> {
        let width = result.ty().width();

        let zero = self.builder().insert_constant(result.ty(), 0)?;
        let zf = self.builder().insert_cmp_eq(result, zero)?;
        let sf = self.builder().insert_bit_extract(result, width - 1, 1)?;
        let pf = self.parity(result)?;

        for (offset, new) in [(offsets::ZF, zf), (offsets::SF, sf), (offsets::PF, pf)] {
            let value = match keep_old {
                Some(cond) => {
                    let old = self.read_flag(offset)?;
                    self.builder().insert_select(cond, old, new)?
                }
                None => new,
            };
            self.store_flag(offset, value)?;
        }

        Ok(())
    }
}

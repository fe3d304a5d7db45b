//! x86 status-flag semantics, expressed as IR.

use iced_x86::ConditionCode;

use arancini_ir::{Port, ValueType};

use crate::error::LiftError;
use crate::state::offsets;
use crate::translate::PacketLifter;

/// Per-flag semantics of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlagOp {
    /// Compute the flag from the result and inputs per x86 rules.
    Update,
    /// Force the flag to 0.
    Set0,
    /// Force the flag to 1.
    Set1,
    /// Leave the flag untouched.
    Ignore,
}

/// Inputs needed to compute carry and overflow.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FlagInputs {
    /// Result came from an addition of these operands.
    Add {
        /// Left operand.
        lhs: Port,
        /// Right operand.
        rhs: Port,
    },
    /// Result came from a subtraction (`lhs - rhs`), including compares
    /// and negation.
    Sub {
        /// Minuend.
        lhs: Port,
        /// Subtrahend.
        rhs: Port,
    },
    /// Result came from a logic operation; carry and overflow clear.
    Logic,
}

impl<'b, 'r> PacketLifter<'b, 'r> {
    /// Apply one instruction's flag semantics. AF has no CPU-state slot,
    /// so its op is accepted and discarded.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn write_flags(
        &mut self,
        result: Port,
        inputs: FlagInputs,
        zf: FlagOp,
        cf: FlagOp,
        of: FlagOp,
        sf: FlagOp,
        pf: FlagOp,
        _af: FlagOp,
    ) -> Result<(), LiftError> {
        let width = result.ty().width();

        match zf {
            FlagOp::Update => {
                let zero = self.builder().insert_constant(result.ty(), 0)?;
                let z = self.builder().insert_cmp_eq(result, zero)?;
                self.store_flag(offsets::ZF, z)?;
            }
            other => self.set_flag(offsets::ZF, other)?,
        }

        match cf {
            FlagOp::Update => {
                let c = match inputs {
                    FlagInputs::Add { lhs, .. } => self.builder().insert_cmp_ult(result, lhs)?,
                    FlagInputs::Sub { lhs, rhs } => self.builder().insert_cmp_ult(lhs, rhs)?,
                    FlagInputs::Logic => self.builder().insert_constant_u1(false)?,
                };
                self.store_flag(offsets::CF, c)?;
            }
            other => self.set_flag(offsets::CF, other)?,
        }

        match of {
            FlagOp::Update => {
                let o = match inputs {
                    // Signed overflow: operands agree in sign, result
                    // disagrees.
                    FlagInputs::Add { lhs, rhs } => {
                        let a = self.builder().insert_xor(lhs, result)?;
                        let b = self.builder().insert_xor(rhs, result)?;
                        let both = self.builder().insert_and(a, b)?;
                        self.builder().insert_bit_extract(both, width - 1, 1)?
                    }
                    FlagInputs::Sub { lhs, rhs } => {
                        let a = self.builder().insert_xor(lhs, rhs)?;
                        let b = self.builder().insert_xor(lhs, result)?;
                        let both = self.builder().insert_and(a, b)?;
                        self.builder().insert_bit_extract(both, width - 1, 1)?
                    }
                    FlagInputs::Logic => self.builder().insert_constant_u1(false)?,
                };
                self.store_flag(offsets::OF, o)?;
            }
            other => self.set_flag(offsets::OF, other)?,
        }

        match sf {
            FlagOp::Update => {
                let s = self.builder().insert_bit_extract(result, width - 1, 1)?;
                self.store_flag(offsets::SF, s)?;
            }
            other => self.set_flag(offsets::SF, other)?,
        }

        match pf {
            FlagOp::Update => {
                let p = self.parity(result)?;
                self.store_flag(offsets::PF, p)?;
            }
            other => self.set_flag(offsets::PF, other)?,
        }

        Ok(())
    }

    /// PF: set when the low result byte has an even number of set bits.
    pub(crate) fn parity(&mut self, result: Port) -> Result<Port, LiftError> {
        let byte = self.builder().insert_bit_extract(result, 0, 8)?;

        let mut fold = byte;
        for shift in [4u8, 2, 1] {
            let amount = self.builder().insert_constant_u8(shift)?;
            let shifted = self.builder().insert_lsr(fold, amount)?;
            fold = self.builder().insert_xor(fold, shifted)?;
        }

        let bit = self.builder().insert_bit_extract(fold, 0, 1)?;
        let one = self.builder().insert_constant_u1(true)?;
        Ok(self.builder().insert_xor(bit, one)?)
    }

    /// Store a width-1 value into a flag slot.
    pub(crate) fn store_flag(&mut self, offset: u32, value: Port) -> Result<(), LiftError> {
        self.write_reg(offset, value)
    }

    /// Current value of a flag as u1.
    pub(crate) fn read_flag(&mut self, offset: u32) -> Result<Port, LiftError> {
        self.read_reg(ValueType::u1(), offset)
    }

    fn set_flag(&mut self, offset: u32, op: FlagOp) -> Result<(), LiftError> {
        let bit = match op {
            FlagOp::Set0 => false,
            FlagOp::Set1 => true,
            FlagOp::Ignore => return Ok(()),
            FlagOp::Update => unreachable!("update handled by the caller"),
        };

        let value = self.builder().insert_constant_u1(bit)?;
        self.store_flag(offset, value)
    }

    /// Lift a condition code to a u1 predicate over the flag state.
    pub(crate) fn condition(&mut self, cc: ConditionCode) -> Result<Port, LiftError> {
        use ConditionCode as CC;

        let value = match cc {
            CC::o => self.read_flag(offsets::OF)?,
            CC::no => {
                let of = self.read_flag(offsets::OF)?;
                self.flag_not(of)?
            }
            CC::b => self.read_flag(offsets::CF)?,
            CC::ae => {
                let cf = self.read_flag(offsets::CF)?;
                self.flag_not(cf)?
            }
            CC::e => self.read_flag(offsets::ZF)?,
            CC::ne => {
                let zf = self.read_flag(offsets::ZF)?;
                self.flag_not(zf)?
            }
            CC::be => {
                let cf = self.read_flag(offsets::CF)?;
                let zf = self.read_flag(offsets::ZF)?;
                self.builder().insert_or(cf, zf)?
            }
            CC::a => {
                let cf = self.read_flag(offsets::CF)?;
                let zf = self.read_flag(offsets::ZF)?;
                let either = self.builder().insert_or(cf, zf)?;
                self.flag_not(either)?
            }
            CC::s => self.read_flag(offsets::SF)?,
            CC::ns => {
                let sf = self.read_flag(offsets::SF)?;
                self.flag_not(sf)?
            }
            CC::p => self.read_flag(offsets::PF)?,
            CC::np => {
                let pf = self.read_flag(offsets::PF)?;
                self.flag_not(pf)?
            }
            CC::l => {
                let sf = self.read_flag(offsets::SF)?;
                let of = self.read_flag(offsets::OF)?;
                self.builder().insert_xor(sf, of)?
            }
            CC::ge => {
                let sf = self.read_flag(offsets::SF)?;
                let of = self.read_flag(offsets::OF)?;
                let l = self.builder().insert_xor(sf, of)?;
                self.flag_not(l)?
            }
            CC::le => {
                let sf = self.read_flag(offsets::SF)?;
                let of = self.read_flag(offsets::OF)?;
                let l = self.builder().insert_xor(sf, of)?;
                let zf = self.read_flag(offsets::ZF)?;
                self.builder().insert_or(l, zf)?
            }
            CC::g => {
                let sf = self.read_flag(offsets::SF)?;
                let of = self.read_flag(offsets::OF)?;
                let l = self.builder().insert_xor(sf, of)?;
                let zf = self.read_flag(offsets::ZF)?;
                let le = self.builder().insert_or(l, zf)?;
                self.flag_not(le)?
            }
            CC::None => return self.unsupported(),
        };

        Ok(value)
    }

    /// u1 negation without a masking concern: xor with 1.
    pub(crate) fn flag_not(&mut self, value: Port) -> Result<Port, LiftError> {
        let one = self.builder().insert_constant_u1(true)?;
        Ok(self.builder().insert_xor(value, one)?)
    }
}

//! Integer arithmetic family: ADD, SUB, CMP, AND, OR, XOR, TEST, NEG,
//! IMUL.

use iced_x86::Mnemonic;

use crate::error::LiftError;
use crate::translate::{FlagInputs, FlagOp, PacketLifter};

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn translate_arith(&mut self) -> Result<(), LiftError> {
        use FlagOp::*;

        match self.iclass() {
            Mnemonic::Add => {
                let lhs = self.read_operand(0)?;
                let rhs = self.read_operand(1)?;
                let result = self.builder().insert_add(lhs, rhs)?;
                self.write_operand(0, result)?;
                self.write_flags(result, FlagInputs::Add { lhs, rhs }, Update, Update, Update, Update, Update, Update)
            }

            Mnemonic::Sub => {
                let lhs = self.read_operand(0)?;
                let rhs = self.read_operand(1)?;
                let result = self.builder().insert_sub(lhs, rhs)?;
                self.write_operand(0, result)?;
                self.write_flags(result, FlagInputs::Sub { lhs, rhs }, Update, Update, Update, Update, Update, Update)
            }

            // CMP is SUB without the destination write.
            Mnemonic::Cmp => {
                let lhs = self.read_operand(0)?;
                let rhs = self.read_operand(1)?;
                let result = self.builder().insert_sub(lhs, rhs)?;
                self.write_flags(result, FlagInputs::Sub { lhs, rhs }, Update, Update, Update, Update, Update, Update)
            }

            Mnemonic::And => {
                let lhs = self.read_operand(0)?;
                let rhs = self.read_operand(1)?;
                let result = self.builder().insert_and(lhs, rhs)?;
                self.write_operand(0, result)?;
                self.write_flags(result, FlagInputs::Logic, Update, Set0, Set0, Update, Update, Ignore)
            }

            Mnemonic::Or => {
                let lhs = self.read_operand(0)?;
                let rhs = self.read_operand(1)?;
                let result = self.builder().insert_or(lhs, rhs)?;
                self.write_operand(0, result)?;
                self.write_flags(result, FlagInputs::Logic, Update, Set0, Set0, Update, Update, Ignore)
            }

            Mnemonic::Xor => {
                let lhs = self.read_operand(0)?;
                let rhs = self.read_operand(1)?;
                let result = self.builder().insert_xor(lhs, rhs)?;
                self.write_operand(0, result)?;
                self.write_flags(result, FlagInputs::Logic, Update, Set0, Set0, Update, Update, Ignore)
            }

            // TEST is AND without the destination write.
            Mnemonic::Test => {
                let lhs = self.read_operand(0)?;
                let rhs = self.read_operand(1)?;
                let result = self.builder().insert_and(lhs, rhs)?;
                self.write_flags(result, FlagInputs::Logic, Update, Set0, Set0, Update, Update, Ignore)
            }

            Mnemonic::Neg => {
                let value = self.read_operand(0)?;
                let zero = self.builder().insert_constant(value.ty(), 0)?;
                let result = self.builder().insert_sub(zero, value)?;
                self.write_operand(0, result)?;
                self.write_flags(
                    result,
                    FlagInputs::Sub { lhs: zero, rhs: value },
                    Update,
                    Update,
                    Update,
                    Update,
                    Update,
                    Update,
                )
            }

            // Two- and three-operand forms only; the widening one-operand
            // form has no rule. CF/OF would need the widened product and
            // stay unmodeled, the remaining flags are undefined anyway.
            Mnemonic::Imul => match self.instr().op_count() {
                2 => {
                    let lhs = self.read_operand(0)?;
                    let rhs = self.read_operand(1)?;
                    let result = self.builder().insert_mul(lhs, rhs)?;
                    self.write_operand(0, result)
                }
                3 => {
                    let lhs = self.read_operand(1)?;
                    let rhs = self.read_operand(2)?;
                    let result = self.builder().insert_mul(lhs, rhs)?;
                    self.write_operand(0, result)
                }
                _ => self.unsupported(),
            },

            _ => self.unsupported(),
        }
    }
}

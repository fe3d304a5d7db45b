//! Control-transfer family: JMP, Jcc, CALL, RET.

use iced_x86::{Mnemonic, OpKind};

use arancini_ir::{BranchKind, Port, ValueType};

use crate::error::LiftError;
use crate::state::offsets;
use crate::translate::PacketLifter;

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn translate_branch(&mut self) -> Result<(), LiftError> {
        match self.iclass() {
            Mnemonic::Jmp => {
                let target = self.branch_target(0)?;
                self.builder().insert_write_pc(target)?;
                self.builder().insert_br(BranchKind::Jump)?;
                Ok(())
            }

            Mnemonic::Call => {
                let target = self.branch_target(0)?;
                self.push_return_address()?;
                self.builder().insert_write_pc(target)?;
                self.builder().insert_br(BranchKind::Call)?;
                Ok(())
            }

            Mnemonic::Ret => {
                let rsp = self.read_reg(ValueType::u64(), offsets::RSP)?;
                let target = self.builder().insert_read_mem(ValueType::u64(), rsp)?;

                // Pop the return address, plus the immediate for `ret n`.
                let extra = match self.instr().op_count() {
                    0 => 0,
                    _ => self.instr().immediate16() as u64,
                };
                let bump = self.builder().insert_constant_u64(8 + extra)?;
                let new_rsp = self.builder().insert_add(rsp, bump)?;
                self.write_reg(offsets::RSP, new_rsp)?;

                self.builder().insert_write_pc(target)?;
                self.builder().insert_ret()?;
                Ok(())
            }

            // Conditional branches select between target and fall-through.
            _ => {
                let cc = self.instr().condition_code();
                let cond = self.condition(cc)?;

                let near_branch_target = self.instr().near_branch_target();
                let taken = self.builder().insert_constant_u64(near_branch_target)?;
                let next_ip = self.instr().next_ip();
                let fallthrough = self.builder().insert_constant_u64(next_ip)?;
                let next = self.builder().insert_select(cond, taken, fallthrough)?;

                self.builder().insert_write_pc(next)?;
                self.builder().insert_br(BranchKind::Jump)?;
                Ok(())
            }
        }
    }

    /// Target of a JMP/CALL operand: direct displacement, register or
    /// memory indirect.
    fn branch_target(&mut self, i: u32) -> Result<Port, LiftError> {
        match self.instr().op_kind(i) {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                let near_branch_target = self.instr().near_branch_target();
                Ok(self.builder().insert_constant_u64(near_branch_target)?)
            }
            OpKind::Register | OpKind::Memory => {
                let target = self.read_operand(i)?;
                if target.ty() != ValueType::u64() {
                    return self.unsupported();
                }
                Ok(target)
            }
            _ => self.unsupported(),
        }
    }

    fn push_return_address(&mut self) -> Result<(), LiftError> {
        let next_ip = self.instr().next_ip();
        let ret = self.builder().insert_constant_u64(next_ip)?;

        let rsp = self.read_reg(ValueType::u64(), offsets::RSP)?;
        let eight = self.builder().insert_constant_u64(8)?;
        let new_rsp = self.builder().insert_sub(rsp, eight)?;

        self.write_reg(offsets::RSP, new_rsp)?;
        self.builder().insert_write_mem(new_rsp, ret)?;
        Ok(())
    }
}

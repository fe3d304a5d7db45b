//! Per-family instruction translators and their shared toolkit.
//!
//! Every guest instruction is lifted by exactly one family translator;
//! the toolkit gives them uniform operand access (register, memory or
//! immediate), effective-address construction and x86 flag semantics.

mod arith;
mod branch;
mod control;
mod flags;
mod fpu;
mod interrupt;
mod io;
mod mov;
mod shifts;
mod sse;
mod stack;
mod syscall;
mod unop;

use iced_x86::{Instruction, Mnemonic, OpKind, Register};

use arancini_ir::{ChunkBuilder, Port, ValueType};

use crate::error::LiftError;
use crate::funcs::X86InternalFunctions;
use crate::state::offsets;

pub(crate) use flags::{FlagInputs, FlagOp};

/// Lifts one decoded instruction into the currently open packet.
pub(crate) struct PacketLifter<'b, 'r> {
    builder: &'b mut ChunkBuilder<'r, X86InternalFunctions>,
    instr: &'b Instruction,
    // Effective address of the (single) memory operand, built once.
    ea: Option<Port>,
}

impl<'b, 'r> PacketLifter<'b, 'r> {
    pub(crate) fn new(builder: &'b mut ChunkBuilder<'r, X86InternalFunctions>, instr: &'b Instruction) -> Self {
        Self {
            builder,
            instr,
            ea: None,
        }
    }

    /// Dispatch on the instruction class to a family translator.
    pub(crate) fn translate(&mut self) -> Result<(), LiftError> {
        use Mnemonic::*;

        match self.iclass() {
            Add | Sub | Cmp | And | Or | Xor | Test | Neg | Imul => self.translate_arith(),
            Not => self.translate_unop(),
            Shl | Shr | Sar => self.translate_shifts(),
            Push | Pop => self.translate_stack(),
            Mov | Movzx | Movsx | Movsxd | Lea | Nop => self.translate_mov(),
            Jmp | Call | Ret => self.translate_branch(),
            m if is_jcc(m) => self.translate_branch(),
            Std | Cld | Stc | Clc | Cmc => self.translate_control(),
            Int | Int3 => self.translate_interrupt(),
            Syscall | Hlt => self.translate_syscall(),
            In | Out | Insb | Insw | Insd | Outsb | Outsw | Outsd => self.translate_io(),
            Fnstcw | Fldcw => self.translate_fpu(),
            Movaps | Movups | Movdqa | Movdqu | Paddd | Pxor => self.translate_sse(),
            _ => self.unsupported(),
        }
    }

    // --- toolkit ---

    pub(crate) fn iclass(&self) -> Mnemonic {
        self.instr.mnemonic()
    }

    pub(crate) fn instr(&self) -> &Instruction {
        self.instr
    }

    pub(crate) fn builder(&mut self) -> &mut ChunkBuilder<'r, X86InternalFunctions> {
        self.builder
    }

    pub(crate) fn unsupported<T>(&self) -> Result<T, LiftError> {
        Err(LiftError::UnsupportedInstruction { iclass: self.iclass() })
    }

    /// Type of the `i`-th operand, regardless of kind.
    pub(crate) fn operand_type(&self, i: u32) -> Result<ValueType, LiftError> {
        match self.instr.op_kind(i) {
            OpKind::Register => register_slot(self.instr.op_register(i)).map(|(_, ty)| ty),
            OpKind::Memory => self.memory_type(),
            OpKind::Immediate8 | OpKind::Immediate8_2nd => Ok(ValueType::u8()),
            OpKind::Immediate16 | OpKind::Immediate8to16 => Ok(ValueType::u16()),
            OpKind::Immediate32 | OpKind::Immediate8to32 => Ok(ValueType::u32()),
            OpKind::Immediate64 | OpKind::Immediate8to64 | OpKind::Immediate32to64 => Ok(ValueType::u64()),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Ok(ValueType::u64()),
            _ => self.unsupported(),
        }
    }

    /// Read the `i`-th operand: register, memory or immediate.
    pub(crate) fn read_operand(&mut self, i: u32) -> Result<Port, LiftError> {
        match self.instr.op_kind(i) {
            OpKind::Register => {
                let (offset, ty) = register_slot(self.instr.op_register(i))?;
                self.read_reg(ty, offset)
            }
            OpKind::Memory => {
                let ty = self.memory_type()?;
                let addr = self.effective_address()?;
                Ok(self.builder.insert_read_mem(ty, addr)?)
            }
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Ok(self.builder.insert_constant_u64(self.instr.near_branch_target())?)
            }
            _ => {
                let ty = self.operand_type(i)?;
                let mask = width_mask(ty.width());
                Ok(self.builder.insert_constant(ty, self.instr.immediate(i) & mask)?)
            }
        }
    }

    /// Write the `i`-th operand. A 32-bit register destination
    /// zero-extends into the full register; narrower destinations merge.
    pub(crate) fn write_operand(&mut self, i: u32, value: Port) -> Result<(), LiftError> {
        match self.instr.op_kind(i) {
            OpKind::Register => {
                let (offset, ty) = register_slot(self.instr.op_register(i))?;
                if ty == ValueType::u32() {
                    let wide = self.builder.insert_zero_extend(ValueType::u64(), value)?;
                    self.builder.insert_write_reg(offset, wide)?;
                } else {
                    self.builder.insert_write_reg(offset, value)?;
                }
                Ok(())
            }
            OpKind::Memory => {
                let addr = self.effective_address()?;
                self.builder.insert_write_mem(addr, value)?;
                Ok(())
            }
            _ => Err(LiftError::OperandNotWritable {
                iclass: self.iclass(),
                index: i,
            }),
        }
    }

    /// Typed CPU-state load.
    pub(crate) fn read_reg(&mut self, ty: ValueType, offset: u32) -> Result<Port, LiftError> {
        Ok(self.builder.insert_read_reg(ty, offset)?)
    }

    /// CPU-state store; the value's width selects the store size.
    pub(crate) fn write_reg(&mut self, offset: u32, value: Port) -> Result<(), LiftError> {
        self.builder.insert_write_reg(offset, value)?;
        Ok(())
    }

    /// Effective address of the memory operand:
    /// base + index * scale + displacement, with the FS/GS base added for
    /// segment overrides and RIP-relative operands folded to a constant.
    pub(crate) fn effective_address(&mut self) -> Result<Port, LiftError> {
        if let Some(ea) = self.ea {
            return Ok(ea);
        }

        let instr = self.instr;

        let mut ea = if instr.is_ip_rel_memory_operand() {
            self.builder.insert_constant_u64(instr.ip_rel_memory_address())?
        } else {
            let mut addr: Option<Port> = None;

            if instr.memory_base() != Register::None {
                let (offset, ty) = register_slot(instr.memory_base())?;
                if ty != ValueType::u64() {
                    return Err(LiftError::UnsupportedRegister { reg: instr.memory_base() });
                }
                addr = Some(self.read_reg(ValueType::u64(), offset)?);
            }

            if instr.memory_index() != Register::None {
                let (offset, ty) = register_slot(instr.memory_index())?;
                if ty != ValueType::u64() {
                    return Err(LiftError::UnsupportedRegister { reg: instr.memory_index() });
                }

                let mut index = self.read_reg(ValueType::u64(), offset)?;
                let scale = instr.memory_index_scale();
                if scale > 1 {
                    let shift = self.builder.insert_constant_u8(scale.trailing_zeros() as u8)?;
                    index = self.builder.insert_lsl(index, shift)?;
                }

                addr = Some(match addr {
                    Some(base) => self.builder.insert_add(base, index)?,
                    None => index,
                });
            }

            let disp = instr.memory_displacement64();
            match addr {
                Some(base) if disp != 0 => {
                    let disp = self.builder.insert_constant_u64(disp)?;
                    self.builder.insert_add(base, disp)?
                }
                Some(base) => base,
                None => self.builder.insert_constant_u64(disp)?,
            }
        };

        let segment = match instr.segment_prefix() {
            Register::FS => Some(offsets::FS),
            Register::GS => Some(offsets::GS),
            _ => None,
        };
        if let Some(seg) = segment {
            let base = self.read_reg(ValueType::u64(), seg)?;
            ea = self.builder.insert_add(ea, base)?;
        }

        self.ea = Some(ea);
        Ok(ea)
    }

    fn memory_type(&self) -> Result<ValueType, LiftError> {
        match self.instr.memory_size().size() {
            1 => Ok(ValueType::u8()),
            2 => Ok(ValueType::u16()),
            4 => Ok(ValueType::u32()),
            8 => Ok(ValueType::u64()),
            16 => Ok(ValueType::vector(ValueType::u64(), 2)),
            _ => self.unsupported(),
        }
    }
}

/// CPU-state slot and type of a data register.
pub(crate) fn register_slot(reg: Register) -> Result<(u32, ValueType), LiftError> {
    use iced_x86::Register as R;

    // High-byte registers live one past their full register's slot.
    if matches!(reg, R::AH | R::CH | R::DH | R::BH) {
        let full = reg.full_register();
        return Ok((offsets::gpr(full.number() as u32) + 1, ValueType::u8()));
    }

    // The slot index comes from the containing 64-bit register; the
    // low-byte group's own numbering counts ah/ch/dh/bh before spl.
    let slot = offsets::gpr(reg.full_register().number() as u32);

    if reg.is_gpr64() {
        Ok((slot, ValueType::u64()))
    } else if reg.is_gpr32() {
        Ok((slot, ValueType::u32()))
    } else if reg.is_gpr16() {
        Ok((slot, ValueType::u16()))
    } else if reg.is_gpr8() {
        Ok((slot, ValueType::u8()))
    } else if reg.is_xmm() {
        Ok((offsets::xmm(reg.number() as u32), ValueType::vector(ValueType::u64(), 2)))
    } else {
        Err(LiftError::UnsupportedRegister { reg })
    }
}

pub(crate) fn is_jcc(m: Mnemonic) -> bool {
    use Mnemonic::*;
    matches!(
        m,
        Ja | Jae | Jb | Jbe | Je | Jne | Jg | Jge | Jl | Jle | Jo | Jno | Jp | Jnp | Js | Jns
    )
}

const fn width_mask(width: u16) -> u64 {
    match width {
        64 => u64::MAX,
        w => (1u64 << w) - 1,
    }
}

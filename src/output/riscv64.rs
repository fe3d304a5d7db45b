//! RV64I host backend.
//!
//! Stub lowerer over an in-tree encoder, mirroring the AArch64 backend:
//! constants, 64-bit CPU-state moves and block termination only.
//!
//! Convention: `s2` holds the CPU-state pointer, `s3` the guest memory
//! base; `t0..t6` are the value scratch pool.

use std::collections::HashMap;

use arancini_ir::{NodeIdx, NodeKind, Packet, ValueType};

use crate::error::BackendError;
use crate::output::writer::{ChainWriter, CodeWriter, ExecBuffer};
use crate::output::{BlockExit, ChainKind, ChainSite, Encoder, HostArch};

const RA: u8 = 1;
const SP: u8 = 2;
const T0: u8 = 5;
const A0: u8 = 10;
const A1: u8 = 11;
const S2: u8 = 18;
const S3: u8 = 19;

const SCRATCH: [u8; 7] = [T0, 6, 7, 28, 29, 30, 31];

/// The RV64 encoder.
#[derive(Debug, Default)]
pub struct Riscv64Encoder {
    values: HashMap<usize, u8>,
    free: Vec<u8>,
    chainable: bool,
    chain_target: Option<u64>,
}

impl Riscv64Encoder {
    /// Construct the encoder.
    pub fn new() -> Self {
        Self::default()
    }

    fn unsupported<T>(&self, what: impl Into<String>) -> Result<T, BackendError> {
        Err(BackendError::UnsupportedNode {
            backend: "riscv64",
            node: what.into(),
        })
    }

    fn alloc(&mut self) -> Result<u8, BackendError> {
        match self.free.pop() {
            Some(reg) => Ok(reg),
            None => self.unsupported("register pressure"),
        }
    }

    fn input(&self, idx: usize) -> u8 {
        *self.values.get(&idx).expect("input value lowered before use")
    }
}

impl Encoder for Riscv64Encoder {
    fn arch(&self) -> HostArch {
        HostArch::Riscv64
    }

    fn supports(&self, kind: &NodeKind) -> bool {
        match kind {
            NodeKind::Start | NodeKind::End | NodeKind::Br { .. } | NodeKind::Ret => true,
            NodeKind::Constant { value } => *value <= i32::MAX as u64,
            NodeKind::ReadReg { .. } | NodeKind::WriteReg { .. } | NodeKind::WritePc { .. } => true,
            _ => false,
        }
    }

    fn emit_prologue(&mut self, w: &mut CodeWriter) -> Result<(), BackendError> {
        w.emit32(enc::addi(SP, SP, -32))?;
        w.emit32(enc::sd(RA, SP, 24))?;
        w.emit32(enc::sd(S2, SP, 16))?;
        w.emit32(enc::sd(S3, SP, 8))?;
        w.emit32(enc::addi(S2, A0, 0))?;
        w.emit32(enc::addi(S3, A1, 0))?;
        Ok(())
    }

    fn begin_block(&mut self) -> Result<(), BackendError> {
        self.chainable = false;
        self.chain_target = None;
        Ok(())
    }

    fn begin_instruction(&mut self, _packet: &Packet) -> Result<(), BackendError> {
        self.values.clear();
        self.free = SCRATCH.to_vec();
        self.chain_target = None;
        Ok(())
    }

    fn lower(&mut self, packet: &Packet, idx: NodeIdx, w: &mut CodeWriter) -> Result<(), BackendError> {
        let node = packet.node(idx);

        match node.kind() {
            NodeKind::Start | NodeKind::End => Ok(()),

            NodeKind::Constant { value } => {
                // lui sign-extends on RV64; only non-negative i32 range
                // constants materialize correctly in two instructions.
                if *value > i32::MAX as u64 {
                    return self.unsupported("wide constant");
                }

                let dst = self.alloc()?;
                let value = *value as i64;
                let hi = ((value + 0x800) >> 12) as i32;
                let lo = (value - ((hi as i64) << 12)) as i32;
                if hi != 0 {
                    w.emit32(enc::lui(dst, hi))?;
                    w.emit32(enc::addi(dst, dst, lo as i16))?;
                } else {
                    w.emit32(enc::addi(dst, 0, lo as i16))?;
                }

                self.values.insert(idx.index(), dst);
                Ok(())
            }

            NodeKind::ReadReg { offset } if node.ty() == ValueType::u64() && offset % 8 == 0 => {
                let dst = self.alloc()?;
                w.emit32(enc::ld(dst, S2, *offset as i16))?;
                self.values.insert(idx.index(), dst);
                Ok(())
            }

            NodeKind::WriteReg { offset, value } if value.ty() == ValueType::u64() && offset % 8 == 0 => {
                let src = self.input(value.node().index());
                w.emit32(enc::sd(src, S2, *offset as i16))?;
                Ok(())
            }

            NodeKind::WritePc { value } => {
                if let NodeKind::Constant { value: pc } = packet.node(value.node()).kind() {
                    self.chain_target = Some(*pc);
                }
                let src = self.input(value.node().index());
                w.emit32(enc::sd(src, S2, arancini_x86::offsets::PC as i16))?;
                Ok(())
            }

            NodeKind::Br { .. } => {
                self.chainable = true;
                Ok(())
            }
            NodeKind::Ret => Ok(()),

            other => self.unsupported(format!("{other:?}")),
        }
    }

    fn end_instruction(&mut self, _w: &mut CodeWriter) -> Result<(), BackendError> {
        self.values.clear();
        Ok(())
    }

    fn emit_epilogue(&mut self, w: &mut CodeWriter) -> Result<BlockExit, BackendError> {
        let mut chain_sites = Vec::new();

        w.emit32(enc::addi(A0, 0, 0))?;
        if self.chainable {
            if let Some(target_pc) = self.chain_target {
                // The jal is the patch slot; +4 falls through.
                chain_sites.push(ChainSite {
                    offset: w.pos(),
                    kind: ChainKind::DirectJump,
                    target_pc,
                });
                w.emit32(enc::jal_x0(4))?;
            }
        }

        let epilogue_offset = w.pos();
        w.emit32(enc::ld(RA, SP, 24))?;
        w.emit32(enc::ld(S2, SP, 16))?;
        w.emit32(enc::ld(S3, SP, 8))?;
        w.emit32(enc::addi(SP, SP, 32))?;
        w.emit32(enc::JALR_RET)?;

        Ok(BlockExit {
            chain_sites,
            epilogue_offset,
        })
    }

    fn patch_chain(&self, site: &ChainSite, buffer: &ExecBuffer, target_addr: usize) -> Result<(), BackendError> {
        let ChainKind::DirectJump = site.kind;

        let from = buffer.addr_of(site.offset) as i128;
        let delta = target_addr as i128 - from;
        if delta % 2 != 0 || !(-(1 << 20)..(1 << 20)).contains(&delta) {
            return Err(BackendError::ChainTargetOutOfRange);
        }

        ChainWriter::new(buffer, site.offset, 4)?.patch32(enc::jal_x0(delta as i32))
    }
}

/// RV64I instruction words.
mod enc {
    /// jalr x0, 0(ra)
    pub(super) const JALR_RET: u32 = 0x0000_8067;

    pub(super) const fn addi(rd: u8, rs: u8, imm: i16) -> u32 {
        ((imm as u32 & 0xfff) << 20) | ((rs as u32) << 15) | ((rd as u32) << 7) | 0x13
    }

    pub(super) const fn lui(rd: u8, imm20: i32) -> u32 {
        ((imm20 as u32 & 0xf_ffff) << 12) | ((rd as u32) << 7) | 0x37
    }

    pub(super) const fn ld(rd: u8, rs: u8, off: i16) -> u32 {
        ((off as u32 & 0xfff) << 20) | ((rs as u32) << 15) | (0b011 << 12) | ((rd as u32) << 7) | 0x03
    }

    pub(super) const fn sd(rs2: u8, rs1: u8, off: i16) -> u32 {
        let off = off as u32 & 0xfff;
        ((off >> 5) << 25)
            | ((rs2 as u32) << 20)
            | ((rs1 as u32) << 15)
            | (0b011 << 12)
            | ((off & 0x1f) << 7)
            | 0x23
    }

    /// jal x0 with a byte displacement.
    pub(super) const fn jal_x0(offset: i32) -> u32 {
        let imm = offset as u32;
        let imm20 = (imm >> 20) & 1;
        let imm10_1 = (imm >> 1) & 0x3ff;
        let imm11 = (imm >> 11) & 1;
        let imm19_12 = (imm >> 12) & 0xff;
        (imm20 << 31) | (imm10_1 << 21) | (imm11 << 20) | (imm19_12 << 12) | 0x6f
    }
}

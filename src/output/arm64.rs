//! AArch64 host backend.
//!
//! The lowerer is a stub: it can materialize constants, move 64-bit
//! values between CPU-state slots and registers, and terminate blocks,
//! which is enough to drive the encoder interface and chain patching.
//! `supports` reports the truth so the engine fails translations that
//! need more.
//!
//! Convention: `x19` holds the CPU-state pointer, `x20` the guest
//! memory base; `x9..x15` are the value scratch pool.

use std::collections::HashMap;

use arancini_ir::{NodeIdx, NodeKind, Packet, ValueType};

use crate::error::BackendError;
use crate::output::writer::{ChainWriter, CodeWriter, ExecBuffer};
use crate::output::{BlockExit, ChainKind, ChainSite, Encoder, HostArch};

const SCRATCH: [u8; 7] = [9, 10, 11, 12, 13, 14, 15];

/// The AArch64 encoder.
#[derive(Debug, Default)]
pub struct Arm64Encoder {
    values: HashMap<usize, u8>,
    free: Vec<u8>,
    chainable: bool,
    chain_target: Option<u64>,
}

impl Arm64Encoder {
    /// Construct the encoder.
    pub fn new() -> Self {
        Self::default()
    }

    fn unsupported<T>(&self, what: impl Into<String>) -> Result<T, BackendError> {
        Err(BackendError::UnsupportedNode {
            backend: "arm64",
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

impl Encoder for Arm64Encoder {
    fn arch(&self) -> HostArch {
        HostArch::Arm64
    }

    fn supports(&self, kind: &NodeKind) -> bool {
        match kind {
            NodeKind::Start | NodeKind::End | NodeKind::Br { .. } | NodeKind::Ret => true,
            NodeKind::Constant { .. } => true,
            NodeKind::ReadReg { .. } | NodeKind::WriteReg { .. } | NodeKind::WritePc { .. } => true,
            _ => false,
        }
    }

    fn emit_prologue(&mut self, w: &mut CodeWriter) -> Result<(), BackendError> {
        w.emit32(enc::STP_X29_X30_PRE)?;
        w.emit32(enc::STP_X19_X20_PRE)?;
        w.emit32(enc::mov_rr(19, 0))?;
        w.emit32(enc::mov_rr(20, 1))?;
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
                let dst = self.alloc()?;
                for i in 0..4 {
                    let half = ((*value >> (16 * i)) & 0xffff) as u16;
                    if i == 0 {
                        w.emit32(enc::movz(dst, half, 0))?;
                    } else if half != 0 {
                        w.emit32(enc::movk(dst, half, i))?;
                    }
                }
                self.values.insert(idx.index(), dst);
                Ok(())
            }

            NodeKind::ReadReg { offset } if node.ty() == ValueType::u64() && offset % 8 == 0 => {
                let dst = self.alloc()?;
                w.emit32(enc::ldr_x(dst, 19, *offset))?;
                self.values.insert(idx.index(), dst);
                Ok(())
            }

            NodeKind::WriteReg { offset, value } if value.ty() == ValueType::u64() && offset % 8 == 0 => {
                let src = self.input(value.node().index());
                w.emit32(enc::str_x(src, 19, *offset))?;
                Ok(())
            }

            NodeKind::WritePc { value } => {
                if let NodeKind::Constant { value: pc } = packet.node(value.node()).kind() {
                    self.chain_target = Some(*pc);
                }
                let src = self.input(value.node().index());
                w.emit32(enc::str_x(src, 19, arancini_x86::offsets::PC))?;
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

        w.emit32(enc::MOVZ_W0_0)?;
        if self.chainable {
            if let Some(target_pc) = self.chain_target {
                // The branch instruction itself is the patch slot; an
                // offset of one instruction falls through.
                chain_sites.push(ChainSite {
                    offset: w.pos(),
                    kind: ChainKind::DirectJump,
                    target_pc,
                });
                w.emit32(enc::b(1))?;
            }
        }

        let epilogue_offset = w.pos();
        w.emit32(enc::LDP_X19_X20_POST)?;
        w.emit32(enc::LDP_X29_X30_POST)?;
        w.emit32(enc::RET)?;

        Ok(BlockExit {
            chain_sites,
            epilogue_offset,
        })
    }

    fn patch_chain(&self, site: &ChainSite, buffer: &ExecBuffer, target_addr: usize) -> Result<(), BackendError> {
        let ChainKind::DirectJump = site.kind;

        let from = buffer.addr_of(site.offset) as i128;
        let delta = target_addr as i128 - from;
        if delta % 4 != 0 || !(-(1 << 27)..(1 << 27)).contains(&delta) {
            return Err(BackendError::ChainTargetOutOfRange);
        }

        ChainWriter::new(buffer, site.offset, 4)?.patch32(enc::b((delta / 4) as i32))
    }
}

/// A64 instruction words.
mod enc {
    pub(super) const STP_X29_X30_PRE: u32 = 0xa9bf_7bfd;
    pub(super) const STP_X19_X20_PRE: u32 = 0xa9bf_53f3;
    pub(super) const LDP_X19_X20_POST: u32 = 0xa8c1_53f3;
    pub(super) const LDP_X29_X30_POST: u32 = 0xa8c1_7bfd;
    pub(super) const RET: u32 = 0xd65f_03c0;
    pub(super) const MOVZ_W0_0: u32 = 0x5280_0000;

    /// orr xd, xzr, xm
    pub(super) const fn mov_rr(d: u8, m: u8) -> u32 {
        0xaa00_03e0 | ((m as u32) << 16) | d as u32
    }

    pub(super) const fn movz(d: u8, imm: u16, shift16: u32) -> u32 {
        0xd280_0000 | (shift16 << 21) | ((imm as u32) << 5) | d as u32
    }

    pub(super) const fn movk(d: u8, imm: u16, shift16: u32) -> u32 {
        0xf280_0000 | (shift16 << 21) | ((imm as u32) << 5) | d as u32
    }

    /// ldr xd, [xn, #off]; off must be 8-byte scaled.
    pub(super) const fn ldr_x(d: u8, n: u8, off: u32) -> u32 {
        0xf940_0000 | ((off / 8) << 10) | ((n as u32) << 5) | d as u32
    }

    pub(super) const fn str_x(s: u8, n: u8, off: u32) -> u32 {
        0xf900_0000 | ((off / 8) << 10) | ((n as u32) << 5) | s as u32
    }

    /// b with an instruction-count displacement.
    pub(super) const fn b(words: i32) -> u32 {
        0x1400_0000 | (words as u32 & 0x03ff_ffff)
    }
}

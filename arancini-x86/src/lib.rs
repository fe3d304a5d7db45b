//! x86-64 guest front end: decodes guest bytes and lifts them into IR
//! chunks.
//!
//! Decoding is driven by an external instruction decoder (`iced-x86`);
//! the lifter dispatches on the decoded instruction class to a small set
//! of per-family translators sharing one operand/flag toolkit.

#![warn(missing_docs)]

mod error;
mod funcs;
mod state;
mod translate;

pub use error::LiftError;
pub use funcs::X86InternalFunctions;
pub use state::{offsets, X86CpuState, XmmReg};

use iced_x86::{Decoder, DecoderOptions, Formatter, GasFormatter, Instruction, IntelFormatter, Mnemonic, OpKind};
use std::collections::BTreeSet;

use arancini_ir::{Chunk, ChunkBuilder, InternalFunctionRegistry, PacketType};

use crate::translate::PacketLifter;

/// Disassembly flavour recorded on packets when debug lifting is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisassemblySyntax {
    /// AT&T operand order.
    Att,
    /// Intel operand order.
    Intel,
}

/// Bounds on one decode request.
#[derive(Debug, Clone, Copy)]
pub struct LiftLimits {
    /// Maximum packets lifted into a single block before the block is
    /// closed with a synthetic continuation branch.
    pub max_packets_per_block: usize,
    /// Maximum blocks per chunk when following direct jumps.
    pub max_blocks: usize,
}

impl Default for LiftLimits {
    fn default() -> Self {
        Self {
            max_packets_per_block: 64,
            max_blocks: 8,
        }
    }
}

/// The x86-64 input architecture: lifts guest machine code to chunks.
#[derive(Debug)]
pub struct X86Lifter {
    registry: InternalFunctionRegistry<X86InternalFunctions>,
    syntax: DisassemblySyntax,
    debug: bool,
    limits: LiftLimits,
}

impl Default for X86Lifter {
    fn default() -> Self {
        Self::new(DisassemblySyntax::Intel, false)
    }
}

impl X86Lifter {
    /// Construct a lifter. With `debug` set, packets carry disassembly
    /// strings in the chosen syntax.
    pub fn new(syntax: DisassemblySyntax, debug: bool) -> Self {
        Self {
            registry: InternalFunctionRegistry::new(X86InternalFunctions),
            syntax,
            debug,
            limits: LiftLimits::default(),
        }
    }

    /// Replace the decode bounds.
    pub fn with_limits(mut self, limits: LiftLimits) -> Self {
        self.limits = limits;
        self
    }

    /// The internal-function table the lifted IR resolves against.
    pub fn registry(&self) -> &InternalFunctionRegistry<X86InternalFunctions> {
        &self.registry
    }

    /// Lift the code window starting at `base_address` into a chunk.
    ///
    /// With `basic_block` set the chunk holds exactly one block, ending
    /// at the first control transfer. Otherwise the lifter additionally
    /// follows direct unconditional jumps that stay inside the window,
    /// producing a multi-block chunk.
    pub fn translate_chunk(&self, base_address: u64, code: &[u8], basic_block: bool) -> Result<Chunk, LiftError> {
        if code.is_empty() {
            return Err(LiftError::EmptyCode { address: base_address });
        }

        let mut builder = ChunkBuilder::new(&self.registry);
        builder.begin_chunk()?;

        let mut decoder = Decoder::with_ip(64, code, base_address, DecoderOptions::NONE);
        let mut formatter = self.formatter();
        let mut block_starts = BTreeSet::from([base_address]);
        let mut packets_in_block = 0usize;
        let mut blocks = 1usize;

        while decoder.can_decode() {
            let instr = decoder.decode();
            if instr.is_invalid() {
                return Err(LiftError::InvalidInstruction { address: instr.ip() });
            }

            let disasm = formatter.format(&instr);

            tracing::trace!(ip = instr.ip(), mnemonic = ?instr.mnemonic(), "lift");

            builder.begin_packet(instr.ip(), disasm)?;
            PacketLifter::new(&mut builder, &instr).translate()?;
            let ty = builder.end_packet()?;
            packets_in_block += 1;

            if !ty.terminates_block() {
                if packets_in_block >= self.limits.max_packets_per_block {
                    // Packet limit reached mid-block: end it with a
                    // branch to the next instruction so the block stays
                    // chainable.
                    Self::continue_at(&mut builder, instr.next_ip())?;
                    break;
                }
                continue;
            }

            // Follow direct unconditional jumps inside the window.
            let followable = !basic_block
                && ty == PacketType::Branch
                && instr.mnemonic() == Mnemonic::Jmp
                && matches!(
                    instr.op0_kind(),
                    OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
                );

            if followable && blocks < self.limits.max_blocks {
                let target = instr.near_branch_target();
                let window = base_address..base_address + code.len() as u64;

                if window.contains(&target)
                    && block_starts.insert(target)
                    && decoder.set_position((target - base_address) as usize).is_ok()
                {
                    decoder.set_ip(target);
                    packets_in_block = 0;
                    blocks += 1;
                    continue;
                }
            }

            break;
        }

        Ok(builder.end_chunk()?)
    }

    fn formatter(&self) -> Disassembler {
        if !self.debug {
            return Disassembler::Off;
        }

        match self.syntax {
            DisassemblySyntax::Att => Disassembler::Att(GasFormatter::new()),
            DisassemblySyntax::Intel => Disassembler::Intel(IntelFormatter::new()),
        }
    }

    fn continue_at(
        builder: &mut ChunkBuilder<'_, X86InternalFunctions>,
        next: u64,
    ) -> Result<(), LiftError> {
        builder.begin_packet(next, None)?;
        let target = builder.insert_constant_u64(next)?;
        builder.insert_write_pc(target)?;
        builder.insert_br(arancini_ir::BranchKind::Jump)?;
        builder.end_packet()?;
        Ok(())
    }
}

/// Per-request disassembly recorder.
enum Disassembler {
    Off,
    Att(GasFormatter),
    Intel(IntelFormatter),
}

impl Disassembler {
    fn format(&mut self, instr: &Instruction) -> Option<String> {
        let mut text = String::new();
        match self {
            Self::Off => return None,
            Self::Att(f) => f.format(instr, &mut text),
            Self::Intel(f) => f.format(instr, &mut text),
        }
        Some(text)
    }
}

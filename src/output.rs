//! Host-code generation: the encoder abstraction, the per-chunk
//! translation context, and the concrete backends.

pub mod arm64;
pub mod personality;
pub mod riscv64;
pub mod writer;
pub mod x86;

use arancini_ir::{NodeIdx, NodeKind, Packet};

use crate::error::BackendError;
use crate::output::writer::{CodeWriter, ExecBuffer};

/// Host instruction sets with a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum HostArch {
    /// x86-64, direct byte emission.
    X86_64,
    /// AArch64, in-tree encoder.
    Arm64,
    /// RV64I, in-tree encoder.
    Riscv64,
}

impl HostArch {
    /// The architecture this binary runs on, if a backend exists for it.
    pub const fn native() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Self::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Self::Arm64)
        } else if cfg!(target_arch = "riscv64") {
            Some(Self::Riscv64)
        } else {
            None
        }
    }
}

/// How a chain site transfers control until and after patching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    /// An unconditional jump whose displacement field is rewritten.
    DirectJump,
}

/// One patchable outgoing edge of a translation: the displacement field
/// at `offset` initially reaches the dispatcher return and is rewritten
/// to jump straight to the successor once it exists.
#[derive(Debug, Clone, Copy)]
pub struct ChainSite {
    /// Offset of the patchable field inside the code buffer.
    pub offset: usize,
    /// Site flavour.
    pub kind: ChainKind,
    /// Guest PC of the targeted successor.
    pub target_pc: u64,
}

/// What a backend reports after closing a block.
#[derive(Debug)]
pub struct BlockExit {
    /// Patchable outgoing edges.
    pub chain_sites: Vec<ChainSite>,
    /// Offset of the dispatcher-return path chain sites fall back to.
    pub epilogue_offset: usize,
}

/// A host-ISA code generator.
///
/// One encoder lowers one block at a time: `emit_prologue`, the
/// node-by-node `lower` calls driven through a [`TranslationContext`],
/// then `emit_epilogue`. `patch_chain` rewrites a previously emitted
/// chain site in place.
pub trait Encoder: Send {
    /// Target architecture.
    fn arch(&self) -> HostArch;

    /// Whether `lower` has an implementation for this node kind.
    fn supports(&self, kind: &NodeKind) -> bool;

    /// Emit the per-translation entry sequence. On return the writer
    /// position is the body entry chained successors jump to.
    fn emit_prologue(&mut self, w: &mut CodeWriter) -> Result<(), BackendError>;

    /// Reset per-block state.
    fn begin_block(&mut self) -> Result<(), BackendError>;

    /// Reset per-instruction state.
    fn begin_instruction(&mut self, packet: &Packet) -> Result<(), BackendError>;

    /// Lower one node of the current packet.
    fn lower(&mut self, packet: &Packet, idx: NodeIdx, w: &mut CodeWriter) -> Result<(), BackendError>;

    /// Finish the current packet.
    fn end_instruction(&mut self, w: &mut CodeWriter) -> Result<(), BackendError>;

    /// Emit the block exit and epilogue; returns the chain sites.
    fn emit_epilogue(&mut self, w: &mut CodeWriter) -> Result<BlockExit, BackendError>;

    /// Rewrite `site` inside `buffer` to reach `target_addr` (a host
    /// code address).
    fn patch_chain(&self, site: &ChainSite, buffer: &ExecBuffer, target_addr: usize) -> Result<(), BackendError>;
}

/// Translation-context states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtxState {
    Idle,
    BlockOpen,
    InInstr,
}

impl CtxState {
    const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::BlockOpen => "block open",
            Self::InInstr => "in an instruction",
        }
    }
}

/// Per-chunk lowering driver bound to one writer and one encoder.
///
/// Enforces the emission state machine: blocks bracket instructions,
/// instructions bracket `lower` calls; anything out of order is a
/// [`BackendError::State`].
#[derive(Debug)]
pub struct TranslationContext<'e, 'w, E: ?Sized> {
    encoder: &'e mut E,
    writer: &'w mut CodeWriter,
    state: CtxState,
}

impl<'e, 'w, E: Encoder + ?Sized> TranslationContext<'e, 'w, E> {
    /// Bind an encoder to a writer.
    pub fn new(encoder: &'e mut E, writer: &'w mut CodeWriter) -> Self {
        Self {
            encoder,
            writer,
            state: CtxState::Idle,
        }
    }

    /// Open a block.
    pub fn begin_block(&mut self) -> Result<(), BackendError> {
        self.expect(CtxState::Idle, "begin_block")?;
        self.encoder.begin_block()?;
        self.state = CtxState::BlockOpen;
        Ok(())
    }

    /// Open the emission of one guest instruction.
    pub fn begin_instruction(&mut self, packet: &Packet) -> Result<(), BackendError> {
        self.expect(CtxState::BlockOpen, "begin_instruction")?;
        self.encoder.begin_instruction(packet)?;
        self.state = CtxState::InInstr;
        Ok(())
    }

    /// Lower one node; only valid between `begin_instruction` and
    /// `end_instruction`.
    pub fn lower(&mut self, packet: &Packet, idx: NodeIdx) -> Result<(), BackendError> {
        self.expect(CtxState::InInstr, "lower")?;
        self.encoder.lower(packet, idx, self.writer)
    }

    /// Close the current instruction.
    pub fn end_instruction(&mut self) -> Result<(), BackendError> {
        self.expect(CtxState::InInstr, "end_instruction")?;
        self.encoder.end_instruction(self.writer)?;
        self.state = CtxState::BlockOpen;
        Ok(())
    }

    /// Close the block: emits the exit path and epilogue.
    pub fn end_block(&mut self) -> Result<BlockExit, BackendError> {
        self.expect(CtxState::BlockOpen, "end_block")?;
        let exit = self.encoder.emit_epilogue(self.writer)?;
        self.state = CtxState::Idle;
        Ok(exit)
    }

    fn expect(&self, want: CtxState, operation: &'static str) -> Result<(), BackendError> {
        if self.state != want {
            return Err(BackendError::State {
                operation,
                state: self.state.name(),
            });
        }
        Ok(())
    }
}

/// Dependency-ordered lowering schedule for one packet.
///
/// Walks the action nodes in program order and emits each value node
/// after its inputs, visiting every node once. Pure nodes nothing
/// depends on are skipped; action ordering is preserved.
pub fn schedule(packet: &Packet) -> Vec<NodeIdx> {
    let nodes = packet.nodes();
    let mut order = Vec::with_capacity(nodes.len());
    let mut visited = vec![false; nodes.len()];

    fn visit(packet: &Packet, idx: NodeIdx, visited: &mut [bool], order: &mut Vec<NodeIdx>) {
        if visited[idx.index()] {
            return;
        }
        visited[idx.index()] = true;

        for input in packet.node(idx).inputs() {
            visit(packet, input.node(), visited, order);
        }
        order.push(idx);
    }

    for (i, node) in nodes.iter().enumerate() {
        if node.is_action() {
            visit(packet, NodeIdx::from_index(i), &mut visited, &mut order);
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullEncoder;

    impl Encoder for NullEncoder {
        fn arch(&self) -> HostArch {
            HostArch::X86_64
        }

        fn supports(&self, _kind: &NodeKind) -> bool {
            true
        }

        fn emit_prologue(&mut self, _w: &mut CodeWriter) -> Result<(), BackendError> {
            Ok(())
        }

        fn begin_block(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        fn begin_instruction(&mut self, _packet: &Packet) -> Result<(), BackendError> {
            Ok(())
        }

        fn lower(&mut self, _packet: &Packet, _idx: NodeIdx, _w: &mut CodeWriter) -> Result<(), BackendError> {
            Ok(())
        }

        fn end_instruction(&mut self, _w: &mut CodeWriter) -> Result<(), BackendError> {
            Ok(())
        }

        fn emit_epilogue(&mut self, _w: &mut CodeWriter) -> Result<BlockExit, BackendError> {
            Ok(BlockExit {
                chain_sites: Vec::new(),
                epilogue_offset: 0,
            })
        }

        fn patch_chain(
            &self,
            _site: &ChainSite,
            _buffer: &ExecBuffer,
            _target_addr: usize,
        ) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[test]
    fn out_of_order_transitions_fail() {
        let mut enc = NullEncoder;
        let mut w = CodeWriter::with_capacity(64).unwrap();
        let mut ctx = TranslationContext::new(&mut enc, &mut w);

        assert!(matches!(
            ctx.end_block().unwrap_err(),
            BackendError::State { operation: "end_block", .. }
        ));

        ctx.begin_block().unwrap();
        assert!(matches!(
            ctx.begin_block().unwrap_err(),
            BackendError::State { operation: "begin_block", .. }
        ));
        assert!(matches!(
            ctx.end_instruction().unwrap_err(),
            BackendError::State { operation: "end_instruction", .. }
        ));
    }
}

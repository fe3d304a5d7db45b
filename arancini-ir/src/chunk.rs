//! Blocks and chunks: the grouping of packets above the instruction level.

use crate::error::IrError;
use crate::packet::Packet;
use crate::visitor::Visitor;

/// A contiguous sequence of packets with a single entry at the first
/// packet's address. The final packet is the only one allowed to
/// terminate the block.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    packets: Vec<Packet>,
}

impl Block {
    pub(crate) fn new(packets: Vec<Packet>) -> Self {
        Self { packets }
    }

    /// Entry address: the address of the first packet.
    pub fn address(&self) -> u64 {
        self.packets.first().map(Packet::address).unwrap_or(0)
    }

    /// Packets in program order.
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// Drive a visitor over this block.
    pub fn accept<V: Visitor + ?Sized>(&self, v: &mut V) {
        if !v.visit_block_start(self) {
            return;
        }

        for p in &self.packets {
            crate::visitor::walk_packet(p, v);
        }

        v.visit_block_end(self);
    }
}

/// Ordered set of blocks produced from one decode request.
///
/// A chunk imposes no control-flow semantics of its own; control flow
/// lives in the action nodes and is interpreted by the lowerer. Chunks
/// are self-contained: no port edge crosses a chunk boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    blocks: Vec<Block>,
}

impl Chunk {
    pub(crate) fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    /// Blocks in decode order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The block entered at `address`, if the chunk holds one.
    pub fn block_at(&self, address: u64) -> Option<&Block> {
        self.blocks.iter().find(|b| b.address() == address)
    }

    /// Total packet count across all blocks.
    pub fn packet_count(&self) -> usize {
        self.blocks.iter().map(|b| b.packets().len()).sum()
    }

    /// Drive a visitor over the whole chunk.
    pub fn accept<V: Visitor + ?Sized>(&self, v: &mut V) {
        if !v.visit_chunk_start(self) {
            return;
        }

        for b in &self.blocks {
            b.accept(v);
        }

        v.visit_chunk_end(self);
    }

    /// Check the structural invariants of every packet: each input port
    /// must reference an earlier node of the same packet, and the port's
    /// recorded type must agree with the producing node's output type.
    pub fn validate(&self) -> Result<(), IrError> {
        for block in &self.blocks {
            for packet in block.packets() {
                for (idx, node) in packet.nodes().iter().enumerate() {
                    for port in node.inputs() {
                        if port.node().index() >= idx {
                            return Err(IrError::ForwardReference {
                                address: packet.address(),
                            });
                        }

                        let src = packet.node(port.node());
                        if src.ty() != port.ty() {
                            return Err(IrError::TypeMismatch {
                                expected: port.ty(),
                                found: src.ty(),
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

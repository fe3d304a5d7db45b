//! Visitor traversal over chunks, blocks, packets and nodes.

use std::collections::BTreeSet;

use crate::chunk::{Block, Chunk};
use crate::node::{NodeIdx, NodeKind};
use crate::packet::Packet;

/// Per-kind traversal callbacks.
///
/// Start callbacks return `false` to skip the corresponding subtree. Node
/// callbacks receive the owning packet and the node's arena index; kinds
/// without a dedicated override fall through to the generic
/// [`visit_node`](Visitor::visit_node) hook.
#[allow(unused_variables)]
pub trait Visitor {
    /// Entering a chunk; `false` skips it entirely.
    fn visit_chunk_start(&mut self, chunk: &Chunk) -> bool {
        true
    }

    /// Leaving a chunk.
    fn visit_chunk_end(&mut self, chunk: &Chunk) {}

    /// Entering a block; `false` skips its packets.
    fn visit_block_start(&mut self, block: &Block) -> bool {
        true
    }

    /// Leaving a block.
    fn visit_block_end(&mut self, block: &Block) {}

    /// Entering a packet; `false` skips its nodes.
    fn visit_packet_start(&mut self, packet: &Packet) -> bool {
        true
    }

    /// Leaving a packet.
    fn visit_packet_end(&mut self, packet: &Packet) {}

    /// Generic fallback for every node kind.
    fn visit_node(&mut self, packet: &Packet, idx: NodeIdx) {}

    /// Packet entry marker.
    fn visit_start(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Packet exit marker.
    fn visit_end(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Immediate value.
    fn visit_constant(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// CPU-state load.
    fn visit_read_reg(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Guest-memory load.
    fn visit_read_mem(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Two-operand arithmetic.
    fn visit_binary_arith(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Shift.
    fn visit_shift(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Bit-field extraction.
    fn visit_bit_extract(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Bitwise complement.
    fn visit_not(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Zero extension.
    fn visit_zero_extend(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Sign extension.
    fn visit_sign_extend(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Bit reinterpretation.
    fn visit_bitcast(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Conditional value choice.
    fn visit_select(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// CPU-state store.
    fn visit_write_reg(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Guest-memory store.
    fn visit_write_mem(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Next-PC store.
    fn visit_write_pc(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Host-helper call.
    fn visit_internal_call(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Block-terminating branch.
    fn visit_br(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }

    /// Block-terminating return.
    fn visit_ret(&mut self, packet: &Packet, idx: NodeIdx) {
        self.visit_node(packet, idx);
    }
}

/// Walk a packet's nodes in arena order, dispatching on kind.
pub(crate) fn walk_packet<V: Visitor + ?Sized>(packet: &Packet, v: &mut V) {
    if !v.visit_packet_start(packet) {
        return;
    }

    for (i, node) in packet.nodes().iter().enumerate() {
        let idx = NodeIdx(i as u32);
        match node.kind() {
            NodeKind::Start => v.visit_start(packet, idx),
            NodeKind::End => v.visit_end(packet, idx),
            NodeKind::Constant { .. } => v.visit_constant(packet, idx),
            NodeKind::ReadReg { .. } => v.visit_read_reg(packet, idx),
            NodeKind::ReadMem { .. } => v.visit_read_mem(packet, idx),
            NodeKind::BinaryArith { .. } => v.visit_binary_arith(packet, idx),
            NodeKind::Shift { .. } => v.visit_shift(packet, idx),
            NodeKind::BitExtract { .. } => v.visit_bit_extract(packet, idx),
            NodeKind::Not { .. } => v.visit_not(packet, idx),
            NodeKind::ZeroExtend { .. } => v.visit_zero_extend(packet, idx),
            NodeKind::SignExtend { .. } => v.visit_sign_extend(packet, idx),
            NodeKind::Bitcast { .. } => v.visit_bitcast(packet, idx),
            NodeKind::Select { .. } => v.visit_select(packet, idx),
            NodeKind::WriteReg { .. } => v.visit_write_reg(packet, idx),
            NodeKind::WriteMem { .. } => v.visit_write_mem(packet, idx),
            NodeKind::WritePc { .. } => v.visit_write_pc(packet, idx),
            NodeKind::InternalCall { .. } => v.visit_internal_call(packet, idx),
            NodeKind::Br { .. } => v.visit_br(packet, idx),
            NodeKind::Ret => v.visit_ret(packet, idx),
        }
    }

    v.visit_packet_end(packet);
}

/// Collects which CPU-state byte offsets a chunk reads and writes.
///
/// Backends use this ahead of lowering to decide which guest registers
/// are worth pinning to host registers.
#[derive(Debug, Default)]
pub struct RegisterUseVisitor {
    read: BTreeSet<u32>,
    written: BTreeSet<u32>,
}

impl RegisterUseVisitor {
    /// Fresh collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offsets read by any packet.
    pub fn read(&self) -> &BTreeSet<u32> {
        &self.read
    }

    /// Offsets written by any packet.
    pub fn written(&self) -> &BTreeSet<u32> {
        &self.written
    }
}

impl Visitor for RegisterUseVisitor {
    fn visit_read_reg(&mut self, packet: &Packet, idx: NodeIdx) {
        if let NodeKind::ReadReg { offset } = packet.node(idx).kind() {
            self.read.insert(*offset);
        }
    }

    fn visit_write_reg(&mut self, packet: &Packet, idx: NodeIdx) {
        if let NodeKind::WriteReg { offset, .. } = packet.node(idx).kind() {
            self.written.insert(*offset);
        }
    }
}

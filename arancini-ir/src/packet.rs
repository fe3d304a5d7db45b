//! Instruction packets: the IR lifted from a single guest instruction.

use crate::node::{BranchKind, Node, NodeIdx, NodeKind};

/// Classification of a packet, determined by its final action node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum PacketType {
    /// No control transfer; execution continues with the next packet.
    Normal,
    /// Ends with a jump.
    Branch,
    /// Ends with a guest call.
    Call,
    /// Ends with a guest return.
    Return,
    /// Ends with a syscall helper invocation.
    Syscall,
    /// Ends with an interrupt helper invocation.
    Interrupt,
    /// Ends the block without a successor (e.g. HLT).
    EndOfBlock,
}

impl PacketType {
    /// `true` if a packet of this type terminates its basic block.
    pub const fn terminates_block(&self) -> bool {
        !matches!(self, Self::Normal)
    }
}

/// Ordered arena of nodes lifted from exactly one guest instruction.
///
/// The guest address is fixed at construction; action nodes appear in
/// program order, and the packet's side effects on CPU state are applied
/// atomically with respect to other packets.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    address: u64,
    disasm: Option<String>,
    nodes: Vec<Node>,
    ty: PacketType,
}

impl Packet {
    pub(crate) fn new(address: u64, disasm: Option<String>) -> Self {
        Self {
            address,
            disasm,
            nodes: Vec::new(),
            ty: PacketType::Normal,
        }
    }

    /// Guest address this packet was lifted from.
    pub const fn address(&self) -> u64 {
        self.address
    }

    /// Disassembly of the guest instruction, when the lifter recorded one.
    pub fn disassembly(&self) -> Option<&str> {
        self.disasm.as_deref()
    }

    /// Packet type; meaningful once the packet is complete.
    pub const fn ty(&self) -> PacketType {
        self.ty
    }

    /// Nodes in arena (program) order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node at an index handed out by the builder.
    pub fn node(&self, idx: NodeIdx) -> &Node {
        &self.nodes[idx.index()]
    }

    pub(crate) fn push(&mut self, node: Node) -> NodeIdx {
        let idx = NodeIdx(self.nodes.len() as u32);
        self.nodes.push(node);
        idx
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Derive the packet type from the final action node and seal the
    /// packet.
    pub(crate) fn seal(&mut self) -> PacketType {
        let last_action = self.nodes.iter().rev().find(|n| n.is_action());

        self.ty = match last_action.map(Node::kind) {
            Some(NodeKind::Br { kind: BranchKind::Jump }) => PacketType::Branch,
            Some(NodeKind::Br { kind: BranchKind::Call }) => PacketType::Call,
            Some(NodeKind::Ret) => PacketType::Return,
            Some(NodeKind::InternalCall { func, .. }) => match func.name() {
                "handle_syscall" => PacketType::Syscall,
                "handle_int" => PacketType::Interrupt,
                "hlt" => PacketType::EndOfBlock,
                _ => PacketType::Normal,
            },
            _ => PacketType::Normal,
        };

        self.ty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn only_normal_packets_continue_the_block() {
        for ty in PacketType::iter() {
            assert_eq!(ty.terminates_block(), ty != PacketType::Normal);
        }
    }
}

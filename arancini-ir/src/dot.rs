//! GraphViz rendering of chunks, for debugging the lifter.

use std::io;

use crate::chunk::{Block, Chunk};
use crate::node::NodeIdx;
use crate::packet::Packet;
use crate::visitor::Visitor;

/// Renders a chunk as a `dot` digraph: one cluster per packet, value
/// edges between nodes.
///
/// Write errors are remembered and re-surfaced by [`finish`](Self::finish)
/// since visitor callbacks cannot fail.
#[derive(Debug)]
pub struct DotGenerator<W> {
    out: W,
    error: Option<io::Error>,
}

impl<W: io::Write> DotGenerator<W> {
    /// Render into `out`.
    pub fn new(out: W) -> Self {
        Self { out, error: None }
    }

    /// Surface any write error seen during traversal.
    pub fn finish(self) -> io::Result<W> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.out),
        }
    }

    fn emit(&mut self, f: impl FnOnce(&mut W) -> io::Result<()>) {
        if self.error.is_none() {
            if let Err(e) = f(&mut self.out) {
                self.error = Some(e);
            }
        }
    }

    fn node_id(packet: &Packet, idx: NodeIdx) -> String {
        format!("p{:x}_n{}", packet.address(), idx.index())
    }
}

impl<W: io::Write> Visitor for DotGenerator<W> {
    fn visit_chunk_start(&mut self, _chunk: &Chunk) -> bool {
        self.emit(|w| writeln!(w, "digraph chunk {{\n  node [shape=box, fontname=monospace];"));
        true
    }

    fn visit_chunk_end(&mut self, _chunk: &Chunk) {
        self.emit(|w| writeln!(w, "}}"));
    }

    fn visit_block_start(&mut self, block: &Block) -> bool {
        self.emit(|w| writeln!(w, "  subgraph cluster_b{:x} {{ label=\"block {:#x}\";", block.address(), block.address()));
        true
    }

    fn visit_block_end(&mut self, _block: &Block) {
        self.emit(|w| writeln!(w, "  }}"));
    }

    fn visit_packet_start(&mut self, packet: &Packet) -> bool {
        let label = match packet.disassembly() {
            Some(d) => format!("{:#x}: {}", packet.address(), d),
            None => format!("{:#x}", packet.address()),
        };
        self.emit(|w| {
            writeln!(
                w,
                "    subgraph cluster_p{:x} {{ label=\"{}\";",
                packet.address(),
                label.replace('"', "'")
            )
        });
        true
    }

    fn visit_packet_end(&mut self, packet: &Packet) {
        // Edges after the nodes so every endpoint is declared.
        for (i, node) in packet.nodes().iter().enumerate() {
            let to = Self::node_id(packet, NodeIdx(i as u32));
            for port in node.inputs() {
                let from = Self::node_id(packet, port.node());
                self.emit(|w| writeln!(w, "      {} -> {} [label=\"{}\"];", from, to, port.ty()));
            }
        }
        self.emit(|w| writeln!(w, "    }}"));
    }

    fn visit_node(&mut self, packet: &Packet, idx: NodeIdx) {
        let id = Self::node_id(packet, idx);
        let label = packet.node(idx).to_string();
        self.emit(|w| writeln!(w, "      {} [label=\"{}\"];", id, label.replace('"', "'")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ChunkBuilder;
    use crate::resolver::{InternalFunction, InternalFunctionProvider, InternalFunctionRegistry};

    struct NoHelpers;

    impl InternalFunctionProvider for NoHelpers {
        fn create(&self, _name: &str) -> Option<InternalFunction> {
            None
        }
    }

    #[test]
    fn renders_nodes_and_edges() {
        let registry = InternalFunctionRegistry::new(NoHelpers);
        let mut b = ChunkBuilder::new(&registry);

        b.begin_chunk().unwrap();
        b.begin_packet(0x40, Some("mov rax, 42".into())).unwrap();
        let c = b.insert_constant_u64(42).unwrap();
        b.insert_write_reg(8, c).unwrap();
        b.end_packet().unwrap();
        let chunk = b.end_chunk().unwrap();

        let mut gen = DotGenerator::new(Vec::new());
        chunk.accept(&mut gen);
        let text = String::from_utf8(gen.finish().unwrap()).unwrap();

        assert!(text.starts_with("digraph chunk {"));
        assert!(text.contains("mov rax, 42"));
        assert!(text.contains("const 0x2a : u64"));
        assert!(text.contains("->"));
        assert!(text.trim_end().ends_with('}'));
    }
}

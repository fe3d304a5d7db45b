//! Output personalities: how translated chunks leave the system.
//!
//! The dynamic personality is the in-memory JIT path implemented by this
//! crate. The static personality is a boundary: it consumes the same
//! chunks plus an entry point and produces an executable; the concrete
//! lowering (an ahead-of-time compiler backend) lives outside the core.

use std::io;

use arancini_ir::{Chunk, DotGenerator};

/// Personality kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPersonalityKind {
    /// Emit a standalone host executable ahead of time.
    Static,
    /// Translate and execute in memory at run time.
    Dynamic,
}

/// A consumer of translated chunks.
///
/// The dynamic core guarantees its input contract: chunks arrive in
/// reproducible order, are self-contained (no cross-chunk value edges),
/// and express every required runtime call as an explicit
/// `internal_call` node.
pub trait OutputEngine {
    /// Which personality this engine implements.
    fn kind(&self) -> OutputPersonalityKind;

    /// Hand over one chunk.
    fn add_chunk(&mut self, chunk: Chunk);

    /// Produce the engine's artifact from the collected chunks.
    fn generate(&mut self) -> io::Result<()>;
}

/// Static-mode output boundary: collects chunks and the guest entry
/// point for an ahead-of-time backend.
#[derive(Debug)]
pub struct StaticOutputEngine<W> {
    chunks: Vec<Chunk>,
    entrypoint: u64,
    out: W,
}

impl<W: io::Write> StaticOutputEngine<W> {
    /// Collect into `out`.
    pub fn new(out: W) -> Self {
        Self {
            chunks: Vec::new(),
            entrypoint: 0,
            out,
        }
    }

    /// Record the guest entry point.
    pub fn set_entrypoint(&mut self, entrypoint: u64) {
        self.entrypoint = entrypoint;
    }

    /// Recorded entry point.
    pub const fn entrypoint(&self) -> u64 {
        self.entrypoint
    }

    /// Collected chunks, in the order they were added.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }
}

impl<W: io::Write> OutputEngine for StaticOutputEngine<W> {
    fn kind(&self) -> OutputPersonalityKind {
        OutputPersonalityKind::Static
    }

    fn add_chunk(&mut self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    /// The debug rendition of the static boundary: every chunk as a dot
    /// graph. A full backend replaces this with object emission.
    fn generate(&mut self) -> io::Result<()> {
        for chunk in &self.chunks {
            let mut gen = DotGenerator::new(&mut self.out);
            chunk.accept(&mut gen);
            gen.finish()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arancini_x86::{DisassemblySyntax, X86Lifter};

    #[test]
    fn static_engine_renders_chunks() {
        let lifter = X86Lifter::new(DisassemblySyntax::Intel, true);
        let chunk = lifter.translate_chunk(0, &[0x90, 0xc3], false).unwrap();

        let mut engine = StaticOutputEngine::new(Vec::new());
        engine.set_entrypoint(0);
        engine.add_chunk(chunk);
        engine.generate().unwrap();

        assert_eq!(engine.kind(), OutputPersonalityKind::Static);
        assert_eq!(engine.chunks().len(), 1);
    }
}

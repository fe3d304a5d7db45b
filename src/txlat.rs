//! Static-mode driver: translate a guest image ahead of time and hand
//! the chunks to an output personality.
//!
//! ELF section and symbol extraction belongs to an external
//! collaborator; this engine consumes a flat code image whose entry
//! point is offset zero.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use arancini_x86::{DisassemblySyntax, LiftError, X86Lifter};

use crate::output::personality::OutputEngine;

/// Static translation failures.
#[derive(Debug, Error)]
pub enum TxlatError {
    /// The source image could not be read.
    #[error("cannot read {path}: {source}")]
    Source {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The image could not be lifted.
    #[error("lift failed: {0}")]
    Lift(#[from] LiftError),

    /// The output personality failed to generate.
    #[error("output failed: {0}")]
    Output(#[from] io::Error),
}

/// Ahead-of-time translation engine.
#[derive(Debug)]
pub struct TxlatEngine {
    lifter: X86Lifter,
}

impl Default for TxlatEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TxlatEngine {
    /// Engine with disassembly recording on, for inspectable output.
    pub fn new() -> Self {
        Self {
            lifter: X86Lifter::new(DisassemblySyntax::Intel, true),
        }
    }

    /// Translate the image at `source` into `out`.
    pub fn translate(&self, source: &Path, out: &mut dyn OutputEngine) -> Result<(), TxlatError> {
        let image = fs::read(source).map_err(|e| TxlatError::Source {
            path: source.display().to_string(),
            source: e,
        })?;

        tracing::debug!(path = %source.display(), bytes = image.len(), "static translate");

        let chunk = self.lifter.translate_chunk(0, &image, false)?;
        out.add_chunk(chunk);
        out.generate()?;

        Ok(())
    }
}

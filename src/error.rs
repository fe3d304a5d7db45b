//! Runtime error taxonomy.
//!
//! Errors bubble from builder, lifter and backend up to the engine; the
//! engine does not retry, and the cache never stores a failed
//! translation.

use std::io;

use thiserror::Error;

use arancini_ir::IrError;
use arancini_x86::LiftError;

/// Failures inside an output backend or its code writer.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A translation-context call out of order.
    #[error("backend state machine violation: {operation} while {state}")]
    State {
        /// The attempted operation.
        operation: &'static str,
        /// The state the context was in.
        state: &'static str,
    },

    /// A node kind the backend declared unsupported.
    #[error("{backend} backend cannot lower node: {node}")]
    UnsupportedNode {
        /// Backend name.
        backend: &'static str,
        /// Display form of the offending node.
        node: String,
    },

    /// A chain-writer store past the end of its slot. The edge falls
    /// back to a dispatcher return.
    #[error("chain slot of {size} bytes cannot hold {needed} bytes")]
    ChainOverflow {
        /// Slot size in bytes.
        size: usize,
        /// Bytes the patch needed.
        needed: usize,
    },

    /// A patch site that is not naturally aligned for a single-store
    /// rewrite.
    #[error("patch site at offset {offset:#x} is not {align}-byte aligned")]
    MisalignedPatch {
        /// Site offset inside its code buffer.
        offset: usize,
        /// Required alignment.
        align: usize,
    },

    /// A chain displacement that does not fit the site's encoding.
    #[error("chain target out of range for the patch site")]
    ChainTargetOutOfRange,

    /// Executable memory could not be mapped or remapped.
    #[error("out of executable memory")]
    ResourceExhaustion(#[source] io::Error),
}

/// Aggregate failure of one translation request, surfaced to the
/// execution loop.
#[derive(Debug, Error)]
pub enum TranslationError {
    /// The lifter could not produce IR for the guest bytes.
    #[error("lift failed: {0}")]
    Lift(#[from] LiftError),

    /// The backend could not lower the IR.
    #[error("lowering failed: {0}")]
    Backend(#[from] BackendError),

    /// The requested PC does not lie inside guest memory.
    #[error("guest pc {pc:#x} is outside guest memory")]
    PcOutOfBounds {
        /// Requested guest program counter.
        pc: u64,
    },
}

impl From<IrError> for TranslationError {
    fn from(e: IrError) -> Self {
        Self::Lift(LiftError::from(e))
    }
}

/// Failures of the execution layer. A failed translation aborts the
/// guest thread with a diagnostic.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Translating the code at the current PC failed.
    #[error("translation failed: {0}")]
    Translation(#[from] TranslationError),

    /// Guest memory could not be mapped.
    #[error("unable to map {size} bytes of guest memory")]
    GuestMemory {
        /// Requested mapping size.
        size: usize,
        /// Mapping failure.
        #[source]
        source: io::Error,
    },

    /// An image load outside the guest memory region.
    #[error("image of {len} bytes does not fit at {addr:#x}")]
    ImageOutOfBounds {
        /// Load address.
        addr: u64,
        /// Image length.
        len: usize,
    },
}

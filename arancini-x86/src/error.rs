//! Lifter error definitions.

use iced_x86::{Mnemonic, Register};
use thiserror::Error;

use arancini_ir::IrError;

/// Errors raised while lifting guest bytes to IR. All are fatal to the
/// current translation; the engine may poison or fall back, but never
/// caches a failed translation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LiftError {
    /// The lifter has no rule for this instruction class.
    #[error("unsupported instruction: {iclass:?}")]
    UnsupportedInstruction {
        /// Decoded instruction class.
        iclass: Mnemonic,
    },

    /// The decoder could not make sense of the bytes.
    #[error("invalid instruction bytes at {address:#x}")]
    InvalidInstruction {
        /// Guest address of the undecodable bytes.
        address: u64,
    },

    /// The decode window was empty.
    #[error("no code bytes at {address:#x}")]
    EmptyCode {
        /// Requested guest address.
        address: u64,
    },

    /// An operand kind that cannot be a store destination.
    #[error("operand {index} of {iclass:?} is not writable")]
    OperandNotWritable {
        /// Decoded instruction class.
        iclass: Mnemonic,
        /// Operand position.
        index: u32,
    },

    /// A register with no CPU-state slot (e.g. a segment selector used as
    /// a data operand).
    #[error("register {reg:?} has no state slot")]
    UnsupportedRegister {
        /// Offending register.
        reg: Register,
    },

    /// IR builder misuse while emitting nodes.
    #[error(transparent)]
    Ir(#[from] IrError),
}

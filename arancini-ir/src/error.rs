//! IR construction error definitions.

use thiserror::Error;

use crate::value_type::ValueType;

/// Misuse of the IR builder. All variants are fatal to the current
/// translation; callers surface them as a translation error to the engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IrError {
    /// An edge would connect ports of different types.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Type required by the consuming port.
        expected: ValueType,
        /// Type actually produced.
        found: ValueType,
    },

    /// An integer operation was given a non-integer operand.
    #[error("operation requires an integer operand, found {0}")]
    NotAnInteger(ValueType),

    /// A select condition was not width-1.
    #[error("select condition must be u1, found {0}")]
    NotACondition(ValueType),

    /// `bit_extract` range exceeds the source width.
    #[error("bit extract of [{lo}+{width}] exceeds source width {of}")]
    BitExtractRange {
        /// Lowest extracted bit.
        lo: u16,
        /// Extracted width.
        width: u16,
        /// Total width of the source value.
        of: u32,
    },

    /// An extension that does not widen its operand.
    #[error("extension must widen: {from} to {to}")]
    NotWidening {
        /// Source type.
        from: ValueType,
        /// Requested target type.
        to: ValueType,
    },

    /// A bitcast that changes the total width.
    #[error("bitcast must preserve total width: {from} to {to}")]
    WidthChangingBitcast {
        /// Source type.
        from: ValueType,
        /// Requested target type.
        to: ValueType,
    },

    /// `begin_packet` while a packet is already open.
    #[error("nested packets are not allowed")]
    NestedPacket,

    /// A node constructor or `end_packet` without an open packet.
    #[error("no packet is open")]
    PacketNotOpen,

    /// `begin_chunk` while a chunk is already open.
    #[error("chunk already open")]
    ChunkAlreadyOpen,

    /// `end_chunk` or packet operations without an open chunk.
    #[error("no chunk is open")]
    ChunkNotOpen,

    /// `end_chunk` while a packet is still open.
    #[error("cannot finish chunk: a packet is still open")]
    ChunkIncomplete,

    /// An internal-function name the provider does not recognize. The
    /// failure is sticky: later resolutions of the same name fail too.
    #[error("unable to resolve internal function {0}")]
    UnresolvedFunction(String),

    /// Wrong argument count in an internal call.
    #[error("internal function {name} takes {expected} arguments, {found} given")]
    ArityMismatch {
        /// Callee name.
        name: String,
        /// Arity of the resolved signature.
        expected: usize,
        /// Arguments supplied.
        found: usize,
    },

    /// A port referencing a node at or after its consumer, or from a
    /// foreign packet.
    #[error("input port does not reference an earlier node (packet {address:#x})")]
    ForwardReference {
        /// Address of the offending packet.
        address: u64,
    },
}

//! Typed intermediate representation for the Arancini binary translator.
//!
//! Guest instructions are lifted into *packets* of IR nodes; packets are
//! grouped into single-entry *blocks*, and blocks into *chunks*, the unit
//! produced by one decode request. Nodes live in a per-packet arena and
//! refer to each other through typed [`Port`]s, so the value graph is
//! acyclic and forward-only by construction.

#![warn(missing_docs)]

mod builder;
mod chunk;
mod dot;
mod error;
mod node;
mod packet;
mod resolver;
mod value_type;
mod visitor;

pub use builder::ChunkBuilder;
pub use chunk::{Block, Chunk};
pub use dot::DotGenerator;
pub use error::IrError;
pub use node::{BinaryOp, BranchKind, Node, NodeIdx, NodeKind, Port, ShiftOp};
pub use packet::{Packet, PacketType};
pub use resolver::{FunctionType, InternalFunction, InternalFunctionProvider, InternalFunctionRegistry};
pub use value_type::{ValueClass, ValueType};
pub use visitor::{RegisterUseVisitor, Visitor};

//! IR nodes and the ports connecting them.

use core::fmt;
use std::sync::Arc;

use crate::resolver::InternalFunction;
use crate::value_type::ValueType;

/// Index of a node inside its packet's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIdx(pub(crate) u32);

impl NodeIdx {
    /// Arena position.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Index for traversal code walking a packet's arena. Out-of-range
    /// indices panic on use.
    pub const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

/// Typed output socket of a node.
///
/// A port is the only way one node refers to another: the builder hands a
/// port back for every value node it creates, and later constructors take
/// ports as inputs. Edges therefore always point backwards in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port {
    node: NodeIdx,
    ty: ValueType,
}

impl Port {
    pub(crate) const fn new(node: NodeIdx, ty: ValueType) -> Self {
        Self { node, ty }
    }

    /// The producing node.
    pub const fn node(&self) -> NodeIdx {
        self.node
    }

    /// Type of the carried value.
    pub const fn ty(&self) -> ValueType {
        self.ty
    }
}

/// Two-operand arithmetic and compare operations.
///
/// Compares return a width-1 unsigned integer; every other operation
/// returns the (identical) type of its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BinaryOp {
    /// Wrapping addition.
    Add,
    /// Wrapping subtraction.
    Sub,
    /// Wrapping multiplication.
    Mul,
    /// Unsigned division.
    Div,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Equality compare.
    CmpEq,
    /// Inequality compare.
    CmpNe,
    /// Unsigned less-than compare.
    CmpUlt,
    /// Signed less-than compare.
    CmpSlt,
}

impl BinaryOp {
    /// `true` for the compare operations, which narrow to width 1.
    pub const fn is_compare(&self) -> bool {
        matches!(self, Self::CmpEq | Self::CmpNe | Self::CmpUlt | Self::CmpSlt)
    }
}

/// Shift operations; the amount is taken modulo the operand width by the
/// lifter, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ShiftOp {
    /// Arithmetic shift right.
    Asr,
    /// Logical shift right.
    Lsr,
    /// Logical shift left.
    Lsl,
}

/// Flavour of a block-terminating branch action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchKind {
    /// Plain jump, conditional or not; the target was stored with `write_pc`.
    Jump,
    /// Guest call; a return address was pushed before the branch.
    Call,
}

/// What a node does. Value kinds are pure; action kinds touch CPU state,
/// memory or control flow and are ordered within their packet.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Packet entry marker.
    Start,
    /// Packet exit marker.
    End,
    /// Immediate value; the node's type gives its width.
    Constant {
        /// Immediate bits, zero-extended to 64.
        value: u64,
    },
    /// Load from a CPU-state slot at a byte offset.
    ReadReg {
        /// Byte offset into the guest CPU state.
        offset: u32,
    },
    /// Load from guest memory.
    ReadMem {
        /// Guest virtual address, u64.
        addr: Port,
    },
    /// Two-operand arithmetic.
    BinaryArith {
        /// Operation.
        op: BinaryOp,
        /// Left operand.
        lhs: Port,
        /// Right operand; same type as `lhs`.
        rhs: Port,
    },
    /// Shift by a dynamic amount.
    Shift {
        /// Operation.
        op: ShiftOp,
        /// Value shifted.
        value: Port,
        /// Shift amount.
        amount: Port,
    },
    /// Extract `width` bits starting at `lo`.
    BitExtract {
        /// Source value.
        value: Port,
        /// Lowest extracted bit.
        lo: u16,
        /// Number of bits; `lo + width` must not exceed the source width.
        width: u16,
    },
    /// Bitwise complement.
    Not {
        /// Operand.
        value: Port,
    },
    /// Widen with zero bits; the node's type is the target.
    ZeroExtend {
        /// Operand.
        value: Port,
    },
    /// Widen by sign replication; the node's type is the target.
    SignExtend {
        /// Operand.
        value: Port,
    },
    /// Reinterpret bits as another equal-width type.
    Bitcast {
        /// Operand.
        value: Port,
    },
    /// Choose between two equally-typed values on a width-1 condition.
    Select {
        /// Condition, u1.
        cond: Port,
        /// Value when the condition is 1.
        on_true: Port,
        /// Value when the condition is 0.
        on_false: Port,
    },
    /// Store to a CPU-state slot.
    WriteReg {
        /// Byte offset into the guest CPU state.
        offset: u32,
        /// Stored value; its width selects the store size.
        value: Port,
    },
    /// Store to guest memory.
    WriteMem {
        /// Guest virtual address, u64.
        addr: Port,
        /// Stored value.
        value: Port,
    },
    /// Set the next guest program counter.
    WritePc {
        /// New PC, u64.
        value: Port,
    },
    /// Call a named host helper.
    InternalCall {
        /// Resolved callee.
        func: Arc<InternalFunction>,
        /// Arguments matching the callee's signature.
        args: Vec<Port>,
    },
    /// Terminate the block through the previously written PC.
    Br {
        /// Jump or call flavour; determines the packet type.
        kind: BranchKind,
    },
    /// Terminate the block as a guest return.
    Ret,
}

/// A node in a packet arena: its kind plus the type of its output port.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    kind: NodeKind,
    ty: ValueType,
}

impl Node {
    pub(crate) const fn new(kind: NodeKind, ty: ValueType) -> Self {
        Self { kind, ty }
    }

    /// The node's operation.
    pub const fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Output port type; void for actions and the start/end markers.
    pub const fn ty(&self) -> ValueType {
        self.ty
    }

    /// `true` for nodes with side effects on CPU state, memory or control
    /// flow; these stay in program order.
    pub const fn is_action(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::WriteReg { .. }
                | NodeKind::WriteMem { .. }
                | NodeKind::WritePc { .. }
                | NodeKind::InternalCall { .. }
                | NodeKind::Br { .. }
                | NodeKind::Ret
        )
    }

    /// Input ports, in operand order.
    pub fn inputs(&self) -> Vec<Port> {
        match &self.kind {
            NodeKind::Start
            | NodeKind::End
            | NodeKind::Constant { .. }
            | NodeKind::ReadReg { .. }
            | NodeKind::Br { .. }
            | NodeKind::Ret => Vec::new(),
            NodeKind::ReadMem { addr } => vec![*addr],
            NodeKind::BinaryArith { lhs, rhs, .. } => vec![*lhs, *rhs],
            NodeKind::Shift { value, amount, .. } => vec![*value, *amount],
            NodeKind::BitExtract { value, .. }
            | NodeKind::Not { value }
            | NodeKind::ZeroExtend { value }
            | NodeKind::SignExtend { value }
            | NodeKind::Bitcast { value }
            | NodeKind::WritePc { value } => vec![*value],
            NodeKind::Select { cond, on_true, on_false } => vec![*cond, *on_true, *on_false],
            NodeKind::WriteReg { value, .. } => vec![*value],
            NodeKind::WriteMem { addr, value } => vec![*addr, *value],
            NodeKind::InternalCall { args, .. } => args.clone(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NodeKind::Start => write!(f, "start"),
            NodeKind::End => write!(f, "end"),
            NodeKind::Constant { value } => write!(f, "const {:#x} : {}", value, self.ty),
            NodeKind::ReadReg { offset } => write!(f, "read_reg @{} : {}", offset, self.ty),
            NodeKind::ReadMem { .. } => write!(f, "read_mem : {}", self.ty),
            NodeKind::BinaryArith { op, .. } => write!(f, "{} : {}", op, self.ty),
            NodeKind::Shift { op, .. } => write!(f, "{} : {}", op, self.ty),
            NodeKind::BitExtract { lo, width, .. } => write!(f, "bit_extract [{}+{}] : {}", lo, width, self.ty),
            NodeKind::Not { .. } => write!(f, "not : {}", self.ty),
            NodeKind::ZeroExtend { .. } => write!(f, "zext : {}", self.ty),
            NodeKind::SignExtend { .. } => write!(f, "sext : {}", self.ty),
            NodeKind::Bitcast { .. } => write!(f, "bitcast : {}", self.ty),
            NodeKind::Select { .. } => write!(f, "select : {}", self.ty),
            NodeKind::WriteReg { offset, .. } => write!(f, "write_reg @{}", offset),
            NodeKind::WriteMem { .. } => write!(f, "write_mem"),
            NodeKind::WritePc { .. } => write!(f, "write_pc"),
            NodeKind::InternalCall { func, .. } => write!(f, "call {}", func.name()),
            NodeKind::Br { kind: BranchKind::Jump } => write!(f, "br"),
            NodeKind::Br { kind: BranchKind::Call } => write!(f, "br.call"),
            NodeKind::Ret => write!(f, "ret"),
        }
    }
}

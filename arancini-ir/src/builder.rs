//! Chunk builder: typed node constructors and the packet/block state
//! machine.

use std::mem;

use crate::chunk::{Block, Chunk};
use crate::error::IrError;
use crate::node::{BinaryOp, BranchKind, Node, NodeKind, Port, ShiftOp};
use crate::packet::{Packet, PacketType};
use crate::resolver::{InternalFunctionProvider, InternalFunctionRegistry};
use crate::value_type::ValueType;

/// Builds one chunk at a time.
///
/// Node creation is append-only within the currently open packet, and
/// every constructor validates type agreement before the node is
/// inserted, so a finished chunk satisfies the port-typing invariant by
/// construction. `end_packet` must be called exactly once per
/// `begin_packet`; nested packets are rejected.
///
/// Blocks are split automatically: a packet whose type terminates a basic
/// block closes the current block, and the next `begin_packet` opens a
/// new one.
#[derive(Debug)]
pub struct ChunkBuilder<'r, P> {
    registry: &'r InternalFunctionRegistry<P>,
    blocks: Vec<Block>,
    current: Vec<Packet>,
    packet: Option<Packet>,
    chunk_open: bool,
}

impl<'r, P> ChunkBuilder<'r, P>
where
    P: InternalFunctionProvider,
{
    /// Construct a builder resolving internal calls through `registry`.
    pub fn new(registry: &'r InternalFunctionRegistry<P>) -> Self {
        Self {
            registry,
            blocks: Vec::new(),
            current: Vec::new(),
            packet: None,
            chunk_open: false,
        }
    }

    /// Open a new chunk.
    pub fn begin_chunk(&mut self) -> Result<(), IrError> {
        if self.chunk_open {
            return Err(IrError::ChunkAlreadyOpen);
        }

        self.blocks.clear();
        self.current.clear();
        self.packet = None;
        self.chunk_open = true;

        Ok(())
    }

    /// Close the chunk and hand it out.
    pub fn end_chunk(&mut self) -> Result<Chunk, IrError> {
        if !self.chunk_open {
            return Err(IrError::ChunkNotOpen);
        }
        if self.packet.is_some() {
            return Err(IrError::ChunkIncomplete);
        }

        if !self.current.is_empty() {
            let packets = mem::take(&mut self.current);
            self.blocks.push(Block::new(packets));
        }

        self.chunk_open = false;
        Ok(Chunk::new(mem::take(&mut self.blocks)))
    }

    /// Open the packet for the guest instruction at `address`. The start
    /// marker is inserted on behalf of the caller.
    pub fn begin_packet(&mut self, address: u64, disasm: Option<String>) -> Result<(), IrError> {
        if !self.chunk_open {
            return Err(IrError::ChunkNotOpen);
        }
        if self.packet.is_some() {
            return Err(IrError::NestedPacket);
        }

        let mut packet = Packet::new(address, disasm);
        packet.push(Node::new(NodeKind::Start, ValueType::void()));
        self.packet = Some(packet);

        Ok(())
    }

    /// Seal the current packet and return its derived type. A terminating
    /// packet also closes the current block.
    pub fn end_packet(&mut self) -> Result<PacketType, IrError> {
        let mut packet = self.packet.take().ok_or(IrError::PacketNotOpen)?;

        packet.push(Node::new(NodeKind::End, ValueType::void()));
        let ty = packet.seal();

        self.current.push(packet);
        if ty.terminates_block() {
            let packets = mem::take(&mut self.current);
            self.blocks.push(Block::new(packets));
        }

        Ok(ty)
    }

    /// Address of the currently open packet, if any.
    pub fn current_address(&self) -> Option<u64> {
        self.packet.as_ref().map(Packet::address)
    }

    // --- value nodes ---

    /// Immediate of an arbitrary integer type.
    pub fn insert_constant(&mut self, ty: ValueType, value: u64) -> Result<Port, IrError> {
        if !ty.is_integer() {
            return Err(IrError::NotAnInteger(ty));
        }

        self.push(NodeKind::Constant { value }, ty)
    }

    /// Single-bit immediate.
    pub fn insert_constant_u1(&mut self, value: bool) -> Result<Port, IrError> {
        self.insert_constant(ValueType::u1(), value as u64)
    }

    /// 8-bit immediate.
    pub fn insert_constant_u8(&mut self, value: u8) -> Result<Port, IrError> {
        self.insert_constant(ValueType::u8(), value as u64)
    }

    /// 16-bit immediate.
    pub fn insert_constant_u16(&mut self, value: u16) -> Result<Port, IrError> {
        self.insert_constant(ValueType::u16(), value as u64)
    }

    /// 32-bit immediate.
    pub fn insert_constant_u32(&mut self, value: u32) -> Result<Port, IrError> {
        self.insert_constant(ValueType::u32(), value as u64)
    }

    /// 64-bit immediate.
    pub fn insert_constant_u64(&mut self, value: u64) -> Result<Port, IrError> {
        self.insert_constant(ValueType::u64(), value)
    }

    /// Typed load from a CPU-state slot.
    pub fn insert_read_reg(&mut self, ty: ValueType, offset: u32) -> Result<Port, IrError> {
        self.push(NodeKind::ReadReg { offset }, ty)
    }

    /// Typed load from guest memory at a u64 address.
    pub fn insert_read_mem(&mut self, ty: ValueType, addr: Port) -> Result<Port, IrError> {
        self.expect(addr, ValueType::u64())?;
        self.push(NodeKind::ReadMem { addr }, ty)
    }

    /// Two-operand arithmetic; compares narrow to u1.
    pub fn insert_binary_arith(&mut self, op: BinaryOp, lhs: Port, rhs: Port) -> Result<Port, IrError> {
        self.check_port(lhs)?;
        self.check_port(rhs)?;

        if lhs.ty().is_void() {
            return Err(IrError::NotAnInteger(lhs.ty()));
        }
        if rhs.ty() != lhs.ty() {
            return Err(IrError::TypeMismatch {
                expected: lhs.ty(),
                found: rhs.ty(),
            });
        }

        let ty = if op.is_compare() { ValueType::u1() } else { lhs.ty() };
        self.push(NodeKind::BinaryArith { op, lhs, rhs }, ty)
    }

    /// Wrapping addition.
    pub fn insert_add(&mut self, lhs: Port, rhs: Port) -> Result<Port, IrError> {
        self.insert_binary_arith(BinaryOp::Add, lhs, rhs)
    }

    /// Wrapping subtraction.
    pub fn insert_sub(&mut self, lhs: Port, rhs: Port) -> Result<Port, IrError> {
        self.insert_binary_arith(BinaryOp::Sub, lhs, rhs)
    }

    /// Wrapping multiplication.
    pub fn insert_mul(&mut self, lhs: Port, rhs: Port) -> Result<Port, IrError> {
        self.insert_binary_arith(BinaryOp::Mul, lhs, rhs)
    }

    /// Unsigned division.
    pub fn insert_div(&mut self, lhs: Port, rhs: Port) -> Result<Port, IrError> {
        self.insert_binary_arith(BinaryOp::Div, lhs, rhs)
    }

    /// Bitwise and.
    pub fn insert_and(&mut self, lhs: Port, rhs: Port) -> Result<Port, IrError> {
        self.insert_binary_arith(BinaryOp::And, lhs, rhs)
    }

    /// Bitwise or.
    pub fn insert_or(&mut self, lhs: Port, rhs: Port) -> Result<Port, IrError> {
        self.insert_binary_arith(BinaryOp::Or, lhs, rhs)
    }

    /// Bitwise xor.
    pub fn insert_xor(&mut self, lhs: Port, rhs: Port) -> Result<Port, IrError> {
        self.insert_binary_arith(BinaryOp::Xor, lhs, rhs)
    }

    /// Equality compare, u1 result.
    pub fn insert_cmp_eq(&mut self, lhs: Port, rhs: Port) -> Result<Port, IrError> {
        self.insert_binary_arith(BinaryOp::CmpEq, lhs, rhs)
    }

    /// Inequality compare, u1 result.
    pub fn insert_cmp_ne(&mut self, lhs: Port, rhs: Port) -> Result<Port, IrError> {
        self.insert_binary_arith(BinaryOp::CmpNe, lhs, rhs)
    }

    /// Unsigned less-than compare, u1 result.
    pub fn insert_cmp_ult(&mut self, lhs: Port, rhs: Port) -> Result<Port, IrError> {
        self.insert_binary_arith(BinaryOp::CmpUlt, lhs, rhs)
    }

    /// Signed less-than compare, u1 result.
    pub fn insert_cmp_slt(&mut self, lhs: Port, rhs: Port) -> Result<Port, IrError> {
        self.insert_binary_arith(BinaryOp::CmpSlt, lhs, rhs)
    }

    /// Shift by a dynamic amount; the result keeps the value's type.
    pub fn insert_shift(&mut self, op: ShiftOp, value: Port, amount: Port) -> Result<Port, IrError> {
        self.check_port(value)?;
        self.check_port(amount)?;

        if !value.ty().is_integer() {
            return Err(IrError::NotAnInteger(value.ty()));
        }
        if !amount.ty().is_integer() {
            return Err(IrError::NotAnInteger(amount.ty()));
        }

        self.push(NodeKind::Shift { op, value, amount }, value.ty())
    }

    /// Arithmetic shift right.
    pub fn insert_asr(&mut self, value: Port, amount: Port) -> Result<Port, IrError> {
        self.insert_shift(ShiftOp::Asr, value, amount)
    }

    /// Logical shift right.
    pub fn insert_lsr(&mut self, value: Port, amount: Port) -> Result<Port, IrError> {
        self.insert_shift(ShiftOp::Lsr, value, amount)
    }

    /// Logical shift left.
    pub fn insert_lsl(&mut self, value: Port, amount: Port) -> Result<Port, IrError> {
        self.insert_shift(ShiftOp::Lsl, value, amount)
    }

    /// Extract `width` bits at `lo`; the result is unsigned of `width`.
    pub fn insert_bit_extract(&mut self, value: Port, lo: u16, width: u16) -> Result<Port, IrError> {
        self.check_port(value)?;

        if (lo as u32 + width as u32) > value.ty().total_width() {
            return Err(IrError::BitExtractRange {
                lo,
                width,
                of: value.ty().total_width(),
            });
        }

        self.push(NodeKind::BitExtract { value, lo, width }, ValueType::unsigned(width))
    }

    /// Bitwise complement.
    pub fn insert_not(&mut self, value: Port) -> Result<Port, IrError> {
        self.check_port(value)?;

        if value.ty().is_void() {
            return Err(IrError::NotAnInteger(value.ty()));
        }

        self.push(NodeKind::Not { value }, value.ty())
    }

    /// Zero-extend to a wider type.
    pub fn insert_zero_extend(&mut self, ty: ValueType, value: Port) -> Result<Port, IrError> {
        self.check_extension(ty, value)?;
        self.push(NodeKind::ZeroExtend { value }, ty)
    }

    /// Sign-extend to a wider type.
    pub fn insert_sign_extend(&mut self, ty: ValueType, value: Port) -> Result<Port, IrError> {
        self.check_extension(ty, value)?;
        self.push(NodeKind::SignExtend { value }, ty)
    }

    /// Reinterpret bits as an equal-width type.
    pub fn insert_bitcast(&mut self, ty: ValueType, value: Port) -> Result<Port, IrError> {
        self.check_port(value)?;

        if ty.total_width() != value.ty().total_width() {
            return Err(IrError::WidthChangingBitcast {
                from: value.ty(),
                to: ty,
            });
        }

        self.push(NodeKind::Bitcast { value }, ty)
    }

    /// Choose between two equally-typed values on a u1 condition.
    pub fn insert_select(&mut self, cond: Port, on_true: Port, on_false: Port) -> Result<Port, IrError> {
        self.check_port(cond)?;
        self.check_port(on_true)?;
        self.check_port(on_false)?;

        if cond.ty() != ValueType::u1() {
            return Err(IrError::NotACondition(cond.ty()));
        }
        if on_true.ty() != on_false.ty() {
            return Err(IrError::TypeMismatch {
                expected: on_true.ty(),
                found: on_false.ty(),
            });
        }

        self.push(NodeKind::Select { cond, on_true, on_false }, on_true.ty())
    }

    // --- action nodes ---

    /// Store a value to a CPU-state slot; the value's width selects the
    /// store size.
    pub fn insert_write_reg(&mut self, offset: u32, value: Port) -> Result<Port, IrError> {
        self.check_port(value)?;
        self.push(NodeKind::WriteReg { offset, value }, ValueType::void())
    }

    /// Store a value to guest memory at a u64 address.
    pub fn insert_write_mem(&mut self, addr: Port, value: Port) -> Result<Port, IrError> {
        self.expect(addr, ValueType::u64())?;
        self.check_port(value)?;
        self.push(NodeKind::WriteMem { addr, value }, ValueType::void())
    }

    /// Set the next guest program counter.
    pub fn insert_write_pc(&mut self, value: Port) -> Result<Port, IrError> {
        self.expect(value, ValueType::u64())?;
        self.push(NodeKind::WritePc { value }, ValueType::void())
    }

    /// Call a named host helper; arguments are checked against the
    /// resolved signature.
    pub fn insert_internal_call(&mut self, name: &str, args: &[Port]) -> Result<Port, IrError> {
        let func = self.registry.resolve(name)?;

        if func.ty().args().len() != args.len() {
            return Err(IrError::ArityMismatch {
                name: name.to_owned(),
                expected: func.ty().args().len(),
                found: args.len(),
            });
        }

        for (port, &want) in args.iter().zip(func.ty().args()) {
            // The poison helper takes any value.
            if want.is_void() {
                self.check_port(*port)?;
            } else {
                self.expect(*port, want)?;
            }
        }

        self.push(
            NodeKind::InternalCall {
                func,
                args: args.to_vec(),
            },
            ValueType::void(),
        )
    }

    /// Terminate the block through the previously written PC.
    pub fn insert_br(&mut self, kind: BranchKind) -> Result<Port, IrError> {
        self.push(NodeKind::Br { kind }, ValueType::void())
    }

    /// Terminate the block as a guest return.
    pub fn insert_ret(&mut self) -> Result<Port, IrError> {
        self.push(NodeKind::Ret, ValueType::void())
    }

    // --- internals ---

    fn push(&mut self, kind: NodeKind, ty: ValueType) -> Result<Port, IrError> {
        let packet = self.packet.as_mut().ok_or(IrError::PacketNotOpen)?;
        let idx = packet.push(Node::new(kind, ty));

        Ok(Port::new(idx, ty))
    }

    /// Guard against ports smuggled in from another packet: the index
    /// must exist here and the producing node's type must match.
    fn check_port(&self, port: Port) -> Result<(), IrError> {
        let packet = self.packet.as_ref().ok_or(IrError::PacketNotOpen)?;

        if port.node().index() >= packet.len() {
            return Err(IrError::ForwardReference {
                address: packet.address(),
            });
        }

        let src = packet.node(port.node());
        if src.ty() != port.ty() {
            return Err(IrError::TypeMismatch {
                expected: port.ty(),
                found: src.ty(),
            });
        }

        Ok(())
    }

    fn expect(&self, port: Port, want: ValueType) -> Result<(), IrError> {
        self.check_port(port)?;

        if port.ty() != want {
            return Err(IrError::TypeMismatch {
                expected: want,
                found: port.ty(),
            });
        }

        Ok(())
    }

    fn check_extension(&self, ty: ValueType, value: Port) -> Result<(), IrError> {
        self.check_port(value)?;

        if !ty.is_integer() || !value.ty().is_integer() {
            return Err(IrError::NotAnInteger(if ty.is_integer() { value.ty() } else { ty }));
        }
        if ty.width() <= value.ty().width() {
            return Err(IrError::NotWidening {
                from: value.ty(),
                to: ty,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{FunctionType, InternalFunction};

    struct Helpers;

    impl InternalFunctionProvider for Helpers {
        fn create(&self, name: &str) -> Option<InternalFunction> {
            match name {
                "hlt" => Some(InternalFunction::new("hlt", FunctionType::new(ValueType::void(), vec![]))),
                "handle_int" => Some(InternalFunction::new(
                    "handle_int",
                    FunctionType::new(ValueType::void(), vec![ValueType::u32()]),
                )),
                _ => None,
            }
        }
    }

    fn registry() -> InternalFunctionRegistry<Helpers> {
        InternalFunctionRegistry::new(Helpers)
    }

    #[test]
    fn empty_packet_is_normal() {
        let registry = registry();
        let mut b = ChunkBuilder::new(&registry);

        b.begin_chunk().unwrap();
        b.begin_packet(0x1000, None).unwrap();
        assert_eq!(b.end_packet().unwrap(), PacketType::Normal);

        let chunk = b.end_chunk().unwrap();
        assert_eq!(chunk.blocks().len(), 1);
        // Just the start and end markers.
        assert_eq!(chunk.blocks()[0].packets()[0].nodes().len(), 2);
    }

    #[test]
    fn nested_packets_are_rejected() {
        let registry = registry();
        let mut b = ChunkBuilder::new(&registry);

        b.begin_chunk().unwrap();
        b.begin_packet(0, None).unwrap();
        assert_eq!(b.begin_packet(4, None).unwrap_err(), IrError::NestedPacket);
    }

    #[test]
    fn end_chunk_with_open_packet_is_rejected() {
        let registry = registry();
        let mut b = ChunkBuilder::new(&registry);

        b.begin_chunk().unwrap();
        b.begin_packet(0, None).unwrap();
        assert_eq!(b.end_chunk().unwrap_err(), IrError::ChunkIncomplete);
    }

    #[test]
    fn arith_requires_matching_types() {
        let registry = registry();
        let mut b = ChunkBuilder::new(&registry);

        b.begin_chunk().unwrap();
        b.begin_packet(0, None).unwrap();

        let a = b.insert_constant_u64(1).unwrap();
        let c = b.insert_constant_u32(2).unwrap();

        assert!(matches!(
            b.insert_add(a, c).unwrap_err(),
            IrError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn compares_narrow_to_u1() {
        let registry = registry();
        let mut b = ChunkBuilder::new(&registry);

        b.begin_chunk().unwrap();
        b.begin_packet(0, None).unwrap();

        let a = b.insert_constant_u64(1).unwrap();
        let c = b.insert_constant_u64(2).unwrap();
        let cmp = b.insert_cmp_ult(a, c).unwrap();

        assert_eq!(cmp.ty(), ValueType::u1());
    }

    #[test]
    fn bit_extract_range_is_checked() {
        let registry = registry();
        let mut b = ChunkBuilder::new(&registry);

        b.begin_chunk().unwrap();
        b.begin_packet(0, None).unwrap();

        let a = b.insert_constant_u32(7).unwrap();
        assert!(b.insert_bit_extract(a, 0, 32).is_ok());
        assert!(matches!(
            b.insert_bit_extract(a, 30, 4).unwrap_err(),
            IrError::BitExtractRange { .. }
        ));
    }

    #[test]
    fn terminating_packet_splits_blocks() {
        let registry = registry();
        let mut b = ChunkBuilder::new(&registry);

        b.begin_chunk().unwrap();

        b.begin_packet(0, None).unwrap();
        let target = b.insert_constant_u64(8).unwrap();
        b.insert_write_pc(target).unwrap();
        b.insert_br(BranchKind::Jump).unwrap();
        assert_eq!(b.end_packet().unwrap(), PacketType::Branch);

        b.begin_packet(8, None).unwrap();
        b.insert_ret().unwrap();
        assert_eq!(b.end_packet().unwrap(), PacketType::Return);

        let chunk = b.end_chunk().unwrap();
        assert_eq!(chunk.blocks().len(), 2);
        assert_eq!(chunk.blocks()[0].address(), 0);
        assert_eq!(chunk.blocks()[1].address(), 8);
        chunk.validate().unwrap();
    }

    #[test]
    fn interrupt_call_types_packet() {
        let registry = registry();
        let mut b = ChunkBuilder::new(&registry);

        b.begin_chunk().unwrap();
        b.begin_packet(0, None).unwrap();

        let imm = b.insert_constant_u32(3).unwrap();
        b.insert_internal_call("handle_int", &[imm]).unwrap();

        assert_eq!(b.end_packet().unwrap(), PacketType::Interrupt);
    }

    #[test]
    fn unresolved_internal_call_fails() {
        let registry = registry();
        let mut b = ChunkBuilder::new(&registry);

        b.begin_chunk().unwrap();
        b.begin_packet(0, None).unwrap();

        assert_eq!(
            b.insert_internal_call("nope", &[]).unwrap_err(),
            IrError::UnresolvedFunction("nope".into())
        );
    }
}

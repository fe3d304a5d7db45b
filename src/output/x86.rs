//! x86-64 host backend: templated direct byte emission.
//!
//! Register convention for every translation:
//!
//! * `r12` — pointer to the guest CPU state (first host argument)
//! * `r13` — guest memory base (second host argument)
//! * `rax, rcx, rdx, rsi, rdi, r8..r11` — value scratch pool
//!
//! All translations share one frame layout (six callee-saved pushes plus
//! a 120-byte spill area), so a chained jump into another translation's
//! body is sound: the successor's epilogue unwinds the predecessor's
//! frame. Values in scratch registers are kept zero-extended to 64 bits.

use std::collections::HashMap;
use std::sync::Arc;

use arancini_ir::{BinaryOp, NodeIdx, NodeKind, Packet, Port, ShiftOp, ValueType};

use crate::dbt::helpers::HelperTable;
use crate::error::BackendError;
use crate::output::writer::{ChainWriter, CodeWriter, ExecBuffer};
use crate::output::{schedule, BlockExit, ChainKind, ChainSite, Encoder, HostArch};

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10;
const R11: u8 = 11;
const R12: u8 = 12;
const R13: u8 = 13;
const R14: u8 = 14;
const R15: u8 = 15;

/// Scratch pool, allocated from the end.
const GPR_POOL: [u8; 9] = [RAX, RDX, RCX, RDI, RSI, R11, R10, R9, R8];

/// Spill area: 15 qword slots; together with the six pushes this keeps
/// rsp 16-byte aligned at helper call sites.
const FRAME_SIZE: u32 = 120;
const SPILL_SLOTS: u8 = 15;

/// Patchable outgoing edges per translation.
const MAX_CHAIN_SITES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    Gpr(u8),
    Xmm(u8),
    Spill(u8),
}

#[derive(Debug)]
struct ValueState {
    loc: Loc,
    uses_left: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Return to the dispatcher with status 0.
    Dispatcher,
    /// Like dispatcher, but through a patchable chain slot.
    Chain,
    /// The status comes back from a helper call in eax.
    Status,
}

/// The x86-64 encoder.
#[derive(Debug)]
pub struct X86Encoder {
    helpers: Arc<HelperTable>,
    values: HashMap<usize, ValueState>,
    uses: Vec<u32>,
    free_gprs: Vec<u8>,
    free_xmms: Vec<u8>,
    free_slots: Vec<u8>,
    locked: Vec<u8>,
    exit: Exit,
    chain_target: Option<u64>,
}

impl X86Encoder {
    /// Construct an encoder resolving helper calls through `helpers`.
    pub fn new(helpers: Arc<HelperTable>) -> Self {
        Self {
            helpers,
            values: HashMap::new(),
            uses: Vec::new(),
            free_gprs: Vec::new(),
            free_xmms: Vec::new(),
            free_slots: Vec::new(),
            locked: Vec::new(),
            exit: Exit::Dispatcher,
            chain_target: None,
        }
    }

    fn unsupported<T>(&self, what: impl Into<String>) -> Result<T, BackendError> {
        Err(BackendError::UnsupportedNode {
            backend: "x86",
            node: what.into(),
        })
    }

    // --- value allocation ---

    fn alloc_gpr(&mut self, w: &mut CodeWriter) -> Result<u8, BackendError> {
        if let Some(reg) = self.free_gprs.pop() {
            return Ok(reg);
        }

        // Spill some live, unlocked value to its stack slot.
        let victim = self
            .values
            .iter()
            .find_map(|(&idx, st)| match st.loc {
                Loc::Gpr(r) if !self.locked.contains(&r) => Some((idx, r)),
                _ => None,
            });

        let Some((idx, reg)) = victim else {
            return self.unsupported("register pressure exceeds the scratch pool");
        };
        let Some(slot) = self.free_slots.pop() else {
            return self.unsupported("spill pressure exceeds the frame");
        };

        emit::store_spill(w, reg, slot)?;
        if let Some(st) = self.values.get_mut(&idx) {
            st.loc = Loc::Spill(slot);
        }
        Ok(reg)
    }

    fn alloc_xmm(&mut self) -> Result<u8, BackendError> {
        match self.free_xmms.pop() {
            Some(reg) => Ok(reg),
            None => self.unsupported("vector register pressure"),
        }
    }

    /// Reserve a specific register, relocating whatever value holds it.
    fn take_gpr(&mut self, reg: u8, w: &mut CodeWriter) -> Result<(), BackendError> {
        if let Some(pos) = self.free_gprs.iter().position(|&r| r == reg) {
            self.free_gprs.swap_remove(pos);
            self.locked.push(reg);
            return Ok(());
        }

        if self.locked.contains(&reg) {
            return self.unsupported("fixed register conflict");
        }

        let owner = self.values.iter().find_map(|(&idx, st)| match st.loc {
            Loc::Gpr(r) if r == reg => Some(idx),
            _ => None,
        });

        if let Some(idx) = owner {
            self.locked.push(reg);
            let new = self.alloc_gpr(w)?;
            emit::mov_rr(w, new, reg)?;
            if let Some(st) = self.values.get_mut(&idx) {
                st.loc = Loc::Gpr(new);
            }
            return Ok(());
        }

        // Not free, not owned: it was never in the pool.
        self.unsupported("fixed register outside the scratch pool")
    }

    /// Bring an input value into a general register and lock it for the
    /// duration of the current node.
    fn input_gpr(&mut self, port: Port, w: &mut CodeWriter) -> Result<u8, BackendError> {
        let idx = port.node().index();
        let loc = self
            .values
            .get(&idx)
            .map(|st| st.loc)
            .expect("input value lowered before use");

        let reg = match loc {
            Loc::Gpr(reg) => reg,
            Loc::Spill(slot) => {
                let reg = self.alloc_gpr(w)?;
                emit::load_spill(w, reg, slot)?;
                self.free_slots.push(slot);
                if let Some(st) = self.values.get_mut(&idx) {
                    st.loc = Loc::Gpr(reg);
                }
                reg
            }
            Loc::Xmm(_) => return self.unsupported("vector value in a scalar context"),
        };

        self.locked.push(reg);
        Ok(reg)
    }

    fn input_xmm(&mut self, port: Port) -> Result<u8, BackendError> {
        let idx = port.node().index();
        match self.values.get(&idx).map(|st| st.loc) {
            Some(Loc::Xmm(reg)) => Ok(reg),
            Some(_) => self.unsupported("scalar value in a vector context"),
            None => panic!("input value lowered before use"),
        }
    }

    /// Consume input uses, freeing dead values.
    fn retire(&mut self, inputs: &[Port]) {
        for port in inputs {
            let idx = port.node().index();
            let dead = match self.values.get_mut(&idx) {
                Some(st) => {
                    st.uses_left = st.uses_left.saturating_sub(1);
                    st.uses_left == 0
                }
                None => false,
            };

            if dead {
                if let Some(st) = self.values.remove(&idx) {
                    match st.loc {
                        Loc::Gpr(r) => self.free_gprs.push(r),
                        Loc::Xmm(r) => self.free_xmms.push(r),
                        Loc::Spill(s) => self.free_slots.push(s),
                    }
                }
            }
        }
    }

    /// Record the result location of a value node.
    fn produce(&mut self, idx: NodeIdx, loc: Loc) {
        let uses_left = self.uses[idx.index()];
        self.values.insert(idx.index(), ValueState { loc, uses_left });
    }

    /// Re-establish the zero-extension invariant after an operation that
    /// may have dirtied bits above `width`.
    fn canonicalize(&self, w: &mut CodeWriter, reg: u8, width: u16) -> Result<(), BackendError> {
        match width {
            64 => Ok(()),
            w32 if w32 <= 32 => emit::and_r32_imm(w, reg, width_mask(w32) as u32),
            other => self.unsupported(format!("integer width {other}")),
        }
    }

    // --- node lowering ---

    fn lower_constant(&mut self, idx: NodeIdx, ty: ValueType, value: u64, w: &mut CodeWriter) -> Result<(), BackendError> {
        if ty.is_vector() {
            return self.unsupported("vector constant");
        }

        let dst = self.alloc_gpr(w)?;
        emit::mov_ri(w, dst, value & width_mask(ty.width()))?;
        self.produce(idx, Loc::Gpr(dst));
        Ok(())
    }

    fn lower_read_reg(&mut self, idx: NodeIdx, ty: ValueType, offset: u32, w: &mut CodeWriter) -> Result<(), BackendError> {
        if ty.total_width() == 128 {
            let dst = self.alloc_xmm()?;
            emit::movdqu_load_state(w, dst, offset)?;
            self.produce(idx, Loc::Xmm(dst));
            return Ok(());
        }

        let dst = self.alloc_gpr(w)?;
        emit::load_state(w, scalar_bytes(ty), dst, offset)?;
        self.produce(idx, Loc::Gpr(dst));
        Ok(())
    }

    fn lower_read_mem(&mut self, idx: NodeIdx, ty: ValueType, addr: Port, w: &mut CodeWriter) -> Result<(), BackendError> {
        let a = self.input_gpr(addr, w)?;

        if ty.total_width() == 128 {
            let dst = self.alloc_xmm()?;
            emit::movdqu_load_mem(w, dst, a)?;
            self.retire(&[addr]);
            self.produce(idx, Loc::Xmm(dst));
            return Ok(());
        }

        let dst = self.alloc_gpr(w)?;
        emit::load_mem(w, scalar_bytes(ty), dst, a)?;
        self.retire(&[addr]);
        self.produce(idx, Loc::Gpr(dst));
        Ok(())
    }

    fn lower_binary(
        &mut self,
        idx: NodeIdx,
        ty: ValueType,
        op: BinaryOp,
        lhs: Port,
        rhs: Port,
        w: &mut CodeWriter,
    ) -> Result<(), BackendError> {
        if ty.is_vector() || lhs.ty().is_vector() {
            return self.lower_binary_vector(idx, op, lhs, rhs, w);
        }

        let width = lhs.ty().width();

        if op == BinaryOp::Div {
            return self.lower_div(idx, lhs, rhs, w);
        }

        if op.is_compare() {
            let l = self.input_gpr(lhs, w)?;
            let r = self.input_gpr(rhs, w)?;
            let dst = self.alloc_gpr(w)?;

            let cc = match op {
                BinaryOp::CmpEq => emit::CC_E,
                BinaryOp::CmpNe => emit::CC_NE,
                BinaryOp::CmpUlt => emit::CC_B,
                BinaryOp::CmpSlt => emit::CC_L,
                _ => unreachable!(),
            };

            if op == BinaryOp::CmpSlt && width < 64 {
                // Signed compare needs the sign bits back.
                let sl = self.alloc_gpr(w)?;
                let sr = self.alloc_gpr(w)?;
                emit::movsx(w, sl, l, width)?;
                emit::movsx(w, sr, r, width)?;
                emit::cmp_rr(w, sl, sr)?;
                self.free_gprs.push(sl);
                self.free_gprs.push(sr);
            } else {
                emit::cmp_rr(w, l, r)?;
            }

            emit::setcc(w, cc, dst)?;
            emit::movzx8_rr(w, dst, dst)?;

            self.retire(&[lhs, rhs]);
            self.produce(idx, Loc::Gpr(dst));
            return Ok(());
        }

        let l = self.input_gpr(lhs, w)?;
        let r = self.input_gpr(rhs, w)?;
        let dst = self.alloc_gpr(w)?;
        emit::mov_rr(w, dst, l)?;

        let dirties = match op {
            BinaryOp::Add => {
                emit::alu_rr(w, emit::ALU_ADD, dst, r)?;
                true
            }
            BinaryOp::Sub => {
                emit::alu_rr(w, emit::ALU_SUB, dst, r)?;
                true
            }
            BinaryOp::Mul => {
                emit::imul_rr(w, dst, r)?;
                true
            }
            BinaryOp::And => {
                emit::alu_rr(w, emit::ALU_AND, dst, r)?;
                false
            }
            BinaryOp::Or => {
                emit::alu_rr(w, emit::ALU_OR, dst, r)?;
                false
            }
            BinaryOp::Xor => {
                emit::alu_rr(w, emit::ALU_XOR, dst, r)?;
                false
            }
            _ => unreachable!(),
        };

        if dirties && width < 64 {
            self.canonicalize(w, dst, width)?;
        }

        self.retire(&[lhs, rhs]);
        self.produce(idx, Loc::Gpr(dst));
        Ok(())
    }

    fn lower_div(&mut self, idx: NodeIdx, lhs: Port, rhs: Port, w: &mut CodeWriter) -> Result<(), BackendError> {
        // Unsigned division wants rdx:rax.
        self.take_gpr(RAX, w)?;
        self.take_gpr(RDX, w)?;

        let l = self.input_gpr(lhs, w)?;
        let r = self.input_gpr(rhs, w)?;

        emit::mov_rr(w, RAX, l)?;
        emit::xor_r32_r32(w, RDX, RDX)?;
        emit::div_r(w, r)?;

        self.retire(&[lhs, rhs]);
        self.free_gprs.push(RDX);
        self.produce(idx, Loc::Gpr(RAX));
        Ok(())
    }

    fn lower_binary_vector(
        &mut self,
        idx: NodeIdx,
        op: BinaryOp,
        lhs: Port,
        rhs: Port,
        w: &mut CodeWriter,
    ) -> Result<(), BackendError> {
        let l = self.input_xmm(lhs)?;
        let r = self.input_xmm(rhs)?;
        let dst = self.alloc_xmm()?;
        emit::movdqa_rr(w, dst, l)?;

        match op {
            BinaryOp::Add if lhs.ty().width() == 32 => emit::paddd(w, dst, r)?,
            BinaryOp::Xor => emit::pxor(w, dst, r)?,
            other => return self.unsupported(format!("vector {other}")),
        }

        self.retire(&[lhs, rhs]);
        self.produce(idx, Loc::Xmm(dst));
        Ok(())
    }

    fn lower_shift(
        &mut self,
        idx: NodeIdx,
        packet: &Packet,
        op: ShiftOp,
        value: Port,
        amount: Port,
        w: &mut CodeWriter,
    ) -> Result<(), BackendError> {
        if value.ty().is_vector() {
            return self.unsupported("vector shift");
        }

        let width = value.ty().width();
        let constant_amount = match packet.node(amount.node()).kind() {
            NodeKind::Constant { value } => Some((*value & 0x3f) as u8),
            _ => None,
        };

        // Dynamic amounts go through cl.
        if constant_amount.is_none() {
            self.take_gpr(RCX, w)?;
        }

        let v = self.input_gpr(value, w)?;
        let dst = self.alloc_gpr(w)?;

        if op == ShiftOp::Asr && width < 64 {
            emit::movsx(w, dst, v, width)?;
        } else {
            emit::mov_rr(w, dst, v)?;
        }

        match constant_amount {
            Some(imm) => {
                emit::shift_imm(w, op, dst, imm)?;
                self.retire(&[value]);
            }
            None => {
                let a = self.input_gpr(amount, w)?;
                if a != RCX {
                    emit::mov_rr(w, RCX, a)?;
                }
                emit::shift_cl(w, op, dst)?;
                self.retire(&[value, amount]);
                self.free_gprs.push(RCX);
            }
        }

        if width < 64 && matches!(op, ShiftOp::Lsl | ShiftOp::Asr) {
            self.canonicalize(w, dst, width)?;
        }

        self.produce(idx, Loc::Gpr(dst));
        Ok(())
    }

    fn lower_bit_extract(
        &mut self,
        idx: NodeIdx,
        value: Port,
        lo: u16,
        width: u16,
        w: &mut CodeWriter,
    ) -> Result<(), BackendError> {
        if value.ty().is_vector() {
            return self.unsupported("vector bit extract");
        }

        let v = self.input_gpr(value, w)?;
        let dst = self.alloc_gpr(w)?;
        emit::mov_rr(w, dst, v)?;

        if lo > 0 {
            emit::shift_imm(w, ShiftOp::Lsr, dst, lo as u8)?;
        }
        if width < 64 {
            self.canonicalize(w, dst, width)?;
        }

        self.retire(&[value]);
        self.produce(idx, Loc::Gpr(dst));
        Ok(())
    }

    fn lower_extend(
        &mut self,
        idx: NodeIdx,
        ty: ValueType,
        value: Port,
        signed: bool,
        w: &mut CodeWriter,
    ) -> Result<(), BackendError> {
        let v = self.input_gpr(value, w)?;
        let dst = self.alloc_gpr(w)?;

        if signed {
            match value.ty().width() {
                sw @ (8 | 16 | 32) => emit::movsx(w, dst, v, sw)?,
                other => return self.unsupported(format!("sign extension from width {other}")),
            }
            if ty.width() < 64 {
                self.canonicalize(w, dst, ty.width())?;
            }
        } else {
            // Values are already kept zero-extended.
            emit::mov_rr(w, dst, v)?;
        }

        self.retire(&[value]);
        self.produce(idx, Loc::Gpr(dst));
        Ok(())
    }

    fn lower_select(
        &mut self,
        idx: NodeIdx,
        cond: Port,
        on_true: Port,
        on_false: Port,
        w: &mut CodeWriter,
    ) -> Result<(), BackendError> {
        if on_true.ty().is_vector() {
            return self.unsupported("vector select");
        }

        let c = self.input_gpr(cond, w)?;
        let t = self.input_gpr(on_true, w)?;
        let f = self.input_gpr(on_false, w)?;
        let dst = self.alloc_gpr(w)?;

        emit::mov_rr(w, dst, f)?;
        emit::test_rr(w, c, c)?;
        emit::cmovcc(w, emit::CC_NE, dst, t)?;

        self.retire(&[cond, on_true, on_false]);
        self.produce(idx, Loc::Gpr(dst));
        Ok(())
    }

    fn lower_write_reg(&mut self, offset: u32, value: Port, w: &mut CodeWriter) -> Result<(), BackendError> {
        if value.ty().total_width() == 128 {
            let v = self.input_xmm(value)?;
            emit::movdqu_store_state(w, v, offset)?;
            self.retire(&[value]);
            return Ok(());
        }

        let v = self.input_gpr(value, w)?;
        emit::store_state(w, scalar_bytes(value.ty()), v, offset)?;
        self.retire(&[value]);
        Ok(())
    }

    fn lower_write_mem(&mut self, addr: Port, value: Port, w: &mut CodeWriter) -> Result<(), BackendError> {
        let a = self.input_gpr(addr, w)?;

        if value.ty().total_width() == 128 {
            let v = self.input_xmm(value)?;
            emit::movdqu_store_mem(w, v, a)?;
        } else {
            let v = self.input_gpr(value, w)?;
            emit::store_mem(w, scalar_bytes(value.ty()), v, a)?;
        }

        self.retire(&[addr, value]);
        Ok(())
    }

    fn lower_internal_call(
        &mut self,
        packet: &Packet,
        func_name: &str,
        args: &[Port],
        w: &mut CodeWriter,
    ) -> Result<(), BackendError> {
        let _ = packet;

        let Some(address) = self.helpers.address(func_name) else {
            return self.unsupported(format!("call {func_name}: no helper registered"));
        };
        if args.len() > 1 {
            return self.unsupported("helper call with more than one argument");
        }

        let arg = match args {
            [] => None,
            [port] => Some(self.input_gpr(*port, w)?),
            _ => unreachable!(),
        };
        self.retire(args);

        // The pool is caller-saved; values may not live across the call.
        if self.values.values().any(|st| st.uses_left > 0 && !matches!(st.loc, Loc::Spill(_))) {
            return self.unsupported("values live across a helper call");
        }

        emit::mov_rr(w, RDI, R12)?;
        if let Some(a) = arg {
            if a != RSI {
                emit::mov_rr(w, RSI, a)?;
            }
        }
        emit::mov_ri(w, RAX, address as u64)?;
        emit::call_r(w, RAX)?;

        self.exit = Exit::Status;
        Ok(())
    }
}

impl Encoder for X86Encoder {
    fn arch(&self) -> HostArch {
        HostArch::X86_64
    }

    fn supports(&self, kind: &NodeKind) -> bool {
        match kind {
            NodeKind::BinaryArith { op, lhs, .. } if lhs.ty().is_vector() => {
                matches!(op, BinaryOp::Xor) || (*op == BinaryOp::Add && lhs.ty().width() == 32)
            }
            NodeKind::Shift { value, .. } => !value.ty().is_vector(),
            NodeKind::Select { on_true, .. } => !on_true.ty().is_vector(),
            NodeKind::Constant { .. }
            | NodeKind::Start
            | NodeKind::End
            | NodeKind::ReadReg { .. }
            | NodeKind::ReadMem { .. }
            | NodeKind::BinaryArith { .. }
            | NodeKind::BitExtract { .. }
            | NodeKind::Not { .. }
            | NodeKind::ZeroExtend { .. }
            | NodeKind::SignExtend { .. }
            | NodeKind::Bitcast { .. }
            | NodeKind::WriteReg { .. }
            | NodeKind::WriteMem { .. }
            | NodeKind::WritePc { .. }
            | NodeKind::InternalCall { .. }
            | NodeKind::Br { .. }
            | NodeKind::Ret => true,
        }
    }

    fn emit_prologue(&mut self, w: &mut CodeWriter) -> Result<(), BackendError> {
        for reg in [RBP, RBX, R12, R13, R14, R15] {
            emit::push_r(w, reg)?;
        }
        emit::mov_rr(w, R12, RDI)?;
        emit::mov_rr(w, R13, RSI)?;
        emit::sub_rsp(w, FRAME_SIZE)?;
        Ok(())
    }

    fn begin_block(&mut self) -> Result<(), BackendError> {
        self.exit = Exit::Dispatcher;
        self.chain_target = None;
        Ok(())
    }

    fn begin_instruction(&mut self, packet: &Packet) -> Result<(), BackendError> {
        self.values.clear();
        self.free_gprs = GPR_POOL.to_vec();
        self.free_xmms = (0u8..16).rev().collect();
        self.free_slots = (0..SPILL_SLOTS).rev().collect();
        self.chain_target = None;

        self.uses = vec![0; packet.nodes().len()];
        for idx in schedule(packet) {
            for input in packet.node(idx).inputs() {
                self.uses[input.node().index()] += 1;
            }
        }

        Ok(())
    }

    fn lower(&mut self, packet: &Packet, idx: NodeIdx, w: &mut CodeWriter) -> Result<(), BackendError> {
        self.locked.clear();
        let node = packet.node(idx);

        match node.kind().clone() {
            NodeKind::Start | NodeKind::End => Ok(()),
            NodeKind::Constant { value } => self.lower_constant(idx, node.ty(), value, w),
            NodeKind::ReadReg { offset } => self.lower_read_reg(idx, node.ty(), offset, w),
            NodeKind::ReadMem { addr } => self.lower_read_mem(idx, node.ty(), addr, w),
            NodeKind::BinaryArith { op, lhs, rhs } => self.lower_binary(idx, node.ty(), op, lhs, rhs, w),
            NodeKind::Shift { op, value, amount } => self.lower_shift(idx, packet, op, value, amount, w),
            NodeKind::BitExtract { value, lo, width } => self.lower_bit_extract(idx, value, lo, width, w),
            NodeKind::Not { value } => {
                let v = self.input_gpr(value, w)?;
                let dst = self.alloc_gpr(w)?;
                emit::mov_rr(w, dst, v)?;
                emit::not_r(w, dst)?;
                if value.ty().width() < 64 {
                    self.canonicalize(w, dst, value.ty().width())?;
                }
                self.retire(&[value]);
                self.produce(idx, Loc::Gpr(dst));
                Ok(())
            }
            NodeKind::ZeroExtend { value } => self.lower_extend(idx, node.ty(), value, false, w),
            NodeKind::SignExtend { value } => self.lower_extend(idx, node.ty(), value, true, w),
            NodeKind::Bitcast { value } => {
                if value.ty().total_width() == 128 {
                    let v = self.input_xmm(value)?;
                    let dst = self.alloc_xmm()?;
                    emit::movdqa_rr(w, dst, v)?;
                    self.retire(&[value]);
                    self.produce(idx, Loc::Xmm(dst));
                } else {
                    let v = self.input_gpr(value, w)?;
                    let dst = self.alloc_gpr(w)?;
                    emit::mov_rr(w, dst, v)?;
                    self.retire(&[value]);
                    self.produce(idx, Loc::Gpr(dst));
                }
                Ok(())
            }
            NodeKind::Select { cond, on_true, on_false } => self.lower_select(idx, cond, on_true, on_false, w),
            NodeKind::WriteReg { offset, value } => self.lower_write_reg(offset, value, w),
            NodeKind::WriteMem { addr, value } => self.lower_write_mem(addr, value, w),
            NodeKind::WritePc { value } => {
                // A constant next PC makes the block exit chainable.
                if let NodeKind::Constant { value: pc } = packet.node(value.node()).kind() {
                    self.chain_target = Some(*pc);
                }
                self.lower_write_reg(arancini_x86::offsets::PC, value, w)
            }
            NodeKind::InternalCall { func, args } => self.lower_internal_call(packet, func.name(), &args, w),
            NodeKind::Br { .. } => {
                if self.exit != Exit::Status {
                    self.exit = Exit::Chain;
                }
                Ok(())
            }
            NodeKind::Ret => {
                if self.exit != Exit::Status {
                    self.exit = Exit::Dispatcher;
                }
                Ok(())
            }
        }
    }

    fn end_instruction(&mut self, _w: &mut CodeWriter) -> Result<(), BackendError> {
        self.values.clear();
        Ok(())
    }

    fn emit_epilogue(&mut self, w: &mut CodeWriter) -> Result<BlockExit, BackendError> {
        let mut chain_sites = Vec::new();

        match self.exit {
            Exit::Status => {}
            Exit::Dispatcher => emit::xor_r32_r32(w, RAX, RAX)?,
            Exit::Chain => {
                emit::xor_r32_r32(w, RAX, RAX)?;

                if let Some(target_pc) = self.chain_target {
                    if chain_sites.len() < MAX_CHAIN_SITES {
                        // Pad so the rel32 field is 4-byte aligned and a
                        // patch is one naturally-aligned store. The
                        // zero displacement falls through into the
                        // dispatcher return below.
                        while (w.pos() + 1) % 4 != 0 {
                            emit::nop(w)?;
                        }
                        w.emit8(0xe9)?;
                        let offset = w.pos();
                        w.emit32(0)?;

                        chain_sites.push(ChainSite {
                            offset,
                            kind: ChainKind::DirectJump,
                            target_pc,
                        });
                    }
                }
            }
        }

        let epilogue_offset = w.pos();
        emit::add_rsp(w, FRAME_SIZE)?;
        for reg in [R15, R14, R13, R12, RBX, RBP] {
            emit::pop_r(w, reg)?;
        }
        emit::ret(w)?;

        Ok(BlockExit {
            chain_sites,
            epilogue_offset,
        })
    }

    fn patch_chain(&self, site: &ChainSite, buffer: &ExecBuffer, target_addr: usize) -> Result<(), BackendError> {
        let ChainKind::DirectJump = site.kind;

        let next = buffer.addr_of(site.offset) as i128 + 4;
        let rel = target_addr as i128 - next;
        let rel: i32 = rel.try_into().map_err(|_| BackendError::ChainTargetOutOfRange)?;

        ChainWriter::new(buffer, site.offset, 4)?.patch32(rel as u32)
    }
}

const fn width_mask(width: u16) -> u64 {
    match width {
        64 => u64::MAX,
        w => (1u64 << w) - 1,
    }
}

fn scalar_bytes(ty: ValueType) -> u8 {
    match ty.width() {
        1 | 8 => 1,
        16 => 2,
        32 => 4,
        _ => 8,
    }
}

/// Raw x86-64 instruction emission.
mod emit {
    use arancini_ir::ShiftOp;

    use crate::error::BackendError;
    use crate::output::writer::CodeWriter;

    use super::{R12, R13, RSP};

    type R = Result<(), BackendError>;

    pub(super) const ALU_ADD: u8 = 0x01;
    pub(super) const ALU_OR: u8 = 0x09;
    pub(super) const ALU_AND: u8 = 0x21;
    pub(super) const ALU_SUB: u8 = 0x29;
    pub(super) const ALU_XOR: u8 = 0x31;

    pub(super) const CC_B: u8 = 0x2;
    pub(super) const CC_E: u8 = 0x4;
    pub(super) const CC_NE: u8 = 0x5;
    pub(super) const CC_L: u8 = 0xc;

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        (mode << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    fn sib(scale: u8, index: u8, base: u8) -> u8 {
        (scale << 6) | ((index & 7) << 3) | (base & 7)
    }

    /// REX prefix; forced for byte operations on spl/bpl/sil/dil.
    fn rex(w: &mut CodeWriter, wide: bool, reg: u8, index: u8, base: u8, byte_op: bool) -> R {
        let mut v = 0x40u8;
        if wide {
            v |= 0x08;
        }
        if reg >= 8 {
            v |= 0x04;
        }
        if index >= 8 {
            v |= 0x02;
        }
        if base >= 8 {
            v |= 0x01;
        }

        let byte_force = byte_op && ((4..8).contains(&reg) || (4..8).contains(&base));
        if v != 0x40 || byte_force {
            w.emit8(v)?;
        }
        Ok(())
    }

    pub(super) fn nop(w: &mut CodeWriter) -> R {
        w.emit8(0x90)
    }

    pub(super) fn ret(w: &mut CodeWriter) -> R {
        w.emit8(0xc3)
    }

    pub(super) fn push_r(w: &mut CodeWriter, reg: u8) -> R {
        if reg >= 8 {
            w.emit8(0x41)?;
        }
        w.emit8(0x50 + (reg & 7))
    }

    pub(super) fn pop_r(w: &mut CodeWriter, reg: u8) -> R {
        if reg >= 8 {
            w.emit8(0x41)?;
        }
        w.emit8(0x58 + (reg & 7))
    }

    pub(super) fn sub_rsp(w: &mut CodeWriter, imm: u32) -> R {
        rex(w, true, 5, 0, RSP, false)?;
        w.emit8(0x81)?;
        w.emit8(modrm(3, 5, RSP))?;
        w.emit32(imm)
    }

    pub(super) fn add_rsp(w: &mut CodeWriter, imm: u32) -> R {
        rex(w, true, 0, 0, RSP, false)?;
        w.emit8(0x81)?;
        w.emit8(modrm(3, 0, RSP))?;
        w.emit32(imm)
    }

    /// mov dst, src (64-bit).
    pub(super) fn mov_rr(w: &mut CodeWriter, dst: u8, src: u8) -> R {
        if dst == src {
            return Ok(());
        }
        rex(w, true, src, 0, dst, false)?;
        w.emit8(0x89)?;
        w.emit8(modrm(3, src, dst))
    }

    /// mov dst, imm; zero-extended, movabs only when needed.
    pub(super) fn mov_ri(w: &mut CodeWriter, dst: u8, imm: u64) -> R {
        if imm <= u32::MAX as u64 {
            rex(w, false, 0, 0, dst, false)?;
            w.emit8(0xb8 + (dst & 7))?;
            w.emit32(imm as u32)
        } else {
            rex(w, true, 0, 0, dst, false)?;
            w.emit8(0xb8 + (dst & 7))?;
            w.emit64(imm)
        }
    }

    /// movzx dst, src8 (register forms).
    pub(super) fn movzx8_rr(w: &mut CodeWriter, dst: u8, src: u8) -> R {
        rex(w, false, dst, 0, src, true)?;
        w.emit8(0x0f)?;
        w.emit8(0xb6)?;
        w.emit8(modrm(3, dst, src))
    }

    /// movsx dst, src of `width` bits into 64.
    pub(super) fn movsx(w: &mut CodeWriter, dst: u8, src: u8, width: u16) -> R {
        match width {
            8 => {
                rex(w, true, dst, 0, src, true)?;
                w.emit8(0x0f)?;
                w.emit8(0xbe)?;
            }
            16 => {
                rex(w, true, dst, 0, src, false)?;
                w.emit8(0x0f)?;
                w.emit8(0xbf)?;
            }
            32 => {
                rex(w, true, dst, 0, src, false)?;
                w.emit8(0x63)?;
            }
            _ => unreachable!("movsx width"),
        }
        w.emit8(modrm(3, dst, src))
    }

    /// 64-bit ALU op, MR form: op dst, src.
    pub(super) fn alu_rr(w: &mut CodeWriter, opcode: u8, dst: u8, src: u8) -> R {
        rex(w, true, src, 0, dst, false)?;
        w.emit8(opcode)?;
        w.emit8(modrm(3, src, dst))
    }

    pub(super) fn cmp_rr(w: &mut CodeWriter, a: u8, b: u8) -> R {
        rex(w, true, b, 0, a, false)?;
        w.emit8(0x39)?;
        w.emit8(modrm(3, b, a))
    }

    pub(super) fn test_rr(w: &mut CodeWriter, a: u8, b: u8) -> R {
        rex(w, true, b, 0, a, false)?;
        w.emit8(0x85)?;
        w.emit8(modrm(3, b, a))
    }

    pub(super) fn imul_rr(w: &mut CodeWriter, dst: u8, src: u8) -> R {
        rex(w, true, dst, 0, src, false)?;
        w.emit8(0x0f)?;
        w.emit8(0xaf)?;
        w.emit8(modrm(3, dst, src))
    }

    pub(super) fn not_r(w: &mut CodeWriter, dst: u8) -> R {
        rex(w, true, 2, 0, dst, false)?;
        w.emit8(0xf7)?;
        w.emit8(modrm(3, 2, dst))
    }

    /// div rdx:rax by reg (unsigned).
    pub(super) fn div_r(w: &mut CodeWriter, reg: u8) -> R {
        rex(w, true, 6, 0, reg, false)?;
        w.emit8(0xf7)?;
        w.emit8(modrm(3, 6, reg))
    }

    /// xor dst32, src32; the common zero idiom.
    pub(super) fn xor_r32_r32(w: &mut CodeWriter, dst: u8, src: u8) -> R {
        rex(w, false, src, 0, dst, false)?;
        w.emit8(0x31)?;
        w.emit8(modrm(3, src, dst))
    }

    /// and dst32, imm32; clears bits 32..63 as a side effect.
    pub(super) fn and_r32_imm(w: &mut CodeWriter, dst: u8, imm: u32) -> R {
        rex(w, false, 4, 0, dst, false)?;
        w.emit8(0x81)?;
        w.emit8(modrm(3, 4, dst))?;
        w.emit32(imm)
    }

    pub(super) fn shift_imm(w: &mut CodeWriter, op: ShiftOp, dst: u8, imm: u8) -> R {
        rex(w, true, shift_ext(op), 0, dst, false)?;
        w.emit8(0xc1)?;
        w.emit8(modrm(3, shift_ext(op), dst))?;
        w.emit8(imm)
    }

    pub(super) fn shift_cl(w: &mut CodeWriter, op: ShiftOp, dst: u8) -> R {
        rex(w, true, shift_ext(op), 0, dst, false)?;
        w.emit8(0xd3)?;
        w.emit8(modrm(3, shift_ext(op), dst))
    }

    fn shift_ext(op: ShiftOp) -> u8 {
        match op {
            ShiftOp::Lsl => 4,
            ShiftOp::Lsr => 5,
            ShiftOp::Asr => 7,
        }
    }

    pub(super) fn setcc(w: &mut CodeWriter, cc: u8, dst: u8) -> R {
        rex(w, false, 0, 0, dst, true)?;
        w.emit8(0x0f)?;
        w.emit8(0x90 + cc)?;
        w.emit8(modrm(3, 0, dst))
    }

    pub(super) fn cmovcc(w: &mut CodeWriter, cc: u8, dst: u8, src: u8) -> R {
        rex(w, true, dst, 0, src, false)?;
        w.emit8(0x0f)?;
        w.emit8(0x40 + cc)?;
        w.emit8(modrm(3, dst, src))
    }

    pub(super) fn call_r(w: &mut CodeWriter, reg: u8) -> R {
        rex(w, false, 2, 0, reg, false)?;
        w.emit8(0xff)?;
        w.emit8(modrm(3, 2, reg))
    }

    /// Load `bytes` from [r12 + offset] into dst, zero-extended.
    pub(super) fn load_state(w: &mut CodeWriter, bytes: u8, dst: u8, offset: u32) -> R {
        match bytes {
            1 => {
                rex(w, false, dst, 0, R12, false)?;
                w.emit8(0x0f)?;
                w.emit8(0xb6)?;
            }
            2 => {
                rex(w, false, dst, 0, R12, false)?;
                w.emit8(0x0f)?;
                w.emit8(0xb7)?;
            }
            4 => {
                rex(w, false, dst, 0, R12, false)?;
                w.emit8(0x8b)?;
            }
            _ => {
                rex(w, true, dst, 0, R12, false)?;
                w.emit8(0x8b)?;
            }
        }
        w.emit8(modrm(2, dst, 4))?;
        w.emit8(sib(0, 4, R12))?;
        w.emit32(offset)
    }

    /// Store the low `bytes` of src to [r12 + offset].
    pub(super) fn store_state(w: &mut CodeWriter, bytes: u8, src: u8, offset: u32) -> R {
        match bytes {
            1 => {
                rex(w, false, src, 0, R12, true)?;
                w.emit8(0x88)?;
            }
            2 => {
                w.emit8(0x66)?;
                rex(w, false, src, 0, R12, false)?;
                w.emit8(0x89)?;
            }
            4 => {
                rex(w, false, src, 0, R12, false)?;
                w.emit8(0x89)?;
            }
            _ => {
                rex(w, true, src, 0, R12, false)?;
                w.emit8(0x89)?;
            }
        }
        w.emit8(modrm(2, src, 4))?;
        w.emit8(sib(0, 4, R12))?;
        w.emit32(offset)
    }

    /// Load `bytes` from [r13 + addr] into dst, zero-extended.
    pub(super) fn load_mem(w: &mut CodeWriter, bytes: u8, dst: u8, addr: u8) -> R {
        match bytes {
            1 => {
                rex(w, false, dst, addr, R13, false)?;
                w.emit8(0x0f)?;
                w.emit8(0xb6)?;
            }
            2 => {
                rex(w, false, dst, addr, R13, false)?;
                w.emit8(0x0f)?;
                w.emit8(0xb7)?;
            }
            4 => {
                rex(w, false, dst, addr, R13, false)?;
                w.emit8(0x8b)?;
            }
            _ => {
                rex(w, true, dst, addr, R13, false)?;
                w.emit8(0x8b)?;
            }
        }
        w.emit8(modrm(1, dst, 4))?;
        w.emit8(sib(0, addr, R13))?;
        w.emit8(0)
    }

    /// Store the low `bytes` of src to [r13 + addr].
    pub(super) fn store_mem(w: &mut CodeWriter, bytes: u8, src: u8, addr: u8) -> R {
        match bytes {
            1 => {
                rex(w, false, src, addr, R13, true)?;
                w.emit8(0x88)?;
            }
            2 => {
                w.emit8(0x66)?;
                rex(w, false, src, addr, R13, false)?;
                w.emit8(0x89)?;
            }
            4 => {
                rex(w, false, src, addr, R13, false)?;
                w.emit8(0x89)?;
            }
            _ => {
                rex(w, true, src, addr, R13, false)?;
                w.emit8(0x89)?;
            }
        }
        w.emit8(modrm(1, src, 4))?;
        w.emit8(sib(0, addr, R13))?;
        w.emit8(0)
    }

    pub(super) fn movdqu_load_state(w: &mut CodeWriter, dst: u8, offset: u32) -> R {
        w.emit8(0xf3)?;
        rex(w, false, dst, 0, R12, false)?;
        w.emit8(0x0f)?;
        w.emit8(0x6f)?;
        w.emit8(modrm(2, dst, 4))?;
        w.emit8(sib(0, 4, R12))?;
        w.emit32(offset)
    }

    pub(super) fn movdqu_store_state(w: &mut CodeWriter, src: u8, offset: u32) -> R {
        w.emit8(0xf3)?;
        rex(w, false, src, 0, R12, false)?;
        w.emit8(0x0f)?;
        w.emit8(0x7f)?;
        w.emit8(modrm(2, src, 4))?;
        w.emit8(sib(0, 4, R12))?;
        w.emit32(offset)
    }

    pub(super) fn movdqu_load_mem(w: &mut CodeWriter, dst: u8, addr: u8) -> R {
        w.emit8(0xf3)?;
        rex(w, false, dst, addr, R13, false)?;
        w.emit8(0x0f)?;
        w.emit8(0x6f)?;
        w.emit8(modrm(1, dst, 4))?;
        w.emit8(sib(0, addr, R13))?;
        w.emit8(0)
    }

    pub(super) fn movdqu_store_mem(w: &mut CodeWriter, src: u8, addr: u8) -> R {
        w.emit8(0xf3)?;
        rex(w, false, src, addr, R13, false)?;
        w.emit8(0x0f)?;
        w.emit8(0x7f)?;
        w.emit8(modrm(1, src, 4))?;
        w.emit8(sib(0, addr, R13))?;
        w.emit8(0)
    }

    pub(super) fn movdqa_rr(w: &mut CodeWriter, dst: u8, src: u8) -> R {
        if dst == src {
            return Ok(());
        }
        w.emit8(0x66)?;
        rex(w, false, dst, 0, src, false)?;
        w.emit8(0x0f)?;
        w.emit8(0x6f)?;
        w.emit8(modrm(3, dst, src))
    }

    pub(super) fn paddd(w: &mut CodeWriter, dst: u8, src: u8) -> R {
        w.emit8(0x66)?;
        rex(w, false, dst, 0, src, false)?;
        w.emit8(0x0f)?;
        w.emit8(0xfe)?;
        w.emit8(modrm(3, dst, src))
    }

    pub(super) fn pxor(w: &mut CodeWriter, dst: u8, src: u8) -> R {
        w.emit8(0x66)?;
        rex(w, false, dst, 0, src, false)?;
        w.emit8(0x0f)?;
        w.emit8(0xef)?;
        w.emit8(modrm(3, dst, src))
    }

    /// Spill slots live at [rsp + slot*8].
    pub(super) fn store_spill(w: &mut CodeWriter, src: u8, slot: u8) -> R {
        rex(w, true, src, 0, RSP, false)?;
        w.emit8(0x89)?;
        w.emit8(modrm(2, src, 4))?;
        w.emit8(sib(0, 4, RSP))?;
        w.emit32(slot as u32 * 8)
    }

    pub(super) fn load_spill(w: &mut CodeWriter, dst: u8, slot: u8) -> R {
        rex(w, true, dst, 0, RSP, false)?;
        w.emit8(0x8b)?;
        w.emit8(modrm(2, dst, 4))?;
        w.emit8(sib(0, 4, RSP))?;
        w.emit32(slot as u32 * 8)
    }
}

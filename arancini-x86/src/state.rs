//! Guest CPU state for x86-64 and its byte-offset ABI.
//!
//! Emitted code addresses this structure by byte offset; the offsets
//! carried by `read_reg`/`write_reg` nodes and the constants in
//! [`offsets`] are the contract. Changing the layout is a breaking ABI
//! change.

/// One 128-bit SSE register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct XmmReg {
    /// Low 64 bits.
    pub lo: u64,
    /// High 64 bits.
    pub hi: u64,
}

/// Per-thread guest CPU state, shared with emitted code.
///
/// `#[repr(C)]`: field order and padding are fixed. The general-purpose
/// registers follow the hardware encoding order, so a register number
/// maps linearly to its slot.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct X86CpuState {
    /// Guest program counter.
    pub pc: u64,
    /// General-purpose registers in encoding order.
    pub rax: u64,
    #[allow(missing_docs)]
    pub rcx: u64,
    #[allow(missing_docs)]
    pub rdx: u64,
    #[allow(missing_docs)]
    pub rbx: u64,
    #[allow(missing_docs)]
    pub rsp: u64,
    #[allow(missing_docs)]
    pub rbp: u64,
    #[allow(missing_docs)]
    pub rsi: u64,
    #[allow(missing_docs)]
    pub rdi: u64,
    #[allow(missing_docs)]
    pub r8: u64,
    #[allow(missing_docs)]
    pub r9: u64,
    #[allow(missing_docs)]
    pub r10: u64,
    #[allow(missing_docs)]
    pub r11: u64,
    #[allow(missing_docs)]
    pub r12: u64,
    #[allow(missing_docs)]
    pub r13: u64,
    #[allow(missing_docs)]
    pub r14: u64,
    #[allow(missing_docs)]
    pub r15: u64,
    /// Zero flag, 0 or 1.
    pub zf: u8,
    /// Carry flag.
    pub cf: u8,
    /// Overflow flag.
    pub of: u8,
    /// Sign flag.
    pub sf: u8,
    /// Parity flag.
    pub pf: u8,
    /// Direction flag.
    pub df: u8,
    _pad: [u8; 2],
    /// SSE registers.
    pub xmm: [XmmReg; 16],
    /// FS segment base.
    pub fs: u64,
    /// GS segment base.
    pub gs: u64,
    /// x87 control word.
    pub x87_control: u16,
    _pad2: [u8; 6],
}

impl Default for X86CpuState {
    fn default() -> Self {
        Self {
            pc: 0,
            rax: 0,
            rcx: 0,
            rdx: 0,
            rbx: 0,
            rsp: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            zf: 0,
            cf: 0,
            of: 0,
            sf: 0,
            pf: 0,
            df: 0,
            _pad: [0; 2],
            xmm: [XmmReg::default(); 16],
            fs: 0,
            gs: 0,
            // Power-on x87 control word.
            x87_control: 0x037f,
            _pad2: [0; 6],
        }
    }
}

impl X86CpuState {
    /// Fresh state with `pc` and `rsp` set.
    pub fn with_entry(pc: u64, rsp: u64) -> Self {
        Self {
            pc,
            rsp,
            ..Self::default()
        }
    }

    /// Size of the state block in bytes.
    pub const fn size() -> usize {
        core::mem::size_of::<Self>()
    }
}

/// Byte offsets of every CPU-state slot, as carried by the IR.
pub mod offsets {
    /// Program counter.
    pub const PC: u32 = 0;
    /// First general-purpose register (rax).
    pub const RAX: u32 = 8;
    #[allow(missing_docs)]
    pub const RCX: u32 = 16;
    #[allow(missing_docs)]
    pub const RDX: u32 = 24;
    #[allow(missing_docs)]
    pub const RBX: u32 = 32;
    #[allow(missing_docs)]
    pub const RSP: u32 = 40;
    #[allow(missing_docs)]
    pub const RBP: u32 = 48;
    #[allow(missing_docs)]
    pub const RSI: u32 = 56;
    #[allow(missing_docs)]
    pub const RDI: u32 = 64;
    #[allow(missing_docs)]
    pub const R8: u32 = 72;
    #[allow(missing_docs)]
    pub const R15: u32 = 128;
    /// Zero flag.
    pub const ZF: u32 = 136;
    /// Carry flag.
    pub const CF: u32 = 137;
    /// Overflow flag.
    pub const OF: u32 = 138;
    /// Sign flag.
    pub const SF: u32 = 139;
    /// Parity flag.
    pub const PF: u32 = 140;
    /// Direction flag.
    pub const DF: u32 = 141;
    /// First SSE register.
    pub const XMM0: u32 = 144;
    /// FS segment base.
    pub const FS: u32 = 400;
    /// GS segment base.
    pub const GS: u32 = 408;
    /// x87 control word.
    pub const X87_CTRL: u32 = 416;

    /// Slot of the `n`-th general-purpose register in encoding order.
    pub const fn gpr(n: u32) -> u32 {
        RAX + n * 8
    }

    /// Slot of the `n`-th SSE register.
    pub const fn xmm(n: u32) -> u32 {
        XMM0 + n * 16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn abi_offsets_match_layout() {
        assert_eq!(offset_of!(X86CpuState, pc), offsets::PC as usize);
        assert_eq!(offset_of!(X86CpuState, rax), offsets::RAX as usize);
        assert_eq!(offset_of!(X86CpuState, rcx), offsets::RCX as usize);
        assert_eq!(offset_of!(X86CpuState, rsp), offsets::RSP as usize);
        assert_eq!(offset_of!(X86CpuState, rdi), offsets::RDI as usize);
        assert_eq!(offset_of!(X86CpuState, r8), offsets::R8 as usize);
        assert_eq!(offset_of!(X86CpuState, r15), offsets::R15 as usize);
        assert_eq!(offset_of!(X86CpuState, zf), offsets::ZF as usize);
        assert_eq!(offset_of!(X86CpuState, cf), offsets::CF as usize);
        assert_eq!(offset_of!(X86CpuState, of), offsets::OF as usize);
        assert_eq!(offset_of!(X86CpuState, sf), offsets::SF as usize);
        assert_eq!(offset_of!(X86CpuState, pf), offsets::PF as usize);
        assert_eq!(offset_of!(X86CpuState, df), offsets::DF as usize);
        assert_eq!(offset_of!(X86CpuState, xmm), offsets::XMM0 as usize);
        assert_eq!(offset_of!(X86CpuState, fs), offsets::FS as usize);
        assert_eq!(offset_of!(X86CpuState, gs), offsets::GS as usize);
        assert_eq!(offset_of!(X86CpuState, x87_control), offsets::X87_CTRL as usize);
    }

    #[test]
    fn gpr_slots_follow_encoding_order() {
        assert_eq!(offsets::gpr(0), offsets::RAX);
        assert_eq!(offsets::gpr(4), offsets::RSP);
        assert_eq!(offsets::gpr(15), offsets::R15);
        assert_eq!(offsets::xmm(15), offsets::XMM0 + 15 * 16);
    }

    #[test]
    fn state_is_pointer_aligned() {
        assert_eq!(core::mem::align_of::<X86CpuState>(), 8);
        assert_eq!(X86CpuState::size() % 8, 0);
    }
}

//! A compiled translation of one guest basic block.

use arancini_x86::X86CpuState;

use crate::output::writer::ExecBuffer;
use crate::output::ChainSite;

/// Host function shape of emitted code: CPU state and guest memory base
/// arrive in the first two argument registers; the return value is the
/// dispatcher status (0 resumes, non-zero halts with that code).
type NativeFn = unsafe extern "C" fn(*mut X86CpuState, *mut u8) -> i32;

/// Invoke a translation at `code`.
///
/// # Safety
///
/// `code` must be the entry of a finalised translation produced by the
/// backend for this host, and the two pointers must be valid for the
/// duration of the call.
pub unsafe fn call_native(code: *const u8, cpu_state: *mut X86CpuState, memory: *mut u8) -> i32 {
    // SAFETY: per the function contract.
    unsafe {
        let f: NativeFn = core::mem::transmute(code);
        f(cpu_state, memory)
    }
}

/// Executable code compiled from the guest block entered at `entry_pc`,
/// together with its chain metadata.
///
/// The backing buffer is freed when the last `Arc<Translation>` drops;
/// the cache clones the `Arc` into every invocation, so replacement is
/// quiescent: no buffer dies while a thread can still be inside it.
#[derive(Debug)]
pub struct Translation {
    buffer: ExecBuffer,
    entry_pc: u64,
    body_offset: usize,
    epilogue_offset: usize,
    chain_sites: Vec<ChainSite>,
}

impl Translation {
    pub(crate) fn new(
        buffer: ExecBuffer,
        entry_pc: u64,
        body_offset: usize,
        epilogue_offset: usize,
        chain_sites: Vec<ChainSite>,
    ) -> Self {
        Self {
            buffer,
            entry_pc,
            body_offset,
            epilogue_offset,
            chain_sites,
        }
    }

    /// Guest PC this translation was compiled from.
    pub const fn entry_pc(&self) -> u64 {
        self.entry_pc
    }

    /// Entry point of the compiled code.
    pub fn code_ptr(&self) -> *const u8 {
        self.buffer.ptr()
    }

    /// Code size in bytes.
    pub const fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Host address chained predecessors jump to: the body entry, past
    /// the prologue, since the register convention and frame are shared.
    pub fn body_addr(&self) -> usize {
        self.buffer.addr_of(self.body_offset)
    }

    /// Host address of the dispatcher-return path; patch sites point
    /// here while unchained.
    pub fn epilogue_addr(&self) -> usize {
        self.buffer.addr_of(self.epilogue_offset)
    }

    /// Patchable outgoing edges.
    pub fn chain_sites(&self) -> &[ChainSite] {
        &self.chain_sites
    }

    pub(crate) fn buffer(&self) -> &ExecBuffer {
        &self.buffer
    }

    /// Run the translation.
    ///
    /// # Safety
    ///
    /// The translation must have been produced by the backend matching
    /// this host, and both pointers must be valid.
    pub unsafe fn invoke(&self, cpu_state: *mut X86CpuState, memory: *mut u8) -> i32 {
        // SAFETY: per the function contract.
        unsafe { call_native(self.buffer.ptr(), cpu_state, memory) }
    }
}

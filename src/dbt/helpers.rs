//! Host-side implementations of the internal functions emitted code
//! calls.
//!
//! Every helper shares one ABI: `extern "C" fn(*mut X86CpuState, u64)
//! -> i32`, taking the invoking thread's CPU state and one optional
//! argument, returning the dispatcher status (0 resumes, non-zero halts
//! with that code).

use std::collections::HashMap;

use arancini_x86::X86CpuState;

/// Uniform signature of a runtime helper.
pub type HelperFn = unsafe extern "C" fn(state: *mut X86CpuState, arg: u64) -> i32;

/// Name → host address table consulted when lowering `internal_call`
/// nodes. Higher layers may register additional names.
#[derive(Debug, Clone)]
pub struct HelperTable {
    entries: HashMap<String, HelperFn>,
}

impl Default for HelperTable {
    fn default() -> Self {
        let mut table = Self {
            entries: HashMap::new(),
        };

        table.register("handle_int", handle_int);
        table.register("handle_syscall", handle_syscall);
        table.register("handle_poison", handle_poison);
        table.register("hlt", hlt);
        table
    }
}

impl HelperTable {
    /// Register or replace a helper.
    pub fn register(&mut self, name: impl Into<String>, f: HelperFn) {
        self.entries.insert(name.into(), f);
    }

    /// Host entry address of a helper.
    pub fn address(&self, name: &str) -> Option<usize> {
        self.entries.get(name).map(|f| *f as usize)
    }
}

/// Status returned by the default `hlt` helper.
pub const STATUS_HALT: i32 = 1;

unsafe extern "C" fn handle_int(state: *mut X86CpuState, vector: u64) -> i32 {
    // SAFETY: emitted code passes the invoking thread's state block.
    let pc = unsafe { (*state).pc };
    tracing::debug!(vector, pc, "guest interrupt");
    0
}

unsafe extern "C" fn handle_syscall(state: *mut X86CpuState, _arg: u64) -> i32 {
    // SAFETY: as above.
    let nr = unsafe { (*state).rax };
    tracing::debug!(nr, "guest syscall");
    0
}

unsafe extern "C" fn handle_poison(state: *mut X86CpuState, site: u64) -> i32 {
    // SAFETY: as above.
    let pc = unsafe { (*state).pc };
    tracing::warn!(site, pc, "poisoned instruction executed");
    0
}

unsafe extern "C" fn hlt(_state: *mut X86CpuState, _arg: u64) -> i32 {
    tracing::debug!("guest halt");
    STATUS_HALT
}

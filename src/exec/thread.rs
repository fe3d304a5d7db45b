//! Per-guest-thread execution state.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use arancini_x86::X86CpuState;

/// One guest thread: its CPU-state block and the per-thread
/// chain-address field emitted code uses to pass the next PC out on
/// dispatcher returns.
///
/// Emitted code is re-entrant across threads because each invocation
/// receives its own state block; the lock only orders host-side access
/// against invocations.
#[derive(Debug)]
pub struct ExecutionThread {
    state: Mutex<Box<X86CpuState>>,
    chain_address: AtomicU64,
}

impl ExecutionThread {
    pub(crate) fn new(state: X86CpuState) -> Self {
        Self {
            state: Mutex::new(Box::new(state)),
            chain_address: AtomicU64::new(0),
        }
    }

    /// Run `f` with exclusive access to the CPU state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut X86CpuState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Lock the state and hand back both the guard-protected pointer
    /// and the guard; used by the dispatch loop to pass the block into
    /// native code.
    pub(crate) fn lock_state(&self) -> parking_lot::MutexGuard<'_, Box<X86CpuState>> {
        self.state.lock()
    }

    /// Next-PC passed out by emitted code on dispatcher returns.
    pub fn chain_address(&self) -> u64 {
        self.chain_address.load(Ordering::Acquire)
    }

    /// Store the chain address.
    pub fn set_chain_address(&self, addr: u64) {
        self.chain_address.store(addr, Ordering::Release);
    }
}

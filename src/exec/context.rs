//! The execution context: guest memory, the shared engine, and the
//! dispatch loop.

use std::sync::Arc;

use parking_lot::Mutex;

use arancini_x86::X86CpuState;

use crate::config::TranslationConfig;
use crate::dbt::TranslationEngine;
use crate::error::ExecutionError;
use crate::exec::memory::GuestMemory;
use crate::exec::thread::ExecutionThread;

/// Owns the guest memory mapping, the translation engine and the pool
/// of execution threads.
#[derive(Debug)]
pub struct ExecutionContext {
    memory: GuestMemory,
    engine: TranslationEngine,
    threads: Mutex<Vec<Arc<ExecutionThread>>>,
}

impl ExecutionContext {
    /// Allocate guest memory and set up the engine.
    pub fn new(config: TranslationConfig) -> Result<Self, ExecutionError> {
        Ok(Self {
            memory: GuestMemory::new(config.guest_memory_size)?,
            engine: TranslationEngine::new(config),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// The guest memory region.
    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// The shared translation engine.
    pub fn engine(&self) -> &TranslationEngine {
        &self.engine
    }

    /// Copy a code or data image into guest memory.
    pub fn load_image(&self, addr: u64, bytes: &[u8]) -> Result<(), ExecutionError> {
        self.memory.write(addr, bytes)
    }

    /// Create an execution thread whose guest starts at `pc` with the
    /// given stack pointer.
    pub fn create_execution_thread(&self, pc: u64, rsp: u64) -> Arc<ExecutionThread> {
        let thread = Arc::new(ExecutionThread::new(X86CpuState::with_entry(pc, rsp)));
        self.threads.lock().push(thread.clone());
        thread
    }

    /// Run the dispatch loop for `thread` until emitted code halts.
    ///
    /// Each iteration loads the PC from the thread's state, obtains (or
    /// makes) the translation, and calls into it; the translated code
    /// may chain between blocks and not return for long stretches. A
    /// non-zero status halts the guest with that code.
    pub fn invoke(&self, thread: &ExecutionThread) -> Result<i32, ExecutionError> {
        loop {
            let mut state = thread.lock_state();
            let pc = state.pc;

            let translation = self.engine.get_translation(pc, &self.memory)?;

            tracing::trace!(pc, size = translation.size(), "enter native code");

            // SAFETY: the translation was produced by this host's
            // backend; the state block and memory base stay valid for
            // the call, and the guard keeps host-side readers out.
            let status = unsafe { translation.invoke(state.as_mut(), self.memory.base_ptr()) };

            thread.set_chain_address(state.pc);
            drop(state);

            if status != 0 {
                tracing::debug!(status, "guest halted");
                return Ok(status);
            }
        }
    }
}

//! The guest's flat memory image.

use std::{io, slice};

use crate::error::ExecutionError;
use crate::output::writer::Mapping;

/// One contiguous, page-aligned guest memory region, allocated once.
///
/// Guest virtual addresses are plain offsets into the region; emitted
/// code reads instruction bytes and data through the base pointer it
/// receives as its second argument. The region is plain read-write:
/// guest code bytes are data to the translator, never host-executable.
#[derive(Debug)]
pub struct GuestMemory {
    map: Mapping,
    size: usize,
}

// SAFETY: the region is shared mutable state by design; guest threads
// race on it exactly as the host memory model allows, and the host-side
// accessors only hand out bounded views.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Map a region of `size` bytes.
    pub fn new(size: usize) -> Result<Self, ExecutionError> {
        let map = Mapping::new(size).map_err(|e| ExecutionError::GuestMemory {
            size,
            source: match e {
                crate::error::BackendError::ResourceExhaustion(err) => err,
                other => io::Error::other(other.to_string()),
            },
        })?;

        Ok(Self { map, size })
    }

    /// Region size in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Base of the region, as passed to emitted code.
    pub fn base_ptr(&self) -> *mut u8 {
        self.map.ptr()
    }

    /// Read-only view of up to `len` bytes at `addr`, clamped to the
    /// region end. Returns `None` when `addr` is outside the region.
    ///
    /// The view is coherent only while no guest thread is running.
    pub fn window(&self, addr: u64, len: usize) -> Option<&[u8]> {
        if addr >= self.size as u64 {
            return None;
        }

        let start = addr as usize;
        let len = len.min(self.size - start);
        // SAFETY: bounds checked above; see coherence note.
        Some(unsafe { slice::from_raw_parts(self.map.ptr().add(start), len) })
    }

    /// Copy `bytes` into the region at `addr`.
    pub fn write(&self, addr: u64, bytes: &[u8]) -> Result<(), ExecutionError> {
        let start = addr as usize;
        if start.checked_add(bytes.len()).is_none_or(|end| end > self.size) {
            return Err(ExecutionError::ImageOutOfBounds {
                addr,
                len: bytes.len(),
            });
        }

        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.map.ptr().add(start), bytes.len());
        }
        Ok(())
    }

    /// Copy out of the region at `addr`.
    pub fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), ExecutionError> {
        let start = addr as usize;
        if start.checked_add(out.len()).is_none_or(|end| end > self.size) {
            return Err(ExecutionError::ImageOutOfBounds { addr, len: out.len() });
        }

        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.map.ptr().add(start), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}

//! Machine-code writers over executable memory.
//!
//! A [`CodeWriter`] owns a growable read-write mapping while code is
//! being emitted; [`CodeWriter::finalise`] trims it and flips it to
//! read-execute before it can become reachable from the cache (W xor X).
//! A [`ChainWriter`] rewrites a bounded, instruction-aligned slot inside
//! an already-finalised buffer for block chaining.

use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::BackendError;

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

/// An anonymous private mapping.
#[derive(Debug)]
pub(crate) struct Mapping {
    ptr: NonNull<u8>,
    capacity: usize,
}

// SAFETY: the mapping is exclusively owned; aliasing is managed by the
// writer and buffer types above it.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub(crate) fn new(capacity: usize) -> Result<Self, BackendError> {
        let capacity = round_up(capacity.max(1), page_size());

        // SAFETY: anonymous mapping, no file descriptor involved.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if raw == libc::MAP_FAILED {
            return Err(BackendError::ResourceExhaustion(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: NonNull::new(raw.cast::<u8>()).ok_or_else(|| {
                BackendError::ResourceExhaustion(io::Error::other("mmap returned null"))
            })?,
            capacity,
        })
    }

    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn protect(&self, prot: libc::c_int) -> Result<(), BackendError> {
        // SAFETY: the whole region belongs to this mapping.
        let rc = unsafe { libc::mprotect(self.ptr.as_ptr().cast(), self.capacity, prot) };
        if rc != 0 {
            return Err(BackendError::ResourceExhaustion(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Release the pages past `keep` (page-rounded).
    fn trim(&mut self, keep: usize) {
        let keep = round_up(keep.max(1), page_size());
        if keep < self.capacity {
            // SAFETY: the tail range is part of this mapping and nothing
            // references it yet.
            unsafe {
                libc::munmap(self.ptr.as_ptr().add(keep).cast(), self.capacity - keep);
            }
            self.capacity = keep;
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: owned mapping, unmapped exactly once.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.capacity);
        }
    }
}

/// Append-only writer into a growable executable-memory region.
#[derive(Debug)]
pub struct CodeWriter {
    map: Mapping,
    len: usize,
}

impl CodeWriter {
    /// Map a fresh region of at least `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self, BackendError> {
        Ok(Self {
            map: Mapping::new(capacity)?,
            len: 0,
        })
    }

    /// Bytes emitted so far; also the offset of the next emit.
    pub const fn pos(&self) -> usize {
        self.len
    }

    /// Base address of the region while it is being written.
    pub fn ptr(&self) -> *const u8 {
        self.map.ptr.as_ptr()
    }

    /// Append raw bytes.
    pub fn emit(&mut self, bytes: &[u8]) -> Result<(), BackendError> {
        self.ensure_capacity(bytes.len())?;

        // SAFETY: capacity was just ensured; the region is writable.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.map.ptr.as_ptr().add(self.len), bytes.len());
        }
        self.len += bytes.len();
        Ok(())
    }

    /// Append one byte.
    pub fn emit8(&mut self, value: u8) -> Result<(), BackendError> {
        self.emit(&[value])
    }

    /// Append a little-endian u16.
    pub fn emit16(&mut self, value: u16) -> Result<(), BackendError> {
        self.emit(&value.to_le_bytes())
    }

    /// Append a little-endian u32.
    pub fn emit32(&mut self, value: u32) -> Result<(), BackendError> {
        self.emit(&value.to_le_bytes())
    }

    /// Append a little-endian u64.
    pub fn emit64(&mut self, value: u64) -> Result<(), BackendError> {
        self.emit(&value.to_le_bytes())
    }

    /// Pad with `fill` until the position is `align`-byte aligned.
    pub fn align_with(&mut self, align: usize, fill: u8) -> Result<(), BackendError> {
        while self.len % align != 0 {
            self.emit8(fill)?;
        }
        Ok(())
    }

    /// Overwrite four bytes at `pos` (local fixups while still writable).
    pub fn patch32(&mut self, pos: usize, value: u32) {
        assert!(pos + 4 <= self.len, "patch outside emitted code");

        // SAFETY: within the emitted range, region still read-write.
        unsafe {
            ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), self.map.ptr.as_ptr().add(pos), 4);
        }
    }

    /// Trim the allocation to fit and make the region executable. After
    /// this the code may be published to other threads.
    pub fn finalise(mut self) -> Result<ExecBuffer, BackendError> {
        self.map.trim(self.len);
        self.map.protect(libc::PROT_READ | libc::PROT_EXEC)?;

        Ok(ExecBuffer {
            map: self.map,
            len: self.len,
        })
    }

    fn ensure_capacity(&mut self, extra: usize) -> Result<(), BackendError> {
        if self.len + extra <= self.map.capacity {
            return Ok(());
        }

        let mut capacity = self.map.capacity.max(1);
        while self.len + extra > capacity {
            capacity *= 2;
        }

        let grown = Mapping::new(capacity)?;
        // SAFETY: both regions are at least `len` bytes and disjoint.
        unsafe {
            ptr::copy_nonoverlapping(self.map.ptr.as_ptr(), grown.ptr.as_ptr(), self.len);
        }
        self.map = grown;
        Ok(())
    }
}

/// Finalised, executable machine code. Dropping unmaps it; the cache
/// keeps translations alive (reference counted) until no invocation can
/// still be inside.
#[derive(Debug)]
pub struct ExecBuffer {
    map: Mapping,
    len: usize,
}

impl ExecBuffer {
    /// Entry address of the code.
    pub fn ptr(&self) -> *const u8 {
        self.map.ptr.as_ptr()
    }

    /// Code size in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// `true` when no code was emitted.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of `offset` inside the buffer.
    pub fn addr_of(&self, offset: usize) -> usize {
        self.map.ptr.as_ptr() as usize + offset
    }

    pub(crate) fn make_writable(&self) -> Result<(), BackendError> {
        // Execute permission is kept so concurrent invocations never
        // fault; only the write bit toggles.
        self.map
            .protect(libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)
    }

    pub(crate) fn make_executable(&self) -> Result<(), BackendError> {
        self.map.protect(libc::PROT_READ | libc::PROT_EXEC)
    }
}

/// Rewrites a bounded slot inside finalised code, for chaining.
///
/// The displacement store is a single naturally-aligned atomic write, so
/// remote threads observe either the old or the new target, never a torn
/// instruction.
#[derive(Debug)]
pub struct ChainWriter<'a> {
    buffer: &'a ExecBuffer,
    offset: usize,
    size: usize,
}

impl<'a> ChainWriter<'a> {
    /// Bind to a slot of `size` bytes at `offset`.
    pub fn new(buffer: &'a ExecBuffer, offset: usize, size: usize) -> Result<Self, BackendError> {
        if offset + size > buffer.len() {
            return Err(BackendError::ChainOverflow {
                size: buffer.len().saturating_sub(offset),
                needed: size,
            });
        }

        Ok(Self { buffer, offset, size })
    }

    /// Atomically replace the 4-byte field at the start of the slot.
    pub fn patch32(&mut self, value: u32) -> Result<(), BackendError> {
        if self.size < 4 {
            return Err(BackendError::ChainOverflow {
                size: self.size,
                needed: 4,
            });
        }

        let addr = self.buffer.addr_of(self.offset);
        if addr % 4 != 0 {
            return Err(BackendError::MisalignedPatch {
                offset: self.offset,
                align: 4,
            });
        }

        self.buffer.make_writable()?;

        // SAFETY: in-bounds, 4-byte aligned, and the store is atomic so
        // concurrent executors read old or new bytes only.
        unsafe {
            (*(addr as *const AtomicU32)).store(value, Ordering::SeqCst);
        }

        self.buffer.make_executable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_little_endian() {
        let mut w = CodeWriter::with_capacity(16).unwrap();
        w.emit8(0xc3).unwrap();
        w.emit32(0x1122_3344).unwrap();

        assert_eq!(w.pos(), 5);
        // SAFETY: reading back our own RW mapping.
        let bytes = unsafe { std::slice::from_raw_parts(w.ptr(), 5) };
        assert_eq!(bytes, &[0xc3, 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut w = CodeWriter::with_capacity(1).unwrap();
        for i in 0..page_size() * 2 {
            w.emit8(i as u8).unwrap();
        }
        assert_eq!(w.pos(), page_size() * 2);
    }

    #[test]
    fn finalise_keeps_contents() {
        let mut w = CodeWriter::with_capacity(64).unwrap();
        w.emit(&[1, 2, 3, 4]).unwrap();
        let buf = w.finalise().unwrap();

        assert_eq!(buf.len(), 4);
        // SAFETY: the buffer stays readable after finalise.
        let bytes = unsafe { std::slice::from_raw_parts(buf.ptr(), 4) };
        assert_eq!(bytes, &[1, 2, 3, 4]);
    }

    #[test]
    fn chain_writer_respects_slot_bounds() {
        let mut w = CodeWriter::with_capacity(64).unwrap();
        w.emit(&[0u8; 16]).unwrap();
        let buf = w.finalise().unwrap();

        assert!(ChainWriter::new(&buf, 12, 8).is_err());
        let mut cw = ChainWriter::new(&buf, 4, 4).unwrap();
        cw.patch32(0xdead_beef).unwrap();

        // SAFETY: the buffer stays readable.
        let bytes = unsafe { std::slice::from_raw_parts(buf.ptr(), 16) };
        assert_eq!(&bytes[4..8], &0xdead_beefu32.to_le_bytes());
    }

    #[test]
    fn chain_writer_rejects_short_slot() {
        let mut w = CodeWriter::with_capacity(64).unwrap();
        w.emit(&[0u8; 8]).unwrap();
        let buf = w.finalise().unwrap();

        let mut cw = ChainWriter::new(&buf, 4, 2).unwrap();
        assert!(matches!(
            cw.patch32(1).unwrap_err(),
            BackendError::ChainOverflow { needed: 4, .. }
        ));
    }
}

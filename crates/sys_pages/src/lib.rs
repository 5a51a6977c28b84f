//! OS page reservation primitives.
//!
//! This crate is the boundary between an allocator and the operating
//! system's virtual memory: reserve a region, decommit page runs back to
//! the OS, and commit them again before reuse. Decommitted pages keep
//! their address range reserved; reading them after a fresh commit
//! yields zeroed memory on every supported platform.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// A reserved, read-write region of address space.
///
/// The region is returned to the OS when this handle is dropped.
pub struct Reservation {
    inner: os::ReservationInner,
}

impl Reservation {
    /// Reserves `len` bytes of zeroed, committed, read-write memory.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error when the reservation fails, and
    /// `InvalidInput` when `len` is zero.
    pub fn reserve(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        Ok(Self {
            inner: os::ReservationInner::reserve(len)?,
        })
    }

    /// Returns a pointer to the start of the region.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the region is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Releases the physical pages behind `[offset, offset + len)` back
    /// to the OS while keeping the address range reserved.
    ///
    /// The range must lie within the reservation and be aligned to the
    /// system page size. The memory must not be read again before a
    /// matching [`commit`](Self::commit).
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error; `InvalidInput` when the range is
    /// out of bounds.
    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        self.inner.decommit(offset, len)
    }

    /// Makes `[offset, offset + len)` usable again after a decommit.
    ///
    /// On Unix this is a no-op: the first touch after `madvise` faults
    /// fresh zero pages in. On Windows the pages are explicitly
    /// re-committed.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error; `InvalidInput` when the range is
    /// out of bounds.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        self.inner.commit(offset, len)
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let end = offset.checked_add(len);
        if end.is_none_or(|end| end > self.inner.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range outside reservation",
            ));
        }
        Ok(())
    }
}

// SAFETY: the region is plain anonymous memory; the handle carries no
// thread-affine state.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

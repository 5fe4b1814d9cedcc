use crate::errors::RuntimeError;
use crate::utils::usize_is_multiple_of_host_page_size;
use core::ops::Range;
use core::ptr::NonNull;
use core::{ptr, slice};
use rustix::mm::{MprotectFlags, ProtFlags};

/// A reserve-then-commit virtual memory mapping.
///
/// The full span is reserved inaccessible up front; pages become readable
/// and writable only as they are committed. Dropping unmaps everything.
#[derive(Debug)]
pub struct Mmap {
    memory: NonNull<[u8]>,
}

// The mapping is plain anonymous memory; thread affinity is enforced by
// the owning runtime, not by the mapping itself.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    pub fn new_empty() -> Self {
        Self {
            memory: NonNull::from(&mut []),
        }
    }

    /// Reserve `size` bytes of inaccessible address space.
    pub fn reserve(size: usize) -> Result<Self, RuntimeError> {
        assert!(usize_is_multiple_of_host_page_size(size));
        // SAFETY: anonymous PROT_NONE reservation, address chosen by the OS.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                size,
                ProtFlags::empty(),
                rustix::mm::MapFlags::PRIVATE,
            )
        }
        .map_err(|_| RuntimeError::VirtualMemoryExhausted)?;
        // SAFETY: mmap returned `size` bytes at `ptr`.
        let memory = unsafe { slice::from_raw_parts_mut(ptr.cast(), size) };
        Ok(Self {
            memory: NonNull::new(memory).unwrap(),
        })
    }

    /// Reserve and immediately commit (read+write) the whole span.
    pub fn new_committed(size: usize) -> Result<Self, RuntimeError> {
        let mut mmap = Self::reserve(size)?;
        mmap.commit(0..size)?;
        Ok(mmap)
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.memory.as_ptr().cast()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.memory.as_ptr().cast()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.as_ptr() as usize;
        addr >= base && addr < base + self.len()
    }

    /// Make `range` readable and writable.
    pub fn commit(&mut self, range: Range<usize>) -> Result<(), RuntimeError> {
        self.protect(range, MprotectFlags::READ | MprotectFlags::WRITE)
    }

    /// Return `range` to the inaccessible reserved state and drop the
    /// backing pages.
    pub fn uncommit(&mut self, range: Range<usize>) -> Result<(), RuntimeError> {
        if range.is_empty() {
            return Ok(());
        }
        self.check_range(&range);
        // SAFETY: range-checked above; MAP_FIXED over our own reservation
        // replaces the committed pages with fresh inaccessible ones.
        unsafe {
            rustix::mm::mmap_anonymous(
                self.memory.as_ptr().cast::<u8>().add(range.start).cast(),
                range.end - range.start,
                ProtFlags::empty(),
                rustix::mm::MapFlags::PRIVATE | rustix::mm::MapFlags::FIXED,
            )
        }
        .map_err(|_| RuntimeError::VirtualMemoryExhausted)?;
        Ok(())
    }

    /// Map `range` read+execute.
    pub fn make_executable(&mut self, range: Range<usize>) -> Result<(), RuntimeError> {
        self.protect(range, MprotectFlags::READ | MprotectFlags::EXEC)
    }

    fn check_range(&self, range: &Range<usize>) {
        assert!(range.start <= range.end);
        assert!(range.end <= self.len());
        assert!(usize_is_multiple_of_host_page_size(range.start));
    }

    fn protect(&mut self, range: Range<usize>, flags: MprotectFlags) -> Result<(), RuntimeError> {
        if range.is_empty() {
            return Ok(());
        }
        self.check_range(&range);
        // SAFETY: range-checked against our own mapping.
        unsafe {
            rustix::mm::mprotect(
                self.memory.as_ptr().cast::<u8>().add(range.start).cast(),
                range.end - range.start,
                flags,
            )
        }
        .map_err(|_| RuntimeError::VirtualMemoryExhausted)?;
        Ok(())
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        let len = self.len();
        if len == 0 {
            return;
        }
        // SAFETY: this mapping owns [ptr, ptr+len).
        unsafe {
            rustix::mm::munmap(self.memory.as_ptr().cast(), len).expect("munmap failed");
        }
    }
}

/// Flush the instruction cache for freshly written code.
///
/// x86 keeps its instruction cache coherent so this is a no-op there;
/// aarch64 needs the clean/invalidate dance per cache line.
pub fn flush_icache(range: Range<*const u8>) {
    #[cfg(target_arch = "aarch64")]
    {
        const LINE: usize = 64;
        let start = range.start as usize & !(LINE - 1);
        let end = range.end as usize;
        // SAFETY: cache maintenance over a mapped range.
        unsafe {
            let mut addr = start;
            while addr < end {
                core::arch::asm!("dc cvau, {}", in(reg) addr, options(nostack, preserves_flags));
                addr += LINE;
            }
            core::arch::asm!("dsb ish", options(nostack, preserves_flags));
            let mut addr = start;
            while addr < end {
                core::arch::asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags));
                addr += LINE;
            }
            core::arch::asm!("dsb ish", "isb", options(nostack, preserves_flags));
        }
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = range;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_page_size;

    #[test]
    fn reserve_commit_uncommit() {
        let page = host_page_size();
        let mut mmap = Mmap::reserve(4 * page).unwrap();
        mmap.commit(0..page).unwrap();
        // SAFETY: first page just committed rw.
        unsafe {
            *mmap.as_mut_ptr() = 0xAB;
            assert_eq!(*mmap.as_ptr(), 0xAB);
        }
        mmap.uncommit(0..page).unwrap();
        mmap.commit(0..page).unwrap();
        // Fresh pages after uncommit read as zero.
        // SAFETY: recommitted rw above.
        unsafe {
            assert_eq!(*mmap.as_ptr(), 0);
        }
    }
}

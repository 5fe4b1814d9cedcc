use crate::errors::RuntimeError;
use crate::runtime::mmap::Mmap;
use crate::utils::{round_u64_down_to_host_pages, round_usize_up_to_host_pages};
use crate::{MAX_LINEAR_MEMORY_SIZE, OFFSET_GUARD_SIZE, WASM_PAGE_SIZE};
use core::sync::atomic::{AtomicU64, Ordering};

/// Allocator of wasm linear memory under passive protection.
///
/// One reservation covers the link-data region ("basedata"), the full
/// 4 GiB linear-memory span and the trailing offset-guard region. Only the
/// basedata (plus, with eager allocation, the declared initial pages) is
/// committed up front; everything else stays inaccessible so any stray
/// access faults deterministically. Pages are committed lazily by
/// [`LinearMemoryAllocator::probe`] from the fault handler.
#[derive(Debug)]
pub struct LinearMemoryAllocator {
    mmap: Mmap,
    paged_basedata_size: usize,
    /// Wasm-visible size in pages; grows with `memory.grow`.
    linmem_pages: u32,
    /// Committed bytes from the start of the reservation.
    committed: usize,
    /// Paged upper bound on committed bytes, settable from any thread.
    memory_limit: AtomicU64,
    max_desired_on_fail: AtomicU64,
    /// Serializes resize against concurrent limit changes (§5: the only
    /// lock in the core).
    resize_lock: spin::Mutex<()>,
}

impl LinearMemoryAllocator {
    /// Reserve the full span and commit the basedata (and, when eager, the
    /// initial pages).
    pub fn init(
        basedata_size: u32,
        initial_pages: u32,
        eager: bool,
    ) -> Result<Self, RuntimeError> {
        let paged_basedata_size = round_usize_up_to_host_pages(basedata_size as usize);
        let total =
            paged_basedata_size + MAX_LINEAR_MEMORY_SIZE as usize + OFFSET_GUARD_SIZE as usize;
        let mmap = Mmap::reserve(total)?;
        let mut allocator = Self {
            mmap,
            paged_basedata_size,
            linmem_pages: initial_pages,
            committed: 0,
            memory_limit: AtomicU64::new(u64::MAX),
            max_desired_on_fail: AtomicU64::new(0),
            resize_lock: spin::Mutex::new(()),
        };
        let initial_commit = if eager {
            paged_basedata_size + initial_pages as usize * WASM_PAGE_SIZE as usize
        } else {
            paged_basedata_size
        };
        if !allocator.commit_to(initial_commit)? {
            return Err(RuntimeError::VirtualMemoryExhausted);
        }
        Ok(allocator)
    }

    pub fn link_data_base(&mut self) -> *mut u8 {
        // The basedata occupies the start of the reservation; both it and
        // the linear memory that follows are page aligned, so every
        // 8-byte link-data slot is naturally aligned.
        self.mmap.as_mut_ptr()
    }

    pub fn link_data_base_const(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn linmem_base(&self) -> *const u8 {
        // SAFETY: inside our own reservation.
        unsafe { self.mmap.as_ptr().add(self.paged_basedata_size) }
    }

    pub fn linmem_pages(&self) -> u32 {
        self.linmem_pages
    }

    pub fn linmem_size_bytes(&self) -> u64 {
        u64::from(self.linmem_pages) * u64::from(WASM_PAGE_SIZE)
    }

    /// Total committed bytes (basedata included).
    pub fn memory_usage(&self) -> u64 {
        self.committed as u64
    }

    pub fn max_desired_ram_on_extend_failure(&self) -> u64 {
        self.max_desired_on_fail.load(Ordering::Relaxed)
    }

    /// Grow the wasm-visible size. Under lazy allocation this only
    /// publishes the new size; pages fault in on first access.
    pub fn extend(&mut self, new_total_pages: u32, eager: bool) -> bool {
        self.linmem_pages = new_total_pages;
        if eager {
            let target =
                self.paged_basedata_size + new_total_pages as usize * WASM_PAGE_SIZE as usize;
            return self.commit_to(target).unwrap_or(false);
        }
        true
    }

    /// Uncommit trailing pages down to `minimum_length` bytes of linear
    /// memory. The only way committed size decreases.
    pub fn shrink(&mut self, minimum_length: u32) -> bool {
        let _guard = self.resize_lock.lock();
        let keep = self.paged_basedata_size
            + round_usize_up_to_host_pages(minimum_length as usize);
        if keep >= self.committed {
            return false;
        }
        if self.mmap.uncommit(keep..self.committed).is_err() {
            return false;
        }
        self.committed = keep;
        true
    }

    /// Called from the fault handler for an access at `linmem_offset`:
    /// commit the page when it lies below the wasm-visible size, report
    /// out-of-bounds otherwise.
    pub fn probe(&mut self, linmem_offset: u64) -> ProbeResult {
        if linmem_offset < self.linmem_size_bytes() {
            let target = self.paged_basedata_size
                + round_usize_up_to_host_pages(linmem_offset as usize + 1);
            match self.commit_to(target) {
                Ok(true) => ProbeResult::Committed,
                Ok(false) | Err(_) => ProbeResult::CouldNotExtend,
            }
        } else {
            ProbeResult::OutOfBounds
        }
    }

    /// Atomically set the commit limit; fails when already above it.
    pub fn set_memory_limit(&self, limit: u64) -> Result<(), RuntimeError> {
        let paged = round_u64_down_to_host_pages(limit);
        let _guard = self.resize_lock.lock();
        if self.memory_usage() > paged {
            return Err(RuntimeError::LimitTooLowMemoryAlreadyInUse);
        }
        self.memory_limit.store(paged, Ordering::SeqCst);
        Ok(())
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit.load(Ordering::SeqCst)
    }

    /// Commit up to `new_paged_size` bytes. Monotone: never decreases.
    fn commit_to(&mut self, new_paged_size: usize) -> Result<bool, RuntimeError> {
        let _guard = self.resize_lock.lock();
        if new_paged_size <= self.committed {
            return Ok(true);
        }
        if new_paged_size as u64 > self.memory_limit.load(Ordering::SeqCst) {
            self.max_desired_on_fail
                .store(new_paged_size as u64, Ordering::Relaxed);
            return Ok(false);
        }
        self.mmap.commit(self.committed..new_paged_size)?;
        self.committed = new_paged_size;
        Ok(true)
    }

    /// Classify a faulting address against the reservation.
    pub fn classify_fault(&self, addr: usize) -> FaultClass {
        let base = self.linmem_base() as usize;
        let reservation_end =
            base + MAX_LINEAR_MEMORY_SIZE as usize + OFFSET_GUARD_SIZE as usize;
        if addr < base || addr >= reservation_end {
            return FaultClass::Outside;
        }
        FaultClass::LinearMemory {
            offset: (addr - base) as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Committed,
    CouldNotExtend,
    OutOfBounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    Outside,
    LinearMemory { offset: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_is_monotone_and_shrink_releases() {
        let mut alloc = LinearMemoryAllocator::init(4096, 4, false).unwrap();
        assert_eq!(alloc.probe(0), ProbeResult::Committed);
        let used = alloc.memory_usage();
        // A smaller probe never decreases the committed size.
        assert_eq!(alloc.probe(0), ProbeResult::Committed);
        assert_eq!(alloc.memory_usage(), used);
        assert_eq!(alloc.probe(3 * 65536), ProbeResult::Committed);
        assert!(alloc.memory_usage() > used);
        assert!(alloc.shrink(0));
        assert!(!alloc.shrink(0));
    }

    #[test]
    fn probe_past_declared_size_is_out_of_bounds() {
        let mut alloc = LinearMemoryAllocator::init(4096, 1, false).unwrap();
        assert_eq!(alloc.probe(65535), ProbeResult::Committed);
        assert_eq!(alloc.probe(65536), ProbeResult::OutOfBounds);
        assert!(alloc.extend(2, false));
        assert_eq!(alloc.probe(65536), ProbeResult::Committed);
    }

    #[test]
    fn limit_gates_the_commit() {
        let mut alloc = LinearMemoryAllocator::init(4096, 100, false).unwrap();
        let page = crate::host_page_size() as u64;
        alloc.set_memory_limit(alloc.memory_usage() + page).unwrap();
        assert_eq!(alloc.probe(0), ProbeResult::Committed);
        assert_eq!(alloc.probe(10 * 65536), ProbeResult::CouldNotExtend);
        assert!(alloc.max_desired_ram_on_extend_failure() > 0);
        // Lowering below current usage is rejected.
        assert!(alloc.set_memory_limit(0).is_err());
    }
}

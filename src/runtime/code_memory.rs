use crate::errors::RuntimeError;
use crate::runtime::mmap::{flush_icache, Mmap};
use crate::utils::round_usize_up_to_host_pages;

/// The frozen image copied into an executable mapping.
///
/// The whole image is mapped read+execute once published: function bodies,
/// wrappers embedded in the metadata sections and the landing pad all stay
/// addressable at their image offsets.
#[derive(Debug)]
pub struct CodeMemory {
    mmap: Mmap,
    len: usize,
    published: bool,
}

impl CodeMemory {
    pub fn from_image(image: &[u8]) -> Result<Self, RuntimeError> {
        let size = round_usize_up_to_host_pages(image.len().max(1));
        let mut mmap = Mmap::new_committed(size)?;
        // SAFETY: freshly committed rw mapping of at least image.len().
        unsafe {
            core::ptr::copy_nonoverlapping(image.as_ptr(), mmap.as_mut_ptr(), image.len());
        }
        Ok(Self {
            mmap,
            len: image.len(),
            published: false,
        })
    }

    /// Switch the mapping to read+execute and flush the icache.
    pub fn publish(&mut self) -> Result<(), RuntimeError> {
        debug_assert!(!self.published);
        let size = self.mmap.len();
        self.mmap.make_executable(0..size)?;
        let base = self.base();
        flush_icache(base..base.wrapping_add(self.len));
        self.published = true;
        Ok(())
    }

    pub fn base(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base() as usize;
        addr >= base && addr < base + self.len
    }

    /// Absolute address of an image offset.
    pub fn addr_of(&self, offset: u32) -> usize {
        debug_assert!((offset as usize) < self.len);
        self.base() as usize + offset as usize
    }
}

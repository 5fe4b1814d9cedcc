/// Discovery of the current thread's stack extent for the stack fence and
/// the fault handler's red-zone classification.
#[derive(Debug, Clone, Copy)]
pub struct StackInfo {
    /// Lowest valid stack address (the stack grows toward this).
    pub stack_top: usize,
    /// Highest stack address.
    pub stack_base: usize,
}

#[cfg(target_os = "linux")]
pub fn current_thread_stack() -> Option<StackInfo> {
    // SAFETY: plain pthread attribute queries on the current thread.
    unsafe {
        let mut attr: libc::pthread_attr_t = core::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = core::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return None;
        }
        Some(StackInfo {
            stack_top: addr as usize,
            stack_base: addr as usize + size,
        })
    }
}

#[cfg(target_os = "macos")]
pub fn current_thread_stack() -> Option<StackInfo> {
    // SAFETY: pthread queries on the current thread.
    unsafe {
        let thread = libc::pthread_self();
        let base = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        Some(StackInfo {
            stack_top: base - size,
            stack_base: base,
        })
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn current_thread_stack() -> Option<StackInfo> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_stack_contains_a_local() {
        let local = 0u8;
        let info = current_thread_stack().unwrap();
        let addr = &local as *const u8 as usize;
        assert!(addr > info.stack_top && addr < info.stack_base);
    }
}

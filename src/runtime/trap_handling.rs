use crate::traps::TrapCode;
use core::cell::Cell;

/// Everything the fault layer needs to know about the runtime currently
/// executing wasm on this thread. Installed by `start`/`call_exported`
/// around every entry and cleared on exit; only one runtime executes on a
/// given thread at a time.
#[derive(Debug, Clone, Copy)]
pub struct ActiveRuntime {
    /// The owning `RuntimeInner`, passed back to host helpers.
    pub runtime: *mut (),
    /// Absolute address of the module's generic trap entry.
    pub trap_entry: usize,
    pub linmem_base: usize,
    pub code_base: usize,
    pub code_len: usize,
    /// Absolute address of the landing pad, when the module has one.
    pub landing_pad: usize,
    pub link_data: *mut u8,
    /// Stack addresses below this are the red zone.
    pub stack_fence: usize,
    /// Lowest plausible stack address for red-zone classification.
    pub stack_floor: usize,
}

std::thread_local! {
    static ACTIVE: Cell<Option<ActiveRuntime>> = const { Cell::new(None) };
}

/// RAII installation of the per-thread active-runtime pointer; restores
/// the previous value so host→wasm→host→wasm nesting unwinds correctly.
pub struct ActiveRuntimeGuard {
    prev: Option<ActiveRuntime>,
}

impl ActiveRuntimeGuard {
    pub fn install(active: ActiveRuntime) -> Self {
        let prev = ACTIVE.with(|cell| cell.replace(Some(active)));
        Self { prev }
    }
}

impl Drop for ActiveRuntimeGuard {
    fn drop(&mut self) {
        ACTIVE.with(|cell| cell.set(self.prev));
    }
}

/// Snapshot of the active runtime, if any. Also read from the signal
/// handler; the cell is const-initialized so the read is just a TLS load.
pub fn active() -> Option<ActiveRuntime> {
    ACTIVE.with(|cell| cell.get())
}

/// Raise a wasm trap from host code called by the running module (builtin
/// functions, softfloat trunc helpers).
///
/// Control transfers into the module's generic trap entry, which abandons
/// the wasm stack and lands on the innermost export wrapper's recovery
/// path. The Rust frames between the wasm callsite and here are skipped
/// without unwinding, so callers must not hold live destructors.
pub fn raise_trap_from_host(code: TrapCode) -> ! {
    let active = active().expect("trap raised with no active runtime");
    // SAFETY: trap_entry points at the module's emitted trap entry, which
    // has the documented (linmem_base, code) signature and never returns.
    unsafe {
        let entry: extern "C" fn(usize, u32) -> ! = core::mem::transmute(active.trap_entry);
        entry(active.linmem_base, code.as_u32())
    }
}

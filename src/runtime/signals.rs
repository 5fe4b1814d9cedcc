//! The fault layer: converts synchronous hardware faults raised inside
//! wasm code into wasm traps, implements lazy commit of linear memory and
//! cheap stack-overflow detection.
//!
//! Handlers are pushed with an RAII guard around every wasm entry
//! (reference-counted per thread, so nested entries install once) and run
//! on an alternate stack. A fault whose program counter is outside the
//! active runtime's code region chains to the previously installed
//! handler — wasm must never mask host crashes.

use crate::runtime::link_data::offsets as ld;
use crate::runtime::trap_handling::{active, ActiveRuntime};
use crate::traps::TrapCode;
use core::cell::{Cell, UnsafeCell};
use core::mem::MaybeUninit;
use core::ptr;

const SIGNALS: [i32; 3] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGFPE];

struct PrevActions(UnsafeCell<[MaybeUninit<libc::sigaction>; 3]>);
// SAFETY: written only under the install lock before any handler can run,
// read-only afterwards.
unsafe impl Sync for PrevActions {}

static PREV: PrevActions = PrevActions(UnsafeCell::new(
    [MaybeUninit::uninit(), MaybeUninit::uninit(), MaybeUninit::uninit()],
));
static INSTALL_LOCK: spin::Mutex<u32> = spin::Mutex::new(0);

std::thread_local! {
    static ALT_STACK: Cell<*mut u8> = const { Cell::new(ptr::null_mut()) };
}

const ALT_STACK_SIZE: usize = 64 * 1024;

/// RAII push of the fault handlers around one wasm entry.
pub struct SignalGuard {
    _private: (),
}

impl SignalGuard {
    pub fn install() -> Self {
        install_alt_stack();
        let mut count = INSTALL_LOCK.lock();
        if *count == 0 {
            // SAFETY: standard sigaction installation; previous actions
            // are saved for chaining and uninstall.
            unsafe {
                for (i, sig) in SIGNALS.iter().enumerate() {
                    let mut action: libc::sigaction = core::mem::zeroed();
                    action.sa_sigaction = fault_handler as usize;
                    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
                    libc::sigemptyset(&mut action.sa_mask);
                    let prev = (*PREV.0.get())[i].as_mut_ptr();
                    libc::sigaction(*sig, &action, prev);
                }
            }
        }
        *count += 1;
        Self { _private: () }
    }

    /// Leak an installation so the handlers stay resident for the process
    /// lifetime ("persistent" mode).
    pub fn install_persistent() {
        core::mem::forget(Self::install());
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        let mut count = INSTALL_LOCK.lock();
        *count -= 1;
        if *count == 0 {
            // SAFETY: restore the saved actions; symmetric with install.
            unsafe {
                for (i, sig) in SIGNALS.iter().enumerate() {
                    let prev = (*PREV.0.get())[i].as_ptr();
                    libc::sigaction(*sig, prev, ptr::null_mut());
                }
            }
        }
    }
}

/// Signal handlers run on their own stack so passive stack-overflow
/// detection has room to work. Allocated once per thread and kept for the
/// thread's lifetime.
fn install_alt_stack() {
    ALT_STACK.with(|slot| {
        if !slot.get().is_null() {
            return;
        }
        // SAFETY: fresh allocation handed to sigaltstack.
        unsafe {
            let stack = libc::malloc(ALT_STACK_SIZE);
            assert!(!stack.is_null(), "alternate signal stack allocation failed");
            let ss = libc::stack_t {
                ss_sp: stack,
                ss_flags: 0,
                ss_size: ALT_STACK_SIZE,
            };
            libc::sigaltstack(&ss, ptr::null_mut());
            slot.set(stack.cast());
        }
    });
}

/// Saved-context accessors, per platform.
struct Context {
    uc: *mut libc::c_void,
}

impl Context {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn pc(&self) -> usize {
        // SAFETY: the kernel hands a valid ucontext to SA_SIGINFO handlers.
        unsafe {
            let uc = self.uc.cast::<libc::ucontext_t>();
            (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as usize
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn redirect_to_trap(&mut self, active: &ActiveRuntime, code: TrapCode) {
        // Rewrite the context so returning from the handler enters the
        // trap entry with (linmem_base, code) in the argument registers.
        // SAFETY: see `pc`.
        unsafe {
            let uc = self.uc.cast::<libc::ucontext_t>();
            let gregs = &mut (*uc).uc_mcontext.gregs;
            gregs[libc::REG_RDI as usize] = active.linmem_base as i64;
            gregs[libc::REG_RSI as usize] = code.as_u32() as i64;
            gregs[libc::REG_RIP as usize] = active.trap_entry as i64;
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn redirect_to_landing_pad(&mut self, active: &ActiveRuntime) {
        // Push the faulting pc as the return address so the landing pad's
        // `ret` retries the faulting instruction after the probe commits.
        // SAFETY: see `pc`; the wasm stack has guard-free room for one slot.
        unsafe {
            let uc = self.uc.cast::<libc::ucontext_t>();
            let gregs = &mut (*uc).uc_mcontext.gregs;
            let mut sp = gregs[libc::REG_RSP as usize] as usize;
            sp -= 8;
            *(sp as *mut usize) = gregs[libc::REG_RIP as usize] as usize;
            gregs[libc::REG_RSP as usize] = sp as i64;
            gregs[libc::REG_RIP as usize] = active.landing_pad as i64;
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    fn pc(&self) -> usize {
        // SAFETY: valid ucontext from the kernel.
        unsafe {
            let uc = self.uc.cast::<libc::ucontext_t>();
            (*uc).uc_mcontext.pc as usize
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    fn redirect_to_trap(&mut self, active: &ActiveRuntime, code: TrapCode) {
        // SAFETY: see `pc`.
        unsafe {
            let uc = self.uc.cast::<libc::ucontext_t>();
            (*uc).uc_mcontext.regs[0] = active.linmem_base as u64;
            (*uc).uc_mcontext.regs[1] = code.as_u32() as u64;
            (*uc).uc_mcontext.pc = active.trap_entry as u64;
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    fn redirect_to_landing_pad(&mut self, active: &ActiveRuntime) {
        // The faulting pc goes to the link register; the landing pad
        // returns through it to retry.
        // SAFETY: see `pc`.
        unsafe {
            let uc = self.uc.cast::<libc::ucontext_t>();
            (*uc).uc_mcontext.regs[30] = (*uc).uc_mcontext.pc;
            (*uc).uc_mcontext.pc = active.landing_pad as u64;
        }
    }

    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    fn pc(&self) -> usize {
        // SAFETY: valid ucontext from the kernel.
        unsafe {
            let uc = self.uc.cast::<libc::ucontext_t>();
            (*(*uc).uc_mcontext).__ss.__rip as usize
        }
    }

    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    fn redirect_to_trap(&mut self, active: &ActiveRuntime, code: TrapCode) {
        // SAFETY: see `pc`.
        unsafe {
            let uc = self.uc.cast::<libc::ucontext_t>();
            let ss = &mut (*(*uc).uc_mcontext).__ss;
            ss.__rdi = active.linmem_base as u64;
            ss.__rsi = code.as_u32() as u64;
            ss.__rip = active.trap_entry as u64;
        }
    }

    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    fn redirect_to_landing_pad(&mut self, active: &ActiveRuntime) {
        // SAFETY: see `pc`.
        unsafe {
            let uc = self.uc.cast::<libc::ucontext_t>();
            let ss = &mut (*(*uc).uc_mcontext).__ss;
            let mut sp = ss.__rsp as usize;
            sp -= 8;
            *(sp as *mut usize) = ss.__rip as usize;
            ss.__rsp = sp as u64;
            ss.__rip = active.landing_pad as u64;
        }
    }

    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    fn pc(&self) -> usize {
        // SAFETY: valid ucontext from the kernel.
        unsafe {
            let uc = self.uc.cast::<libc::ucontext_t>();
            (*(*uc).uc_mcontext).__ss.__pc as usize
        }
    }

    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    fn redirect_to_trap(&mut self, active: &ActiveRuntime, code: TrapCode) {
        // SAFETY: see `pc`.
        unsafe {
            let uc = self.uc.cast::<libc::ucontext_t>();
            let ss = &mut (*(*uc).uc_mcontext).__ss;
            ss.__x[0] = active.linmem_base as u64;
            ss.__x[1] = code.as_u32() as u64;
            ss.__pc = active.trap_entry as u64;
        }
    }

    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    fn redirect_to_landing_pad(&mut self, active: &ActiveRuntime) {
        // SAFETY: see `pc`.
        unsafe {
            let uc = self.uc.cast::<libc::ucontext_t>();
            let ss = &mut (*(*uc).uc_mcontext).__ss;
            ss.__lr = ss.__pc;
            ss.__pc = active.landing_pad as u64;
        }
    }
}

/// The handler itself. Classification is total: every path ends in a
/// landing-pad resume, a trap redirect, or a chain to the previous
/// handler.
extern "C" fn fault_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    let Some(active) = active() else {
        chain_to_previous(sig, info, uc);
        return;
    };
    let mut context = Context { uc };
    let pc = context.pc();
    if pc < active.code_base || pc >= active.code_base + active.code_len {
        // Not our code: never mask host crashes.
        chain_to_previous(sig, info, uc);
        return;
    }

    if sig == libc::SIGFPE {
        // Division faults; overflow is checked explicitly in emitted code,
        // so a hardware fault is a division by zero.
        context.redirect_to_trap(&active, TrapCode::DivZero);
        return;
    }

    // SAFETY: si_addr is valid for SIGSEGV/SIGBUS.
    let fault_addr = unsafe { (*info).si_addr() } as usize;

    // Stack red zone?
    if fault_addr >= active.stack_floor && fault_addr < active.stack_fence {
        context.redirect_to_trap(&active, TrapCode::StackFenceBreached);
        return;
    }

    // Linear-memory reservation?
    let linmem_span = crate::MAX_LINEAR_MEMORY_SIZE + crate::OFFSET_GUARD_SIZE;
    if fault_addr >= active.linmem_base
        && (fault_addr - active.linmem_base) < linmem_span as usize
    {
        let offset = (fault_addr - active.linmem_base) as u64;
        // SAFETY: the link data region is live for the whole execution.
        let declared = unsafe {
            ptr::read_volatile(active.link_data.add(ld::LINMEM_SIZE as usize).cast::<u64>())
        };
        if offset < declared && active.landing_pad != 0 {
            // Lazy commit: hand the offset to the landing pad, which calls
            // probe and either retries the access or traps.
            // SAFETY: see above.
            unsafe {
                ptr::write_volatile(
                    active.link_data.add(ld::PROBE_OFFSET as usize).cast::<u64>(),
                    offset,
                );
            }
            context.redirect_to_landing_pad(&active);
        } else {
            context.redirect_to_trap(&active, TrapCode::LinmemOutOfBoundsAccess);
        }
        return;
    }

    chain_to_previous(sig, info, uc);
}

/// Forward a foreign fault to whatever was installed before us. When the
/// previous disposition is the default, reinstalling it and returning
/// re-raises the fault with default handling.
fn chain_to_previous(sig: libc::c_int, info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
    let index = SIGNALS.iter().position(|s| *s == sig).unwrap();
    // SAFETY: PREV is written before the handler can fire.
    let prev = unsafe { (*PREV.0.get())[index].assume_init() };
    let handler = prev.sa_sigaction;
    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        // SAFETY: restoring the saved default disposition.
        unsafe {
            libc::sigaction(sig, &prev, ptr::null_mut());
        }
        return;
    }
    if prev.sa_flags & libc::SA_SIGINFO != 0 {
        // SAFETY: calling the previous SA_SIGINFO handler with the same
        // arguments the kernel gave us.
        unsafe {
            let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                core::mem::transmute(handler);
            f(sig, info, uc);
        }
    } else {
        // SAFETY: plain handler signature.
        unsafe {
            let f: extern "C" fn(libc::c_int) = core::mem::transmute(handler);
            f(sig);
        }
    }
}

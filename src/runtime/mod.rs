pub mod builtins;
pub mod code_memory;
pub mod link_data;
pub mod linear_memory;
pub mod mmap;
pub mod signals;
pub mod stack_info;
pub mod stacktrace;
pub mod trap_handling;

pub use trap_handling::raise_trap_from_host;

use crate::binary::{BinaryModule, GlobalValue, NONE_U32, TRAP_ENTRY_OFFSET};
use crate::errors::{CompileError, RuntimeError};
use crate::runtime::code_memory::CodeMemory;
use crate::runtime::link_data::{offsets as ld, table_image_offset_from_total};
use crate::runtime::linear_memory::{LinearMemoryAllocator, ProbeResult};
use crate::runtime::signals::SignalGuard;
use crate::runtime::stacktrace::StacktraceSnapshot;
use crate::runtime::trap_handling::{ActiveRuntime, ActiveRuntimeGuard};
use crate::symbols::{NativeSymbol, ParsedSignature};
use crate::traps::{Trap, TrapCode};
use crate::values::{FromWasmValue, ValType, WasmValue};
use crate::{CompiledBinary, Compiler, CompilerConfig, MAX_WASM_PAGES, STACK_FENCE_MARGIN, WASM_PAGE_SIZE};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};
use smallvec::SmallVec;

/// Failure of a call into the module: either host-side API misuse or a
/// wasm trap carried out of the module. The two planes stay distinct.
#[derive(Debug, onlyerror::Error)]
pub enum CallError {
    #[error("{0}")]
    Runtime(RuntimeError),
    #[error("{0}")]
    Trap(Trap),
}

impl From<RuntimeError> for CallError {
    fn from(e: RuntimeError) -> Self {
        Self::Runtime(e)
    }
}

impl From<Trap> for CallError {
    fn from(t: Trap) -> Self {
        Self::Trap(t)
    }
}

type CallResults = SmallVec<[WasmValue; 2]>;

/// Executes a frozen binary module.
///
/// A runtime exclusively owns its link data and linear memory. It is
/// thread-affine while executing: the fault layer's thread-local pointer
/// is installed on entry to `start`/`call_exported` and cleared on exit,
/// and only one runtime executes on a given thread at a time.
pub struct Runtime {
    inner: Box<RuntimeInner>,
    /// !Send + !Sync: execution is thread-affine by construction.
    _not_send: PhantomData<*mut ()>,
}

pub(crate) struct RuntimeInner {
    binary: BinaryModule,
    code: CodeMemory,
    memory: LinearMemoryAllocator,
    eager: bool,
    linked_memory: Option<Box<[u8]>>,
    raw_debug_map: Option<Vec<u8>>,
}

/// `extern "C"` shape of every export/start/table wrapper.
type WrapperFn = unsafe extern "C" fn(link_data: *mut u8, args: *const u64, results: *mut u64);

impl Runtime {
    /// Convenience compile with the default configuration.
    pub fn compile(bytecode: &[u8], symbols: &[NativeSymbol]) -> crate::Result<CompiledBinary> {
        Compiler::new(CompilerConfig::default()).compile(bytecode, symbols)
    }

    pub fn init_from_compiled(image: &[u8], symbols: &[NativeSymbol]) -> crate::Result<Self> {
        Self::init(image, symbols, None, false)
    }

    /// Init with the raw debug symbol attached (forwarded to debugger
    /// tooling; the runtime itself only stores it).
    pub fn init_from_compiled_with_debug(
        image: &[u8],
        symbols: &[NativeSymbol],
        raw_debug_map: &[u8],
    ) -> crate::Result<Self> {
        Self::init(image, symbols, Some(raw_debug_map.to_vec()), false)
    }

    /// Commit the declared initial pages up front instead of lazily.
    pub fn init_from_compiled_eager(
        image: &[u8],
        symbols: &[NativeSymbol],
    ) -> crate::Result<Self> {
        Self::init(image, symbols, None, true)
    }

    fn init(
        image: &[u8],
        symbols: &[NativeSymbol],
        raw_debug_map: Option<Vec<u8>>,
        eager: bool,
    ) -> crate::Result<Self> {
        if cfg!(feature = "cross-rv32") {
            return Err(crate::wasm_unsupported!(
                "binaries for the cross target cannot execute in-process"
            ));
        }
        let binary = BinaryModule::parse(image)?;
        let code = CodeMemory::from_image(image).map_err(|_| CompileError::OutOfMemory)?;
        let memory = LinearMemoryAllocator::init(
            binary.link_data_size,
            binary.initial_pages.unwrap_or(0),
            eager,
        )
        .map_err(|_| CompileError::OutOfMemory)?;

        let mut runtime = Self {
            inner: Box::new(RuntimeInner {
                binary,
                code,
                memory,
                eager,
                linked_memory: None,
                raw_debug_map,
            }),
            _not_send: PhantomData,
        };
        runtime.fill_link_data(symbols)?;
        runtime.copy_data_segments(image)?;
        runtime
            .inner
            .code
            .publish()
            .map_err(|_| CompileError::OutOfMemory)?;
        tracing::debug!(
            code = runtime.inner.code.len(),
            link_data = runtime.inner.binary.link_data_size,
            "runtime initialized"
        );
        Ok(runtime)
    }

    fn link_ptr(&mut self, offset: u32) -> *mut u8 {
        debug_assert!(offset < self.inner.binary.link_data_size);
        // SAFETY: offset-checked against the committed basedata region.
        unsafe { self.inner.memory.link_data_base().add(offset as usize) }
    }

    fn write_link_u64(&mut self, offset: u32, value: u64) {
        let p = self.link_ptr(offset).cast::<u64>();
        // SAFETY: link data is committed, 8-byte aligned and exclusively
        // owned during init and by the executing thread afterwards.
        unsafe { p.write(value) };
    }

    fn read_link_u64(&self, offset: u32) -> u64 {
        let base = self.inner.memory.link_data_base_const();
        // SAFETY: see `write_link_u64`.
        unsafe { base.add(offset as usize).cast::<u64>().read() }
    }

    fn fill_link_data(&mut self, symbols: &[NativeSymbol]) -> crate::Result<()> {
        let linmem_base = self.inner.memory.linmem_base() as u64;
        let linmem_size = self.inner.memory.linmem_size_bytes();
        let trap_entry = self.inner.code.addr_of(TRAP_ENTRY_OFFSET) as u64;
        let ctx = &mut *self.inner as *mut RuntimeInner as u64;

        self.write_link_u64(ld::LINMEM_BASE, linmem_base);
        self.write_link_u64(ld::LINMEM_SIZE, linmem_size);
        self.write_link_u64(ld::LAST_FRAME, 0);
        self.write_link_u64(ld::RECOVERY_PC, 0);
        self.write_link_u64(ld::TRAP_FN, trap_entry);
        self.write_link_u64(ld::TRAP_CODE, 0);
        self.write_link_u64(ld::INTERRUPT_FLAG, 0);
        self.write_link_u64(ld::RUNTIME_CTX, ctx);
        self.write_link_u64(ld::PROBE_FN, probe_host as usize as u64);
        self.write_link_u64(ld::PROBE_OFFSET, 0);
        self.write_link_u64(ld::MEMORY_GROW_FN, memory_grow_host as usize as u64);
        self.write_link_u64(ld::LINKED_MEM_PTR, 0);
        self.write_link_u64(ld::LINKED_MEM_LEN, 0);
        self.write_link_u64(ld::STACK_FENCE, 0);

        // Mutable globals start from their frozen initial values.
        for (ty, offset, bits) in self.inner.binary.mutable_globals.clone() {
            let _ = ty;
            self.write_link_u64(offset, bits);
        }

        // Resolve the dynamic import slots. The builtin module resolves
        // first so embedders cannot shadow it accidentally.
        let mut builtin_symbols = builtins::native_symbols();
        builtin_symbols.extend_from_slice(symbols);
        let statuses = self.inner.binary.link_status.clone();
        let imports = self.inner.binary.dynamic_imports.clone();
        let mut next_dynamic = 0usize;
        for status in statuses {
            if status == 1 {
                continue; // statically linked at compile time
            }
            let import = imports.get(next_dynamic).ok_or_else(|| {
                CompileError::validation(0, "link status and import records disagree")
            })?;
            next_dynamic += 1;
            let resolved = builtin_symbols
                .iter()
                .find(|s| s.matches(&import.module, &import.name, &import.signature));
            match resolved {
                Some(symbol) => {
                    self.write_link_u64(import.link_offset, symbol.ptr as u64);
                }
                None if status == 0 => {
                    // Compiled under permissive imports: calling the slot
                    // traps instead of failing the init.
                    self.write_link_u64(import.link_offset, not_linked_thunk as usize as u64);
                }
                None => {
                    return Err(CompileError::Linking {
                        module: import.module.clone(),
                        name: import.name.clone(),
                        message: "import not resolved at init".into(),
                    });
                }
            }
        }
        if next_dynamic != imports.len() {
            return Err(CompileError::validation(
                0,
                "link status and import records disagree",
            ));
        }

        // Materialize the indirect-call table image.
        let entries = self.inner.binary.table.clone();
        let table_off = table_image_offset_from_total(
            self.inner.binary.link_data_size,
            entries.len() as u32,
        );
        self.write_link_u64(table_off, entries.len() as u64);
        for (i, (sig, body)) in entries.iter().enumerate() {
            let entry_off = table_off + 8 + 16 * i as u32;
            let addr = if *body == NONE_U32 {
                0
            } else {
                self.inner.code.addr_of(*body) as u64
            };
            self.write_link_u64(entry_off, *sig as u64);
            self.write_link_u64(entry_off + 8, addr);
        }
        Ok(())
    }

    fn copy_data_segments(&mut self, image: &[u8]) -> crate::Result<()> {
        for segment in self.inner.binary.data_segments.clone() {
            if segment.len == 0 {
                continue;
            }
            let end = segment.memory_offset as u64 + segment.len as u64;
            if self.inner.memory.probe(end - 1) != ProbeResult::Committed {
                return Err(CompileError::OutOfMemory);
            }
            let src =
                &image[segment.image_start as usize..(segment.image_start + segment.len) as usize];
            // SAFETY: destination pages just committed, range checked by
            // the compiler against the declared initial size.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    self.inner
                        .memory
                        .linmem_base()
                        .cast_mut()
                        .add(segment.memory_offset as usize),
                    segment.len as usize,
                );
            }
        }
        Ok(())
    }

    // ---- execution ------------------------------------------------------

    pub fn has_exported_function(&self, name: &str) -> bool {
        self.inner.binary.export(name).is_some()
    }

    /// Run the start function, if the module has one.
    pub fn start(&mut self, stack_top: *const u8) -> Result<(), CallError> {
        let Some(start) = self.inner.binary.start.clone() else {
            return Ok(());
        };
        let sig = ParsedSignature::parse(&start.signature)
            .map_err(|_| CallError::Runtime(RuntimeError::CorruptBinary))?;
        self.invoke(start.wrapper_offset, &sig, stack_top, &[])
            .map(|_| ())
    }

    /// Call an exported function by name.
    pub fn call_exported(
        &mut self,
        name: &str,
        stack_top: *const u8,
        args: &[WasmValue],
    ) -> Result<CallResults, CallError> {
        let export = self
            .inner
            .binary
            .export(name)
            .ok_or_else(|| RuntimeError::NoSuchExportedFunction(name.to_string()))?
            .clone();
        let sig = ParsedSignature::parse(&export.signature)
            .map_err(|_| CallError::Runtime(RuntimeError::CorruptBinary))?;
        self.invoke(export.wrapper_offset, &sig, stack_top, args)
    }

    /// Call a function through its table slot. The caller supplies the
    /// expected result types; the wrapper embedded in the frozen binary
    /// carries the argument marshalling.
    pub fn call_by_table_index(
        &mut self,
        index: u32,
        stack_top: *const u8,
        args: &[WasmValue],
        result_types: &[ValType],
    ) -> Result<CallResults, CallError> {
        let wrapper = self
            .inner
            .binary
            .table_wrappers
            .get(index as usize)
            .copied()
            .filter(|w| *w != NONE_U32)
            .ok_or(RuntimeError::TableIndexNotCallable(index))?;
        let sig = ParsedSignature {
            params: args.iter().map(WasmValue::ty).collect(),
            results: result_types.iter().copied().collect(),
        };
        self.invoke(wrapper, &sig, stack_top, args)
    }

    fn invoke(
        &mut self,
        wrapper_offset: u32,
        sig: &ParsedSignature,
        stack_top: *const u8,
        args: &[WasmValue],
    ) -> Result<CallResults, CallError> {
        if args.len() != sig.params.len() {
            return Err(RuntimeError::ArgumentCountMismatch {
                expected: sig.params.len(),
                got: args.len(),
            }
            .into());
        }
        for (index, (arg, expected)) in args.iter().zip(&sig.params).enumerate() {
            if arg.ty() != *expected {
                return Err(RuntimeError::ArgumentTypeMismatch {
                    index,
                    expected: *expected,
                    found: arg.ty(),
                }
                .into());
            }
        }

        let arg_bits: SmallVec<[u64; 8]> = args.iter().map(|a| a.to_bits()).collect();
        let mut result_bits: SmallVec<[u64; 2]> = smallvec::smallvec![0; sig.results.len().max(1)];

        let fence = (stack_top as usize).saturating_sub(STACK_FENCE_MARGIN);
        let stack_floor = stack_info::current_thread_stack()
            .map(|s| s.stack_top)
            .unwrap_or_else(|| fence.saturating_sub(16 * 1024 * 1024));
        self.write_link_u64(ld::STACK_FENCE, fence as u64);
        self.write_link_u64(ld::TRAP_CODE, 0);

        let link_data = self.inner.memory.link_data_base();
        let active = ActiveRuntime {
            runtime: &mut *self.inner as *mut RuntimeInner as *mut (),
            trap_entry: self.inner.code.addr_of(TRAP_ENTRY_OFFSET),
            linmem_base: self.inner.memory.linmem_base() as usize,
            code_base: self.inner.code.base() as usize,
            code_len: self.inner.code.len(),
            landing_pad: self
                .inner
                .binary
                .landing_pad
                .map_or(0, |p| self.inner.code.addr_of(p)),
            link_data,
            stack_fence: fence,
            stack_floor,
        };

        let _signals = SignalGuard::install();
        let _active = ActiveRuntimeGuard::install(active);

        let wrapper: WrapperFn =
            // SAFETY: wrapper offsets come from the parsed binary and the
            // image is mapped executable.
            unsafe { core::mem::transmute(self.inner.code.addr_of(wrapper_offset)) };
        // SAFETY: the wrapper adheres to the documented (link, args,
        // results) ABI and the argument buffers outlive the call.
        unsafe {
            wrapper(link_data, arg_bits.as_ptr(), result_bits.as_mut_ptr());
        }

        let trap_code = self.read_link_u64(ld::TRAP_CODE) as u32;
        if trap_code != 0 {
            let snapshot = self.stacktrace_snapshot();
            // The wasm stack was abandoned; reset the ring and the flag.
            self.write_link_u64(ld::TRAP_CODE, 0);
            self.write_link_u64(ld::RING_IDX, 0);
            let code = TrapCode::from_u32(trap_code).unwrap_or(TrapCode::Unreachable);
            if code == TrapCode::RuntimeInterruptRequested {
                self.write_link_u64(ld::INTERRUPT_FLAG, 0);
            }
            return Err(Trap::new(code, snapshot.entries().iter().copied()).into());
        }

        Ok(sig
            .results
            .iter()
            .zip(result_bits)
            .map(|(ty, bits)| WasmValue::from_bits(*ty, bits))
            .collect())
    }

    // ---- interruption ---------------------------------------------------

    /// Request termination of running wasm code as soon as possible; the
    /// flag is observed at loop backedges and call sites. A zero code is a
    /// no-op.
    pub fn request_interruption(&self, code: TrapCode) {
        if code == TrapCode::None {
            return;
        }
        self.interrupt_handle().request(code);
    }

    /// A handle another thread can use to interrupt this runtime. The
    /// handle must not outlive the runtime.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        let base = self.inner.memory.link_data_base_const();
        InterruptHandle {
            // SAFETY: the flag cell lives in committed link data.
            flag: unsafe { base.add(ld::INTERRUPT_FLAG as usize) as *const AtomicU32 },
        }
    }

    // ---- memory ---------------------------------------------------------

    /// Expose a host byte region to the module through the linked-memory
    /// builtins. The region is copied and owned by the runtime.
    pub fn link_memory(&mut self, data: &[u8]) {
        let owned: Box<[u8]> = data.into();
        let ptr = owned.as_ptr() as u64;
        let len = owned.len() as u64;
        self.inner.linked_memory = Some(owned);
        self.write_link_u64(ld::LINKED_MEM_PTR, ptr);
        self.write_link_u64(ld::LINKED_MEM_LEN, len);
    }

    pub fn unlink_memory(&mut self) {
        self.write_link_u64(ld::LINKED_MEM_PTR, 0);
        self.write_link_u64(ld::LINKED_MEM_LEN, 0);
        self.inner.linked_memory = None;
    }

    /// Release committed linear memory down to `minimum_length` bytes.
    pub fn shrink_memory(&mut self, minimum_length: u32) -> bool {
        self.inner.memory.shrink(minimum_length)
    }

    pub fn set_memory_limit(&self, limit: u64) -> Result<(), RuntimeError> {
        self.inner.memory.set_memory_limit(limit)
    }

    pub fn memory_limit(&self) -> u64 {
        self.inner.memory.memory_limit()
    }

    pub fn memory_usage(&self) -> u64 {
        self.inner.memory.memory_usage()
    }

    pub fn max_desired_ram_on_extend_failure(&self) -> u64 {
        self.inner.memory.max_desired_ram_on_extend_failure()
    }

    /// Pointer into linear memory if `[offset, offset+size)` is within the
    /// current wasm-visible size. A host-side check, not a trap.
    pub fn get_linear_memory_region(
        &mut self,
        offset: u32,
        size: u32,
    ) -> Result<*mut u8, RuntimeError> {
        let end = u64::from(offset) + u64::from(size);
        if end > self.inner.memory.linmem_size_bytes() {
            return Err(RuntimeError::MemoryRegionOutOfRange { offset, size });
        }
        if size > 0 && self.inner.memory.probe(end - 1) != ProbeResult::Committed {
            return Err(RuntimeError::VirtualMemoryExhausted);
        }
        // SAFETY: committed and within the wasm-visible size.
        Ok(unsafe { self.inner.memory.linmem_base().cast_mut().add(offset as usize) })
    }

    // ---- globals --------------------------------------------------------

    /// Typed handle to an exported global.
    pub fn get_exported_global<T: FromWasmValue>(
        &mut self,
        name: &str,
    ) -> Result<ModuleGlobal<'_, T>, RuntimeError> {
        let global = self
            .inner
            .binary
            .exported_global(name)
            .ok_or_else(|| RuntimeError::NoSuchExportedGlobal(name.to_string()))?
            .clone();
        if global.ty != T::ty() {
            return Err(RuntimeError::GlobalTypeMismatch {
                expected: T::ty(),
                found: global.ty,
            });
        }
        let kind = match global.value {
            GlobalValue::Constant(bits) => GlobalKind::Constant(bits),
            GlobalValue::LinkOffset(offset) => {
                GlobalKind::Slot(self.link_ptr(offset).cast::<u64>())
            }
        };
        Ok(ModuleGlobal {
            ty: global.ty,
            kind,
            _runtime: PhantomData,
            _value: PhantomData,
        })
    }

    // ---- stacktrace -----------------------------------------------------

    fn stacktrace_snapshot(&self) -> StacktraceSnapshot {
        let records = self.inner.binary.stacktrace_records;
        if records == 0 {
            return StacktraceSnapshot::from_ring(&[], 0, 0);
        }
        // RING_IDX and RING_COUNT share one 8-byte cell.
        let idx_count = self.read_link_u64(ld::RING_IDX);
        let idx = (idx_count & 0xFFFF_FFFF) as u32;
        let count = (idx_count >> 32) as u32;
        let base = self.inner.memory.link_data_base_const();
        let ring_off = crate::runtime::link_data::LinkDataPlan::new(
            records,
            false,
        )
        .ring_slots_offset();
        let mut slots = vec![0u32; records as usize];
        for (i, slot) in slots.iter_mut().enumerate() {
            // SAFETY: the ring lives inside committed link data.
            *slot = unsafe {
                base.add(ring_off as usize + 4 * i).cast::<u32>().read()
            };
        }
        StacktraceSnapshot::from_ring(&slots, idx, count)
    }

    /// Visit the stacktrace ring, innermost function first.
    pub fn iterate_stacktrace(&self, f: impl FnMut(u32)) {
        self.stacktrace_snapshot().iterate(f);
    }

    pub fn print_stacktrace(&self) {
        self.stacktrace_snapshot().print(&self.inner.binary);
    }

    pub fn raw_debug_map(&self) -> Option<&[u8]> {
        self.inner.raw_debug_map.as_deref()
    }
}

/// Cross-thread interruption flag handle.
#[derive(Clone, Copy)]
pub struct InterruptHandle {
    flag: *const AtomicU32,
}

// SAFETY: points at an atomic cell inside the runtime's committed link
// data; the embedder keeps the runtime alive for the handle's lifetime.
unsafe impl Send for InterruptHandle {}
unsafe impl Sync for InterruptHandle {}

impl InterruptHandle {
    pub fn request(&self, code: TrapCode) {
        if code == TrapCode::None {
            return;
        }
        // SAFETY: see the Send/Sync justification.
        unsafe { (*self.flag).store(code.as_u32(), Ordering::SeqCst) };
    }
}

/// Typed view of one exported global: immutable globals read the frozen
/// constant, mutable globals read and write the live link-data slot.
pub struct ModuleGlobal<'rt, T> {
    ty: ValType,
    kind: GlobalKind,
    _runtime: PhantomData<&'rt mut Runtime>,
    _value: PhantomData<fn() -> T>,
}

enum GlobalKind {
    Constant(u64),
    Slot(*mut u64),
}

impl<T: FromWasmValue> ModuleGlobal<'_, T> {
    pub fn get(&self) -> T {
        let bits = match self.kind {
            GlobalKind::Constant(bits) => bits,
            // SAFETY: the slot outlives the borrow of the runtime.
            GlobalKind::Slot(p) => unsafe { p.read() },
        };
        T::from_value(WasmValue::from_bits(self.ty, bits)).expect("type checked at lookup")
    }

    /// Write a mutable global; immutable handles reject the write.
    pub fn set(&mut self, value: T) -> Result<(), RuntimeError> {
        match self.kind {
            GlobalKind::Constant(_) => Err(RuntimeError::GlobalTypeMismatch {
                expected: self.ty,
                found: self.ty,
            }),
            GlobalKind::Slot(p) => {
                // SAFETY: see `get`.
                unsafe { p.write(value.into_value().to_bits()) };
                Ok(())
            }
        }
    }
}

// ---- host helpers installed into link data ------------------------------

/// Landing-pad callee: commit the faulted page. Non-zero means retry.
extern "C" fn probe_host(ctx: *mut RuntimeInner, offset: u64) -> i32 {
    // SAFETY: ctx is the executing runtime, single-threaded by contract.
    let inner = unsafe { &mut *ctx };
    match inner.memory.probe(offset) {
        ProbeResult::Committed => 1,
        ProbeResult::CouldNotExtend | ProbeResult::OutOfBounds => 0,
    }
}

/// `memory.grow` helper: returns the previous page count or -1.
extern "C" fn memory_grow_host(ctx: *mut RuntimeInner, delta: u32) -> i32 {
    // SAFETY: see `probe_host`.
    let inner = unsafe { &mut *ctx };
    let current = inner.memory.linmem_pages();
    let Some(new_total) = current.checked_add(delta) else {
        return -1;
    };
    if new_total > MAX_WASM_PAGES {
        return -1;
    }
    let eager = inner.eager;
    if !inner.memory.extend(new_total, eager) {
        return -1;
    }
    // Publish the new wasm-visible size for bounds checks and memory.size.
    let new_size = u64::from(new_total) * u64::from(WASM_PAGE_SIZE);
    // SAFETY: link data base is the start of the allocator's reservation.
    unsafe {
        inner
            .memory
            .link_data_base()
            .add(ld::LINMEM_SIZE as usize)
            .cast::<u64>()
            .write(new_size);
    }
    current as i32
}

/// Filler for permissive-import slots that were never resolved.
extern "C" fn not_linked_thunk() {
    raise_trap_from_host(TrapCode::CalledFunctionNotLinked)
}

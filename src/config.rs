use crate::MAX_STACKTRACE_RECORDS;

/// Tunables fixed at [`crate::Compiler`] construction time.
///
/// Everything here is baked into the frozen binary: two compiles of the same
/// bytecode with the same config are byte-identical.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Number of wasm function indices the stacktrace ring can hold.
    /// Zero disables the prologue/epilogue instrumentation entirely.
    pub(crate) stacktrace_records: u32,
    /// In-order single-instruction emission plus a bytecode↔native debug map.
    pub(crate) debug_mode: bool,
    /// Clamp every register free list so each allocation spills. Testing only.
    pub(crate) force_high_pressure: bool,
    /// Unresolved DYNAMIC imports become "called function not linked" thunks
    /// instead of failing the compile.
    pub(crate) permissive_imports: bool,
    /// Commit the declared initial linear-memory pages at init instead of
    /// faulting them in lazily.
    pub(crate) eager_allocation: bool,
    /// Emit interruption polls at backedges and call sites.
    pub(crate) interruption_polls: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            stacktrace_records: 10,
            debug_mode: false,
            force_high_pressure: false,
            permissive_imports: false,
            eager_allocation: false,
            interruption_polls: true,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stacktrace ring capacity. Clamped to
    /// [`MAX_STACKTRACE_RECORDS`]; the frozen trailer records the value.
    pub fn stacktrace_records(mut self, count: u32) -> Self {
        self.stacktrace_records = count.min(MAX_STACKTRACE_RECORDS);
        self
    }

    /// Disable peephole folding, compile instructions in order and emit the
    /// parallel debug map.
    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }

    /// Leave the least number of registers available so every allocation
    /// triggers a spill, irrespective of how many values are live.
    ///
    /// ONLY FOR TESTING, WILL IMPACT PERFORMANCE.
    pub fn force_high_register_pressure(mut self) -> Self {
        self.force_high_pressure = true;
        self
    }

    /// Allow unknown imports. Unresolved import slots trap with
    /// "called function not linked" when invoked instead of failing the
    /// compile or the init.
    pub fn permissive_imports(mut self, enabled: bool) -> Self {
        self.permissive_imports = enabled;
        self
    }

    /// Commit the module's declared initial pages up front.
    pub fn eager_allocation(mut self, enabled: bool) -> Self {
        self.eager_allocation = enabled;
        self
    }

    /// Turn off interruption polls. `request_interruption` then has no
    /// observable effect on a module that never calls out.
    pub fn interruption_polls(mut self, enabled: bool) -> Self {
        self.interruption_polls = enabled;
        self
    }
}

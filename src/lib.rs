mod binary;
mod compile;
mod config;
mod errors;
mod indices;
mod runtime;
mod symbols;
mod traps;
mod utils;
mod values;

pub use binary::BinaryModule;
pub use compile::{CompiledBinary, Compiler};
pub use config::CompilerConfig;
pub use errors::{CompileError, RuntimeError};
pub use runtime::{CallError, InterruptHandle, ModuleGlobal, Runtime};
pub use symbols::{AbiVersion, Linkage, NativeFnPtr, NativeSymbol};
pub use traps::{Trap, TrapCode};
pub use values::{FromWasmValue, ValType, WasmValue};

pub type Result<T, E = CompileError> = core::result::Result<T, E>;

/// WebAssembly page sizes are defined to be 64KiB.
pub const WASM_PAGE_SIZE: u32 = 0x10000;

/// The number of pages a 32-bit module can address before running out of
/// byte index space.
pub const MAX_WASM_PAGES: u32 = 1 << 16;

/// The absolute maximum size of a linear memory in bytes (4G).
pub const MAX_LINEAR_MEMORY_SIZE: u64 = 1 << 32;

/// Size of the guard region placed after the linear-memory reservation.
///
/// Accesses are `u32 address + u32 offset (+ access width)`, so the largest
/// reachable byte past the memory end is just short of 4G + 64K.
pub const OFFSET_GUARD_SIZE: u64 = MAX_LINEAR_MEMORY_SIZE + WASM_PAGE_SIZE as u64;

/// Hard upper bound on the per-module stacktrace ring.
pub const MAX_STACKTRACE_RECORDS: u32 = 50;

/// Version tag written into (and required from) the frozen binary trailer.
pub const BINARY_VERSION: u32 = 1;

/// Bytes kept between the wasm stack fence and the true thread stack top so
/// host code called from wasm (and the fault handler itself) has room to run.
pub const STACK_FENCE_MARGIN: usize = 256 * 1024;

pub fn host_page_size() -> usize {
    rustix::param::page_size()
}

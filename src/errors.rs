use crate::values::ValType;
use std::string::String;

/// A compile-plane error.
///
/// Raised from [`crate::Compiler`] and from loading a frozen binary; never
/// from inside a running module (those are [`crate::Trap`]s).
#[derive(Debug, onlyerror::Error)]
pub enum CompileError {
    /// The input bytecode violates the WebAssembly specification.
    #[error("invalid WASM input at {offset}: {message}")]
    Validation {
        /// A string describing the validation error.
        message: String,
        /// The bytecode offset where the error occurred.
        offset: usize,
    },
    /// An import could not be resolved, or a resolved import's signature
    /// disagrees with the module.
    #[error("linking failed for {module}.{name}: {message}")]
    Linking {
        module: String,
        name: String,
        message: String,
    },
    /// The bytecode uses a WebAssembly feature outside the MVP.
    #[error("feature used by the WebAssembly code is not supported: {0}")]
    FeatureNotSupported(String),
    /// An internal static bound was exceeded.
    #[error("implementation limit exceeded: {0}")]
    ImplementationLimit(String),
    /// The compiler's allocator was exhausted.
    #[error("compiler out of memory")]
    OutOfMemory,
}

impl CompileError {
    pub(crate) fn validation(offset: usize, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            offset,
        }
    }
}

#[macro_export]
macro_rules! wasm_unsupported {
    ($($arg:tt)*) => { $crate::CompileError::FeatureNotSupported(::std::format!($($arg)*)) }
}

/// A host-side runtime error.
///
/// These report misuse of the [`crate::Runtime`] API itself. They are
/// distinct from [`crate::Trap`]s, which originate inside running wasm code.
#[derive(Debug, onlyerror::Error)]
pub enum RuntimeError {
    #[error("no exported function named `{0}`")]
    NoSuchExportedFunction(String),
    #[error("no exported global named `{0}`")]
    NoSuchExportedGlobal(String),
    #[error("exported global has type {found}, expected {expected}")]
    GlobalTypeMismatch { expected: ValType, found: ValType },
    #[error("wrong number of arguments: expected {expected}, got {got}")]
    ArgumentCountMismatch { expected: usize, got: usize },
    #[error("argument {index} has type {found}, expected {expected}")]
    ArgumentTypeMismatch {
        index: usize,
        expected: ValType,
        found: ValType,
    },
    #[error("table index {0} is not callable")]
    TableIndexNotCallable(u32),
    #[error("linear memory region [{offset:#x}, +{size:#x}) is out of range")]
    MemoryRegionOutOfRange { offset: u32, size: u32 },
    #[error("memory limit is below current usage")]
    LimitTooLowMemoryAlreadyInUse,
    #[error("could not reserve or commit virtual memory")]
    VirtualMemoryExhausted,
    #[error("the runtime was not initialized from a compiled binary")]
    NotInitialized,
    #[error("frozen binary metadata is corrupt")]
    CorruptBinary,
    #[error("frozen binaries for a foreign instruction set cannot be executed in-process")]
    ForeignTarget,
}

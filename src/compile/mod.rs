pub mod backend;
pub mod debug_map;
pub mod frontend;
pub mod module_info;
pub mod output;
pub mod reader;
pub mod regalloc;
pub mod serializer;
pub mod stack;
pub mod validation;

use crate::config::CompilerConfig;
use crate::runtime::builtins;
use crate::symbols::NativeSymbol;
use frontend::Frontend;

/// Compiles WebAssembly bytecode into a frozen binary the [`crate::Runtime`]
/// can execute.
///
/// A compiler configured the same way produces byte-identical output for
/// the same bytecode and symbol list.
pub struct Compiler {
    config: CompilerConfig,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Single-pass compile: validate, emit native code, freeze.
    pub fn compile(
        &self,
        bytecode: &[u8],
        symbols: &[NativeSymbol],
    ) -> crate::Result<CompiledBinary> {
        let mut all_symbols = builtins::native_symbols();
        all_symbols.extend_from_slice(symbols);

        let mut frontend = Frontend::new(bytecode, &all_symbols, self.config.clone());
        frontend.start_compilation()?;
        let parts = frontend.finish()?;
        tracing::debug!(
            size = parts.image.len(),
            debug = parts.debug.is_some(),
            "module frozen"
        );
        Ok(CompiledBinary {
            bytes: parts.image,
            debug_map: parts.debug,
        })
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompilerConfig::default())
    }
}

/// The frozen output artifact: a self-describing, tail-readable,
/// position-independent byte image, plus the parallel debug map when the
/// compiler ran in debug mode.
#[derive(Debug, Clone)]
pub struct CompiledBinary {
    bytes: Vec<u8>,
    debug_map: Option<Vec<u8>>,
}

impl CompiledBinary {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn debug_map(&self) -> Option<&[u8]> {
        self.debug_map.as_deref()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

use crate::indices::{EntityIndex, FuncIndex, GlobalIndex, ImportFuncIndex, TypeIndex};
use crate::symbols::{AbiVersion, Linkage, NativeFnPtr};
use crate::values::ValType;
use cranelift_entity::PrimaryMap;
use hashbrown::HashMap;
use smallvec::SmallVec;

/// A function signature from the type section (or synthesized for a block
/// type).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FuncSignature {
    pub params: SmallVec<[ValType; 8]>,
    pub results: SmallVec<[ValType; 2]>,
}

impl FuncSignature {
    pub fn single_result(ty: ValType) -> Self {
        let mut sig = Self::default();
        sig.results.push(ty);
        sig
    }
}

/// One function in the combined (imports first, then defined) index space.
#[derive(Debug, Clone, Copy)]
pub struct FunctionDecl {
    pub type_index: TypeIndex,
}

/// Resolution state of an imported function.
#[derive(Debug, Clone)]
pub enum ImportResolution {
    /// Statically linked at compile time; callsites are direct calls.
    Static { ptr: NativeFnPtr, abi: AbiVersion },
    /// Calls go through a link-data slot, filled at init.
    Dynamic { link_offset: u32 },
    /// Permissive-imports placeholder: the slot is initialized to the
    /// "called function not linked" thunk unless init resolves it.
    Unlinked { link_offset: u32 },
}

#[derive(Debug, Clone)]
pub struct ImportedFunction {
    pub module: String,
    pub name: String,
    pub type_index: TypeIndex,
    pub signature: String,
    pub resolution: ImportResolution,
    pub abi: AbiVersion,
}

impl ImportedFunction {
    pub fn link_offset(&self) -> Option<u32> {
        match self.resolution {
            ImportResolution::Static { .. } => None,
            ImportResolution::Dynamic { link_offset } | ImportResolution::Unlinked { link_offset } => {
                Some(link_offset)
            }
        }
    }

    /// Link-status byte stored in the frozen binary: 0 = not linked,
    /// 1 = statically linked, 2 = dynamically linked.
    pub fn link_status(&self) -> u8 {
        match self.resolution {
            ImportResolution::Static { .. } => 1,
            ImportResolution::Dynamic { .. } => 2,
            ImportResolution::Unlinked { .. } => 0,
        }
    }
}

/// One functional table, entries populated by the element section.
#[derive(Debug, Clone, Default)]
pub struct TablePlan {
    pub initial: u32,
    pub maximum: Option<u32>,
    /// `(signature index, function index)`, either possibly undefined.
    pub entries: Vec<(Option<TypeIndex>, Option<FuncIndex>)>,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryPlan {
    pub initial_pages: u32,
    pub maximum_pages: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct GlobalDecl {
    pub ty: ValType,
    pub mutable: bool,
    /// Initializer constant, raw bits. Immutable globals are inlined at
    /// uses; mutable globals live in their link-data slot.
    pub init_bits: u64,
    /// Slot offset for mutable globals.
    pub link_offset: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub index: EntityIndex,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// Parsed module declarations. Populated strictly in wasm section order;
/// its invariants hold for the entire compilation.
#[derive(Debug, Default)]
pub struct ModuleInfo {
    pub types: PrimaryMap<TypeIndex, FuncSignature>,
    /// Number of entries in `types` that came from the type section (the
    /// rest are synthesized single-result block types).
    pub num_declared_types: u32,
    pub functions: PrimaryMap<FuncIndex, FunctionDecl>,
    pub imported_functions: PrimaryMap<ImportFuncIndex, ImportedFunction>,
    pub table: Option<TablePlan>,
    pub memory: Option<MemoryPlan>,
    pub globals: PrimaryMap<GlobalIndex, GlobalDecl>,
    /// Declaration order preserved for deterministic serialization.
    pub exports: Vec<Export>,
    pub start: Option<FuncIndex>,
    pub data_segments: Vec<DataSegment>,
    /// From the `name` custom section, keyed by wasm function index.
    pub function_names: HashMap<u32, String>,
}

impl ModuleInfo {
    pub fn num_imported_functions(&self) -> u32 {
        self.imported_functions.len() as u32
    }

    pub fn num_defined_functions(&self) -> u32 {
        self.functions.len() as u32 - self.num_imported_functions()
    }

    pub fn is_imported(&self, func: FuncIndex) -> bool {
        func.as_u32() < self.num_imported_functions()
    }

    pub fn signature_of(&self, func: FuncIndex) -> &FuncSignature {
        &self.types[self.functions[func].type_index]
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == name)
    }

    /// Block types: positive values index the type section, the sentinel
    /// encodings alias synthesized single-result (or empty) signatures.
    /// Synthesized types are appended once and reused.
    pub fn block_type(&mut self, raw: i64, offset: usize) -> crate::Result<TypeIndex> {
        match raw {
            -64 => Ok(self.intern_synthesized(FuncSignature::default())),
            -1 => Ok(self.intern_synthesized(FuncSignature::single_result(ValType::I32))),
            -2 => Ok(self.intern_synthesized(FuncSignature::single_result(ValType::I64))),
            -3 => Ok(self.intern_synthesized(FuncSignature::single_result(ValType::F32))),
            -4 => Ok(self.intern_synthesized(FuncSignature::single_result(ValType::F64))),
            n if n >= 0 => {
                let index = TypeIndex::from_u32(u32::try_from(n).map_err(|_| {
                    crate::CompileError::validation(offset, "type index out of range")
                })?);
                if index.as_u32() >= self.num_declared_types {
                    return Err(crate::CompileError::validation(
                        offset,
                        "block type index out of range",
                    ));
                }
                Ok(index)
            }
            _ => Err(crate::CompileError::validation(
                offset,
                "malformed block type",
            )),
        }
    }

    fn intern_synthesized(&mut self, sig: FuncSignature) -> TypeIndex {
        let synthesized_start = self.num_declared_types as usize;
        for (index, existing) in self.types.iter().skip(synthesized_start) {
            if *existing == sig {
                return index;
            }
        }
        self.types.push(sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_types_are_interned_once() {
        let mut info = ModuleInfo::default();
        let a = info.block_type(-1, 0).unwrap();
        let b = info.block_type(-1, 0).unwrap();
        assert_eq!(a, b);
        let c = info.block_type(-64, 0).unwrap();
        assert_ne!(a, c);
        assert!(info.types[a].params.is_empty());
        assert_eq!(info.types[a].results.as_slice(), &[ValType::I32]);
    }

    #[test]
    fn declared_block_type_must_exist() {
        let mut info = ModuleInfo::default();
        info.types.push(FuncSignature::default());
        info.num_declared_types = 1;
        assert!(info.block_type(0, 0).is_ok());
        assert!(info.block_type(1, 0).is_err());
        assert!(info.block_type(-5, 0).is_err());
    }
}

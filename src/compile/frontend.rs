use crate::compile::backend::{
    ActiveIsa, FloatCmp, FloatOp, FloatUn, IntCmp, IntOp, IntUnOp, Isa, Masm, MemAccess, ShiftOp,
};
use crate::compile::debug_map::DebugMap;
use crate::compile::module_info::{
    DataSegment, Export, FuncSignature, FunctionDecl, GlobalDecl, ImportResolution,
    ImportedFunction, MemoryPlan, ModuleInfo, TablePlan,
};
use crate::compile::output::PatchSite;
use crate::compile::reader::BytecodeReader;
use crate::compile::validation::{BlockKind, ValidationStack};
use crate::config::CompilerConfig;
use crate::errors::CompileError;
use crate::indices::{EntityIndex, FuncIndex, GlobalIndex, MemoryIndex, TableIndex, TypeIndex};
use crate::runtime::link_data::LinkDataPlan;
use crate::symbols::{signature_string, AbiVersion, Linkage, NativeSymbol};
use crate::traps::TrapCode;
use crate::values::ValType;
use crate::{wasm_unsupported, MAX_WASM_PAGES};
use hashbrown::HashMap;
use smallvec::SmallVec;

const WASM_MAGIC: u32 = 0x6D73_6100; // "\0asm"
const WASM_VERSION: u32 = 1;

/// Hard caps that keep single-pass state bounded.
const MAX_TYPES: u32 = 100_000;
const MAX_FUNCTIONS: u32 = 100_000;
const MAX_LOCALS: u32 = 50_000;
const MAX_GLOBALS: u32 = 10_000;
const MAX_TABLE_ENTRIES: u32 = 100_000;
const MAX_BR_TABLE_TARGETS: u32 = 65_536;

/// Per-function codegen frame mirroring one validation block.
struct Frame {
    kind: BlockKind,
    sig: TypeIndex,
    /// Operand height the merge values land at.
    merge_base: usize,
    pending: SmallVec<[PatchSite; 4]>,
    else_site: Option<PatchSite>,
    loop_head: u32,
}

/// The compiler frontend: walks the sections, drives the validation stack
/// and the masm per instruction, and leaves the machine code plus all
/// bookkeeping the serializer needs.
pub struct Frontend<'wasm, 'sym> {
    reader: BytecodeReader<'wasm>,
    symbols: &'sym [NativeSymbol],
    config: CompilerConfig,
    pub module: ModuleInfo,
    pub masm: Masm<ActiveIsa>,
    pub plan: LinkDataPlan,
    /// First structurally-equal declared type per declared type, so
    /// signature checks at indirect callsites respect type equality.
    canonical_types: Vec<TypeIndex>,
    call_fixups: Vec<(PatchSite, FuncIndex)>,
    /// Machine-code start offset per defined function.
    pub body_offsets: HashMap<FuncIndex, u32>,
    pub landing_pad: Option<u32>,
    pub debug: Option<DebugMap>,
    last_section: u8,
    num_declared_bodies: u32,
    /// Codegen-side dead-code tracking: set to the frame depth where an
    /// unconditional transfer was emitted; code stays skipped until the
    /// `else`/`end` at that depth. Validation keeps typing the dead region
    /// on its own polymorphic rules.
    dead_depth: Option<usize>,
}

impl<'wasm, 'sym> Frontend<'wasm, 'sym> {
    pub fn new(
        bytecode: &'wasm [u8],
        symbols: &'sym [NativeSymbol],
        config: CompilerConfig,
    ) -> Self {
        let mut masm = Masm::new(config.force_high_pressure, config.debug_mode);
        masm.configure(config.stacktrace_records, config.interruption_polls);
        let plan = LinkDataPlan::new(config.stacktrace_records, !ActiveIsa::HAS_HARD_FLOAT);
        let debug = config.debug_mode.then(DebugMap::default);
        Self {
            reader: BytecodeReader::new(bytecode),
            symbols,
            config,
            module: ModuleInfo::default(),
            masm,
            plan,
            canonical_types: Vec::new(),
            call_fixups: Vec::new(),
            body_offsets: HashMap::new(),
            landing_pad: None,
            debug,
            last_section: 0,
            num_declared_bodies: 0,
            dead_depth: None,
        }
    }

    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError::Validation {
            message: message.into(),
            offset: self.reader.offset(),
        }
    }

    /// Walk the module and emit everything up to (not including) the
    /// trailing metadata serialization.
    pub fn start_compilation(&mut self) -> crate::Result<()> {
        self.validate_magic_and_version()?;
        self.emit_code_prelude();

        while self.reader.has_next_byte() {
            let id = self.reader.read_u8()?;
            let size = self.reader.read_leb128::<u32>()? as usize;
            let section_start = self.reader.offset();
            let section_end = section_start + size;
            if section_end > section_start + self.reader.bytes_left() {
                return Err(self.err("section extends past end of module"));
            }

            if id != 0 {
                if id > 11 {
                    return Err(self.err(format!("unknown section id {id}")));
                }
                if id == self.last_section {
                    return Err(self.err("duplicate section"));
                }
                if id < self.last_section {
                    return Err(self.err("section out of order"));
                }
                self.last_section = id;
            }

            match id {
                0 => self.parse_custom_section(section_end)?,
                1 => self.parse_type_section()?,
                2 => self.parse_import_section()?,
                3 => self.parse_function_section()?,
                4 => self.parse_table_section()?,
                5 => self.parse_memory_section()?,
                6 => self.parse_global_section()?,
                7 => self.parse_export_section()?,
                8 => self.parse_start_section()?,
                9 => self.parse_element_section()?,
                10 => self.parse_code_section()?,
                11 => self.parse_data_section()?,
                _ => unreachable!(),
            }

            if self.reader.offset() != section_end {
                return Err(self.err("section size mismatch"));
            }
            self.post_section_action(id);
        }

        if self.num_declared_bodies != self.module.num_defined_functions()
            || (self.module.num_defined_functions() > 0 && self.last_section < 10)
        {
            return Err(self.err("function and code section counts disagree"));
        }
        Ok(())
    }

    fn post_section_action(&mut self, id: u8) {
        tracing::trace!(section = id, offset = self.reader.offset(), "section done");
    }

    fn validate_magic_and_version(&mut self) -> crate::Result<()> {
        if self.reader.read_le_u32()? != WASM_MAGIC {
            return Err(self.err("wrong wasm magic number"));
        }
        if self.reader.read_le_u32()? != WASM_VERSION {
            return Err(self.err("unsupported wasm version"));
        }
        Ok(())
    }

    /// The code region opens with two synthetic bodies: the generic trap
    /// entry (always at code offset 4) and, on passive-protection targets,
    /// the landing pad.
    fn emit_code_prelude(&mut self) {
        let out = self.masm.out();
        let size_site = out.reserve_u32();
        let start = out.pos();
        ActiveIsa::emit_trap_entry(out);
        out.pad_to(4);
        let size = out.pos() - start;
        out.patch_u32(size_site, size);
        self.masm.trap_entry = start;

        let trap_entry = self.masm.trap_entry;
        let out = self.masm.out();
        let size_site = out.reserve_u32();
        let start = out.pos();
        let pad = ActiveIsa::emit_landing_pad(out, trap_entry);
        out.pad_to(4);
        let size = out.pos() - start;
        out.patch_u32(size_site, size);
        self.landing_pad = pad;
    }

    // ---- declaration sections ------------------------------------------

    fn read_name(&mut self) -> crate::Result<String> {
        let len = self.reader.read_leb128::<u32>()? as usize;
        let bytes = self.reader.read_bytes(len)?;
        core::str::from_utf8(bytes)
            .map(|s| s.to_string())
            .map_err(|_| self.err("malformed UTF-8 name"))
    }

    fn read_val_type(&mut self) -> crate::Result<ValType> {
        let byte = self.reader.read_u8()?;
        ValType::from_wasm_byte(byte).ok_or_else(|| self.err("malformed value type"))
    }

    fn parse_custom_section(&mut self, section_end: usize) -> crate::Result<()> {
        let name = self.read_name()?;
        if name == "name" {
            self.parse_name_section(section_end)?;
        } else {
            tracing::debug!(name = %name, "skipping custom section");
        }
        self.reader.jump_to(section_end)
    }

    /// Only the function-name subsection is consumed.
    fn parse_name_section(&mut self, section_end: usize) -> crate::Result<()> {
        while self.reader.offset() < section_end {
            let subsection = self.reader.read_u8()?;
            let size = self.reader.read_leb128::<u32>()? as usize;
            let sub_end = self.reader.offset() + size;
            if subsection == 1 {
                let count = self.reader.read_leb128::<u32>()?;
                for _ in 0..count {
                    let index = self.reader.read_leb128::<u32>()?;
                    let name = self.read_name()?;
                    if index < self.module.functions.len() as u32 {
                        self.module.function_names.insert(index, name);
                    }
                }
            }
            self.reader.jump_to(sub_end)?;
        }
        Ok(())
    }

    fn parse_type_section(&mut self) -> crate::Result<()> {
        let count = self.reader.read_leb128::<u32>()?;
        if count > MAX_TYPES {
            return Err(CompileError::ImplementationLimit("too many types".into()));
        }
        for _ in 0..count {
            if self.reader.read_u8()? != 0x60 {
                return Err(self.err("malformed function type"));
            }
            let mut sig = FuncSignature::default();
            let params = self.reader.read_leb128::<u32>()?;
            for _ in 0..params {
                sig.params.push(self.read_val_type()?);
            }
            let results = self.reader.read_leb128::<u32>()?;
            if results > 1 {
                return Err(wasm_unsupported!("multiple return values"));
            }
            for _ in 0..results {
                sig.results.push(self.read_val_type()?);
            }
            let index = self.module.types.push(sig);
            // Canonicalize structurally equal types for indirect-call
            // signature checks.
            let canonical = self
                .module
                .types
                .iter()
                .find(|(i, s)| *i < index && **s == self.module.types[index])
                .map(|(i, _)| i)
                .unwrap_or(index);
            self.canonical_types.push(canonical);
        }
        self.module.num_declared_types = self.module.types.len() as u32;
        Ok(())
    }

    pub fn canonical_type(&self, ty: TypeIndex) -> TypeIndex {
        self.canonical_types
            .get(ty.as_u32() as usize)
            .copied()
            .unwrap_or(ty)
    }

    fn parse_import_section(&mut self) -> crate::Result<()> {
        let count = self.reader.read_leb128::<u32>()?;
        for _ in 0..count {
            let module = self.read_name()?;
            let name = self.read_name()?;
            let kind = self.reader.read_u8()?;
            if kind != 0x00 {
                return Err(wasm_unsupported!(
                    "imported tables, memories and globals are not supported"
                ));
            }
            let type_index = TypeIndex::from_u32(self.reader.read_leb128::<u32>()?);
            let sig = self
                .module
                .types
                .get(type_index)
                .ok_or_else(|| self.err("import type index out of range"))?;
            let signature = signature_string(&sig.params, &sig.results);

            let matched = self
                .symbols
                .iter()
                .find(|s| s.matches(&module, &name, &signature));
            let (resolution, abi) = match matched {
                Some(symbol) => match symbol.linkage {
                    Linkage::Static => (
                        ImportResolution::Static {
                            ptr: symbol.ptr,
                            abi: symbol.abi,
                        },
                        symbol.abi,
                    ),
                    Linkage::Dynamic => (
                        ImportResolution::Dynamic {
                            link_offset: self.plan.alloc_slot(),
                        },
                        symbol.abi,
                    ),
                },
                None => {
                    // A same-name symbol with a different signature is a
                    // hard linking error even under permissive imports.
                    if self
                        .symbols
                        .iter()
                        .any(|s| s.module == module && s.name == name)
                    {
                        return Err(CompileError::Linking {
                            module,
                            name,
                            message: "import signature mismatch".into(),
                        });
                    }
                    if !self.config.permissive_imports {
                        return Err(CompileError::Linking {
                            module,
                            name,
                            message: "import not resolved".into(),
                        });
                    }
                    (
                        ImportResolution::Unlinked {
                            link_offset: self.plan.alloc_slot(),
                        },
                        AbiVersion::V1,
                    )
                }
            };

            self.module.functions.push(FunctionDecl { type_index });
            self.module.imported_functions.push(ImportedFunction {
                module,
                name,
                type_index,
                signature,
                resolution,
                abi,
            });
        }
        Ok(())
    }

    fn parse_function_section(&mut self) -> crate::Result<()> {
        let count = self.reader.read_leb128::<u32>()?;
        if count > MAX_FUNCTIONS {
            return Err(CompileError::ImplementationLimit(
                "too many functions".into(),
            ));
        }
        for _ in 0..count {
            let type_index = TypeIndex::from_u32(self.reader.read_leb128::<u32>()?);
            if self.module.types.get(type_index).is_none() {
                return Err(self.err("function type index out of range"));
            }
            self.module.functions.push(FunctionDecl { type_index });
        }
        Ok(())
    }

    fn read_limits(&mut self, hard_max: u32) -> crate::Result<(u32, u32)> {
        let flag = self.reader.read_u8()?;
        let initial = self.reader.read_leb128::<u32>()?;
        let maximum = match flag {
            0x00 => hard_max,
            0x01 => self.reader.read_leb128::<u32>()?,
            _ => return Err(self.err("malformed limits flag")),
        };
        if initial > hard_max || maximum > hard_max || initial > maximum {
            return Err(self.err("limits out of range"));
        }
        Ok((initial, maximum))
    }

    fn parse_table_section(&mut self) -> crate::Result<()> {
        let count = self.reader.read_leb128::<u32>()?;
        if count > 1 {
            return Err(wasm_unsupported!("more than one table"));
        }
        for _ in 0..count {
            if self.reader.read_u8()? != 0x70 {
                return Err(self.err("table element type must be funcref"));
            }
            let (initial, maximum) = self.read_limits(MAX_TABLE_ENTRIES)?;
            self.module.table = Some(TablePlan {
                initial,
                maximum: Some(maximum),
                entries: vec![(None, None); initial as usize],
            });
            self.plan.set_table_entries(initial);
        }
        Ok(())
    }

    fn parse_memory_section(&mut self) -> crate::Result<()> {
        let count = self.reader.read_leb128::<u32>()?;
        if count > 1 {
            return Err(wasm_unsupported!("more than one linear memory"));
        }
        for _ in 0..count {
            let (initial, maximum) = self.read_limits(MAX_WASM_PAGES)?;
            self.module.memory = Some(MemoryPlan {
                initial_pages: initial,
                maximum_pages: maximum,
            });
        }
        Ok(())
    }

    /// `(t.const v) end` initializer.
    fn read_const_expr(&mut self, expect: ValType) -> crate::Result<u64> {
        let opcode = self.reader.read_u8()?;
        let (ty, bits) = match opcode {
            0x41 => (ValType::I32, self.reader.read_leb128::<i32>()? as u32 as u64),
            0x42 => (ValType::I64, self.reader.read_leb128::<i64>()? as u64),
            0x43 => (ValType::F32, self.reader.read_le_u32()? as u64),
            0x44 => (ValType::F64, self.reader.read_le_u64()?),
            0x23 => {
                return Err(wasm_unsupported!(
                    "global.get initializers (imported globals are not supported)"
                ))
            }
            _ => return Err(self.err("unsupported constant expression")),
        };
        if ty != expect {
            return Err(self.err("initializer type mismatch"));
        }
        if self.reader.read_u8()? != 0x0B {
            return Err(self.err("initializer not terminated"));
        }
        Ok(bits)
    }

    fn parse_global_section(&mut self) -> crate::Result<()> {
        let count = self.reader.read_leb128::<u32>()?;
        if count > MAX_GLOBALS {
            return Err(CompileError::ImplementationLimit("too many globals".into()));
        }
        for _ in 0..count {
            let ty = self.read_val_type()?;
            let mutable = match self.reader.read_u8()? {
                0 => false,
                1 => true,
                _ => return Err(self.err("malformed global mutability")),
            };
            let init_bits = self.read_const_expr(ty)?;
            let link_offset = mutable.then(|| self.plan.alloc_slot());
            let index = self.module.globals.push(GlobalDecl {
                ty,
                mutable,
                init_bits,
                link_offset,
            });
            if let (Some(offset), Some(debug)) = (link_offset, self.debug.as_mut()) {
                debug.record_mutable_global(index.as_u32(), offset);
            }
        }
        Ok(())
    }

    fn parse_export_section(&mut self) -> crate::Result<()> {
        let count = self.reader.read_leb128::<u32>()?;
        for _ in 0..count {
            let name = self.read_name()?;
            if self.module.export(&name).is_some() {
                return Err(self.err("duplicate export name"));
            }
            let kind = self.reader.read_u8()?;
            let raw = self.reader.read_leb128::<u32>()?;
            let index = match kind {
                0x00 => {
                    if raw >= self.module.functions.len() as u32 {
                        return Err(self.err("exported function index out of range"));
                    }
                    EntityIndex::Function(FuncIndex::from_u32(raw))
                }
                0x01 => {
                    if raw != 0 || self.module.table.is_none() {
                        return Err(self.err("exported table index out of range"));
                    }
                    EntityIndex::Table(TableIndex::from_u32(raw))
                }
                0x02 => {
                    if raw != 0 || self.module.memory.is_none() {
                        return Err(self.err("exported memory index out of range"));
                    }
                    EntityIndex::Memory(MemoryIndex::from_u32(raw))
                }
                0x03 => {
                    if raw >= self.module.globals.len() as u32 {
                        return Err(self.err("exported global index out of range"));
                    }
                    EntityIndex::Global(GlobalIndex::from_u32(raw))
                }
                _ => return Err(self.err("malformed export kind")),
            };
            self.module.exports.push(Export { name, index });
        }
        Ok(())
    }

    fn parse_start_section(&mut self) -> crate::Result<()> {
        let raw = self.reader.read_leb128::<u32>()?;
        let func = FuncIndex::from_u32(raw);
        let decl = self
            .module
            .functions
            .get(func)
            .ok_or_else(|| self.err("start function index out of range"))?;
        let sig = &self.module.types[decl.type_index];
        if !sig.params.is_empty() || !sig.results.is_empty() {
            return Err(self.err("start function must have an empty signature"));
        }
        if self.module.is_imported(func) {
            return Err(wasm_unsupported!("imported start function"));
        }
        self.module.start = Some(func);
        Ok(())
    }

    fn parse_element_section(&mut self) -> crate::Result<()> {
        let count = self.reader.read_leb128::<u32>()?;
        for _ in 0..count {
            if self.reader.read_leb128::<u32>()? != 0 {
                return Err(wasm_unsupported!("non-zero table index in element segment"));
            }
            if self.module.table.is_none() {
                return Err(self.err("element segment without a table"));
            }
            let offset = self.read_const_expr(ValType::I32)? as u32;
            let len = self.reader.read_leb128::<u32>()?;
            for i in 0..len {
                let raw = self.reader.read_leb128::<u32>()?;
                let func = FuncIndex::from_u32(raw);
                let decl = self
                    .module
                    .functions
                    .get(func)
                    .copied()
                    .ok_or_else(|| self.err("element function index out of range"))?;
                if self.module.is_imported(func) {
                    return Err(wasm_unsupported!("imported function in table"));
                }
                let canonical = self.canonical_type(decl.type_index);
                let table_len = self.module.table.as_ref().unwrap().entries.len();
                let slot = offset
                    .checked_add(i)
                    .filter(|s| (*s as usize) < table_len)
                    .ok_or_else(|| self.err("element segment out of table bounds"))?;
                let table = self.module.table.as_mut().unwrap();
                table.entries[slot as usize] = (Some(canonical), Some(func));
            }
        }
        Ok(())
    }

    fn parse_data_section(&mut self) -> crate::Result<()> {
        let count = self.reader.read_leb128::<u32>()?;
        for _ in 0..count {
            if self.reader.read_leb128::<u32>()? != 0 {
                return Err(wasm_unsupported!("non-zero memory index in data segment"));
            }
            let memory = self
                .module
                .memory
                .ok_or_else(|| self.err("data segment without a memory"))?;
            let offset = self.read_const_expr(ValType::I32)? as u32;
            let len = self.reader.read_leb128::<u32>()?;
            let end = offset
                .checked_add(len)
                .ok_or_else(|| self.err("data segment out of memory bounds"))?;
            if u64::from(end) > u64::from(memory.initial_pages) * u64::from(crate::WASM_PAGE_SIZE) {
                return Err(self.err("data segment out of memory bounds"));
            }
            let bytes = self.reader.read_bytes(len as usize)?.to_vec();
            self.module.data_segments.push(DataSegment { offset, bytes });
        }
        Ok(())
    }

    // ---- code section ---------------------------------------------------

    fn parse_code_section(&mut self) -> crate::Result<()> {
        let count = self.reader.read_leb128::<u32>()?;
        if count != self.module.num_defined_functions() {
            return Err(self.err("function and code section counts disagree"));
        }
        self.num_declared_bodies = count;
        // Every link-data slot is assigned by now; the table image offset
        // generated code bakes in is final.
        self.masm.table_off = self.plan.table_image_offset();

        for defined in 0..count {
            let func = FuncIndex::from_u32(self.module.num_imported_functions() + defined);
            self.compile_function_body(func)?;
        }

        // All body offsets are known; patch the direct-call sites.
        for (site, func) in core::mem::take(&mut self.call_fixups) {
            let target = self.body_offsets[&func];
            self.masm.patch_call(site, target);
        }
        Ok(())
    }

    fn compile_function_body(&mut self, func: FuncIndex) -> crate::Result<()> {
        let body_size = self.reader.read_leb128::<u32>()? as usize;
        let body_start = self.reader.offset();
        let body_end = body_start + body_size;

        let type_index = self.module.functions[func].type_index;
        let sig = self.module.types[type_index].clone();

        // Locals: parameters first, then the declared runs.
        let mut locals: Vec<ValType> = sig.params.to_vec();
        let decl_count = self.reader.read_leb128::<u32>()?;
        for _ in 0..decl_count {
            let run = self.reader.read_leb128::<u32>()?;
            let ty = self.read_val_type()?;
            if locals.len() as u32 + run > MAX_LOCALS {
                return Err(CompileError::ImplementationLimit("too many locals".into()));
            }
            locals.extend(core::iter::repeat(ty).take(run as usize));
        }

        // Body prefix in the output stream.
        let size_site = self.masm.out().reserve_u32();
        let code_start = self.masm.pos();
        self.body_offsets.insert(func, code_start);

        if let Some(debug) = self.debug.as_mut() {
            debug.begin_function(func.as_u32(), locals.len() as u32);
        }

        let mut validation = ValidationStack::new(type_index);
        self.dead_depth = None;
        self.masm.start_function(&sig, &locals, func.as_u32())?;

        let mut frames: Vec<Frame> = vec![Frame {
            kind: BlockKind::Func,
            sig: type_index,
            merge_base: 0,
            pending: SmallVec::new(),
            else_site: None,
            loop_head: 0,
        }];

        while !frames.is_empty() {
            if self.reader.offset() >= body_end {
                return Err(self.err("function body not terminated"));
            }
            let op_offset = self.reader.offset();
            validation.set_offset(op_offset);
            if let Some(debug) = self.debug.as_mut() {
                let native = self.masm.pos() - code_start;
                debug.record_instruction((op_offset - body_start) as u32, native);
            }
            let opcode = self.reader.read_u8()?;
            self.dispatch_op(opcode, &mut validation, &mut frames, &sig, &locals)?;
        }

        if self.reader.offset() != body_end {
            return Err(self.err("function body size mismatch"));
        }

        self.masm.end_function()?;
        let out = self.masm.out();
        out.pad_to(4);
        let size = out.pos() - code_start;
        out.patch_u32(size_site, size);
        Ok(())
    }

    fn read_mem_arg(&mut self, width: u32) -> crate::Result<u32> {
        let align = self.reader.read_leb128::<u32>()?;
        if align >= 32 || (1u32 << align) > width {
            return Err(self.err("alignment larger than natural"));
        }
        if self.module.memory.is_none() {
            return Err(self.err("memory access without a declared memory"));
        }
        self.reader.read_leb128::<u32>()
    }

    /// Branch-target codegen: copy the merge values, then jump. Branches
    /// that target the function frame emit the return sequence instead.
    fn emit_branch_to(&mut self, frames: &mut [Frame], depth: u32, func_sig: &FuncSignature) {
        let target_index = frames.len() - 1 - depth as usize;
        if frames[target_index].kind == BlockKind::Func {
            // Non-destructive: conditional paths fall through with the
            // operand stack intact.
            self.masm.emit_return_peek(func_sig);
            return;
        }
        let target = &frames[target_index];
        let types_len = if target.kind == BlockKind::Loop {
            self.module.types[target.sig].params.len()
        } else {
            self.module.types[target.sig].results.len()
        };
        let merge_base = target.merge_base;
        let is_loop = target.kind == BlockKind::Loop;
        let loop_head = target.loop_head;
        self.masm.move_top_to_merge(types_len, merge_base);
        if is_loop {
            self.masm.interruption_poll();
            self.masm.jump_back(loop_head);
        } else {
            let site = self.masm.jump();
            frames[target_index].pending.push(site);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch_op(
        &mut self,
        opcode: u8,
        validation: &mut ValidationStack,
        frames: &mut Vec<Frame>,
        func_sig: &FuncSignature,
        locals: &[ValType],
    ) -> crate::Result<()> {
        let live = self.dead_depth.is_none();
        match opcode {
            0x00 => {
                // unreachable
                if live {
                    self.masm.trap(TrapCode::Unreachable);
                    let base = frames.last().unwrap().merge_base;
                    self.masm.reset_stack_to(base);
                    self.dead_depth = Some(frames.len());
                }
                validation.mark_unreachable();
            }
            0x01 => {} // nop
            0x02 | 0x03 => {
                // block / loop
                let raw = self.reader.read_leb128::<i64>()?;
                let sig = self.module.block_type(raw, self.reader.offset())?;
                let kind = if opcode == 0x02 {
                    BlockKind::Block
                } else {
                    BlockKind::Loop
                };
                let nparams = self.module.types[sig].params.len();
                let mut frame = Frame {
                    kind,
                    sig,
                    merge_base: 0,
                    pending: SmallVec::new(),
                    else_site: None,
                    loop_head: 0,
                };
                if live {
                    self.masm.canonicalize_all();
                    frame.merge_base = self.masm.stack_height() - nparams;
                    if kind == BlockKind::Loop {
                        frame.loop_head = self.masm.pos();
                    }
                } else {
                    frame.merge_base = self.masm.stack_height();
                }
                validation.push_block(kind, sig, &self.module)?;
                frames.push(frame);
            }
            0x04 => {
                // if
                let raw = self.reader.read_leb128::<i64>()?;
                let sig = self.module.block_type(raw, self.reader.offset())?;
                let nparams = self.module.types[sig].params.len();
                let mut frame = Frame {
                    kind: BlockKind::If,
                    sig,
                    merge_base: 0,
                    pending: SmallVec::new(),
                    else_site: None,
                    loop_head: 0,
                };
                validation.pop_value_expect(ValType::I32)?;
                if live {
                    let cond = self.masm.pop_condition();
                    self.masm.canonicalize_all();
                    frame.else_site = Some(self.masm.br_if_zero(cond));
                    self.masm.free_reg(cond);
                    frame.merge_base = self.masm.stack_height() - nparams;
                } else {
                    frame.merge_base = self.masm.stack_height();
                }
                validation.push_block(BlockKind::If, sig, &self.module)?;
                frames.push(frame);
            }
            0x05 => {
                // else
                validation.validate_else(&self.module)?;
                let depth = frames.len();
                let in_this_frame = self.dead_depth == Some(depth);
                let deeper_dead = self.dead_depth.map_or(false, |d| d < depth);
                let frame = frames
                    .last_mut()
                    .ok_or_else(|| self.err("else outside block"))?;
                let merge_base = frame.merge_base;
                let results = self.module.types[frame.sig].results.clone();
                let params = self.module.types[frame.sig].params.clone();
                if deeper_dead {
                    // The whole if sits in dead code; nothing to emit.
                    return Ok(());
                }
                if live {
                    self.masm.move_top_to_merge(results.len(), merge_base);
                    let site = self.masm.jump();
                    frames.last_mut().unwrap().pending.push(site);
                }
                if in_this_frame {
                    self.dead_depth = None;
                }
                self.masm.reset_stack_to(merge_base);
                if let Some(site) = frames.last_mut().unwrap().else_site.take() {
                    self.masm.bind(site);
                }
                self.masm.adopt_merge_results(merge_base, &params);
            }
            0x0B => {
                // end
                let info = validation.validate_end(&self.module)?;
                let depth = frames.len();
                let in_this_frame = self.dead_depth == Some(depth);
                let deeper_dead = self.dead_depth.map_or(false, |d| d < depth);
                let frame = frames.pop().expect("frame underflow");
                let results = self.module.types[frame.sig].results.clone();

                if info.kind == BlockKind::Func {
                    if live {
                        self.masm.emit_return(func_sig);
                    }
                    if in_this_frame {
                        self.dead_depth = None;
                    }
                    self.masm.reset_stack_to(0);
                    debug_assert!(frames.is_empty());
                    return Ok(());
                }

                if deeper_dead {
                    // Dead-region bookkeeping only: keep heights in sync.
                    self.masm.reset_stack_to(frame.merge_base);
                    self.masm.adopt_dead_results(frame.merge_base, &results);
                    return Ok(());
                }
                if live {
                    self.masm.move_top_to_merge(results.len(), frame.merge_base);
                }
                if in_this_frame {
                    self.dead_depth = None;
                }
                self.masm.reset_stack_to(frame.merge_base);
                for site in frame.pending {
                    self.masm.bind(site);
                }
                if let Some(site) = frame.else_site {
                    // if without else: the false path carries the params
                    // (identity signature, enforced by validation).
                    self.masm.bind(site);
                }
                self.masm.adopt_merge_results(frame.merge_base, &results);
            }
            0x0C => {
                // br
                let depth = self.reader.read_leb128::<u32>()?;
                validation.validate_branch(depth, false, &self.module)?;
                if live {
                    self.emit_branch_to(frames, depth, func_sig);
                    let base = frames.last().unwrap().merge_base;
                    self.masm.reset_stack_to(base);
                    self.dead_depth = Some(frames.len());
                }
            }
            0x0D => {
                // br_if
                let depth = self.reader.read_leb128::<u32>()?;
                if live {
                    let cond = self.masm.pop_condition();
                    let skip = self.masm.br_if_zero(cond);
                    self.masm.free_reg(cond);
                    validation.validate_branch(depth, true, &self.module)?;
                    self.emit_branch_to(frames, depth, func_sig);
                    self.masm.bind(skip);
                } else {
                    validation.validate_branch(depth, true, &self.module)?;
                }
            }
            0x0E => {
                // br_table
                let count = self.reader.read_leb128::<u32>()?;
                if count > MAX_BR_TABLE_TARGETS {
                    return Err(CompileError::ImplementationLimit(
                        "br_table too large".into(),
                    ));
                }
                let mut depths = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    depths.push(self.reader.read_leb128::<u32>()?);
                }
                let default_depth = self.reader.read_leb128::<u32>()?;
                if live {
                    let index = self.masm.pop_condition();
                    validation.validate_branch_table(&depths, default_depth, &self.module)?;
                    let mut sites = Vec::with_capacity(depths.len());
                    for (case, _) in depths.iter().enumerate() {
                        sites.push(self.masm.br_if_eq_imm(index, case as u32));
                    }
                    self.masm.free_reg(index);
                    self.emit_branch_to(frames, default_depth, func_sig);
                    for (site, depth) in sites.into_iter().zip(depths) {
                        self.masm.bind(site);
                        self.emit_branch_to(frames, depth, func_sig);
                    }
                    let base = frames.last().unwrap().merge_base;
                    self.masm.reset_stack_to(base);
                    self.dead_depth = Some(frames.len());
                } else {
                    validation.validate_branch_table(&depths, default_depth, &self.module)?;
                }
            }
            0x0F => {
                // return
                validation.validate_return(&self.module)?;
                if live {
                    self.masm.emit_return(func_sig);
                    let base = frames.last().unwrap().merge_base;
                    self.masm.reset_stack_to(base);
                    self.dead_depth = Some(frames.len());
                }
            }
            0x10 => {
                // call
                let raw = self.reader.read_leb128::<u32>()?;
                let callee = FuncIndex::from_u32(raw);
                let decl = self
                    .module
                    .functions
                    .get(callee)
                    .copied()
                    .ok_or_else(|| self.err("call index out of range"))?;
                validation.validate_call(decl.type_index, &self.module)?;
                if live {
                    let sig = self.module.types[decl.type_index].clone();
                    if self.module.is_imported(callee) {
                        let import = self.module.imported_functions
                            [crate::indices::ImportFuncIndex::from_u32(callee.as_u32())]
                        .clone();
                        self.masm.call_import(&sig, &import)?;
                    } else {
                        let site = self.masm.call_defined(&sig)?;
                        self.call_fixups.push((site, callee));
                    }
                }
            }
            0x11 => {
                // call_indirect
                let raw = self.reader.read_leb128::<u32>()?;
                let type_index = TypeIndex::from_u32(raw);
                if type_index.as_u32() >= self.module.num_declared_types {
                    return Err(self.err("call_indirect type index out of range"));
                }
                if self.reader.read_u8()? != 0x00 {
                    return Err(self.err("call_indirect reserved byte must be zero"));
                }
                if self.module.table.is_none() {
                    return Err(self.err("call_indirect without a table"));
                }
                validation.pop_value_expect(ValType::I32)?;
                validation.validate_call(type_index, &self.module)?;
                if live {
                    let sig = self.module.types[type_index].clone();
                    let canonical = self.canonical_type(type_index);
                    self.masm.call_indirect(&sig, canonical.as_u32())?;
                }
            }
            0x1A => {
                // drop
                let _ = validation.pop_value_any()?;
                if live {
                    self.masm.drop_value();
                }
            }
            0x1B => {
                // select
                validation.validate_select()?;
                if live {
                    self.masm.select();
                }
            }
            0x20 => {
                let index = self.reader.read_leb128::<u32>()?;
                let ty = *locals
                    .get(index as usize)
                    .ok_or_else(|| self.err("local index out of range"))?;
                validation.push_value(ty);
                if live {
                    self.masm.local_get(index, ty);
                }
            }
            0x21 | 0x22 => {
                let index = self.reader.read_leb128::<u32>()?;
                let ty = *locals
                    .get(index as usize)
                    .ok_or_else(|| self.err("local index out of range"))?;
                validation.pop_value_expect(ty)?;
                if opcode == 0x22 {
                    validation.push_value(ty);
                }
                if live {
                    self.masm.local_set(index, ty, opcode == 0x22);
                }
            }
            0x23 => {
                let index = self.reader.read_leb128::<u32>()?;
                let global = *self
                    .module
                    .globals
                    .get(GlobalIndex::from_u32(index))
                    .ok_or_else(|| self.err("global index out of range"))?;
                validation.push_value(global.ty);
                if live {
                    self.masm
                        .global_get(global.ty, global.link_offset, global.init_bits);
                }
            }
            0x24 => {
                let index = self.reader.read_leb128::<u32>()?;
                let global = *self
                    .module
                    .globals
                    .get(GlobalIndex::from_u32(index))
                    .ok_or_else(|| self.err("global index out of range"))?;
                if !global.mutable {
                    return Err(self.err("global.set of an immutable global"));
                }
                validation.pop_value_expect(global.ty)?;
                if live {
                    self.masm.global_set(global.ty, global.link_offset.unwrap());
                }
            }
            0x28..=0x35 => {
                let acc = match opcode {
                    0x28 => MemAccess::I32,
                    0x29 => MemAccess::I64,
                    0x2A => MemAccess::F32,
                    0x2B => MemAccess::F64,
                    0x2C => MemAccess::I32Load8S,
                    0x2D => MemAccess::I32Load8U,
                    0x2E => MemAccess::I32Load16S,
                    0x2F => MemAccess::I32Load16U,
                    0x30 => MemAccess::I64Load8S,
                    0x31 => MemAccess::I64Load8U,
                    0x32 => MemAccess::I64Load16S,
                    0x33 => MemAccess::I64Load16U,
                    0x34 => MemAccess::I64Load32S,
                    _ => MemAccess::I64Load32U,
                };
                let offset = self.read_mem_arg(acc.width())?;
                validation.pop_value_expect(ValType::I32)?;
                validation.push_value(acc.value_ty());
                if live {
                    self.masm.load(acc, offset);
                }
            }
            0x36..=0x3E => {
                let acc = match opcode {
                    0x36 => MemAccess::I32,
                    0x37 => MemAccess::I64,
                    0x38 => MemAccess::F32,
                    0x39 => MemAccess::F64,
                    0x3A => MemAccess::I32Load8U,
                    0x3B => MemAccess::I32Load16U,
                    0x3C => MemAccess::I64Load8U,
                    0x3D => MemAccess::I64Load16U,
                    _ => MemAccess::I64Load32U,
                };
                let offset = self.read_mem_arg(acc.width())?;
                validation.pop_value_expect(acc.value_ty())?;
                validation.pop_value_expect(ValType::I32)?;
                if live {
                    self.masm.store(acc, offset);
                }
            }
            0x3F => {
                if self.reader.read_u8()? != 0 {
                    return Err(self.err("memory.size reserved byte must be zero"));
                }
                if self.module.memory.is_none() {
                    return Err(self.err("memory.size without a declared memory"));
                }
                validation.push_value(ValType::I32);
                if live {
                    self.masm.memory_size();
                }
            }
            0x40 => {
                if self.reader.read_u8()? != 0 {
                    return Err(self.err("memory.grow reserved byte must be zero"));
                }
                if self.module.memory.is_none() {
                    return Err(self.err("memory.grow without a declared memory"));
                }
                validation.pop_value_expect(ValType::I32)?;
                validation.push_value(ValType::I32);
                if live {
                    self.masm.memory_grow();
                }
            }
            0x41 => {
                let v = self.reader.read_leb128::<i32>()?;
                validation.push_value(ValType::I32);
                if live {
                    self.masm.push_const(ValType::I32, v as u32 as u64);
                }
            }
            0x42 => {
                let v = self.reader.read_leb128::<i64>()?;
                validation.push_value(ValType::I64);
                if live {
                    self.masm.push_const(ValType::I64, v as u64);
                }
            }
            0x43 => {
                let bits = self.reader.read_le_u32()?;
                validation.push_value(ValType::F32);
                if live {
                    self.masm.push_const(ValType::F32, bits as u64);
                }
            }
            0x44 => {
                let bits = self.reader.read_le_u64()?;
                validation.push_value(ValType::F64);
                if live {
                    self.masm.push_const(ValType::F64, bits);
                }
            }
            0x45 | 0x50 => {
                let wide = opcode == 0x50;
                let ty = if wide { ValType::I64 } else { ValType::I32 };
                validation.validate_arithmetic(&[ty], Some(ValType::I32))?;
                if live {
                    self.masm.i_eqz(wide);
                }
            }
            0x46..=0x4F | 0x51..=0x5A => {
                let wide = opcode >= 0x51;
                let base = if wide { 0x51 } else { 0x46 };
                let cmp = [
                    IntCmp::Eq,
                    IntCmp::Ne,
                    IntCmp::LtS,
                    IntCmp::LtU,
                    IntCmp::GtS,
                    IntCmp::GtU,
                    IntCmp::LeS,
                    IntCmp::LeU,
                    IntCmp::GeS,
                    IntCmp::GeU,
                ][(opcode - base) as usize];
                let ty = if wide { ValType::I64 } else { ValType::I32 };
                validation.validate_arithmetic(&[ty, ty], Some(ValType::I32))?;
                if live {
                    self.masm.i_cmp(cmp, wide);
                }
            }
            0x5B..=0x60 | 0x61..=0x66 => {
                let is64 = opcode >= 0x61;
                let base = if is64 { 0x61 } else { 0x5B };
                let cmp = [
                    FloatCmp::Eq,
                    FloatCmp::Ne,
                    FloatCmp::Lt,
                    FloatCmp::Gt,
                    FloatCmp::Le,
                    FloatCmp::Ge,
                ][(opcode - base) as usize];
                let ty = if is64 { ValType::F64 } else { ValType::F32 };
                validation.validate_arithmetic(&[ty, ty], Some(ValType::I32))?;
                if live {
                    self.masm.f_cmp(cmp, is64);
                }
            }
            0x67..=0x78 | 0x79..=0x8A => {
                let wide = opcode >= 0x79;
                let base = if wide { 0x79 } else { 0x67 };
                let ty = if wide { ValType::I64 } else { ValType::I32 };
                match opcode - base {
                    0..=2 => {
                        let op = [IntUnOp::Clz, IntUnOp::Ctz, IntUnOp::Popcnt]
                            [(opcode - base) as usize];
                        validation.validate_arithmetic(&[ty], Some(ty))?;
                        if live {
                            self.masm.i_unop(op, wide);
                        }
                    }
                    3..=5 | 10..=12 => {
                        let op = match opcode - base {
                            3 => IntOp::Add,
                            4 => IntOp::Sub,
                            5 => IntOp::Mul,
                            10 => IntOp::And,
                            11 => IntOp::Or,
                            _ => IntOp::Xor,
                        };
                        validation.validate_arithmetic(&[ty, ty], Some(ty))?;
                        if live {
                            self.masm.i_binop(op, wide);
                        }
                    }
                    6..=9 => {
                        let (signed, rem) = match opcode - base {
                            6 => (true, false),
                            7 => (false, false),
                            8 => (true, true),
                            _ => (false, true),
                        };
                        validation.validate_arithmetic(&[ty, ty], Some(ty))?;
                        if live {
                            self.masm.i_div(signed, rem, wide);
                        }
                    }
                    13..=17 => {
                        let op = match opcode - base {
                            13 => ShiftOp::Shl,
                            14 => ShiftOp::ShrS,
                            15 => ShiftOp::ShrU,
                            16 => ShiftOp::Rotl,
                            _ => ShiftOp::Rotr,
                        };
                        validation.validate_arithmetic(&[ty, ty], Some(ty))?;
                        if live {
                            self.masm.i_shift(op, wide);
                        }
                    }
                    _ => unreachable!(),
                }
            }
            0x8B..=0x98 | 0x99..=0xA6 => {
                let is64 = opcode >= 0x99;
                let base = if is64 { 0x99 } else { 0x8B };
                let ty = if is64 { ValType::F64 } else { ValType::F32 };
                match opcode - base {
                    0..=6 => {
                        let op = [
                            FloatUn::Abs,
                            FloatUn::Neg,
                            FloatUn::Ceil,
                            FloatUn::Floor,
                            FloatUn::Trunc,
                            FloatUn::Nearest,
                            FloatUn::Sqrt,
                        ][(opcode - base) as usize];
                        validation.validate_arithmetic(&[ty], Some(ty))?;
                        if live {
                            self.masm.f_unop(op, is64);
                        }
                    }
                    7..=13 => {
                        let op = [
                            FloatOp::Add,
                            FloatOp::Sub,
                            FloatOp::Mul,
                            FloatOp::Div,
                            FloatOp::Min,
                            FloatOp::Max,
                            FloatOp::Copysign,
                        ][(opcode - base - 7) as usize];
                        validation.validate_arithmetic(&[ty, ty], Some(ty))?;
                        if live {
                            self.masm.f_binop(op, is64);
                        }
                    }
                    _ => unreachable!(),
                }
            }
            0xA7 => {
                validation.validate_arithmetic(&[ValType::I64], Some(ValType::I32))?;
                if live {
                    self.masm.wrap_i64();
                }
            }
            0xA8..=0xAB | 0xAE..=0xB1 => {
                let to64 = opcode >= 0xAE;
                let rel = if to64 { opcode - 0xAE } else { opcode - 0xA8 };
                let from64 = rel >= 2;
                let signed = rel % 2 == 0;
                let from = if from64 { ValType::F64 } else { ValType::F32 };
                let to = if to64 { ValType::I64 } else { ValType::I32 };
                validation.validate_arithmetic(&[from], Some(to))?;
                if live {
                    self.masm.trunc_float_to_int(to64, from64, signed);
                }
            }
            0xAC | 0xAD => {
                validation.validate_arithmetic(&[ValType::I32], Some(ValType::I64))?;
                if live {
                    self.masm.extend_i32(opcode == 0xAC);
                }
            }
            0xB2..=0xB5 | 0xB7..=0xBA => {
                let to64 = opcode >= 0xB7;
                let rel = if to64 { opcode - 0xB7 } else { opcode - 0xB2 };
                let from64 = rel >= 2;
                let signed = rel % 2 == 0;
                let from = if from64 { ValType::I64 } else { ValType::I32 };
                let to = if to64 { ValType::F64 } else { ValType::F32 };
                validation.validate_arithmetic(&[from], Some(to))?;
                if live {
                    self.masm.convert_int_to_float(to64, from64, signed);
                }
            }
            0xB6 => {
                validation.validate_arithmetic(&[ValType::F64], Some(ValType::F32))?;
                if live {
                    self.masm.promote_demote(false);
                }
            }
            0xBB => {
                validation.validate_arithmetic(&[ValType::F32], Some(ValType::F64))?;
                if live {
                    self.masm.promote_demote(true);
                }
            }
            0xBC..=0xBF => {
                let (from, to) = match opcode {
                    0xBC => (ValType::F32, ValType::I32),
                    0xBD => (ValType::F64, ValType::I64),
                    0xBE => (ValType::I32, ValType::F32),
                    _ => (ValType::I64, ValType::F64),
                };
                validation.validate_arithmetic(&[from], Some(to))?;
                if live {
                    self.masm.reinterpret(to);
                }
            }
            _ => {
                return Err(wasm_unsupported!(
                    "opcode {opcode:#04x} is outside the wasm MVP"
                ));
            }
        }
        Ok(())
    }
}

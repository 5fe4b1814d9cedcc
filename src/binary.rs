//! Tail-first reader for the frozen binary module.
//!
//! The image ends with a fixed 16-byte trailer; every metadata section
//! keeps its framing (counts and sizes) at its end, so the reader walks
//! backward from the trailer and parses each section's content forward.
//! Function bodies fill the remaining space at the start of the image.

use crate::compile::reader::BytecodeReader;
use crate::errors::CompileError;
use crate::utils::align4;
use crate::values::ValType;
use crate::{BINARY_VERSION, MAX_STACKTRACE_RECORDS};

pub const NONE_U32: u32 = 0xFFFF_FFFF;
pub const TRAILER_SIZE: usize = 16;

/// Offset of the generic trap entry's machine code: the first synthetic
/// body's size prefix is at image offset 0.
pub const TRAP_ENTRY_OFFSET: u32 = 4;

#[derive(Debug, Clone)]
pub struct ExportedFunction {
    pub wasm_index: u32,
    pub name: String,
    pub signature: String,
    /// Absolute image offset of the embedded wrapper.
    pub wrapper_offset: u32,
}

#[derive(Debug, Clone)]
pub struct ExportedGlobal {
    pub name: String,
    pub ty: ValType,
    pub mutable: bool,
    /// Link-data slot for mutable globals, inlined bits otherwise.
    pub value: GlobalValue,
}

#[derive(Debug, Clone, Copy)]
pub enum GlobalValue {
    LinkOffset(u32),
    Constant(u64),
}

#[derive(Debug, Clone)]
pub struct DynamicImport {
    pub module: String,
    pub name: String,
    pub signature: String,
    pub link_offset: u32,
}

#[derive(Debug, Clone)]
pub struct StartFunction {
    pub signature: String,
    pub wrapper_offset: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DataSegmentRef {
    /// Destination offset in linear memory.
    pub memory_offset: u32,
    /// Byte range within the image.
    pub image_start: u32,
    pub len: u32,
}

/// Parsed view of a frozen binary. All offsets are absolute image offsets;
/// the image itself is not retained here.
#[derive(Debug, Clone)]
pub struct BinaryModule {
    pub module_size: u32,
    pub stacktrace_records: u32,
    pub debug_mode: bool,
    pub link_data_size: u32,
    pub landing_pad: Option<u32>,
    /// Per table entry: absolute wrapper offset or `NONE_U32`.
    pub table_wrappers: Vec<u32>,
    /// Per table entry: `(signature index, absolute body offset)`, either
    /// possibly `NONE_U32`.
    pub table: Vec<(u32, u32)>,
    /// Link-status byte per imported function (0 = not linked).
    pub link_status: Vec<u8>,
    pub exports: Vec<ExportedFunction>,
    pub exported_globals: Vec<ExportedGlobal>,
    /// `None` when the module declares no memory.
    pub initial_pages: Option<u32>,
    pub dynamic_imports: Vec<DynamicImport>,
    /// `(type, link offset, initial bits)` per mutable global.
    pub mutable_globals: Vec<(ValType, u32, u64)>,
    pub start: Option<StartFunction>,
    pub function_names: Vec<(u32, String)>,
    pub data_segments: Vec<DataSegmentRef>,
}

struct BackCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BackCursor<'a> {
    fn err(&self, message: &str) -> CompileError {
        CompileError::validation(self.pos, message)
    }

    fn read_back_u32(&mut self) -> crate::Result<u32> {
        if self.pos < 4 {
            return Err(self.err("truncated frozen binary"));
        }
        self.pos -= 4;
        Ok(u32::from_le_bytes(
            self.bytes[self.pos..self.pos + 4].try_into().unwrap(),
        ))
    }

    fn step_back(&mut self, bytes: usize) -> crate::Result<usize> {
        self.pos = self
            .pos
            .checked_sub(bytes)
            .ok_or_else(|| self.err("truncated frozen binary"))?;
        Ok(self.pos)
    }

    /// Forward reader over `[start, start+len)`.
    fn forward(&self, start: usize) -> BytecodeReader<'a> {
        let mut r = BytecodeReader::new(self.bytes);
        r.jump_to(start).expect("range checked by caller");
        r
    }
}

fn read_padded_string(r: &mut BytecodeReader<'_>) -> crate::Result<String> {
    let len = r.read_le_u32()? as usize;
    let bytes = r.read_bytes(align4(len))?;
    core::str::from_utf8(&bytes[..len])
        .map(|s| s.to_string())
        .map_err(|_| CompileError::validation(r.offset(), "malformed name in frozen binary"))
}

impl BinaryModule {
    /// Parse a frozen image. The image is only borrowed for the duration
    /// of the parse.
    pub fn parse(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() < TRAILER_SIZE + 4 || bytes.len() % 4 != 0 {
            return Err(CompileError::validation(0, "frozen binary too small"));
        }
        let mut c = BackCursor {
            bytes,
            pos: bytes.len() - TRAILER_SIZE,
        };

        // Trailer.
        let mut t = c.forward(c.pos);
        let module_size = t.read_le_u32()?;
        let version = t.read_le_u32()?;
        let flags = t.read_le_u32()?;
        let link_data_size = t.read_le_u32()?;
        if module_size as usize != bytes.len() {
            return Err(CompileError::validation(c.pos, "module size mismatch"));
        }
        if version != BINARY_VERSION {
            return Err(CompileError::validation(c.pos, "unsupported binary version"));
        }
        let stacktrace_records = flags & 0x7FFF_FFFF;
        if stacktrace_records > MAX_STACKTRACE_RECORDS {
            return Err(CompileError::validation(
                c.pos,
                "stacktrace record count exceeds the supported bound",
            ));
        }
        let debug_mode = flags & 0x8000_0000 != 0;

        // Landing pad offset (self-relative, backward).
        let field_pos = c.step_back(4)?;
        let raw = u32::from_le_bytes(bytes[field_pos..field_pos + 4].try_into().unwrap());
        let landing_pad = (raw != NONE_U32)
            .then(|| (field_pos as u32).checked_sub(raw))
            .flatten();
        if raw != NONE_U32 && landing_pad.is_none() {
            return Err(CompileError::validation(field_pos, "landing pad out of range"));
        }

        // 1. Table-entry wrapper offsets.
        let count = c.read_back_u32()? as usize;
        let start = c.step_back(4 * count)?;
        let mut table_wrappers = Vec::with_capacity(count);
        {
            let mut r = c.forward(start);
            for _ in 0..count {
                let field_pos = r.offset() as u32;
                let raw = r.read_le_u32()?;
                if raw == NONE_U32 {
                    table_wrappers.push(NONE_U32);
                } else {
                    table_wrappers.push(field_pos.checked_sub(raw).ok_or_else(|| {
                        CompileError::validation(field_pos as usize, "wrapper offset out of range")
                    })?);
                }
            }
        }

        // 2. Table.
        let count = c.read_back_u32()? as usize;
        let start = c.step_back(8 * count)?;
        let mut table = Vec::with_capacity(count);
        {
            let mut r = c.forward(start);
            for _ in 0..count {
                let sig = r.read_le_u32()?;
                let field_pos = r.offset() as u32;
                let raw = r.read_le_u32()?;
                let body = if raw == NONE_U32 {
                    NONE_U32
                } else {
                    field_pos.checked_sub(raw).ok_or_else(|| {
                        CompileError::validation(field_pos as usize, "table offset out of range")
                    })?
                };
                table.push((sig, body));
            }
        }

        // 3. Link status.
        let count = c.read_back_u32()? as usize;
        let start = c.step_back(align4(count))?;
        let link_status = bytes[start..start + count].to_vec();

        // 4. Exported functions.
        let (start, count) = c.framed_section()?;
        let mut exports = Vec::with_capacity(count);
        {
            let mut r = c.forward(start);
            for _ in 0..count {
                let wasm_index = r.read_le_u32()?;
                let name = read_padded_string(&mut r)?;
                let signature = read_padded_string(&mut r)?;
                let wrapper_size = r.read_le_u32()? as usize;
                let wrapper_offset = r.offset() as u32;
                r.step(align4(wrapper_size))?;
                exports.push(ExportedFunction {
                    wasm_index,
                    name,
                    signature,
                    wrapper_offset,
                });
            }
        }

        // 5. Exported globals.
        let (start, count) = c.framed_section()?;
        let mut exported_globals = Vec::with_capacity(count);
        {
            let mut r = c.forward(start);
            for _ in 0..count {
                let name = read_padded_string(&mut r)?;
                r.step(2)?;
                let ty_char = r.read_u8()? as char;
                let ty = ValType::from_sig_char(ty_char).ok_or_else(|| {
                    CompileError::validation(r.offset(), "malformed global type")
                })?;
                let mutable = r.read_u8()? != 0;
                let value = if mutable {
                    GlobalValue::LinkOffset(r.read_le_u32()?)
                } else if ty.is_64bit() {
                    GlobalValue::Constant(r.read_le_u64()?)
                } else {
                    GlobalValue::Constant(r.read_le_u32()? as u64)
                };
                exported_globals.push(ExportedGlobal {
                    name,
                    ty,
                    mutable,
                    value,
                });
            }
        }

        // 6. Linear memory.
        let raw = c.read_back_u32()?;
        let initial_pages = (raw != NONE_U32).then_some(raw);

        // 7. Dynamically imported functions.
        let (start, count) = c.framed_section()?;
        let mut dynamic_imports = Vec::with_capacity(count);
        {
            let mut r = c.forward(start);
            for _ in 0..count {
                let module = read_padded_string(&mut r)?;
                let name = read_padded_string(&mut r)?;
                let signature = read_padded_string(&mut r)?;
                let link_offset = r.read_le_u32()?;
                dynamic_imports.push(DynamicImport {
                    module,
                    name,
                    signature,
                    link_offset,
                });
            }
        }

        // 8. Mutable globals with their initial values.
        let (start, count) = c.framed_section()?;
        let mut mutable_globals = Vec::with_capacity(count);
        {
            let mut r = c.forward(start);
            for _ in 0..count {
                r.step(3)?;
                let ty = ValType::from_type_code(r.read_u8()?).ok_or_else(|| {
                    CompileError::validation(r.offset(), "malformed global type code")
                })?;
                let link_offset = r.read_le_u32()?;
                let bits = if ty.is_64bit() {
                    r.read_le_u64()?
                } else {
                    r.read_le_u32()? as u64
                };
                mutable_globals.push((ty, link_offset, bits));
            }
        }

        // 9. Start function.
        let size = c.read_back_u32()? as usize;
        let start_offset = c.step_back(size)?;
        let start = if size == 0 {
            None
        } else {
            let mut r = c.forward(start_offset);
            let signature = read_padded_string(&mut r)?;
            let wrapper_size = r.read_le_u32()? as usize;
            let wrapper_offset = r.offset() as u32;
            let _ = wrapper_size;
            Some(StartFunction {
                signature,
                wrapper_offset,
            })
        };

        // 10. Function names.
        let (start_pos, count) = c.framed_section()?;
        let mut function_names = Vec::with_capacity(count);
        {
            let mut r = c.forward(start_pos);
            for _ in 0..count {
                let index = r.read_le_u32()?;
                let name = read_padded_string(&mut r)?;
                function_names.push((index, name));
            }
        }

        // 11. Initial linear memory data, segments backward.
        let count = c.read_back_u32()? as usize;
        let mut data_segments = Vec::with_capacity(count);
        for _ in 0..count {
            let memory_offset = c.read_back_u32()?;
            let len = c.read_back_u32()? as usize;
            let image_start = c.step_back(align4(len))?;
            data_segments.push(DataSegmentRef {
                memory_offset,
                image_start: image_start as u32,
                len: len as u32,
            });
        }
        data_segments.reverse();

        Ok(Self {
            module_size,
            stacktrace_records,
            debug_mode,
            link_data_size,
            landing_pad,
            table_wrappers,
            table,
            link_status,
            exports,
            exported_globals,
            initial_pages,
            dynamic_imports,
            mutable_globals,
            start,
            function_names,
            data_segments,
        })
    }

    pub fn export(&self, name: &str) -> Option<&ExportedFunction> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn exported_global(&self, name: &str) -> Option<&ExportedGlobal> {
        self.exported_globals.iter().find(|g| g.name == name)
    }

    pub fn function_name(&self, wasm_index: u32) -> Option<&str> {
        self.function_names
            .iter()
            .find(|(i, _)| *i == wasm_index)
            .map(|(_, n)| n.as_str())
    }
}

impl BackCursor<'_> {
    /// `[entries][count][section_size]` framing; returns the content start
    /// and entry count, leaving the cursor at the section start.
    fn framed_section(&mut self) -> crate::Result<(usize, usize)> {
        let size = self.read_back_u32()? as usize;
        let count = self.read_back_u32()? as usize;
        let start = self.step_back(size)?;
        Ok((start, count))
    }
}

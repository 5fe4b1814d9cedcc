//! Writer for the frozen binary's metadata sections.
//!
//! The output binary is read tail-first: the 16-byte trailer sits at the
//! end, preceded by the landing-pad offset, and each metadata section keeps
//! its counts and sizes at its *end* so a backward reader always finds the
//! next section's framing right under its cursor. Content inside a framed
//! section is laid out forward. Everything is zero-padded to 4 bytes.

use crate::compile::backend::{ActiveIsa, Isa};
use crate::compile::frontend::Frontend;
use crate::indices::EntityIndex;
use crate::symbols::signature_string;
use crate::{BINARY_VERSION, MAX_WASM_PAGES};

const NONE_U32: u32 = 0xFFFF_FFFF;

/// Append every metadata section and the trailer; returns the finished
/// byte image.
pub fn serialize(mut frontend: Frontend<'_, '_>) -> crate::Result<Vec<u8>> {
    // Table wrappers are executable and live in the code region, right
    // after the last function body; only their offsets go into section 1.
    let mut table_wrapper_offsets: Vec<u32> = Vec::new();
    if let Some(table) = frontend.module.table.clone() {
        for (sig, func) in &table.entries {
            match (sig, func) {
                (Some(_), Some(func)) => {
                    let decl = frontend.module.functions[*func];
                    let fsig = frontend.module.types[decl.type_index].clone();
                    let body = frontend.body_offsets[func];
                    let out = frontend.masm.out();
                    let size_site = out.reserve_u32();
                    let start = out.pos();
                    ActiveIsa::emit_table_wrapper(out, &fsig, body);
                    out.pad_to(4);
                    let size = out.pos() - start;
                    out.patch_u32(size_site, size);
                    table_wrapper_offsets.push(start);
                }
                _ => table_wrapper_offsets.push(NONE_U32),
            }
        }
    }

    let module = frontend.module;
    let plan = frontend.plan;
    let body_offsets = frontend.body_offsets;
    let landing_pad = frontend.landing_pad;
    let debug_mode = frontend.debug.is_some();
    let stacktrace_records = plan.stacktrace_records;
    let mut out = frontend.masm.into_output();

    // 11. Initial linear memory data, segments backward-readable.
    for segment in &module.data_segments {
        out.write_padded(&segment.bytes);
        out.write_u32(segment.bytes.len() as u32);
        out.write_u32(segment.offset);
    }
    out.write_u32(module.data_segments.len() as u32);

    // 10. Function names.
    {
        let start = out.pos();
        let mut names: Vec<(u32, &String)> = module
            .function_names
            .iter()
            .map(|(i, n)| (*i, n))
            .collect();
        names.sort_by_key(|(i, _)| *i);
        for (index, name) in &names {
            out.write_u32(*index);
            out.write_u32(name.len() as u32);
            out.write_padded(name.as_bytes());
        }
        let size = out.pos() - start;
        out.write_u32(names.len() as u32);
        out.write_u32(size);
    }

    // 9. Start function.
    {
        let start = out.pos();
        if let Some(func) = module.start {
            let decl = module.functions[func];
            let sig = &module.types[decl.type_index];
            let sig_str = signature_string(&sig.params, &sig.results);
            out.write_u32(sig_str.len() as u32);
            out.write_padded(sig_str.as_bytes());
            let wrapper_size_site = out.reserve_u32();
            let wrapper_start = out.pos();
            ActiveIsa::emit_export_wrapper(&mut out, sig, body_offsets[&func]);
            out.pad_to(4);
            out.patch_u32(wrapper_size_site, out.pos() - wrapper_start);
        }
        let size = out.pos() - start;
        out.write_u32(size);
    }

    // 8. Mutable globals (exported ones included: the loader initializes
    // every slot from here).
    {
        let start = out.pos();
        let mut count = 0u32;
        for (_, global) in module.globals.iter() {
            let Some(link_offset) = global.link_offset else {
                continue;
            };
            count += 1;
            out.write_u8(0);
            out.write_u8(0);
            out.write_u8(0);
            out.write_u8(global.ty.type_code());
            out.write_u32(link_offset);
            if global.ty.is_64bit() {
                out.write_u64(global.init_bits);
            } else {
                out.write_u32(global.init_bits as u32);
            }
        }
        let size = out.pos() - start;
        out.write_u32(count);
        out.write_u32(size);
    }

    // 7. Dynamically imported functions.
    {
        let start = out.pos();
        let mut count = 0u32;
        for (_, import) in module.imported_functions.iter() {
            let Some(link_offset) = import.link_offset() else {
                continue;
            };
            count += 1;
            out.write_u32(import.module.len() as u32);
            out.write_padded(import.module.as_bytes());
            out.write_u32(import.name.len() as u32);
            out.write_padded(import.name.as_bytes());
            out.write_u32(import.signature.len() as u32);
            out.write_padded(import.signature.as_bytes());
            out.write_u32(link_offset);
        }
        let size = out.pos() - start;
        out.write_u32(count);
        out.write_u32(size);
    }

    // 6. Linear memory.
    out.write_u32(match module.memory {
        Some(memory) => {
            debug_assert!(memory.initial_pages <= MAX_WASM_PAGES);
            memory.initial_pages
        }
        None => NONE_U32,
    });

    // 5. Exported globals.
    {
        let start = out.pos();
        let mut count = 0u32;
        for export in &module.exports {
            let EntityIndex::Global(index) = export.index else {
                continue;
            };
            let global = module.globals[index];
            count += 1;
            out.write_u32(export.name.len() as u32);
            out.write_padded(export.name.as_bytes());
            out.write_u16(0);
            out.write_u8(global.ty.sig_char() as u8);
            out.write_u8(u8::from(global.mutable));
            if let Some(link_offset) = global.link_offset {
                out.write_u32(link_offset);
            } else if global.ty.is_64bit() {
                out.write_u64(global.init_bits);
            } else {
                out.write_u32(global.init_bits as u32);
            }
        }
        let size = out.pos() - start;
        out.write_u32(count);
        out.write_u32(size);
    }

    // 4. Exported functions, wrappers embedded.
    {
        let start = out.pos();
        let mut count = 0u32;
        for export in &module.exports {
            let EntityIndex::Function(func) = export.index else {
                continue;
            };
            let decl = module.functions[func];
            if func.as_u32() < module.num_imported_functions() {
                return Err(crate::wasm_unsupported!("exporting an imported function"));
            }
            let sig = module.types[decl.type_index].clone();
            let sig_str = signature_string(&sig.params, &sig.results);
            count += 1;
            out.write_u32(func.as_u32());
            out.write_u32(export.name.len() as u32);
            out.write_padded(export.name.as_bytes());
            out.write_u32(sig_str.len() as u32);
            out.write_padded(sig_str.as_bytes());
            let wrapper_size_site = out.reserve_u32();
            let wrapper_start = out.pos();
            ActiveIsa::emit_export_wrapper(&mut out, &sig, body_offsets[&func]);
            out.pad_to(4);
            out.patch_u32(wrapper_size_site, out.pos() - wrapper_start);
        }
        let size = out.pos() - start;
        out.write_u32(count);
        out.write_u32(size);
    }

    // 3. Link status, one byte per imported function.
    {
        for (_, import) in module.imported_functions.iter() {
            out.write_u8(import.link_status());
        }
        out.pad_to(4);
        out.write_u32(module.num_imported_functions());
    }

    // 2. Table: canonical signature index + self-relative body offset.
    {
        if let Some(table) = &module.table {
            for (sig, func) in &table.entries {
                out.write_u32(sig.map_or(NONE_U32, |s| s.as_u32()));
                match func {
                    Some(func) => {
                        let field_pos = out.pos();
                        out.write_u32(field_pos - body_offsets[func]);
                    }
                    None => out.write_u32(NONE_U32),
                }
            }
            out.write_u32(table.entries.len() as u32);
        } else {
            out.write_u32(0);
        }
    }

    // 1. Table-entry wrapper offsets, self-relative.
    {
        for wrapper in &table_wrapper_offsets {
            if *wrapper == NONE_U32 {
                out.write_u32(NONE_U32);
            } else {
                let field_pos = out.pos();
                out.write_u32(field_pos - *wrapper);
            }
        }
        out.write_u32(table_wrapper_offsets.len() as u32);
    }

    // Landing pad offset, self-relative backward.
    match landing_pad {
        Some(pad) => {
            let field_pos = out.pos();
            out.write_u32(field_pos - pad);
        }
        None => out.write_u32(NONE_U32),
    }

    // Trailer.
    let module_size = out.pos() + 16;
    out.write_u32(module_size);
    out.write_u32(BINARY_VERSION);
    let flags = (stacktrace_records & 0x7FFF_FFFF) | if debug_mode { 0x8000_0000 } else { 0 };
    out.write_u32(flags);
    out.write_u32(plan.total_size());

    debug_assert_eq!(out.pos() % 4, 0);
    Ok(out.into_bytes())
}

/// Pull the remaining pieces out of the frontend without fighting the
/// borrow checker in `serialize`.
impl Frontend<'_, '_> {
    pub fn finish(self) -> crate::Result<FinishedParts> {
        let trap_entry = self.masm.trap_entry;
        let debug = self
            .debug
            .as_ref()
            .map(|d| d.serialize(trap_entry));
        let image = serialize(self)?;
        Ok(FinishedParts { image, debug })
    }
}

pub struct FinishedParts {
    pub image: Vec<u8>,
    pub debug: Option<Vec<u8>>,
}

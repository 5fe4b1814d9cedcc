use crate::compile::output::Output;
use crate::runtime::link_data::offsets as ld;

/// Parallel artifact produced in debug mode: bytecode-offset ↔
/// machine-code-offset pairs per function plus enough link-data geometry
/// for a debugger to locate live state.
///
/// Layout, all little-endian u32 unless noted:
/// `version`, `last_frame_link_offset`, `linmem_size_link_offset`,
/// `link_data_start`, `generic_trap_offset`, then
/// `num_mutable_globals` × `{ wasm_global_index, link_data_offset }`, then
/// `num_defined_functions` × `{ wasm_fn_index, num_locals,
/// local_frame_offsets…, num_map_entries, (wasm_in, native_out)… }`.
#[derive(Debug, Default)]
pub struct DebugMap {
    globals: Vec<(u32, u32)>,
    functions: Vec<FunctionMap>,
}

#[derive(Debug)]
struct FunctionMap {
    wasm_index: u32,
    /// Frame displacement of each local, in slot-index form.
    local_offsets: Vec<u32>,
    /// `(bytecode offset within the body, native offset within the code
    /// region)` per emitted instruction.
    entries: Vec<(u32, u32)>,
}

pub const DEBUG_MAP_VERSION: u32 = 1;

impl DebugMap {
    pub fn record_mutable_global(&mut self, wasm_index: u32, link_offset: u32) {
        self.globals.push((wasm_index, link_offset));
    }

    pub fn begin_function(&mut self, wasm_index: u32, num_locals: u32) {
        self.functions.push(FunctionMap {
            wasm_index,
            local_offsets: (0..num_locals).map(|i| 8 * (i + 1)).collect(),
            entries: Vec::new(),
        });
    }

    pub fn record_instruction(&mut self, wasm_offset: u32, native_offset: u32) {
        let f = self.functions.last_mut().expect("begin_function first");
        // Coalesce instructions that emitted nothing new.
        if f.entries.last().map(|e| e.1) == Some(native_offset) {
            return;
        }
        f.entries.push((wasm_offset, native_offset));
    }

    pub fn serialize(&self, trap_entry_offset: u32) -> Vec<u8> {
        let mut out = Output::new();
        out.write_u32(DEBUG_MAP_VERSION);
        out.write_u32(ld::LAST_FRAME);
        out.write_u32(ld::LINMEM_SIZE);
        out.write_u32(0); // link data starts at the region base
        out.write_u32(trap_entry_offset);
        out.write_u32(self.globals.len() as u32);
        for (index, offset) in &self.globals {
            out.write_u32(*index);
            out.write_u32(*offset);
        }
        out.write_u32(self.functions.len() as u32);
        for f in &self.functions {
            out.write_u32(f.wasm_index);
            out.write_u32(f.local_offsets.len() as u32);
            for off in &f.local_offsets {
                out.write_u32(*off);
            }
            out.write_u32(f.entries.len() as u32);
            for (wasm, native) in &f.entries {
                out.write_u32(*wasm);
                out.write_u32(*native);
            }
        }
        out.into_bytes()
    }

    pub fn function_entries(&self, nth: usize) -> &[(u32, u32)] {
        &self.functions[nth].entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_coalesce_empty_instructions() {
        let mut map = DebugMap::default();
        map.begin_function(0, 2);
        map.record_instruction(0, 64);
        map.record_instruction(2, 64); // no code emitted for this one
        map.record_instruction(4, 72);
        assert_eq!(map.function_entries(0), &[(0, 64), (4, 72)]);
    }

    #[test]
    fn serialized_header_shape() {
        let mut map = DebugMap::default();
        map.record_mutable_global(3, 0x98);
        let bytes = map.serialize(4);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), DEBUG_MAP_VERSION);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 4);
        assert_eq!(u32::from_le_bytes(bytes[20..24].try_into().unwrap()), 1);
        assert_eq!(bytes.len() % 4, 0);
    }
}

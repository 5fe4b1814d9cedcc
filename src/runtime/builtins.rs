//! Host functions the runtime itself provides under the `builtin` import
//! module: an explicit trap and accessors for the host-linked read-only
//! memory.

use crate::runtime::link_data::offsets as ld;
use crate::runtime::trap_handling::{active, raise_trap_from_host};
use crate::symbols::{AbiVersion, Linkage, NativeSymbol};
use crate::traps::TrapCode;
use core::ffi::c_void;

pub fn native_symbols() -> Vec<NativeSymbol> {
    vec![
        NativeSymbol::new(
            "builtin",
            "trap",
            "()",
            builtin_trap as *const c_void,
            Linkage::Dynamic,
            AbiVersion::V1,
        ),
        NativeSymbol::new(
            "builtin",
            "linked_memory_size",
            "()i",
            builtin_linked_memory_size as *const c_void,
            Linkage::Dynamic,
            AbiVersion::V1,
        ),
        NativeSymbol::new(
            "builtin",
            "read_linked_memory_i32",
            "(i)i",
            builtin_read_linked_memory_i32 as *const c_void,
            Linkage::Dynamic,
            AbiVersion::V1,
        ),
    ]
}

fn linked_memory() -> (usize, usize) {
    let active = active().expect("builtin called with no active runtime");
    // SAFETY: the link data region outlives any call into the module.
    unsafe {
        let ptr = *active.link_data.add(ld::LINKED_MEM_PTR as usize).cast::<u64>();
        let len = *active.link_data.add(ld::LINKED_MEM_LEN as usize).cast::<u64>();
        (ptr as usize, len as usize)
    }
}

extern "C" fn builtin_trap(_ctx: *mut c_void) {
    raise_trap_from_host(TrapCode::BuiltinTrap)
}

extern "C" fn builtin_linked_memory_size(_ctx: *mut c_void) -> i32 {
    let (ptr, len) = linked_memory();
    if ptr == 0 {
        raise_trap_from_host(TrapCode::LinkedMemoryNotLinked);
    }
    len as i32
}

extern "C" fn builtin_read_linked_memory_i32(offset: i32, _ctx: *mut c_void) -> i32 {
    let (ptr, len) = linked_memory();
    if ptr == 0 {
        raise_trap_from_host(TrapCode::LinkedMemoryNotLinked);
    }
    let offset = offset as u32 as usize;
    if offset.checked_add(4).map_or(true, |end| end > len) {
        raise_trap_from_host(TrapCode::LinkedMemoryOutOfBounds);
    }
    // SAFETY: bounds-checked read within the linked region.
    unsafe { ((ptr + offset) as *const i32).read_unaligned() }
}

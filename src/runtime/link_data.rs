use crate::utils::align8_u32;

/// Fixed header slots at the start of the link-data region.
///
/// The region is 8-byte aligned as a whole and every slot is an 8-byte cell
/// (32-bit targets use the low half), so the `u32` offsets stored in the
/// frozen binary are always sufficient even for 8-byte globals.
///
/// Generated code addresses these as constant displacements off the pinned
/// link-data base register; the runtime fills them at init and reads them
/// back during trap recovery.
pub mod offsets {
    /// Linear memory base address.
    pub const LINMEM_BASE: u32 = 0x00;
    /// Current wasm-visible linear memory size in bytes.
    pub const LINMEM_SIZE: u32 = 0x08;
    /// Stack pointer saved by the innermost active export wrapper.
    pub const LAST_FRAME: u32 = 0x10;
    /// Recovery label of the innermost active export wrapper.
    pub const RECOVERY_PC: u32 = 0x18;
    /// Address of the module's generic trap entry (for host builtins).
    pub const TRAP_FN: u32 = 0x20;
    /// Trap code left behind by the generic trap entry; zero means the
    /// last call returned normally.
    pub const TRAP_CODE: u32 = 0x28;
    /// Interruption-request flag polled at backedges and call sites.
    pub const INTERRUPT_FLAG: u32 = 0x30;
    /// Opaque runtime context passed to host calls.
    pub const RUNTIME_CTX: u32 = 0x38;
    /// Host probe function called by the landing pad.
    pub const PROBE_FN: u32 = 0x40;
    /// Fault offset argument for the next probe call.
    pub const PROBE_OFFSET: u32 = 0x48;
    /// Host helper implementing `memory.grow`.
    pub const MEMORY_GROW_FN: u32 = 0x50;
    /// Host-linked read-only memory: base pointer, zero when unlinked.
    pub const LINKED_MEM_PTR: u32 = 0x58;
    /// Host-linked read-only memory: length in bytes.
    pub const LINKED_MEM_LEN: u32 = 0x60;
    /// Stack fence value for targets with active stack checks.
    pub const STACK_FENCE: u32 = 0x68;
    /// Next stacktrace ring slot to write (u32).
    pub const RING_IDX: u32 = 0x70;
    /// Live stacktrace entry count (u32, may exceed the capacity).
    pub const RING_COUNT: u32 = 0x74;
    /// First byte after the fixed header. On hard-float targets the
    /// stacktrace ring starts here; softfloat targets interpose their aux
    /// dispatch table first.
    pub const RING_SLOTS: u32 = 0x78;
}

/// Bytes per indirect-call table image entry:
/// `{ sig_u32, pad_u32, code_addr_u64 }`.
pub const TABLE_ENTRY_SIZE: u32 = 16;

/// Size of the table image for `n` entries (leading count + pad).
pub const fn table_image_size(entries: u32) -> u32 {
    8 + entries * TABLE_ENTRY_SIZE
}

/// Number of aux dispatch slots (softfloat thunks plus integer helpers)
/// reserved on targets without float hardware.
pub const AUX_DISPATCH_SLOTS: u32 = crate::compile::backend::softfloat::AUX_TABLE_ENTRIES;

/// Assigns link-data offsets during compilation.
///
/// Layout: fixed header, stacktrace ring, optional softfloat dispatch table,
/// then 8-byte slots for dynamic imports and mutable globals in parse order,
/// and finally the indirect-call table image. The runtime reconstructs the
/// table image offset as `link_data_size - table_image_size(entries)`; the
/// slot offsets themselves travel in the frozen binary.
#[derive(Debug, Clone)]
pub struct LinkDataPlan {
    pub stacktrace_records: u32,
    softfloat_table: Option<u32>,
    next: u32,
    table_entries: u32,
}

impl LinkDataPlan {
    pub fn new(stacktrace_records: u32, needs_softfloat_table: bool) -> Self {
        let softfloat_table = needs_softfloat_table.then_some(offsets::RING_SLOTS);
        let ring = Self::ring_offset(needs_softfloat_table);
        let next = align8_u32(ring + 4 * stacktrace_records);
        Self {
            stacktrace_records,
            softfloat_table,
            next,
            table_entries: 0,
        }
    }

    fn ring_offset(needs_softfloat_table: bool) -> u32 {
        if needs_softfloat_table {
            offsets::RING_SLOTS + 8 * AUX_DISPATCH_SLOTS
        } else {
            offsets::RING_SLOTS
        }
    }

    /// Offset of the first stacktrace ring slot.
    pub fn ring_slots_offset(&self) -> u32 {
        Self::ring_offset(self.softfloat_table.is_some())
    }

    /// Claim the next 8-byte slot (dynamic import or mutable global).
    pub fn alloc_slot(&mut self) -> u32 {
        let offset = self.next;
        self.next += 8;
        offset
    }

    pub fn softfloat_table_offset(&self) -> Option<u32> {
        self.softfloat_table
    }

    pub fn set_table_entries(&mut self, entries: u32) {
        self.table_entries = entries;
    }

    pub fn table_entries(&self) -> u32 {
        self.table_entries
    }

    /// Offset of the table image. Only valid once every slot has been
    /// allocated (code emission happens after all declaration sections).
    pub fn table_image_offset(&self) -> u32 {
        self.next
    }

    pub fn total_size(&self) -> u32 {
        self.next + table_image_size(self.table_entries)
    }
}

/// Recompute the table image offset on the loading side.
pub fn table_image_offset_from_total(link_data_size: u32, entries: u32) -> u32 {
    link_data_size - table_image_size(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_round_trips_to_the_loader() {
        let mut plan = LinkDataPlan::new(10, false);
        let a = plan.alloc_slot();
        let b = plan.alloc_slot();
        assert_eq!(b - a, 8);
        assert_eq!(a % 8, 0);
        plan.set_table_entries(3);
        assert_eq!(
            table_image_offset_from_total(plan.total_size(), 3),
            plan.table_image_offset()
        );
    }

    #[test]
    fn ring_is_padded_to_slot_alignment() {
        let plan = LinkDataPlan::new(1, false);
        assert_eq!(plan.table_image_offset() % 8, 0);
        let plan = LinkDataPlan::new(0, false);
        assert_eq!(plan.table_image_offset(), offsets::RING_SLOTS);
    }
}

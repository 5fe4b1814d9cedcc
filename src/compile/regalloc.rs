use crate::compile::stack::{Stack, StackElement, TempSlots};
use crate::values::{RegClass, ValType};
use smallvec::SmallVec;

/// A hardware register in one of the two allocation classes. The id is the
/// backend's own encoding number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    pub class: RegClass,
    pub id: u8,
}

impl Reg {
    pub const fn new(class: RegClass, id: u8) -> Self {
        Self { class, id }
    }

    pub const fn gpr(id: u8) -> Self {
        Self::new(RegClass::Int, id)
    }

    pub const fn fpr(id: u8) -> Self {
        Self::new(RegClass::Float, id)
    }
}

/// Where a spill victim's value was moved; the lowering layer emits the
/// matching move before reusing the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillTarget {
    /// An unused register in the other class that can hold the bit pattern.
    OtherClassReg(Reg),
    /// A temp slot in the current frame.
    Slot(u32),
}

/// Result of an allocation request. `spilled` is present when a victim had
/// to be evicted; the caller emits the actual data movement (the stack
/// element has already been rewritten to the new backing).
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub reg: Reg,
    pub spilled: Option<Spill>,
}

#[derive(Debug, Clone, Copy)]
pub struct Spill {
    pub from: Reg,
    pub to: SpillTarget,
    pub ty: ValType,
}

/// Two-class register allocator with spill-to-register and spill-to-slot.
///
/// Victim choice is LRU by stack position: the register whose occupant sits
/// deepest in the compile stack. Under `force_high_pressure` the free lists
/// are clamped so that (almost) every allocation spills.
pub struct RegAllocator {
    int_all: SmallVec<[Reg; 16]>,
    float_all: SmallVec<[Reg; 16]>,
    int_free: SmallVec<[Reg; 16]>,
    float_free: SmallVec<[Reg; 16]>,
    /// Whether the backend can park an integer bit pattern in a float
    /// register (and vice versa) as a spill target.
    cross_class_spill: bool,
    /// Histogram of free-list length observed at allocation time, one
    /// bucket per length, shared by both classes.
    pressure: Vec<u32>,
}

/// Registers left allocatable per class in high-pressure mode: one operand
/// in flight plus one incoming.
const HIGH_PRESSURE_REGS: usize = 2;

impl RegAllocator {
    pub fn new(
        int_regs: &[Reg],
        float_regs: &[Reg],
        cross_class_spill: bool,
        force_high_pressure: bool,
    ) -> Self {
        let clamp = |regs: &[Reg]| -> SmallVec<[Reg; 16]> {
            if force_high_pressure {
                regs.iter().copied().take(HIGH_PRESSURE_REGS).collect()
            } else {
                regs.iter().copied().collect()
            }
        };
        let int_all = clamp(int_regs);
        let float_all = clamp(float_regs);
        let bucket_count = int_all.len().max(float_all.len()) + 1;
        let mut allocator = Self {
            int_free: SmallVec::new(),
            float_free: SmallVec::new(),
            int_all,
            float_all,
            cross_class_spill,
            pressure: vec![0; bucket_count],
        };
        allocator.reset();
        allocator
    }

    /// Return every register to its free list (function boundary).
    pub fn reset(&mut self) {
        self.int_free = self.int_all.clone();
        self.float_free = self.float_all.clone();
        // Free lists are popped from the back; keep ids in reverse so low
        // ids are handed out first, deterministically.
        self.int_free.reverse();
        self.float_free.reverse();
    }

    fn free_list(&mut self, class: RegClass) -> &mut SmallVec<[Reg; 16]> {
        match class {
            RegClass::Int => &mut self.int_free,
            RegClass::Float => &mut self.float_free,
        }
    }

    pub fn num_free(&self, class: RegClass) -> usize {
        match class {
            RegClass::Int => self.int_free.len(),
            RegClass::Float => self.float_free.len(),
        }
    }

    pub fn is_free(&self, reg: Reg) -> bool {
        match reg.class {
            RegClass::Int => self.int_free.contains(&reg),
            RegClass::Float => self.float_free.contains(&reg),
        }
    }

    /// Whether `reg` belongs to the allocatable set at all.
    pub fn is_allocatable(&self, reg: Reg) -> bool {
        match reg.class {
            RegClass::Int => self.int_all.contains(&reg),
            RegClass::Float => self.float_all.contains(&reg),
        }
    }

    pub fn free(&mut self, reg: Reg) {
        debug_assert!(self.is_allocatable(reg));
        debug_assert!(!self.is_free(reg));
        self.free_list(reg.class).push(reg);
    }

    fn record_pressure(&mut self, free_len: usize) {
        let idx = free_len.min(self.pressure.len() - 1);
        self.pressure[idx] += 1;
    }

    pub fn pressure_histogram(&self) -> &[u32] {
        &self.pressure
    }

    /// Allocate a register of `class`, spilling the deepest stack occupant
    /// when the free list is empty.
    pub fn alloc(
        &mut self,
        class: RegClass,
        stack: &mut Stack,
        slots: &mut TempSlots,
    ) -> Allocation {
        let free_len = self.num_free(class);
        self.record_pressure(free_len);
        if let Some(reg) = self.free_list(class).pop() {
            return Allocation { reg, spilled: None };
        }

        let (pos, victim) = stack
            .deepest_register_of_class(class)
            .expect("register class exhausted with no stack occupant");
        let ty = stack.get(pos).ty();

        let target = self.spill_target(class, ty, slots, pos);
        let replacement = match target {
            SpillTarget::OtherClassReg(reg) => StackElement::Register { ty, reg },
            SpillTarget::Slot(slot) => StackElement::TempSlot { ty, slot },
        };
        stack.rewrite(pos, replacement);

        Allocation {
            reg: victim,
            spilled: Some(Spill {
                from: victim,
                to: target,
                ty,
            }),
        }
    }

    /// Claim a specific register (ABI constraints). If it is occupied the
    /// occupant is spilled exactly like in `alloc`.
    pub fn take(&mut self, reg: Reg, stack: &mut Stack, slots: &mut TempSlots) -> Option<Spill> {
        debug_assert!(self.is_allocatable(reg));
        if let Some(pos) = self.free_list(reg.class).iter().position(|r| *r == reg) {
            self.free_list(reg.class).remove(pos);
            return None;
        }
        let pos = stack
            .position_of_register(reg)
            .expect("taken register neither free nor on the stack");
        let ty = stack.get(pos).ty();
        let target = self.spill_target(reg.class, ty, slots, pos);
        let replacement = match target {
            SpillTarget::OtherClassReg(other) => StackElement::Register { ty, reg: other },
            SpillTarget::Slot(slot) => StackElement::TempSlot { ty, slot },
        };
        stack.rewrite(pos, replacement);
        Some(Spill {
            from: reg,
            to: target,
            ty,
        })
    }

    /// Spill destination for the victim at stack position `pos`: an idle
    /// register in the other class where the ISA allows it, else the
    /// victim's canonical frame slot.
    fn spill_target(
        &mut self,
        class: RegClass,
        ty: ValType,
        slots: &mut TempSlots,
        pos: usize,
    ) -> SpillTarget {
        if self.cross_class_spill {
            let other = match class {
                RegClass::Int => RegClass::Float,
                RegClass::Float => RegClass::Int,
            };
            if let Some(reg) = self.free_list(other).pop() {
                let _ = ty;
                return SpillTarget::OtherClassReg(reg);
            }
        }
        let slot = pos as u32;
        slots.alloc_at(slot);
        SpillTarget::Slot(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GPRS: &[Reg] = &[Reg::gpr(1), Reg::gpr(2), Reg::gpr(3)];
    const FPRS: &[Reg] = &[Reg::fpr(0), Reg::fpr(1)];

    #[test]
    fn hands_out_low_ids_first() {
        let mut regs = RegAllocator::new(GPRS, FPRS, false, false);
        let mut stack = Stack::new();
        let mut slots = TempSlots::default();
        let a = regs.alloc(RegClass::Int, &mut stack, &mut slots);
        assert_eq!(a.reg, Reg::gpr(1));
        assert!(a.spilled.is_none());
        let b = regs.alloc(RegClass::Int, &mut stack, &mut slots);
        assert_eq!(b.reg, Reg::gpr(2));
    }

    #[test]
    fn exhaustion_spills_the_deepest_occupant() {
        let mut regs = RegAllocator::new(GPRS, FPRS, false, false);
        let mut stack = Stack::new();
        let mut slots = TempSlots::default();
        for _ in 0..GPRS.len() {
            let a = regs.alloc(RegClass::Int, &mut stack, &mut slots);
            stack.push(StackElement::Register {
                ty: ValType::I32,
                reg: a.reg,
            });
        }
        let a = regs.alloc(RegClass::Int, &mut stack, &mut slots);
        // Deepest occupant was gpr1; it got evicted into slot 0.
        assert_eq!(a.reg, Reg::gpr(1));
        let spill = a.spilled.unwrap();
        assert_eq!(spill.from, Reg::gpr(1));
        assert_eq!(spill.to, SpillTarget::Slot(0));
        assert_eq!(
            *stack.get(0),
            StackElement::TempSlot {
                ty: ValType::I32,
                slot: 0
            }
        );
    }

    #[test]
    fn cross_class_spill_prefers_idle_other_class() {
        let mut regs = RegAllocator::new(GPRS, FPRS, true, false);
        let mut stack = Stack::new();
        let mut slots = TempSlots::default();
        for _ in 0..GPRS.len() {
            let a = regs.alloc(RegClass::Int, &mut stack, &mut slots);
            stack.push(StackElement::Register {
                ty: ValType::I32,
                reg: a.reg,
            });
        }
        let a = regs.alloc(RegClass::Int, &mut stack, &mut slots);
        assert!(matches!(
            a.spilled.unwrap().to,
            SpillTarget::OtherClassReg(r) if r.class == RegClass::Float
        ));
        assert_eq!(slots.active(), 0);
    }

    #[test]
    fn high_pressure_clamps_the_free_list() {
        let mut regs = RegAllocator::new(GPRS, FPRS, false, true);
        let mut stack = Stack::new();
        let mut slots = TempSlots::default();
        let a = regs.alloc(RegClass::Int, &mut stack, &mut slots);
        stack.push(StackElement::Register {
            ty: ValType::I32,
            reg: a.reg,
        });
        let b = regs.alloc(RegClass::Int, &mut stack, &mut slots);
        stack.push(StackElement::Register {
            ty: ValType::I32,
            reg: b.reg,
        });
        // Third allocation must spill already.
        let c = regs.alloc(RegClass::Int, &mut stack, &mut slots);
        assert!(c.spilled.is_some());
    }

    #[test]
    fn take_evicts_the_exact_occupant() {
        let mut regs = RegAllocator::new(GPRS, FPRS, false, false);
        let mut stack = Stack::new();
        let mut slots = TempSlots::default();
        let a = regs.alloc(RegClass::Int, &mut stack, &mut slots);
        stack.push(StackElement::Register {
            ty: ValType::I64,
            reg: a.reg,
        });
        let spill = regs.take(Reg::gpr(1), &mut stack, &mut slots).unwrap();
        assert_eq!(spill.from, Reg::gpr(1));
        // And taking a free register is silent.
        assert!(regs.take(Reg::gpr(2), &mut stack, &mut slots).is_none());
    }
}

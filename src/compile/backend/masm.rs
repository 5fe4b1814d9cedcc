//! Shared lowering layer between the frontend and the ISA emitters.
//!
//! Owns the output buffer, the compile stack, the register allocator and
//! the temp-slot bookkeeping for the function being compiled. The frontend
//! drives one method per opcode family; the methods materialize operands,
//! spill, and delegate pure encoding to the active [`Isa`].
//!
//! Canonical state: the operand at stack position `k` has frame slot
//! `num_locals + k` as its home. Control-flow merges always go through
//! canonical slots, so every path reaching a label agrees on where values
//! live.

use crate::compile::backend::softfloat::{AuxOp, SoftfloatFn};
use crate::compile::backend::{
    FloatCmp, FloatOp, FloatUn, IntCmp, IntOp, IntUnOp, Isa, MemAccess, ShiftOp,
};
use crate::compile::module_info::{FuncSignature, ImportResolution, ImportedFunction};
use crate::compile::output::{Output, PatchSite};
use crate::compile::regalloc::{Reg, RegAllocator, Spill, SpillTarget};
use crate::compile::stack::{Stack, StackElement, TempSlots};
use crate::errors::CompileError;
use crate::runtime::link_data::offsets as ld;
use crate::symbols::AbiVersion;
use crate::traps::TrapCode;
use crate::values::{RegClass, ValType};
use core::marker::PhantomData;

pub struct Masm<I: Isa> {
    out: Output,
    stack: Stack,
    regs: RegAllocator,
    slots: TempSlots,
    num_locals: u32,
    frame_patch: Option<PatchSite>,
    pub trap_entry: u32,
    pub table_off: u32,
    debug_mode: bool,
    stacktrace_cap: u32,
    interruption_polls: bool,
    _isa: PhantomData<I>,
}

impl<I: Isa> Masm<I> {
    pub fn new(force_high_pressure: bool, debug_mode: bool) -> Self {
        Self {
            out: Output::new(),
            stack: Stack::new(),
            regs: RegAllocator::new(
                I::ALLOC_GPRS,
                I::ALLOC_FPRS,
                I::CROSS_CLASS_SPILL,
                force_high_pressure,
            ),
            slots: TempSlots::default(),
            num_locals: 0,
            frame_patch: None,
            trap_entry: 0,
            table_off: 0,
            debug_mode,
            stacktrace_cap: 0,
            interruption_polls: true,
            _isa: PhantomData,
        }
    }

    pub fn configure(&mut self, stacktrace_cap: u32, interruption_polls: bool) {
        self.stacktrace_cap = stacktrace_cap;
        self.interruption_polls = interruption_polls;
    }

    pub fn out(&mut self) -> &mut Output {
        &mut self.out
    }

    pub fn pos(&self) -> u32 {
        self.out.pos()
    }

    pub fn into_output(self) -> Output {
        self.out
    }

    pub fn stack_height(&self) -> usize {
        self.stack.len()
    }

    pub fn pressure_histogram(&self) -> &[u32] {
        self.regs.pressure_histogram()
    }

    // ---- per-value classification --------------------------------------

    fn reg_class(ty: ValType) -> RegClass {
        if I::HAS_HARD_FLOAT {
            ty.class()
        } else {
            RegClass::Int
        }
    }

    fn is_slot_ty(ty: ValType) -> bool {
        I::SLOT_ONLY_64BIT && ty.is_64bit()
    }

    fn slot_of_pos(&self, pos: usize) -> u32 {
        self.num_locals + pos as u32
    }

    // ---- function scaffolding ------------------------------------------

    /// Frame setup, argument homing, local zeroing, stacktrace prologue.
    /// `locals` is the full list: parameters first, then declared locals.
    pub fn start_function(
        &mut self,
        sig: &FuncSignature,
        locals: &[ValType],
        func_index: u32,
    ) -> crate::Result<()> {
        self.stack.reset();
        self.slots.reset();
        self.regs.reset();
        self.num_locals = locals.len() as u32;

        let patch = I::prologue(&mut self.out, self.trap_entry);
        self.frame_patch = Some(patch);

        // Home the register arguments into their local slots.
        let mut next_gpr = 0usize;
        let mut next_fpr = 0usize;
        for (i, ty) in sig.params.iter().enumerate() {
            match Self::reg_class(*ty) {
                RegClass::Int => {
                    let needed = if Self::is_slot_ty(*ty) { 2 } else { 1 };
                    if next_gpr + needed > I::ARG_GPRS.len() {
                        return Err(CompileError::ImplementationLimit(
                            "too many parameters for the platform".into(),
                        ));
                    }
                    if needed == 2 {
                        let lo = I::ARG_GPRS[next_gpr];
                        let hi = I::ARG_GPRS[next_gpr + 1];
                        I::store_slot_pair(&mut self.out, lo, hi, i as u32);
                    } else {
                        I::store_slot(&mut self.out, I::ARG_GPRS[next_gpr], i as u32, *ty);
                    }
                    next_gpr += needed;
                }
                RegClass::Float => {
                    if next_fpr >= I::ARG_FPRS.len() {
                        return Err(CompileError::ImplementationLimit(
                            "too many parameters for the platform".into(),
                        ));
                    }
                    I::store_slot(&mut self.out, I::ARG_FPRS[next_fpr], i as u32, *ty);
                    next_fpr += 1;
                }
            }
        }
        // Locals start zeroed.
        for i in sig.params.len()..locals.len() {
            I::store_zero_slot(&mut self.out, i as u32);
        }
        if self.stacktrace_cap > 0 {
            I::stacktrace_push(&mut self.out, func_index, self.stacktrace_cap);
        }
        Ok(())
    }

    /// Emit the function exit: stacktrace epilogue, result into the return
    /// registers, frame teardown.
    pub fn emit_return(&mut self, sig: &FuncSignature) {
        if self.stacktrace_cap > 0 {
            I::stacktrace_pop(&mut self.out, self.stacktrace_cap);
        }
        if let Some(ty) = sig.results.first().copied() {
            let elem = self.stack.pop().expect("validated return value");
            let pos = self.stack.len();
            self.move_into_ret(elem, pos, ty);
        }
        I::epilogue(&mut self.out);
    }

    fn move_into_ret(&mut self, elem: StackElement, pos: usize, ty: ValType) {
        self.copy_into_ret(elem, pos, ty);
        self.release(&elem);
    }

    /// Read a value into the return register(s) without releasing its
    /// backing (conditional-return paths keep the operand stack intact).
    fn copy_into_ret(&mut self, elem: StackElement, pos: usize, ty: ValType) {
        if Self::is_slot_ty(ty) {
            let slot = match elem {
                StackElement::TempSlot { slot, .. } => self.num_locals + slot,
                StackElement::Local { index, .. } => index,
                StackElement::Constant { bits, .. } => {
                    I::mov_imm(&mut self.out, I::RET_GPR, bits & 0xFFFF_FFFF, false);
                    I::mov_imm(&mut self.out, I::RET_GPR2, bits >> 32, false);
                    return;
                }
                _ => unreachable!("wide operands are slot resident"),
            };
            let _ = pos;
            I::load_slot_pair(&mut self.out, I::RET_GPR, I::RET_GPR2, slot);
            return;
        }
        let ret = match Self::reg_class(ty) {
            RegClass::Int => I::RET_GPR,
            RegClass::Float => I::RET_FPR,
        };
        match elem {
            StackElement::Constant { bits, .. } => {
                if ret.class == RegClass::Float {
                    I::fmov_imm(&mut self.out, ret, bits, ty.is_64bit());
                } else {
                    I::mov_imm(&mut self.out, ret, bits, ty.is_64bit());
                }
            }
            StackElement::Local { index, .. } => {
                I::load_slot(&mut self.out, ret, index, ty);
            }
            StackElement::TempSlot { slot, .. } => {
                I::load_slot(&mut self.out, ret, self.num_locals + slot, ty);
            }
            StackElement::Register { reg, .. } => {
                I::mov_rr(&mut self.out, ret, reg, ty);
            }
            StackElement::Dummy { .. } => unreachable!("dummy materialized"),
        }
    }

    /// Return sequence for branches targeting the function frame: reads
    /// the result without popping it, so the fall-through path continues
    /// with the stack unchanged.
    pub fn emit_return_peek(&mut self, sig: &FuncSignature) {
        if self.stacktrace_cap > 0 {
            I::stacktrace_pop(&mut self.out, self.stacktrace_cap);
        }
        if let Some(ty) = sig.results.first().copied() {
            let pos = self.stack.len() - 1;
            let elem = *self.stack.peek().expect("validated return value");
            self.copy_into_ret(elem, pos, ty);
        }
        I::epilogue(&mut self.out);
    }

    /// Finish the body: patch the frame size.
    pub fn end_function(&mut self) -> crate::Result<()> {
        let slots = self.num_locals + self.slots.peak();
        let frame = (8 * slots + 15) & !15;
        if frame > I::MAX_FRAME_BYTES {
            return Err(CompileError::ImplementationLimit(
                "function frame exceeds the platform limit".into(),
            ));
        }
        let patch = self.frame_patch.take().expect("start_function not called");
        I::patch_frame_size(&mut self.out, patch, frame);
        Ok(())
    }

    // ---- element plumbing ----------------------------------------------

    pub fn push_const(&mut self, ty: ValType, bits: u64) {
        if self.debug_mode {
            // In-order emission: the constant goes to its canonical slot
            // right away instead of folding into a later instruction.
            let pos = self.stack.len();
            let slot = self.slot_of_pos(pos);
            self.slots.alloc_at(pos as u32);
            I::store_slot_imm64(&mut self.out, slot, bits);
            self.stack.push(StackElement::TempSlot {
                ty,
                slot: pos as u32,
            });
        } else {
            self.stack.push(StackElement::Constant { ty, bits });
        }
    }

    fn emit_spill(&mut self, spill: Spill) {
        match spill.to {
            SpillTarget::OtherClassReg(reg) => {
                I::mov_rr(&mut self.out, reg, spill.from, spill.ty);
            }
            SpillTarget::Slot(slot) => {
                I::store_slot(&mut self.out, spill.from, self.num_locals + slot, spill.ty);
            }
        }
    }

    fn alloc_reg(&mut self, class: RegClass) -> Reg {
        let allocation = self.regs.alloc(class, &mut self.stack, &mut self.slots);
        if let Some(spill) = allocation.spilled {
            self.emit_spill(spill);
        }
        allocation.reg
    }

    fn take_reg(&mut self, reg: Reg) {
        if let Some(spill) = self.regs.take(reg, &mut self.stack, &mut self.slots) {
            self.emit_spill(spill);
        }
    }

    /// Bring a (non-slot-typed) element into a register of its class.
    /// `pos` is the stack position the element was popped from.
    fn materialize(&mut self, elem: StackElement, pos: usize, ty: ValType) -> Reg {
        debug_assert!(!Self::is_slot_ty(ty));
        match elem {
            StackElement::Register { reg, .. } => reg,
            StackElement::Constant { bits, .. } => {
                let reg = self.alloc_reg(Self::reg_class(ty));
                if reg.class == RegClass::Float {
                    I::fmov_imm(&mut self.out, reg, bits, ty.is_64bit());
                } else {
                    I::mov_imm(&mut self.out, reg, bits, ty.is_64bit());
                }
                reg
            }
            StackElement::Local { index, .. } => {
                let reg = self.alloc_reg(Self::reg_class(ty));
                I::load_slot(&mut self.out, reg, index, ty);
                reg
            }
            StackElement::TempSlot { slot, .. } => {
                let reg = self.alloc_reg(Self::reg_class(ty));
                I::load_slot(&mut self.out, reg, self.num_locals + slot, ty);
                self.slots.free(slot);
                let _ = pos;
                reg
            }
            StackElement::Dummy { .. } => unreachable!("dummy materialized"),
        }
    }

    /// Bring an element into a specific register (ABI constraints); the
    /// register has already been claimed via `take_reg` or is known free.
    fn materialize_into(&mut self, elem: StackElement, reg: Reg, ty: ValType) {
        match elem {
            StackElement::Register { reg: src, .. } => {
                if src != reg {
                    I::mov_rr(&mut self.out, reg, src, ty);
                    self.regs.free(src);
                }
            }
            StackElement::Constant { bits, .. } => {
                if reg.class == RegClass::Float {
                    I::fmov_imm(&mut self.out, reg, bits, ty.is_64bit());
                } else {
                    I::mov_imm(&mut self.out, reg, bits, ty.is_64bit());
                }
            }
            StackElement::Local { index, .. } => {
                I::load_slot(&mut self.out, reg, index, ty);
            }
            StackElement::TempSlot { slot, .. } => {
                I::load_slot(&mut self.out, reg, self.num_locals + slot, ty);
                self.slots.free(slot);
            }
            StackElement::Dummy { .. } => unreachable!("dummy materialized"),
        }
    }

    /// Ensure an element is resident in its canonical frame slot (64-bit
    /// values on 32-bit targets, and merge canonicalization). Returns the
    /// operand slot index.
    fn ensure_slot(&mut self, elem: StackElement, pos: usize) -> u32 {
        let slot = pos as u32;
        let frame_slot = self.slot_of_pos(pos);
        match elem {
            StackElement::TempSlot { slot: s, .. } => {
                debug_assert_eq!(s, slot, "temp slots live at their stack position");
                return s;
            }
            StackElement::Constant { bits, .. } => {
                self.slots.alloc_at(slot);
                I::store_slot_imm64(&mut self.out, frame_slot, bits);
            }
            StackElement::Local { index, ty } => {
                self.slots.alloc_at(slot);
                I::copy_slot(&mut self.out, frame_slot, index, ty);
            }
            StackElement::Register { reg, ty } => {
                self.slots.alloc_at(slot);
                I::store_slot(&mut self.out, reg, frame_slot, ty);
                self.regs.free(reg);
            }
            StackElement::Dummy { .. } => unreachable!("dummy materialized"),
        }
        slot
    }

    fn release(&mut self, elem: &StackElement) {
        match elem {
            StackElement::Register { reg, .. } => self.regs.free(*reg),
            StackElement::TempSlot { slot, .. } => self.slots.free(*slot),
            _ => {}
        }
    }

    pub fn drop_value(&mut self) {
        let elem = self.stack.pop().expect("validated drop");
        self.release(&elem);
    }

    // ---- locals and globals --------------------------------------------

    pub fn local_get(&mut self, index: u32, ty: ValType) {
        if self.debug_mode {
            let pos = self.stack.len();
            self.slots.alloc_at(pos as u32);
            let slot = self.slot_of_pos(pos);
            I::copy_slot(&mut self.out, slot, index, ty);
            self.stack.push(StackElement::TempSlot {
                ty,
                slot: pos as u32,
            });
        } else {
            self.stack.push(StackElement::Local { ty, index });
        }
    }

    /// Flush stale `Local` stack entries before the local is overwritten.
    fn flush_local_aliases(&mut self, index: u32) {
        for pos in 0..self.stack.len() {
            if let StackElement::Local { index: i, ty } = *self.stack.get(pos) {
                if i == index {
                    self.slots.alloc_at(pos as u32);
                    let slot = self.slot_of_pos(pos);
                    I::copy_slot(&mut self.out, slot, index, ty);
                    self.stack.rewrite(
                        pos,
                        StackElement::TempSlot {
                            ty,
                            slot: pos as u32,
                        },
                    );
                }
            }
        }
    }

    pub fn local_set(&mut self, index: u32, ty: ValType, tee: bool) {
        self.flush_local_aliases(index);
        let elem = self.stack.pop().expect("validated local.set");
        let pos = self.stack.len();
        match elem {
            StackElement::Register { reg, .. } => {
                I::store_slot(&mut self.out, reg, index, ty);
                if tee {
                    self.stack.push(elem);
                } else {
                    self.regs.free(reg);
                }
            }
            StackElement::Constant { bits, .. } => {
                I::store_slot_imm64(&mut self.out, index, bits);
                if tee {
                    self.stack.push(elem);
                }
            }
            StackElement::TempSlot { slot, .. } => {
                I::copy_slot(&mut self.out, index, self.num_locals + slot, ty);
                if tee {
                    self.stack.push(elem);
                } else {
                    self.slots.free(slot);
                }
            }
            StackElement::Local { index: src, .. } => {
                I::copy_slot(&mut self.out, index, src, ty);
                if tee {
                    // The stored-through value equals the (unmodified)
                    // source local unless it aliases the destination.
                    if src == index {
                        self.stack.push(StackElement::Local { ty, index });
                    } else {
                        self.stack.push(elem);
                    }
                }
            }
            StackElement::Dummy { .. } => unreachable!("dummy materialized"),
        }
        let _ = pos;
    }

    pub fn global_get(&mut self, ty: ValType, link_off: Option<u32>, init_bits: u64) {
        match link_off {
            None => self.push_const(ty, init_bits),
            Some(off) => {
                if Self::is_slot_ty(ty) {
                    let pos = self.stack.len();
                    self.slots.alloc_at(pos as u32);
                    let slot_idx = self.slot_of_pos(pos);
                    I::link64_slot(&mut self.out, false, off, slot_idx);
                    self.stack.push(StackElement::TempSlot {
                        ty,
                        slot: pos as u32,
                    });
                } else {
                    let reg = self.alloc_reg(Self::reg_class(ty));
                    I::load_link(&mut self.out, reg, off, ty);
                    self.stack.push(StackElement::Register { ty, reg });
                }
            }
        }
    }

    pub fn global_set(&mut self, ty: ValType, link_off: u32) {
        let elem = self.stack.pop().expect("validated global.set");
        let pos = self.stack.len();
        if Self::is_slot_ty(ty) {
            let slot = self.ensure_slot(elem, pos);
            let slot_idx = self.slot_of_pos(pos);
            I::link64_slot(&mut self.out, true, link_off, slot_idx);
            self.slots.free(slot);
        } else {
            let reg = self.materialize(elem, pos, ty);
            I::store_link(&mut self.out, reg, link_off, ty);
            self.regs.free(reg);
        }
    }

    // ---- integer arithmetic --------------------------------------------

    pub fn i_binop(&mut self, op: IntOp, wide: bool) {
        let ty = if wide { ValType::I64 } else { ValType::I32 };
        if Self::is_slot_ty(ty) {
            let aux = match op {
                IntOp::Add => AuxOp::I64Add,
                IntOp::Sub => AuxOp::I64Sub,
                IntOp::Mul => AuxOp::I64Mul,
                IntOp::And => AuxOp::I64And,
                IntOp::Or => AuxOp::I64Or,
                IntOp::Xor => AuxOp::I64Xor,
            };
            self.slot_binop(aux, ty, ty);
            return;
        }
        let rhs_elem = self.stack.pop().expect("validated binop");
        let lhs_elem = self.stack.pop().expect("validated binop");
        let lhs = self.materialize(lhs_elem, self.stack.len(), ty);
        let rhs = self.materialize(rhs_elem, self.stack.len() + 1, ty);
        I::int_op(&mut self.out, op, lhs, rhs, wide);
        self.regs.free(rhs);
        self.stack.push(StackElement::Register { ty, reg: lhs });
    }

    pub fn i_shift(&mut self, op: ShiftOp, wide: bool) {
        let ty = if wide { ValType::I64 } else { ValType::I32 };
        if Self::is_slot_ty(ty) {
            let aux = match op {
                ShiftOp::Shl => AuxOp::I64Shl,
                ShiftOp::ShrS => AuxOp::I64ShrS,
                ShiftOp::ShrU => AuxOp::I64ShrU,
                ShiftOp::Rotl => AuxOp::I64Rotl,
                ShiftOp::Rotr => AuxOp::I64Rotr,
            };
            self.slot_binop(aux, ty, ty);
            return;
        }
        let rhs_elem = self.stack.pop().expect("validated shift");
        // Claim the fixed amount register (spilling its occupant) while the
        // lhs is still on the stack and can be rewritten in place.
        let amount = match I::SHIFT_AMOUNT_REG {
            Some(fixed) => {
                if rhs_elem.register() == Some(fixed) {
                    fixed
                } else {
                    self.take_reg(fixed);
                    self.materialize_into(rhs_elem, fixed, ty);
                    fixed
                }
            }
            None => self.materialize(rhs_elem, self.stack.len(), ty),
        };
        let lhs_elem = self.stack.pop().expect("validated shift");
        let lhs = self.materialize(lhs_elem, self.stack.len(), ty);
        I::int_shift(&mut self.out, op, lhs, amount, wide);
        self.regs.free(amount);
        self.stack.push(StackElement::Register { ty, reg: lhs });
    }

    pub fn i_div(&mut self, signed: bool, rem: bool, wide: bool) {
        let ty = if wide { ValType::I64 } else { ValType::I32 };
        if Self::is_slot_ty(ty) {
            self.slot_binop(AuxOp::I64Div { signed, rem }, ty, ty);
            return;
        }
        for reg in I::DIV_CLOBBERS {
            self.take_reg(*reg);
        }
        let rhs_elem = self.stack.pop().expect("validated div");
        let lhs_elem = self.stack.pop().expect("validated div");
        let lhs = self.materialize(lhs_elem, self.stack.len(), ty);
        let rhs = self.materialize(rhs_elem, self.stack.len() + 1, ty);
        I::int_div(&mut self.out, signed, rem, lhs, lhs, rhs, wide, self.trap_entry);
        self.regs.free(rhs);
        for reg in I::DIV_CLOBBERS {
            self.regs.free(*reg);
        }
        self.stack.push(StackElement::Register { ty, reg: lhs });
    }

    pub fn i_unop(&mut self, op: IntUnOp, wide: bool) {
        let ty = if wide { ValType::I64 } else { ValType::I32 };
        if Self::is_slot_ty(ty) {
            let aux = match op {
                IntUnOp::Clz => AuxOp::I64Clz,
                IntUnOp::Ctz => AuxOp::I64Ctz,
                IntUnOp::Popcnt => AuxOp::I64Popcnt,
            };
            self.slot_unop(aux, ty, ty);
            return;
        }
        if I::SLOT_ONLY_64BIT {
            // 32-bit bit scans dispatch through the aux table and clobber
            // caller-saved registers.
            self.spill_registers();
        }
        let elem = self.stack.pop().expect("validated unop");
        let reg = self.materialize(elem, self.stack.len(), ty);
        I::int_unop(&mut self.out, op, reg, reg, wide);
        self.stack.push(StackElement::Register { ty, reg });
    }

    pub fn i_cmp(&mut self, cmp: IntCmp, wide: bool) {
        let ty = if wide { ValType::I64 } else { ValType::I32 };
        if Self::is_slot_ty(ty) {
            self.slot_binop(AuxOp::I64Cmp(cmp), ty, ValType::I32);
            return;
        }
        let rhs_elem = self.stack.pop().expect("validated cmp");
        let lhs_elem = self.stack.pop().expect("validated cmp");
        let lhs = self.materialize(lhs_elem, self.stack.len(), ty);
        let rhs = self.materialize(rhs_elem, self.stack.len() + 1, ty);
        I::int_cmp(&mut self.out, cmp, lhs, lhs, rhs, wide);
        self.regs.free(rhs);
        self.stack.push(StackElement::Register {
            ty: ValType::I32,
            reg: lhs,
        });
    }

    pub fn i_eqz(&mut self, wide: bool) {
        let ty = if wide { ValType::I64 } else { ValType::I32 };
        if Self::is_slot_ty(ty) {
            self.slot_unop(AuxOp::I64Eqz, ty, ValType::I32);
            return;
        }
        let elem = self.stack.pop().expect("validated eqz");
        let reg = self.materialize(elem, self.stack.len(), ty);
        I::int_eqz(&mut self.out, reg, reg, wide);
        self.stack.push(StackElement::Register {
            ty: ValType::I32,
            reg,
        });
    }

    fn slot_binop(&mut self, op: AuxOp, _operand_ty: ValType, result_ty: ValType) {
        self.spill_registers();
        let rhs_elem = self.stack.pop().expect("validated slot binop");
        let lhs_elem = self.stack.pop().expect("validated slot binop");
        let lhs_pos = self.stack.len();
        let lhs_slot = self.ensure_slot(lhs_elem, lhs_pos);
        let rhs_slot = self.ensure_slot(rhs_elem, lhs_pos + 1);
        let dst_frame = self.slot_of_pos(lhs_pos);
        I::aux_op(
            &mut self.out,
            op,
            dst_frame,
            self.num_locals + lhs_slot,
            Some(self.num_locals + rhs_slot),
            self.trap_entry,
        );
        self.slots.free(rhs_slot);
        self.stack.push(StackElement::TempSlot {
            ty: result_ty,
            slot: lhs_slot,
        });
    }

    fn slot_unop(&mut self, op: AuxOp, _operand_ty: ValType, result_ty: ValType) {
        self.spill_registers();
        let elem = self.stack.pop().expect("validated slot unop");
        let pos = self.stack.len();
        let slot = self.ensure_slot(elem, pos);
        let frame = self.slot_of_pos(pos);
        I::aux_op(&mut self.out, op, frame, frame, None, self.trap_entry);
        self.stack.push(StackElement::TempSlot {
            ty: result_ty,
            slot,
        });
    }

    // ---- floating point -------------------------------------------------

    pub fn f_binop(&mut self, op: FloatOp, is64: bool) {
        let ty = if is64 { ValType::F64 } else { ValType::F32 };
        if !I::HAS_HARD_FLOAT {
            if op == FloatOp::Copysign {
                self.soft_copysign(is64);
                return;
            }
            let f = soft_binop_fn(op, is64);
            if Self::is_slot_ty(ty) {
                self.slot_binop(AuxOp::Soft(f), ty, ty);
            } else {
                self.slot_binop_f32(AuxOp::Soft(f));
            }
            return;
        }
        let rhs_elem = self.stack.pop().expect("validated f binop");
        let lhs_elem = self.stack.pop().expect("validated f binop");
        let lhs = self.materialize(lhs_elem, self.stack.len(), ty);
        let rhs = self.materialize(rhs_elem, self.stack.len() + 1, ty);
        I::float_op(&mut self.out, op, lhs, rhs, is64);
        self.regs.free(rhs);
        self.stack.push(StackElement::Register { ty, reg: lhs });
    }

    pub fn f_unop(&mut self, op: FloatUn, is64: bool) {
        let ty = if is64 { ValType::F64 } else { ValType::F32 };
        if !I::HAS_HARD_FLOAT {
            match op {
                FloatUn::Abs | FloatUn::Neg => {
                    self.soft_sign_op(op, is64);
                }
                FloatUn::Nearest if !is64 => {
                    // f32.nearest = demote(f64.nearest(promote(x)))
                    self.soft_unop(SoftfloatFn::F64PromoteF32, ValType::F32, ValType::F64);
                    self.soft_unop(SoftfloatFn::F64Nearest, ValType::F64, ValType::F64);
                    self.soft_unop(SoftfloatFn::F32DemoteF64, ValType::F64, ValType::F32);
                }
                _ => {
                    let f = soft_unop_fn(op, is64);
                    self.soft_unop(f, ty, ty);
                }
            }
            return;
        }
        let elem = self.stack.pop().expect("validated f unop");
        let reg = self.materialize(elem, self.stack.len(), ty);
        I::float_unop(&mut self.out, op, reg, is64);
        self.stack.push(StackElement::Register { ty, reg });
    }

    pub fn f_cmp(&mut self, cmp: FloatCmp, is64: bool) {
        let ty = if is64 { ValType::F64 } else { ValType::F32 };
        if !I::HAS_HARD_FLOAT {
            let f = soft_cmp_fn(cmp, is64);
            if Self::is_slot_ty(ty) {
                self.slot_binop(AuxOp::Soft(f), ty, ValType::I32);
            } else {
                self.slot_binop_f32(AuxOp::Soft(f));
            }
            return;
        }
        let rhs_elem = self.stack.pop().expect("validated f cmp");
        let lhs_elem = self.stack.pop().expect("validated f cmp");
        let lhs = self.materialize(lhs_elem, self.stack.len(), ty);
        let rhs = self.materialize(rhs_elem, self.stack.len() + 1, ty);
        let dst = self.alloc_reg(RegClass::Int);
        I::float_cmp(&mut self.out, cmp, dst, lhs, rhs, is64);
        self.regs.free(lhs);
        self.regs.free(rhs);
        self.stack.push(StackElement::Register {
            ty: ValType::I32,
            reg: dst,
        });
    }

    /// f32 operands on the softfloat target are register values but aux
    /// calls want slot operands; canonicalize both and dispatch.
    fn slot_binop_f32(&mut self, op: AuxOp) {
        self.spill_registers();
        let rhs_elem = self.stack.pop().expect("validated soft f32 binop");
        let lhs_elem = self.stack.pop().expect("validated soft f32 binop");
        let lhs_pos = self.stack.len();
        let lhs_slot = self.ensure_slot(lhs_elem, lhs_pos);
        let rhs_slot = self.ensure_slot(rhs_elem, lhs_pos + 1);
        let dst_frame = self.slot_of_pos(lhs_pos);
        I::aux_op(
            &mut self.out,
            op,
            dst_frame,
            self.num_locals + lhs_slot,
            Some(self.num_locals + rhs_slot),
            self.trap_entry,
        );
        self.slots.free(rhs_slot);
        let result_ty = match op {
            AuxOp::Soft(f) if matches!(soft_result_kind(f), SoftResult::F32) => ValType::F32,
            _ => ValType::I32,
        };
        self.stack.push(StackElement::TempSlot {
            ty: result_ty,
            slot: lhs_slot,
        });
    }

    fn soft_unop(&mut self, f: SoftfloatFn, _from: ValType, to: ValType) {
        self.spill_registers();
        let elem = self.stack.pop().expect("validated soft unop");
        let pos = self.stack.len();
        let slot = self.ensure_slot(elem, pos);
        let frame = self.slot_of_pos(pos);
        I::aux_op(&mut self.out, AuxOp::Soft(f), frame, frame, None, self.trap_entry);
        self.stack.push(StackElement::TempSlot { ty: to, slot });
    }

    /// `abs`/`neg` are sign-bit manipulation, kept inline on the softfloat
    /// target.
    fn soft_sign_op(&mut self, op: FloatUn, is64: bool) {
        if !is64 {
            let elem = self.stack.pop().expect("validated sign op");
            let reg = self.materialize(elem, self.stack.len(), ValType::F32);
            let mask = self.alloc_reg(RegClass::Int);
            if matches!(op, FloatUn::Neg) {
                I::mov_imm(&mut self.out, mask, 0x8000_0000, false);
                I::int_op(&mut self.out, IntOp::Xor, reg, mask, false);
            } else {
                I::mov_imm(&mut self.out, mask, 0x7FFF_FFFF, false);
                I::int_op(&mut self.out, IntOp::And, reg, mask, false);
            }
            self.regs.free(mask);
            self.stack.push(StackElement::Register {
                ty: ValType::F32,
                reg,
            });
        } else {
            // f64: flip/clear the top bit of the high word in the slot.
            let elem = self.stack.pop().expect("validated sign op");
            let pos = self.stack.len();
            let slot = self.ensure_slot(elem, pos);
            let frame = self.slot_of_pos(pos);
            let op64 = if matches!(op, FloatUn::Neg) {
                AuxOp::I64Xor
            } else {
                AuxOp::I64And
            };
            let bits: u64 = if matches!(op, FloatUn::Neg) {
                0x8000_0000_0000_0000
            } else {
                0x7FFF_FFFF_FFFF_FFFF
            };
            // Materialize the mask into the neighbouring slot.
            let mask_pos = pos + 1;
            self.slots.alloc_at(mask_pos as u32);
            let mask_slot = self.slot_of_pos(mask_pos);
            I::store_slot_imm64(&mut self.out, mask_slot, bits);
            self.spill_registers();
            I::aux_op(
                &mut self.out,
                op64,
                frame,
                frame,
                Some(mask_slot),
                self.trap_entry,
            );
            self.slots.free(mask_pos as u32);
            self.stack.push(StackElement::TempSlot {
                ty: ValType::F64,
                slot,
            });
        }
    }

    fn soft_copysign(&mut self, is64: bool) {
        // copysign(a, b) = (a & !sign) | (b & sign): three inline bit ops.
        if !is64 {
            let b_elem = self.stack.pop().expect("validated copysign");
            let a_elem = self.stack.pop().expect("validated copysign");
            let a = self.materialize(a_elem, self.stack.len(), ValType::F32);
            let b = self.materialize(b_elem, self.stack.len() + 1, ValType::F32);
            let mask = self.alloc_reg(RegClass::Int);
            I::mov_imm(&mut self.out, mask, 0x7FFF_FFFF, false);
            I::int_op(&mut self.out, IntOp::And, a, mask, false);
            I::mov_imm(&mut self.out, mask, 0x8000_0000, false);
            I::int_op(&mut self.out, IntOp::And, b, mask, false);
            I::int_op(&mut self.out, IntOp::Or, a, b, false);
            self.regs.free(mask);
            self.regs.free(b);
            self.stack.push(StackElement::Register {
                ty: ValType::F32,
                reg: a,
            });
        } else {
            // In slots: a &= MAX; b &= SIGN; a |= b.
            self.spill_registers();
            let b_elem = self.stack.pop().expect("validated copysign");
            let a_elem = self.stack.pop().expect("validated copysign");
            let a_pos = self.stack.len();
            let a_slot = self.ensure_slot(a_elem, a_pos);
            let b_slot = self.ensure_slot(b_elem, a_pos + 1);
            let mask_pos = a_pos + 2;
            self.slots.alloc_at(mask_pos as u32);
            let mask_frame = self.slot_of_pos(mask_pos);
            let a_frame = self.num_locals + a_slot;
            let b_frame = self.num_locals + b_slot;
            I::store_slot_imm64(&mut self.out, mask_frame, 0x7FFF_FFFF_FFFF_FFFF);
            I::aux_op(&mut self.out, AuxOp::I64And, a_frame, a_frame, Some(mask_frame), self.trap_entry);
            I::store_slot_imm64(&mut self.out, mask_frame, 0x8000_0000_0000_0000);
            I::aux_op(&mut self.out, AuxOp::I64And, b_frame, b_frame, Some(mask_frame), self.trap_entry);
            I::aux_op(&mut self.out, AuxOp::I64Or, a_frame, a_frame, Some(b_frame), self.trap_entry);
            self.slots.free(mask_pos as u32);
            self.slots.free(b_slot);
            self.stack.push(StackElement::TempSlot {
                ty: ValType::F64,
                slot: a_slot,
            });
        }
    }

    // ---- conversions ----------------------------------------------------

    pub fn wrap_i64(&mut self) {
        let elem = self.stack.pop().expect("validated wrap");
        let pos = self.stack.len();
        if I::SLOT_ONLY_64BIT {
            let slot = self.ensure_slot(elem, pos);
            let reg = self.alloc_reg(RegClass::Int);
            // low word of the slot cell
            I::load_slot(&mut self.out, reg, self.num_locals + slot, ValType::I32);
            self.slots.free(slot);
            self.stack.push(StackElement::Register {
                ty: ValType::I32,
                reg,
            });
        } else {
            let reg = self.materialize(elem, pos, ValType::I64);
            I::wrap64(&mut self.out, reg, reg);
            self.stack.push(StackElement::Register {
                ty: ValType::I32,
                reg,
            });
        }
    }

    pub fn extend_i32(&mut self, signed: bool) {
        let elem = self.stack.pop().expect("validated extend");
        let pos = self.stack.len();
        if I::SLOT_ONLY_64BIT {
            let reg = self.materialize(elem, pos, ValType::I32);
            self.slots.alloc_at(pos as u32);
            let slot_idx = self.slot_of_pos(pos);
            I::store_slot(&mut self.out, reg, slot_idx, ValType::I32);
            self.regs.free(reg);
            if signed {
                self.spill_registers();
                let frame = self.slot_of_pos(pos);
                I::aux_op(&mut self.out, AuxOp::I64ExtendI32S, frame, frame, None, self.trap_entry);
            }
            self.stack.push(StackElement::TempSlot {
                ty: ValType::I64,
                slot: pos as u32,
            });
        } else {
            let reg = self.materialize(elem, pos, ValType::I32);
            I::extend32(&mut self.out, reg, reg, signed);
            self.stack.push(StackElement::Register {
                ty: ValType::I64,
                reg,
            });
        }
    }

    pub fn reinterpret(&mut self, to: ValType) {
        let elem = self.stack.pop().expect("validated reinterpret");
        let pos = self.stack.len();
        match elem {
            StackElement::Constant { bits, .. } => self.stack.push(StackElement::Constant {
                ty: to,
                bits,
            }),
            StackElement::TempSlot { slot, .. } => {
                self.stack.push(StackElement::TempSlot { ty: to, slot });
            }
            StackElement::Local { .. } | StackElement::Register { .. } => {
                if I::HAS_HARD_FLOAT {
                    let from_ty = elem.ty();
                    let src = self.materialize(elem, pos, from_ty);
                    let dst = self.alloc_reg(Self::reg_class(to));
                    I::mov_rr(&mut self.out, dst, src, to);
                    self.regs.free(src);
                    self.stack.push(StackElement::Register { ty: to, reg: dst });
                } else {
                    // Same register file; just retype.
                    match elem {
                        StackElement::Local { index, .. } => {
                            self.stack.push(StackElement::Local { ty: to, index });
                        }
                        StackElement::Register { reg, .. } => {
                            self.stack.push(StackElement::Register { ty: to, reg });
                        }
                        _ => unreachable!(),
                    }
                }
            }
            StackElement::Dummy { .. } => unreachable!("dummy materialized"),
        }
    }

    pub fn trunc_float_to_int(&mut self, to64: bool, from64: bool, signed: bool) {
        if !I::HAS_HARD_FLOAT {
            let f = soft_trunc_fn(to64, from64, signed);
            let from = if from64 { ValType::F64 } else { ValType::F32 };
            let to = if to64 { ValType::I64 } else { ValType::I32 };
            self.soft_unop(f, from, to);
            return;
        }
        let elem = self.stack.pop().expect("validated trunc");
        let pos = self.stack.len();
        let src = self.materialize(elem, pos, if from64 { ValType::F64 } else { ValType::F32 });
        let dst = self.alloc_reg(RegClass::Int);
        I::int_from_float(&mut self.out, dst, src, to64, from64, signed, self.trap_entry);
        self.regs.free(src);
        self.stack.push(StackElement::Register {
            ty: if to64 { ValType::I64 } else { ValType::I32 },
            reg: dst,
        });
    }

    pub fn convert_int_to_float(&mut self, to64: bool, from64: bool, signed: bool) {
        if !I::HAS_HARD_FLOAT {
            let f = soft_convert_fn(to64, from64, signed);
            let from = if from64 { ValType::I64 } else { ValType::I32 };
            let to = if to64 { ValType::F64 } else { ValType::F32 };
            self.soft_unop(f, from, to);
            return;
        }
        let elem = self.stack.pop().expect("validated convert");
        let pos = self.stack.len();
        let src = self.materialize(elem, pos, if from64 { ValType::I64 } else { ValType::I32 });
        let dst = self.alloc_reg(RegClass::Float);
        I::float_from_int(&mut self.out, dst, src, to64, from64, signed);
        self.regs.free(src);
        self.stack.push(StackElement::Register {
            ty: if to64 { ValType::F64 } else { ValType::F32 },
            reg: dst,
        });
    }

    pub fn promote_demote(&mut self, promote: bool) {
        if !I::HAS_HARD_FLOAT {
            if promote {
                self.soft_unop(SoftfloatFn::F64PromoteF32, ValType::F32, ValType::F64);
            } else {
                self.soft_unop(SoftfloatFn::F32DemoteF64, ValType::F64, ValType::F32);
            }
            return;
        }
        let elem = self.stack.pop().expect("validated promote/demote");
        let pos = self.stack.len();
        let (from, to) = if promote {
            (ValType::F32, ValType::F64)
        } else {
            (ValType::F64, ValType::F32)
        };
        let reg = self.materialize(elem, pos, from);
        if promote {
            I::float_promote(&mut self.out, reg, reg);
        } else {
            I::float_demote(&mut self.out, reg, reg);
        }
        self.stack.push(StackElement::Register { ty: to, reg });
    }

    // ---- memory ---------------------------------------------------------

    pub fn load(&mut self, acc: MemAccess, offset: u32) {
        let ty = acc.value_ty();
        let addr_elem = self.stack.pop().expect("validated load address");
        let pos = self.stack.len();

        if Self::is_slot_ty(ty) {
            if acc.width() == 8 {
                let addr = self.materialize(addr_elem, pos, ValType::I32);
                self.slots.alloc_at(pos as u32);
                let slot_idx = self.slot_of_pos(pos);
                I::linmem64_slot(
                    &mut self.out,
                    false,
                    addr,
                    offset,
                    slot_idx,
                    self.trap_entry,
                );
                self.regs.free(addr);
                self.stack.push(StackElement::TempSlot {
                    ty,
                    slot: pos as u32,
                });
            } else {
                // Narrow i64 load: load the 32-bit form, then widen in the
                // slot.
                let narrow = match acc {
                    MemAccess::I64Load8S => MemAccess::I32Load8S,
                    MemAccess::I64Load8U => MemAccess::I32Load8U,
                    MemAccess::I64Load16S => MemAccess::I32Load16S,
                    MemAccess::I64Load16U => MemAccess::I32Load16U,
                    MemAccess::I64Load32S | MemAccess::I64Load32U => MemAccess::I32,
                    _ => unreachable!(),
                };
                let addr = self.materialize(addr_elem, pos, ValType::I32);
                let dst = self.alloc_reg(RegClass::Int);
                I::load_linmem(&mut self.out, dst, addr, offset, narrow, self.trap_entry);
                self.regs.free(addr);
                self.slots.alloc_at(pos as u32);
                let slot_idx = self.slot_of_pos(pos);
                I::store_slot(&mut self.out, dst, slot_idx, ValType::I32);
                self.regs.free(dst);
                if acc.signed() {
                    self.spill_registers();
                    let frame = self.slot_of_pos(pos);
                    I::aux_op(&mut self.out, AuxOp::I64ExtendI32S, frame, frame, None, self.trap_entry);
                }
                self.stack.push(StackElement::TempSlot {
                    ty,
                    slot: pos as u32,
                });
            }
            return;
        }

        let addr = self.materialize(addr_elem, pos, ValType::I32);
        let dst = self.alloc_reg(Self::reg_class(ty));
        I::load_linmem(&mut self.out, dst, addr, offset, acc, self.trap_entry);
        self.regs.free(addr);
        self.stack.push(StackElement::Register { ty, reg: dst });
    }

    pub fn store(&mut self, acc: MemAccess, offset: u32) {
        let ty = acc.value_ty();
        let value_elem = self.stack.pop().expect("validated store value");
        let value_pos = self.stack.len();
        let addr_elem = self.stack.pop().expect("validated store address");
        let addr_pos = self.stack.len();

        if Self::is_slot_ty(ty) {
            let slot = self.ensure_slot(value_elem, value_pos);
            let addr = self.materialize(addr_elem, addr_pos, ValType::I32);
            if acc.width() == 8 {
                I::linmem64_slot(
                    &mut self.out,
                    true,
                    addr,
                    offset,
                    self.num_locals + slot,
                    self.trap_entry,
                );
            } else {
                // Narrow i64 store: the low word carries the value.
                let narrow = match acc.width() {
                    1 => MemAccess::I32Load8U,
                    2 => MemAccess::I32Load16U,
                    _ => MemAccess::I32,
                };
                let tmp = self.alloc_reg(RegClass::Int);
                I::load_slot(&mut self.out, tmp, self.num_locals + slot, ValType::I32);
                I::store_linmem(&mut self.out, tmp, addr, offset, narrow, self.trap_entry);
                self.regs.free(tmp);
            }
            self.regs.free(addr);
            self.slots.free(slot);
            return;
        }

        let value = self.materialize(value_elem, value_pos, ty);
        let addr = self.materialize(addr_elem, addr_pos, ValType::I32);
        I::store_linmem(&mut self.out, value, addr, offset, acc, self.trap_entry);
        self.regs.free(value);
        self.regs.free(addr);
    }

    pub fn memory_size(&mut self) {
        let reg = self.alloc_reg(RegClass::Int);
        I::memory_size(&mut self.out, reg);
        self.stack.push(StackElement::Register {
            ty: ValType::I32,
            reg,
        });
    }

    pub fn memory_grow(&mut self) {
        self.spill_registers();
        let elem = self.stack.pop().expect("validated memory.grow");
        let pos = self.stack.len();
        // Keep the delta clear of the argument registers the helper call
        // marshals into.
        self.take_reg(I::CALL_TEMP);
        self.materialize_into(elem, I::CALL_TEMP, ValType::I32);
        if self.interruption_polls {
            I::interruption_poll(&mut self.out, self.trap_entry);
        }
        I::memory_grow(&mut self.out, I::CALL_TEMP, I::CALL_TEMP);
        let dst = {
            self.regs.free(I::CALL_TEMP);
            let dst = self.alloc_reg(RegClass::Int);
            I::mov_rr(&mut self.out, dst, I::CALL_TEMP, ValType::I32);
            dst
        };
        let _ = pos;
        self.stack.push(StackElement::Register {
            ty: ValType::I32,
            reg: dst,
        });
    }

    // ---- select ---------------------------------------------------------

    pub fn select(&mut self) {
        let cond_elem = self.stack.pop().expect("validated select cond");
        let cond_pos = self.stack.len();
        let cond = self.materialize(cond_elem, cond_pos, ValType::I32);
        let b_elem = self.stack.pop().expect("validated select");
        let b_pos = self.stack.len();
        let a_elem = self.stack.pop().expect("validated select");
        let a_pos = self.stack.len();
        let ty = a_elem.ty();

        if Self::is_slot_ty(ty) {
            let a_slot = self.ensure_slot(a_elem, a_pos);
            let b_slot = self.ensure_slot(b_elem, b_pos);
            let keep_a = I::br_if_nonzero(&mut self.out, cond);
            I::copy_slot(
                &mut self.out,
                self.num_locals + a_slot,
                self.num_locals + b_slot,
                ty,
            );
            I::patch_jump(&mut self.out, keep_a);
            self.regs.free(cond);
            self.slots.free(b_slot);
            self.stack.push(StackElement::TempSlot { ty, slot: a_slot });
        } else {
            let a = self.materialize(a_elem, a_pos, ty);
            let b = self.materialize(b_elem, b_pos, ty);
            let keep_a = I::br_if_nonzero(&mut self.out, cond);
            I::mov_rr(&mut self.out, a, b, ty);
            I::patch_jump(&mut self.out, keep_a);
            self.regs.free(cond);
            self.regs.free(b);
            self.stack.push(StackElement::Register { ty, reg: a });
        }
    }

    // ---- control-flow support ------------------------------------------

    /// Pop the i32 condition into a register the caller frees.
    pub fn pop_condition(&mut self) -> Reg {
        let elem = self.stack.pop().expect("validated condition");
        self.materialize(elem, self.stack.len(), ValType::I32)
    }

    pub fn free_reg(&mut self, reg: Reg) {
        self.regs.free(reg);
    }

    /// Force every operand into its canonical frame slot (control-flow
    /// merge points).
    pub fn canonicalize_all(&mut self) {
        for pos in 0..self.stack.len() {
            let elem = *self.stack.get(pos);
            if matches!(elem, StackElement::TempSlot { .. } | StackElement::Dummy { .. }) {
                continue;
            }
            let ty = elem.ty();
            let slot = self.ensure_slot(elem, pos);
            self.stack.rewrite(pos, StackElement::TempSlot { ty, slot });
        }
    }

    /// Spill only register-backed operands (before calls: constants and
    /// locals survive a call untouched).
    pub fn spill_registers(&mut self) {
        for pos in 0..self.stack.len() {
            let elem = *self.stack.get(pos);
            if let StackElement::Register { ty, .. } = elem {
                let slot = self.ensure_slot(elem, pos);
                self.stack.rewrite(pos, StackElement::TempSlot { ty, slot });
            }
        }
    }

    /// Copy the top `count` operands into the canonical merge slots
    /// starting at `merge_base` without disturbing the current state
    /// (conditional-branch taken paths).
    pub fn move_top_to_merge(&mut self, count: usize, merge_base: usize) {
        let len = self.stack.len();
        debug_assert!(len >= count);
        for j in 0..count {
            let src_pos = len - count + j;
            let dst_pos = merge_base + j;
            let dst_frame = self.slot_of_pos(dst_pos);
            let elem = *self.stack.get(src_pos);
            match elem {
                StackElement::TempSlot { slot, .. } => {
                    if slot as usize != dst_pos {
                        I::copy_slot(&mut self.out, dst_frame, self.num_locals + slot, elem.ty());
                    }
                }
                StackElement::Constant { bits, .. } => {
                    I::store_slot_imm64(&mut self.out, dst_frame, bits);
                }
                StackElement::Local { index, ty } => {
                    I::copy_slot(&mut self.out, dst_frame, index, ty);
                }
                StackElement::Register { reg, ty } => {
                    I::store_slot(&mut self.out, reg, dst_frame, ty);
                }
                StackElement::Dummy { .. } => unreachable!("dummy materialized"),
            }
        }
    }

    /// Release every operand backing at or above `base` and truncate.
    pub fn reset_stack_to(&mut self, base: usize) {
        for pos in base..self.stack.len() {
            let elem = *self.stack.get(pos);
            self.release(&elem);
        }
        self.stack.truncate(base);
    }

    /// Install merge results as canonical slots at `base..base+types`.
    pub fn adopt_merge_results(&mut self, base: usize, types: &[ValType]) {
        debug_assert_eq!(self.stack.len(), base);
        for (i, ty) in types.iter().enumerate() {
            let pos = (base + i) as u32;
            self.slots.alloc_at(pos);
            self.stack.push(StackElement::TempSlot { ty: *ty, slot: pos });
        }
    }

    /// Height bookkeeping for blocks closed inside dead code: the results
    /// exist only formally, so they become dummies with no backing.
    pub fn adopt_dead_results(&mut self, base: usize, types: &[ValType]) {
        debug_assert_eq!(self.stack.len(), base);
        for ty in types {
            self.stack.push(StackElement::Dummy { ty: *ty });
        }
    }

    pub fn jump(&mut self) -> PatchSite {
        I::jump(&mut self.out)
    }

    pub fn jump_back(&mut self, target: u32) {
        I::jump_back(&mut self.out, target);
    }

    pub fn br_if_zero(&mut self, cond: Reg) -> PatchSite {
        I::br_if_zero(&mut self.out, cond)
    }

    pub fn br_if_nonzero(&mut self, cond: Reg) -> PatchSite {
        I::br_if_nonzero(&mut self.out, cond)
    }

    pub fn br_if_eq_imm(&mut self, index: Reg, case: u32) -> PatchSite {
        I::br_if_eq_imm(&mut self.out, index, case)
    }

    pub fn bind(&mut self, site: PatchSite) {
        I::patch_jump(&mut self.out, site);
    }

    pub fn trap(&mut self, code: TrapCode) {
        I::trap(&mut self.out, code, self.trap_entry);
    }

    pub fn interruption_poll(&mut self) {
        if self.interruption_polls {
            I::interruption_poll(&mut self.out, self.trap_entry);
        }
    }

    // ---- calls ----------------------------------------------------------

    /// Marshal the top `sig.params` operands into the argument registers.
    /// The caller has spilled registers already.
    fn marshal_args(&mut self, sig: &FuncSignature, extra_ctx: bool) -> crate::Result<()> {
        let n = sig.params.len();
        let len = self.stack.len();
        let mut next_gpr = 0usize;
        let mut next_fpr = 0usize;
        for (i, ty) in sig.params.iter().enumerate() {
            let elem = *self.stack.get(len - n + i);
            match Self::reg_class(*ty) {
                RegClass::Int => {
                    let needed = if Self::is_slot_ty(*ty) { 2 } else { 1 };
                    if next_gpr + needed + usize::from(extra_ctx) > I::ARG_GPRS.len() {
                        return Err(CompileError::ImplementationLimit(
                            "too many arguments for the platform".into(),
                        ));
                    }
                    if needed == 2 {
                        let lo = I::ARG_GPRS[next_gpr];
                        let hi = I::ARG_GPRS[next_gpr + 1];
                        match elem {
                            StackElement::Constant { bits, .. } => {
                                I::mov_imm(&mut self.out, lo, bits & 0xFFFF_FFFF, false);
                                I::mov_imm(&mut self.out, hi, bits >> 32, false);
                            }
                            StackElement::TempSlot { slot, .. } => {
                                I::load_slot_pair(&mut self.out, lo, hi, self.num_locals + slot);
                            }
                            StackElement::Local { index, .. } => {
                                I::load_slot_pair(&mut self.out, lo, hi, index);
                            }
                            _ => unreachable!("wide operands are slot resident"),
                        }
                    } else {
                        let reg = I::ARG_GPRS[next_gpr];
                        self.materialize_arg(elem, reg, *ty);
                    }
                    next_gpr += needed;
                }
                RegClass::Float => {
                    if next_fpr >= I::ARG_FPRS.len() {
                        return Err(CompileError::ImplementationLimit(
                            "too many arguments for the platform".into(),
                        ));
                    }
                    let reg = I::ARG_FPRS[next_fpr];
                    self.materialize_arg(elem, reg, *ty);
                    next_fpr += 1;
                }
            }
        }
        if extra_ctx {
            if next_gpr >= I::ARG_GPRS.len() {
                return Err(CompileError::ImplementationLimit(
                    "too many arguments for the platform".into(),
                ));
            }
            let reg = I::ARG_GPRS[next_gpr];
            I::load_link(&mut self.out, reg, ld::RUNTIME_CTX, ValType::I64);
        }
        Ok(())
    }

    /// Like `materialize_into` but without allocator bookkeeping: argument
    /// registers are free after `spill_registers`.
    fn materialize_arg(&mut self, elem: StackElement, reg: Reg, ty: ValType) {
        match elem {
            StackElement::Constant { bits, .. } => {
                if reg.class == RegClass::Float {
                    I::fmov_imm(&mut self.out, reg, bits, ty.is_64bit());
                } else {
                    I::mov_imm(&mut self.out, reg, bits, ty.is_64bit());
                }
            }
            StackElement::Local { index, .. } => I::load_slot(&mut self.out, reg, index, ty),
            StackElement::TempSlot { slot, .. } => {
                I::load_slot(&mut self.out, reg, self.num_locals + slot, ty);
            }
            _ => unreachable!("arguments are canonicalized before marshalling"),
        }
    }

    fn pop_args(&mut self, n: usize) {
        for _ in 0..n {
            let elem = self.stack.pop().expect("validated call arity");
            self.release(&elem);
        }
    }

    fn push_call_result(&mut self, sig: &FuncSignature) {
        if let Some(ty) = sig.results.first().copied() {
            let pos = self.stack.len();
            if Self::is_slot_ty(ty) {
                self.slots.alloc_at(pos as u32);
                let slot_idx = self.slot_of_pos(pos);
                I::store_slot_pair(
                    &mut self.out,
                    I::RET_GPR,
                    I::RET_GPR2,
                    slot_idx,
                );
                self.stack.push(StackElement::TempSlot {
                    ty,
                    slot: pos as u32,
                });
            } else {
                let ret = match Self::reg_class(ty) {
                    RegClass::Int => I::RET_GPR,
                    RegClass::Float => I::RET_FPR,
                };
                let dst = self.alloc_reg(ret.class);
                I::mov_rr(&mut self.out, dst, ret, ty);
                self.stack.push(StackElement::Register { ty, reg: dst });
            }
        }
    }

    /// Direct call to a defined function; the site is patched once the
    /// callee's body offset is known.
    pub fn call_defined(&mut self, sig: &FuncSignature) -> crate::Result<PatchSite> {
        self.spill_registers();
        self.interruption_poll();
        self.marshal_args(sig, false)?;
        let site = I::call_rel(&mut self.out);
        self.pop_args(sig.params.len());
        self.push_call_result(sig);
        Ok(site)
    }

    pub fn patch_call(&mut self, site: PatchSite, target: u32) {
        I::patch_call(&mut self.out, site, target);
    }

    /// Call an imported function (any linkage, any ABI).
    pub fn call_import(
        &mut self,
        sig: &FuncSignature,
        import: &ImportedFunction,
    ) -> crate::Result<()> {
        self.spill_registers();
        self.interruption_poll();
        match (&import.resolution, import.abi) {
            (ImportResolution::Static { ptr, .. }, AbiVersion::V1) => {
                self.marshal_args(sig, true)?;
                I::call_absolute(&mut self.out, *ptr as u64);
            }
            (ImportResolution::Static { ptr, .. }, AbiVersion::V2) => {
                self.v2_call(sig, V2Target::Absolute(*ptr as u64))?;
                return Ok(());
            }
            (
                ImportResolution::Dynamic { link_offset } | ImportResolution::Unlinked { link_offset },
                AbiVersion::V1,
            ) => {
                self.marshal_args(sig, true)?;
                I::call_link_slot(&mut self.out, *link_offset);
            }
            (
                ImportResolution::Dynamic { link_offset } | ImportResolution::Unlinked { link_offset },
                AbiVersion::V2,
            ) => {
                self.v2_call(sig, V2Target::Slot(*link_offset))?;
                return Ok(());
            }
        }
        self.pop_args(sig.params.len());
        self.push_call_result(sig);
        Ok(())
    }

    /// V2 host call: arguments and results travel through two 8-byte-slot
    /// vectors built on the stack.
    fn v2_call(&mut self, sig: &FuncSignature, target: V2Target) -> crate::Result<()> {
        let n = sig.params.len();
        let r = sig.results.len();
        let bytes = (((n + r) * 8 + 15) & !15) as i32;
        I::adjust_sp(&mut self.out, -bytes);
        let len = self.stack.len();
        for (i, ty) in sig.params.iter().enumerate() {
            let elem = *self.stack.get(len - n + i);
            let sp_off = (8 * i) as u32;
            if Self::is_slot_ty(*ty) {
                match elem {
                    StackElement::TempSlot { slot, .. } => {
                        I::sp_slot_copy(&mut self.out, true, sp_off, self.num_locals + slot);
                    }
                    StackElement::Local { index, .. } => {
                        I::sp_slot_copy(&mut self.out, true, sp_off, index);
                    }
                    StackElement::Constant { bits, .. } => {
                        I::mov_imm(&mut self.out, I::SCRATCH, bits & 0xFFFF_FFFF, false);
                        I::store_sp(&mut self.out, I::SCRATCH, sp_off, ValType::I32);
                        I::mov_imm(&mut self.out, I::SCRATCH, bits >> 32, false);
                        I::store_sp(&mut self.out, I::SCRATCH, sp_off + 4, ValType::I32);
                    }
                    _ => unreachable!("wide operands are slot resident"),
                }
            } else {
                let scratch = match Self::reg_class(*ty) {
                    RegClass::Int => I::SCRATCH,
                    RegClass::Float => I::SCRATCH_FPR,
                };
                self.materialize_arg(elem, scratch, *ty);
                I::store_sp(&mut self.out, scratch, sp_off, *ty);
            }
        }
        // (params_ptr, results_ptr, ctx)
        I::sp_addr(&mut self.out, I::ARG_GPRS[0], 0);
        I::sp_addr(&mut self.out, I::ARG_GPRS[1], (8 * n) as u32);
        I::load_link(&mut self.out, I::ARG_GPRS[2], ld::RUNTIME_CTX, ValType::I64);
        match target {
            V2Target::Absolute(addr) => I::call_absolute(&mut self.out, addr),
            V2Target::Slot(off) => I::call_link_slot(&mut self.out, off),
        }
        self.pop_args(n);
        // Read back the results before releasing the vector space.
        let mut pushed: smallvec::SmallVec<[StackElement; 2]> = smallvec::SmallVec::new();
        for (j, ty) in sig.results.iter().enumerate() {
            let sp_off = (8 * (n + j)) as u32;
            let pos = self.stack.len() + pushed.len();
            if Self::is_slot_ty(*ty) {
                self.slots.alloc_at(pos as u32);
                let slot_idx = self.slot_of_pos(pos);
                I::sp_slot_copy(&mut self.out, false, sp_off, slot_idx);
                pushed.push(StackElement::TempSlot {
                    ty: *ty,
                    slot: pos as u32,
                });
            } else {
                let reg = self.alloc_reg(Self::reg_class(*ty));
                I::load_sp(&mut self.out, reg, sp_off, *ty);
                pushed.push(StackElement::Register { ty: *ty, reg });
            }
        }
        I::adjust_sp(&mut self.out, bytes);
        for elem in pushed {
            self.stack.push(elem);
        }
        Ok(())
    }

    /// `call_indirect` through the link-data table image.
    pub fn call_indirect(&mut self, sig: &FuncSignature, expected_sig: u32) -> crate::Result<()> {
        self.spill_registers();
        self.interruption_poll();
        let index_elem = self.stack.pop().expect("validated call_indirect index");
        self.take_reg(I::CALL_TEMP);
        self.materialize_into(index_elem, I::CALL_TEMP, ValType::I32);
        self.marshal_args(sig, false)?;
        I::call_indirect(
            &mut self.out,
            I::CALL_TEMP,
            expected_sig,
            self.table_off,
            self.trap_entry,
        );
        self.regs.free(I::CALL_TEMP);
        self.pop_args(sig.params.len());
        self.push_call_result(sig);
        Ok(())
    }
}

enum V2Target {
    Absolute(u64),
    Slot(u32),
}

fn soft_binop_fn(op: FloatOp, is64: bool) -> SoftfloatFn {
    use SoftfloatFn::*;
    match (op, is64) {
        (FloatOp::Add, false) => F32Add,
        (FloatOp::Sub, false) => F32Sub,
        (FloatOp::Mul, false) => F32Mul,
        (FloatOp::Div, false) => F32Div,
        (FloatOp::Min, false) => F32Min,
        (FloatOp::Max, false) => F32Max,
        (FloatOp::Add, true) => F64Add,
        (FloatOp::Sub, true) => F64Sub,
        (FloatOp::Mul, true) => F64Mul,
        (FloatOp::Div, true) => F64Div,
        (FloatOp::Min, true) => F64Min,
        (FloatOp::Max, true) => F64Max,
        (FloatOp::Copysign, _) => unreachable!("copysign stays inline"),
    }
}

fn soft_unop_fn(op: FloatUn, is64: bool) -> SoftfloatFn {
    use SoftfloatFn::*;
    match (op, is64) {
        (FloatUn::Sqrt, false) => F32Sqrt,
        (FloatUn::Ceil, false) => F32Ceil,
        (FloatUn::Floor, false) => F32Floor,
        (FloatUn::Trunc, false) => F32Trunc,
        (FloatUn::Sqrt, true) => F64Sqrt,
        (FloatUn::Ceil, true) => F64Ceil,
        (FloatUn::Floor, true) => F64Floor,
        (FloatUn::Trunc, true) => F64Trunc,
        (FloatUn::Nearest, true) => F64Nearest,
        _ => unreachable!("abs/neg/f32.nearest handled by the caller"),
    }
}

fn soft_cmp_fn(cmp: FloatCmp, is64: bool) -> SoftfloatFn {
    use SoftfloatFn::*;
    match (cmp, is64) {
        (FloatCmp::Eq, false) => F32Eq,
        (FloatCmp::Ne, false) => F32Ne,
        (FloatCmp::Lt, false) => F32Lt,
        (FloatCmp::Gt, false) => F32Gt,
        (FloatCmp::Le, false) => F32Le,
        (FloatCmp::Ge, false) => F32Ge,
        (FloatCmp::Eq, true) => F64Eq,
        (FloatCmp::Ne, true) => F64Ne,
        (FloatCmp::Lt, true) => F64Lt,
        (FloatCmp::Gt, true) => F64Gt,
        (FloatCmp::Le, true) => F64Le,
        (FloatCmp::Ge, true) => F64Ge,
    }
}

fn soft_trunc_fn(to64: bool, from64: bool, signed: bool) -> SoftfloatFn {
    use SoftfloatFn::*;
    match (to64, from64, signed) {
        (false, false, true) => I32TruncF32S,
        (false, false, false) => I32TruncF32U,
        (false, true, true) => I32TruncF64S,
        (false, true, false) => I32TruncF64U,
        (true, false, true) => I64TruncF32S,
        (true, false, false) => I64TruncF32U,
        (true, true, true) => I64TruncF64S,
        (true, true, false) => I64TruncF64U,
    }
}

fn soft_convert_fn(to64: bool, from64: bool, signed: bool) -> SoftfloatFn {
    use SoftfloatFn::*;
    match (to64, from64, signed) {
        (false, false, true) => F32ConvertI32S,
        (false, false, false) => F32ConvertI32U,
        (false, true, true) => F32ConvertI64S,
        (false, true, false) => F32ConvertI64U,
        (true, false, true) => F64ConvertI32S,
        (true, false, false) => F64ConvertI32U,
        (true, true, true) => F64ConvertI64S,
        (true, true, false) => F64ConvertI64U,
    }
}

enum SoftResult {
    F32,
    I32,
}

fn soft_result_kind(f: SoftfloatFn) -> SoftResult {
    use SoftfloatFn::*;
    match f {
        F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Sqrt | F32Ceil | F32Floor
        | F32Trunc | F32ConvertI32S | F32ConvertI32U | F32ConvertI64S | F32ConvertI64U
        | F32DemoteF64 => SoftResult::F32,
        _ => SoftResult::I32,
    }
}

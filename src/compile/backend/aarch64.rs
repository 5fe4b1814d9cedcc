//! ISA-2 emitter: AArch64 (AAPCS64).
//!
//! Pinned registers: x28 = linear-memory base, x27 = link-data base,
//! x26 = last-frame (reserved), x25 = stack fence (reserved); all
//! callee-saved. x16/x17 are the scratch pair, v16/v17 the float scratch.
//! Hardware division never faults here, so division checks are active.

use crate::compile::backend::softfloat::AuxOp;
use crate::compile::backend::{FloatCmp, FloatOp, FloatUn, IntCmp, IntOp, IntUnOp, Isa, MemAccess, ShiftOp};
use crate::compile::module_info::FuncSignature;
use crate::compile::output::{Output, PatchSite};
use crate::compile::regalloc::Reg;
use crate::runtime::link_data::offsets as ld;
use crate::traps::TrapCode;
use crate::values::{RegClass, ValType};

pub struct Aarch64;

const X16: u8 = 16;
const X17: u8 = 17;
const X27: u8 = 27;
const X28: u8 = 28;
const X29: u8 = 29;
const X30: u8 = 30;
const XZR: u8 = 31;
const SP: u8 = 31;

fn ins(o: &mut Output, word: u32) {
    o.write_u32(word);
}

fn slot_disp(slot: u32) -> i32 {
    -8 * (slot as i32 + 1)
}

/// Condition codes.
mod cond {
    pub const EQ: u32 = 0;
    pub const NE: u32 = 1;
    pub const HS: u32 = 2;
    pub const LO: u32 = 3;
    pub const MI: u32 = 4;
    pub const GE: u32 = 10;
    pub const LT: u32 = 11;
    pub const GT: u32 = 12;
    pub const LE: u32 = 13;
    pub const HI: u32 = 8;
    pub const LS: u32 = 9;
}

fn b_placeholder(o: &mut Output) -> PatchSite {
    let site = PatchSite { pos: o.pos() };
    ins(o, 0x1400_0000);
    site
}

fn b_to(o: &mut Output, target: u32) {
    let delta = target.wrapping_sub(o.pos()) as i32;
    ins(o, 0x1400_0000 | ((delta / 4) as u32 & 0x03FF_FFFF));
}

fn bcond_placeholder(o: &mut Output, cond: u32) -> PatchSite {
    let site = PatchSite { pos: o.pos() };
    ins(o, 0x5400_0000 | cond);
    site
}

fn cbz_placeholder(o: &mut Output, rt: u8, nonzero: bool, wide: bool) -> PatchSite {
    let site = PatchSite { pos: o.pos() };
    let base: u32 = match (wide, nonzero) {
        (false, false) => 0x3400_0000,
        (false, true) => 0x3500_0000,
        (true, false) => 0xB400_0000,
        (true, true) => 0xB500_0000,
    };
    ins(o, base | rt as u32);
    site
}

fn patch_branch(o: &mut Output, site: PatchSite) {
    let delta = (o.pos().wrapping_sub(site.pos) as i32) / 4;
    let word = o.read_u32_at(site.pos);
    let top = word >> 24;
    if top & 0xFC == 0x14 {
        // b imm26
        o.patch_insn_or(site.pos, delta as u32 & 0x03FF_FFFF);
    } else {
        // b.cond / cbz / cbnz: imm19 at bits 5..24
        o.patch_insn_or(site.pos, ((delta as u32) & 0x7FFFF) << 5);
    }
}

/// movz/movk sequence loading an arbitrary immediate.
fn mov_imm_raw(o: &mut Output, dst: u8, bits: u64, wide: bool) {
    let sf: u32 = if wide { 1 << 31 } else { 0 };
    let chunks: usize = if wide { 4 } else { 2 };
    let mut emitted = false;
    for i in 0..chunks {
        let part = (bits >> (16 * i)) & 0xFFFF;
        if part == 0 {
            continue;
        }
        let op: u32 = if emitted { 0x7280_0000 } else { 0x5280_0000 };
        ins(
            o,
            sf | op | (i as u32) << 21 | (part as u32) << 5 | dst as u32,
        );
        emitted = true;
    }
    if !emitted {
        ins(o, sf | 0x5280_0000 | dst as u32);
    }
}

/// `add/sub dst, src, #imm` with imm up to 24 bits via the shifted form.
fn add_sub_imm(o: &mut Output, dst: u8, src: u8, imm: u32, sub: bool, wide: bool) {
    debug_assert!(imm < 1 << 24);
    let sf: u32 = if wide { 1 << 31 } else { 0 };
    let base: u32 = if sub { 0x5100_0000 } else { 0x1100_0000 };
    if imm < 1 << 12 {
        ins(o, sf | base | imm << 10 | (src as u32) << 5 | dst as u32);
    } else {
        debug_assert_eq!(imm & 0xFFF, 0, "large frame offsets are page-chunked");
        ins(
            o,
            sf | base | 1 << 22 | (imm >> 12) << 10 | (src as u32) << 5 | dst as u32,
        );
    }
}

/// `x16 = base_reg + off` for link-data and similar addressing.
fn lea_scratch(o: &mut Output, base: u8, off: u32) {
    if off < 1 << 12 {
        add_sub_imm(o, X16, base, off, false, true);
    } else {
        mov_imm_raw(o, X16, off as u64, true);
        // add x16, base, x16
        ins(o, 0x8B00_0000 | (X16 as u32) << 16 | (base as u32) << 5 | X16 as u32);
    }
}

/// Load/store through a computed address in x16 (offset 0, unscaled).
fn ldur(o: &mut Output, rt: u8, rn: u8, simm: i32, ty: ValType, fpr: bool) {
    debug_assert!((-256..256).contains(&simm));
    let imm9 = (simm as u32 & 0x1FF) << 12;
    let word = match (fpr, ty) {
        (false, ValType::I32) => 0xB840_0000,
        (false, _) => 0xF840_0000,
        (true, ValType::F32) => 0xBC40_0000,
        (true, _) => 0xFC40_0000,
    };
    ins(o, word | imm9 | (rn as u32) << 5 | rt as u32);
}

fn stur(o: &mut Output, rt: u8, rn: u8, simm: i32, ty: ValType, fpr: bool) {
    debug_assert!((-256..256).contains(&simm));
    let imm9 = (simm as u32 & 0x1FF) << 12;
    let word = match (fpr, ty) {
        (false, ValType::I32) => 0xB800_0000,
        (false, _) => 0xF800_0000,
        (true, ValType::F32) => 0xBC00_0000,
        (true, _) => 0xFC00_0000,
    };
    ins(o, word | imm9 | (rn as u32) << 5 | rt as u32);
}

/// Frame-slot access; falls back to scratch addressing for deep frames.
fn slot_access(o: &mut Output, store: bool, reg: Reg, slot: u32, ty: ValType) {
    let disp = slot_disp(slot);
    let fpr = reg.class == RegClass::Float;
    if disp >= -256 {
        if store {
            stur(o, reg.id, X29, disp, ty, fpr);
        } else {
            ldur(o, reg.id, X29, disp, ty, fpr);
        }
    } else {
        add_sub_imm(o, X16, X29, (-disp) as u32, true, true);
        if store {
            stur(o, reg.id, X16, 0, ty, fpr);
        } else {
            ldur(o, reg.id, X16, 0, ty, fpr);
        }
    }
}

fn mov_rr_int(o: &mut Output, dst: u8, src: u8, wide: bool) {
    // orr dst, zr, src
    let base: u32 = if wide { 0xAA00_03E0 } else { 0x2A00_03E0 };
    ins(o, base | (src as u32) << 16 | dst as u32);
}

fn cmp_rr(o: &mut Output, lhs: u8, rhs: u8, wide: bool) {
    let base: u32 = if wide { 0xEB00_001F } else { 0x6B00_001F };
    ins(o, base | (rhs as u32) << 16 | (lhs as u32) << 5);
}

fn cset(o: &mut Output, dst: u8, cond: u32) {
    // csinc dst, zr, zr, !cond (32-bit result)
    ins(o, 0x1A9F_07E0 | (cond ^ 1) << 12 | dst as u32);
}

fn fcmp(o: &mut Output, lhs: u8, rhs: u8, is64: bool) {
    let base: u32 = if is64 { 0x1E60_2000 } else { 0x1E20_2000 };
    ins(o, base | (rhs as u32) << 16 | (lhs as u32) << 5);
}

fn fmov_to_gpr(o: &mut Output, gpr: u8, fpr: u8, is64: bool) {
    let base: u32 = if is64 { 0x9E66_0000 } else { 0x1E26_0000 };
    ins(o, base | (fpr as u32) << 5 | gpr as u32);
}

fn fmov_from_gpr(o: &mut Output, fpr: u8, gpr: u8, is64: bool) {
    let base: u32 = if is64 { 0x9E67_0000 } else { 0x1E27_0000 };
    ins(o, base | (gpr as u32) << 5 | fpr as u32);
}

fn blr(o: &mut Output, rn: u8) {
    ins(o, 0xD63F_0000 | (rn as u32) << 5);
}

/// Load a 64-bit link-data cell into a GPR.
fn load_link64(o: &mut Output, dst: u8, off: u32) {
    if off % 8 == 0 && off / 8 < 4096 {
        ins(o, 0xF940_0000 | (off / 8) << 10 | (X27 as u32) << 5 | dst as u32);
    } else {
        lea_scratch(o, X27, off);
        ldur(o, dst, X16, 0, ValType::I64, false);
    }
}

fn store_link64(o: &mut Output, src: u8, off: u32) {
    if off % 8 == 0 && off / 8 < 4096 {
        ins(o, 0xF900_0000 | (off / 8) << 10 | (X27 as u32) << 5 | src as u32);
    } else {
        lea_scratch(o, X27, off);
        stur(o, src, X16, 0, ValType::I64, false);
    }
}

impl Aarch64 {
    /// `x16 = linmem_base + addr (+ offset)`, the operand address of one
    /// linear-memory access.
    fn linmem_addr(o: &mut Output, addr: Reg, offset: u32) {
        // add x16, x28, addr (32-bit values are kept zero-extended)
        ins(
            o,
            0x8B00_0000 | (addr.id as u32) << 16 | (X28 as u32) << 5 | X16 as u32,
        );
        if offset != 0 {
            if offset < 1 << 24 && offset & 0xFFF == 0 || offset < 1 << 12 {
                add_sub_imm(o, X16, X16, offset, false, true);
            } else {
                mov_imm_raw(o, X17, offset as u64, true);
                ins(o, 0x8B00_0000 | (X17 as u32) << 16 | (X16 as u32) << 5 | X16 as u32);
            }
        }
    }

    fn trap_seq(o: &mut Output, code: TrapCode, trap_entry: u32) {
        <Self as Isa>::trap(o, code, trap_entry);
    }

    /// Bounds checks for the trapping float→int conversions: trap unless
    /// `lo <= trunc(src) < hi`. Leaves `frintz(src)` in v16.
    fn trunc_range_check(
        o: &mut Output,
        src: u8,
        from64: bool,
        lo_bits: u64,
        hi_bits: u64,
        trap_entry: u32,
    ) {
        // frintz v16, src
        let frintz: u32 = if from64 { 0x1E65_C000 } else { 0x1E25_C000 };
        ins(o, frintz | (src as u32) << 5 | 16);
        // v17 = lo; trap unless v16 >= lo (unordered fails GE)
        mov_imm_raw(o, X17, lo_bits, from64);
        fmov_from_gpr(o, 17, X17, from64);
        fcmp(o, 16, 17, from64);
        let lo_ok = bcond_placeholder(o, cond::GE);
        Self::trap_seq(o, TrapCode::TruncOverflow, trap_entry);
        patch_branch(o, lo_ok);
        // v17 = hi; trap unless v16 < hi (NaN already handled above)
        mov_imm_raw(o, X17, hi_bits, from64);
        fmov_from_gpr(o, 17, X17, from64);
        fcmp(o, 16, 17, from64);
        let hi_ok = bcond_placeholder(o, cond::MI);
        Self::trap_seq(o, TrapCode::TruncOverflow, trap_entry);
        patch_branch(o, hi_ok);
    }
}

impl Isa for Aarch64 {
    const NAME: &'static str = "aarch64";

    const HAS_HARD_FLOAT: bool = true;
    const ACTIVE_BOUNDS_CHECK: bool = false;
    const ACTIVE_DIV_CHECK: bool = true;
    const ACTIVE_STACK_CHECK: bool = false;
    const SLOT_ONLY_64BIT: bool = false;
    const CROSS_CLASS_SPILL: bool = false;
    const CODE_ALIGN: u32 = 4;
    const MAX_FRAME_BYTES: u32 = 4088;

    const LINMEM_BASE: Reg = Reg::gpr(X28);
    const LINK_BASE: Reg = Reg::gpr(X27);
    const LAST_FRAME: Reg = Reg::gpr(26);
    const STACK_FENCE: Reg = Reg::gpr(25);

    const ALLOC_GPRS: &'static [Reg] = &[
        Reg::gpr(19),
        Reg::gpr(20),
        Reg::gpr(21),
        Reg::gpr(22),
        Reg::gpr(23),
        Reg::gpr(24),
        Reg::gpr(9),
        Reg::gpr(10),
        Reg::gpr(11),
        Reg::gpr(12),
        Reg::gpr(13),
    ];
    const ALLOC_FPRS: &'static [Reg] = &[
        Reg::fpr(8),
        Reg::fpr(9),
        Reg::fpr(10),
        Reg::fpr(11),
        Reg::fpr(12),
        Reg::fpr(13),
        Reg::fpr(14),
        Reg::fpr(15),
    ];
    const ARG_GPRS: &'static [Reg] = &[
        Reg::gpr(0),
        Reg::gpr(1),
        Reg::gpr(2),
        Reg::gpr(3),
        Reg::gpr(4),
        Reg::gpr(5),
        Reg::gpr(6),
        Reg::gpr(7),
    ];
    const ARG_FPRS: &'static [Reg] = &[
        Reg::fpr(0),
        Reg::fpr(1),
        Reg::fpr(2),
        Reg::fpr(3),
        Reg::fpr(4),
        Reg::fpr(5),
        Reg::fpr(6),
        Reg::fpr(7),
    ];
    const RET_GPR: Reg = Reg::gpr(0);
    const RET_GPR2: Reg = Reg::gpr(1);
    const RET_FPR: Reg = Reg::fpr(0);
    const SCRATCH: Reg = Reg::gpr(X16);
    const SCRATCH2: Reg = Reg::gpr(X17);
    const SCRATCH_FPR: Reg = Reg::fpr(16);
    const SHIFT_AMOUNT_REG: Option<Reg> = None;
    const CALL_TEMP: Reg = Reg::gpr(19);
    const DIV_CLOBBERS: &'static [Reg] = &[];

    fn prologue(o: &mut Output, _trap_entry: u32) -> PatchSite {
        ins(o, 0xA9BF_7BFD); // stp x29, x30, [sp, #-16]!
        ins(o, 0x9100_03FD); // mov x29, sp
        let site = PatchSite { pos: o.pos() };
        ins(o, 0xD100_03FF); // sub sp, sp, #0 (patched)
        site
    }

    fn patch_frame_size(o: &mut Output, site: PatchSite, frame_bytes: u32) {
        debug_assert!(frame_bytes < 1 << 12);
        o.patch_insn_or(site.pos, frame_bytes << 10);
    }

    fn epilogue(o: &mut Output) {
        ins(o, 0x9100_03BF); // mov sp, x29
        ins(o, 0xA8C1_7BFD); // ldp x29, x30, [sp], #16
        ins(o, 0xD65F_03C0); // ret
    }

    fn store_zero_slot(o: &mut Output, slot: u32) {
        slot_access(o, true, Reg::gpr(XZR), slot, ValType::I64);
    }

    fn mov_imm(o: &mut Output, dst: Reg, bits: u64, wide: bool) {
        mov_imm_raw(o, dst.id, bits, wide);
    }

    fn fmov_imm(o: &mut Output, dst: Reg, bits: u64, is64: bool) {
        mov_imm_raw(o, X16, bits, is64);
        fmov_from_gpr(o, dst.id, X16, is64);
    }

    fn mov_rr(o: &mut Output, dst: Reg, src: Reg, ty: ValType) {
        match (dst.class, src.class) {
            (RegClass::Int, RegClass::Int) => mov_rr_int(o, dst.id, src.id, ty.is_64bit()),
            (RegClass::Float, RegClass::Float) => {
                // fmov d/s
                let base: u32 = if ty.is_64bit() { 0x1E60_4000 } else { 0x1E20_4000 };
                ins(o, base | (src.id as u32) << 5 | dst.id as u32);
            }
            (RegClass::Float, RegClass::Int) => fmov_from_gpr(o, dst.id, src.id, ty.is_64bit()),
            (RegClass::Int, RegClass::Float) => fmov_to_gpr(o, dst.id, src.id, ty.is_64bit()),
        }
    }

    fn load_slot(o: &mut Output, dst: Reg, slot: u32, ty: ValType) {
        slot_access(o, false, dst, slot, ty);
    }

    fn store_slot(o: &mut Output, src: Reg, slot: u32, ty: ValType) {
        slot_access(o, true, src, slot, ty);
    }

    fn copy_slot(o: &mut Output, dst_slot: u32, src_slot: u32, _ty: ValType) {
        slot_access(o, false, Reg::gpr(X17), src_slot, ValType::I64);
        slot_access(o, true, Reg::gpr(X17), dst_slot, ValType::I64);
    }

    fn store_slot_imm64(o: &mut Output, slot: u32, bits: u64) {
        mov_imm_raw(o, X17, bits, true);
        slot_access(o, true, Reg::gpr(X17), slot, ValType::I64);
    }

    fn store_slot_pair(_o: &mut Output, _lo: Reg, _hi: Reg, _slot: u32) {
        unreachable!("64-bit values occupy single registers on aarch64");
    }

    fn load_slot_pair(_o: &mut Output, _lo: Reg, _hi: Reg, _slot: u32) {
        unreachable!("64-bit values occupy single registers on aarch64");
    }

    fn int_op(o: &mut Output, op: IntOp, dst: Reg, rhs: Reg, wide: bool) {
        let sf: u32 = if wide { 1 << 31 } else { 0 };
        let (rd, rn, rm) = (dst.id as u32, dst.id as u32, rhs.id as u32);
        let word = match op {
            IntOp::Add => 0x0B00_0000,
            IntOp::Sub => 0x4B00_0000,
            IntOp::And => 0x0A00_0000,
            IntOp::Or => 0x2A00_0000,
            IntOp::Xor => 0x4A00_0000,
            IntOp::Mul => {
                // madd dst, dst, rhs, zr
                ins(o, sf | 0x1B00_7C00 | rm << 16 | rn << 5 | rd);
                return;
            }
        };
        ins(o, sf | word | rm << 16 | rn << 5 | rd);
    }

    fn int_shift(o: &mut Output, op: ShiftOp, dst: Reg, amount: Reg, wide: bool) {
        let sf: u32 = if wide { 1 << 31 } else { 0 };
        let (rd, rn, rm) = (dst.id as u32, dst.id as u32, amount.id as u32);
        match op {
            ShiftOp::Shl => ins(o, sf | 0x1AC0_2000 | rm << 16 | rn << 5 | rd),
            ShiftOp::ShrU => ins(o, sf | 0x1AC0_2400 | rm << 16 | rn << 5 | rd),
            ShiftOp::ShrS => ins(o, sf | 0x1AC0_2800 | rm << 16 | rn << 5 | rd),
            ShiftOp::Rotr => ins(o, sf | 0x1AC0_2C00 | rm << 16 | rn << 5 | rd),
            ShiftOp::Rotl => {
                // ror by (width - amount): neg x17, amount; ror
                let width_sub: u32 = if wide { 0xCB00_03E0 } else { 0x4B00_03E0 };
                ins(o, width_sub | rm << 16 | X17 as u32); // neg x17, rm
                ins(o, sf | 0x1AC0_2C00 | (X17 as u32) << 16 | rn << 5 | rd);
            }
        }
    }

    fn int_div(
        o: &mut Output,
        signed: bool,
        rem: bool,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
        wide: bool,
        trap_entry: u32,
    ) {
        let sf: u32 = if wide { 1 << 31 } else { 0 };
        // Division by zero never faults on this ISA; check explicitly.
        let nonzero = cbz_placeholder(o, rhs.id, true, wide);
        Self::trap_seq(o, TrapCode::DivZero, trap_entry);
        patch_branch(o, nonzero);
        if signed && !rem {
            // MIN / -1 wraps silently in hardware; wasm traps.
            // x17 = rhs + 1; x16 = lhs - MIN; overflow iff both are zero.
            let add_one: u32 = if wide { 0x9100_0400 } else { 0x1100_0400 };
            ins(o, add_one | (rhs.id as u32) << 5 | X17 as u32);
            let min_ok = cbz_placeholder(o, X17, true, wide);
            mov_imm_raw(o, X16, if wide { 1 << 63 } else { 1 << 31 }, wide);
            cmp_rr(o, lhs.id, X16, wide);
            let lhs_ok = bcond_placeholder(o, cond::NE);
            Self::trap_seq(o, TrapCode::DivOverflow, trap_entry);
            patch_branch(o, lhs_ok);
            patch_branch(o, min_ok);
        }
        let div: u32 = if signed { 0x1AC0_0C00 } else { 0x1AC0_0800 };
        if rem {
            // quot in x17, then msub dst = lhs - quot*rhs
            ins(o, sf | div | (rhs.id as u32) << 16 | (lhs.id as u32) << 5 | X17 as u32);
            ins(
                o,
                sf | 0x1B00_8000
                    | (rhs.id as u32) << 16
                    | (lhs.id as u32) << 10
                    | (X17 as u32) << 5
                    | dst.id as u32,
            );
        } else {
            ins(o, sf | div | (rhs.id as u32) << 16 | (lhs.id as u32) << 5 | dst.id as u32);
        }
    }

    fn int_unop(o: &mut Output, op: IntUnOp, dst: Reg, src: Reg, wide: bool) {
        let sf: u32 = if wide { 1 << 31 } else { 0 };
        match op {
            IntUnOp::Clz => {
                ins(o, sf | 0x5AC0_1000 | (src.id as u32) << 5 | dst.id as u32);
            }
            IntUnOp::Ctz => {
                // rbit + clz
                ins(o, sf | 0x5AC0_0000 | (src.id as u32) << 5 | X17 as u32);
                ins(o, sf | 0x5AC0_1000 | (X17 as u32) << 5 | dst.id as u32);
            }
            IntUnOp::Popcnt => {
                // through the vector unit: fmov d16; cnt; addv; fmov back
                if wide {
                    ins(o, 0x9E67_0000 | (src.id as u32) << 5 | 16);
                } else {
                    ins(o, 0x1E27_0000 | (src.id as u32) << 5 | 16);
                }
                ins(o, 0x0E20_5800 | 16 << 5 | 16); // cnt v16.8b
                ins(o, 0x0E31_B800 | 16 << 5 | 16); // addv b16
                ins(o, 0x1E26_0000 | 16 << 5 | dst.id as u32); // fmov w, s16
            }
        }
    }

    fn int_cmp(o: &mut Output, cmp: IntCmp, dst: Reg, lhs: Reg, rhs: Reg, wide: bool) {
        cmp_rr(o, lhs.id, rhs.id, wide);
        let cond = match cmp {
            IntCmp::Eq => cond::EQ,
            IntCmp::Ne => cond::NE,
            IntCmp::LtS => cond::LT,
            IntCmp::LtU => cond::LO,
            IntCmp::GtS => cond::GT,
            IntCmp::GtU => cond::HI,
            IntCmp::LeS => cond::LE,
            IntCmp::LeU => cond::LS,
            IntCmp::GeS => cond::GE,
            IntCmp::GeU => cond::HS,
        };
        cset(o, dst.id, cond);
    }

    fn int_eqz(o: &mut Output, dst: Reg, src: Reg, wide: bool) {
        let base: u32 = if wide { 0xEB00_001F } else { 0x6B00_001F };
        ins(o, base | (XZR as u32) << 16 | (src.id as u32) << 5);
        cset(o, dst.id, cond::EQ);
    }

    fn extend32(o: &mut Output, dst: Reg, src: Reg, signed: bool) {
        if signed {
            // sxtw
            ins(o, 0x9340_7C00 | (src.id as u32) << 5 | dst.id as u32);
        } else {
            mov_rr_int(o, dst.id, src.id, false);
        }
    }

    fn wrap64(o: &mut Output, dst: Reg, src: Reg) {
        mov_rr_int(o, dst.id, src.id, false);
    }

    fn float_op(o: &mut Output, op: FloatOp, dst: Reg, rhs: Reg, is64: bool) {
        let ty: u32 = if is64 { 1 << 22 } else { 0 };
        let (rd, rn, rm) = (dst.id as u32, dst.id as u32, rhs.id as u32);
        let word = match op {
            FloatOp::Add => 0x1E20_2800,
            FloatOp::Sub => 0x1E20_3800,
            FloatOp::Mul => 0x1E20_0800,
            FloatOp::Div => 0x1E20_1800,
            // fmin/fmax have wasm's NaN and signed-zero behavior natively.
            FloatOp::Min => 0x1E20_5800,
            FloatOp::Max => 0x1E20_4800,
            FloatOp::Copysign => {
                // bit-blend through the scratch GPRs
                fmov_to_gpr(o, X16, dst.id, is64);
                fmov_to_gpr(o, X17, rhs.id, is64);
                // x16 = (x16 << 1) >> 1 clears the sign bit
                if is64 {
                    ins(o, 0xD37F_F800 | (X16 as u32) << 5 | X16 as u32); // lsl #1
                    ins(o, 0xD341_FC00 | (X16 as u32) << 5 | X16 as u32); // lsr #1
                } else {
                    ins(o, 0x531F_7800 | (X16 as u32) << 5 | X16 as u32);
                    ins(o, 0x5301_7C00 | (X16 as u32) << 5 | X16 as u32);
                }
                // x17 = (x17 >> (w-1)) << (w-1) isolates the sign bit
                if is64 {
                    ins(o, 0xD37F_FC00 | (X17 as u32) << 5 | X17 as u32); // lsr #63
                    ins(o, 0xD341_0000 | (X17 as u32) << 5 | X17 as u32); // lsl #63
                } else {
                    ins(o, 0x531F_7C00 | (X17 as u32) << 5 | X17 as u32);
                    ins(o, 0x5301_0000 | (X17 as u32) << 5 | X17 as u32);
                }
                let orr: u32 = if is64 { 0xAA00_0000 } else { 0x2A00_0000 };
                ins(o, orr | (X17 as u32) << 16 | (X16 as u32) << 5 | X16 as u32);
                fmov_from_gpr(o, dst.id, X16, is64);
                return;
            }
        };
        ins(o, word | ty | rm << 16 | rn << 5 | rd);
    }

    fn float_unop(o: &mut Output, op: FloatUn, dst: Reg, is64: bool) {
        let ty: u32 = if is64 { 1 << 22 } else { 0 };
        let (rd, rn) = (dst.id as u32, dst.id as u32);
        let word = match op {
            FloatUn::Abs => 0x1E20_C000,
            FloatUn::Neg => 0x1E21_4000,
            FloatUn::Sqrt => 0x1E21_C000,
            FloatUn::Floor => 0x1E25_4000,
            FloatUn::Ceil => 0x1E24_C000,
            FloatUn::Trunc => 0x1E25_C000,
            FloatUn::Nearest => 0x1E24_4000,
        };
        ins(o, word | ty | rn << 5 | rd);
    }

    fn float_cmp(o: &mut Output, cmp: FloatCmp, dst: Reg, lhs: Reg, rhs: Reg, is64: bool) {
        fcmp(o, lhs.id, rhs.id, is64);
        // Unordered comparisons: pick conditions that fail on NaN, except ne.
        let cond = match cmp {
            FloatCmp::Eq => cond::EQ,
            FloatCmp::Ne => cond::NE,
            FloatCmp::Lt => cond::MI,
            FloatCmp::Gt => cond::GT,
            FloatCmp::Le => cond::LS,
            FloatCmp::Ge => cond::GE,
        };
        cset(o, dst.id, cond);
    }

    fn float_from_int(o: &mut Output, dst: Reg, src: Reg, to64: bool, from64: bool, signed: bool) {
        let ty: u32 = if to64 { 1 << 22 } else { 0 };
        let sf: u32 = if from64 { 1 << 31 } else { 0 };
        let op: u32 = if signed { 0x1E22_0000 } else { 0x1E23_0000 };
        ins(o, sf | op | ty | (src.id as u32) << 5 | dst.id as u32);
    }

    fn int_from_float(
        o: &mut Output,
        dst: Reg,
        src: Reg,
        to64: bool,
        from64: bool,
        signed: bool,
        trap_entry: u32,
    ) {
        let (lo, hi): (u64, u64) = match (to64, signed, from64) {
            (false, true, false) => (0xCF00_0000, 0x4F00_0000),
            (false, true, true) => (0xC1E0_0000_0000_0000, 0x41E0_0000_0000_0000),
            (false, false, false) => (0, 0x4F80_0000),
            (false, false, true) => (0, 0x41F0_0000_0000_0000),
            (true, true, false) => (0xDF00_0000, 0x5F00_0000),
            (true, true, true) => (0xC3E0_0000_0000_0000, 0x43E0_0000_0000_0000),
            (true, false, false) => (0, 0x5F80_0000),
            (true, false, true) => (0, 0x43F0_0000_0000_0000),
        };
        Self::trunc_range_check(o, src.id, from64, lo, hi, trap_entry);
        let sf: u32 = if to64 { 1 << 31 } else { 0 };
        let ty: u32 = if from64 { 1 << 22 } else { 0 };
        let op: u32 = if signed { 0x1E38_0000 } else { 0x1E39_0000 };
        ins(o, sf | op | ty | (src.id as u32) << 5 | dst.id as u32);
    }

    fn float_promote(o: &mut Output, dst: Reg, src: Reg) {
        ins(o, 0x1E22_C000 | (src.id as u32) << 5 | dst.id as u32);
    }

    fn float_demote(o: &mut Output, dst: Reg, src: Reg) {
        ins(o, 0x1E62_4000 | (src.id as u32) << 5 | dst.id as u32);
    }

    fn aux_op(
        _o: &mut Output,
        _op: AuxOp,
        _dst_slot: u32,
        _a_slot: u32,
        _b_slot: Option<u32>,
        _trap_entry: u32,
    ) {
        unreachable!("aarch64 has native 64-bit and float support");
    }

    fn load_linmem(
        o: &mut Output,
        dst: Reg,
        addr: Reg,
        offset: u32,
        acc: MemAccess,
        _trap_entry: u32,
    ) {
        Self::linmem_addr(o, addr, offset);
        let rt = dst.id as u32;
        let word: u32 = match acc {
            MemAccess::I32Load8S => 0x39C0_0000,
            MemAccess::I32Load8U | MemAccess::I64Load8U => 0x3940_0000,
            MemAccess::I32Load16S => 0x79C0_0000,
            MemAccess::I32Load16U | MemAccess::I64Load16U => 0x7940_0000,
            MemAccess::I32 | MemAccess::I64Load32U => 0xB940_0000,
            MemAccess::I64Load8S => 0x3980_0000,
            MemAccess::I64Load16S => 0x7980_0000,
            MemAccess::I64Load32S => 0xB980_0000,
            MemAccess::I64 => 0xF940_0000,
            MemAccess::F32 => 0xBD40_0000,
            MemAccess::F64 => 0xFD40_0000,
        };
        ins(o, word | (X16 as u32) << 5 | rt);
    }

    fn store_linmem(
        o: &mut Output,
        src: Reg,
        addr: Reg,
        offset: u32,
        acc: MemAccess,
        _trap_entry: u32,
    ) {
        Self::linmem_addr(o, addr, offset);
        let rt = src.id as u32;
        let word: u32 = match acc.width() {
            1 => 0x3900_0000,
            2 => 0x7900_0000,
            4 => {
                if src.class == RegClass::Float {
                    0xBD00_0000
                } else {
                    0xB900_0000
                }
            }
            _ => {
                if src.class == RegClass::Float {
                    0xFD00_0000
                } else {
                    0xF900_0000
                }
            }
        };
        ins(o, word | (X16 as u32) << 5 | rt);
    }

    fn linmem64_slot(
        _o: &mut Output,
        _store: bool,
        _addr: Reg,
        _offset: u32,
        _slot: u32,
        _trap_entry: u32,
    ) {
        unreachable!("aarch64 accesses 64-bit memory operands in registers");
    }

    fn memory_size(o: &mut Output, dst: Reg) {
        Self::load_link(o, dst, ld::LINMEM_SIZE, ValType::I32);
        // lsr dst, dst, #16
        ins(o, 0x5350_7C00 | (dst.id as u32) << 5 | dst.id as u32);
    }

    fn memory_grow(o: &mut Output, dst: Reg, delta: Reg) {
        load_link64(o, 0, ld::RUNTIME_CTX);
        mov_rr_int(o, 1, delta.id, false);
        load_link64(o, X16, ld::MEMORY_GROW_FN);
        blr(o, X16);
        mov_rr_int(o, dst.id, 0, false);
    }

    fn load_link(o: &mut Output, dst: Reg, link_off: u32, ty: ValType) {
        lea_scratch(o, X27, link_off);
        ldur(o, dst.id, X16, 0, ty, dst.class == RegClass::Float);
    }

    fn store_link(o: &mut Output, src: Reg, link_off: u32, ty: ValType) {
        lea_scratch(o, X27, link_off);
        stur(o, src.id, X16, 0, ty, src.class == RegClass::Float);
    }

    fn link64_slot(_o: &mut Output, _store: bool, _link_off: u32, _slot: u32) {
        unreachable!("aarch64 moves 64-bit link slots through registers");
    }

    fn jump(o: &mut Output) -> PatchSite {
        b_placeholder(o)
    }

    fn jump_back(o: &mut Output, target: u32) {
        b_to(o, target);
    }

    fn br_if_zero(o: &mut Output, cond: Reg) -> PatchSite {
        cbz_placeholder(o, cond.id, false, false)
    }

    fn br_if_nonzero(o: &mut Output, cond: Reg) -> PatchSite {
        cbz_placeholder(o, cond.id, true, false)
    }

    fn patch_jump(o: &mut Output, site: PatchSite) {
        patch_branch(o, site);
    }

    fn br_if_eq_imm(o: &mut Output, index: Reg, case: u32) -> PatchSite {
        if case < 1 << 12 {
            ins(o, 0x7100_001F | case << 10 | (index.id as u32) << 5);
        } else {
            mov_imm_raw(o, X17, case as u64, false);
            cmp_rr(o, index.id, X17, false);
        }
        bcond_placeholder(o, cond::EQ)
    }

    fn call_rel(o: &mut Output) -> PatchSite {
        let site = PatchSite { pos: o.pos() };
        ins(o, 0x9400_0000);
        site
    }

    fn patch_call(o: &mut Output, site: PatchSite, target: u32) {
        let delta = (target.wrapping_sub(site.pos) as i32) / 4;
        o.patch_insn_or(site.pos, delta as u32 & 0x03FF_FFFF);
    }

    fn call_link_slot(o: &mut Output, link_off: u32) {
        load_link64(o, X16, link_off);
        blr(o, X16);
    }

    fn call_absolute(o: &mut Output, addr: u64) {
        mov_imm_raw(o, X16, addr, true);
        blr(o, X16);
    }

    fn adjust_sp(o: &mut Output, bytes: i32) {
        add_sub_imm(o, SP, SP, bytes.unsigned_abs(), bytes < 0, true);
    }

    fn store_sp(o: &mut Output, src: Reg, sp_off: u32, ty: ValType) {
        // x17 = sp + off, then store unscaled
        add_sub_imm(o, X17, SP, sp_off, false, true);
        stur(o, src.id, X17, 0, ty, src.class == RegClass::Float);
    }

    fn load_sp(o: &mut Output, dst: Reg, sp_off: u32, ty: ValType) {
        add_sub_imm(o, X17, SP, sp_off, false, true);
        ldur(o, dst.id, X17, 0, ty, dst.class == RegClass::Float);
    }

    fn sp_addr(o: &mut Output, dst: Reg, sp_off: u32) {
        add_sub_imm(o, dst.id, SP, sp_off, false, true);
    }

    fn sp_slot_copy(o: &mut Output, to_sp: bool, sp_off: u32, slot: u32) {
        if to_sp {
            slot_access(o, false, Reg::gpr(X17), slot, ValType::I64);
            Self::store_sp(o, Reg::gpr(X17), sp_off, ValType::I64);
        } else {
            Self::load_sp(o, Reg::gpr(X17), sp_off, ValType::I64);
            slot_access(o, true, Reg::gpr(X17), slot, ValType::I64);
        }
    }

    fn call_indirect(
        o: &mut Output,
        index: Reg,
        expected_sig: u32,
        table_off: u32,
        trap_entry: u32,
    ) {
        lea_scratch(o, X27, table_off);
        ldur(o, X17, X16, 0, ValType::I32, false);
        cmp_rr(o, index.id, X17, false);
        let in_bounds = bcond_placeholder(o, cond::LO);
        Self::trap_seq(o, TrapCode::IndirectCallOutOfBounds, trap_entry);
        patch_branch(o, in_bounds);
        // x16 = &table[index] = x16 + 8 + (index << 4)
        add_sub_imm(o, X16, X16, 8, false, true);
        ins(
            o,
            0x8B20_4000 | (index.id as u32) << 16 | 4 << 10 | (X16 as u32) << 5 | X16 as u32,
        );
        ldur(o, X17, X16, 0, ValType::I32, false);
        // The index operand is dead now; reuse it for the expected sig.
        mov_imm_raw(o, index.id, expected_sig as u64, false);
        cmp_rr(o, X17, index.id, false);
        let sig_ok = bcond_placeholder(o, cond::EQ);
        Self::trap_seq(o, TrapCode::IndirectCallWrongSig, trap_entry);
        patch_branch(o, sig_ok);
        ldur(o, X17, X16, 8, ValType::I64, false);
        blr(o, X17);
    }

    fn trap(o: &mut Output, code: TrapCode, trap_entry: u32) {
        mov_rr_int(o, 0, X28, true);
        mov_imm_raw(o, 1, code.as_u32() as u64, false);
        let delta = (trap_entry.wrapping_sub(o.pos()) as i32) / 4;
        ins(o, 0x9400_0000 | delta as u32 & 0x03FF_FFFF);
    }

    fn interruption_poll(o: &mut Output, trap_entry: u32) {
        lea_scratch(o, X27, ld::INTERRUPT_FLAG);
        ldur(o, X17, X16, 0, ValType::I32, false);
        let skip = cbz_placeholder(o, X17, false, false);
        mov_rr_int(o, 0, X28, true);
        mov_rr_int(o, 1, X17, false);
        let delta = (trap_entry.wrapping_sub(o.pos()) as i32) / 4;
        ins(o, 0x9400_0000 | delta as u32 & 0x03FF_FFFF);
        patch_branch(o, skip);
    }

    fn stacktrace_push(o: &mut Output, func_index: u32, cap: u32) {
        lea_scratch(o, X27, ld::RING_IDX);
        ldur(o, X17, X16, 0, ValType::I32, false);
        // store func_index at [x27 + RING_SLOTS + idx*4]
        lea_scratch(o, X27, ld::RING_SLOTS);
        // x16 += x17 << 2
        ins(
            o,
            0x8B00_0000 | (X17 as u32) << 16 | 2 << 10 | (X16 as u32) << 5 | X16 as u32,
        );
        mov_imm_raw(o, X30, func_index as u64, false);
        stur(o, X30, X16, 0, ValType::I32, false);
        // idx = (idx + 1 == cap) ? 0 : idx + 1
        add_sub_imm(o, X17, X17, 1, false, false);
        if cap < 1 << 12 {
            ins(o, 0x7100_001F | cap << 10 | (X17 as u32) << 5);
        } else {
            mov_imm_raw(o, X30, cap as u64, false);
            cmp_rr(o, X17, X30, false);
        }
        // csel x17, xzr, x17, eq
        ins(o, 0x1A80_03F1 | (X17 as u32) << 16 | (cond::EQ) << 12);
        lea_scratch(o, X27, ld::RING_IDX);
        stur(o, X17, X16, 0, ValType::I32, false);
        // count += 1
        lea_scratch(o, X27, ld::RING_COUNT);
        ldur(o, X17, X16, 0, ValType::I32, false);
        add_sub_imm(o, X17, X17, 1, false, false);
        stur(o, X17, X16, 0, ValType::I32, false);
    }

    fn stacktrace_pop(o: &mut Output, cap: u32) {
        lea_scratch(o, X27, ld::RING_IDX);
        ldur(o, X17, X16, 0, ValType::I32, false);
        // idx = (idx == 0 ? cap : idx) - 1
        mov_imm_raw(o, X30, cap as u64, false);
        ins(o, 0x7100_001F | (X17 as u32) << 5); // cmp w17, #0
        // csel w17, w30, w17, eq
        ins(
            o,
            0x1A80_0000
                | (X17 as u32) << 16
                | (cond::EQ) << 12
                | (X30 as u32) << 5
                | X17 as u32,
        );
        add_sub_imm(o, X17, X17, 1, true, false);
        stur(o, X17, X16, 0, ValType::I32, false);
        lea_scratch(o, X27, ld::RING_COUNT);
        ldur(o, X17, X16, 0, ValType::I32, false);
        add_sub_imm(o, X17, X17, 1, true, false);
        stur(o, X17, X16, 0, ValType::I32, false);
    }

    fn emit_trap_entry(o: &mut Output) {
        // w1 = code
        store_link64(o, 1, ld::TRAP_CODE);
        load_link64(o, X16, ld::LAST_FRAME);
        ins(o, 0x9100_021F); // mov sp, x16
        load_link64(o, X16, ld::RECOVERY_PC);
        ins(o, 0xD61F_0000 | (X16 as u32) << 5); // br x16
    }

    fn emit_landing_pad(o: &mut Output, trap_entry: u32) -> Option<u32> {
        let pad = o.pos();
        // Entered with x30 = faulting pc. Save the caller-saved integer
        // registers (including the scratch pair holding the faulting
        // address) and the return address.
        for pair in (0..18u8).step_by(2) {
            // stp xN, xN+1, [sp, #-16]!
            ins(
                o,
                0xA9BF_0000 | ((pair + 1) as u32) << 10 | (SP as u32) << 5 | pair as u32,
            );
        }
        ins(o, 0xA9BF_7FFE); // stp x30, xzr, [sp, #-16]!
        load_link64(o, 0, ld::RUNTIME_CTX);
        load_link64(o, 1, ld::PROBE_OFFSET);
        load_link64(o, 2, ld::PROBE_FN);
        blr(o, 2);
        let resumed = cbz_placeholder(o, 0, true, false);
        Self::trap_seq(o, TrapCode::LinmemCouldNotExtend, trap_entry);
        patch_branch(o, resumed);
        ins(o, 0xA8C1_7FFE); // ldp x30, xzr, [sp], #16
        for pair in (0..18u8).step_by(2).rev() {
            ins(
                o,
                0xA8C1_0000 | ((pair + 1) as u32) << 10 | (SP as u32) << 5 | pair as u32,
            );
        }
        ins(o, 0xD65F_03C0); // ret (x30: retry the faulting instruction)
        Some(pad)
    }

    fn emit_export_wrapper(o: &mut Output, sig: &FuncSignature, body_offset: u32) {
        // extern "C" fn(link_data: x0, args: x1, results: x2)
        ins(o, 0xA9BF_7BFD); // stp x29, x30, [sp, #-16]!
        ins(o, 0x9100_03FD); // mov x29, sp
        for pair in [(19u8, 20u8), (21, 22), (23, 24), (25, 26), (27, 28)] {
            ins(
                o,
                0xA9BF_0000 | (pair.1 as u32) << 10 | (SP as u32) << 5 | pair.0 as u32,
            );
        }
        for pair in [(8u8, 9u8), (10, 11), (12, 13), (14, 15)] {
            // stp dN, dN+1, [sp, #-16]!
            ins(
                o,
                0x6DBF_0000 | (pair.1 as u32) << 10 | (SP as u32) << 5 | pair.0 as u32,
            );
        }
        mov_rr_int(o, X27, 0, true);
        load_link64(o, X28, ld::LINMEM_BASE);
        load_link64(o, X16, ld::LAST_FRAME);
        load_link64(o, X17, ld::RECOVERY_PC);
        ins(o, 0xA9BF_0000 | (X17 as u32) << 10 | (SP as u32) << 5 | X16 as u32);
        ins(o, 0xA9BF_0000 | (XZR as u32) << 10 | (SP as u32) << 5 | 2); // stp x2, xzr
        // adr x16, recovery
        let adr_site = PatchSite { pos: o.pos() };
        ins(o, 0x1000_0000 | X16 as u32);
        store_link64(o, X16, ld::RECOVERY_PC);
        ins(o, 0x9100_03F0); // mov x16, sp
        store_link64(o, X16, ld::LAST_FRAME);

        // Marshal arguments; whatever lands in x1 is loaded last.
        let mut next_gpr = 0usize;
        let mut next_fpr = 0usize;
        let mut x1_arg: Option<usize> = None;
        for (i, ty) in sig.params.iter().enumerate() {
            let disp = (8 * i) as u32;
            match ty.class() {
                RegClass::Int => {
                    let reg = Self::ARG_GPRS[next_gpr];
                    next_gpr += 1;
                    if reg.id == 1 {
                        x1_arg = Some(i);
                    } else {
                        add_sub_imm(o, X16, 1, disp, false, true);
                        ldur(o, reg.id, X16, 0, ValType::I64, false);
                    }
                }
                RegClass::Float => {
                    let reg = Self::ARG_FPRS[next_fpr];
                    next_fpr += 1;
                    add_sub_imm(o, X16, 1, disp, false, true);
                    ldur(o, reg.id, X16, 0, *ty, true);
                }
            }
        }
        if let Some(i) = x1_arg {
            add_sub_imm(o, X16, 1, (8 * i) as u32, false, true);
            ldur(o, 1, X16, 0, ValType::I64, false);
        }

        // bl body
        let delta = (body_offset.wrapping_sub(o.pos()) as i32) / 4;
        ins(o, 0x9400_0000 | delta as u32 & 0x03FF_FFFF);

        // Store the (single) result through the saved results pointer.
        if let Some(ty) = sig.results.first() {
            ldur(o, X16, SP, 0, ValType::I64, false);
            match ty.class() {
                RegClass::Int => stur(o, 0, X16, 0, *ty, false),
                RegClass::Float => stur(o, 0, X16, 0, *ty, true),
            }
        }

        // recovery:
        let recovery = o.pos();
        let adr_delta = recovery.wrapping_sub(adr_site.pos);
        o.patch_insn_or(
            adr_site.pos,
            ((adr_delta & 3) << 29) | (((adr_delta >> 2) & 0x7FFFF) << 5),
        );
        // restore outer trap state from [sp+16..32]
        ldur(o, X16, SP, 16, ValType::I64, false);
        ldur(o, X17, SP, 24, ValType::I64, false);
        store_link64(o, X16, ld::LAST_FRAME);
        store_link64(o, X17, ld::RECOVERY_PC);
        add_sub_imm(o, SP, SP, 32, false, true);
        for pair in [(14u8, 15u8), (12, 13), (10, 11), (8, 9)] {
            ins(
                o,
                0x6CC1_0000 | (pair.1 as u32) << 10 | (SP as u32) << 5 | pair.0 as u32,
            );
        }
        for pair in [(27u8, 28u8), (25, 26), (23, 24), (21, 22), (19, 20)] {
            ins(
                o,
                0xA8C1_0000 | (pair.1 as u32) << 10 | (SP as u32) << 5 | pair.0 as u32,
            );
        }
        ins(o, 0xA8C1_7BFD); // ldp x29, x30, [sp], #16
        ins(o, 0xD65F_03C0); // ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_fixed_width() {
        let mut o = Output::new();
        let site = b_placeholder(&mut o);
        ins(&mut o, 0xD503_201F); // nop
        patch_branch(&mut o, site);
        // b +2 instructions
        assert_eq!(o.read_u32_at(0), 0x1400_0002);
        assert_eq!(o.pos() % 4, 0);
    }

    #[test]
    fn mov_imm_builds_wide_constants() {
        let mut o = Output::new();
        mov_imm_raw(&mut o, 0, 0, false);
        assert_eq!(o.read_u32_at(0), 0x5280_0000); // movz w0, #0
        let mut o = Output::new();
        mov_imm_raw(&mut o, 3, 0x0001_0000, true);
        // movk x3, #1, lsl #16 as the only chunk is emitted as movz
        assert_eq!(o.read_u32_at(0), 0xD280_0000 | 1 << 21 | 1 << 5 | 3);
    }

    #[test]
    fn prologue_epilogue_shape() {
        let mut o = Output::new();
        let site = Aarch64::prologue(&mut o, 0);
        Aarch64::patch_frame_size(&mut o, site, 32);
        Aarch64::epilogue(&mut o);
        assert_eq!(o.read_u32_at(0), 0xA9BF_7BFD);
        assert_eq!(o.read_u32_at(8), 0xD100_03FF | 32 << 10);
        assert_eq!(o.read_u32_at(o.pos() - 4), 0xD65F_03C0);
    }
}

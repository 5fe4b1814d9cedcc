//! ISA-3 emitter: 32-bit embedded RISC (RV32IM, ilp32 soft-float).
//!
//! No float hardware and no 64-bit registers: f32 values live in integer
//! registers, i64/f64 values live in frame slots and stream through the
//! scratch pair plus the (never-allocated) a-registers. Float arithmetic
//! and the expensive integer helpers dispatch through the aux pointer
//! table in link data. Every protection here is active: explicit bounds
//! checks, explicit division checks, explicit stack-fence check.

use crate::compile::backend::softfloat::{AuxOp, IntAuxFn, SoftfloatFn};
use crate::compile::backend::{FloatCmp, FloatOp, FloatUn, IntCmp, IntOp, IntUnOp, Isa, MemAccess, ShiftOp};
use crate::compile::module_info::FuncSignature;
use crate::compile::output::{Output, PatchSite};
use crate::compile::regalloc::Reg;
use crate::runtime::link_data::offsets as ld;
use crate::traps::TrapCode;
use crate::values::{RegClass, ValType};

pub struct Rv32;

const ZERO: u8 = 0;
const RA: u8 = 1;
const SP: u8 = 2;
const S0: u8 = 8; // frame pointer
const A0: u8 = 10;
const A1: u8 = 11;
const A2: u8 = 12;
const A3: u8 = 13;
const A4: u8 = 14;
const A5: u8 = 15;
const S2: u8 = 18; // linear-memory base
const S3: u8 = 19; // link-data base
const T5: u8 = 30;
const T6: u8 = 31;

/// Aux dispatch table: a fixed link-data location directly after the fixed
/// header; the stacktrace ring follows it on this target.
const AUX_TABLE: u32 = ld::RING_SLOTS;
const RING_SLOTS: u32 =
    ld::RING_SLOTS + 8 * crate::compile::backend::softfloat::AUX_TABLE_ENTRIES;

const OP: u32 = 0x33;
const OP_IMM: u32 = 0x13;
const LOAD: u32 = 0x03;
const STORE: u32 = 0x23;
const BRANCH: u32 = 0x63;
const JAL: u32 = 0x6F;
const JALR: u32 = 0x67;
const LUI: u32 = 0x37;
const AUIPC: u32 = 0x17;

fn ins(o: &mut Output, word: u32) {
    o.write_u32(word);
}

fn r_type(funct7: u32, rs2: u8, rs1: u8, funct3: u32, rd: u8) -> u32 {
    funct7 << 25 | (rs2 as u32) << 20 | (rs1 as u32) << 15 | funct3 << 12 | (rd as u32) << 7 | OP
}

fn i_type(opcode: u32, imm: i32, rs1: u8, funct3: u32, rd: u8) -> u32 {
    debug_assert!((-2048..2048).contains(&imm));
    (imm as u32 & 0xFFF) << 20 | (rs1 as u32) << 15 | funct3 << 12 | (rd as u32) << 7 | opcode
}

fn s_type(imm: i32, rs2: u8, rs1: u8, funct3: u32) -> u32 {
    debug_assert!((-2048..2048).contains(&imm));
    let imm = imm as u32 & 0xFFF;
    (imm >> 5) << 25 | (rs2 as u32) << 20 | (rs1 as u32) << 15 | funct3 << 12 | (imm & 0x1F) << 7 | STORE
}

fn b_imm(delta: i32) -> u32 {
    debug_assert!(delta % 2 == 0 && (-4096..4096).contains(&delta));
    let d = delta as u32;
    ((d >> 12) & 1) << 31 | ((d >> 5) & 0x3F) << 25 | ((d >> 1) & 0xF) << 8 | ((d >> 11) & 1) << 7
}

fn j_imm(delta: i32) -> u32 {
    let d = delta as u32;
    ((d >> 20) & 1) << 31 | ((d >> 1) & 0x3FF) << 21 | ((d >> 11) & 1) << 20 | ((d >> 12) & 0xFF) << 12
}

fn branch(o: &mut Output, funct3: u32, rs1: u8, rs2: u8, delta: i32) {
    ins(
        o,
        b_imm(delta) | (rs2 as u32) << 20 | (rs1 as u32) << 15 | funct3 << 12 | BRANCH,
    );
}

/// Forward branch with a to-be-patched target.
fn branch_placeholder(o: &mut Output, funct3: u32, rs1: u8, rs2: u8) -> PatchSite {
    let site = PatchSite { pos: o.pos() };
    ins(
        o,
        (rs2 as u32) << 20 | (rs1 as u32) << 15 | funct3 << 12 | BRANCH,
    );
    site
}

fn jal_placeholder(o: &mut Output, rd: u8) -> PatchSite {
    let site = PatchSite { pos: o.pos() };
    ins(o, (rd as u32) << 7 | JAL);
    site
}

fn mv(o: &mut Output, dst: u8, src: u8) {
    ins(o, i_type(OP_IMM, 0, src, 0, dst));
}

fn li(o: &mut Output, dst: u8, value: u32) {
    let v = value as i32;
    if (-2048..2048).contains(&v) {
        ins(o, i_type(OP_IMM, v, ZERO, 0, dst));
    } else {
        let hi = (value.wrapping_add(0x800)) & 0xFFFF_F000;
        ins(o, hi | (dst as u32) << 7 | LUI);
        let lo = value.wrapping_sub(hi) as i32;
        if lo != 0 {
            ins(o, i_type(OP_IMM, lo, dst, 0, dst));
        }
    }
}

fn lw(o: &mut Output, dst: u8, base: u8, off: i32) {
    ins(o, i_type(LOAD, off, base, 0b010, dst));
}

fn sw(o: &mut Output, src: u8, base: u8, off: i32) {
    ins(o, s_type(off, src, base, 0b010));
}

fn slot_off(slot: u32) -> i32 {
    -8 * (slot as i32 + 1)
}

/// `dst = link_base + off`, handling offsets past the imm12 range.
fn link_addr(o: &mut Output, dst: u8, off: u32) {
    if off < 2048 {
        ins(o, i_type(OP_IMM, off as i32, S3, 0, dst));
    } else {
        li(o, dst, off);
        ins(o, r_type(0, S3, dst, 0, dst));
    }
}

fn load_link_word(o: &mut Output, dst: u8, off: u32) {
    if off < 2048 {
        lw(o, dst, S3, off as i32);
    } else {
        link_addr(o, dst, off);
        lw(o, dst, dst, 0);
    }
}

fn store_link_word(o: &mut Output, src: u8, off: u32, scratch: u8) {
    if off < 2048 {
        sw(o, src, S3, off as i32);
    } else {
        link_addr(o, scratch, off);
        sw(o, src, scratch, 0);
    }
}

/// `auipc`/`jalr` pair calling an absolute in-module offset.
fn call_offset(o: &mut Output, target: u32) {
    let delta = target.wrapping_sub(o.pos()) as i32;
    let hi = (delta as u32).wrapping_add(0x800) & 0xFFFF_F000;
    ins(o, hi | (T5 as u32) << 7 | AUIPC);
    let lo = (delta as u32).wrapping_sub(hi) as i32;
    ins(o, i_type(JALR, lo, T5, 0, RA));
}

/// Call through an aux dispatch slot.
fn call_aux_slot(o: &mut Output, aux_table_off: u32, index: u32) {
    load_link_word(o, T5, aux_table_off + index * 8);
    ins(o, i_type(JALR, 0, T5, 0, RA));
}

fn load_slot_pair(o: &mut Output, lo_reg: u8, hi_reg: u8, slot: u32) {
    lw(o, lo_reg, S0, slot_off(slot));
    lw(o, hi_reg, S0, slot_off(slot) + 4);
}

fn store_slot_pair(o: &mut Output, lo_reg: u8, hi_reg: u8, slot: u32) {
    sw(o, lo_reg, S0, slot_off(slot));
    sw(o, hi_reg, S0, slot_off(slot) + 4);
}

/// 64-bit left shift of (a0,a1) by t6 (masked to 0..63); clobbers t5, a2.
fn shl64_core(o: &mut Output) {
    ins(o, i_type(OP_IMM, 63, T6, 0b111, T6)); // andi t6, t6, 63
    ins(o, i_type(OP_IMM, -32, T6, 0, T5)); // t5 = n - 32
    let big = branch_placeholder(o, 0b101, T5, ZERO); // bge t5, zero, big
    ins(o, r_type(0, T6, A1, 0b001, A1)); // sll a1, a1, t6
    ins(o, r_type(0x20, T5, ZERO, 0, T5)); // t5 = 32 - n
    ins(o, r_type(0, T5, A0, 0b101, A2)); // srl a2, a0, t5
    // n == 0 would shift by 32; mask the merge away in that case.
    let n_zero = branch_placeholder(o, 0b000, T6, ZERO);
    ins(o, r_type(0, A2, A1, 0b110, A1)); // or a1, a1, a2
    Rv32::patch(o, n_zero);
    ins(o, r_type(0, T6, A0, 0b001, A0)); // sll a0, a0, t6
    let done = jal_placeholder(o, ZERO);
    Rv32::patch(o, big);
    ins(o, r_type(0, T5, A0, 0b001, A1)); // a1 = a0 << (n-32)
    mv(o, A0, ZERO);
    Rv32::patch(o, done);
}

/// 64-bit right shift of (a0,a1) by t6; arithmetic when `arith`.
fn shr64_core(o: &mut Output, arith: bool) {
    let f3: u32 = 0b101;
    let f7: u32 = if arith { 0x20 } else { 0 };
    ins(o, i_type(OP_IMM, 63, T6, 0b111, T6));
    ins(o, i_type(OP_IMM, -32, T6, 0, T5));
    let big = branch_placeholder(o, 0b101, T5, ZERO);
    ins(o, r_type(0, T6, A0, f3, A0)); // srl a0, a0, n
    ins(o, r_type(0x20, T5, ZERO, 0, T5)); // t5 = 32 - n
    ins(o, r_type(0, T5, A1, 0b001, A2)); // sll a2, a1, 32-n
    let n_zero = branch_placeholder(o, 0b000, T6, ZERO);
    ins(o, r_type(0, A2, A0, 0b110, A0)); // or a0, a0, a2
    Rv32::patch(o, n_zero);
    ins(o, r_type(f7, T6, A1, f3, A1)); // shift hi by n
    let done = jal_placeholder(o, ZERO);
    Rv32::patch(o, big);
    ins(o, r_type(f7, T5, A1, f3, A0)); // a0 = hi >> (n-32)
    if arith {
        ins(o, i_type(OP_IMM, 31, A1, 0b101, A1) | 0x4000_0000); // srai a1, a1, 31
    } else {
        mv(o, A1, ZERO);
    }
    Rv32::patch(o, done);
}

/// Shape of a softfloat helper: (a is 64-bit, b operand, result is 64-bit).
fn soft_shape(f: SoftfloatFn) -> (bool, Option<bool>, bool) {
    use SoftfloatFn::*;
    match f {
        F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max => (false, Some(false), false),
        F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max => (true, Some(true), true),
        F32Sqrt | F32Ceil | F32Floor | F32Trunc => (false, None, false),
        F64Sqrt | F64Ceil | F64Floor | F64Trunc | F64Nearest => (true, None, true),
        F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge => (false, Some(false), false),
        F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => (true, Some(true), false),
        I32TruncF32S | I32TruncF32U => (false, None, false),
        I32TruncF64S | I32TruncF64U => (true, None, false),
        I64TruncF32S | I64TruncF32U => (false, None, true),
        I64TruncF64S | I64TruncF64U => (true, None, true),
        F32ConvertI32S | F32ConvertI32U => (false, None, false),
        F32ConvertI64S | F32ConvertI64U => (true, None, false),
        F64ConvertI32S | F64ConvertI32U => (false, None, true),
        F64ConvertI64S | F64ConvertI64U => (true, None, true),
        F64PromoteF32 => (false, None, true),
        F32DemoteF64 => (true, None, false),
    }
}

impl Rv32 {
    fn patch(o: &mut Output, site: PatchSite) {
        let delta = o.pos().wrapping_sub(site.pos) as i32;
        let word = o.read_u32_at(site.pos);
        if word & 0x7F == JAL {
            o.patch_insn_or(site.pos, j_imm(delta));
        } else {
            o.patch_insn_or(site.pos, b_imm(delta));
        }
    }

    fn trap_seq(o: &mut Output, code: TrapCode, trap_entry: u32) {
        <Self as Isa>::trap(o, code, trap_entry);
    }

    /// Bounds check `addr + offset + width <= linmem_size`, leaving the
    /// effective offset in t5. Clobbers t6 and a4.
    fn bounds_check(o: &mut Output, addr: Reg, offset: u32, width: u32, trap_entry: u32) {
        if offset == 0 {
            mv(o, T5, addr.id);
        } else {
            li(o, T6, offset);
            ins(o, r_type(0, T6, addr.id, 0, T5));
            // carry out of the 32-bit sum is out of bounds by definition
            ins(o, r_type(0, addr.id, T5, 0b011, T6)); // sltu t6, t5, addr
            let ok = branch_placeholder(o, 0b000, T6, ZERO);
            Self::trap_seq(o, TrapCode::LinmemOutOfBoundsAccess, trap_entry);
            Self::patch(o, ok);
        }
        ins(o, i_type(OP_IMM, width as i32, T5, 0, A4)); // a4 = end
        ins(o, r_type(0, T5, A4, 0b011, T6)); // sltu t6, a4, t5 (carry)
        let no_carry = branch_placeholder(o, 0b000, T6, ZERO);
        Self::trap_seq(o, TrapCode::LinmemOutOfBoundsAccess, trap_entry);
        Self::patch(o, no_carry);
        load_link_word(o, T6, ld::LINMEM_SIZE);
        let in_bounds = branch_placeholder(o, 0b111, T6, A4); // bgeu size, end
        Self::trap_seq(o, TrapCode::LinmemOutOfBoundsAccess, trap_entry);
        Self::patch(o, in_bounds);
        // t5 = absolute address
        ins(o, r_type(0, S2, T5, 0, T5));
    }

    /// 64-bit integer compare on (a0,a1)/(a2,a3) into a0.
    fn cmp64(o: &mut Output, cmp: IntCmp) {
        match cmp {
            IntCmp::Eq | IntCmp::Ne => {
                ins(o, r_type(0, A2, A0, 0b100, A0)); // xor lo
                ins(o, r_type(0, A3, A1, 0b100, A1)); // xor hi
                ins(o, r_type(0, A1, A0, 0b110, A0)); // or
                if cmp == IntCmp::Eq {
                    ins(o, i_type(OP_IMM, 1, A0, 0b011, A0)); // sltiu a0, a0, 1
                } else {
                    ins(o, r_type(0, A0, ZERO, 0b011, A0)); // sltu a0, zero, a0
                }
            }
            _ => {
                let (swap, negate, signed) = match cmp {
                    IntCmp::LtS => (false, false, true),
                    IntCmp::LtU => (false, false, false),
                    IntCmp::GtS => (true, false, true),
                    IntCmp::GtU => (true, false, false),
                    IntCmp::LeS => (true, true, true),
                    IntCmp::LeU => (true, true, false),
                    IntCmp::GeS => (false, true, true),
                    IntCmp::GeU => (false, true, false),
                    _ => unreachable!(),
                };
                let (xl, xh, yl, yh) = if swap {
                    (A2, A3, A0, A1)
                } else {
                    (A0, A1, A2, A3)
                };
                // t5 = hi-compare result; lo compare when hi parts equal
                let f3: u32 = if signed { 0b010 } else { 0b011 };
                ins(o, r_type(0, yh, xh, f3, T5)); // slt(u) t5, xh, yh
                let hi_differ = branch_placeholder(o, 0b001, xh, yh); // bne
                ins(o, r_type(0, yl, xl, 0b011, T5)); // sltu t5, xl, yl
                Self::patch(o, hi_differ);
                if negate {
                    ins(o, i_type(OP_IMM, 1, T5, 0b100, T5)); // xori
                }
                mv(o, A0, T5);
            }
        }
    }
}

impl Isa for Rv32 {
    const NAME: &'static str = "rv32";

    const HAS_HARD_FLOAT: bool = false;
    const ACTIVE_BOUNDS_CHECK: bool = true;
    const ACTIVE_DIV_CHECK: bool = true;
    const ACTIVE_STACK_CHECK: bool = true;
    const SLOT_ONLY_64BIT: bool = true;
    const CROSS_CLASS_SPILL: bool = false;
    const CODE_ALIGN: u32 = 4;
    const MAX_FRAME_BYTES: u32 = 2032;

    const LINMEM_BASE: Reg = Reg::gpr(S2);
    const LINK_BASE: Reg = Reg::gpr(S3);
    const LAST_FRAME: Reg = Reg::gpr(20);
    const STACK_FENCE: Reg = Reg::gpr(21);

    const ALLOC_GPRS: &'static [Reg] = &[
        Reg::gpr(5),  // t0
        Reg::gpr(6),  // t1
        Reg::gpr(7),  // t2
        Reg::gpr(28), // t3
        Reg::gpr(29), // t4
        Reg::gpr(22), // s6
        Reg::gpr(23), // s7
        Reg::gpr(24), // s8
        Reg::gpr(25), // s9
    ];
    const ALLOC_FPRS: &'static [Reg] = &[];
    const ARG_GPRS: &'static [Reg] = &[
        Reg::gpr(A0),
        Reg::gpr(A1),
        Reg::gpr(A2),
        Reg::gpr(A3),
        Reg::gpr(A4),
        Reg::gpr(A5),
        Reg::gpr(16),
        Reg::gpr(17),
    ];
    const ARG_FPRS: &'static [Reg] = &[];
    const RET_GPR: Reg = Reg::gpr(A0);
    const RET_GPR2: Reg = Reg::gpr(A1);
    const RET_FPR: Reg = Reg::gpr(A0);
    const SCRATCH: Reg = Reg::gpr(T5);
    const SCRATCH2: Reg = Reg::gpr(T6);
    const SCRATCH_FPR: Reg = Reg::gpr(T6);
    const SHIFT_AMOUNT_REG: Option<Reg> = None;
    const CALL_TEMP: Reg = Reg::gpr(22); // s6
    const DIV_CLOBBERS: &'static [Reg] = &[];

    fn prologue(o: &mut Output, trap_entry: u32) -> PatchSite {
        ins(o, i_type(OP_IMM, -16, SP, 0, SP));
        sw(o, RA, SP, 12);
        sw(o, S0, SP, 8);
        ins(o, i_type(OP_IMM, 16, SP, 0, S0)); // s0 = entry sp
        let site = PatchSite { pos: o.pos() };
        ins(o, i_type(OP_IMM, 0, SP, 0, SP)); // addi sp, sp, -frame (patched)
        // Active stack-fence check against the pinned fence register.
        let ok = branch_placeholder(o, 0b111, SP, 21); // bgeu sp, s5
        Self::trap_seq(o, TrapCode::StackFenceBreached, trap_entry);
        Self::patch(o, ok);
        site
    }

    fn patch_frame_size(o: &mut Output, site: PatchSite, frame_bytes: u32) {
        debug_assert!(frame_bytes <= 2032);
        let imm = -(frame_bytes as i32);
        o.patch_insn_or(site.pos, (imm as u32 & 0xFFF) << 20);
    }

    fn epilogue(o: &mut Output) {
        ins(o, i_type(OP_IMM, -16, S0, 0, SP)); // sp = s0 - 16
        lw(o, RA, SP, 12);
        lw(o, S0, SP, 8);
        ins(o, i_type(OP_IMM, 16, SP, 0, SP));
        ins(o, i_type(JALR, 0, RA, 0, ZERO)); // ret
    }

    fn store_zero_slot(o: &mut Output, slot: u32) {
        store_slot_pair(o, ZERO, ZERO, slot);
    }

    fn mov_imm(o: &mut Output, dst: Reg, bits: u64, wide: bool) {
        debug_assert!(!wide, "64-bit immediates go to slots on rv32");
        li(o, dst.id, bits as u32);
    }

    fn fmov_imm(o: &mut Output, dst: Reg, bits: u64, is64: bool) {
        debug_assert!(!is64);
        li(o, dst.id, bits as u32);
    }

    fn mov_rr(o: &mut Output, dst: Reg, src: Reg, _ty: ValType) {
        mv(o, dst.id, src.id);
    }

    fn load_slot(o: &mut Output, dst: Reg, slot: u32, _ty: ValType) {
        lw(o, dst.id, S0, slot_off(slot));
    }

    fn store_slot(o: &mut Output, src: Reg, slot: u32, ty: ValType) {
        sw(o, src.id, S0, slot_off(slot));
        if !ty.is_64bit() {
            // Keep the high word clean for whole-cell copies.
            sw(o, ZERO, S0, slot_off(slot) + 4);
        }
    }

    fn copy_slot(o: &mut Output, dst_slot: u32, src_slot: u32, _ty: ValType) {
        load_slot_pair(o, T5, T6, src_slot);
        store_slot_pair(o, T5, T6, dst_slot);
    }

    fn store_slot_imm64(o: &mut Output, slot: u32, bits: u64) {
        li(o, T5, bits as u32);
        li(o, T6, (bits >> 32) as u32);
        store_slot_pair(o, T5, T6, slot);
    }

    fn store_slot_pair(o: &mut Output, lo: Reg, hi: Reg, slot: u32) {
        store_slot_pair(o, lo.id, hi.id, slot);
    }

    fn load_slot_pair(o: &mut Output, lo: Reg, hi: Reg, slot: u32) {
        load_slot_pair(o, lo.id, hi.id, slot);
    }

    fn int_op(o: &mut Output, op: IntOp, dst: Reg, rhs: Reg, wide: bool) {
        debug_assert!(!wide);
        let (f7, f3): (u32, u32) = match op {
            IntOp::Add => (0, 0b000),
            IntOp::Sub => (0x20, 0b000),
            IntOp::Mul => (1, 0b000),
            IntOp::And => (0, 0b111),
            IntOp::Or => (0, 0b110),
            IntOp::Xor => (0, 0b100),
        };
        ins(o, r_type(f7, rhs.id, dst.id, f3, dst.id));
    }

    fn int_shift(o: &mut Output, op: ShiftOp, dst: Reg, amount: Reg, wide: bool) {
        debug_assert!(!wide);
        match op {
            ShiftOp::Shl => ins(o, r_type(0, amount.id, dst.id, 0b001, dst.id)),
            ShiftOp::ShrU => ins(o, r_type(0, amount.id, dst.id, 0b101, dst.id)),
            ShiftOp::ShrS => ins(o, r_type(0x20, amount.id, dst.id, 0b101, dst.id)),
            ShiftOp::Rotl | ShiftOp::Rotr => {
                // rot = (x shifted n) | (x shifted other way 32-n)
                let (first, second): (u32, u32) = if matches!(op, ShiftOp::Rotl) {
                    (0b001, 0b101)
                } else {
                    (0b101, 0b001)
                };
                ins(o, i_type(OP_IMM, 31, amount.id, 0b111, T6)); // andi t6, amt, 31
                ins(o, r_type(0, T6, dst.id, first, T5)); // t5 = x shl/shr n
                ins(o, r_type(0x20, T6, ZERO, 0, T6)); // t6 = -n
                ins(o, i_type(OP_IMM, 31, T6, 0b111, T6)); // t6 = (32-n) & 31
                ins(o, r_type(0, T6, dst.id, second, dst.id));
                // n == 0: the second shift contributed x itself, which the
                // or makes harmless.
                ins(o, r_type(0, T5, dst.id, 0b110, dst.id)); // or dst, dst, t5
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
        debug_assert!(!wide);
        let nonzero = branch_placeholder(o, 0b001, rhs.id, ZERO); // bne rhs, zero
        Self::trap_seq(o, TrapCode::DivZero, trap_entry);
        Self::patch(o, nonzero);
        if signed && !rem {
            // MIN / -1 wraps silently; wasm traps.
            ins(o, i_type(OP_IMM, 1, rhs.id, 0, T5)); // t5 = rhs + 1
            let not_m1 = branch_placeholder(o, 0b001, T5, ZERO);
            li(o, T5, 0x8000_0000);
            let not_min = branch_placeholder(o, 0b001, lhs.id, T5);
            Self::trap_seq(o, TrapCode::DivOverflow, trap_entry);
            Self::patch(o, not_min);
            Self::patch(o, not_m1);
        }
        let f3: u32 = match (signed, rem) {
            (true, false) => 0b100,
            (false, false) => 0b101,
            (true, true) => 0b110,
            (false, true) => 0b111,
        };
        ins(o, r_type(1, rhs.id, lhs.id, f3, dst.id));
    }

    fn int_unop(o: &mut Output, op: IntUnOp, dst: Reg, src: Reg, wide: bool) {
        debug_assert!(!wide);
        // No bit-scan hardware: these go through the aux helpers. The
        // caller spilled live state, so the argument registers are free.
        let idx = match op {
            IntUnOp::Clz => IntAuxFn::Clz32,
            IntUnOp::Ctz => IntAuxFn::Ctz32,
            IntUnOp::Popcnt => IntAuxFn::Popcnt32,
        };
        mv(o, A0, src.id);
        call_aux_slot(o, AUX_TABLE, idx.index());
        mv(o, dst.id, A0);
    }

    fn int_cmp(o: &mut Output, cmp: IntCmp, dst: Reg, lhs: Reg, rhs: Reg, wide: bool) {
        debug_assert!(!wide);
        match cmp {
            IntCmp::Eq => {
                ins(o, r_type(0, rhs.id, lhs.id, 0b100, dst.id)); // xor
                ins(o, i_type(OP_IMM, 1, dst.id, 0b011, dst.id)); // sltiu
            }
            IntCmp::Ne => {
                ins(o, r_type(0, rhs.id, lhs.id, 0b100, dst.id));
                ins(o, r_type(0, dst.id, ZERO, 0b011, dst.id)); // sltu zero
            }
            IntCmp::LtS => ins(o, r_type(0, rhs.id, lhs.id, 0b010, dst.id)),
            IntCmp::LtU => ins(o, r_type(0, rhs.id, lhs.id, 0b011, dst.id)),
            IntCmp::GtS => ins(o, r_type(0, lhs.id, rhs.id, 0b010, dst.id)),
            IntCmp::GtU => ins(o, r_type(0, lhs.id, rhs.id, 0b011, dst.id)),
            IntCmp::LeS => {
                ins(o, r_type(0, lhs.id, rhs.id, 0b010, dst.id)); // rhs < lhs
                ins(o, i_type(OP_IMM, 1, dst.id, 0b100, dst.id)); // xori 1
            }
            IntCmp::LeU => {
                ins(o, r_type(0, lhs.id, rhs.id, 0b011, dst.id));
                ins(o, i_type(OP_IMM, 1, dst.id, 0b100, dst.id));
            }
            IntCmp::GeS => {
                ins(o, r_type(0, rhs.id, lhs.id, 0b010, dst.id));
                ins(o, i_type(OP_IMM, 1, dst.id, 0b100, dst.id));
            }
            IntCmp::GeU => {
                ins(o, r_type(0, rhs.id, lhs.id, 0b011, dst.id));
                ins(o, i_type(OP_IMM, 1, dst.id, 0b100, dst.id));
            }
        }
    }

    fn int_eqz(o: &mut Output, dst: Reg, src: Reg, wide: bool) {
        debug_assert!(!wide);
        ins(o, i_type(OP_IMM, 1, src.id, 0b011, dst.id)); // sltiu dst, src, 1
    }

    fn extend32(o: &mut Output, _dst: Reg, _src: Reg, _signed: bool) {
        let _ = o;
        unreachable!("64-bit extends are slot operations on rv32");
    }

    fn wrap64(o: &mut Output, _dst: Reg, _src: Reg) {
        let _ = o;
        unreachable!("i32.wrap_i64 reads the slot's low word on rv32");
    }

    fn float_op(_o: &mut Output, _op: FloatOp, _dst: Reg, _rhs: Reg, _is64: bool) {
        unreachable!("softfloat target");
    }

    fn float_unop(_o: &mut Output, _op: FloatUn, _dst: Reg, _is64: bool) {
        unreachable!("softfloat target");
    }

    fn float_cmp(_o: &mut Output, _cmp: FloatCmp, _dst: Reg, _lhs: Reg, _rhs: Reg, _is64: bool) {
        unreachable!("softfloat target");
    }

    fn float_from_int(
        _o: &mut Output,
        _dst: Reg,
        _src: Reg,
        _to64: bool,
        _from64: bool,
        _signed: bool,
    ) {
        unreachable!("softfloat target");
    }

    fn int_from_float(
        _o: &mut Output,
        _dst: Reg,
        _src: Reg,
        _to64: bool,
        _from64: bool,
        _signed: bool,
        _trap_entry: u32,
    ) {
        unreachable!("softfloat target");
    }

    fn float_promote(_o: &mut Output, _dst: Reg, _src: Reg) {
        unreachable!("softfloat target");
    }

    fn float_demote(_o: &mut Output, _dst: Reg, _src: Reg) {
        unreachable!("softfloat target");
    }

    fn aux_op(
        o: &mut Output,
        op: AuxOp,
        dst_slot: u32,
        a_slot: u32,
        b_slot: Option<u32>,
        trap_entry: u32,
    ) {
        let aux = AUX_TABLE;
        match op {
            AuxOp::I64Add | AuxOp::I64Sub => {
                load_slot_pair(o, A0, A1, a_slot);
                load_slot_pair(o, A2, A3, b_slot.unwrap());
                if matches!(op, AuxOp::I64Add) {
                    ins(o, r_type(0, A2, A0, 0, A0));
                    ins(o, r_type(0, A2, A0, 0b011, T5)); // carry = lo < b.lo
                    ins(o, r_type(0, A3, A1, 0, A1));
                    ins(o, r_type(0, T5, A1, 0, A1));
                } else {
                    ins(o, r_type(0, A2, A0, 0b011, T5)); // borrow = a.lo < b.lo
                    ins(o, r_type(0x20, A2, A0, 0, A0));
                    ins(o, r_type(0x20, A3, A1, 0, A1));
                    ins(o, r_type(0x20, T5, A1, 0, A1));
                }
                store_slot_pair(o, A0, A1, dst_slot);
            }
            AuxOp::I64Mul => {
                load_slot_pair(o, A0, A1, a_slot);
                load_slot_pair(o, A2, A3, b_slot.unwrap());
                // hi = mulhu(lo,lo') + lo*hi' + hi*lo'
                ins(o, r_type(1, A2, A0, 0b011, T5)); // mulhu t5, a0, a2
                ins(o, r_type(1, A3, A0, 0b000, A3)); // a3 = a0*b.hi
                ins(o, r_type(1, A2, A1, 0b000, A1)); // a1 = a.hi*b.lo
                ins(o, r_type(0, A3, T5, 0, T5));
                ins(o, r_type(0, A1, T5, 0, A1));
                ins(o, r_type(1, A2, A0, 0b000, A0)); // lo = mul
                store_slot_pair(o, A0, A1, dst_slot);
            }
            AuxOp::I64Div { signed, rem } => {
                load_slot_pair(o, A2, A3, b_slot.unwrap());
                // zero check on the full 64-bit divisor
                ins(o, r_type(0, A3, A2, 0b110, T5)); // or t5, a2, a3
                let nonzero = branch_placeholder(o, 0b001, T5, ZERO);
                Self::trap_seq(o, TrapCode::DivZero, trap_entry);
                Self::patch(o, nonzero);
                load_slot_pair(o, A0, A1, a_slot);
                if signed && !rem {
                    // MIN / -1 overflow check
                    ins(o, r_type(0, A3, A2, 0b111, T5)); // and t5, a2, a3
                    ins(o, i_type(OP_IMM, 1, T5, 0, T5)); // t5 = and + 1
                    let not_m1 = branch_placeholder(o, 0b001, T5, ZERO);
                    let lo_ok = branch_placeholder(o, 0b001, A0, ZERO);
                    li(o, T5, 0x8000_0000);
                    let hi_ok = branch_placeholder(o, 0b001, A1, T5);
                    Self::trap_seq(o, TrapCode::DivOverflow, trap_entry);
                    Self::patch(o, hi_ok);
                    Self::patch(o, lo_ok);
                    Self::patch(o, not_m1);
                }
                let idx = match (signed, rem) {
                    (true, false) => IntAuxFn::Div64S,
                    (false, false) => IntAuxFn::Div64U,
                    (true, true) => IntAuxFn::Rem64S,
                    (false, true) => IntAuxFn::Rem64U,
                };
                call_aux_slot(o, aux, idx.index());
                store_slot_pair(o, A0, A1, dst_slot);
            }
            AuxOp::I64And | AuxOp::I64Or | AuxOp::I64Xor => {
                let f3: u32 = match op {
                    AuxOp::I64And => 0b111,
                    AuxOp::I64Or => 0b110,
                    _ => 0b100,
                };
                load_slot_pair(o, A0, A1, a_slot);
                load_slot_pair(o, A2, A3, b_slot.unwrap());
                ins(o, r_type(0, A2, A0, f3, A0));
                ins(o, r_type(0, A3, A1, f3, A1));
                store_slot_pair(o, A0, A1, dst_slot);
            }
            AuxOp::I64Shl | AuxOp::I64ShrS | AuxOp::I64ShrU => {
                load_slot_pair(o, A0, A1, a_slot);
                lw(o, T6, S0, slot_off(b_slot.unwrap())); // amount low word
                match op {
                    AuxOp::I64Shl => shl64_core(o),
                    AuxOp::I64ShrU => shr64_core(o, false),
                    _ => shr64_core(o, true),
                }
                store_slot_pair(o, A0, A1, dst_slot);
            }
            AuxOp::I64Rotl | AuxOp::I64Rotr => {
                load_slot_pair(o, A0, A1, a_slot);
                lw(o, T6, S0, slot_off(b_slot.unwrap()));
                // keep the original value and amount
                mv(o, A4, A0);
                mv(o, A5, A1);
                ins(o, i_type(OP_IMM, 63, T6, 0b111, A3)); // a3 = n & 63
                mv(o, T6, A3);
                if matches!(op, AuxOp::I64Rotl) {
                    shl64_core(o);
                } else {
                    shr64_core(o, false);
                }
                // stash the first half, reload operand, shift 64-n
                sw(o, A0, S0, slot_off(dst_slot));
                sw(o, A1, S0, slot_off(dst_slot) + 4);
                mv(o, A0, A4);
                mv(o, A1, A5);
                li(o, T6, 64);
                ins(o, r_type(0x20, A3, T6, 0, T6)); // t6 = 64 - n
                ins(o, i_type(OP_IMM, 63, T6, 0b111, T6));
                if matches!(op, AuxOp::I64Rotl) {
                    shr64_core(o, false);
                } else {
                    shl64_core(o);
                }
                // Shifting by (64-0)&63 == 0 duplicates the value; the or
                // below keeps the result correct regardless.
                lw(o, T5, S0, slot_off(dst_slot));
                ins(o, r_type(0, T5, A0, 0b110, A0));
                lw(o, T5, S0, slot_off(dst_slot) + 4);
                ins(o, r_type(0, T5, A1, 0b110, A1));
                store_slot_pair(o, A0, A1, dst_slot);
            }
            AuxOp::I64Clz | AuxOp::I64Ctz => {
                load_slot_pair(o, A0, A1, a_slot);
                let (first, second, fn_idx) = if matches!(op, AuxOp::I64Clz) {
                    (A1, A0, IntAuxFn::Clz32)
                } else {
                    (A0, A1, IntAuxFn::Ctz32)
                };
                let first_nonzero = branch_placeholder(o, 0b001, first, ZERO);
                mv(o, A0, second);
                call_aux_slot(o, aux, fn_idx.index());
                ins(o, i_type(OP_IMM, 32, A0, 0, A0));
                let done = jal_placeholder(o, ZERO);
                Self::patch(o, first_nonzero);
                mv(o, A0, first);
                call_aux_slot(o, aux, fn_idx.index());
                Self::patch(o, done);
                mv(o, A1, ZERO);
                store_slot_pair(o, A0, A1, dst_slot);
            }
            AuxOp::I64Popcnt => {
                lw(o, A0, S0, slot_off(a_slot) + 4);
                call_aux_slot(o, aux, IntAuxFn::Popcnt32.index());
                mv(o, A5, A0);
                lw(o, A0, S0, slot_off(a_slot));
                call_aux_slot(o, aux, IntAuxFn::Popcnt32.index());
                ins(o, r_type(0, A5, A0, 0, A0));
                mv(o, A1, ZERO);
                store_slot_pair(o, A0, A1, dst_slot);
            }
            AuxOp::I64Eqz => {
                load_slot_pair(o, A0, A1, a_slot);
                ins(o, r_type(0, A1, A0, 0b110, A0));
                ins(o, i_type(OP_IMM, 1, A0, 0b011, A0));
                sw(o, A0, S0, slot_off(dst_slot));
                sw(o, ZERO, S0, slot_off(dst_slot) + 4);
            }
            AuxOp::I64Cmp(cmp) => {
                load_slot_pair(o, A0, A1, a_slot);
                load_slot_pair(o, A2, A3, b_slot.unwrap());
                Self::cmp64(o, cmp);
                sw(o, A0, S0, slot_off(dst_slot));
                sw(o, ZERO, S0, slot_off(dst_slot) + 4);
            }
            AuxOp::I64ExtendI32S => {
                lw(o, A0, S0, slot_off(a_slot));
                ins(o, i_type(OP_IMM, 31, A0, 0b101, A1) | 0x4000_0000); // srai
                store_slot_pair(o, A0, A1, dst_slot);
            }
            AuxOp::I64ExtendI32U => {
                lw(o, A0, S0, slot_off(a_slot));
                store_slot_pair(o, A0, ZERO, dst_slot);
            }
            AuxOp::Soft(f) => {
                let (a64, b, ret64) = soft_shape(f);
                if a64 {
                    load_slot_pair(o, A0, A1, a_slot);
                } else {
                    lw(o, A0, S0, slot_off(a_slot));
                }
                if let Some(b64) = b {
                    let b_slot = b_slot.unwrap();
                    if b64 {
                        load_slot_pair(o, A2, A3, b_slot);
                    } else {
                        lw(o, A1, S0, slot_off(b_slot));
                    }
                }
                call_aux_slot(o, aux, f.index());
                if ret64 {
                    store_slot_pair(o, A0, A1, dst_slot);
                } else {
                    sw(o, A0, S0, slot_off(dst_slot));
                    sw(o, ZERO, S0, slot_off(dst_slot) + 4);
                }
            }
        }
    }

    fn load_linmem(
        o: &mut Output,
        dst: Reg,
        addr: Reg,
        offset: u32,
        acc: MemAccess,
        trap_entry: u32,
    ) {
        Self::bounds_check(o, addr, offset, acc.width(), trap_entry);
        let f3: u32 = match acc {
            MemAccess::I32Load8S => 0b000,
            MemAccess::I32Load8U => 0b100,
            MemAccess::I32Load16S => 0b001,
            MemAccess::I32Load16U => 0b101,
            MemAccess::I32 | MemAccess::F32 => 0b010,
            _ => unreachable!("64-bit loads use linmem64_slot"),
        };
        ins(o, i_type(LOAD, 0, T5, f3, dst.id));
    }

    fn store_linmem(
        o: &mut Output,
        src: Reg,
        addr: Reg,
        offset: u32,
        acc: MemAccess,
        trap_entry: u32,
    ) {
        Self::bounds_check(o, addr, offset, acc.width(), trap_entry);
        let f3: u32 = match acc.width() {
            1 => 0b000,
            2 => 0b001,
            _ => 0b010,
        };
        ins(o, s_type(0, src.id, T5, f3));
    }

    fn linmem64_slot(
        o: &mut Output,
        store: bool,
        addr: Reg,
        offset: u32,
        slot: u32,
        trap_entry: u32,
    ) {
        Self::bounds_check(o, addr, offset, 8, trap_entry);
        if store {
            load_slot_pair(o, T6, A4, slot);
            ins(o, s_type(0, T6, T5, 0b010));
            ins(o, s_type(4, A4, T5, 0b010));
        } else {
            lw(o, T6, T5, 0);
            lw(o, A4, T5, 4);
            store_slot_pair(o, T6, A4, slot);
        }
    }

    fn memory_size(o: &mut Output, dst: Reg) {
        load_link_word(o, dst.id, ld::LINMEM_SIZE);
        ins(o, i_type(OP_IMM, 16, dst.id, 0b101, dst.id)); // srli 16
    }

    fn memory_grow(o: &mut Output, dst: Reg, delta: Reg) {
        load_link_word(o, A0, ld::RUNTIME_CTX);
        mv(o, A1, delta.id);
        load_link_word(o, T5, ld::MEMORY_GROW_FN);
        ins(o, i_type(JALR, 0, T5, 0, RA));
        mv(o, dst.id, A0);
    }

    fn load_link(o: &mut Output, dst: Reg, link_off: u32, _ty: ValType) {
        load_link_word(o, dst.id, link_off);
    }

    fn store_link(o: &mut Output, src: Reg, link_off: u32, _ty: ValType) {
        store_link_word(o, src.id, link_off, T5);
    }

    fn link64_slot(o: &mut Output, store: bool, link_off: u32, slot: u32) {
        link_addr(o, T5, link_off);
        if store {
            load_slot_pair(o, T6, A4, slot);
            sw(o, T6, T5, 0);
            sw(o, A4, T5, 4);
        } else {
            lw(o, T6, T5, 0);
            lw(o, A4, T5, 4);
            store_slot_pair(o, T6, A4, slot);
        }
    }

    fn jump(o: &mut Output) -> PatchSite {
        jal_placeholder(o, ZERO)
    }

    fn jump_back(o: &mut Output, target: u32) {
        let delta = target.wrapping_sub(o.pos()) as i32;
        ins(o, j_imm(delta) | JAL);
    }

    fn br_if_zero(o: &mut Output, cond: Reg) -> PatchSite {
        // bne cond, zero, +8 ; jal placeholder
        branch(o, 0b001, cond.id, ZERO, 8);
        jal_placeholder(o, ZERO)
    }

    fn br_if_nonzero(o: &mut Output, cond: Reg) -> PatchSite {
        branch(o, 0b000, cond.id, ZERO, 8);
        jal_placeholder(o, ZERO)
    }

    fn patch_jump(o: &mut Output, site: PatchSite) {
        Self::patch(o, site);
    }

    fn br_if_eq_imm(o: &mut Output, index: Reg, case: u32) -> PatchSite {
        li(o, T5, case);
        branch(o, 0b001, index.id, T5, 8); // bne -> skip
        jal_placeholder(o, ZERO)
    }

    fn call_rel(o: &mut Output) -> PatchSite {
        let site = PatchSite { pos: o.pos() };
        ins(o, (T5 as u32) << 7 | AUIPC);
        ins(o, i_type(JALR, 0, T5, 0, RA));
        site
    }

    fn patch_call(o: &mut Output, site: PatchSite, target: u32) {
        let delta = target.wrapping_sub(site.pos);
        let hi = delta.wrapping_add(0x800) & 0xFFFF_F000;
        o.patch_insn_or(site.pos, hi);
        let lo = delta.wrapping_sub(hi);
        o.patch_insn_or(site.pos + 4, (lo & 0xFFF) << 20);
    }

    fn call_link_slot(o: &mut Output, link_off: u32) {
        load_link_word(o, T5, link_off);
        ins(o, i_type(JALR, 0, T5, 0, RA));
    }

    fn call_absolute(o: &mut Output, addr: u64) {
        li(o, T5, addr as u32);
        ins(o, i_type(JALR, 0, T5, 0, RA));
    }

    fn adjust_sp(o: &mut Output, bytes: i32) {
        debug_assert!((-2048..2048).contains(&bytes));
        ins(o, i_type(OP_IMM, bytes, SP, 0, SP));
    }

    fn store_sp(o: &mut Output, src: Reg, sp_off: u32, _ty: ValType) {
        sw(o, src.id, SP, sp_off as i32);
    }

    fn load_sp(o: &mut Output, dst: Reg, sp_off: u32, _ty: ValType) {
        lw(o, dst.id, SP, sp_off as i32);
    }

    fn sp_addr(o: &mut Output, dst: Reg, sp_off: u32) {
        ins(o, i_type(OP_IMM, sp_off as i32, SP, 0, dst.id));
    }

    fn sp_slot_copy(o: &mut Output, to_sp: bool, sp_off: u32, slot: u32) {
        if to_sp {
            load_slot_pair(o, T5, T6, slot);
            sw(o, T5, SP, sp_off as i32);
            sw(o, T6, SP, sp_off as i32 + 4);
        } else {
            lw(o, T5, SP, sp_off as i32);
            lw(o, T6, SP, sp_off as i32 + 4);
            store_slot_pair(o, T5, T6, slot);
        }
    }

    fn call_indirect(
        o: &mut Output,
        index: Reg,
        expected_sig: u32,
        table_off: u32,
        trap_entry: u32,
    ) {
        link_addr(o, T5, table_off);
        lw(o, T6, T5, 0); // count
        let in_bounds = branch_placeholder(o, 0b110, index.id, T6); // bltu
        Self::trap_seq(o, TrapCode::IndirectCallOutOfBounds, trap_entry);
        Self::patch(o, in_bounds);
        // t5 = &entries[index]
        ins(o, i_type(OP_IMM, 4, index.id, 0b001, T6)); // slli t6, index, 4
        ins(o, r_type(0, T6, T5, 0, T5));
        lw(o, T6, T5, 8); // sig
        li(o, A4, expected_sig);
        let sig_ok = branch_placeholder(o, 0b000, T6, A4);
        Self::trap_seq(o, TrapCode::IndirectCallWrongSig, trap_entry);
        Self::patch(o, sig_ok);
        lw(o, T5, T5, 16); // code address (low word of the u64 cell)
        ins(o, i_type(JALR, 0, T5, 0, RA));
    }

    fn trap(o: &mut Output, code: TrapCode, trap_entry: u32) {
        mv(o, A0, S2);
        li(o, A1, code.as_u32());
        call_offset(o, trap_entry);
    }

    fn interruption_poll(o: &mut Output, trap_entry: u32) {
        load_link_word(o, T6, ld::INTERRUPT_FLAG);
        let skip = branch_placeholder(o, 0b000, T6, ZERO); // beq
        mv(o, A0, S2);
        mv(o, A1, T6);
        call_offset(o, trap_entry);
        Self::patch(o, skip);
    }

    fn stacktrace_push(o: &mut Output, func_index: u32, cap: u32) {
        load_link_word(o, T5, ld::RING_IDX);
        // store func_index at link[ring + idx*4]
        ins(o, i_type(OP_IMM, 2, T5, 0b001, T6)); // slli t6, t5, 2
        ins(o, r_type(0, S3, T6, 0, T6));
        li(o, A4, func_index);
        if RING_SLOTS < 2048 {
            sw(o, A4, T6, RING_SLOTS as i32);
        } else {
            li(o, A5, RING_SLOTS);
            ins(o, r_type(0, A5, T6, 0, T6));
            sw(o, A4, T6, 0);
        }
        ins(o, i_type(OP_IMM, 1, T5, 0, T5));
        li(o, T6, cap);
        let no_wrap = branch_placeholder(o, 0b001, T5, T6);
        mv(o, T5, ZERO);
        Self::patch(o, no_wrap);
        store_link_word(o, T5, ld::RING_IDX, T6);
        load_link_word(o, T5, ld::RING_COUNT);
        ins(o, i_type(OP_IMM, 1, T5, 0, T5));
        store_link_word(o, T5, ld::RING_COUNT, T6);
    }

    fn stacktrace_pop(o: &mut Output, cap: u32) {
        load_link_word(o, T5, ld::RING_IDX);
        let nonzero = branch_placeholder(o, 0b001, T5, ZERO);
        li(o, T5, cap);
        Self::patch(o, nonzero);
        ins(o, i_type(OP_IMM, -1, T5, 0, T5));
        store_link_word(o, T5, ld::RING_IDX, T6);
        load_link_word(o, T5, ld::RING_COUNT);
        ins(o, i_type(OP_IMM, -1, T5, 0, T5));
        store_link_word(o, T5, ld::RING_COUNT, T6);
    }

    fn emit_trap_entry(o: &mut Output) {
        // a0 = linmem base (unused), a1 = code
        sw(o, A1, S3, ld::TRAP_CODE as i32);
        lw(o, SP, S3, ld::LAST_FRAME as i32);
        lw(o, T5, S3, ld::RECOVERY_PC as i32);
        ins(o, i_type(JALR, 0, T5, 0, ZERO));
    }

    fn emit_landing_pad(_o: &mut Output, _trap_entry: u32) -> Option<u32> {
        // Active bounds checks: no faults to land from.
        None
    }

    fn emit_export_wrapper(o: &mut Output, sig: &FuncSignature, body_offset: u32) {
        // extern "C" fn(link_data: a0, args: a1, results: a2)
        ins(o, i_type(OP_IMM, -64, SP, 0, SP));
        sw(o, RA, SP, 60);
        sw(o, S0, SP, 56);
        sw(o, S2, SP, 52);
        sw(o, S3, SP, 48);
        sw(o, 20, SP, 44);
        sw(o, 21, SP, 40);
        sw(o, 22, SP, 36);
        sw(o, 23, SP, 32);
        sw(o, 24, SP, 28);
        sw(o, 25, SP, 24);
        mv(o, S3, A0);
        lw(o, S2, S3, ld::LINMEM_BASE as i32);
        lw(o, 21, S3, ld::STACK_FENCE as i32);
        lw(o, T5, S3, ld::LAST_FRAME as i32);
        sw(o, T5, SP, 20);
        lw(o, T5, S3, ld::RECOVERY_PC as i32);
        sw(o, T5, SP, 16);
        sw(o, A2, SP, 12); // results pointer
        // recovery address
        let recovery_auipc = PatchSite { pos: o.pos() };
        ins(o, (T5 as u32) << 7 | AUIPC);
        ins(o, i_type(OP_IMM, 0, T5, 0, T5)); // addi t5, t5, lo (patched)
        sw(o, T5, S3, ld::RECOVERY_PC as i32);
        sw(o, SP, S3, ld::LAST_FRAME as i32);

        // Marshal arguments: every value occupies an 8-byte arg slot;
        // 64-bit values take an argument register pair. a1 is the slot
        // pointer itself and is filled last.
        let mut next = 0usize;
        let mut a1_load: Option<(usize, u8, bool)> = None;
        for (i, ty) in sig.params.iter().enumerate() {
            let wide = ty.is_64bit();
            let regs_needed = if wide { 2 } else { 1 };
            let base = Self::ARG_GPRS[next].id;
            next += regs_needed;
            if base == A1 || (wide && base + 1 == A1) {
                a1_load = Some((i, base, wide));
                continue;
            }
            lw(o, base, A1, (8 * i) as i32);
            if wide {
                lw(o, base + 1, A1, (8 * i) as i32 + 4);
            }
        }
        if let Some((i, base, wide)) = a1_load {
            if wide && base == A0 {
                // pair (a0, a1): the pointer dies with the last load
                lw(o, A0, A1, (8 * i) as i32);
                lw(o, A1, A1, (8 * i) as i32 + 4);
            } else if wide {
                // pair (a1, a2)
                debug_assert_eq!(base, A1);
                lw(o, A2, A1, (8 * i) as i32 + 4);
                lw(o, A1, A1, (8 * i) as i32);
            } else {
                lw(o, A1, A1, (8 * i) as i32);
            }
        }

        call_offset(o, body_offset);

        if let Some(ty) = sig.results.first() {
            lw(o, T5, SP, 12);
            sw(o, A0, T5, 0);
            if ty.is_64bit() {
                sw(o, A1, T5, 4);
            } else {
                sw(o, ZERO, T5, 4);
            }
        }

        // recovery:
        let recovery = o.pos();
        let delta = recovery.wrapping_sub(recovery_auipc.pos);
        let hi = delta.wrapping_add(0x800) & 0xFFFF_F000;
        o.patch_insn_or(recovery_auipc.pos, hi);
        o.patch_insn_or(recovery_auipc.pos + 4, (delta.wrapping_sub(hi) & 0xFFF) << 20);

        lw(o, T5, SP, 20);
        sw(o, T5, S3, ld::LAST_FRAME as i32);
        lw(o, T5, SP, 16);
        sw(o, T5, S3, ld::RECOVERY_PC as i32);
        lw(o, 25, SP, 24);
        lw(o, 24, SP, 28);
        lw(o, 23, SP, 32);
        lw(o, 22, SP, 36);
        lw(o, 21, SP, 40);
        lw(o, 20, SP, 44);
        lw(o, S3, SP, 48);
        lw(o, S2, SP, 52);
        lw(o, S0, SP, 56);
        lw(o, RA, SP, 60);
        ins(o, i_type(OP_IMM, 64, SP, 0, SP));
        ins(o, i_type(JALR, 0, RA, 0, ZERO));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings_are_word_sized() {
        let mut o = Output::new();
        li(&mut o, A0, 5);
        assert_eq!(o.read_u32_at(0), (5 << 20) | (A0 as u32) << 7 | OP_IMM);

        let mut o = Output::new();
        li(&mut o, A0, 0x12345);
        // lui + addi pair
        assert_eq!(o.pos(), 8);
        assert_eq!(o.read_u32_at(0) & 0x7F, LUI);

        let mut o = Output::new();
        lw(&mut o, T5, S0, -8);
        let w = o.read_u32_at(0);
        assert_eq!(w & 0x7F, LOAD);
        assert_eq!((w >> 12) & 7, 0b010);
        assert_eq!(w >> 20, (-8i32 as u32) >> 20); // sign-extended imm12
    }

    #[test]
    fn branch_patching() {
        let mut o = Output::new();
        let site = jal_placeholder(&mut o, ZERO);
        ins(&mut o, 0x13); // nop
        Rv32::patch(&mut o, site);
        let w = o.read_u32_at(0);
        assert_eq!(w & 0x7F, JAL);
        // delta 8: imm[10:1] = 4
        assert_eq!(w >> 12, j_imm(8) >> 12);

        let mut o = Output::new();
        let site = branch_placeholder(&mut o, 0b000, A0, ZERO);
        ins(&mut o, 0x13);
        Rv32::patch(&mut o, site);
        assert_eq!(o.read_u32_at(0) & !b_imm(8), (A0 as u32) << 15 | BRANCH);
    }

    #[test]
    fn slot_cells_are_eight_bytes() {
        assert_eq!(slot_off(0), -8);
        assert_eq!(slot_off(3), -32);
    }
}

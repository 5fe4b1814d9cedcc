//! ISA-1 emitter: x86-64 (System V).
//!
//! Pinned registers: r15 = linear-memory base, r14 = link-data base,
//! r13 = last-frame (reserved), r12 = stack fence (reserved). All four are
//! callee-saved in the C ABI so they survive host calls. rax/r10 are the
//! scratch pair, rdx is reserved for the division sequence, rcx carries
//! variable shift amounts.

use crate::compile::backend::softfloat::AuxOp;
use crate::compile::backend::{FloatCmp, FloatOp, FloatUn, IntCmp, IntOp, IntUnOp, Isa, MemAccess, ShiftOp};
use crate::compile::module_info::FuncSignature;
use crate::compile::output::{Output, PatchSite};
use crate::compile::regalloc::Reg;
use crate::runtime::link_data::offsets as ld;
use crate::traps::TrapCode;
use crate::values::{RegClass, ValType};

pub struct X64;

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10;
const R11: u8 = 11;
const R12: u8 = 12;
const R13: u8 = 13;
const R14: u8 = 14;
const R15: u8 = 15;

fn slot_disp(slot: u32) -> i32 {
    -8 * (slot as i32 + 1)
}

// ---- encoding primitives ------------------------------------------------

fn rex(o: &mut Output, w: bool, reg: u8, index: u8, base: u8) {
    let b = 0x40
        | (w as u8) << 3
        | ((reg >> 3) & 1) << 2
        | ((index >> 3) & 1) << 1
        | ((base >> 3) & 1);
    if b != 0x40 {
        o.write_u8(b);
    }
}

fn rex_force(o: &mut Output, w: bool, reg: u8, index: u8, base: u8) {
    o.write_u8(
        0x40 | (w as u8) << 3
            | ((reg >> 3) & 1) << 2
            | ((index >> 3) & 1) << 1
            | ((base >> 3) & 1),
    );
}

fn modrm_rr(o: &mut Output, reg: u8, rm: u8) {
    o.write_u8(0xC0 | (reg & 7) << 3 | (rm & 7));
}

/// ModRM + SIB + displacement for a `[base + disp]` operand.
fn modrm_mem(o: &mut Output, reg: u8, base: u8, disp: i32) {
    let basel = base & 7;
    let small = (-128..=127).contains(&disp);
    let mod_bits = if disp == 0 && basel != RBP {
        0u8
    } else if small {
        1
    } else {
        2
    };
    o.write_u8(mod_bits << 6 | (reg & 7) << 3 | basel);
    // rsp/r12 as base require a SIB byte.
    if basel == RSP {
        o.write_u8(0x24);
    }
    match mod_bits {
        1 => o.write_u8(disp as i8 as u8),
        2 => o.write_u32(disp as u32),
        _ => {}
    }
}

/// ModRM + SIB for `[base + index*2^scale + disp]` (index must not be rsp).
fn modrm_mem_index(o: &mut Output, reg: u8, base: u8, index: u8, scale_log: u8, disp: i32) {
    debug_assert_ne!(index & 7, RSP);
    let small = (-128..=127).contains(&disp);
    let mod_bits = if disp == 0 && (base & 7) != RBP {
        0u8
    } else if small {
        1
    } else {
        2
    };
    o.write_u8(mod_bits << 6 | (reg & 7) << 3 | 0b100);
    o.write_u8(scale_log << 6 | (index & 7) << 3 | (base & 7));
    match mod_bits {
        1 => o.write_u8(disp as i8 as u8),
        2 => o.write_u32(disp as u32),
        _ => {}
    }
}

fn op_rr(o: &mut Output, opcode: u8, reg: u8, rm: u8, wide: bool) {
    rex(o, wide, reg, 0, rm);
    o.write_u8(opcode);
    modrm_rr(o, reg, rm);
}

fn op_0f_rr(o: &mut Output, opcode: u8, reg: u8, rm: u8, wide: bool) {
    rex(o, wide, reg, 0, rm);
    o.write_u8(0x0F);
    o.write_u8(opcode);
    modrm_rr(o, reg, rm);
}

fn op_mem(o: &mut Output, opcode: u8, reg: u8, base: u8, disp: i32, wide: bool) {
    rex(o, wide, reg, 0, base);
    o.write_u8(opcode);
    modrm_mem(o, reg, base, disp);
}

fn op_0f_mem(o: &mut Output, opcode: u8, reg: u8, base: u8, disp: i32, wide: bool) {
    rex(o, wide, reg, 0, base);
    o.write_u8(0x0F);
    o.write_u8(opcode);
    modrm_mem(o, reg, base, disp);
}

/// SSE scalar op with prefix (F3/F2/66/none).
fn sse_rr(o: &mut Output, prefix: u8, opcode: u8, reg: u8, rm: u8) {
    if prefix != 0 {
        o.write_u8(prefix);
    }
    rex(o, false, reg, 0, rm);
    o.write_u8(0x0F);
    o.write_u8(opcode);
    modrm_rr(o, reg, rm);
}

fn sse_mem(o: &mut Output, prefix: u8, opcode: u8, reg: u8, base: u8, disp: i32) {
    if prefix != 0 {
        o.write_u8(prefix);
    }
    rex(o, false, reg, 0, base);
    o.write_u8(0x0F);
    o.write_u8(opcode);
    modrm_mem(o, reg, base, disp);
}

/// movq/movd between GPR and XMM. `to_xmm` picks the direction.
fn movq_gpr_xmm(o: &mut Output, gpr: u8, xmm: u8, wide: bool, to_xmm: bool) {
    o.write_u8(0x66);
    rex(o, wide, xmm, 0, gpr);
    o.write_u8(0x0F);
    o.write_u8(if to_xmm { 0x6E } else { 0x7E });
    modrm_rr(o, xmm, gpr);
}

fn mov_ri64(o: &mut Output, dst: u8, bits: u64) {
    rex_force(o, true, 0, 0, dst);
    o.write_u8(0xB8 | (dst & 7));
    o.write_u64(bits);
}

fn mov_ri32(o: &mut Output, dst: u8, bits: u32) {
    rex(o, false, 0, 0, dst);
    o.write_u8(0xB8 | (dst & 7));
    o.write_u32(bits);
}

fn push_r(o: &mut Output, r: u8) {
    rex(o, false, 0, 0, r);
    o.write_u8(0x50 | (r & 7));
}

fn pop_r(o: &mut Output, r: u8) {
    rex(o, false, 0, 0, r);
    o.write_u8(0x58 | (r & 7));
}

/// Condition codes for Jcc/SETcc.
mod cc {
    pub const B: u8 = 0x2;
    pub const AE: u8 = 0x3;
    pub const E: u8 = 0x4;
    pub const NE: u8 = 0x5;
    pub const BE: u8 = 0x6;
    pub const A: u8 = 0x7;
    pub const S: u8 = 0x8;
    pub const P: u8 = 0xA;
    pub const L: u8 = 0xC;
    pub const GE: u8 = 0xD;
    pub const LE: u8 = 0xE;
    pub const G: u8 = 0xF;
}

fn jcc(o: &mut Output, cond: u8) -> PatchSite {
    o.write_u8(0x0F);
    o.write_u8(0x80 | cond);
    o.reserve_u32()
}

fn jmp(o: &mut Output) -> PatchSite {
    o.write_u8(0xE9);
    o.reserve_u32()
}

fn bind(o: &mut Output, site: PatchSite) {
    let disp = o.pos().wrapping_sub(site.pos + 4);
    o.patch_u32(site, disp);
}

fn setcc(o: &mut Output, cond: u8, dst: u8) {
    // SETcc writes an 8-bit register; ids 4..=7 need an empty REX to reach
    // spl/bpl/sil/dil instead of ah..bh.
    if dst >= 4 {
        rex_force(o, false, 0, 0, dst);
    }
    o.write_u8(0x0F);
    o.write_u8(0x90 | cond);
    modrm_rr(o, 0, dst);
}

fn movzx8(o: &mut Output, dst: u8, src: u8) {
    if src >= 4 {
        rex_force(o, false, dst, 0, src);
    } else {
        rex(o, false, dst, 0, src);
    }
    o.write_u8(0x0F);
    o.write_u8(0xB6);
    modrm_rr(o, dst, src);
}

fn test_rr(o: &mut Output, a: u8, b: u8, wide: bool) {
    op_rr(o, 0x85, b, a, wide);
}

fn cmp_rr(o: &mut Output, lhs: u8, rhs: u8, wide: bool) {
    // cmp r/m, r with r/m = lhs.
    op_rr(o, 0x39, rhs, lhs, wide);
}

fn cmp_ri(o: &mut Output, lhs: u8, imm: i32, wide: bool) {
    rex(o, wide, 0, 0, lhs);
    o.write_u8(0x81);
    modrm_rr(o, 7, lhs);
    o.write_u32(imm as u32);
}

fn mov_rr_int(o: &mut Output, dst: u8, src: u8, wide: bool) {
    op_rr(o, 0x8B, dst, src, wide);
}

fn canonical_nan_bits(is64: bool) -> u64 {
    if is64 {
        0x7FF8_0000_0000_0000
    } else {
        0x7FC0_0000
    }
}

fn sse_prefix(is64: bool) -> u8 {
    if is64 {
        0xF2
    } else {
        0xF3
    }
}

impl X64 {
    fn trap_seq(o: &mut Output, code: TrapCode, trap_entry: u32) {
        <Self as Isa>::trap(o, code, trap_entry);
    }

    /// `dst = [r14 + link_off]` 64-bit load.
    fn load_link64(o: &mut Output, dst: u8, link_off: u32) {
        op_mem(o, 0x8B, dst, R14, link_off as i32, true);
    }
}

impl Isa for X64 {
    const NAME: &'static str = "x86_64";

    const HAS_HARD_FLOAT: bool = true;
    const ACTIVE_BOUNDS_CHECK: bool = false;
    const ACTIVE_DIV_CHECK: bool = false;
    const ACTIVE_STACK_CHECK: bool = false;
    const SLOT_ONLY_64BIT: bool = false;
    const CROSS_CLASS_SPILL: bool = true;
    const CODE_ALIGN: u32 = 16;
    const MAX_FRAME_BYTES: u32 = 1 << 30;

    const LINMEM_BASE: Reg = Reg::gpr(R15);
    const LINK_BASE: Reg = Reg::gpr(R14);
    const LAST_FRAME: Reg = Reg::gpr(R13);
    const STACK_FENCE: Reg = Reg::gpr(R12);

    const ALLOC_GPRS: &'static [Reg] = &[
        Reg::gpr(RBX),
        Reg::gpr(RSI),
        Reg::gpr(RDI),
        Reg::gpr(RCX),
        Reg::gpr(R8),
        Reg::gpr(R9),
        Reg::gpr(R11),
    ];
    const ALLOC_FPRS: &'static [Reg] = &[
        Reg::fpr(1),
        Reg::fpr(2),
        Reg::fpr(3),
        Reg::fpr(4),
        Reg::fpr(5),
        Reg::fpr(6),
        Reg::fpr(7),
        Reg::fpr(8),
    ];
    const ARG_GPRS: &'static [Reg] = &[
        Reg::gpr(RDI),
        Reg::gpr(RSI),
        Reg::gpr(RDX),
        Reg::gpr(RCX),
        Reg::gpr(R8),
        Reg::gpr(R9),
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
    const RET_GPR: Reg = Reg::gpr(RAX);
    const RET_GPR2: Reg = Reg::gpr(RDX);
    const RET_FPR: Reg = Reg::fpr(0);
    const SCRATCH: Reg = Reg::gpr(RAX);
    const SCRATCH2: Reg = Reg::gpr(R10);
    const SCRATCH_FPR: Reg = Reg::fpr(15);
    const SHIFT_AMOUNT_REG: Option<Reg> = Some(Reg::gpr(RCX));
    const CALL_TEMP: Reg = Reg::gpr(RBX);
    const DIV_CLOBBERS: &'static [Reg] = &[];

    fn prologue(o: &mut Output, _trap_entry: u32) -> PatchSite {
        push_r(o, RBP);
        mov_rr_int(o, RBP, RSP, true);
        // sub rsp, imm32 (patched with the final frame size)
        rex_force(o, true, 0, 0, RSP);
        o.write_u8(0x81);
        modrm_rr(o, 5, RSP);
        o.reserve_u32()
    }

    fn patch_frame_size(o: &mut Output, site: PatchSite, frame_bytes: u32) {
        o.patch_u32(site, frame_bytes);
    }

    fn epilogue(o: &mut Output) {
        o.write_u8(0xC9); // leave
        o.write_u8(0xC3); // ret
    }

    fn store_zero_slot(o: &mut Output, slot: u32) {
        // mov qword [rbp+disp], 0
        rex_force(o, true, 0, 0, RBP);
        o.write_u8(0xC7);
        modrm_mem(o, 0, RBP, slot_disp(slot));
        o.write_u32(0);
    }

    fn mov_imm(o: &mut Output, dst: Reg, bits: u64, wide: bool) {
        debug_assert_eq!(dst.class, RegClass::Int);
        if wide {
            if bits <= u32::MAX as u64 {
                mov_ri32(o, dst.id, bits as u32);
            } else {
                mov_ri64(o, dst.id, bits);
            }
        } else {
            mov_ri32(o, dst.id, bits as u32);
        }
    }

    fn fmov_imm(o: &mut Output, dst: Reg, bits: u64, is64: bool) {
        debug_assert_eq!(dst.class, RegClass::Float);
        if is64 {
            mov_ri64(o, Self::SCRATCH.id, bits);
        } else {
            mov_ri32(o, Self::SCRATCH.id, bits as u32);
        }
        movq_gpr_xmm(o, Self::SCRATCH.id, dst.id, is64, true);
    }

    fn mov_rr(o: &mut Output, dst: Reg, src: Reg, ty: ValType) {
        match (dst.class, src.class) {
            (RegClass::Int, RegClass::Int) => mov_rr_int(o, dst.id, src.id, ty.is_64bit()),
            (RegClass::Float, RegClass::Float) => {
                // movaps copies the whole register either way.
                sse_rr(o, 0, 0x28, dst.id, src.id);
            }
            (RegClass::Float, RegClass::Int) => {
                movq_gpr_xmm(o, src.id, dst.id, ty.is_64bit(), true);
            }
            (RegClass::Int, RegClass::Float) => {
                movq_gpr_xmm(o, dst.id, src.id, ty.is_64bit(), false);
            }
        }
    }

    fn load_slot(o: &mut Output, dst: Reg, slot: u32, ty: ValType) {
        let disp = slot_disp(slot);
        match (dst.class, ty) {
            (RegClass::Int, ValType::I32) => op_mem(o, 0x8B, dst.id, RBP, disp, false),
            (RegClass::Int, _) => op_mem(o, 0x8B, dst.id, RBP, disp, true),
            (RegClass::Float, ValType::F32) => sse_mem(o, 0xF3, 0x10, dst.id, RBP, disp),
            (RegClass::Float, _) => sse_mem(o, 0xF2, 0x10, dst.id, RBP, disp),
        }
    }

    fn store_slot(o: &mut Output, src: Reg, slot: u32, ty: ValType) {
        let disp = slot_disp(slot);
        match (src.class, ty) {
            (RegClass::Int, ValType::I32) => op_mem(o, 0x89, src.id, RBP, disp, false),
            (RegClass::Int, _) => op_mem(o, 0x89, src.id, RBP, disp, true),
            (RegClass::Float, ValType::F32) => sse_mem(o, 0xF3, 0x11, src.id, RBP, disp),
            (RegClass::Float, _) => sse_mem(o, 0xF2, 0x11, src.id, RBP, disp),
        }
    }

    fn copy_slot(o: &mut Output, dst_slot: u32, src_slot: u32, _ty: ValType) {
        // Always move the full 8-byte cell through the scratch register.
        op_mem(o, 0x8B, RAX, RBP, slot_disp(src_slot), true);
        op_mem(o, 0x89, RAX, RBP, slot_disp(dst_slot), true);
    }

    fn store_slot_imm64(o: &mut Output, slot: u32, bits: u64) {
        if bits <= u32::MAX as u64 {
            mov_ri32(o, RAX, bits as u32);
        } else {
            mov_ri64(o, RAX, bits);
        }
        op_mem(o, 0x89, RAX, RBP, slot_disp(slot), true);
    }

    fn store_slot_pair(_o: &mut Output, _lo: Reg, _hi: Reg, _slot: u32) {
        unreachable!("64-bit values occupy single registers on x86_64");
    }

    fn load_slot_pair(_o: &mut Output, _lo: Reg, _hi: Reg, _slot: u32) {
        unreachable!("64-bit values occupy single registers on x86_64");
    }

    fn int_op(o: &mut Output, op: IntOp, dst: Reg, rhs: Reg, wide: bool) {
        match op {
            IntOp::Add => op_rr(o, 0x01, rhs.id, dst.id, wide),
            IntOp::Sub => op_rr(o, 0x29, rhs.id, dst.id, wide),
            IntOp::And => op_rr(o, 0x21, rhs.id, dst.id, wide),
            IntOp::Or => op_rr(o, 0x09, rhs.id, dst.id, wide),
            IntOp::Xor => op_rr(o, 0x31, rhs.id, dst.id, wide),
            IntOp::Mul => op_0f_rr(o, 0xAF, dst.id, rhs.id, wide),
        }
    }

    fn int_shift(o: &mut Output, op: ShiftOp, dst: Reg, amount: Reg, wide: bool) {
        debug_assert_eq!(amount.id, RCX);
        let ext = match op {
            ShiftOp::Rotl => 0,
            ShiftOp::Rotr => 1,
            ShiftOp::Shl => 4,
            ShiftOp::ShrU => 5,
            ShiftOp::ShrS => 7,
        };
        rex(o, wide, 0, 0, dst.id);
        o.write_u8(0xD3);
        modrm_rr(o, ext, dst.id);
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
        debug_assert!(rhs.id != RAX && rhs.id != RDX);
        mov_rr_int(o, RAX, lhs.id, wide);
        if signed {
            // Hardware flags INT_MIN / -1; wasm wants DIV_OVERFLOW for the
            // quotient and 0 for the remainder, so both cases are resolved
            // up front.
            cmp_ri(o, rhs.id, -1, wide);
            let not_minus_one = jcc(o, cc::NE);
            if rem {
                // lhs % -1 == 0, skip the idiv entirely.
                op_rr(o, 0x31, RDX, RDX, false); // xor edx, edx
                let done = jmp(o);
                bind(o, not_minus_one);
                // cqo/cdq
                rex(o, wide, 0, 0, 0);
                o.write_u8(0x99);
                rex(o, wide, 7, 0, rhs.id);
                o.write_u8(0xF7);
                modrm_rr(o, 7, rhs.id);
                bind(o, done);
            } else {
                if wide {
                    mov_ri64(o, R10, 0x8000_0000_0000_0000);
                    cmp_rr(o, RAX, R10, true);
                } else {
                    cmp_ri(o, RAX, i32::MIN, false);
                }
                let ok = jcc(o, cc::NE);
                Self::trap_seq(o, TrapCode::DivOverflow, trap_entry);
                bind(o, ok);
                bind(o, not_minus_one);
                rex(o, wide, 0, 0, 0);
                o.write_u8(0x99);
                rex(o, wide, 7, 0, rhs.id);
                o.write_u8(0xF7);
                modrm_rr(o, 7, rhs.id);
            }
        } else {
            // xor edx, edx; div rhs
            op_rr(o, 0x31, RDX, RDX, false);
            rex(o, wide, 6, 0, rhs.id);
            o.write_u8(0xF7);
            modrm_rr(o, 6, rhs.id);
        }
        let result = if rem { RDX } else { RAX };
        mov_rr_int(o, dst.id, result, wide);
    }

    fn int_unop(o: &mut Output, op: IntUnOp, dst: Reg, src: Reg, wide: bool) {
        let bits: u32 = if wide { 64 } else { 32 };
        match op {
            IntUnOp::Clz => {
                test_rr(o, src.id, src.id, wide);
                let nonzero = jcc(o, cc::NE);
                Self::mov_imm(o, dst, bits as u64, wide);
                let done = jmp(o);
                bind(o, nonzero);
                // bsr scratch, src; dst = bits-1 - scratch
                op_0f_rr(o, 0xBD, RAX, src.id, wide);
                Self::mov_imm(o, dst, (bits - 1) as u64, wide);
                op_rr(o, 0x29, RAX, dst.id, wide); // sub dst, rax
                bind(o, done);
            }
            IntUnOp::Ctz => {
                test_rr(o, src.id, src.id, wide);
                let nonzero = jcc(o, cc::NE);
                Self::mov_imm(o, dst, bits as u64, wide);
                let done = jmp(o);
                bind(o, nonzero);
                op_0f_rr(o, 0xBC, dst.id, src.id, wide); // bsf
                bind(o, done);
            }
            IntUnOp::Popcnt => {
                // popcnt dst, src (SSE4.2-class, ubiquitous on x86-64)
                o.write_u8(0xF3);
                rex(o, wide, dst.id, 0, src.id);
                o.write_u8(0x0F);
                o.write_u8(0xB8);
                modrm_rr(o, dst.id, src.id);
            }
        }
    }

    fn int_cmp(o: &mut Output, cmp: IntCmp, dst: Reg, lhs: Reg, rhs: Reg, wide: bool) {
        cmp_rr(o, lhs.id, rhs.id, wide);
        let cond = match cmp {
            IntCmp::Eq => cc::E,
            IntCmp::Ne => cc::NE,
            IntCmp::LtS => cc::L,
            IntCmp::LtU => cc::B,
            IntCmp::GtS => cc::G,
            IntCmp::GtU => cc::A,
            IntCmp::LeS => cc::LE,
            IntCmp::LeU => cc::BE,
            IntCmp::GeS => cc::GE,
            IntCmp::GeU => cc::AE,
        };
        setcc(o, cond, dst.id);
        movzx8(o, dst.id, dst.id);
    }

    fn int_eqz(o: &mut Output, dst: Reg, src: Reg, wide: bool) {
        test_rr(o, src.id, src.id, wide);
        setcc(o, cc::E, dst.id);
        movzx8(o, dst.id, dst.id);
    }

    fn extend32(o: &mut Output, dst: Reg, src: Reg, signed: bool) {
        if signed {
            // movsxd dst, src32
            rex(o, true, dst.id, 0, src.id);
            o.write_u8(0x63);
            modrm_rr(o, dst.id, src.id);
        } else {
            mov_rr_int(o, dst.id, src.id, false);
        }
    }

    fn wrap64(o: &mut Output, dst: Reg, src: Reg) {
        mov_rr_int(o, dst.id, src.id, false);
    }

    fn float_op(o: &mut Output, op: FloatOp, dst: Reg, rhs: Reg, is64: bool) {
        let p = sse_prefix(is64);
        match op {
            FloatOp::Add => sse_rr(o, p, 0x58, dst.id, rhs.id),
            FloatOp::Sub => sse_rr(o, p, 0x5C, dst.id, rhs.id),
            FloatOp::Mul => sse_rr(o, p, 0x59, dst.id, rhs.id),
            FloatOp::Div => sse_rr(o, p, 0x5E, dst.id, rhs.id),
            FloatOp::Min | FloatOp::Max => {
                let ucomi_prefix = if is64 { 0x66 } else { 0 };
                sse_rr(o, ucomi_prefix, 0x2E, dst.id, rhs.id);
                let nan = jcc(o, cc::P);
                let unequal = jcc(o, cc::NE);
                // Equal operands: the sign bits decide between +-0.
                let bitop = if matches!(op, FloatOp::Min) { 0x56 } else { 0x54 };
                sse_rr(o, 0, bitop, dst.id, rhs.id); // orps / andps
                let done_eq = jmp(o);
                bind(o, unequal);
                let minmax = if matches!(op, FloatOp::Min) { 0x5D } else { 0x5F };
                sse_rr(o, p, minmax, dst.id, rhs.id);
                let done_cmp = jmp(o);
                bind(o, nan);
                Self::fmov_imm(o, dst, canonical_nan_bits(is64), is64);
                bind(o, done_eq);
                bind(o, done_cmp);
            }
            FloatOp::Copysign => {
                let (sign, mag): (u64, u64) = if is64 {
                    (0x8000_0000_0000_0000, 0x7FFF_FFFF_FFFF_FFFF)
                } else {
                    (0x8000_0000, 0x7FFF_FFFF)
                };
                movq_gpr_xmm(o, RAX, dst.id, is64, false);
                movq_gpr_xmm(o, R10, rhs.id, is64, false);
                // rax = (rax & mag) | (r10 & sign)
                Self::mov_imm(o, Reg::gpr(RDX), mag, is64);
                op_rr(o, 0x21, RDX, RAX, is64);
                Self::mov_imm(o, Reg::gpr(RDX), sign, is64);
                op_rr(o, 0x21, RDX, R10, is64);
                op_rr(o, 0x09, R10, RAX, is64);
                movq_gpr_xmm(o, RAX, dst.id, is64, true);
            }
        }
    }

    fn float_unop(o: &mut Output, op: FloatUn, dst: Reg, is64: bool) {
        let p = sse_prefix(is64);
        match op {
            FloatUn::Abs | FloatUn::Neg => {
                let mask: u64 = match (op, is64) {
                    (FloatUn::Abs, true) => 0x7FFF_FFFF_FFFF_FFFF,
                    (FloatUn::Abs, false) => 0x7FFF_FFFF,
                    (_, true) => 0x8000_0000_0000_0000,
                    (_, false) => 0x8000_0000,
                };
                movq_gpr_xmm(o, RAX, dst.id, is64, false);
                Self::mov_imm(o, Reg::gpr(R10), mask, is64);
                if matches!(op, FloatUn::Abs) {
                    op_rr(o, 0x21, R10, RAX, is64); // and
                } else {
                    op_rr(o, 0x31, R10, RAX, is64); // xor
                }
                movq_gpr_xmm(o, RAX, dst.id, is64, true);
            }
            FloatUn::Sqrt => sse_rr(o, p, 0x51, dst.id, dst.id),
            FloatUn::Ceil | FloatUn::Floor | FloatUn::Trunc | FloatUn::Nearest => {
                // roundss/roundsd imm: 0 nearest-even, 1 floor, 2 ceil,
                // 3 trunc; bit 3 suppresses the precision exception.
                let mode: u8 = match op {
                    FloatUn::Nearest => 0,
                    FloatUn::Floor => 1,
                    FloatUn::Ceil => 2,
                    _ => 3,
                };
                o.write_u8(0x66);
                rex(o, false, dst.id, 0, dst.id);
                o.write_u8(0x0F);
                o.write_u8(0x3A);
                o.write_u8(if is64 { 0x0B } else { 0x0A });
                modrm_rr(o, dst.id, dst.id);
                o.write_u8(mode | 8);
            }
        }
    }

    fn float_cmp(o: &mut Output, cmp: FloatCmp, dst: Reg, lhs: Reg, rhs: Reg, is64: bool) {
        let ucomi_prefix = if is64 { 0x66 } else { 0 };
        sse_rr(o, ucomi_prefix, 0x2E, lhs.id, rhs.id);
        let nan_result: u32 = u32::from(matches!(cmp, FloatCmp::Ne));
        mov_ri32(o, dst.id, nan_result);
        let done = jcc(o, cc::P);
        let cond = match cmp {
            FloatCmp::Eq => cc::E,
            FloatCmp::Ne => cc::NE,
            FloatCmp::Lt => cc::B,
            FloatCmp::Gt => cc::A,
            FloatCmp::Le => cc::BE,
            FloatCmp::Ge => cc::AE,
        };
        setcc(o, cond, dst.id);
        movzx8(o, dst.id, dst.id);
        bind(o, done);
    }

    fn float_from_int(o: &mut Output, dst: Reg, src: Reg, to64: bool, from64: bool, signed: bool) {
        let p = if to64 { 0xF2 } else { 0xF3 };
        if !from64 {
            if signed {
                o.write_u8(p);
                rex(o, false, dst.id, 0, src.id);
                o.write_u8(0x0F);
                o.write_u8(0x2A);
                modrm_rr(o, dst.id, src.id);
            } else {
                // Zero-extend to 64 bits, then a 64-bit signed convert is
                // exact for every u32.
                mov_rr_int(o, RAX, src.id, false);
                o.write_u8(p);
                rex_force(o, true, dst.id, 0, RAX);
                o.write_u8(0x0F);
                o.write_u8(0x2A);
                modrm_rr(o, dst.id, RAX);
            }
        } else if signed {
            o.write_u8(p);
            rex_force(o, true, dst.id, 0, src.id);
            o.write_u8(0x0F);
            o.write_u8(0x2A);
            modrm_rr(o, dst.id, src.id);
        } else {
            // u64: branch on the sign bit; large values are halved with the
            // sticky low bit folded in, converted and doubled.
            test_rr(o, src.id, src.id, true);
            let big = jcc(o, cc::S);
            o.write_u8(p);
            rex_force(o, true, dst.id, 0, src.id);
            o.write_u8(0x0F);
            o.write_u8(0x2A);
            modrm_rr(o, dst.id, src.id);
            let done = jmp(o);
            bind(o, big);
            mov_rr_int(o, RAX, src.id, true);
            mov_rr_int(o, R10, src.id, true);
            // shr rax, 1; and r10, 1; or rax, r10
            rex_force(o, true, 0, 0, RAX);
            o.write_u8(0xD1);
            modrm_rr(o, 5, RAX);
            rex_force(o, true, 0, 0, R10);
            o.write_u8(0x83);
            modrm_rr(o, 4, R10);
            o.write_u8(1);
            op_rr(o, 0x09, R10, RAX, true);
            o.write_u8(p);
            rex_force(o, true, dst.id, 0, RAX);
            o.write_u8(0x0F);
            o.write_u8(0x2A);
            modrm_rr(o, dst.id, RAX);
            // dst += dst
            let addop = if to64 { 0xF2 } else { 0xF3 };
            sse_rr(o, addop, 0x58, dst.id, dst.id);
            bind(o, done);
        }
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
        let p = if from64 { 0xF2 } else { 0xF3 };
        let cvtt = |o: &mut Output, dst: u8, src: u8, wide: bool| {
            o.write_u8(p);
            if wide {
                rex_force(o, true, dst, 0, src);
            } else {
                rex(o, false, dst, 0, src);
            }
            o.write_u8(0x0F);
            o.write_u8(0x2C);
            modrm_rr(o, dst, src);
        };

        if signed {
            cvtt(o, dst.id, src.id, to64);
            // The sentinel result is either a genuine MIN or out of range.
            if to64 {
                mov_ri64(o, R10, 0x8000_0000_0000_0000);
                cmp_rr(o, dst.id, R10, true);
            } else {
                cmp_ri(o, dst.id, i32::MIN, false);
            }
            let done = jcc(o, cc::NE);
            let min_bits: u64 = match (to64, from64) {
                (false, false) => 0xCF00_0000,          // -2^31 as f32
                (false, true) => 0xC1E0_0000_0000_0000, // -2^31 as f64
                (true, false) => 0xDF00_0000,           // -2^63 as f32
                (true, true) => 0xC3E0_0000_0000_0000,  // -2^63 as f64
            };
            Self::fmov_imm(o, Self::SCRATCH_FPR, min_bits, from64);
            let ucomi_prefix = if from64 { 0x66 } else { 0 };
            sse_rr(o, ucomi_prefix, 0x2E, src.id, Self::SCRATCH_FPR.id);
            let trap1 = jcc(o, cc::P);
            let ok = jcc(o, cc::E);
            bind(o, trap1);
            Self::trap_seq(o, TrapCode::TruncOverflow, trap_entry);
            bind(o, ok);
            bind(o, done);
        } else if !to64 {
            // Truncate through the 64-bit form, then require the result to
            // fit in 32 bits.
            cvtt(o, RAX, src.id, true);
            mov_rr_int(o, R10, RAX, true);
            // shr r10, 32
            rex_force(o, true, 0, 0, R10);
            o.write_u8(0xC1);
            modrm_rr(o, 5, R10);
            o.write_u8(32);
            test_rr(o, R10, R10, true);
            let ok = jcc(o, cc::E);
            Self::trap_seq(o, TrapCode::TruncOverflow, trap_entry);
            bind(o, ok);
            mov_rr_int(o, dst.id, RAX, false);
        } else {
            // u64: values below 2^63 convert directly; larger ones are
            // rebased by 2^63 first. Negative inputs and NaN fall out as a
            // negative truncation in either branch.
            let threshold: u64 = if from64 {
                0x43E0_0000_0000_0000 // 2^63 as f64
            } else {
                0x5F00_0000 // 2^63 as f32
            };
            Self::fmov_imm(o, Self::SCRATCH_FPR, threshold, from64);
            let ucomi_prefix = if from64 { 0x66 } else { 0 };
            sse_rr(o, ucomi_prefix, 0x2E, src.id, Self::SCRATCH_FPR.id);
            let big = jcc(o, cc::AE);
            cvtt(o, dst.id, src.id, true);
            test_rr(o, dst.id, dst.id, true);
            let ok_small = jcc(o, cc::GE);
            Self::trap_seq(o, TrapCode::TruncOverflow, trap_entry);
            bind(o, ok_small);
            let done = jmp(o);
            bind(o, big);
            // src -= 2^63 (src is consumed by this op)
            sse_rr(o, p, 0x5C, src.id, Self::SCRATCH_FPR.id);
            cvtt(o, dst.id, src.id, true);
            test_rr(o, dst.id, dst.id, true);
            let ok_big = jcc(o, cc::GE);
            Self::trap_seq(o, TrapCode::TruncOverflow, trap_entry);
            bind(o, ok_big);
            mov_ri64(o, R10, 0x8000_0000_0000_0000);
            op_rr(o, 0x01, R10, dst.id, true); // add dst, r10
            bind(o, done);
        }
    }

    fn float_promote(o: &mut Output, dst: Reg, src: Reg) {
        sse_rr(o, 0xF3, 0x5A, dst.id, src.id);
    }

    fn float_demote(o: &mut Output, dst: Reg, src: Reg) {
        sse_rr(o, 0xF2, 0x5A, dst.id, src.id);
    }

    fn aux_op(
        _o: &mut Output,
        _op: AuxOp,
        _dst_slot: u32,
        _a_slot: u32,
        _b_slot: Option<u32>,
        _trap_entry: u32,
    ) {
        unreachable!("x86_64 has native 64-bit and float support");
    }

    fn load_linmem(
        o: &mut Output,
        dst: Reg,
        addr: Reg,
        offset: u32,
        acc: MemAccess,
        _trap_entry: u32,
    ) {
        // Passive protection: the guard region turns any escape into a
        // deterministic fault. The address register holds a zero-extended
        // u32.
        let (base, index, disp) = if offset <= i32::MAX as u32 {
            (R15, addr.id, offset as i32)
        } else {
            // Fold the large offset into the scratch register.
            mov_ri32(o, RAX, offset);
            op_rr(o, 0x01, addr.id, RAX, true); // add rax, addr
            (R15, RAX, 0)
        };
        match acc {
            MemAccess::I32Load8S => {
                rex(o, false, dst.id, index, base);
                o.write_u8(0x0F);
                o.write_u8(0xBE);
                modrm_mem_index(o, dst.id, base, index, 0, disp);
            }
            MemAccess::I32Load8U | MemAccess::I64Load8U => {
                rex(o, false, dst.id, index, base);
                o.write_u8(0x0F);
                o.write_u8(0xB6);
                modrm_mem_index(o, dst.id, base, index, 0, disp);
            }
            MemAccess::I32Load16S => {
                rex(o, false, dst.id, index, base);
                o.write_u8(0x0F);
                o.write_u8(0xBF);
                modrm_mem_index(o, dst.id, base, index, 0, disp);
            }
            MemAccess::I32Load16U | MemAccess::I64Load16U => {
                rex(o, false, dst.id, index, base);
                o.write_u8(0x0F);
                o.write_u8(0xB7);
                modrm_mem_index(o, dst.id, base, index, 0, disp);
            }
            MemAccess::I32 | MemAccess::I64Load32U => {
                rex(o, false, dst.id, index, base);
                o.write_u8(0x8B);
                modrm_mem_index(o, dst.id, base, index, 0, disp);
            }
            MemAccess::I64Load8S => {
                rex_force(o, true, dst.id, index, base);
                o.write_u8(0x0F);
                o.write_u8(0xBE);
                modrm_mem_index(o, dst.id, base, index, 0, disp);
            }
            MemAccess::I64Load16S => {
                rex_force(o, true, dst.id, index, base);
                o.write_u8(0x0F);
                o.write_u8(0xBF);
                modrm_mem_index(o, dst.id, base, index, 0, disp);
            }
            MemAccess::I64Load32S => {
                rex_force(o, true, dst.id, index, base);
                o.write_u8(0x63);
                modrm_mem_index(o, dst.id, base, index, 0, disp);
            }
            MemAccess::I64 => {
                rex_force(o, true, dst.id, index, base);
                o.write_u8(0x8B);
                modrm_mem_index(o, dst.id, base, index, 0, disp);
            }
            MemAccess::F32 => {
                o.write_u8(0xF3);
                rex(o, false, dst.id, index, base);
                o.write_u8(0x0F);
                o.write_u8(0x10);
                modrm_mem_index(o, dst.id, base, index, 0, disp);
            }
            MemAccess::F64 => {
                o.write_u8(0xF2);
                rex(o, false, dst.id, index, base);
                o.write_u8(0x0F);
                o.write_u8(0x10);
                modrm_mem_index(o, dst.id, base, index, 0, disp);
            }
        }
    }

    fn store_linmem(
        o: &mut Output,
        src: Reg,
        addr: Reg,
        offset: u32,
        acc: MemAccess,
        _trap_entry: u32,
    ) {
        let (base, index, disp) = if offset <= i32::MAX as u32 {
            (R15, addr.id, offset as i32)
        } else {
            mov_ri32(o, RAX, offset);
            op_rr(o, 0x01, addr.id, RAX, true);
            (R15, RAX, 0)
        };
        match acc.width() {
            1 => {
                // 8-bit stores from sil/dil/bpl need a REX.
                if src.id >= 4 {
                    rex_force(o, false, src.id, index, base);
                } else {
                    rex(o, false, src.id, index, base);
                }
                o.write_u8(0x88);
                modrm_mem_index(o, src.id, base, index, 0, disp);
            }
            2 => {
                o.write_u8(0x66);
                rex(o, false, src.id, index, base);
                o.write_u8(0x89);
                modrm_mem_index(o, src.id, base, index, 0, disp);
            }
            4 => {
                if src.class == RegClass::Float {
                    o.write_u8(0xF3);
                    rex(o, false, src.id, index, base);
                    o.write_u8(0x0F);
                    o.write_u8(0x11);
                    modrm_mem_index(o, src.id, base, index, 0, disp);
                } else {
                    rex(o, false, src.id, index, base);
                    o.write_u8(0x89);
                    modrm_mem_index(o, src.id, base, index, 0, disp);
                }
            }
            _ => {
                if src.class == RegClass::Float {
                    o.write_u8(0xF2);
                    rex(o, false, src.id, index, base);
                    o.write_u8(0x0F);
                    o.write_u8(0x11);
                    modrm_mem_index(o, src.id, base, index, 0, disp);
                } else {
                    rex_force(o, true, src.id, index, base);
                    o.write_u8(0x89);
                    modrm_mem_index(o, src.id, base, index, 0, disp);
                }
            }
        }
    }

    fn linmem64_slot(
        _o: &mut Output,
        _store: bool,
        _addr: Reg,
        _offset: u32,
        _slot: u32,
        _trap_entry: u32,
    ) {
        unreachable!("x86_64 accesses 64-bit memory operands in registers");
    }

    fn memory_size(o: &mut Output, dst: Reg) {
        op_mem(o, 0x8B, dst.id, R14, ld::LINMEM_SIZE as i32, false);
        // shr dst, 16
        rex(o, false, 0, 0, dst.id);
        o.write_u8(0xC1);
        modrm_rr(o, 5, dst.id);
        o.write_u8(16);
    }

    fn memory_grow(o: &mut Output, dst: Reg, delta: Reg) {
        Self::load_link64(o, RDI, ld::RUNTIME_CTX);
        mov_rr_int(o, RSI, delta.id, false);
        Self::call_link_slot(o, ld::MEMORY_GROW_FN);
        mov_rr_int(o, dst.id, RAX, false);
    }

    fn load_link(o: &mut Output, dst: Reg, link_off: u32, ty: ValType) {
        let disp = link_off as i32;
        match (dst.class, ty) {
            (RegClass::Int, ValType::I32) => op_mem(o, 0x8B, dst.id, R14, disp, false),
            (RegClass::Int, _) => op_mem(o, 0x8B, dst.id, R14, disp, true),
            (RegClass::Float, ValType::F32) => sse_mem(o, 0xF3, 0x10, dst.id, R14, disp),
            (RegClass::Float, _) => sse_mem(o, 0xF2, 0x10, dst.id, R14, disp),
        }
    }

    fn store_link(o: &mut Output, src: Reg, link_off: u32, ty: ValType) {
        let disp = link_off as i32;
        match (src.class, ty) {
            (RegClass::Int, ValType::I32) => op_mem(o, 0x89, src.id, R14, disp, false),
            (RegClass::Int, _) => op_mem(o, 0x89, src.id, R14, disp, true),
            (RegClass::Float, ValType::F32) => sse_mem(o, 0xF3, 0x11, src.id, R14, disp),
            (RegClass::Float, _) => sse_mem(o, 0xF2, 0x11, src.id, R14, disp),
        }
    }

    fn link64_slot(_o: &mut Output, _store: bool, _link_off: u32, _slot: u32) {
        unreachable!("x86_64 moves 64-bit link slots through registers");
    }

    fn jump(o: &mut Output) -> PatchSite {
        jmp(o)
    }

    fn jump_back(o: &mut Output, target: u32) {
        o.write_u8(0xE9);
        let disp = target.wrapping_sub(o.pos() + 4);
        o.write_u32(disp);
    }

    fn br_if_zero(o: &mut Output, cond: Reg) -> PatchSite {
        test_rr(o, cond.id, cond.id, false);
        jcc(o, cc::E)
    }

    fn br_if_nonzero(o: &mut Output, cond: Reg) -> PatchSite {
        test_rr(o, cond.id, cond.id, false);
        jcc(o, cc::NE)
    }

    fn patch_jump(o: &mut Output, site: PatchSite) {
        bind(o, site);
    }

    fn br_if_eq_imm(o: &mut Output, index: Reg, case: u32) -> PatchSite {
        cmp_ri(o, index.id, case as i32, false);
        jcc(o, cc::E)
    }

    fn call_rel(o: &mut Output) -> PatchSite {
        o.write_u8(0xE8);
        o.reserve_u32()
    }

    fn patch_call(o: &mut Output, site: PatchSite, target: u32) {
        let disp = target.wrapping_sub(site.pos + 4);
        o.patch_u32(site, disp);
    }

    fn call_link_slot(o: &mut Output, link_off: u32) {
        op_mem(o, 0xFF, 2, R14, link_off as i32, false);
    }

    fn call_absolute(o: &mut Output, addr: u64) {
        mov_ri64(o, RAX, addr);
        o.write_u8(0xFF);
        modrm_rr(o, 2, RAX);
    }

    fn adjust_sp(o: &mut Output, bytes: i32) {
        rex_force(o, true, 0, 0, RSP);
        o.write_u8(0x81);
        modrm_rr(o, if bytes < 0 { 5 } else { 0 }, RSP);
        o.write_u32(bytes.unsigned_abs());
    }

    fn store_sp(o: &mut Output, src: Reg, sp_off: u32, ty: ValType) {
        let disp = sp_off as i32;
        match (src.class, ty) {
            (RegClass::Int, ValType::I32) => op_mem(o, 0x89, src.id, RSP, disp, false),
            (RegClass::Int, _) => op_mem(o, 0x89, src.id, RSP, disp, true),
            (RegClass::Float, ValType::F32) => sse_mem(o, 0xF3, 0x11, src.id, RSP, disp),
            (RegClass::Float, _) => sse_mem(o, 0xF2, 0x11, src.id, RSP, disp),
        }
    }

    fn load_sp(o: &mut Output, dst: Reg, sp_off: u32, ty: ValType) {
        let disp = sp_off as i32;
        match (dst.class, ty) {
            (RegClass::Int, ValType::I32) => op_mem(o, 0x8B, dst.id, RSP, disp, false),
            (RegClass::Int, _) => op_mem(o, 0x8B, dst.id, RSP, disp, true),
            (RegClass::Float, ValType::F32) => sse_mem(o, 0xF3, 0x10, dst.id, RSP, disp),
            (RegClass::Float, _) => sse_mem(o, 0xF2, 0x10, dst.id, RSP, disp),
        }
    }

    fn sp_addr(o: &mut Output, dst: Reg, sp_off: u32) {
        rex_force(o, true, dst.id, 0, RSP);
        o.write_u8(0x8D);
        modrm_mem(o, dst.id, RSP, sp_off as i32);
    }

    fn sp_slot_copy(o: &mut Output, to_sp: bool, sp_off: u32, slot: u32) {
        if to_sp {
            op_mem(o, 0x8B, RAX, RBP, slot_disp(slot), true);
            op_mem(o, 0x89, RAX, RSP, sp_off as i32, true);
        } else {
            op_mem(o, 0x8B, RAX, RSP, sp_off as i32, true);
            op_mem(o, 0x89, RAX, RBP, slot_disp(slot), true);
        }
    }

    fn call_indirect(
        o: &mut Output,
        index: Reg,
        expected_sig: u32,
        table_off: u32,
        trap_entry: u32,
    ) {
        // cmp index, [r14 + table_off] (entry count)
        op_mem(o, 0x3B, index.id, R14, table_off as i32, false);
        let in_bounds = jcc(o, cc::B);
        Self::trap_seq(o, TrapCode::IndirectCallOutOfBounds, trap_entry);
        bind(o, in_bounds);
        // rax = &table[index]
        mov_rr_int(o, RAX, index.id, false);
        rex_force(o, true, 0, 0, RAX);
        o.write_u8(0xC1);
        modrm_rr(o, 4, RAX);
        o.write_u8(4); // shl rax, 4
        // cmp dword [r14 + rax + table_off + 8], expected_sig
        rex(o, false, 7, RAX, R14);
        o.write_u8(0x81);
        modrm_mem_index(o, 7, R14, RAX, 0, table_off as i32 + 8);
        o.write_u32(expected_sig);
        let sig_ok = jcc(o, cc::E);
        Self::trap_seq(o, TrapCode::IndirectCallWrongSig, trap_entry);
        bind(o, sig_ok);
        // call qword [r14 + rax + table_off + 16]
        rex(o, false, 2, RAX, R14);
        o.write_u8(0xFF);
        modrm_mem_index(o, 2, R14, RAX, 0, table_off as i32 + 16);
    }

    fn trap(o: &mut Output, code: TrapCode, trap_entry: u32) {
        mov_rr_int(o, RDI, R15, true);
        mov_ri32(o, RSI, code.as_u32());
        o.write_u8(0xE8);
        let disp = trap_entry.wrapping_sub(o.pos() + 4);
        o.write_u32(disp);
    }

    fn interruption_poll(o: &mut Output, trap_entry: u32) {
        op_mem(o, 0x8B, RAX, R14, ld::INTERRUPT_FLAG as i32, false);
        test_rr(o, RAX, RAX, false);
        let skip = jcc(o, cc::E);
        mov_rr_int(o, RDI, R15, true);
        mov_rr_int(o, RSI, RAX, false);
        o.write_u8(0xE8);
        let disp = trap_entry.wrapping_sub(o.pos() + 4);
        o.write_u32(disp);
        bind(o, skip);
    }

    fn stacktrace_push(o: &mut Output, func_index: u32, cap: u32) {
        op_mem(o, 0x8B, RAX, R14, ld::RING_IDX as i32, false);
        // mov dword [r14 + rax*4 + RING_SLOTS], func_index
        rex(o, false, 0, RAX, R14);
        o.write_u8(0xC7);
        modrm_mem_index(o, 0, R14, RAX, 2, ld::RING_SLOTS as i32);
        o.write_u32(func_index);
        // inc eax; wrap at cap
        o.write_u8(0xFF);
        modrm_rr(o, 0, RAX);
        cmp_ri(o, RAX, cap as i32, false);
        let no_wrap = jcc(o, cc::NE);
        op_rr(o, 0x31, RAX, RAX, false);
        bind(o, no_wrap);
        op_mem(o, 0x89, RAX, R14, ld::RING_IDX as i32, false);
        // inc dword [r14 + RING_COUNT]
        rex(o, false, 0, 0, R14);
        o.write_u8(0xFF);
        modrm_mem(o, 0, R14, ld::RING_COUNT as i32);
    }

    fn stacktrace_pop(o: &mut Output, cap: u32) {
        op_mem(o, 0x8B, RAX, R14, ld::RING_IDX as i32, false);
        test_rr(o, RAX, RAX, false);
        let nonzero = jcc(o, cc::NE);
        mov_ri32(o, RAX, cap);
        bind(o, nonzero);
        // dec eax
        o.write_u8(0xFF);
        modrm_rr(o, 1, RAX);
        op_mem(o, 0x89, RAX, R14, ld::RING_IDX as i32, false);
        // dec dword [r14 + RING_COUNT]
        rex(o, false, 1, 0, R14);
        o.write_u8(0xFF);
        modrm_mem(o, 1, R14, ld::RING_COUNT as i32);
    }

    fn emit_trap_entry(o: &mut Output) {
        // args: rdi = linmem base (unused), esi = trap code
        op_mem(o, 0x89, RSI, R14, ld::TRAP_CODE as i32, false);
        op_mem(o, 0x8B, RSP, R14, ld::LAST_FRAME as i32, true);
        // jmp qword [r14 + RECOVERY_PC]
        rex(o, false, 4, 0, R14);
        o.write_u8(0xFF);
        modrm_mem(o, 4, R14, ld::RECOVERY_PC as i32);
    }

    fn emit_landing_pad(o: &mut Output, trap_entry: u32) -> Option<u32> {
        let pad = o.pos();
        // Entered from the fault handler with the faulting PC pushed as the
        // return address. Save every caller-saved register the probe call
        // may clobber, realign the stack, call probe, and either retry the
        // faulting instruction or trap.
        const SAVES: [u8; 9] = [RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11];
        for r in SAVES {
            push_r(o, r);
        }
        Self::adjust_sp(o, -(16 * 8));
        for i in 0..16u8 {
            // movq [rsp + 8i], xmm_i
            o.write_u8(0x66);
            rex(o, false, i, 0, RSP);
            o.write_u8(0x0F);
            o.write_u8(0xD6);
            modrm_mem(o, i, RSP, (8 * i as u32) as i32);
        }
        // Dynamic 16-byte alignment; the original rsp is kept on the
        // aligned stack (twice, to stay aligned).
        mov_rr_int(o, RAX, RSP, true);
        // and rsp, -16
        rex_force(o, true, 0, 0, RSP);
        o.write_u8(0x83);
        modrm_rr(o, 4, RSP);
        o.write_u8(0xF0);
        push_r(o, RAX);
        push_r(o, RAX);
        Self::load_link64(o, RDI, ld::RUNTIME_CTX);
        Self::load_link64(o, RSI, ld::PROBE_OFFSET);
        Self::call_link_slot(o, ld::PROBE_FN);
        // restore original rsp
        op_mem(o, 0x8B, RSP, RSP, 0, true);
        test_rr(o, RAX, RAX, false);
        let resumed = jcc(o, cc::NE);
        Self::trap_seq(o, TrapCode::LinmemCouldNotExtend, trap_entry);
        bind(o, resumed);
        for i in 0..16u8 {
            // movq xmm_i, [rsp + 8i]
            o.write_u8(0xF3);
            rex(o, false, i, 0, RSP);
            o.write_u8(0x0F);
            o.write_u8(0x7E);
            modrm_mem(o, i, RSP, (8 * i as u32) as i32);
        }
        Self::adjust_sp(o, 16 * 8);
        for r in SAVES.iter().rev() {
            pop_r(o, *r);
        }
        o.write_u8(0xC3); // ret: retry the faulting instruction
        Some(pad)
    }

    fn emit_export_wrapper(o: &mut Output, sig: &FuncSignature, body_offset: u32) {
        // extern "C" fn(link_data: rdi, args: rsi, results: rdx)
        push_r(o, RBP);
        mov_rr_int(o, RBP, RSP, true);
        for r in [RBX, R12, R13, R14, R15] {
            push_r(o, r);
        }
        mov_rr_int(o, R14, RDI, true);
        Self::load_link64(o, R15, ld::LINMEM_BASE);
        // Save the outer recovery state and the results pointer.
        op_mem(o, 0xFF, 6, R14, ld::LAST_FRAME as i32, false); // push [r14+LAST_FRAME]
        op_mem(o, 0xFF, 6, R14, ld::RECOVERY_PC as i32, false);
        push_r(o, RDX);
        // lea rax, [rip + recovery]
        rex_force(o, true, RAX, 0, RBP);
        o.write_u8(0x8D);
        o.write_u8(0x05); // mod 00, reg rax, rm 101 = rip-relative
        let recovery_site = o.reserve_u32();
        op_mem(o, 0x89, RAX, R14, ld::RECOVERY_PC as i32, true);
        op_mem(o, 0x89, RSP, R14, ld::LAST_FRAME as i32, true);

        // Marshal arguments from the 8-byte arg slots. The slot pointer
        // lives in rsi, which is itself an argument register: whatever
        // lands in rsi is loaded last.
        let mut next_gpr = 0usize;
        let mut next_fpr = 0usize;
        let mut rsi_arg: Option<(usize, ValType)> = None;
        for (i, ty) in sig.params.iter().enumerate() {
            let disp = (8 * i) as i32;
            match ty.class() {
                RegClass::Int => {
                    let reg = Self::ARG_GPRS[next_gpr];
                    next_gpr += 1;
                    if reg.id == RSI {
                        rsi_arg = Some((i, *ty));
                    } else {
                        op_mem(o, 0x8B, reg.id, RSI, disp, true);
                    }
                }
                RegClass::Float => {
                    let reg = Self::ARG_FPRS[next_fpr];
                    next_fpr += 1;
                    let prefix = if ty.is_64bit() { 0xF2 } else { 0xF3 };
                    sse_mem(o, prefix, 0x10, reg.id, RSI, disp);
                }
            }
        }
        if let Some((i, _)) = rsi_arg {
            op_mem(o, 0x8B, RSI, RSI, (8 * i) as i32, true);
        }

        // call body
        o.write_u8(0xE8);
        let disp = body_offset.wrapping_sub(o.pos() + 4);
        o.write_u32(disp);

        // Store the (single) result through the saved results pointer.
        if let Some(ty) = sig.results.first() {
            op_mem(o, 0x8B, RCX, RSP, 0, true);
            match ty.class() {
                RegClass::Int => op_mem(o, 0x89, RAX, RCX, 0, true),
                RegClass::Float => {
                    let prefix = if ty.is_64bit() { 0xF2 } else { 0xF3 };
                    sse_mem(o, prefix, 0x11, 0, RCX, 0);
                }
            }
        }

        // recovery: restore outer state, pop callee-saved, return. The trap
        // entry jumps here with rsp already reset to LAST_FRAME.
        let recovery_target = o.pos();
        o.patch_u32(recovery_site, recovery_target.wrapping_sub(recovery_site.pos + 4));
        op_mem(o, 0x8B, RAX, RSP, 8, true);
        op_mem(o, 0x89, RAX, R14, ld::RECOVERY_PC as i32, true);
        op_mem(o, 0x8B, RAX, RSP, 16, true);
        op_mem(o, 0x89, RAX, R14, ld::LAST_FRAME as i32, true);
        Self::adjust_sp(o, 24);
        for r in [R15, R14, R13, R12, RBX] {
            pop_r(o, r);
        }
        pop_r(o, RBP);
        o.write_u8(0xC3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_encodings() {
        let mut o = Output::new();
        mov_ri32(&mut o, RAX, 7);
        assert_eq!(o.bytes(), &[0xB8, 7, 0, 0, 0]);

        let mut o = Output::new();
        mov_ri64(&mut o, R10, 0x1122_3344_5566_7788);
        assert_eq!(
            o.bytes(),
            &[0x49, 0xBA, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );

        // add rbx, rsi
        let mut o = Output::new();
        op_rr(&mut o, 0x01, RSI, RBX, true);
        assert_eq!(o.bytes(), &[0x48, 0x01, 0xF3]);

        // mov eax, [rbp - 8]
        let mut o = Output::new();
        op_mem(&mut o, 0x8B, RAX, RBP, -8, false);
        assert_eq!(o.bytes(), &[0x8B, 0x45, 0xF8]);

        // mov rax, [rsp]
        let mut o = Output::new();
        op_mem(&mut o, 0x8B, RAX, RSP, 0, true);
        assert_eq!(o.bytes(), &[0x48, 0x8B, 0x04, 0x24]);

        // mov eax, [r14 + 0x100]
        let mut o = Output::new();
        op_mem(&mut o, 0x8B, RAX, R14, 0x100, false);
        assert_eq!(o.bytes(), &[0x41, 0x8B, 0x86, 0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn jump_patching_is_self_relative() {
        let mut o = Output::new();
        let site = jmp(&mut o);
        o.write_u8(0x90);
        bind(&mut o, site);
        // jmp rel32 with disp 1 (skips the nop)
        assert_eq!(o.bytes(), &[0xE9, 1, 0, 0, 0, 0x90]);
    }

    #[test]
    fn sib_indexed_access() {
        // mov eax, [r14 + rcx*4 + 0x78]
        let mut o = Output::new();
        rex(&mut o, false, RAX, RCX, R14);
        o.write_u8(0x8B);
        modrm_mem_index(&mut o, RAX, R14, RCX, 2, 0x78);
        assert_eq!(o.bytes(), &[0x41, 0x8B, 0x44, 0x8E, 0x78]);
    }
}

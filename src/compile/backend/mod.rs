mod aarch64;
mod masm;
mod rv32;
pub mod softfloat;
mod x64;

pub use masm::Masm;

use crate::compile::module_info::FuncSignature;
use crate::compile::output::{Output, PatchSite};
use crate::compile::regalloc::Reg;
use crate::traps::TrapCode;
use crate::values::ValType;

cfg_if::cfg_if! {
    if #[cfg(feature = "cross-rv32")] {
        pub type ActiveIsa = rv32::Rv32;
    } else if #[cfg(target_arch = "aarch64")] {
        pub type ActiveIsa = aarch64::Aarch64;
    } else {
        pub type ActiveIsa = x64::X64;
    }
}

/// Two-operand integer ALU operations (`dst = dst op rhs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntUnOp {
    Clz,
    Ctz,
    Popcnt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntCmp {
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Copysign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatUn {
    Abs,
    Neg,
    Sqrt,
    Ceil,
    Floor,
    Trunc,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatCmp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// Width, extension and class of one linear-memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    I32Load8S,
    I32Load8U,
    I32Load16S,
    I32Load16U,
    I32,
    I64Load8S,
    I64Load8U,
    I64Load16S,
    I64Load16U,
    I64Load32S,
    I64Load32U,
    I64,
    F32,
    F64,
}

impl MemAccess {
    pub fn value_ty(self) -> ValType {
        match self {
            Self::I32Load8S | Self::I32Load8U | Self::I32Load16S | Self::I32Load16U | Self::I32 => {
                ValType::I32
            }
            Self::I64Load8S
            | Self::I64Load8U
            | Self::I64Load16S
            | Self::I64Load16U
            | Self::I64Load32S
            | Self::I64Load32U
            | Self::I64 => ValType::I64,
            Self::F32 => ValType::F32,
            Self::F64 => ValType::F64,
        }
    }

    /// Access width in bytes.
    pub fn width(self) -> u32 {
        match self {
            Self::I32Load8S | Self::I32Load8U | Self::I64Load8S | Self::I64Load8U => 1,
            Self::I32Load16S | Self::I32Load16U | Self::I64Load16S | Self::I64Load16U => 2,
            Self::I32 | Self::I64Load32S | Self::I64Load32U | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    pub fn signed(self) -> bool {
        matches!(
            self,
            Self::I32Load8S
                | Self::I32Load16S
                | Self::I64Load8S
                | Self::I64Load16S
                | Self::I64Load32S
        )
    }
}

/// The instruction-emission contract every ISA backend implements.
///
/// The three backends are independent modules implementing this one
/// capability set; the build selects exactly one as [`ActiveIsa`]. Methods
/// are pure encoders over [`Output`]; operand materialization, register
/// allocation and control flow live in the shared [`Masm`] layer.
///
/// Frame model shared by all backends: 8-byte slots addressed off the frame
/// pointer, slot `i` at `fp - 8*(i+1)`; locals first, operand temp slots
/// after them. `wide` selects 64-bit operation width on 64-bit targets.
pub trait Isa {
    const NAME: &'static str;

    const HAS_HARD_FLOAT: bool;
    const ACTIVE_BOUNDS_CHECK: bool;
    /// Emit explicit zero/overflow checks around integer division.
    const ACTIVE_DIV_CHECK: bool;
    /// Emit an explicit stack-fence comparison in prologues.
    const ACTIVE_STACK_CHECK: bool;
    /// 64-bit values never occupy registers; they live in frame slots and
    /// stream through the scratch pair.
    const SLOT_ONLY_64BIT: bool;
    /// Whether an idle register of the other class is a legal spill target.
    const CROSS_CLASS_SPILL: bool;
    const CODE_ALIGN: u32;
    /// Largest frame the prologue encoding can express; bigger functions
    /// are an implementation limitation.
    const MAX_FRAME_BYTES: u32;

    /// Pinned registers. All of them are callee-saved in the platform C ABI
    /// so they survive host calls.
    const LINMEM_BASE: Reg;
    const LINK_BASE: Reg;
    const LAST_FRAME: Reg;
    const STACK_FENCE: Reg;

    const ALLOC_GPRS: &'static [Reg];
    const ALLOC_FPRS: &'static [Reg];
    const ARG_GPRS: &'static [Reg];
    const ARG_FPRS: &'static [Reg];
    const RET_GPR: Reg;
    /// Second return register (64-bit results on 32-bit targets).
    const RET_GPR2: Reg;
    const RET_FPR: Reg;
    /// Scratch pair for softfloat/aux calls and internal shuffling; never
    /// allocatable.
    const SCRATCH: Reg;
    const SCRATCH2: Reg;
    const SCRATCH_FPR: Reg;
    /// Register a variable shift amount must occupy, if the ISA fixes one.
    const SHIFT_AMOUNT_REG: Option<Reg>;
    /// Allocatable register outside the argument set, used to keep a value
    /// (indirect-call index, grow delta) live across argument marshalling.
    const CALL_TEMP: Reg;
    /// Registers clobbered by the division sequence.
    const DIV_CLOBBERS: &'static [Reg];

    // ---- function scaffolding -------------------------------------------

    /// Emit the frame setup with a placeholder frame size.
    fn prologue(o: &mut Output, trap_entry: u32) -> PatchSite;
    /// Patch the placeholder once the slot high-water mark is known.
    fn patch_frame_size(o: &mut Output, site: PatchSite, frame_bytes: u32);
    fn epilogue(o: &mut Output);
    fn store_zero_slot(o: &mut Output, slot: u32);

    // ---- data movement --------------------------------------------------

    fn mov_imm(o: &mut Output, dst: Reg, bits: u64, wide: bool);
    fn fmov_imm(o: &mut Output, dst: Reg, bits: u64, is64: bool);
    /// Register-register move, including cross-class bit moves.
    fn mov_rr(o: &mut Output, dst: Reg, src: Reg, ty: ValType);
    fn load_slot(o: &mut Output, dst: Reg, slot: u32, ty: ValType);
    fn store_slot(o: &mut Output, src: Reg, slot: u32, ty: ValType);
    /// 64-bit slot access through the scratch pair (32-bit targets).
    fn copy_slot(o: &mut Output, dst_slot: u32, src_slot: u32, ty: ValType);
    fn store_slot_imm64(o: &mut Output, slot: u32, bits: u64);
    /// Register-pair slot access for 64-bit values on 32-bit targets.
    fn store_slot_pair(o: &mut Output, lo: Reg, hi: Reg, slot: u32);
    fn load_slot_pair(o: &mut Output, lo: Reg, hi: Reg, slot: u32);

    // ---- integer ALU ----------------------------------------------------

    fn int_op(o: &mut Output, op: IntOp, dst: Reg, rhs: Reg, wide: bool);
    fn int_shift(o: &mut Output, op: ShiftOp, dst: Reg, amount: Reg, wide: bool);
    /// `dst = lhs op rhs` with trap checks per the ISA's division policy.
    /// `lhs`, `rhs` and `dst` are distinct from [`Self::DIV_CLOBBERS`].
    fn int_div(
        o: &mut Output,
        signed: bool,
        rem: bool,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
        wide: bool,
        trap_entry: u32,
    );
    fn int_unop(o: &mut Output, op: IntUnOp, dst: Reg, src: Reg, wide: bool);
    fn int_cmp(o: &mut Output, cmp: IntCmp, dst: Reg, lhs: Reg, rhs: Reg, wide: bool);
    fn int_eqz(o: &mut Output, dst: Reg, src: Reg, wide: bool);
    fn extend32(o: &mut Output, dst: Reg, src: Reg, signed: bool);
    fn wrap64(o: &mut Output, dst: Reg, src: Reg);

    // ---- floating point (hard-float targets) ----------------------------

    fn float_op(o: &mut Output, op: FloatOp, dst: Reg, rhs: Reg, is64: bool);
    fn float_unop(o: &mut Output, op: FloatUn, dst: Reg, is64: bool);
    fn float_cmp(o: &mut Output, cmp: FloatCmp, dst: Reg, lhs: Reg, rhs: Reg, is64: bool);
    fn float_from_int(o: &mut Output, dst: Reg, src: Reg, to64: bool, from64: bool, signed: bool);
    /// Trapping float→int truncation (`TRUNC_OVERFLOW` on out-of-range).
    fn int_from_float(
        o: &mut Output,
        dst: Reg,
        src: Reg,
        to64: bool,
        from64: bool,
        signed: bool,
        trap_entry: u32,
    );
    fn float_promote(o: &mut Output, dst: Reg, src: Reg);
    fn float_demote(o: &mut Output, dst: Reg, src: Reg);

    // ---- 64-bit/softfloat slot operations (SLOT_ONLY_64BIT targets) -----

    /// Apply an aux operation on slot operands; the backend loads the
    /// halves through the scratch pair, computes inline or through the aux
    /// dispatch table, and stores the result slot.
    fn aux_op(
        o: &mut Output,
        op: softfloat::AuxOp,
        dst_slot: u32,
        a_slot: u32,
        b_slot: Option<u32>,
        trap_entry: u32,
    );

    // ---- linear memory --------------------------------------------------

    fn load_linmem(
        o: &mut Output,
        dst: Reg,
        addr: Reg,
        offset: u32,
        acc: MemAccess,
        trap_entry: u32,
    );
    fn store_linmem(
        o: &mut Output,
        src: Reg,
        addr: Reg,
        offset: u32,
        acc: MemAccess,
        trap_entry: u32,
    );
    /// 64-bit linear-memory access with a slot endpoint (32-bit targets).
    fn linmem64_slot(
        o: &mut Output,
        store: bool,
        addr: Reg,
        offset: u32,
        slot: u32,
        trap_entry: u32,
    );
    /// `memory.size` in pages.
    fn memory_size(o: &mut Output, dst: Reg);
    /// `memory.grow`: delta pages in `delta`, previous page count (or -1)
    /// into `dst`. Caller has spilled live state.
    fn memory_grow(o: &mut Output, dst: Reg, delta: Reg);

    // ---- link data ------------------------------------------------------

    fn load_link(o: &mut Output, dst: Reg, link_off: u32, ty: ValType);
    fn store_link(o: &mut Output, src: Reg, link_off: u32, ty: ValType);
    /// 64-bit link slot from/to a frame slot (32-bit targets).
    fn link64_slot(o: &mut Output, store: bool, link_off: u32, slot: u32);

    // ---- control flow ---------------------------------------------------

    fn jump(o: &mut Output) -> PatchSite;
    fn jump_back(o: &mut Output, target: u32);
    fn br_if_zero(o: &mut Output, cond: Reg) -> PatchSite;
    fn br_if_nonzero(o: &mut Output, cond: Reg) -> PatchSite;
    /// Bind a forward branch site to the current position.
    fn patch_jump(o: &mut Output, site: PatchSite);
    /// `if index == case then branch` used by `br_table` lowering.
    fn br_if_eq_imm(o: &mut Output, index: Reg, case: u32) -> PatchSite;

    // ---- calls ----------------------------------------------------------

    /// Direct call to a function body whose offset is patched later.
    fn call_rel(o: &mut Output) -> PatchSite;
    fn patch_call(o: &mut Output, site: PatchSite, target: u32);
    /// Call through a link-data slot (dynamic imports, host helpers).
    fn call_link_slot(o: &mut Output, link_off: u32);
    /// Call an absolute host address (static imports).
    fn call_absolute(o: &mut Output, addr: u64);
    fn adjust_sp(o: &mut Output, bytes: i32);
    fn store_sp(o: &mut Output, src: Reg, sp_off: u32, ty: ValType);
    fn load_sp(o: &mut Output, dst: Reg, sp_off: u32, ty: ValType);
    /// `dst = sp + sp_off` (V2 host-call argument vectors).
    fn sp_addr(o: &mut Output, dst: Reg, sp_off: u32);
    /// Copy a 64-bit frame slot into an sp-relative slot or back through
    /// the scratch register(s).
    fn sp_slot_copy(o: &mut Output, to_sp: bool, sp_off: u32, slot: u32);

    /// Full `call_indirect` sequence: bounds check against the table image,
    /// signature check, indirect call.
    fn call_indirect(
        o: &mut Output,
        index: Reg,
        expected_sig: u32,
        table_off: u32,
        trap_entry: u32,
    );

    // ---- runtime glue ---------------------------------------------------

    /// Unconditional trap: arguments `(linmem_base, code)`, call into the
    /// generic trap entry. Never returns.
    fn trap(o: &mut Output, code: TrapCode, trap_entry: u32);
    /// Load the interruption flag and trap with its value if non-zero.
    fn interruption_poll(o: &mut Output, trap_entry: u32);
    fn stacktrace_push(o: &mut Output, func_index: u32, cap: u32);
    fn stacktrace_pop(o: &mut Output, cap: u32);

    // ---- module-level emission ------------------------------------------

    /// The generic trap entry: spills the code into link data, abandons the
    /// wasm stack and jumps to the innermost wrapper's recovery label.
    fn emit_trap_entry(o: &mut Output);
    /// The landing pad re-entered from the fault handler for lazy commit.
    /// Targets with active bounds checks emit nothing and return `None`.
    fn emit_landing_pad(o: &mut Output, trap_entry: u32) -> Option<u32>;
    /// Export/start wrapper: `extern "C" fn(link_data, args, results)`,
    /// self-relative call into the body at `body_offset`.
    fn emit_export_wrapper(o: &mut Output, sig: &FuncSignature, body_offset: u32);
    /// Wrapper used for table-entry calls from the host; same ABI.
    fn emit_table_wrapper(o: &mut Output, sig: &FuncSignature, body_offset: u32) {
        Self::emit_export_wrapper(o, sig, body_offset);
    }
}

/// Number of argument registers consumed by a value of `ty` on this ISA.
pub fn arg_regs_needed<I: Isa>(ty: ValType) -> usize {
    if I::SLOT_ONLY_64BIT && ty.is_64bit() {
        2
    } else {
        1
    }
}

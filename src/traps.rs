use core::fmt;
use smallvec::SmallVec;

/// Why a running module stopped.
///
/// The numeric values are stable: generated code materializes them as
/// immediates and the fault layer passes them through saved registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, onlyerror::Error)]
pub enum TrapCode {
    /// No trap.
    #[error("No trap")]
    None,

    /// The `unreachable` instruction was executed.
    #[error("Unreachable instruction executed")]
    Unreachable,
    /// The imported `builtin.trap` function was called.
    #[error("builtin.trap executed")]
    BuiltinTrap,

    /// Linear memory was accessed outside the wasm-visible boundary.
    #[error("Linear memory access out of bounds")]
    LinmemOutOfBoundsAccess,
    /// Linear memory could not be grown (commit failed or limit reached).
    #[error("Could not extend linear memory")]
    LinmemCouldNotExtend,

    /// `call_indirect` with an index past the table end.
    #[error("Indirect call out of bounds (table)")]
    IndirectCallOutOfBounds,
    /// `call_indirect` hit an undefined entry or one of a different signature.
    #[error("Indirect call performed with wrong signature")]
    IndirectCallWrongSig,

    /// The host-linked memory was accessed while none is linked.
    #[error("No memory linked")]
    LinkedMemoryNotLinked,
    /// The host-linked memory was accessed out of bounds.
    #[error("Linked memory access out of bounds")]
    LinkedMemoryOutOfBounds,

    /// Integer division by zero.
    #[error("Division by zero")]
    DivZero,
    /// Signed integer division overflow (MIN / -1).
    #[error("Integer division overflow")]
    DivOverflow,
    /// Float-to-int conversion out of range.
    #[error("Float to int conversion overflow")]
    TruncOverflow,

    /// Another thread requested interruption via
    /// [`crate::Runtime::request_interruption`].
    #[error("Runtime interrupt externally triggered")]
    RuntimeInterruptRequested,

    /// The stack fence was breached (stack overflow, or not enough stack
    /// left to enter a native call).
    #[error("Stack fence breached")]
    StackFenceBreached,

    /// A late-bound import was called while its slot was still empty.
    #[error("Called function not linked")]
    CalledFunctionNotLinked,
}

impl TrapCode {
    pub const MAX: u32 = 14;

    pub fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Unreachable => 1,
            Self::BuiltinTrap => 2,
            Self::LinmemOutOfBoundsAccess => 3,
            Self::LinmemCouldNotExtend => 4,
            Self::IndirectCallOutOfBounds => 5,
            Self::IndirectCallWrongSig => 6,
            Self::LinkedMemoryNotLinked => 7,
            Self::LinkedMemoryOutOfBounds => 8,
            Self::DivZero => 9,
            Self::DivOverflow => 10,
            Self::TruncOverflow => 11,
            Self::RuntimeInterruptRequested => 12,
            Self::StackFenceBreached => 13,
            Self::CalledFunctionNotLinked => 14,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Unreachable),
            2 => Some(Self::BuiltinTrap),
            3 => Some(Self::LinmemOutOfBoundsAccess),
            4 => Some(Self::LinmemCouldNotExtend),
            5 => Some(Self::IndirectCallOutOfBounds),
            6 => Some(Self::IndirectCallWrongSig),
            7 => Some(Self::LinkedMemoryNotLinked),
            8 => Some(Self::LinkedMemoryOutOfBounds),
            9 => Some(Self::DivZero),
            10 => Some(Self::DivOverflow),
            11 => Some(Self::TruncOverflow),
            12 => Some(Self::RuntimeInterruptRequested),
            13 => Some(Self::StackFenceBreached),
            14 => Some(Self::CalledFunctionNotLinked),
            _ => None,
        }
    }
}

/// Number of stacktrace entries carried inline in a [`Trap`].
const INLINE_TRACE: usize = 8;

/// A trap carried to the nearest host boundary.
///
/// Pairs the [`TrapCode`] with a snapshot of the stacktrace ring taken at the
/// moment the trap surfaced, innermost function first.
#[derive(Debug, Clone)]
pub struct Trap {
    code: TrapCode,
    stacktrace: SmallVec<[u32; INLINE_TRACE]>,
}

impl Trap {
    pub(crate) fn new(code: TrapCode, stacktrace: impl IntoIterator<Item = u32>) -> Self {
        Self {
            code,
            stacktrace: stacktrace.into_iter().collect(),
        }
    }

    pub fn code(&self) -> TrapCode {
        self.code
    }

    /// Wasm function indices at the point of the trap, innermost first.
    ///
    /// Empty when the module was compiled with a zero stacktrace record
    /// count.
    pub fn stacktrace(&self) -> &[u32] {
        &self.stacktrace
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wasm trap: {}", self.code)?;
        if !self.stacktrace.is_empty() {
            write!(f, " (stacktrace: {:?})", self.stacktrace.as_slice())?;
        }
        Ok(())
    }
}

impl std::error::Error for Trap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for raw in 0..=TrapCode::MAX {
            let code = TrapCode::from_u32(raw).unwrap();
            assert_eq!(code.as_u32(), raw);
        }
        assert_eq!(TrapCode::from_u32(TrapCode::MAX + 1), None);
    }

    #[test]
    fn messages_are_stable() {
        assert_eq!(
            TrapCode::LinmemOutOfBoundsAccess.to_string(),
            "Linear memory access out of bounds"
        );
        assert_eq!(TrapCode::DivZero.to_string(), "Division by zero");
        assert_eq!(
            TrapCode::CalledFunctionNotLinked.to_string(),
            "Called function not linked"
        );
    }
}

use thiserror::Error;

use gostack_common::MemoryError;

use crate::runtime::VarError;

/// Errors produced while walking a stack.
///
/// Frames are value objects that may carry their error with them, so the
/// whole enum is cheaply clonable.
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum UnwindError {
    /// The return-address slot of a frame resolved to address zero.
    #[error("NULL address")]
    NullAddress,
    /// The CFA rule produced no value at the given PC.
    #[error("CFA becomes undefined at PC {0:#x}")]
    CfaUndefined(u64),
    /// The return-address rule produced no value and no link-register
    /// fallback applied.
    #[error("undefined return address at {0:#x}")]
    UndefinedReturnAddress(u64),
    /// A [`DwRule::Architectural`](crate::DwRule::Architectural) rule was
    /// encountered.
    #[error("architectural frame rules are unsupported")]
    ArchitecturalRule,
    /// A stack switch on a link-register architecture found no LR value.
    #[error("LR register is nil during stack switch")]
    LrMissingDuringSwitch,
    /// A goroutine stack switch was requested without a goroutine.
    #[error("nil goroutine when attempting to switch to goroutine stack")]
    NoGoroutine,
    /// The defer linked list violated its SP monotonicity invariant.
    #[error("corrupted defer list: SP decreased")]
    CorruptedDeferList,
    /// Frame SPs decreased while reconstructing a range-over-func stack.
    #[error("corrupted stack (SP not monotonically decreasing)")]
    NonMonotonicSp,
    /// The textual parent of a range-over-func body never appeared.
    #[error("could not find range-over-func closure parent on the stack")]
    RangeParentNotFound,
    /// The reconstructed range-over-func stack has an odd length.
    #[error("incomplete range-over-func stacktrace")]
    IncompleteRangeStack,
    /// No function covers the given PC.
    #[error("could not find function at {0:#x}")]
    FunctionNotFound(u64),
    /// A DWARF location expression could not be evaluated.
    #[error("error evaluating DWARF expression: {0}")]
    BadExpression(String),
    /// No signal-context layout is known for the OS/ISA combination.
    #[error("signal context layout unknown for {0}")]
    UnknownSignalContext(String),
    /// A register snapshot could not be obtained from the thread.
    #[error("could not read thread registers: {0}")]
    Registers(String),
    /// Reading target memory failed.
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// The runtime variable evaluator failed.
    #[error(transparent)]
    Var(#[from] VarError),
}

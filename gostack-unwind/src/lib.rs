//! Stack unwinding for debuggers of goroutine-based managed runtimes.
//!
//! Given a stopped target process this crate produces stack traces,
//! innermost frame first: it evaluates the DWARF Call Frame Information
//! register rules per PC, recognises the runtime functions that switch
//! between goroutine and system stacks (signal trampolines, `mcall`,
//! `systemstack`, cgo call-in and call-out), expands physical frames into
//! synthetic frames for inlined calls, and correlates the runtime's
//! deferred-call records and range-over-func closure bodies with the
//! frames that created them.
//!
//! The process, symbol table and variable evaluator are supplied by the
//! embedding debugger through the [`DebugInfo`], [`Memory`], [`Thread`]
//! and [`RuntimeValue`] traits; architecture policy is selected with an
//! [`arch::Arch`] implementation. Debug logging goes to the `stack`
//! tracing target.

#![warn(missing_docs)]

pub mod arch;
mod defers;
mod error;
mod evaluator;
mod frame;
mod info;
mod inline;
mod rangefunc;
mod rules;
mod runtime;
mod sigtramp;
mod walk;

pub use self::defers::{read_defers, Defer, EvalScope};
pub use self::error::UnwindError;
pub use self::evaluator::execute_frame_reg_rule;
pub use self::frame::{Frame, Location, StacktraceOptions};
pub use self::info::{Capabilities, DebugInfo, Function, InlineCall, Thread};
pub use self::rangefunc::range_func_stacktrace;
pub use self::rules::{DwRule, FrameContext};
pub use self::runtime::{Goroutine, RuntimeValue, StackBounds, VarError};
pub use self::walk::{goroutine_stacktrace, thread_stacktrace, StackIterator, Target};

pub use gostack_common::{
    read_uint_raw, CachedMemory, DwarfRegisters, Memory, MemoryError, Register, RegisterValue,
};

use std::rc::Rc;

use gostack_common::DwarfRegisters;

use crate::defers::Defer;
use crate::error::UnwindError;
use crate::info::Function;

/// A point in the source program.
#[derive(Debug, Clone, Default)]
pub struct Location {
    /// Program counter.
    pub pc: u64,
    /// Source file, `"?"` when unknown.
    pub file: String,
    /// Source line, 0 when unknown.
    pub line: u32,
    /// Enclosing function, absent for unknown PCs.
    pub func: Option<Function>,
}

/// One frame of a stack trace.
///
/// Each frame carries two locations. For the topmost frame `current` and
/// `call` are the same. Further down, `current` describes the return
/// address while `call` points at the call last executed on the frame.
/// Note that `call.pc` always equals `current.pc`, since finding the
/// address of the CALL instruction itself would require disassembly.
///
/// Synthetic frames generated for inlined calls have `current.func` set to
/// the function containing the inlining and `call.func` to the inlined
/// function.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    /// Location the frame resumes at.
    pub current: Location,
    /// Location of the logical call.
    pub call: Location,
    /// The DWARF register set as seen just after entering this function.
    pub regs: DwarfRegisters,
    /// Return address as read from the frame.
    pub ret: u64,
    /// Set if an error occurred while producing the trace.
    pub err: Option<UnwindError>,
    /// True if the frame lives on a system stack.
    pub system_stack: bool,
    /// True for synthetic frames representing inlined calls.
    pub inlined: bool,
    /// True for a concrete frame that is executing inlined calls, i.e. one
    /// with at least one inlined frame on top of it.
    pub has_inlines: bool,
    /// True for the bottommost frame of the trace.
    pub bottom: bool,
    /// The first deferred function that would run if the runtime unwound
    /// past this frame.
    pub topmost_defer: Option<Rc<Defer>>,
    /// Deferred calls created by this frame, innermost first.
    pub defers: Vec<Rc<Defer>>,
    /// High address of the goroutine stack at capture time; zero for
    /// thread traces.
    pub(crate) stack_hi: u64,
    /// A PC guaranteed to belong to the last instruction executed in this
    /// frame; usually `current.pc - 1` for non-topmost frames. Not
    /// necessarily the start of an instruction, so it never leaves the
    /// unwinder.
    pub(crate) lastpc: u64,
    /// Value of the `.closureptr` local: a negative offset from the stack
    /// high mark for stack-allocated closures, an absolute address
    /// otherwise. Correlates range-over-func bodies with their enclosing
    /// function.
    pub(crate) closure_ptr: i64,
}

impl Frame {
    /// Address of the stack frame: absolute for system-stack frames, a
    /// negative offset from the stack high mark for goroutine frames.
    pub fn frame_offset(&self) -> i64 {
        if self.system_stack {
            self.regs.cfa
        } else {
            self.regs.cfa - self.stack_hi as i64
        }
    }

    /// Value of the frame pointer, absolute or relative like
    /// [`frame_offset`](Frame::frame_offset).
    pub fn frame_pointer_offset(&self) -> i64 {
        if self.system_stack {
            self.regs.bp() as i64
        } else {
            self.regs.bp() as i64 - self.stack_hi as i64
        }
    }

    /// True if the stack-relative offset `off` falls between SP and CFA.
    pub(crate) fn contains(&self, off: i64) -> bool {
        let p = (off + self.stack_hi as i64) as u64;
        self.regs.sp() < p && p <= self.regs.cfa as u64
    }
}

/// Options controlling a goroutine stack trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct StacktraceOptions {
    /// Decorate each frame with the calls it deferred.
    pub read_defers: bool,
    /// Never attempt stack switches.
    pub simple: bool,
    /// Start from the register values saved in the runtime `g` structure
    /// instead of the thread registers.
    pub use_g_registers: bool,
}

use gimli::Register;

use gostack_common::{DwarfRegisters, Memory, RegisterValue};

use crate::error::UnwindError;
use crate::rules::FrameContext;

/// A non-owning handle to a function in the symbol table.
///
/// Handles are resolved from [`DebugInfo`] on demand and carry no
/// back-reference to their compile unit; identity is the DWARF offset of
/// the subprogram entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Fully qualified name, e.g. `runtime.sigpanic`.
    pub name: String,
    /// Entry PC.
    pub entry: u64,
    /// One past the last PC of the function body.
    pub end: u64,
    /// DWARF offset of the subprogram entry.
    pub offset: u64,
    /// True if the declaring compile unit was built with optimizations.
    pub optimized: bool,
    /// True if the enclosing image carries no debug information.
    pub stripped: bool,
}

impl Function {
    /// True if `pc` lies within the function body.
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.entry && pc < self.end
    }
}

/// One entry of the inlined-subroutine chain covering a PC.
///
/// Attributes are optional: the inline expander stops at the first entry
/// with a missing name, call file or call line.
#[derive(Debug, Clone, Default)]
pub struct InlineCall {
    /// Name of the inlined subprogram.
    pub name: Option<String>,
    /// File of the call site in the enclosing scope.
    pub call_file: Option<String>,
    /// Line of the call site in the enclosing scope.
    pub call_line: Option<u32>,
    /// DWARF offset of the inlined-subroutine entry.
    pub offset: u64,
}

/// Capability flags describing the producer of the loaded binary.
///
/// Derived from the producer string or by structural probing; the unwinder
/// consults these instead of scattering version comparisons.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// `crosscall2` saves BP and LR at the reordered save slots.
    pub crosscall2_new_save_layout: bool,
}

/// Access to the target binary's symbol table and DWARF debug information.
///
/// Implemented by the debugger's symbol layer. The unwinder holds it as a
/// trait object for the duration of one trace and caches nothing across
/// traces. Defaulted methods model the behavior of a stripped binary, so a
/// minimal implementation only has to know about functions and frame
/// descriptor entries.
pub trait DebugInfo {
    /// Resolves `pc` to source file, line and enclosing function.
    fn pc_to_line(&self, pc: u64) -> Option<(String, u32, Function)>;

    /// Returns the function covering `pc`.
    fn pc_to_func(&self, pc: u64) -> Option<Function>;

    /// Static base of the image `pc` belongs to.
    fn static_base(&self, pc: u64) -> u64;

    /// Returns the frame context established from the FDE covering `pc`,
    /// or `None` when no FDE covers it.
    fn fde_for_pc(&self, pc: u64) -> Option<FrameContext>;

    /// Looks up a function by exact name.
    fn func_named(&self, _name: &str) -> Option<Function> {
        None
    }

    /// Evaluates the function's `DW_AT_frame_base` at `pc`. Returns 0 when
    /// the image is stripped or the expression fails.
    fn frame_base(
        &self,
        _func: &Function,
        _pc: u64,
        _regs: &DwarfRegisters,
        _mem: &dyn Memory,
    ) -> i64 {
        0
    }

    /// Runs a DWARF location expression and returns its value.
    fn eval_location_expr(
        &self,
        _expr: &[u8],
        _regs: &DwarfRegisters,
        _mem: &dyn Memory,
    ) -> Result<u64, UnwindError> {
        Err(UnwindError::BadExpression(
            "no DWARF expression support".into(),
        ))
    }

    /// File and line for `pc` from the line table of the compile unit
    /// declaring `func`, keyed off the function entry. `None` when the
    /// unit has no line table.
    fn call_line(&self, _func: &Function, _pc: u64) -> Option<(String, u32)> {
        None
    }

    /// The chain of inlined subroutines containing `pc` inside `func`,
    /// innermost first. Empty when the unit has no line table or no
    /// inlining covers `pc`.
    fn inline_stack(&self, _func: &Function, _pc: u64) -> Vec<InlineCall> {
        Vec::new()
    }

    /// Value of the `.closureptr` local of `func` in the given frame, or 0
    /// when the variable is absent.
    fn closure_ptr(&self, _func: &Function, _regs: &DwarfRegisters, _mem: &dyn Memory) -> u64 {
        0
    }

    /// The function textually enclosing `func`, when `func` is the
    /// compiler-generated body closure of a range-over-func statement.
    fn range_parent(&self, _func: &Function) -> Option<Function> {
        None
    }

    /// Funcval addresses of the range-over-func body closures in scope in
    /// the given frame of `func`.
    fn range_body_closures(
        &self,
        _func: &Function,
        _regs: &DwarfRegisters,
        _mem: &dyn Memory,
    ) -> Vec<u64> {
        Vec::new()
    }

    /// File and line of the function's entry point.
    fn entry_line(&self, _func: &Function) -> (String, u32) {
        ("?".to_owned(), 0)
    }

    /// Unwraps a compiler-generated defer wrapper, returning the wrapped
    /// function. Identity for ordinary functions.
    fn unwrap_defer_wrapper(&self, func: Function) -> Option<Function> {
        Some(func)
    }

    /// Capability flags for the producer of the loaded binary.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

/// A stopped thread of the target process.
pub trait Thread {
    /// Snapshot of the thread's registers as a DWARF register file.
    ///
    /// The implementation converts from the native register layout, and may
    /// attach a write-back hook for registers the debugger changes later.
    fn dwarf_registers(&self) -> Result<DwarfRegisters, UnwindError>;

    /// Writes a register on the thread.
    fn set_reg(&self, reg: Register, value: &RegisterValue) -> Result<(), UnwindError>;
}

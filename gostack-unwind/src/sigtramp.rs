//! Recovery of the pre-signal register set from the runtime's signal
//! trampoline frame.
//!
//! When a signal is delivered the kernel places a ucontext structure on the
//! signal-handling stack and `runtime.sigtrampgo` receives a pointer to it
//! as its third argument. The interrupted user registers live at fixed
//! offsets inside that structure.

use gostack_common::{read_uint_raw, DwarfRegisters, Memory};

use crate::arch::Arch;
use crate::error::UnwindError;

// linux/amd64: third ABI0 stack argument, then mcontext gregs at +40 with
// RBP/RSP/RIP at indices 10/15/16.
const AMD64_CTX_ARG_OFFSET: u64 = 16;
const AMD64_GREGS_OFFSET: u64 = 40;
const AMD64_BP_OFFSET: u64 = AMD64_GREGS_OFFSET + 10 * 8;
const AMD64_SP_OFFSET: u64 = AMD64_GREGS_OFFSET + 15 * 8;
const AMD64_PC_OFFSET: u64 = AMD64_GREGS_OFFSET + 16 * 8;

// linux/arm64: third ABI0 stack argument, then sigcontext regs at +184
// (x0..x30 followed by sp and pc).
const ARM64_CTX_ARG_OFFSET: u64 = 24;
const ARM64_REGS_OFFSET: u64 = 184;
const ARM64_BP_OFFSET: u64 = ARM64_REGS_OFFSET + 29 * 8;
const ARM64_LR_OFFSET: u64 = ARM64_REGS_OFFSET + 30 * 8;
const ARM64_SP_OFFSET: u64 = ARM64_REGS_OFFSET + 31 * 8;
const ARM64_PC_OFFSET: u64 = ARM64_REGS_OFFSET + 32 * 8;

/// Reads the user-mode context `runtime.sigtrampgo` received and returns
/// the pre-signal register set.
///
/// `regs` must be positioned on the trampoline frame with its CFA already
/// computed; the context pointer is located through the trampoline's stack
/// argument slot relative to it.
pub(crate) fn read_context(
    arch: &dyn Arch,
    mem: &dyn Memory,
    regs: &DwarfRegisters,
) -> Result<DwarfRegisters, UnwindError> {
    let byte_order = regs.byte_order;
    let ptr = arch.ptr_size() as usize;
    let cfa = regs.cfa as u64;

    let (ctx_arg, pc_off, sp_off, bp_off, lr_off) = match arch.name() {
        "amd64" => (
            AMD64_CTX_ARG_OFFSET,
            AMD64_PC_OFFSET,
            AMD64_SP_OFFSET,
            AMD64_BP_OFFSET,
            None,
        ),
        "arm64" => (
            ARM64_CTX_ARG_OFFSET,
            ARM64_PC_OFFSET,
            ARM64_SP_OFFSET,
            ARM64_BP_OFFSET,
            Some(ARM64_LR_OFFSET),
        ),
        name => return Err(UnwindError::UnknownSignalContext(name.to_owned())),
    };

    let ctx = read_uint_raw(mem, cfa + ctx_arg, ptr, byte_order)?;
    let pc = read_uint_raw(mem, ctx + pc_off, ptr, byte_order)?;
    let sp = read_uint_raw(mem, ctx + sp_off, ptr, byte_order)?;
    let bp = read_uint_raw(mem, ctx + bp_off, ptr, byte_order)?;

    let mut out = DwarfRegisters::new(
        0,
        byte_order,
        regs.pc_reg(),
        regs.sp_reg(),
        regs.bp_reg(),
        regs.lr_reg(),
    );
    out.set_value(out.pc_reg(), pc);
    out.set_value(out.sp_reg(), sp);
    out.set_value(out.bp_reg(), bp);
    if let Some(lr_off) = lr_off {
        let lr = read_uint_raw(mem, ctx + lr_off, ptr, byte_order)?;
        out.set_value(out.lr_reg(), lr);
    }
    Ok(out)
}

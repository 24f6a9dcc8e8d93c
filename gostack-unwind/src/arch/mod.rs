//! Per-ISA unwinding policy.

mod amd64;
mod arm64;

pub use self::amd64::Amd64;
pub use self::arm64::Arm64;

use std::collections::HashMap;

use gimli::Register;

use gostack_common::{DwarfRegisters, RunTimeEndian};

use crate::info::{Capabilities, DebugInfo};
use crate::rules::{DwRule, FrameContext};
use crate::walk::StackIterator;

/// CFA offset emitted for crosscall2 before the fix-up is applied.
pub(crate) const CROSSCALL2_SP_OFFSET_BAD: i64 = 0x8;

/// Where `crosscall2` saved the registers it clobbers, in pointer-sized
/// slots from SP.
#[derive(Debug, Clone, Copy)]
pub struct Crosscall2Layout {
    /// Slot holding the caller BP.
    pub bp_slot: u64,
    /// Slot holding the caller LR.
    pub lr_slot: u64,
}

/// Architecture-specific unwinding policy.
///
/// Implementations are selected per target ISA at debugger start-up; the
/// unwinder only sees the trait object.
pub trait Arch {
    /// Short architecture name, e.g. `"amd64"`.
    fn name(&self) -> &'static str;

    /// Pointer size in bytes.
    fn ptr_size(&self) -> u64;

    /// True if the ABI routes return addresses through a link register.
    fn uses_lr(&self) -> bool;

    /// Byte width of the given DWARF register.
    fn reg_size(&self, reg: Register) -> usize;

    /// DWARF number of the program counter column.
    fn pc_reg(&self) -> Register;

    /// DWARF number of the stack pointer.
    fn sp_reg(&self) -> Register;

    /// DWARF number of the frame pointer.
    fn bp_reg(&self) -> Register;

    /// DWARF number of the link register. Meaningless when
    /// [`uses_lr`](Arch::uses_lr) is false.
    fn lr_reg(&self) -> Register;

    /// Byte order of the architecture.
    fn byte_order(&self) -> RunTimeEndian {
        RunTimeEndian::Little
    }

    /// Printable name of a DWARF register.
    fn register_name(&self, reg: Register) -> String;

    /// The frame-pointer-based context used when a PC has no FDE: the
    /// return address and the saved frame pointer sit right below the CFA,
    /// the CFA itself is recovered from BP, and SP becomes the CFA.
    fn frame_pointer_unwind_context(&self) -> FrameContext {
        let ptr = self.ptr_size() as i64;
        let mut regs = HashMap::new();
        regs.insert(self.pc_reg(), DwRule::Offset(-ptr));
        regs.insert(self.bp_reg(), DwRule::Offset(-2 * ptr));
        regs.insert(self.sp_reg(), DwRule::ValOffset(0));
        FrameContext {
            cfa: DwRule::Cfa {
                reg: self.bp_reg(),
                offset: 2 * ptr,
            },
            regs,
            ret_addr_reg: self.pc_reg(),
        }
    }

    /// Patches or synthesises the frame context for `pc`.
    fn fix_frame_unwind_context(
        &self,
        ctx: Option<FrameContext>,
        pc: u64,
        info: &dyn DebugInfo,
    ) -> FrameContext;

    /// Save slot, as an offset from SP, where `runtime.asmcgocall` stored
    /// the goroutine SP offset.
    fn cgocall_sp_offset_save_slot(&self) -> u64;

    /// Save slot, as an offset from SP, holding the previous value of
    /// `g0.sched.sp` during a cgo callback.
    fn prev_g0_sched_sp_save_slot(&self) -> u64;

    /// `crosscall2` register-save layout for the given producer
    /// capabilities; `None` when the architecture restores crosscall2
    /// frames through the CFA fix-up alone.
    fn crosscall2_layout(&self, caps: Capabilities) -> Option<Crosscall2Layout>;

    /// Detects stack-switching frames and rewrites the iterator state.
    /// Returns true when the iterator advanced past the switch on its own.
    fn switch_stack(&self, it: &mut StackIterator<'_>, caller_regs: &mut DwarfRegisters) -> bool {
        crate::walk::switch_stack(it, caller_regs)
    }
}

/// Shared context fix-up: synthesise a frame-pointer context when there is
/// no FDE or the PC sits in `runtime.sigreturn`, repair the bad crosscall2
/// CFA offset, and make sure BP and LR stay recoverable so the
/// frame-pointer chain can be followed where CFI is absent.
pub(crate) fn fix_context_common(
    arch: &dyn Arch,
    ctx: Option<FrameContext>,
    pc: u64,
    info: &dyn DebugInfo,
    crosscall2_sp_offset: i64,
) -> FrameContext {
    // The signal handler runs on the signal-handling stack without going
    // through a runtime stack switch, so nothing was saved in g.sched. The
    // only way through runtime.sigreturn is the frame-pointer chain.
    let in_sigreturn = info
        .func_named("runtime.sigreturn")
        .is_some_and(|f| f.contains(pc));

    let mut ctx = match ctx {
        Some(ctx) if !in_sigreturn => ctx,
        _ => return arch.frame_pointer_unwind_context(),
    };

    if info
        .func_named("crosscall2")
        .is_some_and(|f| f.contains(pc))
    {
        if let DwRule::Cfa { reg, offset } = ctx.cfa {
            if offset == CROSSCALL2_SP_OFFSET_BAD {
                ctx.cfa = DwRule::Cfa {
                    reg,
                    offset: offset + crosscall2_sp_offset,
                };
            }
        }
    }

    if matches!(ctx.regs.get(&arch.bp_reg()), None | Some(DwRule::Undefined)) {
        ctx.regs
            .insert(arch.bp_reg(), DwRule::FramePointer(arch.bp_reg()));
    }
    if arch.uses_lr() && matches!(ctx.regs.get(&arch.lr_reg()), None | Some(DwRule::Undefined)) {
        ctx.regs
            .insert(arch.lr_reg(), DwRule::Register(arch.lr_reg()));
    }

    ctx
}

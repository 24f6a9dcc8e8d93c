use gimli::{Register, X86_64};

use crate::info::{Capabilities, DebugInfo};
use crate::rules::FrameContext;

use super::{fix_context_common, Arch, Crosscall2Layout};

const CROSSCALL2_SP_OFFSET: i64 = 0x58;
const CGOCALL_SP_OFFSET_SAVE_SLOT: u64 = 0x28;
const PREV_G0_SCHED_SP_SAVE_SLOT: u64 = 0x30;

/// Unwinding policy for x86-64.
///
/// DWARF for x86-64 has no program counter column; the return-address
/// column doubles as it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Amd64;

impl Arch for Amd64 {
    fn name(&self) -> &'static str {
        "amd64"
    }

    fn ptr_size(&self) -> u64 {
        8
    }

    fn uses_lr(&self) -> bool {
        false
    }

    fn reg_size(&self, reg: Register) -> usize {
        match reg.0 {
            // xmm0..xmm15
            17..=32 => 16,
            // st(0)..st(7)
            33..=40 => 10,
            _ => 8,
        }
    }

    fn pc_reg(&self) -> Register {
        X86_64::RA
    }

    fn sp_reg(&self) -> Register {
        X86_64::RSP
    }

    fn bp_reg(&self) -> Register {
        X86_64::RBP
    }

    fn lr_reg(&self) -> Register {
        Register(0)
    }

    fn register_name(&self, reg: Register) -> String {
        X86_64::register_name(reg)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("r{}", reg.0))
    }

    fn fix_frame_unwind_context(
        &self,
        ctx: Option<FrameContext>,
        pc: u64,
        info: &dyn DebugInfo,
    ) -> FrameContext {
        fix_context_common(self, ctx, pc, info, CROSSCALL2_SP_OFFSET)
    }

    fn cgocall_sp_offset_save_slot(&self) -> u64 {
        CGOCALL_SP_OFFSET_SAVE_SLOT
    }

    fn prev_g0_sched_sp_save_slot(&self) -> u64 {
        PREV_G0_SCHED_SP_SAVE_SLOT
    }

    fn crosscall2_layout(&self, _caps: Capabilities) -> Option<Crosscall2Layout> {
        // Without a link register there is nothing to restore beyond the
        // CFA fix-up applied in fix_frame_unwind_context.
        None
    }
}

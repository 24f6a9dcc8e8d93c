use gimli::{AArch64, Register};

use crate::info::{Capabilities, DebugInfo};
use crate::rules::FrameContext;

use super::{fix_context_common, Arch, Crosscall2Layout};

/// DWARF column this unwinder uses for the ARM64 program counter.
pub const ARM64_PC: Register = Register(32);

// crosscall2 saves 24 register slots at the bottom of its frame.
const CROSSCALL2_SP_OFFSET: i64 = 0xc0;
const CGOCALL_SP_OFFSET_SAVE_SLOT: u64 = 0x8;
const PREV_G0_SCHED_SP_SAVE_SLOT: u64 = 0x10;

/// Unwinding policy for 64-bit ARM.
#[derive(Debug, Clone, Copy, Default)]
pub struct Arm64;

impl Arch for Arm64 {
    fn name(&self) -> &'static str {
        "arm64"
    }

    fn ptr_size(&self) -> u64 {
        8
    }

    fn uses_lr(&self) -> bool {
        true
    }

    fn reg_size(&self, reg: Register) -> usize {
        match reg.0 {
            // v0..v31
            64..=95 => 16,
            _ => 8,
        }
    }

    fn pc_reg(&self) -> Register {
        ARM64_PC
    }

    fn sp_reg(&self) -> Register {
        AArch64::SP
    }

    fn bp_reg(&self) -> Register {
        AArch64::X29
    }

    fn lr_reg(&self) -> Register {
        AArch64::X30
    }

    fn register_name(&self, reg: Register) -> String {
        if reg == ARM64_PC {
            return "pc".to_owned();
        }
        AArch64::register_name(reg)
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

    fn crosscall2_layout(&self, caps: Capabilities) -> Option<Crosscall2Layout> {
        // The order the registers are saved in moved in Go 1.19.
        let (bp_slot, lr_slot) = if caps.crosscall2_new_save_layout {
            (22, 23)
        } else {
            (14, 15)
        };
        Some(Crosscall2Layout { bp_slot, lr_slot })
    }
}

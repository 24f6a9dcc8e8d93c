//! The register-rule evaluator: applies one [`DwRule`] to recover the value
//! a register has in the caller of the current frame.

use gimli::Register;

use gostack_common::{DwarfRegisters, Memory, RegisterValue};

use crate::arch::Arch;
use crate::error::UnwindError;
use crate::info::DebugInfo;
use crate::rules::DwRule;

/// Applies `rule` for register `regnum`, returning the caller-side value.
///
/// `Ok(None)` means the register has no recoverable value in the caller.
/// Memory is read in units of the register's architectural size.
pub fn execute_frame_reg_rule(
    regnum: Register,
    rule: &DwRule,
    cfa: i64,
    regs: &DwarfRegisters,
    info: &dyn DebugInfo,
    mem: &dyn Memory,
    arch: &dyn Arch,
) -> Result<Option<RegisterValue>, UnwindError> {
    match rule {
        DwRule::Undefined => Ok(None),
        DwRule::SameVal => Ok(regs.reg(regnum).cloned()),
        DwRule::Offset(offset) => {
            read_register_at(regnum, (cfa + offset) as u64, regs, mem, arch).map(Some)
        }
        DwRule::ValOffset(offset) => Ok(Some(RegisterValue::from_u64((cfa + offset) as u64))),
        DwRule::Register(reg) => Ok(regs.reg(*reg).cloned()),
        DwRule::Expression(expr) => {
            let addr = info.eval_location_expr(expr, regs, mem)?;
            read_register_at(regnum, addr, regs, mem, arch).map(Some)
        }
        DwRule::ValExpression(expr) => {
            let value = info.eval_location_expr(expr, regs, mem)?;
            Ok(Some(RegisterValue::from_u64(value)))
        }
        DwRule::Cfa { reg, offset } => match regs.reg(*reg) {
            None => Ok(None),
            Some(base) => Ok(Some(RegisterValue::from_u64(
                (base.value as i64 + offset) as u64,
            ))),
        },
        DwRule::FramePointer(reg) => {
            let Some(cur) = regs.reg(*reg) else {
                return Ok(None);
            };
            if cur.value <= cfa as u64 {
                read_register_at(regnum, cur.value, regs, mem, arch).map(Some)
            } else {
                Ok(Some(cur.clone()))
            }
        }
        DwRule::Architectural => Err(UnwindError::ArchitecturalRule),
    }
}

/// Reads the register-sized word for `regnum` at `addr`.
fn read_register_at(
    regnum: Register,
    addr: u64,
    regs: &DwarfRegisters,
    mem: &dyn Memory,
    arch: &dyn Arch,
) -> Result<RegisterValue, UnwindError> {
    let mut buf = vec![0u8; arch.reg_size(regnum)];
    mem.read_memory(&mut buf, addr)?;
    Ok(RegisterValue::from_bytes(buf, regs.byte_order))
}

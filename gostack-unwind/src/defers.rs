//! Deferred-call records and their correlation with stack frames.

use std::rc::Rc;

use gostack_common::CachedMemory;

use crate::error::UnwindError;
use crate::frame::{Frame, Location};
use crate::info::{Function, Thread};
use crate::runtime::{Goroutine, RuntimeValue, VarError};
use crate::walk::Target;

/// Nested range-over-func defer lists are loaded with this hard cap, to
/// bound the damage a corrupted list can do.
const MAX_RANGE_FUNC_DEFERS: usize = 10;

/// One deferred call of the target runtime.
///
/// Records are materialised lazily while the list is walked and are owned
/// by the trace result afterwards.
#[derive(Debug)]
pub struct Defer {
    /// PC of the deferred function or, on newer runtimes, of a
    /// compiler-generated wrapper around it.
    pub dwrap_pc: u64,
    /// PC of the instruction that created this defer.
    pub defer_pc: u64,
    /// Value the SP register had when the function was deferred.
    pub sp: u64,
    /// Byte size of the deferred call's argument frame; always 0 on
    /// runtimes that no longer store arguments in the record.
    pub arg_size: i64,
    /// Defers created by a range-over-function iterator running on the
    /// creating frame.
    pub rangefunc: Vec<Rc<Defer>>,
    /// Set when the record could not be read back from the target.
    pub unreadable: Option<UnwindError>,
    link: Option<Rc<dyn RuntimeValue>>,
    variable: Rc<dyn RuntimeValue>,
}

impl Defer {
    /// Loads the defer record behind `variable`.
    pub(crate) fn load(variable: Rc<dyn RuntimeValue>, can_recurse: bool) -> Defer {
        let mut defer = Defer {
            dwrap_pc: 0,
            defer_pc: 0,
            sp: 0,
            arg_size: 0,
            rangefunc: Vec::new(),
            unreadable: None,
            link: None,
            variable: variable.clone(),
        };
        if let Err(err) = defer.load_fields(can_recurse) {
            defer.unreadable = Some(err.into());
        }
        defer
    }

    fn load_fields(&mut self, can_recurse: bool) -> Result<(), VarError> {
        let v = &self.variable;

        let fnvar = v.field("fn")?;
        if fnvar.is_func() {
            // Newer runtimes store the deferred function directly.
            self.dwrap_pc = fnvar.func_pc().unwrap_or(0);
        } else if let Ok(funcval) = fnvar.dereference() {
            // Older runtimes reach it through a *funcval.
            if funcval.addr() != 0 {
                if let Ok(pc) = funcval.field("fn").and_then(|f| f.uint_value()) {
                    self.dwrap_pc = pc;
                }
            }
        }

        self.defer_pc = v.field("pc")?.uint_value()?;
        self.sp = v.field("sp")?.uint_value()?;
        if let Ok(siz) = v.field("siz") {
            // Only present on runtimes that store the argument frame after
            // the record.
            self.arg_size = siz.uint_value().unwrap_or(0) as i64;
        }

        if let Ok(linkvar) = v.field("link") {
            if let Ok(next) = linkvar.dereference() {
                if next.addr() != 0 {
                    self.link = Some(next);
                }
            }
        }

        if can_recurse {
            self.load_rangefunc_list();
        }
        Ok(())
    }

    fn load_rangefunc_list(&mut self) {
        // The head of the nested list hides behind the runtime's atomic
        // pointer wrapper.
        let mut head = self.variable.clone();
        for name in ["head", "u", "value"] {
            head = match head.field(name) {
                Ok(next) => next,
                Err(_) => return,
            };
        }
        let mut node = match head.dereference() {
            Ok(node) if node.addr() != 0 => node,
            _ => return,
        };
        loop {
            let defer = Defer::load(node, false);
            let link = defer.link.clone();
            self.rangefunc.push(Rc::new(defer));
            match link {
                Some(next) if self.rangefunc.len() < MAX_RANGE_FUNC_DEFERS => node = next,
                _ => break,
            }
        }
    }

    /// Loads and returns the next record in the linked list.
    ///
    /// The list is FIFO: nodes further down were created by calls further
    /// down the stack, so their SP may never decrease. A violation marks
    /// the returned record unreadable.
    pub fn next(&self) -> Option<Defer> {
        let link = self.link.clone()?;
        let mut next = Defer::load(link, true);
        if next.sp < self.sp {
            next.unreadable = Some(UnwindError::CorruptedDeferList);
        }
        Some(next)
    }

    /// The record that would run first if the runtime unwound past the
    /// creating frame: the head of the range-over-func sublist when there
    /// is one, the record itself otherwise.
    pub(crate) fn topdefer(this: &Rc<Defer>) -> Rc<Defer> {
        match this.rangefunc.first() {
            Some(first) => first.clone(),
            None => this.clone(),
        }
    }

    /// Address of the runtime record.
    pub fn addr(&self) -> u64 {
        self.variable.addr()
    }

    /// Builds an evaluation scope positioned on the deferred call's
    /// argument frame, which the runtime stores immediately after the
    /// record itself.
    pub fn eval_scope<'a>(
        &self,
        tgt: &Target<'a>,
        thread: &dyn Thread,
    ) -> Result<EvalScope<'a>, UnwindError> {
        let mut regs = thread.dwarf_registers()?;
        let Some((file, line, func)) = tgt.info.pc_to_line(self.dwrap_pc) else {
            return Err(UnwindError::FunctionNotFound(self.dwrap_pc));
        };

        let ptr = tgt.arch.ptr_size() as i64;
        let header = self.variable.byte_size();
        if tgt.arch.uses_lr() {
            // With a link register CFA and SP coincide; the first argument
            // sits one pointer above the CFA.
            regs.cfa = self.variable.addr() as i64 + header - ptr;
            let sp_reg = regs.sp_reg();
            regs.set_value(sp_reg, regs.cfa as u64);
        } else {
            // Without one the CFA is the address of the first argument and
            // SP sits below it, where the CALL pushed the return address.
            regs.cfa = self.variable.addr() as i64 + header;
            let sp_reg = regs.sp_reg();
            let sp = (regs.cfa - ptr) as u64;
            regs.set_value(sp_reg, sp);
        }
        regs.frame_base = tgt.info.frame_base(&func, self.dwrap_pc, &regs, tgt.mem);

        let mem = CachedMemory::new(tgt.mem, regs.cfa as u64, self.arg_size.max(0) as usize);
        Ok(EvalScope {
            location: Location {
                pc: self.dwrap_pc,
                file,
                line,
                func: Some(func),
            },
            regs,
            mem,
        })
    }

    /// Resolves the deferred function, unwrapping the compiler-generated
    /// defer wrapper when there is one.
    pub fn deferred_func(&self, tgt: &Target<'_>) -> Option<(String, u32, Function)> {
        let func = tgt.info.pc_to_func(self.dwrap_pc)?;
        let func = tgt.info.unwrap_defer_wrapper(func)?;
        let (file, line) = tgt.info.entry_line(&func);
        Some((file, line, func))
    }
}

/// An evaluation scope positioned on a deferred call's argument frame.
pub struct EvalScope<'a> {
    /// Location of the deferred function.
    pub location: Location,
    /// Register file with CFA, SP and frame base pointing at the argument
    /// frame.
    pub regs: gostack_common::DwarfRegisters,
    /// Memory reader with the argument frame cached.
    pub mem: CachedMemory<'a>,
}

/// Decorates `frames` with the calls deferred by each frame.
///
/// The defer list and the frame list are walked in parallel: a record
/// belongs to the innermost frame whose CFA lies above its SP, since the
/// CFA is the SP value from before the frame's function was called.
/// System-stack frames live on a different physical stack and are skipped.
pub fn read_defers(g: &Goroutine, frames: &mut [Frame]) {
    let Some(head) = g.defer_head() else {
        return;
    };
    let mut cur = Some(Rc::new(Defer::load(head, true)));
    let mut i = 0;

    while let Some(defer) = cur {
        if i >= frames.len() {
            return;
        }
        if defer.unreadable.is_some() {
            // Stick the unreadable record into the first usable frame so it
            // can be reported, and stop.
            frames[i].defers.push(defer);
            return;
        }
        if frames[i].err.is_some() {
            return;
        }

        if frames[i].topmost_defer.is_none() {
            frames[i].topmost_defer = Some(Defer::topdefer(&defer));
        }

        if frames[i].system_stack || frames[i].inlined || defer.sp >= frames[i].regs.cfa as u64 {
            // Created by a frame further down the stack.
            i += 1;
            cur = Some(defer);
        } else {
            if defer.rangefunc.is_empty() {
                frames[i].defers.push(defer.clone());
            } else {
                frames[i].defers.extend(defer.rangefunc.iter().cloned());
            }
            cur = defer.next().map(Rc::new);
        }
    }
}

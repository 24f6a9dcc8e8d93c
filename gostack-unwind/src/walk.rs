//! The stack iterator: applies the CFI register rules across frame
//! boundaries and recognises the runtime's stack-switching functions.

use gimli::Register;
use tracing::{debug, warn};

use gostack_common::{read_uint_raw, DwarfRegisters, Memory, RegisterValue};

use crate::arch::Arch;
use crate::defers::read_defers;
use crate::error::UnwindError;
use crate::evaluator::execute_frame_reg_rule;
use crate::frame::{Frame, Location, StacktraceOptions};
use crate::info::{DebugInfo, Function, Thread};
use crate::runtime::Goroutine;
use crate::sigtramp;

/// The collaborators one trace runs against.
#[derive(Clone, Copy)]
pub struct Target<'a> {
    /// Symbol table and DWARF debug information.
    pub info: &'a dyn DebugInfo,
    /// Memory of the stopped process.
    pub mem: &'a dyn Memory,
    /// Architecture policy.
    pub arch: &'a dyn Arch,
}

/// Returns the stack trace for a stopped thread.
///
/// The locations in the result are return addresses, not call addresses.
/// `depth` bounds the number of physical frames; the innermost frame is
/// always produced.
pub fn thread_stacktrace(
    tgt: &Target<'_>,
    thread: &dyn Thread,
    depth: usize,
) -> Result<Vec<Frame>, UnwindError> {
    let mut regs = thread.dwarf_registers()?;
    regs.static_base = tgt.info.static_base(regs.pc());
    let mut it = StackIterator::new(tgt, regs, 0, None, StacktraceOptions::default());
    it.stacktrace(depth)
}

/// Returns the stack trace for a goroutine.
///
/// The locations in the result are return addresses, not call addresses.
pub fn goroutine_stacktrace(
    tgt: &Target<'_>,
    g: &Goroutine,
    depth: usize,
    opts: StacktraceOptions,
) -> Result<Vec<Frame>, UnwindError> {
    let mut it = goroutine_stack_iterator(tgt, g, opts)?;
    let mut frames = it.stacktrace(depth)?;
    if opts.read_defers {
        read_defers(g, &mut frames);
    }
    Ok(frames)
}

pub(crate) fn goroutine_stack_iterator<'a>(
    tgt: &Target<'a>,
    g: &'a Goroutine,
    opts: StacktraceOptions,
) -> Result<StackIterator<'a>, UnwindError> {
    let regs = match &g.thread {
        Some(thread) => {
            let mut regs = thread.dwarf_registers()?;
            regs.static_base = tgt.info.static_base(regs.pc());
            regs
        }
        None => {
            // The goroutine is parked: start from the scheduler registers
            // the runtime saved when it was descheduled.
            let mut regs = DwarfRegisters::new(
                tgt.info.static_base(g.pc),
                tgt.arch.byte_order(),
                tgt.arch.pc_reg(),
                tgt.arch.sp_reg(),
                tgt.arch.bp_reg(),
                tgt.arch.lr_reg(),
            );
            regs.set_value(tgt.arch.pc_reg(), g.pc);
            regs.set_value(tgt.arch.sp_reg(), g.sp);
            regs.set_value(tgt.arch.bp_reg(), g.bp);
            if tgt.arch.uses_lr() {
                regs.set_value(tgt.arch.lr_reg(), g.lr);
            }
            regs
        }
    };
    Ok(StackIterator::new(tgt, regs, g.stack.hi, Some(g), opts))
}

/// Iterates the frames of one stack, innermost first.
///
/// Created by a trace request, consumed by it, and discarded.
pub struct StackIterator<'a> {
    pub(crate) info: &'a dyn DebugInfo,
    pub(crate) mem: &'a dyn Memory,
    pub(crate) arch: &'a dyn Arch,

    pub(crate) pc: u64,
    pub(crate) regs: DwarfRegisters,
    pub(crate) top: bool,
    pub(crate) atend: bool,
    sigret: bool,
    pub(crate) frame: Frame,
    pub(crate) err: Option<UnwindError>,

    pub(crate) stack_hi: u64,
    pub(crate) system_stack: bool,

    pub(crate) g: Option<&'a Goroutine>,
    g0_sched_sp: u64,
    g0_sched_sp_loaded: bool,

    pub(crate) count: usize,
    opts: StacktraceOptions,
}

impl<'a> StackIterator<'a> {
    pub(crate) fn new(
        tgt: &Target<'a>,
        regs: DwarfRegisters,
        stack_hi: u64,
        g: Option<&'a Goroutine>,
        opts: StacktraceOptions,
    ) -> StackIterator<'a> {
        StackIterator {
            info: tgt.info,
            mem: tgt.mem,
            arch: tgt.arch,
            pc: regs.pc(),
            regs,
            top: true,
            atend: false,
            sigret: false,
            frame: Frame::default(),
            err: None,
            stack_hi,
            system_stack: g.map_or(true, |g| g.system_stack),
            g,
            g0_sched_sp: 0,
            g0_sched_sp_loaded: false,
            count: 0,
            opts,
        }
    }

    /// Points the iterator at the next frame. Returns false once the stack
    /// is exhausted or iteration failed.
    pub fn next(&mut self) -> bool {
        if self.err.is_some() || self.atend {
            return false;
        }

        if tracing::enabled!(target: "stack", tracing::Level::DEBUG) {
            let mut dump = format!(
                "current pc = {:#x} CFA = {:#x} FrameBase = {:#x}",
                self.pc, self.regs.cfa, self.regs.frame_base
            );
            for (reg, value) in self.regs.iter() {
                dump.push_str(&format!(
                    " {} = {:#x}",
                    self.arch.register_name(reg),
                    value.value
                ));
            }
            debug!(target: "stack", "{dump}");
        }

        let (caller_regs, ret, ret_addr) = self.advance_regs();
        self.frame = self.new_stackframe(ret, ret_addr);

        if tracing::enabled!(target: "stack", tracing::Level::DEBUG) {
            let fnname = self
                .frame
                .call
                .func
                .as_ref()
                .map_or("?", |f| f.name.as_str());
            debug!(
                target: "stack",
                "new frame {:#x} {}:{} at {}",
                self.frame.call.pc, self.frame.call.file, self.frame.call.line, fnname
            );
        }

        if self.current_func_is("runtime.sigtrampgo") {
            match sigtramp::read_context(self.arch, self.mem, &self.regs) {
                Ok(mut regs) => {
                    regs.static_base = self.info.static_base(regs.pc());
                    self.pc = regs.pc();
                    self.regs = regs;
                    self.top = false;
                    if let Some(g) = self.g {
                        if g.id != 0 {
                            self.system_stack = !g.stack.contains(self.regs.sp());
                        }
                    }
                    debug!(target: "stack", "sigtramp context read");
                    return true;
                }
                Err(err) => {
                    warn!(target: "stack", "could not read runtime.sigtrampgo context: {err}");
                }
            }
        }

        let mut caller_regs = caller_regs;
        if !self.opts.simple {
            let arch = self.arch;
            if arch.switch_stack(self, &mut caller_regs) {
                debug!(target: "stack", "stack switched");
                return true;
            }
        }

        if self.frame.ret == 0 {
            self.atend = true;
            return true;
        }

        self.sigret = self.current_func_is("runtime.sigpanic");
        self.top = false;
        self.pc = self.frame.ret;
        self.regs = caller_regs;
        true
    }

    /// The frame the iterator currently points at.
    pub fn frame(&self) -> Frame {
        let mut frame = self.frame.clone();
        frame.bottom = self.atend;
        frame
    }

    /// The error that stopped iteration, if any.
    pub fn err(&self) -> Option<&UnwindError> {
        self.err.as_ref()
    }

    fn current_func_is(&self, name: &str) -> bool {
        self.frame
            .current
            .func
            .as_ref()
            .is_some_and(|f| f.name == name)
    }

    /// Computes the register set of the caller of the frame at `self.pc`.
    ///
    /// `self.regs` is not advanced, except for its CFA; the new register
    /// set is applied by the caller once the stack-switch hooks have had a
    /// chance to rewrite it. Also returns the resolved return address and
    /// the address of the slot it was read from.
    pub(crate) fn advance_regs(&mut self) -> (DwarfRegisters, u64, u64) {
        let framectx = {
            let established = self.info.fde_for_pc(self.pc);
            self.arch
                .fix_frame_unwind_context(established, self.pc, self.info)
        };

        debug!(target: "stack", "advance_regs at {:#x}", self.pc);

        let cfareg = match execute_frame_reg_rule(
            Register(0),
            &framectx.cfa,
            0,
            &self.regs,
            self.info,
            self.mem,
            self.arch,
        ) {
            Ok(Some(value)) => value,
            Ok(None) | Err(_) => {
                self.err = Some(UnwindError::CfaUndefined(self.pc));
                return (DwarfRegisters::default(), 0, 0);
            }
        };
        debug!(target: "stack", "\tCFA rule {} -> {:#x}", framectx.cfa, cfareg.value);
        self.regs.cfa = cfareg.value as i64;
        let cfa = self.regs.cfa;

        let mut caller_regs = DwarfRegisters::new(
            self.info.static_base(self.pc),
            self.regs.byte_order,
            self.regs.pc_reg(),
            self.regs.sp_reg(),
            self.regs.bp_reg(),
            self.regs.lr_reg(),
        );

        // The compiler is supposed to emit a rule for the stack pointer so
        // that the CFA can be calculated from it, but neither Go nor GCC
        // do. Like GDB we treat SP = CFA as implicit.
        let sp_reg = caller_regs.sp_reg();
        caller_regs.set(sp_reg, Some(cfareg));

        let mut ret: u64 = 0;
        let mut ret_addr: u64 = 0;
        for (&reg, rule) in &framectx.regs {
            let result = execute_frame_reg_rule(
                reg,
                rule,
                cfa,
                &self.regs,
                self.info,
                self.mem,
                self.arch,
            );
            let value = match &result {
                Ok(value) => value.clone(),
                Err(_) => None,
            };
            if tracing::enabled!(target: "stack", tracing::Level::DEBUG) {
                match &value {
                    Some(v) => debug!(
                        target: "stack",
                        "\t{} rule {} -> {:#x}",
                        self.arch.register_name(reg), rule, v.value
                    ),
                    None => debug!(
                        target: "stack",
                        "\t{} rule {} -> nothing",
                        self.arch.register_name(reg), rule
                    ),
                }
            }
            caller_regs.set(reg, value.clone());

            if reg == framectx.ret_addr_reg {
                match value {
                    None => {
                        self.err = Some(match result {
                            Err(err) => err,
                            Ok(_) => UnwindError::UndefinedReturnAddress(self.pc),
                        });
                    }
                    Some(value) => {
                        ret = value.value;
                        // The runtime inserts a fake frame so the function
                        // that triggered a fatal signal appears to have
                        // called runtime.sigpanic directly. On link-register
                        // architectures the LR left in the rule is stale
                        // then; the return address has to come from the
                        // stack.
                        if self.arch.uses_lr()
                            && self
                                .frame
                                .call
                                .func
                                .as_ref()
                                .is_some_and(|f| f.name == "runtime.sigpanic")
                        {
                            match read_uint_raw(
                                self.mem,
                                cfa as u64,
                                self.arch.ptr_size() as usize,
                                self.regs.byte_order,
                            ) {
                                Ok(value) => ret = value,
                                Err(err) => self.err = Some(err.into()),
                            }
                        }
                    }
                }
                ret_addr = (cfa + rule.offset()) as u64;
            }
        }

        // Leaf functions on link-register architectures may never save LR.
        if self.arch.uses_lr() && ret == 0 {
            if let Some(lr) = self.regs.reg(self.regs.lr_reg()) {
                ret = lr.value;
            }
        }

        (caller_regs, ret, ret_addr)
    }

    fn new_stackframe(&mut self, ret: u64, ret_addr: u64) -> Frame {
        if ret_addr == 0 {
            if self.err.is_none() {
                self.err = Some(UnwindError::NullAddress);
            }
            return Frame {
                system_stack: self.system_stack,
                ..Frame::default()
            };
        }

        let (file, line, func) = match self.info.pc_to_line(self.pc) {
            Some((file, line, func)) => {
                self.regs.frame_base = self.info.frame_base(&func, self.pc, &self.regs, self.mem);
                (file, line, Some(func))
            }
            None => ("?".to_owned(), 0, None),
        };

        let mut frame = Frame {
            current: Location {
                pc: self.pc,
                file,
                line,
                func,
            },
            call: Location::default(),
            regs: self.regs.clone(),
            ret,
            err: None,
            system_stack: self.system_stack,
            inlined: false,
            has_inlines: false,
            bottom: false,
            topmost_defer: None,
            defers: Vec::new(),
            stack_hi: self.stack_hi,
            lastpc: self.pc,
            closure_ptr: 0,
        };
        let pc_reg = frame.regs.pc_reg();
        if frame.regs.reg(pc_reg).is_none() {
            frame.regs.set_value(pc_reg, self.pc);
        }
        frame.call = frame.current.clone();

        if let Some(func) = frame.current.func.clone() {
            if !self.top && self.pc != func.entry && !self.sigret {
                // If the return address is the entry point of the function
                // containing it, this is some kind of fake return frame
                // (runtime.sigreturn for example) that did not actually
                // call the current frame; there is no CALL instruction to
                // look for at pc - 1.
                match func.name.as_str() {
                    "runtime.mstart" | "runtime.systemstack_switch" => {
                        // inserted by runtime.systemstack, same situation
                    }
                    _ => {
                        frame.lastpc = self.pc - 1;
                        if let Some((file, line)) = self.info.call_line(&func, self.pc - 1) {
                            frame.call.file = file;
                            frame.call.line = line;
                        }
                    }
                }
            }

            if !func.stripped && !frame.system_stack {
                if let Some(g) = self.g {
                    let raw = self.info.closure_ptr(&func, &frame.regs, self.mem);
                    if raw != 0 {
                        frame.closure_ptr = if g.stack.contains(raw) {
                            raw as i64 - g.stack.hi as i64
                        } else {
                            raw as i64
                        };
                    }
                }
            }
        }
        frame
    }

    pub(crate) fn switch_to_goroutine_stack(&mut self) -> Result<(), UnwindError> {
        let g = self.g.ok_or(UnwindError::NoGoroutine)?;
        self.system_stack = false;
        self.top = false;
        self.pc = g.pc;
        let sp_reg = self.regs.sp_reg();
        self.regs.set_value(sp_reg, g.sp);
        let bp_reg = self.regs.bp_reg();
        self.regs.set(bp_reg, Some(RegisterValue::from_u64(g.bp)));
        if self.arch.uses_lr() {
            let lr_reg = self.regs.lr_reg();
            if self.regs.reg(lr_reg).is_none() {
                return Err(UnwindError::LrMissingDuringSwitch);
            }
            self.regs.set_value(lr_reg, g.lr);
        }
        Ok(())
    }

    pub(crate) fn try_goroutine_switch(&mut self) -> bool {
        match self.switch_to_goroutine_stack() {
            Ok(()) => true,
            Err(err) => {
                self.err = Some(err);
                false
            }
        }
    }

    pub(crate) fn load_g0_sched_sp(&mut self) {
        if self.g0_sched_sp_loaded {
            return;
        }
        self.g0_sched_sp_loaded = true;
        if let Some(g) = self.g {
            self.g0_sched_sp = g.g0_sched_sp().unwrap_or(0);
        }
    }

    pub(crate) fn stacktrace(&mut self, depth: usize) -> Result<Vec<Frame>, UnwindError> {
        let mut frames: Vec<Frame> = Vec::with_capacity(depth + 1);
        {
            let mut push = |frame: Frame| {
                frames.push(frame);
                frames.len() < depth + 1
            };
            self.stacktrace_func(&mut push);
        }

        if self.err.is_some()
            && frames.len() == 1
            && frames[0].system_stack
            && self.g.is_some()
            && !self.opts.simple
        {
            // The first frame could not be unwound but it was on a system
            // stack and a goroutine is available: restart once from the
            // goroutine's saved scheduler registers and keep tracing from
            // there.
            self.err = None;
            self.opts.use_g_registers = true;
            let mut push = |frame: Frame| {
                frames.push(frame);
                frames.len() < depth + 1
            };
            self.stacktrace_func(&mut push);
        }

        if let Some(err) = self.err.clone() {
            if frames.is_empty() {
                return Err(err);
            }
            frames.push(Frame {
                err: Some(err),
                ..Frame::default()
            });
        }
        Ok(frames)
    }

    pub(crate) fn stacktrace_func(&mut self, callback: &mut dyn FnMut(Frame) -> bool) {
        if self.opts.use_g_registers && self.g.is_some() {
            if let Err(err) = self.switch_to_goroutine_stack() {
                self.err = Some(err);
                return;
            }
            self.top = true;
        }
        while self.next() {
            let frame = self.frame();
            if !self.append_inline_calls(callback, frame) {
                break;
            }
        }
    }
}

/// Stack-switch recognition shared by the architecture adapters.
///
/// Walking backwards, a switch the runtime performed towards the system
/// stack is undone by hopping back to the goroutine stack and vice versa.
/// Returns true when the iterator advanced past the switch on its own;
/// when it returns false after rewriting `caller_regs`, iteration proceeds
/// normally on the adjusted register set.
pub(crate) fn switch_stack(it: &mut StackIterator<'_>, caller_regs: &mut DwarfRegisters) -> bool {
    let arch = it.arch;
    let ptr = arch.ptr_size();
    let byte_order = it.regs.byte_order;

    let Some(curname) = it.frame.current.func.as_ref().map(|f| f.name.clone()) else {
        if it.system_stack && it.g.is_some() && it.top {
            return it.try_goroutine_switch();
        }
        return false;
    };

    match curname.as_str() {
        "runtime.cgocallback_gofunc" | "runtime.cgocallback" if arch.uses_lr() => {
            // A C function calling back into Go went through here: the
            // runtime switched from the system stack to the goroutine
            // stack, so walking backwards the transition reads goroutine
            // stack -> system stack.
            if it.top || it.system_stack {
                return false;
            }
            it.load_g0_sched_sp();
            if it.g0_sched_sp == 0 {
                return false;
            }
            let sp_reg = it.regs.sp_reg();
            it.regs.set_value(sp_reg, it.g0_sched_sp);
            // The previous value of g0.sched.sp was saved on the stack.
            it.g0_sched_sp = read_uint_raw(
                it.mem,
                it.regs.sp() + arch.prev_g0_sched_sp_save_slot(),
                ptr as usize,
                byte_order,
            )
            .unwrap_or(0);
            it.top = false;
            let (regs_on_system_stack, ret, ret_addr) = it.advance_regs();
            it.frame = it.new_stackframe(ret, ret_addr);
            it.pc = it.frame.ret;
            it.regs = regs_on_system_stack;
            it.system_stack = true;
            true
        }

        "runtime.asmcgocall" if arch.uses_lr() => {
            if it.top || !it.system_stack {
                return false;
            }
            // asmcgocall switched from the goroutine stack to the system
            // stack to run a C function; undo it with the goroutine SP
            // offset it saved.
            let off = read_uint_raw(
                it.mem,
                it.regs.sp() + arch.cgocall_sp_offset_save_slot(),
                ptr as usize,
                byte_order,
            )
            .unwrap_or(0) as i64;
            let oldsp = it.regs.sp();
            let newsp = (it.stack_hi as i64 - off) as u64;
            let sp_reg = it.regs.sp_reg();
            it.regs.set_value(sp_reg, newsp);
            // asmcgocall can also be called from the system stack itself,
            // in which case no switch actually happened.
            if it.regs.sp() == oldsp {
                return false;
            }
            it.top = false;
            it.system_stack = false;
            // The return address is the saved LR.
            let ret_slot = it.regs.sp() + 3 * ptr;
            it.frame.ret = read_uint_raw(it.mem, ret_slot, ptr as usize, byte_order).unwrap_or(0);
            it.pc = it.frame.ret;
            true
        }

        "runtime.goexit" | "runtime.rt0_go" => {
            // Top of stack.
            it.atend = true;
            true
        }

        "runtime.mcall" => {
            if it.system_stack && it.g.is_some() {
                return it.try_goroutine_switch();
            }
            it.atend = true;
            true
        }

        "crosscall2" => {
            let Some(layout) = arch.crosscall2_layout(it.info.capabilities()) else {
                return false;
            };
            // crosscall2 saves the registers it clobbers in a fixed area at
            // the bottom of its frame. The saved frame pointer doubles as
            // the stack pointer of the calling frame.
            let sp = it.regs.sp();
            let newbp =
                read_uint_raw(it.mem, sp + ptr * layout.bp_slot, ptr as usize, byte_order)
                    .unwrap_or(0);
            let newlr =
                read_uint_raw(it.mem, sp + ptr * layout.lr_slot, ptr as usize, byte_order)
                    .unwrap_or(0);
            let bp_reg = it.regs.bp_reg();
            it.regs.set(bp_reg, Some(RegisterValue::from_u64(newbp)));
            let lr_reg = it.regs.lr_reg();
            it.regs.set_value(lr_reg, newlr);
            let sp_reg = it.regs.sp_reg();
            it.regs.set_value(sp_reg, newbp);
            it.pc = newlr;
            true
        }

        "runtime.mstart" => {
            // runtime.systemstack rewrites the system stack so that its
            // bottom-most frame appears to belong to runtime.mstart, while
            // parking the goroutine at runtime.systemstack_switch. Seeing
            // an mstart frame on the system stack of a goroutine parked
            // there means systemstack was called; continue from the parked
            // position.
            if it.top || !it.system_stack || it.g.is_none() {
                return false;
            }
            let parked_pc = it.g.map_or(0, |g| g.pc);
            match it.info.pc_to_func(parked_pc) {
                Some(func) if func.name == "runtime.systemstack_switch" => {}
                _ => return false,
            }
            it.try_goroutine_switch()
        }

        "runtime.newstack" | "runtime.systemstack" => {
            if it.system_stack && it.g.is_some() {
                return it.try_goroutine_switch();
            }
            false
        }

        _ => switch_stack_by_return(it, caller_regs),
    }
}

/// The stack-switching function may also appear as the caller, through the
/// resolved return address.
fn switch_stack_by_return(it: &mut StackIterator<'_>, caller_regs: &mut DwarfRegisters) -> bool {
    let arch = it.arch;
    let ptr = arch.ptr_size();
    let byte_order = it.regs.byte_order;

    let Some(func) = it.info.pc_to_func(it.frame.ret) else {
        return false;
    };

    match func.name.as_str() {
        "runtime.asmcgocall" => {
            if !it.system_stack {
                return false;
            }
            let off = read_uint_raw(
                it.mem,
                caller_regs.sp() + arch.cgocall_sp_offset_save_slot(),
                ptr as usize,
                byte_order,
            )
            .unwrap_or(0) as i64;
            let oldsp = caller_regs.sp();
            let newsp = (it.stack_hi as i64 - off) as u64;
            if newsp == oldsp {
                return false;
            }
            it.system_stack = false;
            let sp_reg = caller_regs.sp_reg();
            caller_regs.set_value(sp_reg, newsp);
            false
        }

        "runtime.cgocallback_gofunc" | "runtime.cgocallback" => {
            if it.system_stack {
                return false;
            }
            it.load_g0_sched_sp();
            if it.g0_sched_sp == 0 {
                return false;
            }
            // Entering the system stack.
            let sp_reg = caller_regs.sp_reg();
            caller_regs.set_value(sp_reg, it.g0_sched_sp);
            it.g0_sched_sp = read_uint_raw(
                it.mem,
                caller_regs.sp() + arch.prev_g0_sched_sp_save_slot(),
                ptr as usize,
                byte_order,
            )
            .unwrap_or(0);
            it.system_stack = true;
            false
        }

        _ => false,
    }
}

/// Builds a [`Function`] stub for an inlined call, carrying the enclosing
/// function's PC range with the inline subprogram's name and offset.
pub(crate) fn inline_function_stub(name: String, offset: u64, enclosing: &Function) -> Function {
    Function {
        name,
        entry: enclosing.entry,
        end: enclosing.end,
        offset,
        optimized: enclosing.optimized,
        stripped: enclosing.stripped,
    }
}

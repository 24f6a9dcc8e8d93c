//! Expansion of physical frames into synthetic frames for inlined calls.

use crate::frame::{Frame, Location};
use crate::walk::{inline_function_stub, StackIterator};

impl StackIterator<'_> {
    /// Delivers `frame` through `callback`, preceded by one synthetic frame
    /// per inlined call active at its call PC, inline ancestors first.
    ///
    /// Synthetic frames share the physical frame's registers, return
    /// address and current location. The physical frame's call file/line
    /// are moved outwards to each successive call site, so the concrete
    /// frame ends up reporting the place the outermost inlined call was
    /// made from. Missing DWARF attributes stop the expansion for this
    /// frame only.
    pub(crate) fn append_inline_calls(
        &mut self,
        callback: &mut dyn FnMut(Frame) -> bool,
        mut frame: Frame,
    ) -> bool {
        let Some(func) = frame.call.func.clone() else {
            self.count += 1;
            return callback(frame);
        };

        let mut callpc = frame.call.pc;
        if self.count > 0 {
            callpc = callpc.saturating_sub(1);
        }

        for entry in self.info.inline_stack(&func, callpc) {
            frame.has_inlines = true;
            let (Some(name), Some(call_file), Some(call_line)) =
                (entry.name, entry.call_file, entry.call_line)
            else {
                break;
            };

            self.count += 1;
            callback(Frame {
                current: frame.current.clone(),
                call: Location {
                    pc: frame.call.pc,
                    file: frame.call.file.clone(),
                    line: frame.call.line,
                    func: Some(inline_function_stub(name, entry.offset, &func)),
                },
                regs: frame.regs.clone(),
                ret: frame.ret,
                err: frame.err.clone(),
                system_stack: frame.system_stack,
                inlined: true,
                has_inlines: false,
                bottom: false,
                topmost_defer: None,
                defers: Vec::new(),
                stack_hi: frame.stack_hi,
                lastpc: frame.lastpc,
                closure_ptr: frame.closure_ptr,
            });

            frame.call.file = call_file;
            frame.call.line = call_line;
        }

        self.count += 1;
        callback(frame)
    }
}

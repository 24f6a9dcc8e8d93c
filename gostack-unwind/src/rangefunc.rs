//! Reconstruction of range-over-func call stacks.
//!
//! The compiler lowers the body of a `for ... := range fn` loop to a
//! closure the iterator function calls back into, so the frames of nested
//! loop bodies are not textually adjacent to their enclosing function. The
//! reconstruction stitches them back together.

use crate::defers::read_defers;
use crate::error::UnwindError;
use crate::frame::{Frame, StacktraceOptions};
use crate::info::Function;
use crate::runtime::Goroutine;
use crate::walk::{goroutine_stack_iterator, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    Normal,
    LastFrame,
    Done,
}

/// If the topmost frame of the goroutine's stack is the body closure of a
/// range-over-func statement, returns the stack of range bodies
/// interleaved with their return frames, terminated by the textually
/// enclosing function and its caller.
///
/// For example, with two nested range loops inside `f` the result is:
///
/// 1. `f-range2`
/// 2. the function that called `f-range2`
/// 3. `f-range1`
/// 4. the function that called `f-range1`
/// 5. `f`
/// 6. the function that called `f`
///
/// Returns an empty vector when the topmost frame is not a range body.
pub fn range_func_stacktrace(
    tgt: &Target<'_>,
    g: &Goroutine,
) -> Result<Vec<Frame>, UnwindError> {
    let opts = StacktraceOptions {
        simple: true,
        ..StacktraceOptions::default()
    };
    let mut it = goroutine_stack_iterator(tgt, g, opts)?;

    let mut frames: Vec<Frame> = Vec::new();
    let mut stage = Stage::Start;
    let mut add_ret_frame = false;
    let mut range_parent: Option<Function> = None;
    let mut non_monotonic_sp = false;
    let mut closure_ptr: i64 = 0;

    it.stacktrace_func(&mut |fr: Frame| {
        if let Some(prev) = frames.last() {
            if fr.regs.sp() < prev.regs.sp() {
                non_monotonic_sp = true;
                return false;
            }
        }

        if add_ret_frame {
            add_ret_frame = false;
            frames.push(fr.clone());
        }

        let Some(func) = fr.call.func.clone() else {
            if stage == Stage::Start {
                frames.clear();
                add_ret_frame = false;
                stage = Stage::Done;
                return false;
            }
            return true;
        };

        match stage {
            Stage::Start => {
                if fr.closure_ptr != 0 {
                    closure_ptr = fr.closure_ptr;
                }
                frames.push(fr.clone());
                add_ret_frame = true;
                range_parent = tgt.info.range_parent(&func);
                stage = Stage::Normal;
                // Without a closure pointer the body can only be matched to
                // its parent in optimized or inlined code.
                let mut stop = range_parent.is_none();
                if !func.optimized && !fr.inlined && closure_ptr == 0 {
                    stop = true;
                }
                if stop {
                    frames.clear();
                    add_ret_frame = false;
                    stage = Stage::Done;
                    return false;
                }
            }
            Stage::Normal => {
                let Some(parent) = range_parent.clone() else {
                    return false;
                };
                if func.offset == parent.offset && closure_ptr_ok(tgt, &frames, closure_ptr, &fr) {
                    frames.push(fr.clone());
                    stage = Stage::LastFrame;
                } else if tgt
                    .info
                    .range_parent(&func)
                    .is_some_and(|p| p.offset == parent.offset)
                    && closure_ptr_ok(tgt, &frames, closure_ptr, &fr)
                {
                    if fr.closure_ptr != 0 {
                        closure_ptr = fr.closure_ptr;
                    }
                    frames.push(fr.clone());
                    add_ret_frame = true;
                    if !func.optimized && closure_ptr == 0 {
                        frames.clear();
                        add_ret_frame = false;
                        stage = Stage::Done;
                        return false;
                    }
                } else if frames.last().is_some_and(|f| f.inlined)
                    && !fr.inlined
                    && closure_ptr == 0
                {
                    frames.clear();
                    add_ret_frame = false;
                    stage = Stage::Done;
                    return false;
                }
            }
            Stage::LastFrame => {
                frames.push(fr.clone());
                stage = Stage::Done;
                return false;
            }
            Stage::Done => return false,
        }
        true
    });

    if let Some(err) = it.err() {
        return Err(err.clone());
    }
    if non_monotonic_sp {
        return Err(UnwindError::NonMonotonicSp);
    }
    if stage != Stage::Done {
        return Err(UnwindError::RangeParentNotFound);
    }
    if frames.len() % 2 != 0 {
        return Err(UnwindError::IncompleteRangeStack);
    }
    read_defers(g, &mut frames);
    Ok(frames)
}

/// Checks that `fr` plausibly belongs to the chain identified by the last
/// observed closure pointer.
fn closure_ptr_ok(tgt: &Target<'_>, frames: &[Frame], closure_ptr: i64, fr: &Frame) -> bool {
    if fr.system_stack {
        return false;
    }
    let Some(func) = fr.call.func.as_ref() else {
        return false;
    };
    if closure_ptr == 0 && func.optimized || frames.last().is_some_and(|f| f.inlined) {
        return true;
    }
    if closure_ptr < 0 {
        // Stack allocated: it must live between this frame's SP and CFA.
        return fr.contains(closure_ptr);
    }
    // Heap allocated: some range-body closure in scope on this frame must
    // point at the same funcval.
    tgt.info
        .range_body_closures(func, &fr.regs, tgt.mem)
        .iter()
        .any(|&addr| addr as i64 == closure_ptr)
}

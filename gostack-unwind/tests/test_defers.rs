mod common;

use std::collections::HashMap;
use std::rc::Rc;

use gostack_unwind::arch::{Amd64, Arm64};
use gostack_unwind::{
    read_defers, Frame, Goroutine, MemoryError, StackBounds, Target, UnwindError,
};

use common::*;

fn frame_with_cfa(cfa: i64) -> Frame {
    let mut frame = Frame::default();
    frame.regs.cfa = cfa;
    frame
}

fn goroutine_with_defers(head: Rc<MockVar>) -> Goroutine {
    Goroutine {
        id: 1,
        pc: 0,
        sp: 0,
        bp: 0,
        lr: 0,
        stack: StackBounds { lo: 0xc0000000, hi: 0xc0001000 },
        system_stack: false,
        thread: None,
        var: Some(g_var(Some(head), 0)),
    }
}

#[test]
fn test_defers_attach_to_creating_frames() {
    let d2 = defer_node(0x9100, 0x402000, 0x401080, 0x1040, None, None);
    let d1 = defer_node(0x9000, 0x403000, 0x401040, 0x1000, Some(d2), None);
    let g = goroutine_with_defers(d1);

    let mut frames = vec![
        frame_with_cfa(0x1008),
        frame_with_cfa(0x1048),
        frame_with_cfa(0x1100),
    ];
    read_defers(&g, &mut frames);

    assert_eq!(frames[0].defers.len(), 1);
    assert_eq!(frames[0].defers[0].sp, 0x1000);
    assert_eq!(frames[0].defers[0].dwrap_pc, 0x403000);
    assert_eq!(frames[1].defers.len(), 1);
    assert_eq!(frames[1].defers[0].sp, 0x1040);
    assert!(frames[2].defers.is_empty());

    assert_eq!(frames[0].topmost_defer.as_ref().unwrap().sp, 0x1000);
    assert_eq!(frames[1].topmost_defer.as_ref().unwrap().sp, 0x1040);
    assert!(frames[2].topmost_defer.is_none());
}

#[test]
fn test_read_defers_twice_is_idempotent() {
    let d1 = defer_node(0x9000, 0x403000, 0x401040, 0x1000, None, None);
    let g = goroutine_with_defers(d1);

    let mut first = vec![frame_with_cfa(0x1008), frame_with_cfa(0x1100)];
    read_defers(&g, &mut first);
    let mut second = vec![frame_with_cfa(0x1008), frame_with_cfa(0x1100)];
    read_defers(&g, &mut second);

    assert_eq!(first[0].defers.len(), second[0].defers.len());
    assert_eq!(first[0].defers[0].sp, second[0].defers[0].sp);
    assert_eq!(first[1].defers.len(), second[1].defers.len());
}

#[test]
fn test_system_and_inlined_frames_are_skipped() {
    let d1 = defer_node(0x9000, 0x403000, 0x401040, 0x1000, None, None);
    let g = goroutine_with_defers(d1);

    let mut system = frame_with_cfa(0x1008);
    system.system_stack = true;
    let mut inlined = frame_with_cfa(0x1008);
    inlined.inlined = true;
    let mut frames = vec![system, inlined, frame_with_cfa(0x1008)];
    read_defers(&g, &mut frames);

    assert!(frames[0].defers.is_empty());
    assert!(frames[1].defers.is_empty());
    assert_eq!(frames[2].defers.len(), 1);
}

#[test]
fn test_sp_decrease_marks_list_corrupted() {
    // The second node claims an SP below the first: FIFO discipline says
    // that is impossible.
    let d2 = defer_node(0x9100, 0x402000, 0x401080, 0x0900, None, None);
    let d1 = defer_node(0x9000, 0x403000, 0x401040, 0x1000, Some(d2), None);
    let g = goroutine_with_defers(d1);

    let mut frames = vec![frame_with_cfa(0x1008), frame_with_cfa(0x1100)];
    read_defers(&g, &mut frames);

    assert_eq!(frames[0].defers.len(), 2);
    assert!(frames[0].defers[0].unreadable.is_none());
    assert!(matches!(
        frames[0].defers[1].unreadable,
        Some(UnwindError::CorruptedDeferList)
    ));
    assert!(frames[1].defers.is_empty());
}

#[test]
fn test_rangefunc_sublist_attaches_in_place() {
    let r2 = defer_node(0x9300, 0x405000, 0x401100, 0x1000, None, None);
    let r1 = defer_node(0x9200, 0x404000, 0x4010c0, 0x1000, Some(r2), None);
    let d1 = defer_node(0x9000, 0x403000, 0x401040, 0x1000, None, Some(r1));
    let g = goroutine_with_defers(d1);

    let mut frames = vec![frame_with_cfa(0x1008), frame_with_cfa(0x1100)];
    read_defers(&g, &mut frames);

    // The two nested records replace their owner in the frame.
    assert_eq!(frames[0].defers.len(), 2);
    assert_eq!(frames[0].defers[0].dwrap_pc, 0x404000);
    assert_eq!(frames[0].defers[1].dwrap_pc, 0x405000);
    // The topmost defer is the head of the sublist.
    assert_eq!(
        frames[0].topmost_defer.as_ref().unwrap().dwrap_pc,
        0x404000
    );
}

#[test]
fn test_rangefunc_sublist_is_capped() {
    // A suspiciously long nested list; the cap keeps the walk bounded.
    let mut node = defer_node(0x9200, 0x404000, 0x4010c0, 0x1000, None, None);
    for i in 0..20u64 {
        node = defer_node(0x9200 + i * 0x40, 0x404000, 0x4010c0, 0x1000, Some(node), None);
    }
    let d1 = defer_node(0x9000, 0x403000, 0x401040, 0x1000, None, Some(node));
    let g = goroutine_with_defers(d1);

    let mut frames = vec![frame_with_cfa(0x1008)];
    read_defers(&g, &mut frames);

    assert_eq!(frames[0].defers.len(), 10);
}

#[test]
fn test_old_runtime_defer_shape() {
    // Pre-1.18 layout: `fn` is a *funcval and `siz` is present.
    let funcval = Rc::new(MockVar {
        addr: 0xa000,
        fields: HashMap::from([("fn".to_owned(), scalar(0x403000))]),
        ..MockVar::default()
    });
    let mut fields = HashMap::new();
    fields.insert("fn".to_owned(), pointer(Some(funcval)));
    fields.insert("pc".to_owned(), scalar(0x401040));
    fields.insert("sp".to_owned(), scalar(0x1000));
    fields.insert("siz".to_owned(), scalar(24));
    fields.insert("link".to_owned(), pointer(None));
    let d1 = Rc::new(MockVar {
        addr: 0x9000,
        size: 64,
        fields,
        ..MockVar::default()
    });
    let g = goroutine_with_defers(d1);

    let mut frames = vec![frame_with_cfa(0x1008)];
    read_defers(&g, &mut frames);

    assert_eq!(frames[0].defers.len(), 1);
    let d = &frames[0].defers[0];
    assert_eq!(d.dwrap_pc, 0x403000);
    assert_eq!(d.arg_size, 24);
}

#[test]
fn test_eval_scope_points_at_argument_frame() {
    let mut info = MockInfo::default();
    info.func("main.deferred", 0x403000, 0x403100);
    info.line(0x403000, "main.go", 20);
    let mut mem = MockMemory::default();
    // The cached argument frame.
    for off in (0u64..24).step_by(8) {
        mem.write_u64(0x9030 + off, 0x1111);
    }

    let d2 = defer_node(0x9100, 0x402000, 0x401080, 0x1040, None, None);
    let funcval = Rc::new(MockVar {
        addr: 0xa000,
        fields: HashMap::from([("fn".to_owned(), scalar(0x403000))]),
        ..MockVar::default()
    });
    let mut fields = HashMap::new();
    fields.insert("fn".to_owned(), pointer(Some(funcval)));
    fields.insert("pc".to_owned(), scalar(0x401040));
    fields.insert("sp".to_owned(), scalar(0x1000));
    fields.insert("siz".to_owned(), scalar(24));
    fields.insert("link".to_owned(), pointer(Some(d2)));
    let d1 = Rc::new(MockVar {
        addr: 0x9000,
        size: 48,
        fields,
        ..MockVar::default()
    });
    let g = goroutine_with_defers(d1);

    let mut frames = vec![frame_with_cfa(0x1008)];
    read_defers(&g, &mut frames);
    let d = frames[0].defers[0].clone();

    // Without a link register the CFA is the first argument and SP sits
    // below the pushed return address.
    let tgt = Target { info: &info, mem: &mem, arch: &Amd64 };
    let thread = MockThread { regs: amd64_regs(0x403000, 0x1000) };
    let scope = d.eval_scope(&tgt, &thread).unwrap();
    assert_eq!(scope.regs.cfa, 0x9000 + 48);
    assert_eq!(scope.regs.sp(), (0x9000 + 48 - 8) as u64);
    assert_eq!(scope.location.pc, 0x403000);
    assert_eq!(
        scope.location.func.as_ref().unwrap().name,
        "main.deferred"
    );
    use gostack_unwind::Memory;
    let mut buf = [0u8; 8];
    scope.mem.read_memory(&mut buf, 0x9030).unwrap();
    assert_eq!(u64::from_le_bytes(buf), 0x1111);

    // With one, CFA and SP coincide one pointer below the argument frame.
    let tgt = Target { info: &info, mem: &mem, arch: &Arm64 };
    let thread = MockThread { regs: arm64_regs(0x403000, 0x1000, 0, 0) };
    let scope = d.eval_scope(&tgt, &thread).unwrap();
    assert_eq!(scope.regs.cfa, 0x9000 + 48 - 8);
    assert_eq!(scope.regs.sp(), (0x9000 + 48 - 8) as u64);
}

#[test]
fn test_deferred_func_resolution() {
    let mut info = MockInfo::default();
    info.func("main.deferred", 0x403000, 0x403100);
    info.line(0x403000, "main.go", 20);
    let mem = MockMemory::default();

    let d1 = defer_node(0x9000, 0x403010, 0x401040, 0x1000, None, None);
    let g = goroutine_with_defers(d1);
    let mut frames = vec![frame_with_cfa(0x1008)];
    read_defers(&g, &mut frames);

    let tgt = Target { info: &info, mem: &mem, arch: &Amd64 };
    let (file, line, func) = frames[0].defers[0].deferred_func(&tgt).unwrap();
    assert_eq!(file, "main.go");
    assert_eq!(line, 20);
    assert_eq!(func.name, "main.deferred");
}

#[test]
fn test_unreadable_memory_error_is_cloneable() {
    // Frames carry their errors by value.
    let err = UnwindError::Memory(MemoryError::UnreadableAddress { addr: 0x10, len: 8 });
    let copy = err.clone();
    assert_eq!(copy.to_string(), "could not read 8 bytes at 0x10");
}

//! A synthetic target for exercising the unwinder: in-memory debug info,
//! memory image and runtime variables.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use gostack_unwind::{
    Capabilities, DebugInfo, DwRule, DwarfRegisters, Frame, FrameContext, Function, InlineCall,
    Memory, MemoryError, Register, RegisterValue, RuntimeValue, Thread, UnwindError, VarError,
};

use gimli::RunTimeEndian;

pub const AMD64_PC: Register = Register(16);
pub const AMD64_SP: Register = Register(7);
pub const AMD64_BP: Register = Register(6);

pub const ARM64_PC: Register = Register(32);
pub const ARM64_SP: Register = Register(31);
pub const ARM64_BP: Register = Register(29);
pub const ARM64_LR: Register = Register(30);

/// Byte-addressed sparse memory image.
#[derive(Default)]
pub struct MockMemory {
    bytes: BTreeMap<u64, u8>,
}

impl MockMemory {
    pub fn write_u64(&mut self, addr: u64, value: u64) {
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.bytes.insert(addr + i as u64, *b);
        }
    }
}

impl Memory for MockMemory {
    fn read_memory(&self, buf: &mut [u8], addr: u64) -> Result<(), MemoryError> {
        let len = buf.len();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = *self
                .bytes
                .get(&(addr + i as u64))
                .ok_or(MemoryError::UnreadableAddress { addr, len })?;
        }
        Ok(())
    }
}

/// Debug information assembled by hand.
#[derive(Default)]
pub struct MockInfo {
    pub funcs: Vec<Function>,
    /// pc -> (file, line)
    pub lines: HashMap<u64, (String, u32)>,
    /// [start, end) -> established frame context
    pub fdes: Vec<(u64, u64, FrameContext)>,
    /// function offset -> inline chain, innermost first
    pub inlines: HashMap<u64, Vec<InlineCall>>,
    /// function offset -> raw .closureptr value
    pub closure_ptrs: HashMap<u64, u64>,
    /// function offset -> offset of the textually enclosing function
    pub range_parents: HashMap<u64, u64>,
    /// function offset -> funcval addresses of range-body closures in scope
    pub body_closures: HashMap<u64, Vec<u64>>,
    pub static_base: u64,
    pub caps: Capabilities,
}

impl MockInfo {
    pub fn func(&mut self, name: &str, entry: u64, end: u64) -> Function {
        let func = Function {
            name: name.to_owned(),
            entry,
            end,
            offset: entry,
            optimized: false,
            stripped: false,
        };
        self.funcs.push(func.clone());
        func
    }

    pub fn line(&mut self, pc: u64, file: &str, line: u32) {
        self.lines.insert(pc, (file.to_owned(), line));
    }

    pub fn func_by_name(&self, name: &str) -> Function {
        self.funcs
            .iter()
            .find(|f| f.name == name)
            .cloned()
            .expect("unknown function")
    }

    pub fn fde(&mut self, start: u64, end: u64, ctx: FrameContext) {
        self.fdes.push((start, end, ctx));
    }
}

impl DebugInfo for MockInfo {
    fn pc_to_line(&self, pc: u64) -> Option<(String, u32, Function)> {
        let func = self.funcs.iter().find(|f| f.contains(pc))?.clone();
        let (file, line) = self
            .lines
            .get(&pc)
            .cloned()
            .unwrap_or_else(|| ("?".to_owned(), 0));
        Some((file, line, func))
    }

    fn pc_to_func(&self, pc: u64) -> Option<Function> {
        self.funcs.iter().find(|f| f.contains(pc)).cloned()
    }

    fn static_base(&self, _pc: u64) -> u64 {
        self.static_base
    }

    fn fde_for_pc(&self, pc: u64) -> Option<FrameContext> {
        self.fdes
            .iter()
            .find(|(start, end, _)| pc >= *start && pc < *end)
            .map(|(_, _, ctx)| ctx.clone())
    }

    fn func_named(&self, name: &str) -> Option<Function> {
        self.funcs.iter().find(|f| f.name == name).cloned()
    }

    fn call_line(&self, _func: &Function, pc: u64) -> Option<(String, u32)> {
        self.lines.get(&pc).cloned()
    }

    fn inline_stack(&self, func: &Function, _pc: u64) -> Vec<InlineCall> {
        self.inlines.get(&func.offset).cloned().unwrap_or_default()
    }

    fn closure_ptr(&self, func: &Function, _regs: &DwarfRegisters, _mem: &dyn Memory) -> u64 {
        self.closure_ptrs.get(&func.offset).copied().unwrap_or(0)
    }

    fn range_parent(&self, func: &Function) -> Option<Function> {
        let parent = self.range_parents.get(&func.offset)?;
        self.funcs.iter().find(|f| f.offset == *parent).cloned()
    }

    fn range_body_closures(
        &self,
        func: &Function,
        _regs: &DwarfRegisters,
        _mem: &dyn Memory,
    ) -> Vec<u64> {
        self.body_closures
            .get(&func.offset)
            .cloned()
            .unwrap_or_default()
    }

    fn entry_line(&self, func: &Function) -> (String, u32) {
        self.lines
            .get(&func.entry)
            .cloned()
            .unwrap_or_else(|| ("?".to_owned(), 0))
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }
}

pub struct MockThread {
    pub regs: DwarfRegisters,
}

impl Thread for MockThread {
    fn dwarf_registers(&self) -> Result<DwarfRegisters, UnwindError> {
        Ok(self.regs.clone())
    }

    fn set_reg(&self, _reg: Register, _value: &RegisterValue) -> Result<(), UnwindError> {
        Ok(())
    }
}

pub fn amd64_regs(pc: u64, sp: u64) -> DwarfRegisters {
    let mut regs = DwarfRegisters::new(
        0,
        RunTimeEndian::Little,
        AMD64_PC,
        AMD64_SP,
        AMD64_BP,
        Register(0),
    );
    regs.set_value(AMD64_PC, pc);
    regs.set_value(AMD64_SP, sp);
    regs
}

pub fn arm64_regs(pc: u64, sp: u64, bp: u64, lr: u64) -> DwarfRegisters {
    let mut regs = DwarfRegisters::new(
        0,
        RunTimeEndian::Little,
        ARM64_PC,
        ARM64_SP,
        ARM64_BP,
        ARM64_LR,
    );
    regs.set_value(ARM64_PC, pc);
    regs.set_value(ARM64_SP, sp);
    regs.set_value(ARM64_BP, bp);
    regs.set_value(ARM64_LR, lr);
    regs
}

/// The frame context Go emits on amd64: CFA = RSP + `cfa_off`, return
/// address saved right below it.
pub fn go_amd64_fde(cfa_off: i64) -> FrameContext {
    let mut regs = HashMap::new();
    regs.insert(AMD64_PC, DwRule::Offset(-8));
    FrameContext {
        cfa: DwRule::Cfa {
            reg: AMD64_SP,
            offset: cfa_off,
        },
        regs,
        ret_addr_reg: AMD64_PC,
    }
}

/// An arm64 frame context with an explicit rule for the LR column.
pub fn go_arm64_fde(cfa_off: i64, lr_rule: DwRule) -> FrameContext {
    let mut regs = HashMap::new();
    regs.insert(ARM64_LR, lr_rule);
    FrameContext {
        cfa: DwRule::Cfa {
            reg: ARM64_SP,
            offset: cfa_off,
        },
        regs,
        ret_addr_reg: ARM64_LR,
    }
}

/// One value in the synthetic target.
#[derive(Debug, Clone, Default)]
pub struct MockVar {
    pub addr: u64,
    pub size: i64,
    pub value: u64,
    pub func: bool,
    pub func_pc: u64,
    pub fields: HashMap<String, Rc<MockVar>>,
    pub pointee: Option<Rc<MockVar>>,
}

impl RuntimeValue for MockVar {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn byte_size(&self) -> i64 {
        self.size
    }

    fn field(&self, name: &str) -> Result<Rc<dyn RuntimeValue>, VarError> {
        self.fields
            .get(name)
            .map(|f| f.clone() as Rc<dyn RuntimeValue>)
            .ok_or_else(|| VarError::MissingField(name.to_owned()))
    }

    fn dereference(&self) -> Result<Rc<dyn RuntimeValue>, VarError> {
        match &self.pointee {
            Some(pointee) => Ok(pointee.clone()),
            None => Ok(Rc::new(MockVar::default())),
        }
    }

    fn uint_value(&self) -> Result<u64, VarError> {
        Ok(self.value)
    }

    fn is_func(&self) -> bool {
        self.func
    }

    fn func_pc(&self) -> Result<u64, VarError> {
        Ok(self.func_pc)
    }
}

pub fn scalar(value: u64) -> Rc<MockVar> {
    Rc::new(MockVar {
        value,
        ..MockVar::default()
    })
}

pub fn pointer(pointee: Option<Rc<MockVar>>) -> Rc<MockVar> {
    Rc::new(MockVar {
        value: pointee.as_ref().map_or(0, |p| p.addr),
        pointee,
        ..MockVar::default()
    })
}

/// Builds a `_defer` record in the new runtime shape (`fn` stored
/// directly).
pub fn defer_node(
    addr: u64,
    fn_pc: u64,
    defer_pc: u64,
    sp: u64,
    link: Option<Rc<MockVar>>,
    rangefunc_head: Option<Rc<MockVar>>,
) -> Rc<MockVar> {
    let mut fields = HashMap::new();
    fields.insert(
        "fn".to_owned(),
        Rc::new(MockVar {
            func: true,
            func_pc: fn_pc,
            ..MockVar::default()
        }),
    );
    fields.insert("pc".to_owned(), scalar(defer_pc));
    fields.insert("sp".to_owned(), scalar(sp));
    fields.insert("link".to_owned(), pointer(link));
    if let Some(head) = rangefunc_head {
        let value = pointer(Some(head));
        let u = Rc::new(MockVar {
            fields: HashMap::from([("value".to_owned(), value)]),
            ..MockVar::default()
        });
        let head_field = Rc::new(MockVar {
            fields: HashMap::from([("u".to_owned(), u)]),
            ..MockVar::default()
        });
        fields.insert("head".to_owned(), head_field);
    }
    Rc::new(MockVar {
        addr,
        size: 48,
        fields,
        ..MockVar::default()
    })
}

/// Builds a `runtime.g` value exposing a defer list head and `m.g0.sched.sp`.
pub fn g_var(defer_head: Option<Rc<MockVar>>, g0_sched_sp: u64) -> Rc<MockVar> {
    let sched = Rc::new(MockVar {
        fields: HashMap::from([("sp".to_owned(), scalar(g0_sched_sp))]),
        ..MockVar::default()
    });
    let g0 = Rc::new(MockVar {
        addr: 0x11000,
        fields: HashMap::from([("sched".to_owned(), sched)]),
        ..MockVar::default()
    });
    let m = Rc::new(MockVar {
        addr: 0x12000,
        fields: HashMap::from([("g0".to_owned(), pointer(Some(g0)))]),
        ..MockVar::default()
    });
    Rc::new(MockVar {
        addr: 0x13000,
        fields: HashMap::from([
            ("m".to_owned(), pointer(Some(m))),
            ("_defer".to_owned(), pointer(defer_head)),
        ]),
        ..MockVar::default()
    })
}

/// Asserts the physical shape shared by a frame and the inline frames on
/// top of it.
pub fn assert_same_physical(a: &Frame, b: &Frame) {
    assert_eq!(a.current.pc, b.current.pc);
    assert_eq!(a.ret, b.ret);
    assert_eq!(a.regs.cfa, b.regs.cfa);
    assert_eq!(a.frame_offset(), b.frame_offset());
}

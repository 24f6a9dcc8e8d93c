use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::info::Thread;

/// Errors produced by the runtime variable evaluator.
#[non_exhaustive]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VarError {
    /// The struct has no field with this name.
    #[error("no field {0}")]
    MissingField(String),
    /// Dereferencing was attempted on something that is not a pointer.
    #[error("not a pointer")]
    NotAPointer,
    /// A nil pointer was dereferenced.
    #[error("nil pointer dereference")]
    NilDereference,
    /// The value is not a scalar.
    #[error("not a scalar value")]
    NotAScalar,
    /// The value could not be loaded from the target.
    #[error("value unreadable: {0}")]
    Unreadable(String),
}

/// One value in the stopped target, as surfaced by the debugger's variable
/// evaluator.
///
/// The unwinder reads the runtime's `g`, `m`, `g0` and `_defer` structures
/// exclusively through this interface and never caches values across
/// traces.
pub trait RuntimeValue: fmt::Debug {
    /// Address of the value in target memory.
    fn addr(&self) -> u64;

    /// Byte size of the value's type.
    fn byte_size(&self) -> i64;

    /// Resolves a struct field by name.
    fn field(&self, name: &str) -> Result<Rc<dyn RuntimeValue>, VarError>;

    /// Dereferences a pointer value.
    fn dereference(&self) -> Result<Rc<dyn RuntimeValue>, VarError>;

    /// The value as an unsigned integer, for scalar values.
    fn uint_value(&self) -> Result<u64, VarError>;

    /// True if the value has function kind.
    fn is_func(&self) -> bool;

    /// Entry PC of the function a function-kind value refers to.
    fn func_pc(&self) -> Result<u64, VarError>;
}

/// Resolves a field path, dereferencing pointers along the way.
pub(crate) fn field_path(
    v: &Rc<dyn RuntimeValue>,
    path: &[&str],
) -> Result<Rc<dyn RuntimeValue>, VarError> {
    let mut cur = v.clone();
    for name in path {
        cur = match cur.field(name) {
            Ok(next) => next,
            Err(VarError::MissingField(_)) => cur.dereference()?.field(name)?,
            Err(err) => return Err(err),
        };
    }
    Ok(cur)
}

/// Bounds of a goroutine stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackBounds {
    /// Lowest address of the stack.
    pub lo: u64,
    /// One past the highest address of the stack.
    pub hi: u64,
}

impl StackBounds {
    /// True if `addr` lies within the stack.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.lo && addr < self.hi
    }
}

/// A goroutine of the target runtime, as read by the debugger.
pub struct Goroutine {
    /// Goroutine id.
    pub id: u64,
    /// Saved or current PC.
    pub pc: u64,
    /// Saved or current SP.
    pub sp: u64,
    /// Saved or current BP.
    pub bp: u64,
    /// Saved or current LR, on link-register architectures.
    pub lr: u64,
    /// Stack bounds at capture time.
    pub stack: StackBounds,
    /// True if the goroutine is currently running on the system stack.
    pub system_stack: bool,
    /// The thread the goroutine is running on, when any.
    pub thread: Option<Box<dyn Thread>>,
    /// The underlying `runtime.g` value, used to reach `m.g0.sched.sp` and
    /// the defer list.
    pub var: Option<Rc<dyn RuntimeValue>>,
}

impl fmt::Debug for Goroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Goroutine")
            .field("id", &self.id)
            .field("pc", &self.pc)
            .field("sp", &self.sp)
            .field("bp", &self.bp)
            .field("lr", &self.lr)
            .field("stack", &self.stack)
            .field("system_stack", &self.system_stack)
            .finish_non_exhaustive()
    }
}

impl Goroutine {
    /// Value of `g.m.g0.sched.sp`, when reachable.
    pub(crate) fn g0_sched_sp(&self) -> Option<u64> {
        let var = self.var.as_ref()?;
        field_path(var, &["m", "g0", "sched", "sp"])
            .ok()?
            .uint_value()
            .ok()
    }

    /// The first node of the goroutine's defer list, when any.
    pub(crate) fn defer_head(&self) -> Option<Rc<dyn RuntimeValue>> {
        let var = self.var.as_ref()?;
        let head = field_path(var, &["_defer"]).ok()?.dereference().ok()?;
        if head.addr() == 0 {
            return None;
        }
        Some(head)
    }
}

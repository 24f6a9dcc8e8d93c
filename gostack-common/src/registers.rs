use std::fmt;
use std::rc::Rc;

use gimli::{Register, RunTimeEndian};

/// Error returned by a register write-back hook.
pub type WriteBackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Hook invoked when the debugger pushes a changed register back to the
/// stopped thread.
pub type WriteBackHook = Rc<dyn Fn(Register, &RegisterValue) -> Result<(), WriteBackError>>;

/// The content of one DWARF register.
///
/// Registers wider than a machine word (vector registers) keep their raw
/// bytes; `value` always holds the leading word so address arithmetic works
/// uniformly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterValue {
    /// The register's value, truncated to a machine word.
    pub value: u64,
    /// Raw bytes for registers wider than eight bytes.
    pub bytes: Option<Vec<u8>>,
}

impl RegisterValue {
    /// Creates a register value from a machine word.
    pub fn from_u64(value: u64) -> Self {
        RegisterValue { value, bytes: None }
    }

    /// Creates a register value from raw bytes read from the target.
    pub fn from_bytes(bytes: Vec<u8>, byte_order: RunTimeEndian) -> Self {
        let value = word_from_bytes(&bytes, byte_order);
        let bytes = if bytes.len() > 8 { Some(bytes) } else { None };
        RegisterValue { value, bytes }
    }
}

/// Interprets up to the first eight bytes of `bytes` as a machine word.
pub(crate) fn word_from_bytes(bytes: &[u8], byte_order: RunTimeEndian) -> u64 {
    let take = bytes.len().min(8);
    let mut buf = [0u8; 8];
    match byte_order {
        RunTimeEndian::Little => {
            buf[..take].copy_from_slice(&bytes[..take]);
            u64::from_le_bytes(buf)
        }
        RunTimeEndian::Big => {
            buf[8 - take..].copy_from_slice(&bytes[..take]);
            u64::from_be_bytes(buf)
        }
    }
}

/// A register file indexed by DWARF register number.
///
/// Besides the registers themselves this carries the pseudo-registers the
/// unwinder maintains per frame (canonical frame address and frame base),
/// the static base of the image the current PC belongs to, and an optional
/// hook through which the debugger writes registers back to the target
/// thread. The unwinder itself never invokes the hook.
#[derive(Clone)]
pub struct DwarfRegisters {
    /// In-memory load address of the image the current PC belongs to.
    pub static_base: u64,
    /// Byte order used to decode register bytes and memory words.
    pub byte_order: RunTimeEndian,
    /// Canonical frame address of the current frame.
    pub cfa: i64,
    /// Value of the `DW_AT_frame_base` expression for the current function.
    pub frame_base: i64,
    regs: Vec<Option<RegisterValue>>,
    pc_reg: Register,
    sp_reg: Register,
    bp_reg: Register,
    lr_reg: Register,
    write_back: Option<WriteBackHook>,
}

impl DwarfRegisters {
    /// Creates an empty register file with the given special register
    /// numbers.
    pub fn new(
        static_base: u64,
        byte_order: RunTimeEndian,
        pc_reg: Register,
        sp_reg: Register,
        bp_reg: Register,
        lr_reg: Register,
    ) -> Self {
        DwarfRegisters {
            static_base,
            byte_order,
            cfa: 0,
            frame_base: 0,
            regs: Vec::new(),
            pc_reg,
            sp_reg,
            bp_reg,
            lr_reg,
            write_back: None,
        }
    }

    /// DWARF number of the program counter column.
    pub fn pc_reg(&self) -> Register {
        self.pc_reg
    }

    /// DWARF number of the stack pointer.
    pub fn sp_reg(&self) -> Register {
        self.sp_reg
    }

    /// DWARF number of the frame pointer.
    pub fn bp_reg(&self) -> Register {
        self.bp_reg
    }

    /// DWARF number of the link register.
    pub fn lr_reg(&self) -> Register {
        self.lr_reg
    }

    /// Returns the given register, if it has a value.
    pub fn reg(&self, reg: Register) -> Option<&RegisterValue> {
        self.regs.get(reg.0 as usize).and_then(Option::as_ref)
    }

    /// Stores `value` for the given register. `None` marks the register as
    /// having no recoverable value.
    pub fn set(&mut self, reg: Register, value: Option<RegisterValue>) {
        let idx = reg.0 as usize;
        if idx >= self.regs.len() {
            self.regs.resize_with(idx + 1, || None);
        }
        self.regs[idx] = value;
    }

    /// Stores a machine word for the given register.
    pub fn set_value(&mut self, reg: Register, value: u64) {
        self.set(reg, Some(RegisterValue::from_u64(value)));
    }

    /// The register's value as a machine word, 0 when absent.
    pub fn uint64_val(&self, reg: Register) -> u64 {
        self.reg(reg).map_or(0, |r| r.value)
    }

    /// Value of the program counter.
    pub fn pc(&self) -> u64 {
        self.uint64_val(self.pc_reg)
    }

    /// Value of the stack pointer.
    pub fn sp(&self) -> u64 {
        self.uint64_val(self.sp_reg)
    }

    /// Value of the frame pointer.
    pub fn bp(&self) -> u64 {
        self.uint64_val(self.bp_reg)
    }

    /// Value of the link register.
    pub fn lr(&self) -> u64 {
        self.uint64_val(self.lr_reg)
    }

    /// Iterates over the registers that have values.
    pub fn iter(&self) -> impl Iterator<Item = (Register, &RegisterValue)> {
        self.regs
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (Register(i as u16), v)))
    }

    /// Installs the hook used by [`write_back`](DwarfRegisters::write_back).
    pub fn set_write_back(&mut self, hook: WriteBackHook) {
        self.write_back = Some(hook);
    }

    /// Updates a register locally and pushes the change to the target
    /// thread through the installed hook, if any.
    pub fn write_back(&mut self, reg: Register, value: RegisterValue) -> Result<(), WriteBackError> {
        if let Some(hook) = &self.write_back {
            hook(reg, &value)?;
        }
        self.set(reg, Some(value));
        Ok(())
    }
}

impl Default for DwarfRegisters {
    fn default() -> Self {
        DwarfRegisters::new(
            0,
            RunTimeEndian::default(),
            Register(0),
            Register(0),
            Register(0),
            Register(0),
        )
    }
}

impl fmt::Debug for DwarfRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("DwarfRegisters");
        s.field("static_base", &self.static_base)
            .field("cfa", &self.cfa)
            .field("frame_base", &self.frame_base);
        for (reg, value) in self.iter() {
            s.field(&format!("r{}", reg.0), &value.value);
        }
        s.finish()
    }
}

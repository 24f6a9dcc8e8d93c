//! Common substrate for the `gostack` unwinder: the DWARF register file and
//! read access to the stopped target's memory.
//!
//! Everything in this crate is independent of the runtime being traced; the
//! unwinding logic itself lives in `gostack-unwind`.

#![warn(missing_docs)]

mod memory;
mod registers;

pub use self::memory::{read_uint_raw, CachedMemory, Memory, MemoryError};
pub use self::registers::{DwarfRegisters, RegisterValue, WriteBackError, WriteBackHook};

pub use gimli::{Register, RunTimeEndian};

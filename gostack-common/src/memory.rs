use std::cell::RefCell;

use gimli::RunTimeEndian;
use thiserror::Error;

use crate::registers::word_from_bytes;

/// Errors produced when reading the stopped target's memory.
#[non_exhaustive]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// The requested range is not mapped or not readable.
    #[error("could not read {len} bytes at {addr:#x}")]
    UnreadableAddress {
        /// Address of the failed read.
        addr: u64,
        /// Number of bytes requested.
        len: usize,
    },
    /// Fewer bytes than requested were available.
    #[error("short read at {addr:#x}: wanted {want} bytes, got {got}")]
    ShortRead {
        /// Address of the read.
        addr: u64,
        /// Number of bytes requested.
        want: usize,
        /// Number of bytes actually read.
        got: usize,
    },
}

/// Read access to the memory of the stopped target process.
///
/// All reads are synchronous; the target is presumed stopped for the
/// duration of a trace.
pub trait Memory {
    /// Fills `buf` from target memory starting at `addr`.
    fn read_memory(&self, buf: &mut [u8], addr: u64) -> Result<(), MemoryError>;
}

/// Reads an unsigned word of `size` bytes at `addr`.
pub fn read_uint_raw(
    mem: &dyn Memory,
    addr: u64,
    size: usize,
    byte_order: RunTimeEndian,
) -> Result<u64, MemoryError> {
    let mut buf = vec![0u8; size];
    mem.read_memory(&mut buf, addr)?;
    Ok(word_from_bytes(&buf, byte_order))
}

/// A best-effort cache over a [`Memory`] for one address range.
///
/// The range is fetched from the underlying reader on first use; reads that
/// fall entirely inside it are then served from the copy, everything else
/// is passed through. Scoped to a single trace.
pub struct CachedMemory<'a> {
    mem: &'a dyn Memory,
    addr: u64,
    len: usize,
    cache: RefCell<Option<Option<Vec<u8>>>>,
}

impl<'a> CachedMemory<'a> {
    /// Wraps `mem`, caching `len` bytes starting at `addr`.
    pub fn new(mem: &'a dyn Memory, addr: u64, len: usize) -> Self {
        CachedMemory {
            mem,
            addr,
            len,
            cache: RefCell::new(None),
        }
    }
}

impl Memory for CachedMemory<'_> {
    fn read_memory(&self, buf: &mut [u8], addr: u64) -> Result<(), MemoryError> {
        let end = addr.wrapping_add(buf.len() as u64);
        if self.len > 0 && addr >= self.addr && end <= self.addr + self.len as u64 {
            let mut slot = self.cache.borrow_mut();
            if slot.is_none() {
                let mut block = vec![0u8; self.len];
                *slot = Some(self.mem.read_memory(&mut block, self.addr).ok().map(|_| block));
            }
            if let Some(Some(block)) = slot.as_ref() {
                let off = (addr - self.addr) as usize;
                buf.copy_from_slice(&block[off..off + buf.len()]);
                return Ok(());
            }
        }
        self.mem.read_memory(buf, addr)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    struct CountingMemory {
        base: u64,
        data: Vec<u8>,
        reads: Cell<usize>,
    }

    impl Memory for CountingMemory {
        fn read_memory(&self, buf: &mut [u8], addr: u64) -> Result<(), MemoryError> {
            self.reads.set(self.reads.get() + 1);
            let off = addr.checked_sub(self.base).ok_or(MemoryError::UnreadableAddress {
                addr,
                len: buf.len(),
            })? as usize;
            let end = off + buf.len();
            if end > self.data.len() {
                return Err(MemoryError::UnreadableAddress { addr, len: buf.len() });
            }
            buf.copy_from_slice(&self.data[off..end]);
            Ok(())
        }
    }

    #[test]
    fn test_read_uint_raw() {
        let mem = CountingMemory {
            base: 0x1000,
            data: vec![0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0],
            reads: Cell::new(0),
        };
        let v = read_uint_raw(&mem, 0x1000, 8, RunTimeEndian::Little).unwrap();
        assert_eq!(v, 0x12345678);
        assert!(read_uint_raw(&mem, 0x2000, 8, RunTimeEndian::Little).is_err());
    }

    #[test]
    fn test_cached_memory_serves_from_cache() {
        let mem = CountingMemory {
            base: 0x1000,
            data: (0..64).collect(),
            reads: Cell::new(0),
        };
        let cached = CachedMemory::new(&mem, 0x1010, 16);

        let mut buf = [0u8; 8];
        cached.read_memory(&mut buf, 0x1010).unwrap();
        cached.read_memory(&mut buf, 0x1018).unwrap();
        assert_eq!(buf[0], 0x18);
        // One fetch for the whole cached block.
        assert_eq!(mem.reads.get(), 1);

        // Outside the cached range: passed through.
        cached.read_memory(&mut buf, 0x1000).unwrap();
        assert_eq!(mem.reads.get(), 2);
        assert_eq!(buf[0], 0);
    }
}

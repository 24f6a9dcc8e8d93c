//! gostack walks the stacks of a stopped goroutine-based runtime.
//!
//! This library implements the stack unwinder at the heart of a
//! source-level debugger for such runtimes. It is built to be used
//! independently and in parts.

#![warn(missing_docs)]

#[doc(inline)]
pub use gostack_common as common;
#[doc(inline)]
pub use gostack_unwind as unwind;

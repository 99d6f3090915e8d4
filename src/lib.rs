//! Reference counting heap for compiled programs.
//!
//! Compiled code calls into this crate to allocate, share and release heap
//! values and closures without going through the C library allocator. Memory
//! comes straight from the OS page-mapping facility:
//!
//! ```text
//! +-------------------------------+
//! | Header   | Actual memory block |
//! +-------------------------------+
//!            ^
//!            +-- the only pointer callers ever see
//! ```
//!
//! Every block carries a reference count in its header. A block whose count
//! drops to zero is reused by the next allocation that fits in it, first come
//! first served along the chain of blocks.
//!
//! The [`ffi`] module exposes the C ABI generated code links against. Rust
//! callers and tests build their own [`Heap`] instead.

mod block;
mod chain;
mod closure;
mod error;
pub mod ffi;
mod heap;
pub mod kernel;
mod rc;
mod segment;
mod utils;

pub use block::HEADER_SIZE;
pub use closure::{FunctionDescriptor, TAG_BIT, is_tagged};
pub use error::AllocError;
pub use heap::{BlockInfo, Heap, HeapConfig, HeapStats};
pub use kernel::{Kernel, PageSource};
pub use segment::SEGMENT_SIZE;
pub use utils::WORD_SIZE;

//! Read-only introspection of a slab heap living in another address space.
//!
//! [`walk::dump_heap`] resolves the size class table and record layouts
//! through the host traits in [`layout`], then walks every size class's
//! partial-slab list through a [`mem::MemoryReader`], checking each slab's
//! stored allocation count against its bitmap.

pub mod layout;
pub mod load;
pub mod mem;
pub mod os;
pub mod report;
pub mod serialize;
pub mod target;
pub mod util;
pub mod walk;

pub use layout::{SymbolResolver, TypeResolver};
pub use mem::{AccessError, MemoryImage, MemoryReader};
pub use target::TargetDescription;
pub use walk::{dump_heap, HeapReport, HeapWalker, WalkConfig, WalkError};

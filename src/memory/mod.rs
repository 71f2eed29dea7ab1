//! # Direct Memory Module
//!
//! Page buffers live outside any growable container so that a raw handle to
//! a buffer stays valid for as long as the buffer is allocated, regardless
//! of what the rest of the cache does. [`DirectMemory`] is the allocator;
//! [`PagePointer`] is the opaque handle the cache hands to callers.

mod direct;

pub use direct::{AllocationError, DirectMemory, PagePointer};

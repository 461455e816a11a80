//! Errors returned by the fallible, *constructional* edges of this crate.
//!
//! Invariant violations discovered during normal operation of the page
//! allocator or the buffer cache are programmer errors, not recoverable
//! conditions, and they `panic!` rather than returning one of these (see
//! `bget`'s exhaustion abort and `free`'s range checks). `KernelError` only
//! covers setup-time mistakes an embedder can react to before the system is
//! running.

#[repr(isize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The physical range handed to [`crate::page_alloc::PageAllocator::new`]
    /// is not page-aligned or is empty after rounding.
    InvalidPageRange = -1,
}

impl KernelError {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelError::InvalidPageRange => "invalid page range",
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

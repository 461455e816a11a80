//! Crate-wide sizing constants, centralized here rather than scattered as
//! `usize` literals through `page_alloc`/`bcache`.

/// Maximum number of CPUs the page allocator splits its free pool across.
pub const NCPU: usize = 8;

/// Number of buffers held by the block cache.
///
/// Must be large enough that a workload's concurrently-held buffers never
/// exceed it, since [`crate::bcache::BufferCache::bget`] panics on
/// exhaustion rather than waiting.
pub const NBUF: usize = 30;

/// Number of hash buckets the block cache shards its index into.
///
/// A prime is used so that sequentially-numbered blocks spread evenly
/// across buckets instead of aliasing on shared factors.
pub const NBUCKET: usize = 13;

/// Bytes per disk block.
pub const BSIZE: usize = 1024;

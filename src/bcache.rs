//! Sharded, buffered block cache.
//!
//! A single global MRU/LRU list, protected by one spin-lock and indexed by
//! position rather than pointer (walking `prev`/`next` fields stored inline
//! in a buffer array rather than through `Box`/`Rc`), scales poorly once
//! more than a couple of CPUs are reading distinct blocks concurrently: every
//! lookup serializes on the one lock regardless of which block it names.
//! This module keeps that exact index-based intrusive-list technique but
//! shards it across [`crate::param::NBUCKET`] hash buckets, each with its own
//! spin-lock, so that lookups for blocks hashing to different buckets never
//! contend.
//!
//! A lookup miss has to find a free buffer to reuse, and that buffer may
//! currently belong to a different bucket's list. Moving it across buckets
//! never holds two bucket locks at once: [`BufferCache::try_take_free`]
//! unlinks the candidate and releases its bucket's lock before the caller
//! goes on to acquire the home bucket's lock, which rules out the circular
//! wait that would otherwise make this design deadlock-prone.
//!
//! Per-buffer content is guarded by a [`crate::sleeplock::SleepLock`] (held
//! across the disk I/O in [`PinnedBuf::lock`]) rather than by the bucket
//! spin-lock, which only ever protects list bookkeeping — bucket locks would
//! otherwise be held across a blocking disk transfer, stalling every other
//! lookup that hashes to the same bucket.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::disk::BlockDevice;
use crate::param::{BSIZE, NBUCKET, NBUF};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

const fn sentinel(bucket: usize) -> usize {
    NBUF + bucket
}

fn hash(blockno: u32) -> usize {
    (blockno as usize) % NBUCKET
}

/// List bookkeeping and identity for one buffer slot.
///
/// Indices `0..NBUF` are real buffer slots; indices `NBUF..NBUF+NBUCKET` are
/// per-bucket sentinels that only ever use `prev`/`next` (their other fields
/// are unused). A slot's `prev`/`next` may only be read or written by a
/// thread holding the lock of the bucket list it is currently linked into.
struct Node {
    prev: usize,
    next: usize,
    dev: u32,
    blockno: u32,
    valid: bool,
    refcnt: usize,
}

struct BufData {
    data: [u8; BSIZE],
}

/// A cache of fixed-size disk blocks, sharded across hash buckets with
/// per-bucket spin-locks guarding list membership and a per-buffer
/// sleep-lock guarding content.
pub struct BufferCache<D: BlockDevice> {
    disk: D,
    bucket_locks: [SpinLock<()>; NBUCKET],
    nodes: UnsafeCell<[Node; NBUF + NBUCKET]>,
    data: [SleepLock<BufData>; NBUF],
}

// Safety: every `Node` is only ever touched while its owning bucket's
// `SpinLock` is held (see the invariant on `Node` above); `data` guards
// itself.
unsafe impl<D: BlockDevice> Sync for BufferCache<D> {}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(disk: D) -> Self {
        let mut nodes: [Node; NBUF + NBUCKET] = core::array::from_fn(|i| Node {
            prev: i,
            next: i,
            dev: 0,
            blockno: 0,
            valid: false,
            refcnt: 0,
        });

        for idx in 0..NBUF {
            let bucket = idx % NBUCKET;
            let head = sentinel(bucket);
            let first = nodes[head].next;
            nodes[idx].next = first;
            nodes[idx].prev = head;
            nodes[head].next = idx;
            nodes[first].prev = idx;
        }

        Self {
            disk,
            bucket_locks: core::array::from_fn(|_| SpinLock::new((), "bcache.bucket")),
            nodes: UnsafeCell::new(nodes),
            data: core::array::from_fn(|_| SleepLock::new(BufData { data: [0u8; BSIZE] }, "buf")),
        }
    }

    /// Caller must hold `bucket_locks[bucket]`.
    unsafe fn find(&self, bucket: usize, dev: u32, blockno: u32) -> Option<usize> {
        let head = sentinel(bucket);
        let nodes = unsafe { &*self.nodes.get() };
        let mut cur = nodes[head].next;
        while cur != head {
            let node = &nodes[cur];
            if node.valid && node.dev == dev && node.blockno == blockno {
                return Some(cur);
            }
            cur = node.next;
        }
        None
    }

    /// Caller must hold the lock of whichever bucket `idx` is currently
    /// linked into.
    unsafe fn unlink(&self, idx: usize) {
        let nodes = unsafe { &mut *self.nodes.get() };
        let prev = nodes[idx].prev;
        let next = nodes[idx].next;
        nodes[prev].next = next;
        nodes[next].prev = prev;
    }

    /// Caller must hold `bucket_locks[bucket]`, and `idx` must not already
    /// be linked into any list.
    unsafe fn push_front(&self, bucket: usize, idx: usize) {
        let head = sentinel(bucket);
        let nodes = unsafe { &mut *self.nodes.get() };
        let first = nodes[head].next;
        nodes[idx].next = first;
        nodes[idx].prev = head;
        nodes[head].next = idx;
        nodes[first].prev = idx;
    }

    /// Looks for an unreferenced buffer in `bucket`'s list, preferring the
    /// least-recently-used end, and unlinks it if found. Releases
    /// `bucket_locks[bucket]` before returning either way.
    fn try_take_free(&self, bucket: usize) -> Option<usize> {
        let _guard = self.bucket_locks[bucket].lock();
        let head = sentinel(bucket);
        let mut cur = unsafe { (*self.nodes.get())[head].prev };
        while cur != head {
            let (refcnt, prev) = {
                let node = unsafe { &(*self.nodes.get())[cur] };
                (node.refcnt, node.prev)
            };
            if refcnt == 0 {
                unsafe { self.unlink(cur) };
                return Some(cur);
            }
            cur = prev;
        }
        None
    }

    /// Finds a free buffer, checking `home` first and then every other
    /// bucket in turn.
    ///
    /// # Panics
    /// Panics if every buffer in every bucket is currently referenced — the
    /// cache has no waiting discipline for exhaustion.
    fn evict(&self, home: usize) -> usize {
        if let Some(idx) = self.try_take_free(home) {
            return idx;
        }
        for offset in 1..NBUCKET {
            let other = (home + offset) % NBUCKET;
            if let Some(idx) = self.try_take_free(other) {
                return idx;
            }
        }
        panic!("bget: no free buffers");
    }

    /// Finds or allocates the cache slot for `(dev, blockno)` and bumps its
    /// reference count, without touching disk.
    ///
    /// On a miss, searches for a free buffer to reuse across buckets instead
    /// of one global list.
    pub fn bget(&self, dev: u32, blockno: u32) -> PinnedBuf<'_, D> {
        let home = hash(blockno);

        {
            let _guard = self.bucket_locks[home].lock();
            if let Some(idx) = unsafe { self.find(home, dev, blockno) } {
                unsafe { (*self.nodes.get())[idx].refcnt += 1 };
                return PinnedBuf {
                    cache: self,
                    idx,
                    dev,
                    blockno,
                };
            }
        }

        let idx = self.evict(home);

        let _guard = self.bucket_locks[home].lock();
        // Another task may have raced us and cached this block while we were
        // searching for a free buffer; prefer its slot and park ours back as
        // free rather than caching the same block twice.
        if let Some(existing) = unsafe { self.find(home, dev, blockno) } {
            unsafe {
                (*self.nodes.get())[idx].valid = false;
                (*self.nodes.get())[idx].refcnt = 0;
                self.push_front(home, idx);
                (*self.nodes.get())[existing].refcnt += 1;
            }
            return PinnedBuf {
                cache: self,
                idx: existing,
                dev,
                blockno,
            };
        }

        unsafe {
            let node = &mut (*self.nodes.get())[idx];
            node.dev = dev;
            node.blockno = blockno;
            node.valid = false;
            node.refcnt = 1;
            self.push_front(home, idx);
        }

        PinnedBuf {
            cache: self,
            idx,
            dev,
            blockno,
        }
    }

    /// Equivalent to `bget` followed by [`PinnedBuf::lock`]: returns a
    /// buffer holding valid data for `(dev, blockno)`, reading through to
    /// disk on a cache miss.
    pub fn bread(&self, dev: u32, blockno: u32) -> BufGuard<'_, D> {
        self.bget(dev, blockno).lock()
    }

    /// Returns the `(dev, blockno)` identities of `bucket`'s list from head
    /// (MRU) to tail (LRU). Test-only: production code never needs to
    /// observe bucket order directly.
    #[cfg(test)]
    fn bucket_order(&self, bucket: usize) -> std::vec::Vec<(u32, u32)> {
        let _guard = self.bucket_locks[bucket].lock();
        let head = sentinel(bucket);
        let nodes = unsafe { &*self.nodes.get() };
        let mut out = std::vec::Vec::new();
        let mut cur = nodes[head].next;
        while cur != head {
            out.push((nodes[cur].dev, nodes[cur].blockno));
            cur = nodes[cur].next;
        }
        out
    }
}

/// A cache slot reserved for `(dev, blockno)` with its reference count
/// held, but not yet sleep-locked for content access.
pub struct PinnedBuf<'a, D: BlockDevice> {
    cache: &'a BufferCache<D>,
    idx: usize,
    dev: u32,
    blockno: u32,
}

impl<'a, D: BlockDevice> PinnedBuf<'a, D> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// Raises the buffer's reference count without releasing this handle's
    /// own hold on it, keeping it pinned in the cache even after this
    /// handle is dropped and its matching [`PinnedBuf::unpin`] is called.
    pub fn pin(&self) {
        let home = hash(self.blockno);
        let _guard = self.cache.bucket_locks[home].lock();
        unsafe { (*self.cache.nodes.get())[self.idx].refcnt += 1 };
    }

    /// Undoes one [`PinnedBuf::pin`] call.
    pub fn unpin(&self) {
        let home = hash(self.blockno);
        let _guard = self.cache.bucket_locks[home].lock();
        unsafe { (*self.cache.nodes.get())[self.idx].refcnt -= 1 };
    }

    /// Acquires the buffer's content lock, reading through to disk if the
    /// cached copy isn't valid yet.
    pub fn lock(self) -> BufGuard<'a, D> {
        let mut data = self.cache.data[self.idx].lock();
        let home = hash(self.blockno);

        let valid = {
            let _guard = self.cache.bucket_locks[home].lock();
            unsafe { (*self.cache.nodes.get())[self.idx].valid }
        };

        if !valid {
            self.cache.disk.read(self.dev, self.blockno, &mut data.data);
            let _guard = self.cache.bucket_locks[home].lock();
            unsafe { (*self.cache.nodes.get())[self.idx].valid = true };
        }

        BufGuard { data, pinned: self }
    }
}

impl<D: BlockDevice> Drop for PinnedBuf<'_, D> {
    /// Decrements the reference count and, only on the 1→0 transition,
    /// moves the buffer to the head (MRU) of its bucket. A release that
    /// leaves other references outstanding must not reorder the list.
    fn drop(&mut self) {
        let home = hash(self.blockno);
        let _guard = self.cache.bucket_locks[home].lock();
        unsafe {
            let node = &mut (*self.cache.nodes.get())[self.idx];
            node.refcnt -= 1;
            if node.refcnt == 0 {
                self.cache.unlink(self.idx);
                self.cache.push_front(home, self.idx);
            }
        }
    }
}

/// A buffer with its content lock held. Fields drop in declaration order,
/// so `data` (the sleep-lock) is released first and `pinned` (which takes
/// the bucket lock, decrements `refcnt`, and may perform the MRU move)
/// second — matching brelse's documented release order of sleep-lock then
/// bucket-lock.
pub struct BufGuard<'a, D: BlockDevice> {
    data: SleepLockGuard<'a, BufData>,
    pinned: PinnedBuf<'a, D>,
}

impl<D: BlockDevice> BufGuard<'_, D> {
    pub fn dev(&self) -> u32 {
        self.pinned.dev()
    }

    pub fn blockno(&self) -> u32 {
        self.pinned.blockno()
    }

    /// Writes the buffer's current content to disk.
    pub fn write(&self) {
        self.pinned
            .cache
            .disk
            .write(self.pinned.dev, self.pinned.blockno, &self.data.data);
    }

    pub fn pin(&self) {
        self.pinned.pin();
    }

    pub fn unpin(&self) {
        self.pinned.unpin();
    }
}

impl<D: BlockDevice> Deref for BufGuard<'_, D> {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.data.data
    }
}

impl<D: BlockDevice> DerefMut for BufGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::RamDisk;
    use std::sync::Arc;

    fn cache() -> BufferCache<RamDisk> {
        BufferCache::new(RamDisk::new())
    }

    #[test]
    fn cold_read_pulls_from_disk() {
        let cache = cache();
        cache.disk.write(0, 7, &{
            let mut b = [0u8; BSIZE];
            b[0] = 0xAB;
            b
        });

        let buf = cache.bread(0, 7);
        assert_eq!(buf[0], 0xAB);
    }

    #[test]
    fn warm_read_does_not_touch_disk_again() {
        let cache = cache();
        {
            let mut buf = cache.bread(0, 1);
            buf[0] = 42;
            buf.write();
        }
        cache.disk.write(0, 1, &[0u8; BSIZE]);

        let buf = cache.bread(0, 1);
        assert_eq!(buf[0], 42, "cached copy should shadow the later disk write");
    }

    #[test]
    fn distinct_blocks_get_distinct_buffers() {
        let cache = cache();
        let a = cache.bread(0, 1);
        let b = cache.bread(0, 2);
        assert_ne!(a.pinned.idx, b.pinned.idx);
    }

    #[test]
    fn concurrent_distinct_blocks_land_in_their_own_hash_buckets() {
        // Two CPUs bread(1, 5) and bread(1, 6) concurrently: both complete,
        // with no deadlock, and end up linked into buckets 5 and 6.
        let cache = cache();
        std::thread::scope(|scope| {
            scope.spawn(|| cache.bread(1, 5).write());
            scope.spawn(|| cache.bread(1, 6).write());
        });

        assert_eq!(cache.bucket_order(5), [(1, 5)]);
        assert_eq!(cache.bucket_order(6), [(1, 6)]);
    }

    #[test]
    fn same_block_shares_one_buffer_while_pinned() {
        let cache = cache();
        let a = cache.bget(0, 5);
        let b = cache.bget(0, 5);
        assert_eq!(a.idx, b.idx);
    }

    #[test]
    fn recently_used_buffer_survives_eviction_pressure() {
        let cache = cache();
        let kept = cache.bread(0, 0);

        for blockno in 1..(NBUF as u32 * 2) {
            let _ = cache.bread(0, blockno);
        }

        assert_eq!(kept[0], 0, "still readable: must not have been evicted");
    }

    #[test]
    #[should_panic(expected = "bget: no free buffers")]
    fn exhaustion_panics() {
        let cache = cache();
        let mut held = std::vec::Vec::new();
        for blockno in 0..(NBUF as u32 + 1) {
            held.push(cache.bget(0, blockno));
        }
    }

    #[test]
    fn mru_ordering_within_a_shared_bucket() {
        // `hash` only depends on blockno, so 5 and 18 land in the same
        // bucket (18 % 13 == 5) regardless of dev.
        let cache = cache();
        assert_eq!(NBUCKET, 13);

        cache.bread(1, 5).write();
        cache.bread(1, 18).write();

        assert_eq!(cache.bucket_order(5), [(1, 18), (1, 5)]);
    }

    #[test]
    fn release_with_outstanding_reference_does_not_reorder() {
        let cache = cache();
        let home = 5usize % NBUCKET;

        cache.bread(1, 5).write();
        cache.bread(1, 18).write();
        assert_eq!(cache.bucket_order(home), [(1, 18), (1, 5)]);

        // Two live handles on the head entry; dropping one must leave the
        // bucket order untouched since its refcnt does not reach zero.
        let first = cache.bget(1, 18);
        let second = cache.bget(1, 18);
        drop(first);
        assert_eq!(
            cache.bucket_order(home),
            [(1, 18), (1, 5)],
            "refcnt still > 0 after release: order must be unchanged"
        );
        drop(second);
        assert_eq!(
            cache.bucket_order(home),
            [(1, 18), (1, 5)],
            "block 18 was already MRU, so the 1->0 release keeps it at the head"
        );
    }

    #[test]
    fn concurrent_access_to_distinct_blocks() {
        let cache = Arc::new(cache());
        std::thread::scope(|scope| {
            for t in 0..8u32 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for _ in 0..50 {
                        let mut buf = cache.bread(1, t);
                        buf[0] = t as u8;
                        buf.write();
                        assert_eq!(buf[0], t as u8);
                    }
                });
            }
        });
    }
}

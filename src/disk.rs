//! Block device boundary.
//!
//! A kernel block cache normally talks to storage through a concrete MMIO
//! driver for one disk controller, called directly from `bread`/`bwrite`.
//! The actual transport is out of scope for this crate, so that boundary is
//! expressed as a trait instead — [`BlockDevice`] — that
//! [`crate::bcache::BufferCache`] is generic over, the same way
//! [`crate::cpu::CpuSource`] abstracts CPU identity for the page allocator.

use crate::param::BSIZE;

/// Reads and writes fixed-size blocks on a storage device.
///
/// Implementations may block the calling task (disk I/O is the canonical
/// reason [`crate::sleeplock::SleepLock`] exists rather than
/// [`crate::spinlock::SpinLock`]); neither method takes `&mut self` since
/// callers may invoke it concurrently from different CPUs for different
/// blocks.
pub trait BlockDevice: Sync {
    /// Reads block `blockno` of device `dev` into `data`.
    fn read(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE]);

    /// Writes `data` to block `blockno` of device `dev`.
    fn write(&self, dev: u32, blockno: u32, data: &[u8; BSIZE]);
}

#[cfg(any(test, feature = "std"))]
pub use hosted::RamDisk;

#[cfg(any(test, feature = "std"))]
mod hosted {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::BlockDevice;
    use crate::param::BSIZE;

    /// An in-memory stand-in for a real block device, used in tests.
    ///
    /// Blocks that have never been written read back as zero, matching the
    /// convention that a disk transfer always moves a full, previously
    /// zero-initialized `BSIZE` block.
    #[derive(Debug, Default)]
    pub struct RamDisk {
        blocks: Mutex<HashMap<(u32, u32), [u8; BSIZE]>>,
    }

    impl RamDisk {
        pub fn new() -> Self {
            Self {
                blocks: Mutex::new(HashMap::new()),
            }
        }
    }

    impl BlockDevice for RamDisk {
        fn read(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE]) {
            let blocks = self.blocks.lock().unwrap();
            match blocks.get(&(dev, blockno)) {
                Some(block) => data.copy_from_slice(block),
                None => data.fill(0),
            }
        }

        fn write(&self, dev: u32, blockno: u32, data: &[u8; BSIZE]) {
            let mut blocks = self.blocks.lock().unwrap();
            blocks.insert((dev, blockno), *data);
        }
    }
}

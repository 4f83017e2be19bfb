//! The seam between the buffer cache and whatever moves blocks to and from
//! storage. The cache treats the transfer as opaque and synchronous: when a
//! call returns `Ok`, the data has moved.

use parking_lot::Mutex;
use std::{collections::HashMap, io};

/// A synchronous block-transfer primitive.
///
/// Implementations own all failure handling (retries, bad sectors). The cache
/// only ever observes success or failure: on a failed read it keeps the
/// descriptor invalid, on a failed write it propagates the error unchanged.
pub trait BlockDevice: Send + Sync {
    /// Fill `buf` with the contents of `blockno` on device `dev`.
    fn read_block(&self, dev: u32, blockno: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Durably write `buf` as the new contents of `blockno` on device `dev`.
    fn write_block(&self, dev: u32, blockno: u64, buf: &[u8]) -> io::Result<()>;
}

/// An in-memory block device.
///
/// Blocks that were never written read back as all zeroes. Useful as a RAM
/// disk and as the backing device in tests.
pub struct MemDisk {
    block_size: usize,
    blocks: Mutex<HashMap<(u32, u64), Vec<u8>>>,
}

impl MemDisk {
    pub fn new(block_size: usize) -> Self {
        MemDisk {
            block_size,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Seed a block's contents directly, bypassing the cache.
    pub fn put(&self, dev: u32, blockno: u64, data: &[u8]) {
        assert_eq!(data.len(), self.block_size, "block length mismatch");
        self.blocks
            .lock()
            .insert((dev, blockno), data.to_vec());
    }

    /// Read a block's contents directly, bypassing the cache.
    pub fn get(&self, dev: u32, blockno: u64) -> Option<Vec<u8>> {
        self.blocks.lock().get(&(dev, blockno)).cloned()
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, dev: u32, blockno: u64, buf: &mut [u8]) -> io::Result<()> {
        match self.blocks.lock().get(&(dev, blockno)) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, dev: u32, blockno: u64, buf: &[u8]) -> io::Result<()> {
        self.blocks
            .lock()
            .insert((dev, blockno), buf.to_vec());
        Ok(())
    }
}

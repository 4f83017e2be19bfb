//! The disk block buffer cache.
//!
//! The cache holds a fixed pool of block-sized buffers, each a cached copy of
//! one disk block, and provides the synchronization point for blocks used by
//! multiple threads. Buffers are distributed over hash shards keyed by block
//! number, each shard with its own lock, so lookups for unrelated blocks do
//! not contend.
//!
//! Interface:
//! * [`BufferCache::read`] returns a buffer holding the contents of a block,
//!   loading it through the [`BlockDevice`] on a miss.
//! * [`Buf::write_back`] writes changed buffer data to the device.
//! * Dropping a [`Buf`] (or calling [`Buf::release`]) gives the buffer up.
//!   Do not keep buffers longer than necessary: the pool is fixed and a held
//!   buffer cannot be recycled.
//! * Only one thread at a time can hold a given block's buffer. Acquiring a
//!   block twice from the same thread without releasing deadlocks, exactly
//!   like taking a mutex twice.

use crate::{
    device::BlockDevice,
    metrics::{Metric, Metrics},
    options::CacheOptions,
};
use crossbeam::utils::CachePadded;
use parking_lot::{ArcMutexGuard, Mutex, MutexGuard, RawMutex};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

type PayloadGuard = ArcMutexGuard<RawMutex, Box<[u8]>>;

/// Errors surfaced by cache operations.
///
/// Everything else the cache can hit is a caller bug and panics.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every descriptor in every shard is referenced. The pool has no
    /// eviction of live data; only zero-reference descriptors are recycled.
    #[error("buffer pool exhausted: no zero-reference descriptor in any shard")]
    Exhausted,
    /// The block transfer primitive failed. The buffer involved stays
    /// invalid.
    #[error("block transfer failed")]
    Io(#[from] std::io::Error),
}

/// One descriptor of the fixed pool.
///
/// The identity and reference count live in the owning shard's list entry;
/// what remains here is the payload under its own content lock, plus the two
/// fields that must be readable from outside any single shard's critical
/// section.
struct Slot {
    /// Index of the shard whose list currently contains this slot.
    /// Re-validated under the shard lock before use; recycling can move a
    /// slot between shards.
    shard: AtomicU32,
    /// Whether the payload holds the identified block's contents. Cleared
    /// when the slot is recycled to a new identity, set once a load
    /// completes.
    valid: AtomicBool,
    /// The content lock. Held by whoever is reading or writing the payload,
    /// including across the suspension for a device transfer.
    payload: Arc<Mutex<Box<[u8]>>>,
}

/// A shard's membership list, FIFO order. An entry's `dev`/`blockno` are
/// meaningless until the slot is first recycled to a real identity, and stay
/// behind after the reference count drops to zero so a re-acquire can hit.
struct Shard {
    entries: Vec<Entry>,
}

struct Entry {
    slot: u32,
    dev: u32,
    blockno: u64,
    refcnt: u32,
}

impl Entry {
    fn is(&self, dev: u32, blockno: u64) -> bool {
        self.dev == dev && self.blockno == blockno
    }
}

struct Shared {
    device: Arc<dyn BlockDevice>,
    shards: Vec<CachePadded<Mutex<Shard>>>,
    slots: Vec<Slot>,
    metrics: Metrics,
}

/// The block buffer cache. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct BufferCache {
    shared: Arc<Shared>,
}

impl BufferCache {
    /// Create a cache over the given device.
    ///
    /// Descriptors are distributed round-robin across the shards, so no
    /// shard starts empty while others are overloaded.
    pub fn new(device: Arc<dyn BlockDevice>, o: CacheOptions) -> anyhow::Result<BufferCache> {
        if o.slots == 0 {
            anyhow::bail!("slots may not be zero");
        }
        if o.shards == 0 {
            anyhow::bail!("shards may not be zero");
        }
        if o.block_size == 0 {
            anyhow::bail!("block_size may not be zero");
        }

        let mut shards: Vec<_> = (0..o.shards)
            .map(|_| CachePadded::new(Mutex::new(Shard { entries: Vec::new() })))
            .collect();
        let slots: Vec<_> = (0..o.slots)
            .map(|i| {
                let shard = i % o.shards;
                shards[shard].get_mut().entries.push(Entry {
                    slot: i as u32,
                    dev: 0,
                    blockno: 0,
                    refcnt: 0,
                });
                Slot {
                    shard: AtomicU32::new(shard as u32),
                    valid: AtomicBool::new(false),
                    payload: Arc::new(Mutex::new(
                        vec![0; o.block_size].into_boxed_slice(),
                    )),
                }
            })
            .collect();

        Ok(BufferCache {
            shared: Arc::new(Shared {
                device,
                shards,
                slots,
                metrics: Metrics::new(o.metrics),
            }),
        })
    }

    /// Return a buffer holding the contents of the indicated block, loading
    /// it through the device if the cached copy is invalid.
    pub fn read(&self, dev: u32, blockno: u64) -> Result<Buf, Error> {
        let mut buf = self.try_acquire(dev, blockno)?;
        if !buf.is_valid() {
            self.shared.metrics.count(Metric::CacheMisses);
            self.shared.device.read_block(dev, blockno, &mut buf)?;
            buf.mark_valid();
        }
        Ok(buf)
    }

    /// Like [`BufferCache::try_acquire`], but pool exhaustion is treated as
    /// fatal. The shard and descriptor counts are sized so that a correctly
    /// behaving caller never exhausts the pool.
    pub fn acquire(&self, dev: u32, blockno: u64) -> Buf {
        match self.try_acquire(dev, blockno) {
            Ok(buf) => buf,
            Err(e) => panic!("acquire: {}", e),
        }
    }

    /// Look up (or recycle a descriptor for) the indicated block and return
    /// it exclusively held.
    ///
    /// The returned buffer's payload may be invalid; callers that do not go
    /// through [`BufferCache::read`] must check [`Buf::is_valid`] and load
    /// the block themselves before trusting the bytes.
    ///
    /// This call suspends while another thread holds the same block, and
    /// returns [`Error::Exhausted`] when no shard can give up a descriptor.
    pub fn try_acquire(&self, dev: u32, blockno: u64) -> Result<Buf, Error> {
        let shared = &*self.shared;
        shared.metrics.count(Metric::BlockRequests);
        let home = shared.home_shard(blockno);

        {
            let mut shard = shared.shards[home].lock();

            // Is the block already cached?
            if let Some(entry) = shard.entries.iter_mut().find(|e| e.is(dev, blockno)) {
                entry.refcnt += 1;
                let slot = entry.slot;
                drop(shard);
                return Ok(self.lock_payload(slot, dev, blockno));
            }

            // Not cached; recycle an unused descriptor in the home shard.
            if let Some(entry) = shard.entries.iter_mut().find(|e| e.refcnt == 0) {
                let slot = shared.recycle(entry, dev, blockno);
                drop(shard);
                return Ok(self.lock_payload(slot, dev, blockno));
            }
        }

        // The home shard is full. Probe the remaining shards in cyclic order
        // and migrate a free descriptor into the home shard, so future
        // lookups find it where the hash points.
        let count = shared.shards.len();
        for probe in (1..count).map(|d| (home + d) % count) {
            let (mut home_guard, mut probe_guard) = shared.lock_pair(home, probe);

            // The home shard was unlocked while we probed: the block may have
            // been cached, or a descriptor released, by somebody else.
            if let Some(entry) = home_guard.entries.iter_mut().find(|e| e.is(dev, blockno)) {
                entry.refcnt += 1;
                let slot = entry.slot;
                drop(probe_guard);
                drop(home_guard);
                return Ok(self.lock_payload(slot, dev, blockno));
            }
            if let Some(entry) = home_guard.entries.iter_mut().find(|e| e.refcnt == 0) {
                let slot = shared.recycle(entry, dev, blockno);
                drop(probe_guard);
                drop(home_guard);
                return Ok(self.lock_payload(slot, dev, blockno));
            }

            if let Some(pos) = probe_guard.entries.iter().position(|e| e.refcnt == 0) {
                let mut entry = probe_guard.entries.remove(pos);
                let slot = shared.recycle(&mut entry, dev, blockno);
                shared.slots[slot as usize]
                    .shard
                    .store(home as u32, Ordering::Release);
                home_guard.entries.push(entry);
                shared.metrics.count(Metric::ShardRebalances);
                log::debug!(
                    "migrated slot {} from shard {} to shard {} for block {}",
                    slot,
                    probe,
                    home,
                    blockno
                );
                drop(probe_guard);
                drop(home_guard);
                return Ok(self.lock_payload(slot, dev, blockno));
            }
        }

        log::warn!(
            "buffer pool exhausted while acquiring block {} on device {}",
            blockno,
            dev
        );
        Err(Error::Exhausted)
    }

    /// A handle on the cache's metrics.
    pub fn metrics(&self) -> Metrics {
        self.shared.metrics.clone()
    }

    /// Take the content lock of a slot whose refcount we hold. May park the
    /// calling thread until the current holder releases. No shard lock may
    /// be held here: the holder we wait for needs it to release.
    fn lock_payload(&self, slot: u32, dev: u32, blockno: u64) -> Buf {
        let guard = Mutex::lock_arc(&self.shared.slots[slot as usize].payload);
        Buf {
            shared: self.shared.clone(),
            slot,
            dev,
            blockno,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn check_shard_invariants(&self) {
        let mut seen = vec![false; self.shared.slots.len()];
        for (i, shard) in self.shared.shards.iter().enumerate() {
            let shard = shard.lock();
            for entry in &shard.entries {
                let slot = &self.shared.slots[entry.slot as usize];
                assert!(
                    !std::mem::replace(&mut seen[entry.slot as usize], true),
                    "slot {} appears in more than one shard",
                    entry.slot
                );
                assert_eq!(
                    slot.shard.load(Ordering::Acquire),
                    i as u32,
                    "slot {} records the wrong shard",
                    entry.slot
                );
                if entry.refcnt > 0 || slot.valid.load(Ordering::Acquire) {
                    assert_eq!(
                        self.shared.home_shard(entry.blockno),
                        i,
                        "block {} lives in a shard other than its home",
                        entry.blockno
                    );
                }
            }
        }
        assert!(seen.iter().all(|&s| s), "a slot is missing from every shard");
    }
}

impl Shared {
    fn home_shard(&self, blockno: u64) -> usize {
        (blockno % self.shards.len() as u64) as usize
    }

    /// Overwrite a zero-reference entry's identity and hand it to the
    /// caller with one reference. Must be called under the owning shard's
    /// lock.
    fn recycle(&self, entry: &mut Entry, dev: u32, blockno: u64) -> u32 {
        debug_assert_eq!(entry.refcnt, 0);
        entry.dev = dev;
        entry.blockno = blockno;
        entry.refcnt = 1;
        self.slots[entry.slot as usize]
            .valid
            .store(false, Ordering::Release);
        self.metrics.count(Metric::Recycles);
        entry.slot
    }

    /// Lock two distinct shards, always taking the lower index first so
    /// concurrent migrations cannot wait on each other in a cycle.
    fn lock_pair(&self, a: usize, b: usize) -> (MutexGuard<'_, Shard>, MutexGuard<'_, Shard>) {
        debug_assert_ne!(a, b);
        if a < b {
            let ga = self.shards[a].lock();
            let gb = self.shards[b].lock();
            (ga, gb)
        } else {
            let gb = self.shards[b].lock();
            let ga = self.shards[a].lock();
            (ga, gb)
        }
    }

    /// Run `f` on a slot's shard entry under the owning shard's lock,
    /// re-reading the recorded shard index in case a concurrent recycle
    /// migrated the slot between the read and the lock.
    fn with_entry<R>(&self, slot: u32, f: impl FnOnce(&mut Entry) -> R) -> R {
        loop {
            let recorded = self.slots[slot as usize].shard.load(Ordering::Acquire);
            let mut shard = self.shards[recorded as usize].lock();
            if self.slots[slot as usize].shard.load(Ordering::Acquire) != recorded {
                continue;
            }
            // UNWRAP: a slot is always a member of exactly the shard its
            // index records, which we just validated under that shard's
            // lock.
            let entry = shard
                .entries
                .iter_mut()
                .find(|e| e.slot == slot)
                .unwrap();
            return f(entry);
        }
    }

    fn incr_ref(&self, slot: u32) {
        self.with_entry(slot, |entry| {
            debug_assert!(entry.refcnt > 0);
            entry.refcnt += 1;
        });
    }

    fn decr_ref(&self, slot: u32) {
        self.with_entry(slot, |entry| {
            debug_assert!(entry.refcnt > 0);
            entry.refcnt -= 1;
        });
    }
}

/// An exclusively held buffer.
///
/// While a `Buf` is live, its thread is the only one that can observe or
/// mutate the payload; a second acquire of the same block waits for this one
/// to drop. Dereferences to the payload bytes.
pub struct Buf {
    shared: Arc<Shared>,
    slot: u32,
    dev: u32,
    blockno: u64,
    guard: Option<PayloadGuard>,
}

impl Buf {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u64 {
        self.blockno
    }

    /// Whether the payload holds the block's contents. False on a buffer
    /// fresh from recycling, until a load completes.
    pub fn is_valid(&self) -> bool {
        self.shared.slots[self.slot as usize]
            .valid
            .load(Ordering::Acquire)
    }

    fn mark_valid(&self) {
        self.shared.slots[self.slot as usize]
            .valid
            .store(true, Ordering::Release);
    }

    /// Write the payload to the device.
    ///
    /// Only a live `Buf` can call this, so the content lock is necessarily
    /// held for the duration of the transfer.
    pub fn write_back(&self) -> std::io::Result<()> {
        self.shared
            .device
            .write_block(self.dev, self.blockno, self)
    }

    /// Keep the descriptor resident without holding the content lock.
    ///
    /// The returned pin holds one reference, which keeps the descriptor from
    /// being recycled across unrelated acquire/release cycles until the pin
    /// is dropped.
    pub fn pin(&self) -> BufPin {
        self.shared.incr_ref(self.slot);
        BufPin {
            shared: self.shared.clone(),
            slot: self.slot,
        }
    }

    /// Give the buffer up. Equivalent to dropping it.
    pub fn release(self) {}
}

impl std::ops::Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // UNWRAP: the guard is only taken in drop.
        let guard = self.guard.as_ref().unwrap();
        &guard[..]
    }
}

impl std::ops::DerefMut for Buf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // UNWRAP: the guard is only taken in drop.
        let guard = self.guard.as_mut().unwrap();
        &mut guard[..]
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        // Unlock the content first so a waiter can proceed the moment the
        // reference count allows; then drop the reference under the owning
        // shard's lock.
        drop(self.guard.take());
        self.shared.decr_ref(self.slot);
    }
}

/// A reference on a descriptor without the content lock, as used by layers
/// that must keep a block resident across their own acquire/release cycles.
pub struct BufPin {
    shared: Arc<Shared>,
    slot: u32,
}

impl BufPin {
    /// Drop the pinned reference. Equivalent to dropping the pin.
    pub fn unpin(self) {}
}

impl Drop for BufPin {
    fn drop(&mut self) {
        self.shared.decr_ref(self.slot);
    }
}

//! Resource management for block-structured systems: a lock-striped disk
//! block cache and a physical page pool.
//!
//! The two subsystems are peers and share one design: partition a fixed pool
//! of resources, give every partition its own lock, and rebalance across
//! partitions only when a local one runs dry.
//!
//! * [`BufferCache`] caches disk blocks in a fixed set of buffers spread
//!   over hash shards, with exclusive per-block access and recycling of
//!   unreferenced buffers, including migrating them between shards when the
//!   hash demands it.
//! * [`PagePool`] hands out page-sized memory blocks from per-core free-list
//!   partitions with work-stealing, or, under [`Policy::Shared`], from a
//!   single reference-counted pool that allows one page to have several
//!   owners.
//!
//! Blocks move to and from storage through the [`BlockDevice`] trait; the
//! crate ships [`MemDisk`], an in-memory implementation.

mod bcache;
mod device;
mod metrics;
mod options;
mod page_pool;

pub use bcache::{Buf, BufPin, BufferCache, Error};
pub use device::{BlockDevice, MemDisk};
pub use metrics::{Metric, Metrics};
pub use options::{CacheOptions, Policy, PoolOptions};
pub use page_pool::{OwnedPage, Page, PagePool, ALLOC_FILL, FREE_FILL, PAGE_SIZE};

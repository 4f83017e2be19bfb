//! The physical page pool.
//!
//! A fixed range of page-sized memory blocks, carved up at startup and handed
//! out one page at a time. The free lists are plain vectors of page indices
//! kept outside the managed memory, so a free page is never aliased as
//! allocator bookkeeping.
//!
//! Two ownership policies are available behind the same interface:
//!
//! * [`Policy::Striped`] partitions the free pages per core. A thread
//!   allocates from its own partition and steals from siblings when that runs
//!   dry. Frees always go back to the freeing thread's partition.
//! * [`Policy::Shared`] keeps a single free list plus a per-page reference
//!   count, so one physical page can be held by several owners at once.

use crate::{
    metrics::{Metric, Metrics},
    options::{Policy, PoolOptions},
};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use thread_local::ThreadLocal;

/// The size of one managed page.
pub const PAGE_SIZE: usize = 4096;

/// Byte written over a page when it is handed out, to surface
/// use-before-initialize bugs.
pub const ALLOC_FILL: u8 = 0x05;

/// Byte written over a page when it returns to a free list, to surface writes
/// through stale references.
pub const FREE_FILL: u8 = 0x01;

/// A page reference into the pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Page(u32);

impl Page {
    /// Returns a pointer to the page.
    pub fn as_ptr(&self, pool: &PagePool) -> *const u8 {
        pool.data_ptr(*self) as *const u8
    }

    /// Returns a mutable pointer to the page.
    pub fn as_mut_ptr(&self, pool: &PagePool) -> *mut u8 {
        pool.data_ptr(*self)
    }

    /// This is a convenience function that uses [`std::slice::from_raw_parts_mut`] to create a
    /// mutable slice.
    ///
    /// # Safety
    ///
    /// The caller is responsible for making sure:
    ///
    /// 1. that the page is currently allocated,
    /// 2. that the [`PagePool`] is the same that was used to allocate the page,
    /// 3. that the [`PagePool`] is not dropped while the slice is used,
    /// 4. that there is only a single mutable slice into the page at any given time.
    pub unsafe fn as_mut_slice(&self, pool: &PagePool) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.as_mut_ptr(pool), PAGE_SIZE)
    }

    /// Shared-access counterpart of [`Page::as_mut_slice`].
    ///
    /// # Safety
    ///
    /// Same as [`Page::as_mut_slice`], except that shared slices may coexist
    /// as long as no mutable slice into the page is live.
    pub unsafe fn as_slice(&self, pool: &PagePool) -> &[u8] {
        std::slice::from_raw_parts(self.as_ptr(pool), PAGE_SIZE)
    }
}

/// Provides a managed version of a [`Page`] by wrapping it and its [`PagePool`].
///
/// Unlike [`Page`], this type hands the page back to the pool upon dropping
/// and provides a safe way to access the contents. The price for the
/// convenience is that it is heavier than the bare page reference and cannot
/// be cloned.
pub struct OwnedPage {
    pool: PagePool,
    page: Page,
}

impl OwnedPage {
    /// The underlying page reference.
    pub fn page(&self) -> Page {
        self.page
    }
}

impl std::ops::Deref for OwnedPage {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // SAFETY: the page stays allocated for the lifetime of `OwnedPage`
        // and this is the sole handle to it.
        unsafe { self.page.as_slice(&self.pool) }
    }
}

impl std::ops::DerefMut for OwnedPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: as above, and `&mut self` excludes other slices.
        unsafe { self.page.as_mut_slice(&self.pool) }
    }
}

impl Drop for OwnedPage {
    fn drop(&mut self) {
        self.pool.free(self.page);
    }
}

/// [`PagePool`] owns a fixed range of page-sized memory blocks and hands them
/// out under the configured [`Policy`].
///
/// Cheap to clone; all clones refer to the same pool.
#[derive(Clone)]
pub struct PagePool {
    inner: Arc<Inner>,
}

struct Inner {
    base: *mut u8,
    num_pages: usize,
    state: State,
    /// Partition a thread allocates from and frees to. Assigned round-robin
    /// on first use and stable for the thread's lifetime.
    home: ThreadLocal<usize>,
    next_home: AtomicUsize,
    metrics: Metrics,
}

enum State {
    Striped {
        partitions: Vec<CachePadded<Mutex<Vec<Page>>>>,
    },
    Shared {
        pool: CachePadded<Mutex<SharedPool>>,
    },
}

struct SharedPool {
    freelist: Vec<Page>,
    refcounts: Vec<u32>,
}

impl PagePool {
    /// Creates a new pool covering `num_pages` pages.
    ///
    /// The whole range starts out free: under the striped policy it is split
    /// into contiguous per-partition runs, as evenly as possible, so the
    /// steady state begins balanced.
    pub fn new(o: PoolOptions) -> anyhow::Result<PagePool> {
        if o.num_pages == 0 {
            anyhow::bail!("num_pages may not be zero");
        }
        if o.num_pages > u32::MAX as usize {
            anyhow::bail!("num_pages may not exceed {}", u32::MAX);
        }
        if o.partitions == 0 {
            anyhow::bail!("partitions may not be zero");
        }

        let len = o.num_pages * PAGE_SIZE;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                /* fd */ -1,
                /* offset */ 0,
            )
        };
        if base == libc::MAP_FAILED {
            anyhow::bail!("failed to map a {} byte page arena", len);
        }
        let base = base as *mut u8;

        // The range is born free, so it carries the free pattern.
        unsafe {
            std::slice::from_raw_parts_mut(base, len).fill(FREE_FILL);
        }

        let state = match o.policy {
            Policy::Striped => {
                let mut partitions = Vec::with_capacity(o.partitions);
                let chunk = o.num_pages / o.partitions;
                let remainder = o.num_pages % o.partitions;
                let mut next = 0;
                for i in 0..o.partitions {
                    let count = chunk + usize::from(i < remainder);
                    let run = (next..next + count).map(|pn| Page(pn as u32)).collect();
                    partitions.push(CachePadded::new(Mutex::new(run)));
                    next += count;
                }
                State::Striped { partitions }
            }
            Policy::Shared => State::Shared {
                pool: CachePadded::new(Mutex::new(SharedPool {
                    freelist: (0..o.num_pages).map(|pn| Page(pn as u32)).collect(),
                    refcounts: vec![0; o.num_pages],
                })),
            },
        };

        log::debug!(
            "page pool: {} pages, {} partition(s), {:?} policy",
            o.num_pages,
            match state {
                State::Striped { ref partitions } => partitions.len(),
                State::Shared { .. } => 1,
            },
            o.policy,
        );

        Ok(PagePool {
            inner: Arc::new(Inner {
                base,
                num_pages: o.num_pages,
                state,
                home: ThreadLocal::new(),
                next_home: AtomicUsize::new(0),
                metrics: Metrics::new(o.metrics),
            }),
        })
    }

    /// Allocates one page, or returns `None` when every partition is empty.
    ///
    /// The page comes from the calling thread's partition when possible and
    /// is stolen from a sibling partition otherwise. On success the page is
    /// filled with [`ALLOC_FILL`]; under the shared policy its reference
    /// count starts at one.
    pub fn allocate(&self) -> Option<Page> {
        let page = match self.inner.state {
            State::Striped { ref partitions } => {
                let home = self.home_partition(partitions.len());
                // Bind the pop so the local lock is released before
                // stealing: a stealer holding its own partition while taking
                // a sibling's would wait in a cycle with a stealer going the
                // other way.
                let local = partitions[home].lock().pop();
                match local {
                    Some(page) => Some(page),
                    None => self.steal(partitions, home),
                }
            }
            State::Shared { ref pool } => {
                let mut pool = pool.lock();
                let page = pool.freelist.pop();
                if let Some(page) = page {
                    pool.refcounts[page.0 as usize] = 1;
                }
                page
            }
        }?;

        // SAFETY: the page just left a free list, so no other reference to
        // it exists.
        unsafe {
            self.data_slice_mut(page).fill(ALLOC_FILL);
        }
        self.inner.metrics.count(Metric::PageAllocs);
        Some(page)
    }

    /// Allocates a managed page that frees itself on drop.
    pub fn alloc_owned(&self) -> Option<OwnedPage> {
        self.allocate().map(|page| OwnedPage {
            pool: self.clone(),
            page,
        })
    }

    /// Returns a page to the pool.
    ///
    /// Under the striped policy the page goes back to the calling thread's
    /// partition, never to the partition it originally came from. Under the
    /// shared policy this drops one reference and the page only becomes free
    /// once the count reaches zero.
    ///
    /// Panics if the page lies outside the managed range, or (shared policy)
    /// if its reference count is already zero.
    pub fn free(&self, page: Page) {
        let index = self.checked_index(page, "free");
        match self.inner.state {
            State::Striped { ref partitions } => {
                // SAFETY: the caller is handing the page back, so ours is the
                // only live reference.
                unsafe {
                    self.data_slice_mut(page).fill(FREE_FILL);
                }
                let home = self.home_partition(partitions.len());
                partitions[home].lock().push(page);
            }
            State::Shared { .. } => {
                self.drop_ref(page, index, "free");
            }
        }
    }

    /// Increments a page's reference count. Shared policy only.
    ///
    /// Panics if the page is outside the managed range, not currently
    /// allocated, or if the pool uses the striped policy.
    pub fn add_ref(&self, page: Page) {
        let index = self.checked_index(page, "add_ref");
        let State::Shared { ref pool } = self.inner.state else {
            panic!("add_ref: reference counting requires the shared policy");
        };
        let mut pool = pool.lock();
        let count = &mut pool.refcounts[index];
        if *count == 0 {
            panic!("add_ref: page {} is not allocated", page.0);
        }
        *count += 1;
    }

    /// Decrements a page's reference count, returning it to the free list
    /// when the count reaches zero. Shared policy only.
    ///
    /// Panics if the count is already zero or if the pool uses the striped
    /// policy.
    pub fn decr_ref(&self, page: Page) {
        let index = self.checked_index(page, "decr_ref");
        self.drop_ref(page, index, "decr_ref");
    }

    /// Whether a page's reference count is currently nonzero. Shared policy
    /// only.
    pub fn is_referenced(&self, page: Page) -> bool {
        let index = self.checked_index(page, "is_referenced");
        let State::Shared { ref pool } = self.inner.state else {
            panic!("is_referenced: reference counting requires the shared policy");
        };
        pool.lock().refcounts[index] > 0
    }

    /// Resolves a byte offset within the managed range to a page reference.
    ///
    /// Panics if the offset is not page-aligned or lies outside the range.
    pub fn page_at(&self, offset: usize) -> Page {
        if offset % PAGE_SIZE != 0 {
            panic!("page_at: offset {:#x} is not page-aligned", offset);
        }
        let index = offset / PAGE_SIZE;
        if index >= self.inner.num_pages {
            panic!(
                "page_at: offset {:#x} outside the managed range of {} pages",
                offset, self.inner.num_pages
            );
        }
        Page(index as u32)
    }

    /// The byte offset of a page within the managed range.
    pub fn offset_of(&self, page: Page) -> usize {
        self.checked_index(page, "offset_of") * PAGE_SIZE
    }

    /// The number of pages currently sitting in free lists.
    pub fn free_pages(&self) -> usize {
        match self.inner.state {
            State::Striped { ref partitions } => {
                partitions.iter().map(|p| p.lock().len()).sum()
            }
            State::Shared { ref pool } => pool.lock().freelist.len(),
        }
    }

    /// A handle on the pool's metrics.
    pub fn metrics(&self) -> Metrics {
        self.inner.metrics.clone()
    }

    fn steal(
        &self,
        partitions: &[CachePadded<Mutex<Vec<Page>>>],
        home: usize,
    ) -> Option<Page> {
        for (i, partition) in partitions.iter().enumerate() {
            if i == home {
                continue;
            }
            let page = partition.lock().pop();
            if let Some(page) = page {
                log::trace!("partition {} stole page {} from partition {}", home, page.0, i);
                self.inner.metrics.count(Metric::PageSteals);
                return Some(page);
            }
        }
        None
    }

    fn drop_ref(&self, page: Page, index: usize, op: &str) {
        let State::Shared { ref pool } = self.inner.state else {
            panic!("{}: reference counting requires the shared policy", op);
        };
        let released = {
            let mut pool = pool.lock();
            let count = &mut pool.refcounts[index];
            if *count == 0 {
                panic!("{}: page {} reference count is already zero", op, page.0);
            }
            *count -= 1;
            *count == 0
        };
        // The fill happens outside the pool lock; nothing else can reach a
        // page whose count just hit zero.
        if released {
            // SAFETY: the last reference is gone and the page is not yet back
            // on the free list, so this is the only access.
            unsafe {
                self.data_slice_mut(page).fill(FREE_FILL);
            }
            pool.lock().freelist.push(page);
        }
    }

    fn home_partition(&self, partitions: usize) -> usize {
        *self.inner.home.get_or(|| {
            self.inner.next_home.fetch_add(1, Ordering::Relaxed) % partitions
        })
    }

    fn checked_index(&self, page: Page, op: &str) -> usize {
        let index = page.0 as usize;
        if index >= self.inner.num_pages {
            panic!(
                "{}: page {} outside the managed range of {} pages",
                op, page.0, self.inner.num_pages
            );
        }
        index
    }

    fn data_ptr(&self, page: Page) -> *mut u8 {
        let index = self.checked_index(page, "data_ptr");
        unsafe { self.inner.base.add(index * PAGE_SIZE) }
    }

    /// SAFETY: the caller must guarantee exclusive access to the page's
    /// bytes, see [`Page::as_mut_slice`].
    unsafe fn data_slice_mut(&self, page: Page) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.data_ptr(page), PAGE_SIZE)
    }

    #[cfg(test)]
    fn partition_sizes(&self) -> Vec<usize> {
        match self.inner.state {
            State::Striped { ref partitions } => {
                partitions.iter().map(|p| p.lock().len()).collect()
            }
            State::Shared { ref pool } => vec![pool.lock().freelist.len()],
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.num_pages * PAGE_SIZE);
        }
    }
}

unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

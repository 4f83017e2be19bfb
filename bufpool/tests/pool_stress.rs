use bufpool::{PagePool, Policy, PoolOptions};
use std::thread;

fn pool(num_pages: usize, partitions: usize, policy: Policy) -> PagePool {
    let mut o = PoolOptions::new();
    o.num_pages(num_pages);
    o.partitions(partitions);
    o.policy(policy);
    PagePool::new(o).unwrap()
}

/// Threads allocate bursts of pages, stamp them, verify the stamp and free
/// them. A page handed to two threads at once would get restamped (or
/// refilled by the allocate-time pattern) under the first owner's feet.
#[test]
fn concurrent_allocate_free_conserves_pages() {
    const PAGES: usize = 64;
    const THREADS: usize = 4;

    let pool = pool(PAGES, THREADS, Policy::Striped);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || {
                for round in 0..100u64 {
                    let mut held = Vec::new();
                    for _ in 0..8 {
                        if let Some(mut page) = pool.alloc_owned() {
                            page[..8].copy_from_slice(&(t as u64).to_le_bytes());
                            page[8..16].copy_from_slice(&round.to_le_bytes());
                            held.push(page);
                        }
                    }
                    for page in &held {
                        assert_eq!(&page[..8], (t as u64).to_le_bytes().as_slice());
                        assert_eq!(&page[8..16], round.to_le_bytes().as_slice());
                    }
                    drop(held);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.free_pages(), PAGES);
}

/// A thread whose partition was drained by someone else still allocates, by
/// stealing, and the pool as a whole only fails once every partition is dry.
#[test]
fn empty_partition_steals_from_sibling() {
    const PAGES: usize = 8;

    let pool = pool(PAGES, 2, Policy::Striped);

    // This thread is the first to touch the pool, so it owns partition 0.
    // Drain everything: half locally, half stolen from partition 1.
    let drained: Vec<_> = (0..PAGES).map(|_| pool.allocate().unwrap()).collect();
    assert!(pool.allocate().is_none());

    // Hand half back; they land in this thread's partition 0.
    for &page in &drained[..4] {
        pool.free(page);
    }

    // The spawned thread owns partition 1, which is empty, so all of its
    // allocations are steals.
    let stolen = {
        let pool = pool.clone();
        thread::spawn(move || {
            let got: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
            assert!(pool.allocate().is_none());
            for &page in &got {
                pool.free(page);
            }
            got.len()
        })
        .join()
        .unwrap()
    };
    assert_eq!(stolen, 4);

    for &page in &drained[4..] {
        pool.free(page);
    }
    assert_eq!(pool.free_pages(), PAGES);
}

/// Reference counting under the shared policy is consistent across threads:
/// balanced add_ref/decr_ref pairs leave the allocation reference intact.
#[test]
fn shared_policy_references_across_threads() {
    const PAGES: usize = 4;
    const THREADS: usize = 8;

    let pool = pool(PAGES, 1, Policy::Shared);
    let page = pool.allocate().unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    pool.add_ref(page);
                    pool.decr_ref(page);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(pool.is_referenced(page));
    assert_eq!(pool.free_pages(), PAGES - 1);

    pool.free(page);
    assert!(!pool.is_referenced(page));
    assert_eq!(pool.free_pages(), PAGES);
}

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Metrics collector. If active, it provides counters for the interesting
/// events of both subsystems.
#[derive(Clone)]
pub struct Metrics {
    metrics: Option<Arc<ActiveMetrics>>,
}

/// Metrics that can be collected during execution.
#[derive(PartialEq, Eq, Hash)]
pub enum Metric {
    /// Counter of total block requests.
    BlockRequests,
    /// Counter of block requests that missed the cache and loaded from the
    /// device.
    CacheMisses,
    /// Counter of descriptors recycled to a new identity.
    Recycles,
    /// Counter of descriptors migrated between shards while being recycled.
    ShardRebalances,
    /// Counter of page allocations.
    PageAllocs,
    /// Counter of page allocations served by stealing from a sibling
    /// partition.
    PageSteals,
}

struct ActiveMetrics {
    block_requests: AtomicU64,
    cache_misses: AtomicU64,
    recycles: AtomicU64,
    shard_rebalances: AtomicU64,
    page_allocs: AtomicU64,
    page_steals: AtomicU64,
}

impl Metrics {
    /// Returns the Metrics object, active or not based on the specified input.
    pub fn new(active: bool) -> Self {
        Self {
            metrics: if active {
                Some(Arc::new(ActiveMetrics {
                    block_requests: AtomicU64::new(0),
                    cache_misses: AtomicU64::new(0),
                    recycles: AtomicU64::new(0),
                    shard_rebalances: AtomicU64::new(0),
                    page_allocs: AtomicU64::new(0),
                    page_steals: AtomicU64::new(0),
                }))
            } else {
                None
            },
        }
    }

    /// Increase the counter specified by the input.
    pub fn count(&self, metric: Metric) {
        if let Some(ref metrics) = self.metrics {
            let counter = match metric {
                Metric::BlockRequests => &metrics.block_requests,
                Metric::CacheMisses => &metrics.cache_misses,
                Metric::Recycles => &metrics.recycles,
                Metric::ShardRebalances => &metrics.shard_rebalances,
                Metric::PageAllocs => &metrics.page_allocs,
                Metric::PageSteals => &metrics.page_steals,
            };

            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Read the current value of a counter. Returns zero when collection is
    /// not active.
    pub fn get(&self, metric: Metric) -> u64 {
        let Some(ref metrics) = self.metrics else {
            return 0;
        };
        let counter = match metric {
            Metric::BlockRequests => &metrics.block_requests,
            Metric::CacheMisses => &metrics.cache_misses,
            Metric::Recycles => &metrics.recycles,
            Metric::ShardRebalances => &metrics.shard_rebalances,
            Metric::PageAllocs => &metrics.page_allocs,
            Metric::PageSteals => &metrics.page_steals,
        };
        counter.load(Ordering::Relaxed)
    }

    /// Print collected metrics to stdout.
    pub fn print(&self) {
        if let Some(ref metrics) = self.metrics {
            println!("metrics");

            let block_requests = metrics.block_requests.load(Ordering::Relaxed);
            println!("  block requests        {}", block_requests);

            if block_requests != 0 {
                let cache_misses = metrics.cache_misses.load(Ordering::Relaxed);
                let percentage_cache_misses =
                    (cache_misses as f64 / block_requests as f64) * 100.0;

                println!(
                    "  cache misses          {} - {:.2}% of block requests",
                    cache_misses, percentage_cache_misses
                );
            }

            let recycles = metrics.recycles.load(Ordering::Relaxed);
            println!("  recycles              {}", recycles);

            let shard_rebalances = metrics.shard_rebalances.load(Ordering::Relaxed);
            println!("  shard rebalances      {}", shard_rebalances);

            let page_allocs = metrics.page_allocs.load(Ordering::Relaxed);
            println!("  page allocations      {}", page_allocs);

            let page_steals = metrics.page_steals.load(Ordering::Relaxed);
            println!("  page steals           {}", page_steals);
        } else {
            println!("Metrics collection was not activated")
        }
    }
}

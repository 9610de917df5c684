//! Stress tests for the update engine.
//!
//! These drive a shared store from several threads with journal reclaim
//! running in the background, then check nothing was lost.

use cowbtree_core::{BtreeId, CommitFlags, DeviceId, DeviceSet, IterFlags, Key, Pos, Store};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Size of inline values in bytes.
    pub value_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            value_size: 24,
        }
    }
}

fn run_threads(
    store: &Arc<Store>,
    config: &StressConfig,
    work: impl Fn(&Store, u64, usize) -> bool + Send + Sync + 'static,
) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let work = Arc::new(work);

    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads)
        .map(|thread_id| {
            let store = Arc::clone(store);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let work = Arc::clone(&work);
            let operations = config.operations;
            thread::spawn(move || {
                for i in 0..operations {
                    if work(&store, thread_id as u64 + 1, i) {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Stress thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Each thread inserts `operations` dirents into its own inode.
pub fn stress_concurrent_inserts(store: Arc<Store>, config: &StressConfig) -> StressTestResult {
    let value = vec![0xA5u8; config.value_size];
    run_threads(&store, config, move |store, inode, i| {
        store
            .btree_insert(
                BtreeId::Dirents,
                Key::inline(Pos::new(inode, i as u64), value.clone()),
                None,
                None,
                CommitFlags::NONE,
            )
            .is_ok()
    })
}

/// Each thread creates inodes with their dirents in one transaction, and
/// deletes every third one again.
pub fn stress_concurrent_transactions(store: Arc<Store>, config: &StressConfig) -> StressTestResult {
    run_threads(&store, config, |store, thread, i| {
        let inum = thread * 1_000_000 + i as u64;
        let created = store.trans_do(None, CommitFlags::NONE, |trans| {
            let inode = trans.get_iter(BtreeId::Inodes, Pos::new(inum, 0), IterFlags::INTENT);
            trans.update(inode, Key::inline(Pos::new(inum, 0), inum.to_le_bytes().to_vec()));
            let dirent = trans.get_iter(BtreeId::Dirents, Pos::new(thread, i as u64), IterFlags::INTENT);
            trans.update(dirent, Key::inline(Pos::new(thread, i as u64), inum.to_le_bytes().to_vec()));
            Ok(())
        });
        if created.is_err() {
            return false;
        }
        if i % 3 != 0 {
            return true;
        }
        let mut trans = store.trans();
        let inode = trans.get_iter(BtreeId::Inodes, Pos::new(inum, 0), IterFlags::INTENT);
        trans.delete_at(inode, CommitFlags::NONE).is_ok()
    })
}

/// Each thread writes and punches extents in its own inode on its own
/// device.
pub fn stress_concurrent_extents(store: Arc<Store>, config: &StressConfig) -> StressTestResult {
    run_threads(&store, config, |store, thread, i| {
        let devs = DeviceSet::single(DeviceId::new(thread as u8));
        let start = (i as u64 % 64) * 8;
        if i % 4 == 3 {
            store
                .delete_range(
                    BtreeId::Extents,
                    Pos::new(thread, start),
                    Pos::new(thread, start + 4),
                    None,
                )
                .is_ok()
        } else {
            store
                .btree_insert(BtreeId::Extents, Key::extent(thread, start, 8, devs), None, None, CommitFlags::NONE)
                .is_ok()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{init_test_logging, small_config};

    fn create_test_store() -> Arc<Store> {
        init_test_logging();
        let store = Arc::new(Store::new(small_config()).unwrap());
        store.start_reclaim();
        store
    }

    fn small() -> StressConfig {
        StressConfig {
            operations: 150,
            threads: 4,
            value_size: 16,
        }
    }

    #[test]
    fn test_concurrent_inserts() {
        let store = create_test_store();
        let config = small();
        let result = stress_concurrent_inserts(Arc::clone(&store), &config);
        result.print_summary("Concurrent Inserts");

        assert_eq!(result.failed_ops, 0);
        let keys = store.keys(BtreeId::Dirents);
        assert_eq!(keys.len(), config.threads * config.operations);
        assert!(keys.windows(2).all(|w| w[0].pos < w[1].pos));
        store.stop_reclaim();
    }

    #[test]
    fn test_concurrent_transactions() {
        let store = create_test_store();
        let config = small();
        let result = stress_concurrent_transactions(Arc::clone(&store), &config);
        result.print_summary("Concurrent Transactions");

        assert_eq!(result.failed_ops, 0);
        let deleted = config.operations.div_ceil(3);
        let live = config.threads * (config.operations - deleted);
        assert_eq!(store.keys(BtreeId::Inodes).len(), live);
        assert_eq!(store.usage().nr_inodes, live as u64);
        assert_eq!(store.keys(BtreeId::Dirents).len(), config.threads * config.operations);
        store.stop_reclaim();
    }

    #[test]
    fn test_concurrent_extents() {
        let store = create_test_store();
        let config = small();
        let result = stress_concurrent_extents(Arc::clone(&store), &config);
        result.print_summary("Concurrent Extents");

        assert_eq!(result.failed_ops, 0);
        let extents = store.keys(BtreeId::Extents);
        let live: u64 = extents.iter().map(|k| k.size).sum();
        assert_eq!(store.usage().data_sectors, live);
        assert_eq!(store.usage().alloc_sectors, live);
        for pair in extents.windows(2) {
            assert!(pair[0].pos <= pair[1].start(), "extents overlap");
        }
        store.stop_reclaim();
    }

    #[test]
    fn test_stress_survives_flush() {
        let store = create_test_store();
        let result = stress_concurrent_inserts(Arc::clone(&store), &small());
        assert_eq!(result.failed_ops, 0);
        store.flush_all_pins().unwrap();
        assert_eq!(store.keys(BtreeId::Dirents).len(), 600);
        store.stop_reclaim();
    }
}

//! Store configuration.

use std::time::Duration;

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of sequence numbers the pin window can track.
    pub pin_window: usize,

    /// Capacity of one journal entry, in u64s.
    pub journal_entry_u64s: u64,

    /// Journal buckets per device. Each written entry occupies one bucket.
    pub journal_buckets: usize,

    /// Number of journal devices.
    pub journal_devices: usize,

    /// Whether journal devices support discard.
    pub discard: bool,

    /// Number of devices every journal entry is written to.
    pub metadata_replicas: usize,

    /// Journal pre-reservation budget, in u64s.
    pub journal_preres_budget: u64,

    /// Interval between background reclaim passes.
    pub reclaim_delay: Duration,

    /// Capacity of one B-tree leaf, in u64s.
    pub node_capacity_u64s: u64,

    /// Maximum number of leaves across all B-trees.
    pub max_nodes: usize,

    /// Leaves held back for reserve-using inserts.
    pub node_reserve: usize,

    /// Two siblings whose live keys fit in this many u64s are merged.
    pub merge_threshold_u64s: u64,

    /// Updates a transaction may hold beyond its iterator count.
    pub update_slack: usize,

    /// Largest extent size a single key may describe.
    pub key_size_max: u64,

    /// Log2 of the block size in sectors.
    pub block_bits: u32,

    /// Stamp every committed key's version with its journal sequence.
    pub journal_seq_verify: bool,

    /// Filesystem capacity in sectors, for disk reservations.
    pub capacity_sectors: u64,

    /// Open the store read-only.
    pub read_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pin_window: 1024,
            journal_entry_u64s: 4096,
            journal_buckets: 64,
            journal_devices: 2,
            discard: true,
            metadata_replicas: 1,
            journal_preres_budget: 1 << 16,
            reclaim_delay: Duration::from_millis(100),
            node_capacity_u64s: 512,
            max_nodes: 4096,
            node_reserve: 8,
            merge_threshold_u64s: 512 / 3,
            update_slack: 4,
            key_size_max: u32::MAX as u64,
            block_bits: 3,
            journal_seq_verify: false,
            capacity_sectors: 1 << 30,
            read_only: false,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pin window capacity.
    #[must_use]
    pub const fn pin_window(mut self, entries: usize) -> Self {
        self.pin_window = entries;
        self
    }

    /// Sets the journal entry capacity in u64s.
    #[must_use]
    pub const fn journal_entry_u64s(mut self, u64s: u64) -> Self {
        self.journal_entry_u64s = u64s;
        self
    }

    /// Sets the number of journal buckets per device.
    #[must_use]
    pub const fn journal_buckets(mut self, buckets: usize) -> Self {
        self.journal_buckets = buckets;
        self
    }

    /// Sets the number of journal devices.
    #[must_use]
    pub const fn journal_devices(mut self, devices: usize) -> Self {
        self.journal_devices = devices;
        self
    }

    /// Sets whether journal devices support discard.
    #[must_use]
    pub const fn discard(mut self, value: bool) -> Self {
        self.discard = value;
        self
    }

    /// Sets the number of devices each journal entry is written to.
    #[must_use]
    pub const fn metadata_replicas(mut self, replicas: usize) -> Self {
        self.metadata_replicas = replicas;
        self
    }

    /// Sets the journal pre-reservation budget.
    #[must_use]
    pub const fn journal_preres_budget(mut self, u64s: u64) -> Self {
        self.journal_preres_budget = u64s;
        self
    }

    /// Sets the background reclaim interval.
    #[must_use]
    pub const fn reclaim_delay(mut self, delay: Duration) -> Self {
        self.reclaim_delay = delay;
        self
    }

    /// Sets the leaf capacity; the merge threshold follows at a third of it.
    #[must_use]
    pub const fn node_capacity_u64s(mut self, u64s: u64) -> Self {
        self.node_capacity_u64s = u64s;
        self.merge_threshold_u64s = u64s / 3;
        self
    }

    /// Sets the leaf budget and the part of it held in reserve.
    #[must_use]
    pub const fn node_budget(mut self, max_nodes: usize, reserve: usize) -> Self {
        self.max_nodes = max_nodes;
        self.node_reserve = reserve;
        self
    }

    /// Sets the sibling merge threshold.
    #[must_use]
    pub const fn merge_threshold_u64s(mut self, u64s: u64) -> Self {
        self.merge_threshold_u64s = u64s;
        self
    }

    /// Sets the update slack per transaction.
    #[must_use]
    pub const fn update_slack(mut self, slack: usize) -> Self {
        self.update_slack = slack;
        self
    }

    /// Sets the largest extent key size and the block size.
    #[must_use]
    pub const fn key_size_max(mut self, sectors: u64, block_bits: u32) -> Self {
        self.key_size_max = sectors;
        self.block_bits = block_bits;
        self
    }

    /// Enables journal sequence stamping of key versions.
    #[must_use]
    pub const fn journal_seq_verify(mut self, value: bool) -> Self {
        self.journal_seq_verify = value;
        self
    }

    /// Sets the filesystem capacity in sectors.
    #[must_use]
    pub const fn capacity_sectors(mut self, sectors: u64) -> Self {
        self.capacity_sectors = sectors;
        self
    }

    /// Opens the store read-only.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Largest extent a range delete may cover in one key, rounded down to
    /// whole blocks.
    #[must_use]
    pub const fn max_delete_sectors(&self) -> u64 {
        self.key_size_max & (!0u64 << self.block_bits)
    }
}

//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up test stores
//! and common test scenarios.

use cowbtree_core::{Config, NodeImages, Store};
use cowbtree_storage::FileBackend;
use std::path::{Path, PathBuf};
use std::sync::Once;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber writing to the test output.
///
/// The filter comes from `RUST_LOG`, defaulting to `cowbtree_core=info`.
/// Safe to call from every test.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cowbtree_core=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

/// Configuration with small leaves and journal entries, so splits, merges
/// and entry rollover happen after a handful of keys.
#[must_use]
pub fn small_config() -> Config {
    Config::new()
        .node_capacity_u64s(48)
        .merge_threshold_u64s(16)
        .journal_entry_u64s(256)
        .journal_buckets(16)
        .pin_window(64)
}

/// A test store with automatic cleanup.
pub struct TestStore {
    /// The store instance.
    pub store: Store,
    config: Config,
    images: NodeImages,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a new in-memory test store.
    pub fn memory() -> Self {
        Self::memory_with(Config::new())
    }

    /// Creates a new in-memory test store with `config`.
    pub fn memory_with(config: Config) -> Self {
        Self {
            store: Store::new(config.clone()).expect("Failed to open in-memory store"),
            config,
            images: NodeImages::new(),
            temp_dir: None,
        }
    }

    /// Creates a new store whose journal lives in a temporary file.
    pub fn file() -> Self {
        Self::file_with(Config::new())
    }

    /// Creates a new file-backed store with `config`.
    pub fn file_with(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let images = NodeImages::new();
        let store = open_file_store(&config, &journal_path(temp_dir.path()), &images);
        Self {
            store,
            config,
            images,
            temp_dir: Some(temp_dir),
        }
    }

    /// Closes the store and opens it again from its journal file and node
    /// images, replaying the journal.
    ///
    /// # Panics
    ///
    /// Panics if the store is in memory.
    #[must_use]
    pub fn reopen(self) -> Self {
        let Self {
            store,
            config,
            images,
            temp_dir,
        } = self;
        let dir = temp_dir.expect("Only file stores can be reopened");
        drop(store);
        let store = open_file_store(&config, &journal_path(dir.path()), &images);
        Self {
            store,
            config,
            images,
            temp_dir: Some(dir),
        }
    }

    /// Path of the journal file, if file-based.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| journal_path(d.path()))
    }
}

fn journal_path(dir: &Path) -> PathBuf {
    dir.join("journal.log")
}

fn open_file_store(config: &Config, path: &Path, images: &NodeImages) -> Store {
    let log = FileBackend::open(path).expect("Failed to open journal file");
    Store::recover(config.clone(), Box::new(log), images.clone()).expect("Failed to open file store")
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs a test with a temporary in-memory store.
///
/// # Example
///
/// ```rust,ignore
/// use cowbtree_testkit::with_temp_store;
///
/// #[test]
/// fn my_test() {
///     with_temp_store(|store| {
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&Store) -> R,
{
    let test_store = TestStore::memory();
    f(&test_store.store)
}

/// Runs a test with a temporary file-backed store.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&Store, &Path) -> R,
{
    let test_store = TestStore::file();
    let path = test_store.path().expect("File store should have a path");
    f(&test_store.store, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use cowbtree_core::{BtreeId, CommitFlags, DeviceId, DeviceSet, Key, Pos};

    /// Value stored by the scenario helpers for `offset`.
    #[must_use]
    pub fn value_for(offset: u64) -> Vec<u8> {
        offset.to_le_bytes().to_vec()
    }

    /// Creates a store holding `count` dirents in inode 1, at offsets
    /// `0..count`.
    pub fn populated_store(count: u64) -> TestStore {
        let test_store = TestStore::memory_with(small_config());
        for offset in 0..count {
            let pos = Pos::new(1, offset);
            test_store
                .btree_insert(BtreeId::Dirents, Key::inline(pos, value_for(offset)), None, None, CommitFlags::NONE)
                .expect("Failed to insert dirent");
        }
        test_store
    }

    /// Creates a store holding one extent per `(start, size)` in inode 1,
    /// all on device 0.
    pub fn extents_store(extents: &[(u64, u64)]) -> TestStore {
        let test_store = TestStore::memory();
        let devs = DeviceSet::single(DeviceId::new(0));
        for &(start, size) in extents {
            test_store
                .btree_insert(BtreeId::Extents, Key::extent(1, start, size, devs), None, None, CommitFlags::NONE)
                .expect("Failed to insert extent");
        }
        test_store
    }
}

//! Crash recovery testing.
//!
//! A crash is simulated by dropping the store and reopening it from copies
//! of the journal device and the node images, which is everything a real
//! crash would leave behind. [`CrashableBackend`] can also tear a journal
//! write part way through or fail a sync.
//!
//! ## Test Strategy
//!
//! 1. **Crash after flush** - Flushed commits must survive
//! 2. **Crash before flush** - Commits still in the open entry are lost
//! 3. **Torn write** - A partial entry is cut off and earlier entries replay
//! 4. **Atomic transactions** - A multi-tree transaction survives whole or not at all
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cowbtree_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::new();
//! assert!(harness.test_committed_data_survives().passed);
//! ```

use crate::fixtures::scenarios::value_for;
use cowbtree_core::{BtreeId, CommitFlags, Config, CoreResult, IterFlags, Key, KeyValue, NodeImages, Pos, Store};
use cowbtree_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Crash while commits sit in the open journal entry.
    BeforeFlush,
    /// Crash after the journal entry was written.
    AfterFlush,
    /// Crash part way through writing a journal entry.
    DuringWrite,
    /// Crash after leaves were written and the journal reclaimed.
    AfterNodeWrite,
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Where the crash was simulated.
    pub crash_point: CrashPoint,
    /// Expected keys after recovery.
    pub expected_keys: usize,
    /// Actual keys after recovery.
    pub actual_keys: usize,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a result comparing expected and actual key counts.
    pub fn check(description: &str, crash_point: CrashPoint, expected: usize, actual: usize) -> Self {
        Self {
            passed: expected == actual,
            description: description.to_string(),
            crash_point,
            expected_keys: expected,
            actual_keys: actual,
            error: (expected != actual).then(|| format!("expected {expected} keys, found {actual}")),
        }
    }

    /// Creates a failing result from an error.
    pub fn error(description: &str, crash_point: CrashPoint, expected: usize, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            crash_point,
            expected_keys: expected,
            actual_keys: 0,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug)]
struct CrashState {
    crash_after_bytes: AtomicU64,
    bytes_written: AtomicU64,
    crashed: AtomicBool,
    fail_on_sync: AtomicBool,
}

/// Handle for arming a [`CrashableBackend`] the store owns.
#[derive(Debug, Clone)]
pub struct CrashControl {
    state: Arc<CrashState>,
}

impl CrashControl {
    fn new() -> Self {
        Self {
            state: Arc::new(CrashState {
                crash_after_bytes: AtomicU64::new(u64::MAX),
                bytes_written: AtomicU64::new(0),
                crashed: AtomicBool::new(false),
                fail_on_sync: AtomicBool::new(false),
            }),
        }
    }

    /// Crashes once `bytes` more bytes have been appended; the write that
    /// crosses the limit is torn.
    pub fn crash_after(&self, bytes: u64) {
        let written = self.state.bytes_written.load(Ordering::SeqCst);
        self.state.crash_after_bytes.store(written + bytes, Ordering::SeqCst);
    }

    /// Sets whether sync should fail.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.state.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Bytes appended so far.
    pub fn bytes_written(&self) -> u64 {
        self.state.bytes_written.load(Ordering::SeqCst)
    }

    /// Returns whether the backend has crashed.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Disarms every failure.
    pub fn reset(&self) {
        self.state.crash_after_bytes.store(u64::MAX, Ordering::SeqCst);
        self.state.bytes_written.store(0, Ordering::SeqCst);
        self.state.crashed.store(false, Ordering::SeqCst);
        self.state.fail_on_sync.store(false, Ordering::SeqCst);
    }
}

/// A journal device that can tear writes and fail syncs.
#[derive(Debug)]
pub struct CrashableBackend {
    inner: InMemoryBackend,
    control: CrashControl,
}

impl CrashableBackend {
    /// Wraps `inner`, returning the backend and its control handle.
    pub fn new(inner: InMemoryBackend) -> (Self, CrashControl) {
        let control = CrashControl::new();
        (
            Self {
                inner,
                control: control.clone(),
            },
            control,
        )
    }

    fn crash(&self, message: &str) -> StorageError {
        self.control.state.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(io::Error::other(message.to_string()))
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let state = &self.control.state;
        if state.crashed.load(Ordering::SeqCst) {
            return Err(self.crash("device is gone"));
        }
        let current = state.bytes_written.fetch_add(data.len() as u64, Ordering::SeqCst);
        let threshold = state.crash_after_bytes.load(Ordering::SeqCst);

        if current + data.len() as u64 > threshold {
            let partial = threshold.saturating_sub(current) as usize;
            if partial > 0 {
                let _ = self.inner.append(&data[..partial]);
            }
            return Err(self.crash("simulated crash during write"));
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.control.state.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.crash("simulated crash during sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// Test harness for crash recovery scenarios.
pub struct CrashRecoveryHarness {
    config: Config,
    device: InMemoryBackend,
    images: NodeImages,
    control: Option<CrashControl>,
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Creates a harness with a default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::new())
    }

    /// Creates a harness whose stores use `config`.
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            device: InMemoryBackend::new(),
            images: NodeImages::new(),
            control: None,
            results: Vec::new(),
        }
    }

    /// Opens a store on the current device and node images.
    ///
    /// # Errors
    ///
    /// Returns the error recovery hit.
    pub fn open(&mut self) -> CoreResult<Store> {
        let (backend, control) = CrashableBackend::new(self.device.clone());
        self.control = Some(control);
        Store::recover(self.config.clone(), Box::new(backend), self.images.clone())
    }

    /// Control handle of the most recently opened store's device.
    ///
    /// # Panics
    ///
    /// Panics if no store was opened yet.
    pub fn control(&self) -> &CrashControl {
        self.control.as_ref().expect("open a store first")
    }

    /// Drops `store` without flushing and reopens from what survived.
    ///
    /// # Errors
    ///
    /// Returns the error recovery hit.
    pub fn crash_and_recover(&mut self, store: Store) -> CoreResult<Store> {
        drop(store);
        self.device = self.device.snapshot();
        self.images = self.images.snapshot();
        self.open()
    }

    /// Clears the device and node images.
    pub fn reset(&mut self) {
        self.device = InMemoryBackend::new();
        self.images = NodeImages::new();
        self.control = None;
    }

    fn record(&mut self, result: CrashRecoveryResult) -> CrashRecoveryResult {
        debug!(
            scenario = %result.description,
            passed = result.passed,
            expected = result.expected_keys,
            actual = result.actual_keys,
            "crash scenario finished"
        );
        self.results.push(result.clone());
        result
    }

    fn run(
        &mut self,
        description: &str,
        crash_point: CrashPoint,
        expected: usize,
        scenario: impl FnOnce(&mut Self) -> CoreResult<usize>,
    ) -> CrashRecoveryResult {
        self.reset();
        let result = match scenario(self) {
            Ok(actual) => CrashRecoveryResult::check(description, crash_point, expected, actual),
            Err(err) => CrashRecoveryResult::error(description, crash_point, expected, &err.to_string()),
        };
        self.record(result)
    }

    /// Tests that commits survive a crash once their entry was flushed.
    pub fn test_committed_data_survives(&mut self) -> CrashRecoveryResult {
        self.run("Flushed commits survive a crash", CrashPoint::AfterFlush, 20, |h| {
            let store = h.open()?;
            insert_dirents(&store, 0..20)?;
            store.flush_journal()?;

            let store = h.crash_and_recover(store)?;
            Ok(count_dirents(&store, 0..20))
        })
    }

    /// Tests that commits still in the open entry are lost, and only they.
    pub fn test_unflushed_data_lost(&mut self) -> CrashRecoveryResult {
        self.run("Unflushed commits are lost", CrashPoint::BeforeFlush, 5, |h| {
            let store = h.open()?;
            insert_dirents(&store, 0..5)?;
            store.flush_journal()?;
            insert_dirents(&store, 5..10)?;

            let store = h.crash_and_recover(store)?;
            Ok(count_dirents(&store, 0..10))
        })
    }

    /// Tests that a torn journal write is cut off and everything before it
    /// replays.
    pub fn test_torn_write_truncated(&mut self) -> CrashRecoveryResult {
        self.run("Torn journal write is truncated", CrashPoint::DuringWrite, 8, |h| {
            let store = h.open()?;
            insert_dirents(&store, 0..8)?;
            store.flush_journal()?;
            insert_dirents(&store, 8..16)?;
            h.control().crash_after(10);
            if store.flush_journal().is_ok() {
                return Err(cowbtree_core::CoreError::invalid_operation("flush survived a crash"));
            }

            let store = h.crash_and_recover(store)?;
            store.btree_insert(
                BtreeId::Dirents,
                Key::inline(Pos::new(1, 100), value_for(100)),
                None,
                None,
                CommitFlags::NONE,
            )?;
            Ok(count_dirents(&store, 0..16))
        })
    }

    /// Tests that leaves written before the crash are loaded and the
    /// journal written after them replays on top.
    pub fn test_recovery_after_node_write(&mut self) -> CrashRecoveryResult {
        self.run("Written leaves and later journal combine", CrashPoint::AfterNodeWrite, 30, |h| {
            let store = h.open()?;
            insert_dirents(&store, 0..20)?;
            store.flush_all_pins()?;
            insert_dirents(&store, 20..30)?;
            store.flush_journal()?;

            let store = h.crash_and_recover(store)?;
            let store = h.crash_and_recover(store)?;
            Ok(count_dirents(&store, 0..30))
        })
    }

    /// Tests that an inode and its dirent, committed together, are recovered
    /// together.
    pub fn test_atomic_transaction(&mut self) -> CrashRecoveryResult {
        self.run("Multi-tree transaction is all or nothing", CrashPoint::BeforeFlush, 2, |h| {
            let store = h.open()?;
            create_file(&store, 40)?;
            store.flush_journal()?;
            create_file(&store, 41)?;

            let store = h.crash_and_recover(store)?;
            let mut found = 0;
            for inum in [40, 41] {
                let inode = store.get(BtreeId::Inodes, Pos::new(inum, 0)).is_some();
                let dirent = store.get(BtreeId::Dirents, Pos::new(2, inum)).is_some();
                if inode != dirent {
                    return Err(cowbtree_core::CoreError::invalid_operation(format!(
                        "inode {inum} recovered without its dirent"
                    )));
                }
                found += usize::from(inode) + usize::from(dirent);
            }
            Ok(found)
        })
    }

    /// Runs every scenario.
    pub fn run_all(&mut self) -> &[CrashRecoveryResult] {
        self.test_committed_data_survives();
        self.test_unflushed_data_lost();
        self.test_torn_write_truncated();
        self.test_recovery_after_node_write();
        self.test_atomic_transaction();
        &self.results
    }

    /// Returns true if every recorded scenario passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}

impl Default for CrashRecoveryHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_dirents(store: &Store, offsets: std::ops::Range<u64>) -> CoreResult<()> {
    for offset in offsets {
        store.btree_insert(
            BtreeId::Dirents,
            Key::inline(Pos::new(1, offset), value_for(offset)),
            None,
            None,
            CommitFlags::NONE,
        )?;
    }
    Ok(())
}

fn count_dirents(store: &Store, offsets: std::ops::Range<u64>) -> usize {
    offsets
        .filter(|&offset| {
            store
                .get(BtreeId::Dirents, Pos::new(1, offset))
                .is_some_and(|k| matches!(&k.value, KeyValue::Inline(v) if v.as_ref() == value_for(offset).as_slice()))
        })
        .count()
}

fn create_file(store: &Store, inum: u64) -> CoreResult<()> {
    store.trans_do(None, CommitFlags::ATOMIC, |trans| {
        let inode = trans.get_iter(BtreeId::Inodes, Pos::new(inum, 0), IterFlags::INTENT);
        trans.update(inode, Key::inline(Pos::new(inum, 0), value_for(inum)));
        let dirent = trans.get_iter(BtreeId::Dirents, Pos::new(2, inum), IterFlags::INTENT);
        trans.update(dirent, Key::inline(Pos::new(2, inum), value_for(inum)));
        Ok(())
    })
}

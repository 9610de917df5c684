//! Store handle and recovery.

use crate::accounting::{Accounting, DataType, DiskReservation, Usage};
use crate::btree::{NodeBudget, NodeImages, NodeIo, Tree};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::journal::{Journal, ReclaimScheduler};
use crate::key::Key;
use crate::types::{BtreeId, DeviceId, Pos};
use crate::update::{BtreeTrans, CommitFlags};
use cowbtree_storage::{InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Countdown fault injector for the commit path.
///
/// After [`fail_next`](Self::fail_next)`(n)`, the next `n` commit attempts
/// that reach the write-locked phase are interrupted before touching any
/// node.
#[derive(Debug, Default)]
pub struct FaultInjector {
    remaining: AtomicU64,
    injected: AtomicU64,
}

impl FaultInjector {
    /// Arms the injector for the next `n` attempts.
    pub fn fail_next(&self, n: u64) {
        self.remaining.store(n, Ordering::Release);
    }

    /// Consumes one armed fault, returning true if the caller must fail.
    pub fn should_fail(&self) -> bool {
        let hit = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            self.injected.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Number of faults injected so far.
    #[must_use]
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }
}

/// Everything transactions share.
pub(crate) struct StoreInner {
    pub(crate) config: Config,
    pub(crate) journal: Arc<Journal>,
    pub(crate) images: NodeImages,
    pub(crate) trees: Vec<Tree>,
    pub(crate) budget: Arc<NodeBudget>,
    pub(crate) accounting: Accounting,
    pub(crate) faults: FaultInjector,
    next_trans: AtomicU64,
}

impl StoreInner {
    pub(crate) fn tree(&self, btree_id: BtreeId) -> &Tree {
        &self.trees[usize::from(btree_id.as_u8())]
    }

    /// Lock owner id for a new transaction. Never zero.
    pub(crate) fn next_trans_id(&self) -> u64 {
        self.next_trans.fetch_add(1, Ordering::Relaxed)
    }

    /// Makes a read-only store writable.
    pub(crate) fn read_write_early(&self) -> CoreResult<()> {
        if self.journal.has_failed() {
            return Err(CoreError::ReadOnly);
        }
        if self.journal.is_read_only() {
            self.journal.set_read_only(false);
            info!("store going read-write");
        }
        Ok(())
    }
}

/// The main store handle.
///
/// A store owns the journal, one [`Tree`] per [`BtreeId`], the node budget
/// and the accounting state. All updates go through transactions:
///
/// ```rust,ignore
/// use cowbtree_core::{CommitFlags, IterFlags, Key, Pos, Store, BtreeId};
///
/// let store = Store::new(Config::default())?;
/// store.trans_do(None, CommitFlags::NONE, |trans| {
///     let iter = trans.get_iter(BtreeId::Dirents, Pos::new(1, 7), IterFlags::INTENT);
///     trans.update(iter, Key::inline(Pos::new(1, 7), &b"name"[..]));
///     Ok(())
/// })?;
/// ```
///
/// # Recovery
///
/// [`Store::recover`] rebuilds the trees from durable node images and
/// replays the journal on top of them.
pub struct Store {
    inner: StoreInner,
    reclaim: Mutex<Option<ReclaimScheduler>>,
}

impl Store {
    /// Opens a fresh in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be opened.
    pub fn new(config: Config) -> CoreResult<Self> {
        Self::recover(config, Box::new(InMemoryBackend::new()), NodeImages::new())
    }

    /// Opens a store on `log`, loading leaves from `images` and replaying
    /// every journal entry from the newest entry's `last_seq` onwards.
    ///
    /// Each replayed entry keeps its pin list referenced until all its keys
    /// are back in the trees. Accounting is recounted from the trees once
    /// replay is done.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupt or a replayed key cannot be
    /// inserted.
    pub fn recover(config: Config, log: Box<dyn StorageBackend>, images: NodeImages) -> CoreResult<Self> {
        let (journal, replay) = Journal::open(&config, log)?;
        let journal = Arc::new(journal);
        let io = Arc::new(NodeIo {
            journal: Arc::clone(&journal),
            images: images.clone(),
            capacity_u64s: config.node_capacity_u64s,
        });
        let budget = Arc::new(NodeBudget::new(config.max_nodes, config.node_reserve));
        let trees = BtreeId::ALL
            .iter()
            .map(|&id| Tree::new(id, images.keys(id), Arc::clone(&io), Arc::clone(&budget)))
            .collect();
        let accounting = Accounting::new(config.capacity_sectors);

        let store = Self {
            inner: StoreInner {
                config,
                journal,
                images,
                trees,
                budget,
                accounting,
                faults: FaultInjector::default(),
                next_trans: AtomicU64::new(1),
            },
            reclaim: Mutex::new(None),
        };

        let entries = replay.len();
        let mut keys = 0usize;
        for entry in replay {
            store.inner.journal.set_replay_seq(entry.seq);
            for jkey in entry.keys {
                store.btree_insert(
                    jkey.btree_id,
                    jkey.key,
                    None,
                    None,
                    CommitFlags::JOURNAL_REPLAY
                        | CommitFlags::NOMARK
                        | CommitFlags::NOCHECK_RW
                        | CommitFlags::NOFAIL,
                )?;
                keys += 1;
            }
            trace!(seq = entry.seq, "journal entry replayed");
            store.inner.journal.replayed(entry.seq);
        }
        store.inner.journal.finish_replay();

        store.inner.accounting.gc_recount(&store.inner.trees);
        store
            .inner
            .accounting
            .replicas_gc(DataType::Journal, store.inner.journal.pins().window_devs());

        info!(
            entries,
            keys,
            seq = store.inner.journal.current_seq(),
            "store recovered"
        );
        Ok(store)
    }

    /// Starts a new transaction.
    #[must_use]
    pub fn trans(&self) -> BtreeTrans<'_> {
        BtreeTrans::new(&self.inner)
    }

    /// Store configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The journal.
    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.inner.journal
    }

    /// Durable node images. Clones share storage with the store.
    #[must_use]
    pub fn images(&self) -> &NodeImages {
        &self.inner.images
    }

    /// Accounting state.
    #[must_use]
    pub fn accounting(&self) -> &Accounting {
        &self.inner.accounting
    }

    /// Current usage totals.
    #[must_use]
    pub fn usage(&self) -> Usage {
        self.inner.accounting.usage()
    }

    /// The leaves of `btree_id`.
    #[must_use]
    pub fn tree(&self, btree_id: BtreeId) -> &Tree {
        self.inner.tree(btree_id)
    }

    /// Live leaves across all trees.
    #[must_use]
    pub fn live_nodes(&self) -> usize {
        self.inner.budget.live()
    }

    /// The fault injector.
    #[must_use]
    pub fn faults(&self) -> &FaultInjector {
        &self.inner.faults
    }

    /// Returns the live key stored exactly at `pos`.
    #[must_use]
    pub fn get(&self, btree_id: BtreeId, pos: Pos) -> Option<Key> {
        let tree = self.tree(btree_id);
        loop {
            let node = tree.lookup(pos);
            node.lock().lock_read();
            let found = {
                let data = node.data();
                (!data.is_dying()).then(|| data.get(pos).filter(|k| !k.is_whiteout()).cloned())
            };
            node.lock().unlock_read();
            if let Some(found) = found {
                return found;
            }
        }
    }

    /// Returns every live key of `btree_id` in position order.
    #[must_use]
    pub fn keys(&self, btree_id: BtreeId) -> Vec<Key> {
        let tree = self.tree(btree_id);
        let mut keys = Vec::new();
        let mut pos = Pos::MIN;
        loop {
            let node = tree.lookup(pos);
            node.lock().lock_read();
            let live = {
                let data = node.data();
                (!data.is_dying()).then(|| data.live_keys())
            };
            node.lock().unlock_read();
            let Some(live) = live else {
                continue;
            };
            keys.extend(live);
            if node.max() == Pos::MAX {
                return keys;
            }
            pos = node.max().successor();
        }
    }

    /// Writes the open journal entry and waits for it, then records the
    /// journal's device sets in the replicas table.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal failed.
    pub fn flush_journal(&self) -> CoreResult<()> {
        self.inner.journal.meta()?;
        for devs in self.inner.journal.pins().window_devs() {
            self.inner.accounting.mark_replicas(DataType::Journal, devs);
        }
        Ok(())
    }

    /// Writes back every dirty node and trims the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal failed.
    pub fn flush_all_pins(&self) -> CoreResult<()> {
        self.inner.journal.flush_all_pins()
    }

    /// Flushes everything still needing `dev` (or, with `None`, every entry
    /// with too few replicas) and drops journal replicas entries no
    /// retained entry uses.
    ///
    /// # Errors
    ///
    /// Returns the flush error; the replicas table is left untouched then.
    pub fn flush_device_pins(&self, dev: Option<DeviceId>) -> CoreResult<()> {
        self.inner.journal.flush_device_pins(dev)?;
        self.inner
            .accounting
            .replicas_gc(DataType::Journal, self.inner.journal.pins().window_devs());
        Ok(())
    }

    /// Starts background reclaim. Does nothing if it is already running.
    pub fn start_reclaim(&self) {
        let mut reclaim = self.reclaim.lock();
        if reclaim.as_ref().is_some_and(ReclaimScheduler::is_running) {
            return;
        }
        *reclaim = Some(ReclaimScheduler::start(Arc::clone(&self.inner.journal)));
        debug!("reclaim started");
    }

    /// Stops background reclaim and waits for the thread to exit.
    pub fn stop_reclaim(&self) {
        if self.reclaim.lock().take().is_some() {
            debug!("reclaim stopped");
        }
    }

    /// Asks background reclaim for a pass. Without a running scheduler the
    /// pass runs on the calling thread.
    pub fn kick_reclaim(&self) {
        match self.reclaim.lock().as_ref() {
            Some(reclaim) if reclaim.is_running() => reclaim.kick(),
            _ => self.inner.journal.reclaim_work(),
        }
    }

    /// Returns true while background reclaim runs.
    #[must_use]
    pub fn reclaim_running(&self) -> bool {
        self.reclaim.lock().as_ref().is_some_and(ReclaimScheduler::is_running)
    }

    /// Makes the store read-only. Background reclaim stops on its next pass.
    pub fn go_read_only(&self) {
        self.inner.journal.set_read_only(true);
        info!("store going read-only");
    }

    /// Makes a read-only store writable again.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] if the journal failed.
    pub fn read_write_early(&self) -> CoreResult<()> {
        self.inner.read_write_early()
    }

    /// Returns true if the store is read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.journal.is_read_only()
    }

    /// Recounts usage and replicas from the tree contents.
    pub fn gc(&self) {
        self.inner.accounting.gc_recount(&self.inner.trees);
    }

    /// Reserves `sectors` of free space.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSpace`] unless `nofail` is set.
    pub fn disk_reservation_get(&self, sectors: u64, nofail: bool) -> CoreResult<DiskReservation> {
        self.inner.accounting.disk_reservation_get(sectors, nofail)
    }

    /// Returns what is left of `res`.
    pub fn disk_reservation_put(&self, res: &mut DiskReservation) {
        self.inner.accounting.disk_reservation_put(res);
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("journal", &self.inner.journal)
            .field("live_nodes", &self.live_nodes())
            .field("accounting", &self.inner.accounting)
            .field("reclaim_running", &self.reclaim_running())
            .finish_non_exhaustive()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.stop_reclaim();
    }
}

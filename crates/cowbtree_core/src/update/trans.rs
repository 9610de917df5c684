//! Transactions.
//!
//! A transaction owns a set of iterators into the store's B-trees and the
//! updates queued against them. Iterators with [`IterFlags::INTENT`] keep an
//! intent lock on their leaf; the transaction counts how many of its
//! iterators sit on each leaf so every leaf is locked once.
//!
//! Intent locks are only waited for when every leaf the transaction already
//! holds orders strictly before the one wanted, by `(btree id, leaf min)`.
//! Anything else is a try-lock, and a failed try-lock restarts the
//! transaction with [`CoreError::Interrupted`]: the caller drops its locks
//! with [`BtreeTrans::traverse_all`] (or [`BtreeTrans::begin`]) and retries.

use crate::btree::{lookup_pos, BtreeIter, IterFlags, IterId, Node, Uptodate};
use crate::error::{CoreError, CoreResult};
use crate::journal::{JournalPreres, JournalRes};
use crate::key::Key;
use crate::store::StoreInner;
use crate::types::{BtreeId, NodeId, Pos};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Inline capacity of a transaction's iterator and update arrays.
pub const TRANS_INLINE: usize = 8;

/// A pending update.
#[derive(Debug, Clone)]
pub(crate) struct Update {
    pub(crate) iter: IterId,
    pub(crate) btree_id: BtreeId,
    pub(crate) key: Key,
    pub(crate) triggered: bool,
}

struct Held {
    node: Arc<Node>,
    refs: usize,
}

/// A transaction against a [`Store`](crate::Store).
pub struct BtreeTrans<'a> {
    pub(crate) c: &'a StoreInner,
    id: u64,
    pub(crate) iters: SmallVec<[BtreeIter; TRANS_INLINE]>,
    pub(crate) updates: SmallVec<[Update; TRANS_INLINE]>,
    held: SmallVec<[Held; TRANS_INLINE]>,
    pub(crate) journal_res: JournalRes,
    pub(crate) preres: JournalPreres,
    pub(crate) nowait: bool,
    pub(crate) commit_seq: u64,
    pub(crate) restarts: u64,
}

impl<'a> BtreeTrans<'a> {
    pub(crate) fn new(c: &'a StoreInner) -> Self {
        Self {
            c,
            id: c.next_trans_id(),
            iters: SmallVec::new(),
            updates: SmallVec::new(),
            held: SmallVec::new(),
            journal_res: JournalRes::default(),
            preres: JournalPreres::default(),
            nowait: false,
            commit_seq: 0,
            restarts: 0,
        }
    }

    /// Transaction id; owner of the transaction's intent locks.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Times a commit of this transaction restarted internally.
    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Number of pending updates.
    #[must_use]
    pub fn nr_updates(&self) -> usize {
        self.updates.len()
    }

    /// Number of iterators.
    #[must_use]
    pub fn nr_iters(&self) -> usize {
        self.iters.len()
    }

    /// Creates an iterator over `btree_id` positioned at `pos`.
    ///
    /// For extent trees the position is a sector: the iterator returns the
    /// extents ending after it.
    pub fn get_iter(&mut self, btree_id: BtreeId, pos: Pos, flags: IterFlags) -> IterId {
        self.iters.push(BtreeIter::new(btree_id, pos, flags));
        IterId(self.iters.len() - 1)
    }

    fn iter(&self, iter: IterId) -> &BtreeIter {
        self.iters
            .get(iter.0)
            .unwrap_or_else(|| panic!("stale iterator {}", iter.0))
    }

    fn iter_mut(&mut self, iter: IterId) -> &mut BtreeIter {
        self.iters
            .get_mut(iter.0)
            .unwrap_or_else(|| panic!("stale iterator {}", iter.0))
    }

    /// Current position of `iter`.
    ///
    /// # Panics
    ///
    /// Panics if `iter` does not belong to this transaction.
    #[must_use]
    pub fn iter_pos(&self, iter: IterId) -> Pos {
        self.iter(iter).pos
    }

    /// Cached state of `iter`.
    ///
    /// # Panics
    ///
    /// Panics if `iter` does not belong to this transaction.
    #[must_use]
    pub fn iter_uptodate(&self, iter: IterId) -> Uptodate {
        self.iter(iter).uptodate
    }

    /// Leaf `iter` is positioned on, if traversed.
    ///
    /// # Panics
    ///
    /// Panics if `iter` does not belong to this transaction.
    #[must_use]
    pub fn iter_node(&self, iter: IterId) -> Option<Arc<Node>> {
        self.iter(iter).node.clone()
    }

    /// Leaf of a traversed iterator.
    pub(crate) fn iter_leaf(&self, iter: IterId) -> Arc<Node> {
        match &self.iter(iter).node {
            Some(node) => node.clone(),
            None => panic!("iterator {} used before traversal", iter.0),
        }
    }

    /// Moves `iter` to `pos`. The leaf is kept if it still covers the new
    /// position.
    ///
    /// # Panics
    ///
    /// Panics if `iter` does not belong to this transaction.
    pub fn set_pos(&mut self, iter: IterId, pos: Pos) {
        let it = self.iter_mut(iter);
        it.pos = pos;
        let search = it.search_pos();
        if it.node.as_ref().is_some_and(|n| n.covers(search)) {
            if it.uptodate == Uptodate::UpToDate {
                it.uptodate = Uptodate::NeedPeek;
            }
            return;
        }
        self.drop_iter_lock(iter.0);
        let it = &mut self.iters[iter.0];
        it.node = None;
        it.uptodate = Uptodate::NeedTraverse;
    }

    fn held_idx(&self, id: NodeId) -> Option<usize> {
        self.held.iter().position(|h| h.node.id() == id)
    }

    // Takes an intent lock on `node` for this transaction, waiting only if
    // that keeps the lock order. Returns false if the lock is busy.
    pub(crate) fn take_intent(&mut self, node: &Arc<Node>) -> bool {
        if let Some(idx) = self.held_idx(node.id()) {
            self.held[idx].refs += 1;
            return true;
        }
        let target = (node.btree_id(), node.min());
        let ordered = self
            .held
            .iter()
            .all(|h| (h.node.btree_id(), h.node.min()) < target);
        if !node.lock().try_intent(self.id) {
            if !ordered || self.nowait {
                return false;
            }
            node.lock().lock_intent(self.id);
        }
        self.held.push(Held {
            node: node.clone(),
            refs: 1,
        });
        true
    }

    // Retakes a dropped intent lock if the leaf is unchanged since `seq`.
    fn retake_intent(&mut self, node: &Arc<Node>, seq: u64) -> bool {
        if let Some(idx) = self.held_idx(node.id()) {
            self.held[idx].refs += 1;
            return true;
        }
        if !node.lock().relock_intent(self.id, seq) {
            return false;
        }
        self.held.push(Held {
            node: node.clone(),
            refs: 1,
        });
        true
    }

    pub(crate) fn put_intent(&mut self, id: NodeId) {
        let Some(idx) = self.held_idx(id) else {
            panic!("{id} is not intent locked by transaction {}", self.id);
        };
        self.held[idx].refs -= 1;
        if self.held[idx].refs == 0 {
            let held = self.held.swap_remove(idx);
            held.node.lock().unlock_intent(self.id);
        }
    }

    fn drop_iter_lock(&mut self, idx: usize) {
        let it = &mut self.iters[idx];
        if !it.locked {
            return;
        }
        it.locked = false;
        let id = it.node.as_ref().map(|n| n.id());
        if let Some(id) = id {
            self.put_intent(id);
        }
    }

    /// Positions `iter` on the leaf covering its position, taking the lock
    /// it wants.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Interrupted`] if the intent lock could not be
    /// taken without risking deadlock.
    ///
    /// # Panics
    ///
    /// Panics if `iter` does not belong to this transaction.
    pub fn traverse(&mut self, iter: IterId) -> CoreResult<()> {
        self.traverse_node(iter).map(|_| ())
    }

    pub(crate) fn traverse_node(&mut self, iter: IterId) -> CoreResult<Arc<Node>> {
        let idx = iter.0;
        let it = self.iter(iter);
        match (it.uptodate, &it.node) {
            (Uptodate::UpToDate | Uptodate::NeedPeek, Some(node)) => return Ok(node.clone()),
            (Uptodate::NeedRelock, Some(node)) => {
                let node = node.clone();
                if self.relock_iter(idx) {
                    return Ok(node);
                }
            }
            _ => {}
        }

        self.drop_iter_lock(idx);
        let it = &self.iters[idx];
        let (btree_id, search) = (it.btree_id, it.search_pos());
        let intent = it.flags.contains(IterFlags::INTENT);
        let tree = self.c.tree(btree_id);
        loop {
            let node = tree.lookup(search);
            if intent {
                if !self.take_intent(&node) {
                    trace!(trans = self.id, btree = %btree_id, pos = %search, "restart: traverse lock order");
                    return Err(CoreError::Interrupted);
                }
                if node.data().is_dying() {
                    self.put_intent(node.id());
                    continue;
                }
            } else if node.data().is_dying() {
                continue;
            }

            let it = &mut self.iters[idx];
            it.lock_seq = node.lock().seq();
            it.locked = intent;
            it.node = Some(node.clone());
            it.uptodate = Uptodate::UpToDate;
            return Ok(node);
        }
    }

    fn relock_iter(&mut self, idx: usize) -> bool {
        let it = &self.iters[idx];
        let Some(node) = it.node.clone() else {
            return false;
        };
        if !it.flags.contains(IterFlags::INTENT) {
            self.iters[idx].uptodate = Uptodate::UpToDate;
            return true;
        }
        if !self.retake_intent(&node, it.lock_seq) {
            return false;
        }
        if node.data().is_dying() {
            self.put_intent(node.id());
            return false;
        }
        let it = &mut self.iters[idx];
        it.locked = true;
        it.uptodate = Uptodate::UpToDate;
        true
    }

    /// Returns the first live key at or after `iter`'s position and moves
    /// the iterator onto it; for extent trees, the first extent ending after
    /// the position.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Interrupted`] if the iterator could not be
    /// traversed.
    ///
    /// # Panics
    ///
    /// Panics if `iter` does not belong to this transaction.
    pub fn peek(&mut self, iter: IterId) -> CoreResult<Option<Key>> {
        loop {
            let node = self.traverse_node(iter)?;
            let it = &self.iters[iter.0];
            let extents = it.is_extents();
            let from = if extents { lookup_pos(it.pos) } else { it.pos };

            let key = if it.locked {
                node.data().peek_from(from).cloned()
            } else {
                node.lock().lock_read();
                let data = node.data();
                if data.is_dying() {
                    drop(data);
                    node.lock().unlock_read();
                    let it = &mut self.iters[iter.0];
                    it.node = None;
                    it.uptodate = Uptodate::NeedTraverse;
                    continue;
                }
                let key = data.peek_from(from).cloned();
                drop(data);
                node.lock().unlock_read();
                key
            };

            match key {
                Some(key) => {
                    let it = &mut self.iters[iter.0];
                    it.pos = if extents { it.pos.max(key.start()) } else { key.pos };
                    it.uptodate = Uptodate::UpToDate;
                    return Ok(Some(key));
                }
                None if node.max() == Pos::MAX => return Ok(None),
                None => {
                    let next = if extents { node.max() } else { node.max().successor() };
                    self.set_pos(iter, next);
                }
            }
        }
    }

    /// Queues `key` to be written through `iter` at the next commit. A
    /// second update through the same iterator replaces the first.
    ///
    /// # Panics
    ///
    /// Panics if `iter` does not belong to this transaction, if the key does
    /// not start at the iterator's position, or if the transaction already
    /// holds as many updates as its iterators plus the configured slack.
    pub fn update(&mut self, iter: IterId, key: Key) {
        let it = self.iter_mut(iter);
        let start = if it.is_extents() { key.start() } else { key.pos };
        assert_eq!(start, it.pos, "update must start at the iterator position");
        it.flags |= IterFlags::KEEP_UNTIL_COMMIT;
        let btree_id = it.btree_id;

        if let Some(pending) = self.updates.iter_mut().find(|u| u.iter == iter) {
            pending.key = key;
            pending.triggered = false;
            return;
        }

        let limit = self.iters.len() + self.c.config.update_slack;
        assert!(
            self.updates.len() < limit,
            "transaction {} holds {} updates for {} iterators",
            self.id,
            self.updates.len(),
            self.iters.len()
        );
        self.updates.push(Update {
            iter,
            btree_id,
            key,
            triggered: false,
        });
    }

    /// Drops every lock the transaction holds. Iterators keep their leaf
    /// and can be relocked if it does not change meanwhile.
    pub fn unlock(&mut self) {
        for it in &mut self.iters {
            it.locked = false;
            if matches!(it.uptodate, Uptodate::UpToDate | Uptodate::NeedPeek) {
                it.uptodate = Uptodate::NeedRelock;
            }
        }
        for held in self.held.drain(..) {
            held.node.lock().unlock_intent(self.id);
        }
    }

    /// Retakes the locks dropped by [`unlock`](Self::unlock). Never waits.
    ///
    /// Returns false if a leaf changed or a lock is busy; the transaction
    /// must then be restarted.
    pub fn relock(&mut self) -> bool {
        for idx in 0..self.iters.len() {
            if self.iters[idx].uptodate == Uptodate::NeedRelock && !self.relock_iter(idx) {
                trace!(trans = self.id, iter = idx, "relock failed");
                return false;
            }
        }
        true
    }

    /// Drops every lock and re-traverses every iterator in lock order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Interrupted`] if the transaction may not block
    /// and a lock was busy.
    pub fn traverse_all(&mut self) -> CoreResult<()> {
        loop {
            self.unlock();
            for it in &mut self.iters {
                it.node = None;
                it.uptodate = Uptodate::NeedTraverse;
            }
            let mut order: SmallVec<[usize; TRANS_INLINE]> = (0..self.iters.len()).collect();
            order.sort_by_key(|&idx| self.iters[idx].order());

            let mut interrupted = false;
            for idx in order {
                match self.traverse_node(IterId(idx)) {
                    Ok(_) => {}
                    Err(err) if err.is_interrupted() && !self.nowait => {
                        interrupted = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            if !interrupted {
                return Ok(());
            }
            trace!(trans = self.id, "traverse_all raced with a leaf change, retrying");
        }
    }

    /// Resets the transaction for a new attempt: drops every lock, iterator
    /// and pending update. Iterator ids from before are invalid afterwards.
    pub fn begin(&mut self) {
        self.unlock();
        self.iters.clear();
        self.updates.clear();
    }

    /// Resets `KEEP_UNTIL_COMMIT` and releases intent locks taken only for a
    /// commit.
    pub(crate) fn downgrade(&mut self) {
        for idx in 0..self.iters.len() {
            let it = &mut self.iters[idx];
            it.flags.remove(IterFlags::KEEP_UNTIL_COMMIT);
            if !it.upgraded {
                continue;
            }
            it.upgraded = false;
            it.flags.remove(IterFlags::INTENT);
            self.drop_iter_lock(idx);
        }
    }

    /// Makes sure the iterator of update `idx` holds an intent lock on a
    /// live leaf, without waiting.
    pub(crate) fn upgrade_update_iter(&mut self, idx: usize) -> CoreResult<Arc<Node>> {
        let iter = self.updates[idx].iter;
        let it = &mut self.iters[iter.0];
        if !it.flags.contains(IterFlags::INTENT) {
            it.flags |= IterFlags::INTENT;
            it.upgraded = true;
            if let Some(node) = it.node.clone() {
                it.uptodate = Uptodate::NeedRelock;
                let seq = node.lock().seq();
                it.lock_seq = seq;
                if !self.relock_iter(iter.0) {
                    trace!(trans = self.id, iter = iter.0, "restart: upgrade failed");
                    return Err(CoreError::Interrupted);
                }
                return Ok(node);
            }
        }
        let saved = self.nowait;
        self.nowait = true;
        let node = self.traverse_node(iter);
        self.nowait = saved;
        node.inspect_err(|_| {
            trace!(trans = self.id, iter = iter.0, "restart: upgrade traverse failed");
        })
    }

    /// Refreshes the lock sequences of iterators on `node` after this
    /// transaction wrote it.
    pub(crate) fn refresh_lock_seq(&mut self, node: &Node) {
        let seq = node.lock().seq();
        for it in &mut self.iters {
            if it.node.as_ref().is_some_and(|n| n.id() == node.id()) {
                it.lock_seq = seq;
            }
        }
    }

    /// Moves iterators off leaves that were replaced.
    pub(crate) fn drop_dying(&mut self) {
        for idx in 0..self.iters.len() {
            let dying = self.iters[idx]
                .node
                .as_ref()
                .is_some_and(|n| n.data().is_dying());
            if dying {
                self.drop_iter_lock(idx);
                let it = &mut self.iters[idx];
                it.node = None;
                it.uptodate = Uptodate::NeedTraverse;
            }
        }
    }

    /// Puts back the updates the caller queued, dropping everything triggers
    /// added or changed, so triggers run again from scratch on the next
    /// attempt.
    pub(crate) fn reset_triggers(&mut self, original: &[Update], nr_iters: usize) {
        self.free_trigger_iters(nr_iters);
        self.updates.clear();
        self.updates.extend(original.iter().cloned());
    }

    /// Unlocks and removes the iterators from `nr_iters` on, which triggers
    /// created during a commit.
    pub(crate) fn free_trigger_iters(&mut self, nr_iters: usize) {
        for idx in nr_iters..self.iters.len() {
            self.drop_iter_lock(idx);
        }
        self.iters.truncate(nr_iters);
    }
}

impl Drop for BtreeTrans<'_> {
    fn drop(&mut self) {
        self.unlock();
        self.c.journal.preres_put(&mut self.preres);
    }
}

impl fmt::Debug for BtreeTrans<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtreeTrans")
            .field("id", &self.id)
            .field("iters", &self.iters.len())
            .field("updates", &self.updates.len())
            .field("held", &self.held.len())
            .field("restarts", &self.restarts)
            .finish_non_exhaustive()
    }
}

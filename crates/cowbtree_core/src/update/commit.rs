//! The commit path.
//!
//! A commit runs in attempts. Each attempt upgrades the updates' iterators
//! to intent locks, runs transactional triggers, takes a journal
//! pre-reservation, write locks every touched leaf once in sorted order and
//! then, under the write locks:
//!
//! 1. checks every leaf has room for its updates,
//! 2. checks the replicas table knows every new data placement,
//! 3. takes the journal reservation without blocking,
//! 4. applies accounting, inserts the keys and journals them.
//!
//! Steps 1 to 3 change nothing, so any of them can fail and send the
//! attempt to [`BtreeTrans::commit_error`], which fixes the cause with every
//! write lock dropped (splits the leaf, marks replicas, waits for journal
//! space) and retries. Step 4 cannot fail.

use super::flags::CommitFlags;
use super::trans::{BtreeTrans, Update, TRANS_INLINE};
use crate::accounting::{alloc_key, alloc_value, key_deltas, DataType, Deltas, DiskReservation};
use crate::btree::{IterFlags, IterId, Node, NodeData, ReserveLevel};
use crate::error::{CoreError, CoreResult};
use crate::journal::{jset_u64s, ResFlags};
use crate::key::Key;
use crate::types::{BtreeId, DeviceId, DeviceSet, Pos};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::trace;

/// Why an attempt stopped.
#[derive(Debug)]
pub(crate) enum InsertError {
    /// The leaf of update `usize` has no room.
    NodeFull(usize),
    /// Not enough free space for the new data.
    NoSpace,
    /// These replicas entries must be added first.
    NeedMarkReplicas(Vec<(DataType, DeviceSet)>),
    /// No journal space for this many u64s without blocking.
    NeedJournalRes(u64),
    /// Anything else, including restarts.
    Fatal(CoreError),
}

impl From<CoreError> for InsertError {
    fn from(err: CoreError) -> Self {
        Self::Fatal(err)
    }
}

type Attempt<T> = Result<T, InsertError>;

impl BtreeTrans<'_> {
    /// Commits every pending update atomically.
    ///
    /// Added data sectors are taken from `disk_res` when given. On success
    /// the journal sequence the updates were logged at is stored into
    /// `journal_seq` if it is larger than the value there, and the pending
    /// updates are cleared. They are cleared on error too.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Interrupted`] if the commit had to drop its locks and
    ///   [`CommitFlags::ATOMIC`] is set, if it would have blocked and
    ///   [`CommitFlags::NOWAIT`] is set, or if it would retry internally and
    ///   [`CommitFlags::NO_CLEAR_REPLICAS`] is set.
    /// - [`CoreError::NoSpace`] if the node budget or free space ran out.
    /// - [`CoreError::ReadOnly`] if the store is read-only.
    /// - [`CoreError::InvalidOperation`] for a key that can never fit a leaf.
    /// - Journal errors.
    pub fn commit(
        &mut self,
        mut disk_res: Option<&mut DiskReservation>,
        journal_seq: Option<&mut u64>,
        flags: CommitFlags,
    ) -> CoreResult<()> {
        if self.updates.is_empty() {
            return Ok(());
        }

        let nr_iters = self.iters.len();
        let ret = self.commit_updates(disk_res.as_deref_mut(), nr_iters, flags);

        self.free_trigger_iters(nr_iters);
        self.c.journal.preres_put(&mut self.preres);
        self.updates.clear();
        self.nowait = false;
        match ret {
            Ok(seq) => {
                if let Some(out) = journal_seq {
                    *out = (*out).max(seq);
                }
                Ok(())
            }
            Err(err) => {
                self.downgrade();
                self.unlock();
                Err(err)
            }
        }
    }

    fn commit_updates(
        &mut self,
        mut disk_res: Option<&mut DiskReservation>,
        nr_iters: usize,
        flags: CommitFlags,
    ) -> CoreResult<u64> {
        let c = self.c;
        if !flags.contains(CommitFlags::NOCHECK_RW) && c.journal.is_read_only() {
            if !flags.contains(CommitFlags::LAZY_RW) {
                return Err(CoreError::ReadOnly);
            }
            c.read_write_early()?;
        }

        self.nowait = flags.contains(CommitFlags::NOWAIT);
        let original: SmallVec<[Update; TRANS_INLINE]> = self.updates.clone();
        loop {
            let err = match self.do_commit(disk_res.as_deref_mut(), flags) {
                Ok(seq) => return Ok(seq),
                Err(err) => err,
            };
            self.commit_error(err, &original, nr_iters, flags)?;
            self.restarts += 1;
            if flags.contains(CommitFlags::NO_CLEAR_REPLICAS) {
                trace!(trans = self.id(), "restart: internal retry not allowed");
                return Err(CoreError::Interrupted);
            }
        }
    }

    fn do_commit(&mut self, mut disk_res: Option<&mut DiskReservation>, flags: CommitFlags) -> Attempt<u64> {
        let c = self.c;
        let capacity = c.config.node_capacity_u64s;

        let mut idx = 0;
        while idx < self.updates.len() {
            let node = self.upgrade_update_iter(idx)?;
            let key = &self.updates[idx].key;
            if key.u64s() > capacity / 2 {
                return Err(CoreError::invalid_operation(format!(
                    "key of {} u64s can never fit a leaf of {capacity}",
                    key.u64s()
                ))
                .into());
            }
            if !node.covers(key.pos) {
                return Err(CoreError::invalid_operation(format!(
                    "key at {} crosses the end of its leaf at {}; trim it first",
                    key.pos,
                    node.max()
                ))
                .into());
            }
            if !flags.contains(CommitFlags::NOMARK)
                && !self.updates[idx].triggered
                && self.updates[idx].btree_id.has_trans_triggers()
            {
                self.updates[idx].triggered = true;
                self.run_trans_trigger(idx, &node, flags)?;
            }
            idx += 1;
        }

        let u64s: u64 = self.updates.iter().map(|u| jset_u64s(u.key.u64s())).sum();
        if !flags.contains(CommitFlags::JOURNAL_REPLAY) && self.preres.u64s() < u64s {
            let need = u64s - self.preres.u64s();
            if !c.journal.preres_get(&mut self.preres, need, true)? {
                if self.nowait {
                    return Err(CoreError::Interrupted.into());
                }
                self.unlock();
                c.journal.preres_get(&mut self.preres, need, false)?;
                if !self.relock() {
                    trace!(trans = self.id(), "restart: relock after journal pre-reservation");
                    return Err(CoreError::Interrupted.into());
                }
            }
        }

        let order = self.sorted_updates();
        let locked = self.lock_for_insert(&order);

        let ret = self.commit_write_locked(&order, disk_res.as_deref_mut(), u64s, flags);

        for node in &locked {
            node.lock().unlock_write(self.id());
            self.refresh_lock_seq(node);
        }
        let res = std::mem::take(&mut self.journal_res);
        let released = c.journal.release(res);
        let merge = ret?;
        released?;

        if !flags.contains(CommitFlags::NOUNLOCK) {
            for node in merge {
                let tree = c.tree(node.btree_id());
                if tree.maybe_merge(&node, self.id(), c.config.merge_threshold_u64s) {
                    trace!(trans = self.id(), node = %node.id(), "merged after commit");
                }
            }
            self.drop_dying();
            self.downgrade();
        }

        Ok(self.commit_seq)
    }

    // Update indices sorted by leaf, then by iterator position.
    fn sorted_updates(&self) -> SmallVec<[usize; TRANS_INLINE]> {
        let mut order: SmallVec<[usize; TRANS_INLINE]> = (0..self.updates.len()).collect();
        order.sort_by_key(|&idx| {
            let update = &self.updates[idx];
            let node = self.iter_leaf(update.iter);
            (node.btree_id(), node.min(), self.iters[update.iter.0].order(), idx)
        });
        order
    }

    // Write locks each distinct leaf once, in `order`.
    fn lock_for_insert(&self, order: &[usize]) -> SmallVec<[Arc<Node>; TRANS_INLINE]> {
        let mut locked: SmallVec<[Arc<Node>; TRANS_INLINE]> = SmallVec::new();
        for &idx in order {
            let node = self.iter_leaf(self.updates[idx].iter);
            if locked.last().is_some_and(|n| n.id() == node.id()) {
                continue;
            }
            node.lock().lock_write(self.id());
            node.data().prepare_for_insert(node.capacity());
            locked.push(node);
        }
        locked
    }

    fn commit_write_locked(
        &mut self,
        order: &[usize],
        mut disk_res: Option<&mut DiskReservation>,
        u64s: u64,
        flags: CommitFlags,
    ) -> Attempt<Vec<Arc<Node>>> {
        let c = self.c;
        if c.faults.should_fail() {
            trace!(trans = self.id(), "restart: injected fault");
            return Err(CoreError::Interrupted.into());
        }

        let mut start = 0;
        while start < order.len() {
            let node = self.iter_leaf(self.updates[order[start]].iter);
            let mut end = start;
            let mut needed = 0;
            {
                let data = node.data();
                while end < order.len() && self.iter_leaf(self.updates[order[end]].iter).id() == node.id() {
                    needed += node.insert_u64s(&data, &self.updates[order[end]].key);
                    end += 1;
                }
                if node.is_fake() || needed > data.free_u64s(node.capacity()) {
                    return Err(InsertError::NodeFull(order[start]));
                }
            }
            start = end;
        }

        let mark = !flags.contains(CommitFlags::NOMARK);
        let _mark_lock = (mark && self.updates.iter().any(|u| u.btree_id.needs_gc()))
            .then(|| c.accounting.mark_read());

        if mark {
            let mut placements = Deltas::default();
            let mut new_sectors = 0;
            for update in &self.updates {
                let key = &update.key;
                if update.btree_id.is_extents() && !key.is_whiteout() {
                    placements.add_replicas(DataType::User, key.devs(), key.size as i64);
                    if update.btree_id == BtreeId::Extents {
                        new_sectors += key.size;
                    }
                }
            }
            if let Err(missing) = c.accounting.replicas_check(&placements.replicas) {
                return Err(InsertError::NeedMarkReplicas(missing.0));
            }
            let available = if flags.contains(CommitFlags::NOFAIL) {
                c.accounting.nofail_sectors()
            } else {
                disk_res.as_deref().map_or(0, DiskReservation::sectors) + c.accounting.free_sectors()
            };
            if new_sectors > available {
                return Err(InsertError::NoSpace);
            }
        }

        let replay = flags.contains(CommitFlags::JOURNAL_REPLAY);
        let seq = if replay {
            c.journal.replay_seq()
        } else {
            let mut res_flags = ResFlags::NONBLOCK;
            if flags.contains(CommitFlags::JOURNAL_RESERVED) {
                res_flags = res_flags | ResFlags::RESERVED;
            }
            match c.journal.try_reserve(u64s, res_flags)? {
                Some(res) => self.journal_res = res,
                None => return Err(InsertError::NeedJournalRes(u64s)),
            }
            self.journal_res.seq()
        };
        self.commit_seq = seq;

        if c.config.journal_seq_verify && !replay {
            for update in &mut self.updates {
                update.key.version = seq;
            }
        }

        // Nothing below may fail.
        let mut merge: Vec<Arc<Node>> = Vec::new();
        for &idx in order {
            let update = &self.updates[idx];
            let node = self.iter_leaf(update.iter);
            let mut data = node.data();

            if mark && update.btree_id.has_triggers() {
                let deltas = insert_deltas(update.btree_id, &data, &update.key, flags);
                let gc = c.accounting.gc_visited(update.btree_id, node.min());
                c.accounting.apply(&deltas, disk_res.as_deref_mut(), gc);
            }

            let key = update.key.clone();
            let outcome = node.insert(&mut data, key);
            if outcome.changed {
                if !replay {
                    c.journal.append(&mut self.journal_res, update.btree_id, &update.key);
                    c.journal.set_has_inode(&self.journal_res, update.key.pos.inode);
                }
                node.journal_key_added(&mut data, seq);
            }
            if outcome.live_added < 0
                && data.sib_u64s(0).min(data.sib_u64s(1)) <= c.config.merge_threshold_u64s
                && !merge.iter().any(|n| n.id() == node.id())
            {
                merge.push(node.clone());
            }
        }
        Ok(merge)
    }

    // Resolves what stopped an attempt and puts the updates back as the
    // caller queued them. Interrupted attempts re-traverse every iterator
    // before either retrying or, for atomic commits, surfacing the restart.
    fn commit_error(
        &mut self,
        err: InsertError,
        original: &[Update],
        nr_iters: usize,
        flags: CommitFlags,
    ) -> CoreResult<()> {
        let c = self.c;
        let ret = match err {
            InsertError::NodeFull(idx) => self.split_full_leaf(idx, flags),
            InsertError::NoSpace => Err(CoreError::NoSpace),
            InsertError::NeedMarkReplicas(missing) => {
                if self.nowait {
                    return Err(CoreError::Interrupted);
                }
                self.unlock();
                for (data_type, devs) in missing {
                    c.accounting.mark_replicas(data_type, devs);
                }
                if self.relock() {
                    Ok(())
                } else {
                    trace!(trans = self.id(), "restart: relock after marking replicas");
                    Err(CoreError::Interrupted)
                }
            }
            InsertError::NeedJournalRes(u64s) => {
                if self.nowait {
                    return Err(CoreError::Interrupted);
                }
                self.unlock();
                let mut res_flags = ResFlags::CHECK;
                if flags.contains(CommitFlags::JOURNAL_RESERVED) {
                    res_flags = res_flags | ResFlags::RESERVED;
                }
                c.journal.reserve(u64s, res_flags)?;
                if self.relock() {
                    Ok(())
                } else {
                    trace!(trans = self.id(), "restart: relock after journal reservation");
                    Err(CoreError::Interrupted)
                }
            }
            InsertError::Fatal(err) => Err(err),
        };
        self.reset_triggers(original, nr_iters);

        match ret {
            Err(err) if err.is_interrupted() => {
                self.traverse_all()?;
                if flags.contains(CommitFlags::ATOMIC) {
                    trace!(trans = self.id(), "restart: returned to atomic caller");
                    return Err(err);
                }
                Ok(())
            }
            other => other,
        }
    }

    fn split_full_leaf(&mut self, idx: usize, flags: CommitFlags) -> CoreResult<()> {
        let c = self.c;
        let level = if flags.contains(CommitFlags::USE_ALLOC_RESERVE) {
            ReserveLevel::Alloc
        } else if flags.contains(CommitFlags::USE_RESERVE) || flags.contains(CommitFlags::NOFAIL) {
            ReserveLevel::Btree
        } else {
            ReserveLevel::Normal
        };

        let gc_lock = c.accounting.gc_lock();
        let _gc = if flags.contains(CommitFlags::GC_LOCK_HELD) {
            None
        } else if let Some(guard) = gc_lock.try_read() {
            Some(guard)
        } else {
            if self.nowait {
                return Err(CoreError::Interrupted);
            }
            self.unlock();
            let guard = gc_lock.read();
            if !self.relock() {
                trace!(trans = self.id(), "restart: relock after gc lock");
                return Err(CoreError::Interrupted);
            }
            Some(guard)
        };

        let node = self.iter_leaf(self.updates[idx].iter);
        c.tree(node.btree_id()).split(&node, self.id(), level)?;
        trace!(trans = self.id(), node = %node.id(), "restart: leaf split");
        Err(CoreError::Interrupted)
    }

    fn run_trans_trigger(&mut self, idx: usize, node: &Arc<Node>, flags: CommitFlags) -> Attempt<()> {
        if self.updates[idx].btree_id != BtreeId::Extents {
            return Ok(());
        }
        let key = self.updates[idx].key.clone();
        let mut per_dev: SmallVec<[(DeviceId, i64); 4]> = SmallVec::new();
        let mut add = |dev: DeviceId, sectors: i64| match per_dev.iter_mut().find(|(d, _)| *d == dev) {
            Some((_, total)) => *total += sectors,
            None => per_dev.push((dev, sectors)),
        };

        if !key.is_whiteout() {
            for dev in key.devs().iter() {
                add(dev, key.size as i64);
            }
        }
        if !flags.contains(CommitFlags::NOMARK_OVERWRITES) {
            let (start, end) = (key.start(), key.pos);
            let overwritten = node.data().overlapping(start, end);
            for old in overwritten {
                let sectors = old.overlap(start, end) as i64;
                for dev in old.devs().iter() {
                    add(dev, -sectors);
                }
            }
        }

        for (dev, sectors) in per_dev {
            if sectors != 0 {
                self.update_alloc(dev, sectors)?;
            }
        }
        Ok(())
    }

    // Adds `sectors` to the allocation counter of `dev`, folding into a
    // pending update of the same counter. Iterators created here belong to
    // this commit and are freed when it finishes.
    fn update_alloc(&mut self, dev: DeviceId, sectors: i64) -> Attempt<()> {
        let pos = Pos::new(dev.as_usize() as u64, 0);
        let pending = self
            .updates
            .iter()
            .find(|u| u.btree_id == BtreeId::Alloc && u.key.pos == pos)
            .map(|u| (u.iter, alloc_value(&u.key)));

        let (iter, current): (IterId, u64) = match pending {
            Some(found) => found,
            None => {
                let iter = self.get_iter(BtreeId::Alloc, pos, IterFlags::INTENT);
                let node = self.traverse_node(iter).inspect_err(|_| {
                    trace!(trans = self.id(), %dev, "restart: trigger traverse failed");
                })?;
                let current = node.data().get(pos).map_or(0, alloc_value);
                (iter, current)
            }
        };
        self.update(iter, alloc_key(pos, current.saturating_add_signed(sectors)));
        Ok(())
    }
}

// Accounting change from inserting `key` into a leaf holding `data`.
fn insert_deltas(btree_id: BtreeId, data: &NodeData, key: &Key, flags: CommitFlags) -> Deltas {
    let mut deltas = key_deltas(btree_id, key, 1);
    let overwrites = !flags.contains(CommitFlags::NOMARK_OVERWRITES);

    if btree_id.is_extents() {
        if !overwrites {
            return deltas;
        }
        let (start, end) = (key.start(), key.pos);
        for old in data.overlapping(start, end) {
            let sectors = old.overlap(start, end) as i64;
            if btree_id == BtreeId::Extents {
                deltas.usage.data_sectors -= sectors;
            }
            deltas.add_replicas(DataType::User, old.devs(), -sectors);
        }
        return deltas;
    }

    let old = data.get(key.pos);
    if btree_id == BtreeId::Alloc && flags.contains(CommitFlags::BUCKET_INVALIDATE) {
        let before = old.map_or(0, alloc_value);
        let after = if key.is_whiteout() { 0 } else { alloc_value(key) };
        deltas.usage.invalidated_sectors = before.saturating_sub(after);
    }
    if let (true, Some(old)) = (overwrites, old) {
        deltas.merge(&key_deltas(btree_id, old, -1));
    }
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::Store;
    use crate::types::DeviceId;
    use crate::btree::NodeImages;
    use bytes::Bytes;
    use cowbtree_storage::InMemoryBackend;

    fn dev0() -> DeviceSet {
        DeviceSet::single(DeviceId::new(0))
    }

    fn value(byte: u8) -> Bytes {
        Bytes::from(vec![byte; 8])
    }

    // A store whose dirents tree already has a real leaf.
    fn populated(config: Config) -> Store {
        let store = Store::new(config).unwrap();
        store
            .btree_insert(BtreeId::Dirents, Key::inline(Pos::new(1, 0), value(0)), None, None, CommitFlags::NONE)
            .unwrap();
        store
    }

    fn offsets(store: &Store, btree_id: BtreeId) -> Vec<u64> {
        store.keys(btree_id).iter().map(|k| k.pos.offset).collect()
    }

    #[test]
    fn one_write_lock_per_leaf() {
        let store = populated(Config::new());
        let leaf = store.tree(BtreeId::Dirents).lookup(Pos::new(1, 5));
        let before = leaf.lock().write_locks();

        let mut trans = store.trans();
        for offset in 2..5 {
            let iter = trans.get_iter(BtreeId::Dirents, Pos::new(1, offset), IterFlags::INTENT);
            trans.update(iter, Key::inline(Pos::new(1, offset), value(1)));
        }
        trans.commit(None, None, CommitFlags::NONE).unwrap();

        assert_eq!(leaf.lock().write_locks(), before + 1);
        assert_eq!(offsets(&store, BtreeId::Dirents), vec![0, 2, 3, 4]);
    }

    #[test]
    fn full_leaf_fails_before_journal_reservation() {
        let store = Store::new(Config::new()).unwrap();
        let taken = store.journal().reservations_taken();

        let mut trans = store.trans();
        let a = trans.get_iter(BtreeId::Dirents, Pos::new(1, 1), IterFlags::INTENT);
        let b = trans.get_iter(BtreeId::Xattrs, Pos::new(1, 1), IterFlags::INTENT);
        trans.update(a, Key::inline(Pos::new(1, 1), value(1)));
        trans.update(b, Key::inline(Pos::new(1, 1), value(2)));
        let err = trans.commit(None, None, CommitFlags::ATOMIC).unwrap_err();

        assert!(err.is_interrupted());
        assert_eq!(trans.nr_updates(), 0);
        assert_eq!(store.journal().reservations_taken(), taken);
        assert!(store.keys(BtreeId::Dirents).is_empty());
        assert!(store.keys(BtreeId::Xattrs).is_empty());
        assert_eq!(store.tree(BtreeId::Dirents).splits(), 1);

        trans.update(a, Key::inline(Pos::new(1, 1), value(1)));
        trans.update(b, Key::inline(Pos::new(1, 1), value(2)));
        let mut retried = trans.commit(None, None, CommitFlags::ATOMIC);
        while matches!(retried, Err(CoreError::Interrupted)) {
            trans.update(a, Key::inline(Pos::new(1, 1), value(1)));
            trans.update(b, Key::inline(Pos::new(1, 1), value(2)));
            retried = trans.commit(None, None, CommitFlags::ATOMIC);
        }
        retried.unwrap();
        assert!(store.get(BtreeId::Dirents, Pos::new(1, 1)).is_some());
        assert!(store.get(BtreeId::Xattrs, Pos::new(1, 1)).is_some());
    }

    #[test]
    fn non_atomic_commit_splits_and_retries() {
        let store = Store::new(Config::new()).unwrap();
        let mut trans = store.trans();
        let iter = trans.get_iter(BtreeId::Dirents, Pos::new(1, 1), IterFlags::INTENT);
        trans.update(iter, Key::inline(Pos::new(1, 1), value(1)));
        trans.commit(None, None, CommitFlags::NONE).unwrap();
        assert!(trans.restarts() >= 1);
        assert!(store.get(BtreeId::Dirents, Pos::new(1, 1)).is_some());
    }

    #[test]
    fn injected_fault_is_retried() {
        let store = populated(Config::new());
        store.faults().fail_next(1);

        let mut trans = store.trans();
        let iter = trans.get_iter(BtreeId::Dirents, Pos::new(1, 9), IterFlags::NONE);
        trans.update(iter, Key::inline(Pos::new(1, 9), value(9)));
        trans.commit(None, None, CommitFlags::NONE).unwrap();

        assert_eq!(trans.restarts(), 1);
        assert_eq!(store.faults().injected(), 1);
        assert!(store.get(BtreeId::Dirents, Pos::new(1, 9)).is_some());
    }

    #[test]
    fn injected_fault_surfaces_to_atomic_caller() {
        let store = populated(Config::new());
        store.faults().fail_next(1);

        let mut trans = store.trans();
        let iter = trans.get_iter(BtreeId::Dirents, Pos::new(1, 9), IterFlags::INTENT);
        trans.update(iter, Key::inline(Pos::new(1, 9), value(9)));
        let err = trans.commit(None, None, CommitFlags::ATOMIC).unwrap_err();
        assert!(err.is_interrupted());
        assert!(store.get(BtreeId::Dirents, Pos::new(1, 9)).is_none());
    }

    #[test]
    fn no_clear_replicas_interrupts_instead_of_retrying() {
        let store = populated(Config::new());
        store.faults().fail_next(1);

        let mut trans = store.trans();
        let iter = trans.get_iter(BtreeId::Dirents, Pos::new(1, 4), IterFlags::INTENT);
        trans.update(iter, Key::inline(Pos::new(1, 4), value(4)));
        let err = trans.commit(None, None, CommitFlags::NO_CLEAR_REPLICAS).unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(store.faults().injected(), 1);
        assert!(store.get(BtreeId::Dirents, Pos::new(1, 4)).is_none());

        trans.update(iter, Key::inline(Pos::new(1, 4), value(4)));
        trans.commit(None, None, CommitFlags::NO_CLEAR_REPLICAS).unwrap();
        assert!(store.get(BtreeId::Dirents, Pos::new(1, 4)).is_some());
    }

    #[test]
    fn atomic_restart_leaves_iterators_on_live_leaves() {
        let store = Store::new(Config::new()).unwrap();
        let mut trans = store.trans();
        let iter = trans.get_iter(BtreeId::Dirents, Pos::new(1, 1), IterFlags::INTENT);
        trans.update(iter, Key::inline(Pos::new(1, 1), value(1)));
        let err = trans.commit(None, None, CommitFlags::ATOMIC).unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(store.tree(BtreeId::Dirents).splits(), 1);

        let node = trans.iter_node(iter).unwrap();
        assert!(!node.is_fake());
        assert!(!node.data().is_dying());
        assert!(node.covers(Pos::new(1, 1)));
    }

    #[test]
    fn nowait_does_not_block_on_busy_leaf() {
        let store = populated(Config::new());
        let mut holder = store.trans();
        let held = holder.get_iter(BtreeId::Dirents, Pos::new(1, 3), IterFlags::INTENT);
        holder.traverse(held).unwrap();

        let mut trans = store.trans();
        let iter = trans.get_iter(BtreeId::Dirents, Pos::new(1, 3), IterFlags::NONE);
        trans.update(iter, Key::inline(Pos::new(1, 3), value(3)));
        let err = trans.commit(None, None, CommitFlags::NOWAIT).unwrap_err();
        assert!(err.is_interrupted());

        holder.unlock();
        trans.update(iter, Key::inline(Pos::new(1, 3), value(3)));
        trans.commit(None, None, CommitFlags::NOWAIT).unwrap();
        assert!(store.get(BtreeId::Dirents, Pos::new(1, 3)).is_some());
    }

    #[test]
    fn oversized_key_is_rejected() {
        let store = Store::new(Config::new().node_capacity_u64s(64)).unwrap();
        let key = Key::inline(Pos::new(1, 1), vec![0u8; 8 * 40]);
        let err = store
            .btree_insert(BtreeId::Dirents, key, None, None, CommitFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn leaves_split_under_load() {
        let store = Store::new(Config::new().node_capacity_u64s(64)).unwrap();
        for offset in 0..200 {
            store
                .btree_insert(BtreeId::Dirents, Key::inline(Pos::new(2, offset), value(1)), None, None, CommitFlags::NONE)
                .unwrap();
        }
        let tree = store.tree(BtreeId::Dirents);
        assert!(tree.nodes().len() > 1);
        assert!(tree.splits() > 1);
        assert_eq!(offsets(&store, BtreeId::Dirents), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn journal_seq_is_reported_and_stamped() {
        let store = populated(Config::new().journal_seq_verify(true));
        let mut seq = 0;
        store
            .btree_insert(BtreeId::Dirents, Key::inline(Pos::new(1, 7), value(7)), None, Some(&mut seq), CommitFlags::NONE)
            .unwrap();
        assert!(seq > 0);
        assert_eq!(store.get(BtreeId::Dirents, Pos::new(1, 7)).unwrap().version, seq);
    }

    #[test]
    fn extent_insert_updates_usage_and_alloc() {
        let store = Store::new(Config::new()).unwrap();
        store
            .btree_insert(BtreeId::Extents, Key::extent(1, 0, 16, dev0()), None, None, CommitFlags::NONE)
            .unwrap();

        assert_eq!(store.usage().data_sectors, 16);
        assert_eq!(store.usage().alloc_sectors, 16);
        assert!(store.accounting().has_replicas(DataType::User, dev0()));
        assert_eq!(store.accounting().replicas_sectors(DataType::User, dev0()), Some(16));
        let alloc = store.get(BtreeId::Alloc, Pos::new(0, 0)).unwrap();
        assert_eq!(alloc_value(&alloc), 16);
    }

    #[test]
    fn overwriting_extent_moves_alloc_between_devices() {
        let store = Store::new(Config::new()).unwrap();
        let dev1 = DeviceSet::single(DeviceId::new(1));
        store
            .btree_insert(BtreeId::Extents, Key::extent(1, 0, 16, dev0()), None, None, CommitFlags::NONE)
            .unwrap();
        store
            .btree_insert(BtreeId::Extents, Key::extent(1, 8, 8, dev1), None, None, CommitFlags::NONE)
            .unwrap();

        assert_eq!(store.usage().data_sectors, 16);
        assert_eq!(alloc_value(&store.get(BtreeId::Alloc, Pos::new(0, 0)).unwrap()), 8);
        assert_eq!(alloc_value(&store.get(BtreeId::Alloc, Pos::new(1, 0)).unwrap()), 8);
        let ranges: Vec<(u64, u64)> = store
            .keys(BtreeId::Extents)
            .iter()
            .map(|k| (k.start().offset, k.pos.offset))
            .collect();
        assert_eq!(ranges, vec![(0, 8), (8, 16)]);
    }

    #[test]
    fn nofail_draws_on_reserved_space_only() {
        let store = Store::new(Config::new().capacity_sectors(32)).unwrap();
        let mut held = store.disk_reservation_get(16, false).unwrap();

        let err = store
            .btree_insert(BtreeId::Extents, Key::extent(1, 0, 24, dev0()), None, None, CommitFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, CoreError::NoSpace));
        assert!(store.keys(BtreeId::Extents).is_empty());

        store
            .btree_insert(BtreeId::Extents, Key::extent(1, 0, 24, dev0()), None, None, CommitFlags::NOFAIL)
            .unwrap();
        assert_eq!(store.usage().data_sectors, 24);

        let err = store
            .btree_insert(BtreeId::Extents, Key::extent(1, 24, 16, dev0()), None, None, CommitFlags::NOFAIL)
            .unwrap_err();
        assert!(matches!(err, CoreError::NoSpace));
        assert_eq!(store.usage().data_sectors, 24);
        store.disk_reservation_put(&mut held);
    }

    #[test]
    fn restart_does_not_recount_caller_alloc_update() {
        let store = Store::new(Config::new()).unwrap();
        store
            .btree_insert(BtreeId::Extents, Key::extent(1, 0, 8, dev0()), None, None, CommitFlags::NONE)
            .unwrap();
        store.faults().fail_next(1);

        let counter = Pos::new(0, 0);
        let mut trans = store.trans();
        let alloc = trans.get_iter(BtreeId::Alloc, counter, IterFlags::INTENT);
        trans.update(alloc, alloc_key(counter, 100));
        let extent = trans.get_iter(BtreeId::Extents, Pos::new(1, 8), IterFlags::INTENT);
        trans.update(extent, Key::extent(1, 8, 16, dev0()));
        trans.commit(None, None, CommitFlags::NONE).unwrap();

        assert_eq!(trans.restarts(), 1);
        assert_eq!(alloc_value(&store.get(BtreeId::Alloc, counter).unwrap()), 116);
    }

    #[test]
    fn trigger_iterators_are_freed_after_commit() {
        let store = Store::new(Config::new()).unwrap();
        store
            .btree_insert(BtreeId::Extents, Key::extent(1, 0, 8, dev0()), None, None, CommitFlags::NONE)
            .unwrap();

        let mut trans = store.trans();
        for i in 1..4u64 {
            let iter = trans.get_iter(BtreeId::Extents, Pos::new(1, 8 * i), IterFlags::INTENT);
            trans.update(iter, Key::extent(1, 8 * i, 8, dev0()));
            trans.commit(None, None, CommitFlags::NONE).unwrap();

            assert_eq!(trans.nr_iters(), i as usize);
            let alloc_leaf = store.tree(BtreeId::Alloc).lookup(Pos::new(0, 0));
            assert_eq!(alloc_leaf.lock().intent_owner(), None);
        }
        assert_eq!(alloc_value(&store.get(BtreeId::Alloc, Pos::new(0, 0)).unwrap()), 32);
    }

    #[test]
    fn disk_reservation_is_consumed() {
        let store = Store::new(Config::new().capacity_sectors(100)).unwrap();
        let mut res = store.disk_reservation_get(16, false).unwrap();
        store
            .btree_insert(BtreeId::Extents, Key::extent(1, 0, 16, dev0()), Some(&mut res), None, CommitFlags::NONE)
            .unwrap();
        assert_eq!(res.sectors(), 0);
        assert_eq!(store.usage().reserved, 0);
        assert_eq!(store.accounting().free_sectors(), 84);
        store.disk_reservation_put(&mut res);
    }

    #[test]
    fn second_extent_commits_without_restart() {
        let store = Store::new(Config::new()).unwrap();
        store
            .btree_insert(BtreeId::Extents, Key::extent(1, 0, 8, dev0()), None, None, CommitFlags::NONE)
            .unwrap();
        let leaf = store.tree(BtreeId::Extents).lookup(Pos::new(1, 1));
        assert_eq!(leaf.max(), Pos::MAX);

        let mut trans = store.trans();
        let iter = trans.get_iter(BtreeId::Extents, Pos::new(1, 8), IterFlags::INTENT);
        trans.update(iter, Key::extent(1, 8, 8, dev0()));
        trans.commit(None, None, CommitFlags::ATOMIC).unwrap();
        assert_eq!(trans.restarts(), 0);
        assert_eq!(store.usage().data_sectors, 16);
    }

    #[test]
    fn nomark_skips_accounting() {
        let store = Store::new(Config::new()).unwrap();
        store
            .btree_insert(BtreeId::Inodes, Key::inline(Pos::new(0, 3), value(3)), None, None, CommitFlags::NOMARK)
            .unwrap();
        assert_eq!(store.usage().nr_inodes, 0);
        store
            .btree_insert(BtreeId::Inodes, Key::inline(Pos::new(0, 4), value(4)), None, None, CommitFlags::NONE)
            .unwrap();
        assert_eq!(store.usage().nr_inodes, 1);
        store.gc();
        assert_eq!(store.usage().nr_inodes, 2);
    }

    #[test]
    fn bucket_invalidate_counts_dropped_sectors() {
        let store = Store::new(Config::new()).unwrap();
        let pos = Pos::new(0, 0);
        store
            .btree_insert(BtreeId::Alloc, alloc_key(pos, 40), None, None, CommitFlags::NONE)
            .unwrap();
        store
            .btree_insert(BtreeId::Alloc, alloc_key(pos, 10), None, None, CommitFlags::BUCKET_INVALIDATE)
            .unwrap();
        assert_eq!(store.usage().invalidated_sectors, 30);
        assert_eq!(store.usage().alloc_sectors, 10);
    }

    #[test]
    fn committed_transaction_survives_crash_whole() {
        let log = InMemoryBackend::new();
        let images = NodeImages::new();
        let store = Store::recover(Config::new(), Box::new(log.clone()), images.clone()).unwrap();

        let mut trans = store.trans();
        let a = trans.get_iter(BtreeId::Dirents, Pos::new(5, 1), IterFlags::INTENT);
        let b = trans.get_iter(BtreeId::Xattrs, Pos::new(5, 2), IterFlags::INTENT);
        let c = trans.get_iter(BtreeId::Inodes, Pos::new(0, 5), IterFlags::INTENT);
        trans.update(a, Key::inline(Pos::new(5, 1), value(1)));
        trans.update(b, Key::inline(Pos::new(5, 2), value(2)));
        trans.update(c, Key::inline(Pos::new(0, 5), value(3)));
        trans.commit(None, None, CommitFlags::NONE).unwrap();
        drop(trans);

        let before_flush = Store::recover(Config::new(), Box::new(log.snapshot()), images.snapshot()).unwrap();
        assert!(before_flush.keys(BtreeId::Dirents).is_empty());
        assert!(before_flush.keys(BtreeId::Xattrs).is_empty());
        assert!(before_flush.keys(BtreeId::Inodes).is_empty());

        store.flush_journal().unwrap();
        let after_flush = Store::recover(Config::new(), Box::new(log.snapshot()), images.snapshot()).unwrap();
        assert!(after_flush.get(BtreeId::Dirents, Pos::new(5, 1)).is_some());
        assert!(after_flush.get(BtreeId::Xattrs, Pos::new(5, 2)).is_some());
        assert!(after_flush.get(BtreeId::Inodes, Pos::new(0, 5)).is_some());
        assert_eq!(after_flush.usage().nr_inodes, 1);
    }
}

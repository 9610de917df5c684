//! Deletes and one-shot inserts built on transactions.

use super::flags::CommitFlags;
use super::trans::BtreeTrans;
use crate::accounting::DiskReservation;
use crate::btree::{trim_atomic, IterFlags, IterId};
use crate::error::{CoreError, CoreResult};
use crate::key::Key;
use crate::store::Store;
use crate::types::{BtreeId, Pos};
use tracing::trace;

impl BtreeTrans<'_> {
    /// Deletes the key at `iter`'s position and commits.
    ///
    /// Deletes may use the node reserve and never fail for lack of space.
    ///
    /// # Errors
    ///
    /// Returns commit errors; [`CoreError::Interrupted`] only with
    /// [`CommitFlags::ATOMIC`] or [`CommitFlags::NOWAIT`] in `flags`.
    ///
    /// # Panics
    ///
    /// Panics on an extent tree; use [`delete_at_range`](Self::delete_at_range).
    pub fn delete_at(&mut self, iter: IterId, flags: CommitFlags) -> CoreResult<()> {
        assert!(
            !self.iters[iter.0].is_extents(),
            "delete_at on an extent tree; use delete_at_range"
        );
        let pos = self.iter_pos(iter);
        self.update(iter, Key::whiteout(pos));
        self.commit(None, None, flags | CommitFlags::NOFAIL | CommitFlags::USE_RESERVE)
    }

    /// Deletes every key from `iter`'s position up to `end`, exclusive, one
    /// commit per key. Extents are deleted in pieces no larger than the
    /// largest key size and are cut at `end`.
    ///
    /// # Errors
    ///
    /// Returns the first commit error other than a restart, which is
    /// retried.
    pub fn delete_at_range(&mut self, iter: IterId, end: Pos, mut journal_seq: Option<&mut u64>) -> CoreResult<()> {
        let max_sectors = self.c.config.max_delete_sectors();
        loop {
            let ret = self.delete_step(iter, end, max_sectors, journal_seq.as_deref_mut());
            match ret {
                Ok(true) => std::thread::yield_now(),
                Ok(false) => return Ok(()),
                Err(err) if err.is_interrupted() => {
                    trace!(trans = self.id(), pos = %self.iter_pos(iter), "range delete restarted");
                }
                Err(err) => return Err(err),
            }
        }
    }

    // Deletes the next key before `end`. Returns false once there is none.
    fn delete_step(
        &mut self,
        iter: IterId,
        end: Pos,
        max_sectors: u64,
        journal_seq: Option<&mut u64>,
    ) -> CoreResult<bool> {
        if self.peek(iter)?.is_none() {
            return Ok(false);
        }
        let pos = self.iter_pos(iter);
        if pos >= end {
            return Ok(false);
        }

        let mut delete = Key::whiteout(pos);
        if self.iters[iter.0].is_extents() {
            delete.resize(max_sectors);
            delete.cut_back(end);
            let node = self.traverse_node(iter)?;
            trim_atomic(&mut delete, &node);
        }
        self.update(iter, delete);
        self.commit(None, journal_seq, CommitFlags::ATOMIC | CommitFlags::NOFAIL)?;
        Ok(true)
    }
}

impl Store {
    /// Deletes every key of `btree_id` in `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns commit errors.
    pub fn delete_range(
        &self,
        btree_id: BtreeId,
        start: Pos,
        end: Pos,
        journal_seq: Option<&mut u64>,
    ) -> CoreResult<()> {
        let mut trans = self.trans();
        let iter = trans.get_iter(btree_id, start, IterFlags::INTENT);
        let ret = trans.delete_at_range(iter, end, journal_seq);
        assert!(
            !matches!(ret, Err(CoreError::Interrupted)),
            "range delete leaked a restart"
        );
        ret
    }

    /// Inserts one key, retrying restarts.
    ///
    /// An extent that does not fit in one leaf is inserted in pieces, each
    /// atomic on its own.
    ///
    /// # Errors
    ///
    /// Returns commit errors; [`CoreError::Interrupted`] only with
    /// [`CommitFlags::NOWAIT`] in `flags`.
    pub fn btree_insert(
        &self,
        btree_id: BtreeId,
        key: Key,
        mut disk_res: Option<&mut DiskReservation>,
        mut journal_seq: Option<&mut u64>,
        flags: CommitFlags,
    ) -> CoreResult<()> {
        let mut trans = self.trans();
        let extents = btree_id.is_extents();
        let start = if extents { key.start() } else { key.pos };
        let iter = trans.get_iter(btree_id, start, IterFlags::INTENT);
        let mut remaining = key;

        loop {
            let start = if extents { remaining.start() } else { remaining.pos };
            trans.set_pos(iter, start);
            let mut piece = remaining.clone();
            let trimmed = if extents {
                trans.traverse_node(iter).map(|node| trim_atomic(&mut piece, &node))
            } else {
                Ok(())
            };
            let ret = trimmed.and_then(|()| {
                trans.update(iter, piece.clone());
                trans.commit(
                    disk_res.as_deref_mut(),
                    journal_seq.as_deref_mut(),
                    flags | CommitFlags::ATOMIC,
                )
            });

            match ret {
                Ok(()) if extents && piece.pos < remaining.pos => remaining.cut_front(piece.pos),
                Ok(()) => return Ok(()),
                Err(err) if err.is_interrupted() && !flags.contains(CommitFlags::NOWAIT) => {
                    trace!(btree = %btree_id, pos = %start, "insert restarted");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs `body` against a fresh transaction and commits, retrying the
    /// whole attempt for as long as it is interrupted.
    ///
    /// # Errors
    ///
    /// Returns the first error of `body` or of the commit that is not a
    /// restart.
    pub fn trans_do<T>(
        &self,
        mut journal_seq: Option<&mut u64>,
        flags: CommitFlags,
        mut body: impl FnMut(&mut BtreeTrans<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut trans = self.trans();
        loop {
            trans.begin();
            let ret = body(&mut trans).and_then(|value| {
                trans
                    .commit(None, journal_seq.as_deref_mut(), flags)
                    .map(|()| value)
            });
            match ret {
                Err(err) if err.is_interrupted() => {
                    trace!(trans = trans.id(), "transaction restarted");
                }
                other => return other,
            }
        }
    }
}

//! Iterator state kept by a transaction.

use super::extents::lookup_pos;
use super::lock::LockType;
use super::node::Node;
use crate::types::{BtreeId, Pos};
use std::sync::Arc;

/// Iterator flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterFlags(u8);

impl IterFlags {
    /// No flags.
    pub const NONE: IterFlags = IterFlags(0);
    /// Hold an intent lock on the current leaf; needed to update through
    /// the iterator.
    pub const INTENT: IterFlags = IterFlags(1 << 0);
    /// Iterates a range-keyed tree. Set automatically for extent trees.
    pub const IS_EXTENTS: IterFlags = IterFlags(1 << 1);
    /// Keep the iterator's lock until the next commit.
    pub const KEEP_UNTIL_COMMIT: IterFlags = IterFlags(1 << 2);

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: IterFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Clears the flags in `other`.
    pub fn remove(&mut self, other: IterFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for IterFlags {
    type Output = IterFlags;

    fn bitor(self, rhs: Self) -> Self {
        IterFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for IterFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Handle to an iterator owned by a transaction.
///
/// Valid until the transaction is reset with `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IterId(pub(crate) usize);

/// How much of an iterator's cached state can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Uptodate {
    /// Positioned and locked as wanted.
    UpToDate,
    /// On the right leaf, but the cached key must be looked up again.
    NeedPeek,
    /// Locks were dropped; may be retaken if the leaf did not change.
    NeedRelock,
    /// Must look its leaf up again.
    NeedTraverse,
}

#[derive(Debug)]
pub(crate) struct BtreeIter {
    pub(crate) btree_id: BtreeId,
    pub(crate) pos: Pos,
    pub(crate) flags: IterFlags,
    pub(crate) node: Option<Arc<Node>>,
    pub(crate) lock_seq: u64,
    pub(crate) uptodate: Uptodate,
    pub(crate) locked: bool,
    pub(crate) upgraded: bool,
}

impl BtreeIter {
    pub(crate) fn new(btree_id: BtreeId, pos: Pos, mut flags: IterFlags) -> Self {
        if btree_id.is_extents() {
            flags |= IterFlags::IS_EXTENTS;
        }
        Self {
            btree_id,
            pos,
            flags,
            node: None,
            lock_seq: 0,
            uptodate: Uptodate::NeedTraverse,
            locked: false,
            upgraded: false,
        }
    }

    /// Lock mode the iterator wants on its leaf.
    pub(crate) fn locks_want(&self) -> LockType {
        if self.flags.contains(IterFlags::INTENT) {
            LockType::Intent
        } else {
            LockType::Read
        }
    }

    pub(crate) fn is_extents(&self) -> bool {
        self.flags.contains(IterFlags::IS_EXTENTS)
    }

    /// Position the iterator's leaf is looked up by.
    pub(crate) fn search_pos(&self) -> Pos {
        if self.is_extents() {
            lookup_pos(self.pos)
        } else {
            self.pos
        }
    }

    /// Sort key for lock ordering.
    pub(crate) fn order(&self) -> (BtreeId, Pos) {
        (self.btree_id, self.search_pos())
    }
}

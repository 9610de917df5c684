//! Extent key handling.
//!
//! Extents are keyed by their end position and cover `[start, pos)`. Live
//! extents in a tree never overlap: inserting one cuts every extent it
//! overlaps down to the fragments outside it.
//!
//! An extent is always stored in the leaf that covers the position right
//! after its start, and is trimmed so it does not end past that leaf's
//! maximum. So every extent in a leaf starts no earlier than the leaf's
//! predecessor position, and all overlaps of an insert live in one leaf.

use super::node::{Node, NodeData};
use crate::key::Key;
use crate::types::Pos;

impl NodeData {
    /// Live extents overlapping `[start, end)`.
    #[must_use]
    pub fn overlapping(&self, start: Pos, end: Pos) -> Vec<Key> {
        let mut found = Vec::new();
        if start >= end {
            return found;
        }
        let mut from = start.successor();
        while let Some(key) = self.peek_from(from) {
            if key.start() >= end {
                break;
            }
            found.push(key.clone());
            if key.pos == Pos::MAX {
                break;
            }
            from = key.pos.successor();
        }
        found
    }

    /// Inserts an extent, first cutting back whatever it overlaps: a front
    /// fragment is reinserted at the new extent's start, a back fragment
    /// replaces the old key at its own position, and fully covered extents
    /// are whited out.
    pub(super) fn insert_extent(&mut self, insert: Key) -> bool {
        let start = insert.start();
        let end = insert.pos;
        let mut changed = false;

        for old in self.overlapping(start, end) {
            if old.start() < start {
                let mut front = old.clone();
                front.cut_back(start);
                front.needs_whiteout = false;
                changed |= self.insert_key(front);
            }
            if old.pos > end {
                let mut back = old;
                back.cut_front(end);
                changed |= self.insert_key(back);
            } else if old.pos != end {
                changed |= self.insert_key(Key::whiteout(old.pos));
            }
        }
        changed | self.insert_key(insert)
    }
}

/// Upper bound on the u64s inserting extent `key` can add: the key plus one
/// copy of every extent it overlaps, two for an extent that keeps a front
/// fragment.
#[must_use]
pub fn can_insert(data: &NodeData, key: &Key) -> u64 {
    let start = key.start();
    data.overlapping(start, key.pos)
        .iter()
        .fold(key.u64s(), |acc, old| {
            let pieces = u64::from(old.start() < start) + 1;
            acc + pieces * old.u64s()
        })
}

/// Cuts `key` back so it ends inside `node`.
pub fn trim_atomic(key: &mut Key, node: &Node) {
    if key.pos > node.max() {
        key.cut_back(node.max());
    }
}

/// Position the leaf holding an extent starting at `start` is looked up by.
#[must_use]
pub fn lookup_pos(start: Pos) -> Pos {
    if start == Pos::MAX {
        start
    } else {
        start.successor()
    }
}

//! Durable node images.
//!
//! Written nodes store a full image of their live keys here, replacing
//! whatever an earlier write stored for the same key range. Recovery
//! rebuilds leaves from these images before replaying the journal. Clones
//! share storage; [`NodeImages::snapshot`] copies it, which is how tests
//! capture the state a crash would leave behind.

use crate::key::Key;
use crate::types::{BtreeId, Pos};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct ImageStore {
    trees: HashMap<BtreeId, BTreeMap<Pos, Key>>,
}

/// Shared store of written node images.
#[derive(Debug, Clone, Default)]
pub struct NodeImages {
    inner: Arc<Mutex<ImageStore>>,
    writes: Arc<AtomicU64>,
}

impl NodeImages {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces everything stored for `btree_id` in `[min, max]` with
    /// `keys`.
    ///
    /// # Panics
    ///
    /// Panics if a key lies outside the range.
    pub fn replace_range(&self, btree_id: BtreeId, min: Pos, max: Pos, keys: impl IntoIterator<Item = Key>) {
        let mut inner = self.inner.lock();
        let tree = inner.trees.entry(btree_id).or_default();

        let stale: Vec<Pos> = tree.range(min..=max).map(|(pos, _)| *pos).collect();
        for pos in stale {
            tree.remove(&pos);
        }
        for key in keys {
            assert!(
                key.pos >= min && key.pos <= max,
                "image key {} outside node range {min}..={max}",
                key.pos
            );
            tree.insert(key.pos, key);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Every stored key of `btree_id`, in order.
    #[must_use]
    pub fn keys(&self, btree_id: BtreeId) -> Vec<Key> {
        self.inner
            .lock()
            .trees
            .get(&btree_id)
            .map(|tree| tree.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of node writes stored so far.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns an independent copy.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        let inner = self.inner.lock();
        Self {
            inner: Arc::new(Mutex::new(ImageStore {
                trees: inner.trees.clone(),
            })),
            writes: Arc::new(AtomicU64::new(self.writes())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(offset: u64) -> Key {
        Key::inline(Pos::new(1, offset), vec![offset as u8])
    }

    #[test]
    fn replace_range_drops_keys_gone_from_the_node() {
        let images = NodeImages::new();
        images.replace_range(BtreeId::Inodes, Pos::MIN, Pos::MAX, [key(1), key(5), key(9)]);
        images.replace_range(BtreeId::Inodes, Pos::new(1, 0), Pos::new(1, 6), [key(2)]);

        let offsets: Vec<u64> = images.keys(BtreeId::Inodes).iter().map(|k| k.pos.offset).collect();
        assert_eq!(offsets, vec![2, 9]);
        assert_eq!(images.writes(), 2);
        assert!(images.keys(BtreeId::Dirents).is_empty());
    }

    #[test]
    fn snapshot_is_independent() {
        let images = NodeImages::new();
        images.replace_range(BtreeId::Xattrs, Pos::MIN, Pos::MAX, [key(1)]);
        let snapshot = images.snapshot();
        images.replace_range(BtreeId::Xattrs, Pos::MIN, Pos::MAX, []);

        assert!(images.keys(BtreeId::Xattrs).is_empty());
        assert_eq!(snapshot.keys(BtreeId::Xattrs), vec![key(1)]);
    }

    #[test]
    #[should_panic(expected = "outside node range")]
    fn out_of_range_key_panics() {
        NodeImages::new().replace_range(BtreeId::Inodes, Pos::new(2, 0), Pos::new(2, 9), [key(1)]);
    }
}

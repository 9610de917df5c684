//! Model-checked integration helpers.
//!
//! [`IntegrationHarness`] applies operations to a store and to an in-memory
//! model side by side, then checks that the trees and usage counters agree
//! with the model.

use crate::fixtures::small_config;
use crate::generators::{StoreOperation, EXTENT_INODE};
use cowbtree_core::{BtreeId, CommitFlags, Config, DeviceSet, IterFlags, Key, KeyValue, Pos, Store};
use std::collections::BTreeMap;

/// A test harness tracking the expected contents of a store.
pub struct IntegrationHarness {
    /// The store instance.
    pub store: Store,
    /// Expected point keys per tree.
    points: BTreeMap<BtreeId, BTreeMap<Pos, Vec<u8>>>,
    /// Expected placement of every written extent sector.
    sectors: BTreeMap<u64, DeviceSet>,
}

impl IntegrationHarness {
    /// Creates a harness over a store with small leaves.
    pub fn new() -> Self {
        Self::with_config(small_config())
    }

    /// Creates a harness over a store opened with `config`.
    pub fn with_config(config: Config) -> Self {
        Self {
            store: Store::new(config).expect("Failed to open store"),
            points: BTreeMap::new(),
            sectors: BTreeMap::new(),
        }
    }

    /// Applies one operation to the store and the model.
    pub fn apply(&mut self, op: &StoreOperation) {
        match op {
            StoreOperation::Insert { btree_id, pos, value } => self.insert(*btree_id, *pos, value.clone()),
            StoreOperation::Delete { btree_id, pos } => self.delete(*btree_id, *pos),
            StoreOperation::DeleteRange { btree_id, start, end } => self.delete_range(*btree_id, *start, *end),
            StoreOperation::WriteExtent { start, size, devs } => self.write_extent(*start, *size, *devs),
            StoreOperation::PunchHole { start, end } => self.punch_hole(*start, *end),
        }
    }

    /// Inserts a point key.
    pub fn insert(&mut self, btree_id: BtreeId, pos: Pos, value: Vec<u8>) {
        self.store
            .btree_insert(btree_id, Key::inline(pos, value.clone()), None, None, CommitFlags::NONE)
            .expect("Failed to insert key");
        self.points.entry(btree_id).or_default().insert(pos, value);
    }

    /// Deletes a point key through a transaction iterator.
    pub fn delete(&mut self, btree_id: BtreeId, pos: Pos) {
        let mut trans = self.store.trans();
        let iter = trans.get_iter(btree_id, pos, IterFlags::INTENT);
        trans.delete_at(iter, CommitFlags::NONE).expect("Failed to delete key");
        if let Some(tree) = self.points.get_mut(&btree_id) {
            tree.remove(&pos);
        }
    }

    /// Deletes every point key in `[start, end)`.
    pub fn delete_range(&mut self, btree_id: BtreeId, start: Pos, end: Pos) {
        self.store
            .delete_range(btree_id, start, end, None)
            .expect("Failed to delete range");
        if let Some(tree) = self.points.get_mut(&btree_id) {
            tree.retain(|pos, _| *pos < start || *pos >= end);
        }
    }

    /// Writes an extent in the extents inode.
    pub fn write_extent(&mut self, start: u64, size: u64, devs: DeviceSet) {
        self.store
            .btree_insert(
                BtreeId::Extents,
                Key::extent(EXTENT_INODE, start, size, devs),
                None,
                None,
                CommitFlags::NONE,
            )
            .expect("Failed to write extent");
        for sector in start..start + size {
            self.sectors.insert(sector, devs);
        }
    }

    /// Removes extent data in `[start, end)`.
    pub fn punch_hole(&mut self, start: u64, end: u64) {
        self.store
            .delete_range(
                BtreeId::Extents,
                Pos::new(EXTENT_INODE, start),
                Pos::new(EXTENT_INODE, end),
                None,
            )
            .expect("Failed to punch hole");
        self.sectors.retain(|sector, _| *sector < start || *sector >= end);
    }

    /// Creates an inode and its directory entry in one atomic transaction.
    pub fn create_file(&mut self, dir: u64, name_hash: u64, inum: u64) {
        let inode = Pos::new(inum, 0);
        let dirent = Pos::new(dir, name_hash);
        let inode_value = inum.to_le_bytes().to_vec();
        let dirent_value = inum.to_le_bytes().to_vec();
        self.store
            .trans_do(None, CommitFlags::ATOMIC, |trans| {
                let i = trans.get_iter(BtreeId::Inodes, inode, IterFlags::INTENT);
                trans.update(i, Key::inline(inode, inode_value.clone()));
                let d = trans.get_iter(BtreeId::Dirents, dirent, IterFlags::INTENT);
                trans.update(d, Key::inline(dirent, dirent_value.clone()));
                Ok(())
            })
            .expect("Failed to create file");
        self.points.entry(BtreeId::Inodes).or_default().insert(inode, inode_value);
        self.points.entry(BtreeId::Dirents).or_default().insert(dirent, dirent_value);
    }

    /// Looks up a point key and checks it against the model.
    pub fn get_and_verify(&self, btree_id: BtreeId, pos: Pos) -> Option<Key> {
        let actual = self.store.get(btree_id, pos);
        let expected = self.points.get(&btree_id).and_then(|tree| tree.get(&pos));
        assert_eq!(
            actual.as_ref().map(inline_bytes),
            expected.map(Vec::as_slice),
            "{btree_id} mismatch at {pos}"
        );
        actual
    }

    /// Checks every tree and the usage counters against the model.
    pub fn verify_all(&self) {
        for btree_id in [BtreeId::Inodes, BtreeId::Dirents, BtreeId::Xattrs] {
            let actual: Vec<(Pos, Vec<u8>)> = self
                .store
                .keys(btree_id)
                .iter()
                .map(|k| (k.pos, inline_bytes(k).to_vec()))
                .collect();
            let expected: Vec<(Pos, Vec<u8>)> = self
                .points
                .get(&btree_id)
                .map(|tree| tree.iter().map(|(p, v)| (*p, v.clone())).collect())
                .unwrap_or_default();
            assert_eq!(actual, expected, "{btree_id} contents differ");
        }

        assert_eq!(self.extent_sectors(), self.sectors, "extent placement differs");

        let usage = self.store.usage();
        assert_eq!(usage.data_sectors, self.sectors.len() as u64, "data sectors");
        assert_eq!(usage.nr_inodes, self.tracked(BtreeId::Inodes) as u64, "inode count");
        let allocated: u64 = self.sectors.values().map(|devs| devs.len() as u64).sum();
        assert_eq!(usage.alloc_sectors, allocated, "allocated sectors");
    }

    /// Number of point keys tracked for `btree_id`.
    pub fn tracked(&self, btree_id: BtreeId) -> usize {
        self.points.get(&btree_id).map_or(0, BTreeMap::len)
    }

    /// Number of extent sectors tracked.
    pub fn tracked_sectors(&self) -> usize {
        self.sectors.len()
    }

    // Sector placement as stored in the extents tree.
    fn extent_sectors(&self) -> BTreeMap<u64, DeviceSet> {
        let mut sectors = BTreeMap::new();
        for key in self.store.keys(BtreeId::Extents) {
            let devs = key.devs();
            for sector in key.start().offset..key.pos.offset {
                let prev = sectors.insert(sector, devs);
                assert!(prev.is_none(), "extents overlap at sector {sector}");
            }
        }
        sectors
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn inline_bytes(key: &Key) -> &[u8] {
    match &key.value {
        KeyValue::Inline(bytes) => bytes,
        other => panic!("expected an inline value at {}, found {other:?}", key.pos),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::{operation_sequence_strategy, PropTestConfig};
    use cowbtree_core::DeviceId;
    use proptest::prelude::*;

    fn devs(ids: &[u8]) -> DeviceSet {
        ids.iter().map(|&i| DeviceId::new(i)).collect()
    }

    #[test]
    fn harness_tracks_point_keys() {
        let mut harness = IntegrationHarness::new();
        for offset in 0..30 {
            harness.insert(BtreeId::Dirents, Pos::new(2, offset), vec![offset as u8; 12]);
        }
        harness.delete(BtreeId::Dirents, Pos::new(2, 7));
        harness.delete_range(BtreeId::Dirents, Pos::new(2, 10), Pos::new(2, 20));

        assert_eq!(harness.tracked(BtreeId::Dirents), 19);
        assert!(harness.get_and_verify(BtreeId::Dirents, Pos::new(2, 7)).is_none());
        assert!(harness.get_and_verify(BtreeId::Dirents, Pos::new(2, 20)).is_some());
        harness.verify_all();
    }

    #[test]
    fn harness_tracks_extent_overwrites() {
        let mut harness = IntegrationHarness::new();
        harness.write_extent(0, 16, devs(&[0]));
        harness.write_extent(4, 4, devs(&[1, 2]));
        harness.punch_hole(12, 14);

        assert_eq!(harness.tracked_sectors(), 14);
        harness.verify_all();
    }

    #[test]
    fn create_file_writes_both_trees() {
        let mut harness = IntegrationHarness::new();
        for inum in 10..25 {
            harness.create_file(1, inum * 3, inum);
        }
        assert_eq!(harness.store.usage().nr_inodes, 15);
        harness.verify_all();
    }

    #[test]
    fn inode_overwrite_keeps_count() {
        let mut harness = IntegrationHarness::new();
        harness.insert(BtreeId::Inodes, Pos::new(5, 0), vec![1]);
        harness.insert(BtreeId::Inodes, Pos::new(5, 0), vec![2]);
        harness.verify_all();
        harness.delete(BtreeId::Inodes, Pos::new(5, 0));
        harness.verify_all();
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn random_operations_match_model(ops in operation_sequence_strategy(1, 80)) {
            let mut harness = IntegrationHarness::new();
            for op in &ops {
                harness.apply(op);
            }
            harness.verify_all();
        }
    }
}

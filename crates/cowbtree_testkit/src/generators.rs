//! Property-based test generators using proptest.
//!
//! Key positions are drawn from a small space so that generated sequences
//! overwrite, delete and split the same leaves repeatedly.

use cowbtree_core::{BtreeId, DeviceId, DeviceSet, Key, Pos};
use proptest::prelude::*;

/// Inode all generated extents live in.
pub const EXTENT_INODE: u64 = 1;

/// Upper bound of generated extent offsets.
pub const EXTENT_SPACE: u64 = 128;

/// Strategy for a point tree (a tree with no range keys).
pub fn point_btree_strategy() -> impl Strategy<Value = BtreeId> {
    prop_oneof![Just(BtreeId::Inodes), Just(BtreeId::Dirents), Just(BtreeId::Xattrs)]
}

/// Strategy for positions in a small key space.
pub fn pos_strategy() -> impl Strategy<Value = Pos> {
    (1u64..4, 0u64..64).prop_map(|(inode, offset)| Pos::new(inode, offset))
}

/// Strategy for inline values.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..40)
}

/// Strategy for a non-empty device set over devices `0..4`.
pub fn devs_strategy() -> impl Strategy<Value = DeviceSet> {
    prop::collection::btree_set(0u8..4, 1..3).prop_map(|ids| ids.into_iter().map(DeviceId::new).collect())
}

/// Strategy for an extent in [`EXTENT_INODE`] as `(start, size, devs)`.
pub fn extent_strategy() -> impl Strategy<Value = (u64, u64, DeviceSet)> {
    (0u64..EXTENT_SPACE - 16, 1u64..16, devs_strategy())
}

/// One operation applied to a store.
#[derive(Debug, Clone)]
pub enum StoreOperation {
    /// Insert or overwrite a point key.
    Insert {
        /// Target tree.
        btree_id: BtreeId,
        /// Key position.
        pos: Pos,
        /// Inline value.
        value: Vec<u8>,
    },
    /// Delete one point key, present or not.
    Delete {
        /// Target tree.
        btree_id: BtreeId,
        /// Key position.
        pos: Pos,
    },
    /// Delete every point key in `[start, end)`.
    DeleteRange {
        /// Target tree.
        btree_id: BtreeId,
        /// First position deleted.
        start: Pos,
        /// First position kept.
        end: Pos,
    },
    /// Write an extent over `[start, start + size)`.
    WriteExtent {
        /// First sector.
        start: u64,
        /// Length in sectors.
        size: u64,
        /// Devices holding the data.
        devs: DeviceSet,
    },
    /// Punch a hole over `[start, end)` in the extents tree.
    PunchHole {
        /// First sector removed.
        start: u64,
        /// First sector kept.
        end: u64,
    },
}

impl StoreOperation {
    /// Key written by an insert operation.
    #[must_use]
    pub fn key(&self) -> Option<Key> {
        match self {
            Self::Insert { pos, value, .. } => Some(Key::inline(*pos, value.clone())),
            Self::WriteExtent { start, size, devs } => Some(Key::extent(EXTENT_INODE, *start, *size, *devs)),
            _ => None,
        }
    }
}

/// Strategy for store operations.
pub fn store_operation_strategy() -> impl Strategy<Value = StoreOperation> {
    prop_oneof![
        4 => (point_btree_strategy(), pos_strategy(), value_strategy())
            .prop_map(|(btree_id, pos, value)| StoreOperation::Insert { btree_id, pos, value }),
        2 => (point_btree_strategy(), pos_strategy())
            .prop_map(|(btree_id, pos)| StoreOperation::Delete { btree_id, pos }),
        1 => (point_btree_strategy(), pos_strategy(), 0u64..16).prop_map(|(btree_id, start, len)| {
            StoreOperation::DeleteRange {
                btree_id,
                start,
                end: Pos::new(start.inode, start.offset + len),
            }
        }),
        2 => extent_strategy().prop_map(|(start, size, devs)| StoreOperation::WriteExtent { start, size, devs }),
        1 => (0u64..EXTENT_SPACE, 1u64..32).prop_map(|(start, len)| StoreOperation::PunchHole {
            start,
            end: start + len,
        }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(min_ops: usize, max_ops: usize) -> impl Strategy<Value = Vec<StoreOperation>> {
    prop::collection::vec(store_operation_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 128,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 24,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 512,
            max_shrink_iters: 5000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

//! Core type definitions: positions, B-tree ids, devices.

use std::fmt;

/// A position in a B-tree keyspace.
///
/// Positions order by inode, then offset. Extent keys are indexed by the
/// position of their end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pos {
    /// Inode number.
    pub inode: u64,
    /// Offset within the inode.
    pub offset: u64,
}

impl Pos {
    /// The smallest position.
    pub const MIN: Pos = Pos::new(0, 0);

    /// The largest position.
    pub const MAX: Pos = Pos::new(u64::MAX, u64::MAX);

    /// Creates a position.
    #[must_use]
    pub const fn new(inode: u64, offset: u64) -> Self {
        Self { inode, offset }
    }

    /// Returns the next position.
    ///
    /// # Panics
    ///
    /// Panics if called on [`Pos::MAX`].
    #[must_use]
    pub fn successor(self) -> Self {
        assert!(self != Self::MAX, "successor of Pos::MAX");
        if self.offset == u64::MAX {
            Self::new(self.inode + 1, 0)
        } else {
            Self::new(self.inode, self.offset + 1)
        }
    }

    /// Returns the previous position.
    ///
    /// # Panics
    ///
    /// Panics if called on [`Pos::MIN`].
    #[must_use]
    pub fn predecessor(self) -> Self {
        assert!(self != Self::MIN, "predecessor of Pos::MIN");
        if self.offset == 0 {
            Self::new(self.inode - 1, u64::MAX)
        } else {
            Self::new(self.inode, self.offset - 1)
        }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

/// Identifies one of the store's B-trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BtreeId {
    /// File data extents.
    Extents = 0,
    /// Inodes.
    Inodes = 1,
    /// Directory entries.
    Dirents = 2,
    /// Extended attributes.
    Xattrs = 3,
    /// Per-device allocation counters.
    Alloc = 4,
    /// Shared extents.
    Reflink = 5,
}

impl BtreeId {
    /// Every B-tree, in id order.
    pub const ALL: [BtreeId; 6] = [
        BtreeId::Extents,
        BtreeId::Inodes,
        BtreeId::Dirents,
        BtreeId::Xattrs,
        BtreeId::Alloc,
        BtreeId::Reflink,
    ];

    /// Returns the id as a byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a byte back into an id.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Extents),
            1 => Some(Self::Inodes),
            2 => Some(Self::Dirents),
            3 => Some(Self::Xattrs),
            4 => Some(Self::Alloc),
            5 => Some(Self::Reflink),
            _ => None,
        }
    }

    /// Keys in this tree describe position ranges.
    #[must_use]
    pub const fn is_extents(self) -> bool {
        matches!(self, Self::Extents | Self::Reflink)
    }

    /// Updates to this tree run accounting triggers.
    #[must_use]
    pub const fn has_triggers(self) -> bool {
        matches!(
            self,
            Self::Extents | Self::Alloc | Self::Inodes | Self::Reflink
        )
    }

    /// Triggers that run before write locks are taken and may add updates.
    #[must_use]
    pub const fn has_trans_triggers(self) -> bool {
        matches!(self, Self::Extents | Self::Inodes | Self::Reflink)
    }

    /// Triggers that run under the write lock.
    #[must_use]
    pub const fn has_nontrans_triggers(self) -> bool {
        self.has_triggers() && !self.has_trans_triggers()
    }

    /// Commits to this tree take the accounting lock.
    #[must_use]
    pub const fn needs_gc(self) -> bool {
        self.has_triggers()
    }
}

impl fmt::Display for BtreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Extents => "extents",
            Self::Inodes => "inodes",
            Self::Dirents => "dirents",
            Self::Xattrs => "xattrs",
            Self::Alloc => "alloc",
            Self::Reflink => "reflink",
        };
        f.write_str(name)
    }
}

/// Index of a storage device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u8);

impl DeviceId {
    /// Creates a device id.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not fit in a [`DeviceSet`].
    #[must_use]
    pub const fn new(id: u8) -> Self {
        assert!(id < 64, "device id out of range");
        Self(id)
    }

    /// Returns the raw index.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev:{}", self.0)
    }
}

/// A set of up to 64 devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceSet(u64);

impl DeviceSet {
    /// The empty set.
    pub const EMPTY: DeviceSet = DeviceSet(0);

    /// Creates a set from its bitmask.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the bitmask.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// A set holding one device.
    #[must_use]
    pub const fn single(dev: DeviceId) -> Self {
        Self(1 << dev.0)
    }

    /// Returns the set with `dev` added.
    #[must_use]
    pub const fn with(self, dev: DeviceId) -> Self {
        Self(self.0 | (1 << dev.0))
    }

    /// Adds `dev`.
    pub fn insert(&mut self, dev: DeviceId) {
        self.0 |= 1 << dev.0;
    }

    /// Returns true if `dev` is in the set.
    #[must_use]
    pub const fn contains(self, dev: DeviceId) -> bool {
        self.0 & (1 << dev.0) != 0
    }

    /// Number of devices in the set.
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the devices in ascending order.
    pub fn iter(self) -> impl Iterator<Item = DeviceId> {
        (0u8..64)
            .filter(move |i| self.0 & (1 << i) != 0)
            .map(DeviceId)
    }
}

impl FromIterator<DeviceId> for DeviceSet {
    fn from_iter<I: IntoIterator<Item = DeviceId>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for dev in iter {
            set.insert(dev);
        }
        set
    }
}

/// Identifier of an in-memory B-tree leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Creates a node id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pos_ordering() {
        assert!(Pos::new(1, u64::MAX) < Pos::new(2, 0));
        assert!(Pos::MIN < Pos::new(0, 1));
        assert!(Pos::new(5, 5) < Pos::MAX);
    }

    #[test]
    fn pos_successor_carries_into_inode() {
        assert_eq!(Pos::new(3, 9).successor(), Pos::new(3, 10));
        assert_eq!(Pos::new(3, u64::MAX).successor(), Pos::new(4, 0));
        assert_eq!(Pos::new(4, 0).predecessor(), Pos::new(3, u64::MAX));
    }

    #[test]
    #[should_panic(expected = "successor of Pos::MAX")]
    fn pos_max_has_no_successor() {
        let _ = Pos::MAX.successor();
    }

    #[test]
    fn btree_properties() {
        assert!(BtreeId::Extents.is_extents());
        assert!(BtreeId::Reflink.is_extents());
        assert!(!BtreeId::Inodes.is_extents());

        assert!(BtreeId::Alloc.has_triggers());
        assert!(!BtreeId::Alloc.has_trans_triggers());
        assert!(BtreeId::Alloc.has_nontrans_triggers());
        assert!(BtreeId::Inodes.has_trans_triggers());
        assert!(!BtreeId::Dirents.needs_gc());
        assert!(!BtreeId::Xattrs.has_triggers());
    }

    #[test]
    fn btree_id_round_trips_through_byte() {
        for id in BtreeId::ALL {
            assert_eq!(BtreeId::from_u8(id.as_u8()), Some(id));
        }
        assert_eq!(BtreeId::from_u8(99), None);
    }

    #[test]
    fn device_set_ops() {
        let set: DeviceSet = [DeviceId::new(0), DeviceId::new(3)].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(DeviceId::new(3)));
        assert!(!set.contains(DeviceId::new(1)));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![DeviceId::new(0), DeviceId::new(3)]
        );
        assert_eq!(set.with(DeviceId::new(1)).len(), 3);
        assert!(DeviceSet::EMPTY.is_empty());
    }
}

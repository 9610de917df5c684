//! Keys stored in B-tree leaves and logged to the journal.

use crate::types::{DeviceSet, Pos};
use bytes::Bytes;

/// Size of a key header, in u64s.
pub const KEY_U64S: u64 = 3;

/// The value carried by a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    /// A whiteout: deletes whatever lives at the key's position.
    Deleted,
    /// An opaque inline value.
    Inline(Bytes),
    /// A range of data stored on `devs`.
    Extent {
        /// Devices holding a replica of the data.
        devs: DeviceSet,
    },
}

impl KeyValue {
    /// Encoded value size in u64s.
    #[must_use]
    pub fn u64s(&self) -> u64 {
        match self {
            Self::Deleted => 0,
            Self::Inline(bytes) => (bytes.len() as u64).div_ceil(8),
            Self::Extent { devs } => devs.len().max(1) as u64,
        }
    }
}

/// A key: a position, an optional size for range keys, and a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    /// Position of the key; for extents, the position of their end.
    pub pos: Pos,
    /// Extent length; zero for point keys.
    pub size: u64,
    /// Version stamp.
    pub version: u64,
    /// An older copy of this key is durable and must be overridden by a
    /// whiteout if this one is deleted.
    pub needs_whiteout: bool,
    /// The value.
    pub value: KeyValue,
}

impl Key {
    /// Creates a point key.
    #[must_use]
    pub fn new(pos: Pos, value: KeyValue) -> Self {
        Self {
            pos,
            size: 0,
            version: 0,
            needs_whiteout: false,
            value,
        }
    }

    /// Creates a whiteout at `pos`.
    #[must_use]
    pub fn whiteout(pos: Pos) -> Self {
        Self::new(pos, KeyValue::Deleted)
    }

    /// Creates a key holding `bytes`.
    #[must_use]
    pub fn inline(pos: Pos, bytes: impl Into<Bytes>) -> Self {
        Self::new(pos, KeyValue::Inline(bytes.into()))
    }

    /// Creates an extent covering `[start, start + size)` within `inode`.
    #[must_use]
    pub fn extent(inode: u64, start: u64, size: u64, devs: DeviceSet) -> Self {
        Self {
            pos: Pos::new(inode, start + size),
            size,
            version: 0,
            needs_whiteout: false,
            value: KeyValue::Extent { devs },
        }
    }

    /// Sets the version stamp.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Start of the range the key covers.
    #[must_use]
    pub fn start(&self) -> Pos {
        Pos::new(self.pos.inode, self.pos.offset - self.size)
    }

    /// Encoded size in u64s.
    #[must_use]
    pub fn u64s(&self) -> u64 {
        KEY_U64S + self.value.u64s()
    }

    /// Returns true if this key deletes rather than stores.
    #[must_use]
    pub fn is_whiteout(&self) -> bool {
        matches!(self.value, KeyValue::Deleted)
    }

    /// Devices an extent lives on; empty for other keys.
    #[must_use]
    pub fn devs(&self) -> DeviceSet {
        match self.value {
            KeyValue::Extent { devs } => devs,
            _ => DeviceSet::EMPTY,
        }
    }

    /// Changes the size, keeping the start fixed.
    pub fn resize(&mut self, new_size: u64) {
        let start = self.start();
        self.pos = Pos::new(start.inode, start.offset.saturating_add(new_size));
        self.size = self.pos.offset - start.offset;
    }

    /// Trims the front so the key starts at `at`.
    pub fn cut_front(&mut self, at: Pos) {
        let start = self.start();
        if at <= start {
            return;
        }
        let at = at.min(self.pos);
        self.size -= at.offset - start.offset;
    }

    /// Trims the back so the key ends at `at`.
    pub fn cut_back(&mut self, at: Pos) {
        if at >= self.pos {
            return;
        }
        let start = self.start();
        let end = at.max(start);
        self.size = end.offset - start.offset;
        self.pos = end;
    }

    /// Number of sectors `[start, end)` has in common with this key.
    #[must_use]
    pub fn overlap(&self, start: Pos, end: Pos) -> u64 {
        let lo = self.start().max(start);
        let hi = self.pos.min(end);
        if lo >= hi || lo.inode != hi.inode {
            0
        } else {
            hi.offset - lo.offset
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceId;

    #[test]
    fn u64s_counts_header_and_value() {
        assert_eq!(Key::whiteout(Pos::new(1, 1)).u64s(), 3);
        assert_eq!(Key::inline(Pos::new(1, 1), vec![0u8; 9]).u64s(), 5);
        let devs = DeviceSet::single(DeviceId::new(0)).with(DeviceId::new(1));
        assert_eq!(Key::extent(1, 0, 8, devs).u64s(), 5);
    }

    #[test]
    fn extent_start_and_resize() {
        let mut k = Key::extent(1, 10, 5, DeviceSet::EMPTY);
        assert_eq!(k.start(), Pos::new(1, 10));
        assert_eq!(k.pos, Pos::new(1, 15));

        k.resize(100);
        assert_eq!(k.start(), Pos::new(1, 10));
        assert_eq!(k.pos, Pos::new(1, 110));
    }

    #[test]
    fn cut_front_and_back() {
        let mut k = Key::extent(1, 10, 10, DeviceSet::EMPTY);
        k.cut_front(Pos::new(1, 12));
        assert_eq!((k.start(), k.pos), (Pos::new(1, 12), Pos::new(1, 20)));

        k.cut_back(Pos::new(1, 15));
        assert_eq!((k.start(), k.pos), (Pos::new(1, 12), Pos::new(1, 15)));

        k.cut_back(Pos::new(2, 0));
        assert_eq!(k.size, 3);
    }

    #[test]
    fn cut_back_before_start_empties_key() {
        let mut k = Key::extent(1, 10, 10, DeviceSet::EMPTY);
        k.cut_back(Pos::new(0, 5));
        assert_eq!(k.size, 0);
        assert_eq!(k.pos, Pos::new(1, 10));
    }

    #[test]
    fn overlap_is_half_open() {
        let k = Key::extent(1, 10, 10, DeviceSet::EMPTY);
        assert_eq!(k.overlap(Pos::new(1, 0), Pos::new(1, 10)), 0);
        assert_eq!(k.overlap(Pos::new(1, 15), Pos::new(1, 30)), 5);
        assert_eq!(k.overlap(Pos::new(1, 0), Pos::new(1, 30)), 10);
        assert_eq!(k.overlap(Pos::new(2, 0), Pos::new(2, 30)), 0);
    }
}

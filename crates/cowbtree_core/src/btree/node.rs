//! B-tree leaf nodes.
//!
//! A node holds up to [`MAX_BSETS`] sorted key sets. Only the last one is
//! mutable, and only until the node is written; writing starts a new one.
//! Keys overwritten in an older set are marked dead in place and dropped by
//! compaction. Each position has at most one live key across all sets.
//!
//! A node has two write slots, each with its own journal pin. Commits pin
//! the current slot at their sequence number; writing the node makes those
//! sequences unnecessary and drops the pins.
//!
//! Node contents sit behind a mutex that is only held for short, non-blocking
//! sections. Who may touch them is decided by the node's [`SixLock`]: the
//! write lock holder mutates, readers and intent holders read.

use super::extents;
use super::images::NodeImages;
use super::lock::SixLock;
use crate::error::CoreResult;
use crate::journal::{FlushFn, Journal, JournalPin, PinFlush};
use crate::key::{Key, KEY_U64S};
use crate::types::{BtreeId, NodeId, Pos};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Maximum number of key sets in a node.
pub const MAX_BSETS: usize = 3;

/// Shared services nodes need to write themselves back.
pub(crate) struct NodeIo {
    pub(crate) journal: Arc<Journal>,
    pub(crate) images: NodeImages,
    pub(crate) capacity_u64s: u64,
}

#[derive(Debug, Clone)]
struct Slot {
    key: Key,
    dead: bool,
}

impl Slot {
    fn is_live(&self) -> bool {
        !self.dead && !self.key.is_whiteout()
    }
}

#[derive(Debug, Default)]
struct Bset {
    keys: BTreeMap<Pos, Slot>,
    written: bool,
}

/// Accounting deltas from one insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// The node changed and the key must be journalled.
    pub changed: bool,
    /// Change in stored u64s, including reserved whiteouts.
    pub u64s_added: i64,
    /// Change in live u64s.
    pub live_added: i64,
}

/// Mutable node contents.
pub struct NodeData {
    bsets: SmallVec<[Bset; MAX_BSETS]>,
    u64s: u64,
    live_u64s: u64,
    whiteout_u64s: u64,
    dirty: bool,
    just_written: bool,
    dying: bool,
    write_idx: usize,
    sib_u64s: [u64; 2],
    journal_seq: u64,
    writes: u64,
    compactions: u64,
}

impl NodeData {
    fn new(keys: impl IntoIterator<Item = Key>, written: bool) -> Self {
        let mut bset = Bset {
            keys: BTreeMap::new(),
            written,
        };
        let mut u64s = 0;
        for mut key in keys {
            debug_assert!(!key.is_whiteout(), "building a node from a whiteout");
            if written {
                key.needs_whiteout = true;
            }
            u64s += key.u64s();
            bset.keys.insert(key.pos, Slot { key, dead: false });
        }
        let mut bsets = SmallVec::new();
        bsets.push(bset);
        Self {
            bsets,
            u64s,
            live_u64s: u64s,
            whiteout_u64s: 0,
            dirty: false,
            just_written: false,
            dying: false,
            write_idx: 0,
            sib_u64s: [u64s; 2],
            journal_seq: 0,
            writes: 0,
            compactions: 0,
        }
    }

    /// Live u64s.
    #[must_use]
    pub fn live_u64s(&self) -> u64 {
        self.live_u64s
    }

    /// Stored u64s plus reserved whiteouts.
    #[must_use]
    pub fn used_u64s(&self) -> u64 {
        self.u64s + self.whiteout_u64s
    }

    /// Number of key sets.
    #[must_use]
    pub fn nr_bsets(&self) -> usize {
        self.bsets.len()
    }

    /// Returns true if the node has unwritten changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns true once the node has been replaced by a split or merge.
    #[must_use]
    pub fn is_dying(&self) -> bool {
        self.dying
    }

    /// Newest journal sequence whose keys the node holds.
    #[must_use]
    pub fn journal_seq(&self) -> u64 {
        self.journal_seq
    }

    /// Times the node has been written.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Times dead keys were compacted out.
    #[must_use]
    pub fn compactions(&self) -> u64 {
        self.compactions
    }

    /// Merge size hint towards the previous (0) or next (1) sibling.
    #[must_use]
    pub fn sib_u64s(&self, dir: usize) -> u64 {
        self.sib_u64s[dir]
    }

    pub(crate) fn set_sib_u64s(&mut self, dir: usize, u64s: u64) {
        self.sib_u64s[dir] = u64s;
    }

    /// Carries over dirty state from a node this one replaces.
    pub(crate) fn inherit_dirty(&mut self, journal_seq: u64) {
        self.dirty = true;
        self.journal_seq = self.journal_seq.max(journal_seq);
    }

    pub(crate) fn set_dying(&mut self) {
        self.dying = true;
    }

    /// The live key at `pos`.
    #[must_use]
    pub fn get(&self, pos: Pos) -> Option<&Key> {
        self.bsets
            .iter()
            .rev()
            .filter_map(|b| b.keys.get(&pos))
            .find(|slot| slot.is_live())
            .map(|slot| &slot.key)
    }

    /// First live key at or after `from`.
    #[must_use]
    pub fn peek_from(&self, from: Pos) -> Option<&Key> {
        self.bsets
            .iter()
            .filter_map(|b| b.keys.range(from..).map(|(_, s)| s).find(|s| s.is_live()))
            .map(|slot| &slot.key)
            .min_by_key(|key| key.pos)
    }

    /// Every live key, in order.
    #[must_use]
    pub fn live_keys(&self) -> Vec<Key> {
        let mut keys: BTreeMap<Pos, &Key> = BTreeMap::new();
        for bset in &self.bsets {
            for slot in bset.keys.values().filter(|s| s.is_live()) {
                keys.insert(slot.key.pos, &slot.key);
            }
        }
        keys.into_values().cloned().collect()
    }

    /// Space left for inserts.
    #[must_use]
    pub fn free_u64s(&self, capacity: u64) -> u64 {
        capacity.saturating_sub(self.used_u64s())
    }

    fn find_live(&self, pos: Pos) -> Option<usize> {
        self.bsets
            .iter()
            .rposition(|b| b.keys.get(&pos).is_some_and(Slot::is_live))
    }

    fn last_mut(&mut self) -> &mut Bset {
        let last = self.bsets.len() - 1;
        &mut self.bsets[last]
    }

    /// Inserts `insert` at its position.
    ///
    /// Returns true if the node changed.
    pub(super) fn insert_key(&mut self, mut insert: Key) -> bool {
        let last = self.bsets.len() - 1;
        assert!(!self.bsets[last].written, "inserting into a written bset");
        let pos = insert.pos;

        let Some(idx) = self.find_live(pos) else {
            if insert.is_whiteout() {
                return false;
            }
            let u64s = insert.u64s();
            self.live_u64s += u64s;
            self.u64s += u64s;
            let bset = self.last_mut();
            if let Some(old) = bset.keys.remove(&pos) {
                insert.needs_whiteout |= old.key.needs_whiteout;
                self.u64s -= old.key.u64s();
            }
            self.last_mut().keys.insert(pos, Slot { key: insert, dead: false });
            return true;
        };

        let old = self.bsets[idx].keys[&pos].key.clone();
        if idx == last && !insert.is_whiteout() && old.value.u64s() == insert.value.u64s() {
            insert.needs_whiteout = old.needs_whiteout;
            self.last_mut().keys.insert(pos, Slot { key: insert, dead: false });
            return true;
        }

        insert.needs_whiteout = old.needs_whiteout;
        self.live_u64s -= old.u64s();

        if idx == last {
            self.u64s -= old.u64s();
            if insert.is_whiteout() && !insert.needs_whiteout {
                self.last_mut().keys.remove(&pos);
                return true;
            }
            if !insert.is_whiteout() {
                self.live_u64s += insert.u64s();
            }
            self.u64s += insert.u64s();
            self.last_mut().keys.insert(pos, Slot { key: insert, dead: false });
            return true;
        }

        if let Some(slot) = self.bsets[idx].keys.get_mut(&pos) {
            slot.dead = true;
            slot.key.needs_whiteout = false;
        }
        if insert.is_whiteout() {
            if insert.needs_whiteout {
                self.whiteout_u64s += KEY_U64S;
            }
            return true;
        }
        self.live_u64s += insert.u64s();
        self.u64s += insert.u64s();
        self.last_mut().keys.insert(pos, Slot { key: insert, dead: false });
        true
    }

    fn dead_u64s(&self) -> u64 {
        self.bsets
            .iter()
            .flat_map(|b| b.keys.values())
            .filter(|s| s.dead)
            .map(|s| s.key.u64s())
            .sum()
    }

    fn compact(&mut self) {
        for bset in self.bsets.iter_mut().filter(|b| b.written) {
            bset.keys.retain(|_, s| !s.dead);
        }
        let keep_last = self.bsets.len() - 1;
        let mut idx = 0;
        self.bsets.retain(|b| {
            let keep = idx == keep_last || !b.keys.is_empty();
            idx += 1;
            keep
        });
        self.u64s = self.bsets.iter().flat_map(|b| b.keys.values()).map(|s| s.key.u64s()).sum();
        self.compactions += 1;
    }

    /// Compacts dead keys out if they take more than an eighth of the node.
    fn maybe_compact(&mut self, capacity: u64) -> bool {
        if self.dead_u64s() > capacity / 8 {
            self.compact();
            true
        } else {
            false
        }
    }

    // Folds every set into one written set of live keys.
    fn sort_into_one(&mut self) {
        let keys = self.live_keys();
        let mut bset = Bset {
            keys: BTreeMap::new(),
            written: true,
        };
        for key in keys {
            bset.keys.insert(key.pos, Slot { key, dead: false });
        }
        self.bsets.clear();
        self.bsets.push(bset);
        self.u64s = self.live_u64s;
        self.compactions += 1;
    }

    /// Readies the node for inserts under the write lock: cleans up after a
    /// write and makes sure the last set is unwritten.
    pub(crate) fn prepare_for_insert(&mut self, capacity: u64) {
        if self.just_written {
            self.just_written = false;
            self.maybe_compact(capacity);
        }
        if self.bsets.last().is_some_and(|b| b.written) {
            if self.bsets.len() == MAX_BSETS {
                self.sort_into_one();
            }
            self.bsets.push(Bset::default());
        }
    }

    fn mark_written(&mut self) {
        let mut removed = 0;
        for bset in &mut self.bsets {
            bset.written = true;
            bset.keys.retain(|_, slot| {
                if !slot.dead && slot.key.is_whiteout() {
                    removed += slot.key.u64s();
                    return false;
                }
                if !slot.dead {
                    slot.key.needs_whiteout = true;
                }
                true
            });
        }
        self.u64s -= removed;
        self.whiteout_u64s = 0;
        self.dirty = false;
        self.just_written = true;
        self.write_idx ^= 1;
        self.writes += 1;
    }
}

impl fmt::Debug for NodeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeData")
            .field("bsets", &self.bsets.len())
            .field("u64s", &self.u64s)
            .field("live_u64s", &self.live_u64s)
            .field("whiteout_u64s", &self.whiteout_u64s)
            .field("dirty", &self.dirty)
            .field("dying", &self.dying)
            .finish_non_exhaustive()
    }
}

/// A B-tree leaf.
pub struct Node {
    id: NodeId,
    btree_id: BtreeId,
    min: Pos,
    max: Pos,
    fake: bool,
    lock: SixLock,
    data: Mutex<NodeData>,
    pins: [JournalPin; 2],
    flush: FlushFn,
    io: Arc<NodeIo>,
}

struct NodeFlush {
    node: Weak<Node>,
}

impl PinFlush for NodeFlush {
    fn flush(&self, seq: u64) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        if let Err(err) = node.write() {
            warn!(node = %node.id, seq, error = %err, "node write from reclaim failed");
        }
    }
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        btree_id: BtreeId,
        range: (Pos, Pos),
        keys: impl IntoIterator<Item = Key>,
        written: bool,
        io: Arc<NodeIo>,
    ) -> Arc<Self> {
        Self::build(id, btree_id, range, keys, written, false, io)
    }

    /// A placeholder covering `range` that has no room for keys; the first
    /// insert splits it into a real node.
    pub(crate) fn fake(id: NodeId, btree_id: BtreeId, range: (Pos, Pos), io: Arc<NodeIo>) -> Arc<Self> {
        Self::build(id, btree_id, range, Vec::new(), true, true, io)
    }

    fn build(
        id: NodeId,
        btree_id: BtreeId,
        (min, max): (Pos, Pos),
        keys: impl IntoIterator<Item = Key>,
        written: bool,
        fake: bool,
        io: Arc<NodeIo>,
    ) -> Arc<Self> {
        assert!(min <= max, "node range {min}..={max} is empty");
        let data = NodeData::new(keys, written);
        Arc::new_cyclic(|weak| Self {
            id,
            btree_id,
            min,
            max,
            fake,
            lock: SixLock::new(),
            data: Mutex::new(data),
            pins: [JournalPin::new(), JournalPin::new()],
            flush: Arc::new(NodeFlush { node: weak.clone() }),
            io,
        })
    }

    /// Node id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Tree the node belongs to.
    #[must_use]
    pub fn btree_id(&self) -> BtreeId {
        self.btree_id
    }

    /// Smallest position the node covers.
    #[must_use]
    pub fn min(&self) -> Pos {
        self.min
    }

    /// Largest position the node covers.
    #[must_use]
    pub fn max(&self) -> Pos {
        self.max
    }

    /// Returns true if `pos` is in the node's range.
    #[must_use]
    pub fn covers(&self, pos: Pos) -> bool {
        self.min <= pos && pos <= self.max
    }

    /// Returns true for a placeholder node.
    #[must_use]
    pub fn is_fake(&self) -> bool {
        self.fake
    }

    /// The node lock.
    #[must_use]
    pub fn lock(&self) -> &SixLock {
        &self.lock
    }

    /// Node capacity in u64s.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        if self.fake {
            0
        } else {
            self.io.capacity_u64s
        }
    }

    /// Locks the node contents.
    pub fn data(&self) -> MutexGuard<'_, NodeData> {
        self.data.lock()
    }

    /// The journal pin of write slot `idx`.
    #[must_use]
    pub fn pin(&self, idx: usize) -> &JournalPin {
        &self.pins[idx]
    }

    pub(crate) fn flush_fn(&self) -> FlushFn {
        self.flush.clone()
    }

    /// Upper bound on the u64s inserting `key` can add.
    #[must_use]
    pub fn insert_u64s(&self, data: &NodeData, key: &Key) -> u64 {
        if self.btree_id.is_extents() {
            extents::can_insert(data, key)
        } else {
            key.u64s()
        }
    }

    /// Inserts `key` under the write lock.
    ///
    /// After the insert, merge hints shrink by any drop in live u64s, and
    /// dead keys may be compacted out when the insert grew the node more
    /// than its live contents.
    pub(crate) fn insert(&self, data: &mut NodeData, key: Key) -> InsertOutcome {
        debug_assert!(self.covers(key.pos), "key {} outside node {}", key.pos, self.id);
        let (u64s_before, live_before) = (data.used_u64s(), data.live_u64s);

        let changed = if self.btree_id.is_extents() {
            data.insert_extent(key)
        } else {
            data.insert_key(key)
        };

        let u64s_added = data.used_u64s() as i64 - u64s_before as i64;
        let live_added = data.live_u64s as i64 - live_before as i64;
        if live_added < 0 {
            let shrink = live_added.unsigned_abs();
            for hint in &mut data.sib_u64s {
                *hint = hint.saturating_sub(shrink);
            }
        }
        if u64s_added > live_added && data.maybe_compact(self.capacity()) {
            trace!(node = %self.id, "compacted dead keys");
        }

        InsertOutcome {
            changed,
            u64s_added,
            live_added,
        }
    }

    /// Records that the node holds keys journalled at `seq`, pinning that
    /// sequence on the current write slot if it is not pinned yet.
    pub(crate) fn journal_key_added(&self, data: &mut NodeData, seq: u64) {
        data.journal_seq = data.journal_seq.max(seq);
        let pins = self.io.journal.pins();
        let pin = &self.pins[data.write_idx];
        if !pins.is_active(pin) {
            pins.add(seq, pin, Some(self.flush.clone()));
        }
        data.dirty = true;
    }

    /// Writes the node's live keys to the image store.
    ///
    /// The journal is first made durable up to the newest sequence the node
    /// holds keys from, so an image never contains uncommitted keys. Returns
    /// false if there was nothing to write or the node is being replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal flush fails.
    pub fn write(&self) -> CoreResult<bool> {
        let journal = &self.io.journal;
        loop {
            let seq = self.data.lock().journal_seq;
            journal.flush_seq(seq)?;

            self.lock.lock_read();
            let mut data = self.data.lock();
            if data.dying || !data.dirty {
                drop(data);
                self.lock.unlock_read();
                return Ok(false);
            }
            if data.journal_seq > journal.last_durable_seq() {
                drop(data);
                self.lock.unlock_read();
                continue;
            }

            self.io
                .images
                .replace_range(self.btree_id, self.min, self.max, data.live_keys());
            data.mark_written();
            let pins = journal.pins();
            pins.drop_pin(&self.pins[0]);
            pins.drop_pin(&self.pins[1]);
            debug!(
                node = %self.id,
                btree = %self.btree_id,
                seq = data.journal_seq,
                live_u64s = data.live_u64s,
                "node written"
            );
            drop(data);
            self.lock.unlock_read();
            return Ok(true);
        }
    }

    /// Drops both write-slot pins. Used once the node has been replaced.
    pub(crate) fn drop_pins(&self) {
        let pins = self.io.journal.pins();
        pins.drop_pin(&self.pins[0]);
        pins.drop_pin(&self.pins[1]);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("btree_id", &self.btree_id)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("fake", &self.fake)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::test_io as io;
    use crate::journal::ResFlags;

    const OWNER: u64 = 1;

    fn leaf(btree_id: BtreeId, io: Arc<NodeIo>) -> Arc<Node> {
        Node::new(NodeId::new(1), btree_id, (Pos::MIN, Pos::MAX), Vec::new(), false, io)
    }

    fn val(offset: u64, byte: u8) -> Key {
        Key::inline(Pos::new(1, offset), vec![byte; 8])
    }

    fn insert(node: &Node, key: Key) -> InsertOutcome {
        let mut data = node.data();
        data.prepare_for_insert(node.capacity());
        node.insert(&mut data, key)
    }

    #[test]
    fn insert_and_overwrite_in_place() {
        let node = leaf(BtreeId::Inodes, io(512));
        let first = insert(&node, val(1, 1));
        assert!(first.changed);
        assert_eq!(first.live_added, 4);

        let again = insert(&node, val(1, 2));
        assert!(again.changed);
        assert_eq!(again.u64s_added, 0);
        assert_eq!(node.data().get(Pos::new(1, 1)), Some(&val(1, 2)));
    }

    #[test]
    fn whiteout_of_missing_key_is_a_noop() {
        let node = leaf(BtreeId::Inodes, io(512));
        let out = insert(&node, Key::whiteout(Pos::new(1, 1)));
        assert!(!out.changed);
        assert_eq!(node.data().used_u64s(), 0);
    }

    #[test]
    fn deleting_unwritten_key_erases_it() {
        let node = leaf(BtreeId::Inodes, io(512));
        insert(&node, val(1, 1));
        let out = insert(&node, Key::whiteout(Pos::new(1, 1)));
        assert!(out.changed);
        let data = node.data();
        assert_eq!(data.used_u64s(), 0);
        assert!(data.get(Pos::new(1, 1)).is_none());
    }

    #[test]
    fn deleting_written_key_reserves_a_whiteout() {
        let node = Node::new(
            NodeId::new(1),
            BtreeId::Inodes,
            (Pos::MIN, Pos::MAX),
            vec![val(1, 1)],
            true,
            io(512),
        );
        let out = insert(&node, Key::whiteout(Pos::new(1, 1)));
        assert!(out.changed);
        assert_eq!(out.live_added, -4);
        assert_eq!(out.u64s_added, KEY_U64S as i64);
        let data = node.data();
        assert!(data.get(Pos::new(1, 1)).is_none());
        assert_eq!(data.nr_bsets(), 2);
    }

    #[test]
    fn overwriting_written_key_inherits_needs_whiteout() {
        let node = Node::new(
            NodeId::new(1),
            BtreeId::Inodes,
            (Pos::MIN, Pos::MAX),
            vec![val(1, 1)],
            true,
            io(512),
        );
        insert(&node, val(1, 9));
        let data = node.data();
        let key = data.get(Pos::new(1, 1)).unwrap();
        assert!(key.needs_whiteout);
        assert_eq!(data.live_keys().len(), 1);
    }

    #[test]
    fn write_stores_image_and_drops_pins() {
        let io = io(512);
        let node = leaf(BtreeId::Inodes, io.clone());
        assert!(node.lock().try_intent(OWNER));
        node.lock().lock_write(OWNER);

        let mut res = io.journal.reserve(8, ResFlags::NONE).unwrap();
        {
            let mut data = node.data();
            data.prepare_for_insert(node.capacity());
            let key = val(3, 3);
            node.insert(&mut data, key.clone());
            io.journal.append(&mut res, BtreeId::Inodes, &key);
            node.journal_key_added(&mut data, res.seq());
        }
        node.lock().unlock_write(OWNER);
        node.lock().unlock_intent(OWNER);
        io.journal.release(res).unwrap();
        assert!(io.journal.pins().is_active(node.pin(0)));

        assert!(node.write().unwrap());
        assert!(!io.journal.pins().is_active(node.pin(0)));
        assert_eq!(io.journal.last_durable_seq(), 1);
        assert_eq!(io.images.keys(BtreeId::Inodes), vec![val(3, 3)]);
        assert!(!node.write().unwrap(), "clean node is not rewritten");

        let data = node.data();
        assert!(!data.is_dirty());
        assert_eq!(data.writes(), 1);
    }

    #[test]
    fn compaction_drops_dead_keys() {
        let keys: Vec<Key> = (0..20).map(|i| val(i, 0)).collect();
        let node = Node::new(NodeId::new(1), BtreeId::Inodes, (Pos::MIN, Pos::MAX), keys, true, io(512));
        for i in 0..20 {
            insert(&node, val(i, 1));
        }
        let data = node.data();
        assert!(data.compactions() > 0);
        assert_eq!(data.live_keys().len(), 20);
        assert!(data.used_u64s() < 40 * 4);
    }

    #[test]
    fn fake_node_has_no_room() {
        let node = Node::fake(NodeId::new(9), BtreeId::Dirents, (Pos::MIN, Pos::MAX), io(512));
        assert!(node.is_fake());
        assert_eq!(node.capacity(), 0);
        assert_eq!(node.data().free_u64s(node.capacity()), 0);
    }
}

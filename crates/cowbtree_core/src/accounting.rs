//! Space accounting: usage counters, the replicas table, disk reservations
//! and the gc shadow copy.
//!
//! Commits change accounting under the mark lock held for reading. Every
//! data placement a commit records must already have an entry in the
//! replicas table; a commit that would add a placement gets
//! [`ReplicasMissing`] back, drops its node locks, marks the entry and
//! retries.
//!
//! While a gc pass runs, counters are rebuilt from scratch into a shadow
//! copy. Commits touching leaves the pass has already counted apply their
//! deltas to the shadow too; at the end of the pass the shadow replaces the
//! live counters.

use crate::btree::Tree;
use crate::error::{CoreError, CoreResult};
use crate::key::{Key, KeyValue};
use crate::types::{BtreeId, DeviceSet, Pos};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

/// What a replicas entry stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataType {
    /// Journal entries.
    Journal,
    /// Extent data.
    User,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Journal => f.write_str("journal"),
            Self::User => f.write_str("user"),
        }
    }
}

/// Filesystem usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Sectors of live extent data.
    pub data_sectors: u64,
    /// Live inodes.
    pub nr_inodes: u64,
    /// Sectors recorded as allocated across devices.
    pub alloc_sectors: u64,
    /// Sectors held by disk reservations.
    pub reserved: u64,
    /// Allocated sectors released by bucket invalidation.
    pub invalidated_sectors: u64,
}

/// Signed change to [`Usage`] from one update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageDelta {
    /// Change in live extent sectors.
    pub data_sectors: i64,
    /// Change in live inodes.
    pub nr_inodes: i64,
    /// Change in allocated sectors.
    pub alloc_sectors: i64,
    /// Allocated sectors invalidated.
    pub invalidated_sectors: u64,
}

impl UsageDelta {
    fn add(&mut self, other: &UsageDelta) {
        self.data_sectors += other.data_sectors;
        self.nr_inodes += other.nr_inodes;
        self.alloc_sectors += other.alloc_sectors;
        self.invalidated_sectors += other.invalidated_sectors;
    }

    /// Returns true if the delta changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Signed change to the sectors of one replicas entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicasDelta {
    /// Entry data type.
    pub data_type: DataType,
    /// Entry devices.
    pub devs: DeviceSet,
    /// Change in sectors.
    pub sectors: i64,
}

/// The accounting changes one update makes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deltas {
    /// Replicas table changes.
    pub replicas: Vec<ReplicasDelta>,
    /// Usage counter changes.
    pub usage: UsageDelta,
}

impl Deltas {
    /// Adds `sectors` to the entry for `(data_type, devs)`.
    pub fn add_replicas(&mut self, data_type: DataType, devs: DeviceSet, sectors: i64) {
        if sectors == 0 || devs.is_empty() {
            return;
        }
        match self
            .replicas
            .iter_mut()
            .find(|d| d.data_type == data_type && d.devs == devs)
        {
            Some(delta) => delta.sectors += sectors,
            None => self.replicas.push(ReplicasDelta {
                data_type,
                devs,
                sectors,
            }),
        }
    }

    /// Folds `other` into these deltas.
    pub fn merge(&mut self, other: &Deltas) {
        for d in &other.replicas {
            self.add_replicas(d.data_type, d.devs, d.sectors);
        }
        self.usage.add(&other.usage);
    }

    /// Returns true if applying the deltas changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replicas.iter().all(|d| d.sectors == 0) && self.usage.is_empty()
    }
}

/// A commit referenced replicas entries that are not in the table yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicasMissing(pub Vec<(DataType, DeviceSet)>);

/// Sectors set aside for a future write.
#[derive(Debug, Default, PartialEq, Eq)]
#[must_use = "disk reservations must be returned with Accounting::disk_reservation_put"]
pub struct DiskReservation {
    sectors: u64,
}

impl DiskReservation {
    /// Sectors still reserved.
    #[must_use]
    pub fn sectors(&self) -> u64 {
        self.sectors
    }
}

#[derive(Debug, Default, Clone)]
struct Counters {
    usage: Usage,
    replicas: BTreeMap<(DataType, DeviceSet), i64>,
}

impl Counters {
    fn apply_replicas(&mut self, deltas: &[ReplicasDelta]) {
        for d in deltas {
            let sectors = self.replicas.entry((d.data_type, d.devs)).or_insert(0);
            *sectors += d.sectors;
        }
    }

    fn apply_usage(&mut self, delta: &UsageDelta) {
        let usage = &mut self.usage;
        usage.data_sectors = usage.data_sectors.saturating_add_signed(delta.data_sectors);
        usage.nr_inodes = usage.nr_inodes.saturating_add_signed(delta.nr_inodes);
        usage.alloc_sectors = usage.alloc_sectors.saturating_add_signed(delta.alloc_sectors);
        usage.invalidated_sectors += delta.invalidated_sectors;
    }
}

#[derive(Debug)]
struct GcState {
    counters: Counters,
    pos: Option<(BtreeId, Pos)>,
}

#[derive(Debug, Default)]
struct State {
    live: Counters,
    gc: Option<GcState>,
}

/// Accounting state of a store.
pub struct Accounting {
    capacity: u64,
    mark_lock: RwLock<()>,
    gc_lock: RwLock<()>,
    state: Mutex<State>,
}

impl Accounting {
    /// Creates empty accounting for a store of `capacity_sectors`.
    #[must_use]
    pub fn new(capacity_sectors: u64) -> Self {
        Self {
            capacity: capacity_sectors,
            mark_lock: RwLock::new(()),
            gc_lock: RwLock::new(()),
            state: Mutex::new(State::default()),
        }
    }

    /// Takes the mark lock for reading; commits hold it while applying
    /// deltas.
    pub fn mark_read(&self) -> RwLockReadGuard<'_, ()> {
        self.mark_lock.read()
    }

    /// The gc lock. Structural changes hold it for reading; a gc pass holds
    /// it for writing.
    #[must_use]
    pub fn gc_lock(&self) -> &RwLock<()> {
        &self.gc_lock
    }

    /// Current usage.
    #[must_use]
    pub fn usage(&self) -> Usage {
        self.state.lock().live.usage
    }

    /// Sectors neither holding data nor reserved.
    #[must_use]
    pub fn free_sectors(&self) -> u64 {
        let usage = self.state.lock().live.usage;
        self.capacity.saturating_sub(usage.data_sectors + usage.reserved)
    }

    /// Sectors a must-not-fail insert may take: free space plus every
    /// outstanding disk reservation.
    #[must_use]
    pub fn nofail_sectors(&self) -> u64 {
        let usage = self.state.lock().live.usage;
        self.capacity.saturating_sub(usage.data_sectors)
    }

    /// Returns true if `(data_type, devs)` is in the replicas table.
    #[must_use]
    pub fn has_replicas(&self, data_type: DataType, devs: DeviceSet) -> bool {
        self.state.lock().live.replicas.contains_key(&(data_type, devs))
    }

    /// Sectors recorded for `(data_type, devs)`, if the entry exists.
    #[must_use]
    pub fn replicas_sectors(&self, data_type: DataType, devs: DeviceSet) -> Option<i64> {
        self.state.lock().live.replicas.get(&(data_type, devs)).copied()
    }

    /// Every replicas entry with its sectors.
    #[must_use]
    pub fn replicas(&self) -> Vec<(DataType, DeviceSet, i64)> {
        self.state
            .lock()
            .live
            .replicas
            .iter()
            .map(|(&(t, d), &s)| (t, d, s))
            .collect()
    }

    /// Adds `(data_type, devs)` to the replicas table.
    pub fn mark_replicas(&self, data_type: DataType, devs: DeviceSet) {
        if devs.is_empty() {
            return;
        }
        let _mark = self.mark_lock.write();
        let mut state = self.state.lock();
        if state.live.replicas.contains_key(&(data_type, devs)) {
            return;
        }
        state.live.replicas.insert((data_type, devs), 0);
        if let Some(gc) = state.gc.as_mut() {
            gc.counters.replicas.entry((data_type, devs)).or_insert(0);
        }
        debug!(%data_type, devs = devs.bits(), "replicas entry added");
    }

    /// Replaces the `data_type` entries with exactly those in `keep`.
    pub fn replicas_gc(&self, data_type: DataType, keep: impl IntoIterator<Item = DeviceSet>) {
        let keep: Vec<DeviceSet> = keep.into_iter().filter(|d| !d.is_empty()).collect();
        let _mark = self.mark_lock.write();
        let mut state = self.state.lock();
        let before = state.live.replicas.len();
        state
            .live
            .replicas
            .retain(|&(t, devs), _| t != data_type || keep.contains(&devs));
        for devs in keep {
            state.live.replicas.entry((data_type, devs)).or_insert(0);
        }
        debug!(%data_type, before, after = state.live.replicas.len(), "replicas gc");
    }

    /// Checks every entry `deltas` touches is in the table.
    ///
    /// # Errors
    ///
    /// Returns the missing entries.
    pub fn replicas_check<'a>(&self, deltas: impl IntoIterator<Item = &'a ReplicasDelta>) -> Result<(), ReplicasMissing> {
        let state = self.state.lock();
        let mut missing: Vec<(DataType, DeviceSet)> = Vec::new();
        for d in deltas {
            let entry = (d.data_type, d.devs);
            if !state.live.replicas.contains_key(&entry) && !missing.contains(&entry) {
                missing.push(entry);
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ReplicasMissing(missing))
        }
    }

    /// Applies one update's deltas, consuming added data sectors from
    /// `disk_res`. With `gc_too`, the running gc pass's shadow is updated
    /// as well.
    ///
    /// The caller holds the mark lock and has checked the replicas entries.
    pub fn apply(&self, deltas: &Deltas, disk_res: Option<&mut DiskReservation>, gc_too: bool) {
        let mut state = self.state.lock();
        state.live.apply_replicas(&deltas.replicas);
        state.live.apply_usage(&deltas.usage);

        if let Some(res) = disk_res {
            let added = deltas.usage.data_sectors.max(0) as u64;
            let taken = added.min(res.sectors);
            res.sectors -= taken;
            state.live.usage.reserved -= taken;
        }

        if gc_too {
            if let Some(gc) = state.gc.as_mut() {
                gc.counters.apply_replicas(&deltas.replicas);
                gc.counters.apply_usage(&deltas.usage);
            }
        }
    }

    /// Reserves `sectors` of free space.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSpace`] if the space is not free, unless
    /// `nofail` is set.
    pub fn disk_reservation_get(&self, sectors: u64, nofail: bool) -> CoreResult<DiskReservation> {
        let mut state = self.state.lock();
        let usage = &mut state.live.usage;
        let used = usage.data_sectors + usage.reserved;
        if used + sectors > self.capacity && !nofail {
            return Err(CoreError::NoSpace);
        }
        usage.reserved += sectors;
        Ok(DiskReservation { sectors })
    }

    /// Returns what is left of a disk reservation.
    pub fn disk_reservation_put(&self, res: &mut DiskReservation) {
        if res.sectors == 0 {
            return;
        }
        self.state.lock().live.usage.reserved -= res.sectors;
        res.sectors = 0;
    }

    /// Returns true if a gc pass is running and has already counted the
    /// leaf of `btree_id` starting at `min`.
    #[must_use]
    pub fn gc_visited(&self, btree_id: BtreeId, min: Pos) -> bool {
        match &self.state.lock().gc {
            Some(GcState { pos: Some(pos), .. }) => (btree_id, min) <= *pos,
            _ => false,
        }
    }

    /// Returns true while a gc pass runs.
    #[must_use]
    pub fn gc_running(&self) -> bool {
        self.state.lock().gc.is_some()
    }

    fn gc_start(&self) {
        let mut state = self.state.lock();
        let counters = Counters {
            usage: Usage::default(),
            replicas: state.live.replicas.keys().map(|&k| (k, 0)).collect(),
        };
        state.gc = Some(GcState { counters, pos: None });
    }

    fn gc_count_node(&self, btree_id: BtreeId, keys: &[Key], max: Pos) {
        let mut state = self.state.lock();
        let Some(gc) = state.gc.as_mut() else {
            return;
        };
        for key in keys {
            let deltas = key_deltas(btree_id, key, 1);
            gc.counters.apply_replicas(&deltas.replicas);
            gc.counters.apply_usage(&deltas.usage);
        }
        gc.pos = Some((btree_id, max));
    }

    fn gc_finish(&self) {
        let _mark = self.mark_lock.write();
        let mut state = self.state.lock();
        let Some(gc) = state.gc.take() else {
            return;
        };
        let reserved = state.live.usage.reserved;
        let invalidated = state.live.usage.invalidated_sectors;
        let mut counters = gc.counters;
        counters.usage.reserved = reserved;
        counters.usage.invalidated_sectors = invalidated;
        counters.replicas.retain(|(t, _), _| *t != DataType::Journal);
        for (&entry, &sectors) in state.live.replicas.iter().filter(|((t, _), _)| *t == DataType::Journal) {
            counters.replicas.insert(entry, sectors);
        }
        state.live = counters;
    }

    /// Recounts usage and user replicas from the contents of `trees`.
    pub fn gc_recount<'a>(&self, trees: impl IntoIterator<Item = &'a Tree>) {
        let _gc = self.gc_lock.write();
        self.gc_start();
        for tree in trees {
            if !tree.btree_id().needs_gc() {
                continue;
            }
            let mut pos = Pos::MIN;
            loop {
                let node = tree.lookup(pos);
                node.lock().lock_read();
                let (dying, keys) = {
                    let data = node.data();
                    (data.is_dying(), data.live_keys())
                };
                if dying {
                    node.lock().unlock_read();
                    continue;
                }
                self.gc_count_node(tree.btree_id(), &keys, node.max());
                node.lock().unlock_read();
                if node.max() == Pos::MAX {
                    break;
                }
                pos = node.max().successor();
            }
        }
        self.gc_finish();
        let usage = self.usage();
        info!(
            data_sectors = usage.data_sectors,
            nr_inodes = usage.nr_inodes,
            alloc_sectors = usage.alloc_sectors,
            "accounting recounted"
        );
    }
}

impl fmt::Debug for Accounting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Accounting")
            .field("capacity", &self.capacity)
            .field("usage", &state.live.usage)
            .field("replicas", &state.live.replicas.len())
            .field("gc_running", &state.gc.is_some())
            .finish()
    }
}

/// Accounting contribution of `key` living in `btree_id`, scaled by `sign`.
#[must_use]
pub fn key_deltas(btree_id: BtreeId, key: &Key, sign: i64) -> Deltas {
    let mut deltas = Deltas::default();
    if key.is_whiteout() {
        return deltas;
    }
    match btree_id {
        BtreeId::Extents => {
            deltas.usage.data_sectors = sign * key.size as i64;
            deltas.add_replicas(DataType::User, key.devs(), sign * key.size as i64);
        }
        BtreeId::Reflink => {
            deltas.add_replicas(DataType::User, key.devs(), sign * key.size as i64);
        }
        BtreeId::Inodes => deltas.usage.nr_inodes = sign,
        BtreeId::Alloc => deltas.usage.alloc_sectors = sign * alloc_value(key) as i64,
        BtreeId::Dirents | BtreeId::Xattrs => {}
    }
    deltas
}

/// Sectors recorded by an allocation key.
#[must_use]
pub fn alloc_value(key: &Key) -> u64 {
    match &key.value {
        KeyValue::Inline(bytes) if bytes.len() >= 8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            u64::from_le_bytes(raw)
        }
        _ => 0,
    }
}

/// Builds the allocation key for `dev_pos` recording `sectors`.
#[must_use]
pub fn alloc_key(dev_pos: Pos, sectors: u64) -> Key {
    Key::inline(dev_pos, sectors.to_le_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceId;

    fn devs(ids: &[u8]) -> DeviceSet {
        ids.iter().map(|&i| DeviceId::new(i)).collect()
    }

    #[test]
    fn missing_replicas_are_reported() {
        let acc = Accounting::new(1000);
        let mut deltas = Deltas::default();
        deltas.add_replicas(DataType::User, devs(&[0, 1]), 8);

        let err = acc.replicas_check(&deltas.replicas).unwrap_err();
        assert_eq!(err.0, vec![(DataType::User, devs(&[0, 1]))]);

        acc.mark_replicas(DataType::User, devs(&[0, 1]));
        assert!(acc.replicas_check(&deltas.replicas).is_ok());

        acc.apply(&deltas, None, false);
        assert_eq!(acc.replicas_sectors(DataType::User, devs(&[0, 1])), Some(8));
    }

    #[test]
    fn deltas_merge_by_entry() {
        let mut a = Deltas::default();
        a.add_replicas(DataType::User, devs(&[0]), 5);
        let mut b = Deltas::default();
        b.add_replicas(DataType::User, devs(&[0]), -5);
        b.usage.nr_inodes = 1;
        a.merge(&b);
        assert_eq!(a.replicas.len(), 1);
        assert_eq!(a.replicas[0].sectors, 0);
        assert_eq!(a.usage.nr_inodes, 1);
        assert!(!a.is_empty());
    }

    #[test]
    fn disk_reservation_limits() {
        let acc = Accounting::new(100);
        let mut res = acc.disk_reservation_get(80, false).unwrap();
        assert_eq!(acc.usage().reserved, 80);
        assert!(matches!(acc.disk_reservation_get(30, false), Err(CoreError::NoSpace)));

        let mut forced = acc.disk_reservation_get(30, true).unwrap();
        acc.disk_reservation_put(&mut forced);

        let mut deltas = Deltas::default();
        deltas.usage.data_sectors = 50;
        acc.apply(&deltas, Some(&mut res), false);
        assert_eq!(res.sectors(), 30);
        assert_eq!(acc.usage().reserved, 30);
        assert_eq!(acc.usage().data_sectors, 50);

        acc.disk_reservation_put(&mut res);
        assert_eq!(acc.usage().reserved, 0);
    }

    #[test]
    fn replicas_gc_keeps_only_named_entries() {
        let acc = Accounting::new(100);
        acc.mark_replicas(DataType::Journal, devs(&[0]));
        acc.mark_replicas(DataType::Journal, devs(&[1]));
        acc.mark_replicas(DataType::User, devs(&[1]));

        acc.replicas_gc(DataType::Journal, [devs(&[1]), devs(&[2])]);
        assert!(!acc.has_replicas(DataType::Journal, devs(&[0])));
        assert!(acc.has_replicas(DataType::Journal, devs(&[1])));
        assert!(acc.has_replicas(DataType::Journal, devs(&[2])));
        assert!(acc.has_replicas(DataType::User, devs(&[1])));
    }

    #[test]
    fn key_deltas_per_tree() {
        let extent = Key::extent(1, 0, 16, devs(&[0]));
        let d = key_deltas(BtreeId::Extents, &extent, 1);
        assert_eq!(d.usage.data_sectors, 16);
        assert_eq!(d.replicas[0].sectors, 16);

        let d = key_deltas(BtreeId::Reflink, &extent, -1);
        assert_eq!(d.usage.data_sectors, 0);
        assert_eq!(d.replicas[0].sectors, -16);

        let inode = Key::inline(Pos::new(7, 0), vec![1u8; 8]);
        assert_eq!(key_deltas(BtreeId::Inodes, &inode, 1).usage.nr_inodes, 1);

        let alloc = alloc_key(Pos::new(0, 0), 42);
        assert_eq!(alloc_value(&alloc), 42);
        assert_eq!(key_deltas(BtreeId::Alloc, &alloc, -1).usage.alloc_sectors, -42);

        assert!(key_deltas(BtreeId::Dirents, &inode, 1).is_empty());
        assert!(key_deltas(BtreeId::Extents, &Key::whiteout(Pos::new(1, 1)), 1).is_empty());
    }

    #[test]
    fn gc_visited_follows_position() {
        let acc = Accounting::new(100);
        assert!(!acc.gc_visited(BtreeId::Extents, Pos::MIN));
        acc.gc_start();
        assert!(acc.gc_running());
        assert!(!acc.gc_visited(BtreeId::Extents, Pos::MIN));
        acc.gc_count_node(BtreeId::Extents, &[], Pos::new(5, 0));
        assert!(acc.gc_visited(BtreeId::Extents, Pos::new(5, 0)));
        assert!(!acc.gc_visited(BtreeId::Extents, Pos::new(5, 1)));
        assert!(!acc.gc_visited(BtreeId::Inodes, Pos::MIN));
        acc.gc_finish();
        assert!(!acc.gc_running());
    }
}

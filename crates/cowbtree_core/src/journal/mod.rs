//! Write-ahead journal.
//!
//! The journal groups committed keys into entries identified by a
//! sequence number. One entry is open at a time; commits take a reservation
//! on it, append their keys and release it. An entry is closed when it runs
//! out of room or somebody needs it on disk, and is written once the last
//! reservation on it is released. Entries are written strictly in sequence
//! order.
//!
//! Each entry occupies one bucket on each of `metadata_replicas` devices.
//! Buckets are recycled by reclaim once the oldest sequence recorded on disk
//! has moved past them.
//!
//! The [`PinLedger`] tracks which sequences are still needed; the journal
//! holds one reference on each entry's pin list until the entry is on disk.

mod pin;
mod reclaim;
mod record;

pub use pin::{FlushFn, FlushStep, JournalPin, PinFlush, PinId, PinLedger};
pub use reclaim::ReclaimScheduler;
pub use record::{scan_log, JournalEntry, JournalKey, LogScan, ENTRY_MAGIC, ENTRY_VERSION};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::key::Key;
use crate::types::{BtreeId, DeviceId, DeviceSet};
use cowbtree_storage::StorageBackend;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a blocked journal caller sleeps before re-checking.
pub(crate) const WAIT_SLICE: Duration = Duration::from_millis(5);

/// Journal u64s taken by one logged key: the key plus a per-key header.
#[must_use]
pub fn jset_u64s(key_u64s: u64) -> u64 {
    key_u64s + 1
}

/// Flags for [`Journal::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResFlags(u8);

impl ResFlags {
    /// Block until space is available.
    pub const NONE: ResFlags = ResFlags(0);
    /// Fail instead of blocking.
    pub const NONBLOCK: ResFlags = ResFlags(1 << 0);
    /// Wait until a reservation would succeed, but do not take it.
    pub const CHECK: ResFlags = ResFlags(1 << 1);
    /// May use the bucket held back for metadata writes.
    pub const RESERVED: ResFlags = ResFlags(1 << 2);

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: ResFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ResFlags {
    type Output = ResFlags;

    fn bitor(self, rhs: Self) -> Self {
        ResFlags(self.0 | rhs.0)
    }
}

/// A claim on space in an open journal entry.
#[derive(Debug, Default)]
pub struct JournalRes {
    seq: u64,
    u64s: u64,
    held: bool,
}

impl JournalRes {
    /// Sequence number of the entry the reservation is in; 0 if not held.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns true if the reservation holds a reference on an entry.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Space left in the reservation, in u64s.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.u64s
    }
}

/// A pre-reservation against the journal's space budget.
#[derive(Debug, Default)]
pub struct JournalPreres {
    u64s: u64,
}

impl JournalPreres {
    /// Pre-reserved u64s.
    #[must_use]
    pub fn u64s(&self) -> u64 {
        self.u64s
    }
}

#[derive(Debug)]
struct OpenEntry {
    entry: JournalEntry,
    u64s_used: u64,
    refs: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct JournalDevice {
    pub(crate) bucket_seq: Vec<u64>,
    pub(crate) cur_idx: usize,
    pub(crate) last_idx: usize,
    pub(crate) discards: u64,
}

impl JournalDevice {
    fn new(nr: usize) -> Self {
        Self {
            bucket_seq: vec![0; nr],
            cur_idx: 0,
            last_idx: 0,
            discards: 0,
        }
    }

    pub(crate) fn nr(&self) -> usize {
        self.bucket_seq.len()
    }

    fn free_buckets(&self) -> usize {
        let nr = self.nr();
        (self.last_idx + nr - self.cur_idx - 1) % nr
    }

    fn take_bucket(&mut self, seq: u64) {
        self.cur_idx = (self.cur_idx + 1) % self.nr();
        self.bucket_seq[self.cur_idx] = seq;
    }
}

#[derive(Debug)]
struct JournalState {
    cur: Option<OpenEntry>,
    closed: VecDeque<OpenEntry>,
    seq: u64,
    seq_ondisk: u64,
    last_seq_ondisk: u64,
    prereserved: u64,
    devices: Vec<JournalDevice>,
    next_dev: usize,
    replay_seq: u64,
    entries_written: u64,
    writing: bool,
}

type StateGuard<'a> = MutexGuard<'a, JournalState>;

/// The journal.
pub struct Journal {
    entry_u64s: u64,
    metadata_replicas: usize,
    preres_budget: u64,
    discard: bool,
    pub(crate) reclaim_delay: Duration,
    pins: Arc<PinLedger>,
    state: Mutex<JournalState>,
    wait: Condvar,
    log: Mutex<Box<dyn StorageBackend>>,
    reclaim_lock: Mutex<()>,
    last_flushed: Mutex<Instant>,
    started: AtomicBool,
    replay_done: AtomicBool,
    read_only: AtomicBool,
    roots_dirty: AtomicBool,
    failed: AtomicBool,
    reservations: AtomicU64,
}

impl Journal {
    /// Opens the journal on `log`, returning the entries that must be
    /// replayed.
    ///
    /// A torn final write is cut off the log. Entries from the newest
    /// entry's `last_seq` onwards are returned; each holds a reference on
    /// its pin list until [`Journal::replayed`] is called for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or is corrupt before its
    /// final record.
    pub fn open(config: &Config, mut log: Box<dyn StorageBackend>) -> CoreResult<(Self, Vec<JournalEntry>)> {
        assert!(config.journal_devices > 0 && config.journal_devices <= 64);
        assert!(config.metadata_replicas > 0 && config.metadata_replicas <= config.journal_devices);
        assert!(config.journal_buckets >= 3, "journal needs at least three buckets per device");

        let bytes = log.read_from(0)?;
        let scan = scan_log(&bytes)?;
        if scan.torn_tail {
            warn!(
                valid = scan.valid_len,
                size = bytes.len(),
                "truncating torn journal tail"
            );
            log.truncate(scan.valid_len)?;
        }

        let pins = Arc::new(PinLedger::new(config.pin_window));
        let mut devices: Vec<JournalDevice> = (0..config.journal_devices)
            .map(|_| JournalDevice::new(config.journal_buckets))
            .collect();

        let (seq, last_seq) = scan
            .entries
            .last()
            .map_or((0, 1), |(_, e)| (e.seq, e.last_seq));

        let replay: Vec<JournalEntry> = scan
            .entries
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| e.seq >= last_seq)
            .collect();

        if seq + 1 - last_seq > config.pin_window as u64 {
            return Err(CoreError::journal_corruption(format!(
                "journal window {last_seq}..={seq} exceeds pin window {}",
                config.pin_window
            )));
        }

        pins.reset(last_seq);
        let mut replay_iter = replay.iter().peekable();
        for s in last_seq..=seq {
            let devs = match replay_iter.peek() {
                Some(e) if e.seq == s => replay_iter.next().map_or(DeviceSet::EMPTY, |e| e.devs),
                _ => DeviceSet::EMPTY,
            };
            for dev in devs.iter() {
                if let Some(d) = devices.get_mut(dev.as_usize()) {
                    if d.free_buckets() > 0 {
                        d.take_bucket(s);
                    }
                }
            }
            pins.open_seq(s, devs);
        }

        debug!(seq, last_seq, replay = replay.len(), "journal opened");

        let journal = Self {
            entry_u64s: config.journal_entry_u64s,
            metadata_replicas: config.metadata_replicas,
            preres_budget: config.journal_preres_budget,
            discard: config.discard,
            reclaim_delay: config.reclaim_delay,
            pins,
            state: Mutex::new(JournalState {
                cur: None,
                closed: VecDeque::new(),
                seq,
                seq_ondisk: seq,
                last_seq_ondisk: if seq == 0 { 0 } else { last_seq },
                prereserved: 0,
                devices,
                next_dev: 0,
                replay_seq: 0,
                entries_written: 0,
                writing: false,
            }),
            wait: Condvar::new(),
            log: Mutex::new(log),
            reclaim_lock: Mutex::new(()),
            last_flushed: Mutex::new(Instant::now()),
            started: AtomicBool::new(true),
            replay_done: AtomicBool::new(replay.is_empty()),
            read_only: AtomicBool::new(config.read_only),
            roots_dirty: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            reservations: AtomicU64::new(0),
        };
        Ok((journal, replay))
    }

    /// The pin ledger.
    #[must_use]
    pub fn pins(&self) -> &Arc<PinLedger> {
        &self.pins
    }

    fn check_error(&self) -> CoreResult<()> {
        if self.failed.load(Ordering::Acquire) {
            Err(CoreError::journal("journal stopped after a write error"))
        } else {
            Ok(())
        }
    }

    // Opens the next entry if the pin window and enough devices have room.
    fn open_entry_locked(&self, state: &mut JournalState, reserved: bool) -> bool {
        if !self.pins.has_room() {
            return false;
        }

        let need = if reserved { 1 } else { 2 };
        let nr = state.devices.len();
        let mut chosen = Vec::with_capacity(self.metadata_replicas);
        for i in 0..nr {
            let idx = (state.next_dev + i) % nr;
            if state.devices[idx].free_buckets() >= need {
                chosen.push(idx);
                if chosen.len() == self.metadata_replicas {
                    break;
                }
            }
        }
        if chosen.len() < self.metadata_replicas {
            return false;
        }

        let seq = state.seq + 1;
        let mut devs = DeviceSet::EMPTY;
        for idx in &chosen {
            state.devices[*idx].take_bucket(seq);
            devs.insert(DeviceId::new(*idx as u8));
        }
        state.next_dev = (chosen[chosen.len() - 1] + 1) % nr;
        state.seq = seq;
        self.pins.open_seq(seq, devs);
        state.cur = Some(OpenEntry {
            entry: JournalEntry {
                seq,
                devs,
                ..JournalEntry::default()
            },
            u64s_used: 0,
            refs: 0,
        });
        true
    }

    fn close_entry_locked(&self, state: &mut StateGuard<'_>) -> CoreResult<()> {
        if let Some(cur) = state.cur.take() {
            state.closed.push_back(cur);
        }
        self.write_ready_locked(state)
    }

    // Writes closed entries from the front while they have no reservations.
    // The state lock is dropped around each device write; while one caller
    // writes, others leave newly ready entries to it.
    fn write_ready_locked(&self, state: &mut StateGuard<'_>) -> CoreResult<()> {
        if state.writing {
            return Ok(());
        }
        state.writing = true;

        let mut wrote = false;
        let ret = loop {
            if !state.closed.front().is_some_and(|e| e.refs == 0) {
                break Ok(());
            }
            let Some(mut open) = state.closed.pop_front() else {
                break Ok(());
            };
            open.entry.last_seq = self.pins.last_seq().min(open.entry.seq);
            let bytes = open.entry.encode();

            let res = MutexGuard::unlocked(state, || {
                let mut log = self.log.lock();
                log.append(&bytes).and_then(|_| log.sync())
            });
            if let Err(err) = res {
                self.failed.store(true, Ordering::Release);
                break Err(err.into());
            }

            state.seq_ondisk = open.entry.seq;
            state.last_seq_ondisk = open.entry.last_seq;
            state.entries_written += 1;
            self.pins.put(open.entry.seq);
            wrote = true;
        };
        state.writing = false;

        if wrote || ret.is_err() {
            self.wait.notify_all();
        }
        ret
    }

    fn try_reserve_locked(
        &self,
        state: &mut StateGuard<'_>,
        u64s: u64,
        reserved: bool,
    ) -> CoreResult<Option<JournalRes>> {
        self.check_error()?;
        if u64s > self.entry_u64s {
            return Err(CoreError::invalid_operation(format!(
                "reservation of {u64s} u64s exceeds journal entry size {}",
                self.entry_u64s
            )));
        }

        loop {
            if let Some(cur) = state.cur.as_mut() {
                if cur.u64s_used + u64s <= self.entry_u64s {
                    cur.u64s_used += u64s;
                    cur.refs += 1;
                    self.reservations.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(JournalRes {
                        seq: cur.entry.seq,
                        u64s,
                        held: true,
                    }));
                }
                self.close_entry_locked(state)?;
            }
            if !self.open_entry_locked(state, reserved) {
                return Ok(None);
            }
        }
    }

    /// Takes a reservation of `u64s` without blocking.
    ///
    /// Returns `None` if the open entry is full and no new entry can be
    /// opened.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal has failed or `u64s` can never fit.
    pub fn try_reserve(&self, u64s: u64, flags: ResFlags) -> CoreResult<Option<JournalRes>> {
        let mut state = self.state.lock();
        self.try_reserve_locked(&mut state, u64s, flags.contains(ResFlags::RESERVED))
    }

    /// Takes a reservation of `u64s`, blocking for space unless
    /// [`ResFlags::NONBLOCK`] is set.
    ///
    /// While blocked the caller runs reclaim itself, so it must not hold any
    /// node locks. With [`ResFlags::CHECK`] the call returns an unheld
    /// reservation once space is available.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Interrupted`] if `NONBLOCK` is set and no space
    /// is available, or an error if the journal failed.
    pub fn reserve(&self, u64s: u64, flags: ResFlags) -> CoreResult<JournalRes> {
        let reserved = flags.contains(ResFlags::RESERVED);
        loop {
            if let Some(res) = self.try_reserve(u64s, flags)? {
                if flags.contains(ResFlags::CHECK) {
                    self.release(res)?;
                    return Ok(JournalRes::default());
                }
                return Ok(res);
            }
            if flags.contains(ResFlags::NONBLOCK) {
                return Err(CoreError::Interrupted);
            }

            self.reclaim_work();
            if !reserved && self.pins.last_seq() != self.last_seq_ondisk() {
                self.meta()?;
            }
            let mut state = self.state.lock();
            if state.cur.is_none() {
                let _ = self.wait.wait_for(&mut state, WAIT_SLICE);
            }
        }
    }

    /// Releases a reservation; the entry is written if it was closed and
    /// this was its last reservation.
    ///
    /// # Errors
    ///
    /// Returns an error if writing the entry failed.
    pub fn release(&self, res: JournalRes) -> CoreResult<()> {
        if !res.held {
            return Ok(());
        }
        let mut state = self.state.lock();
        let entry = Self::entry_mut(&mut state, res.seq);
        assert!(entry.refs > 0, "journal entry {} refcount underflow", res.seq);
        entry.refs -= 1;
        self.write_ready_locked(&mut state)
    }

    /// Logs `key` into the entry `res` was taken from.
    ///
    /// # Panics
    ///
    /// Panics if the reservation is not held or is too small for the key.
    pub fn append(&self, res: &mut JournalRes, btree_id: BtreeId, key: &Key) {
        assert!(res.held, "appending through an unheld journal reservation");
        let u64s = jset_u64s(key.u64s());
        assert!(u64s <= res.u64s, "journal reservation overflow");
        res.u64s -= u64s;

        let mut logged = key.clone();
        logged.needs_whiteout = false;

        let mut state = self.state.lock();
        let entry = Self::entry_mut(&mut state, res.seq);
        entry.entry.keys.push(JournalKey {
            btree_id,
            key: logged,
        });
    }

    /// Records that the entry `res` was taken from touches `inode`.
    pub fn set_has_inode(&self, res: &JournalRes, inode: u64) {
        if !res.held {
            return;
        }
        let mut state = self.state.lock();
        let inodes = &mut Self::entry_mut(&mut state, res.seq).entry.inodes;
        if !inodes.contains(&inode) {
            inodes.push(inode);
        }
    }

    fn entry_mut(state: &mut JournalState, seq: u64) -> &mut OpenEntry {
        let in_cur = state.cur.as_ref().is_some_and(|c| c.entry.seq == seq);
        let entry = if in_cur {
            state.cur.as_mut()
        } else {
            state.closed.iter_mut().find(|e| e.entry.seq == seq)
        };
        entry.unwrap_or_else(|| panic!("no open journal entry for seq {seq}"))
    }

    /// Pre-reserves `u64s` against the journal budget.
    ///
    /// Returns false instead of blocking when `nonblock` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if `u64s` exceeds the whole budget or the journal
    /// failed.
    pub fn preres_get(&self, preres: &mut JournalPreres, u64s: u64, nonblock: bool) -> CoreResult<bool> {
        if u64s > self.preres_budget {
            return Err(CoreError::invalid_operation(format!(
                "pre-reservation of {u64s} u64s exceeds budget {}",
                self.preres_budget
            )));
        }
        let mut state = self.state.lock();
        loop {
            self.check_error()?;
            if state.prereserved + u64s <= self.preres_budget {
                state.prereserved += u64s;
                preres.u64s += u64s;
                return Ok(true);
            }
            if nonblock {
                return Ok(false);
            }
            let _ = self.wait.wait_for(&mut state, WAIT_SLICE);
        }
    }

    /// Returns a pre-reservation to the budget.
    pub fn preres_put(&self, preres: &mut JournalPreres) {
        if preres.u64s == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.prereserved -= preres.u64s;
        preres.u64s = 0;
        drop(state);
        self.wait.notify_all();
    }

    /// Closes the open entry so it is written once its reservations drain.
    ///
    /// # Errors
    ///
    /// Returns an error if a write failed.
    pub fn close_entry(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        self.close_entry_locked(&mut state)
    }

    /// Blocks until entry `seq` is on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal failed.
    pub fn flush_seq(&self, seq: u64) -> CoreResult<()> {
        let mut state = self.state.lock();
        loop {
            self.check_error()?;
            let target = seq.min(state.seq);
            if state.seq_ondisk >= target {
                return Ok(());
            }
            if state.cur.as_ref().is_some_and(|c| c.entry.seq <= target) {
                self.close_entry_locked(&mut state)?;
                continue;
            }
            let _ = self.wait.wait_for(&mut state, WAIT_SLICE);
        }
    }

    /// Writes an entry with no keys, publishing the current `last_seq`.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal failed.
    pub fn meta(&self) -> CoreResult<()> {
        self.roots_dirty.store(false, Ordering::Release);
        let res = self.reserve(0, ResFlags::RESERVED)?;
        let seq = res.seq();
        self.release(res)?;
        self.flush_seq(seq)
    }

    /// Newest sequence number handed out.
    #[must_use]
    pub fn current_seq(&self) -> u64 {
        self.state.lock().seq
    }

    /// Newest sequence number on disk.
    #[must_use]
    pub fn last_durable_seq(&self) -> u64 {
        self.state.lock().seq_ondisk
    }

    /// The `last_seq` recorded by the newest entry on disk.
    #[must_use]
    pub fn last_seq_ondisk(&self) -> u64 {
        self.state.lock().last_seq_ondisk
    }

    /// Number of entries written since open.
    #[must_use]
    pub fn entries_written(&self) -> u64 {
        self.state.lock().entries_written
    }

    /// Number of reservations taken since open.
    #[must_use]
    pub fn reservations_taken(&self) -> u64 {
        self.reservations.load(Ordering::Relaxed)
    }

    /// Discards issued on `dev` since open.
    #[must_use]
    pub fn discards(&self, dev: DeviceId) -> u64 {
        self.state
            .lock()
            .devices
            .get(dev.as_usize())
            .map_or(0, |d| d.discards)
    }

    /// Returns true once the journal has been opened.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Returns true once every recovered entry has been replayed.
    #[must_use]
    pub fn replay_done(&self) -> bool {
        self.replay_done.load(Ordering::Acquire)
    }

    /// Sets the sequence replay pins are taken at.
    pub fn set_replay_seq(&self, seq: u64) {
        self.state.lock().replay_seq = seq;
    }

    /// Sequence of the entry being replayed.
    #[must_use]
    pub fn replay_seq(&self) -> u64 {
        self.state.lock().replay_seq
    }

    /// Drops the replay reference on `seq`.
    pub fn replayed(&self, seq: u64) {
        self.pins.put(seq);
    }

    /// Marks replay complete.
    pub fn finish_replay(&self) {
        self.replay_done.store(true, Ordering::Release);
        self.pins.wake();
    }

    /// Returns true if the owning store is read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Sets the read-only flag.
    pub fn set_read_only(&self, value: bool) {
        self.read_only.store(value, Ordering::Release);
    }

    /// Records that the set of tree roots changed since the last entry.
    pub fn mark_roots_dirty(&self) {
        self.roots_dirty.store(true, Ordering::Release);
    }

    /// Returns true if the tree roots changed since the last entry.
    #[must_use]
    pub fn roots_dirty(&self) -> bool {
        self.roots_dirty.load(Ordering::Acquire)
    }

    /// Returns true if a write failed.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Journal")
            .field("seq", &state.seq)
            .field("seq_ondisk", &state.seq_ondisk)
            .field("last_seq_ondisk", &state.last_seq_ondisk)
            .field("pins", &self.pins)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pos;
    use cowbtree_storage::{InMemoryBackend, StorageResult};
    use std::sync::{mpsc, Barrier};
    use std::thread;

    fn create_journal(config: &Config) -> (Journal, InMemoryBackend) {
        let device = InMemoryBackend::new();
        let (journal, replay) = Journal::open(config, Box::new(device.clone())).unwrap();
        assert!(replay.is_empty());
        (journal, device)
    }

    fn small_config() -> Config {
        Config::new()
            .journal_entry_u64s(64)
            .journal_buckets(8)
            .journal_devices(2)
            .pin_window(16)
    }

    #[test]
    fn reserve_append_release_writes_on_flush() {
        let (journal, device) = create_journal(&small_config());
        let key = Key::inline(Pos::new(1, 1), &b"v"[..]);

        let mut res = journal.reserve(jset_u64s(key.u64s()), ResFlags::NONE).unwrap();
        assert_eq!(res.seq(), 1);
        journal.append(&mut res, BtreeId::Inodes, &key);
        journal.set_has_inode(&res, 1);
        journal.release(res).unwrap();
        assert_eq!(journal.last_durable_seq(), 0);

        journal.flush_seq(1).unwrap();
        assert_eq!(journal.last_durable_seq(), 1);

        let scan = scan_log(&device.data()).unwrap();
        assert_eq!(scan.entries.len(), 1);
        let entry = &scan.entries[0].1;
        assert_eq!(entry.inodes, vec![1]);
        assert_eq!(entry.keys[0].key, key);
        assert_eq!(entry.last_seq, 1);
    }

    #[test]
    fn closed_entry_waits_for_reservations() {
        let (journal, _device) = create_journal(&small_config());
        let res = journal.reserve(4, ResFlags::NONE).unwrap();

        journal.close_entry().unwrap();
        assert_eq!(journal.last_durable_seq(), 0);

        journal.release(res).unwrap();
        assert_eq!(journal.last_durable_seq(), 1);
        assert_eq!(journal.pins().count(1), None, "written entry with no pins is reclaimed");
    }

    #[test]
    fn full_entry_rolls_to_next_seq() {
        let (journal, _device) = create_journal(&small_config());
        let a = journal.reserve(40, ResFlags::NONE).unwrap();
        let b = journal.reserve(40, ResFlags::NONE).unwrap();
        assert_eq!((a.seq(), b.seq()), (1, 2));

        journal.release(b).unwrap();
        assert_eq!(journal.last_durable_seq(), 0, "seq 1 still has a reservation");
        journal.release(a).unwrap();
        assert_eq!(journal.last_durable_seq(), 1);
    }

    #[test]
    fn entries_are_spread_across_devices() {
        let (journal, device) = create_journal(&small_config());
        for _ in 0..4 {
            journal.meta().unwrap();
        }
        let scan = scan_log(&device.data()).unwrap();
        let devs: Vec<u64> = scan.entries.iter().map(|(_, e)| e.devs.bits()).collect();
        assert_eq!(devs, vec![0b01, 0b10, 0b01, 0b10]);
    }

    #[test]
    fn oversized_reservation_is_rejected() {
        let (journal, _device) = create_journal(&small_config());
        assert!(matches!(
            journal.reserve(65, ResFlags::NONE),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn nonblocking_reserve_fails_when_window_is_full() {
        let config = small_config().pin_window(2);
        let (journal, _device) = create_journal(&config);
        let pin = JournalPin::new();

        let res = journal.reserve(60, ResFlags::NONE).unwrap();
        journal.pins().add(res.seq(), &pin, None);
        journal.release(res).unwrap();
        let res = journal.reserve(60, ResFlags::NONE).unwrap();
        journal.release(res).unwrap();

        assert!(journal.try_reserve(60, ResFlags::NONE).unwrap().is_none());
        assert!(matches!(
            journal.reserve(60, ResFlags::NONBLOCK),
            Err(CoreError::Interrupted)
        ));

        journal.pins().drop_pin(&pin);
        journal.close_entry().unwrap();
        assert!(journal.try_reserve(60, ResFlags::NONE).unwrap().is_some());
    }

    #[test]
    fn preres_budget_is_enforced() {
        let config = small_config().journal_preres_budget(10);
        let (journal, _device) = create_journal(&config);
        let mut a = JournalPreres::default();
        let mut b = JournalPreres::default();

        assert!(journal.preres_get(&mut a, 8, true).unwrap());
        assert!(!journal.preres_get(&mut b, 8, true).unwrap());
        journal.preres_put(&mut a);
        assert!(journal.preres_get(&mut b, 8, true).unwrap());
        assert!(journal.preres_get(&mut a, 11, true).is_err());
    }

    #[test]
    fn reopen_returns_entries_to_replay() {
        let config = small_config();
        let (journal, device) = create_journal(&config);
        let pin = JournalPin::new();
        let key = Key::inline(Pos::new(2, 2), &b"x"[..]);

        let mut res = journal.reserve(jset_u64s(key.u64s()), ResFlags::NONE).unwrap();
        journal.append(&mut res, BtreeId::Dirents, &key);
        journal.pins().add(res.seq(), &pin, None);
        journal.release(res).unwrap();
        journal.flush_seq(1).unwrap();
        journal.meta().unwrap();
        drop(journal);

        let (reopened, replay) = Journal::open(&config, Box::new(device.snapshot())).unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].keys[0].key, key);
        assert!(!reopened.replay_done());
        assert_eq!(reopened.pins().last_seq(), 1);
        assert_eq!(reopened.current_seq(), 2);

        reopened.replayed(1);
        reopened.replayed(2);
        reopened.finish_replay();
        assert_eq!(reopened.pins().used(), 0);
        assert_eq!(reopened.reserve(4, ResFlags::NONE).unwrap().seq(), 3);
    }

    // Parks every sync until the test lets it through.
    struct GatedBackend {
        inner: InMemoryBackend,
        entered: Arc<Barrier>,
        resume: Arc<Barrier>,
    }

    impl StorageBackend for GatedBackend {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.inner.read_at(offset, len)
        }

        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            self.inner.append(data)
        }

        fn flush(&mut self) -> StorageResult<()> {
            self.inner.flush()
        }

        fn size(&self) -> StorageResult<u64> {
            self.inner.size()
        }

        fn sync(&mut self) -> StorageResult<()> {
            self.entered.wait();
            self.resume.wait();
            self.inner.sync()
        }

        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            self.inner.truncate(new_size)
        }
    }

    #[test]
    fn log_write_runs_without_the_state_lock() {
        let entered = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));
        let device = InMemoryBackend::new();
        let gated = GatedBackend {
            inner: device.clone(),
            entered: Arc::clone(&entered),
            resume: Arc::clone(&resume),
        };
        let (journal, _) = Journal::open(&small_config(), Box::new(gated)).unwrap();
        let journal = Arc::new(journal);

        let res = journal.reserve(4, ResFlags::NONE).unwrap();
        let seq = res.seq();
        journal.release(res).unwrap();

        let writer = {
            let journal = Arc::clone(&journal);
            thread::spawn(move || journal.flush_seq(seq))
        };
        entered.wait();

        let (tx, rx) = mpsc::channel();
        {
            let journal = Arc::clone(&journal);
            thread::spawn(move || {
                let next = journal.try_reserve(4, ResFlags::NONE).unwrap().unwrap();
                let next_seq = next.seq();
                journal.release(next).unwrap();
                let _ = tx.send((journal.last_durable_seq(), next_seq));
            });
        }
        let (durable, next_seq) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("journal state was locked during the write");
        assert_eq!(durable, 0);
        assert_eq!(next_seq, seq + 1);

        resume.wait();
        writer.join().unwrap().unwrap();
        assert_eq!(journal.last_durable_seq(), seq);
        assert_eq!(scan_log(&device.data()).unwrap().entries.len(), 1);
    }
}

//! The journal pin ledger.
//!
//! Every open or unreclaimed journal sequence number has a [`PinList`] in a
//! bounded window. A list's `count` holds one reference for the journal
//! itself (dropped once the entry is on disk, or once it has been replayed)
//! plus one per [`JournalPin`] attached to it. Dirty objects own their pins;
//! the ledger only records which list each active pin belongs to, keyed by
//! [`PinId`], so a recycled list can never be reached through a stale pin.
//!
//! The front of the window is the oldest sequence still needed on recovery.
//! It advances only through [`PinLedger::reclaim_fast`], which pops lists
//! whose count reached zero.

use crate::types::DeviceSet;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_PIN_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`JournalPin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinId(u64);

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pin:{}", self.0)
    }
}

/// A reference held by a dirty object against a journal sequence number.
///
/// The pin itself is just an identity; whether it is active and where it is
/// attached lives in the [`PinLedger`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct JournalPin {
    id: PinId,
}

impl JournalPin {
    /// Creates a new, inactive pin.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: PinId(NEXT_PIN_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Returns the pin's identity.
    #[must_use]
    pub fn id(&self) -> PinId {
        self.id
    }
}

impl Default for JournalPin {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes back the object behind a pin.
///
/// Reclaim calls `flush` outside the ledger lock with the sequence number
/// the pin was found at. A flush that writes the object drops its pin.
pub trait PinFlush: Send + Sync {
    /// Flushes the object so that `seq` no longer needs to be retained.
    fn flush(&self, seq: u64);
}

/// Shared handle to a flush callback.
pub type FlushFn = Arc<dyn PinFlush>;

/// Per-sequence record in the pin window.
#[derive(Default)]
struct PinList {
    count: u64,
    active: Vec<PinId>,
    flushed: Vec<PinId>,
    devs: DeviceSet,
}

struct ActivePin {
    seq: u64,
    flush: Option<FlushFn>,
}

struct LedgerState {
    front: u64,
    lists: VecDeque<PinList>,
    pins: HashMap<PinId, ActivePin>,
}

impl LedgerState {
    fn back(&self) -> u64 {
        self.front + self.lists.len() as u64
    }

    fn list_mut(&mut self, seq: u64) -> Option<&mut PinList> {
        let idx = seq.checked_sub(self.front)?;
        self.lists.get_mut(idx as usize)
    }

    fn reclaim_fast(&mut self) -> bool {
        let mut popped = false;
        while let Some(front) = self.lists.front() {
            if front.count != 0 {
                break;
            }
            assert!(
                front.active.is_empty() && front.flushed.is_empty(),
                "reclaiming seq {} with pins still attached",
                self.front
            );
            self.lists.pop_front();
            self.front += 1;
            popped = true;
        }
        popped
    }

    fn drop_pin(&mut self, id: PinId) -> bool {
        let Some(pin) = self.pins.remove(&id) else {
            return false;
        };
        let front = self.front;
        let list = self
            .list_mut(pin.seq)
            .unwrap_or_else(|| panic!("active {id} points at reclaimed seq {}", pin.seq));
        list.active.retain(|p| *p != id);
        list.flushed.retain(|p| *p != id);
        assert!(list.count > 0, "pin list refcount underflow at seq {}", pin.seq);
        list.count -= 1;

        if list.count == 0 && pin.seq == front {
            self.reclaim_fast();
        }
        true
    }

    fn add_pin(&mut self, seq: u64, id: PinId, flush: Option<FlushFn>) {
        assert!(!self.pins.contains_key(&id), "{id} is already active");
        let list = self
            .list_mut(seq)
            .unwrap_or_else(|| panic!("no pin list for seq {seq}"));
        assert!(list.count > 0, "adding {id} to reclaimed seq {seq}");

        list.count += 1;
        if flush.is_some() {
            list.active.push(id);
        }
        self.pins.insert(id, ActivePin { seq, flush });
    }
}

/// Outcome of one [`PinLedger::flush_step`].
pub enum FlushStep {
    /// Flush this pin, found at `seq`, then ask again.
    Flush {
        /// Sequence the pin was attached to.
        seq: u64,
        /// Callback that writes the pinned object back.
        flush: FlushFn,
    },
    /// Nothing left to flush up to the target.
    Done,
    /// Pins are still attached but none can be flushed right now.
    Wait,
}

/// The bounded window of pin lists.
///
/// Every operation runs under one mutex that is never held across I/O or a
/// flush callback.
pub struct PinLedger {
    capacity: usize,
    state: Mutex<LedgerState>,
    changed: Condvar,
}

impl PinLedger {
    /// Creates a ledger whose front starts at sequence 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "pin window must not be empty");
        Self {
            capacity,
            state: Mutex::new(LedgerState {
                front: 1,
                lists: VecDeque::with_capacity(capacity),
                pins: HashMap::new(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Window capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Restarts an empty window at `front`. Used before replay.
    ///
    /// # Panics
    ///
    /// Panics if any pin list is still held.
    pub fn reset(&self, front: u64) {
        let mut state = self.state.lock();
        assert!(state.pins.is_empty(), "resetting a ledger with active pins");
        state.lists.clear();
        state.front = front;
    }

    /// Appends the list for `seq`, holding the journal's reference on it.
    ///
    /// # Panics
    ///
    /// Panics if `seq` is not the next sequence or the window is full.
    pub fn open_seq(&self, seq: u64, devs: DeviceSet) {
        let mut state = self.state.lock();
        assert_eq!(seq, state.back(), "pin lists must open in sequence order");
        assert!(state.lists.len() < self.capacity, "pin window overflow");
        state.lists.push_back(PinList {
            count: 1,
            devs,
            ..PinList::default()
        });
    }

    /// Returns true if another sequence number fits in the window.
    #[must_use]
    pub fn has_room(&self) -> bool {
        self.state.lock().lists.len() < self.capacity
    }

    /// Drops the journal's own reference on `seq`.
    ///
    /// # Panics
    ///
    /// Panics if `seq` is outside the window or its count is already zero.
    pub fn put(&self, seq: u64) {
        let mut state = self.state.lock();
        let front = state.front;
        let list = state
            .list_mut(seq)
            .unwrap_or_else(|| panic!("no pin list for seq {seq}"));
        assert!(list.count > 0, "pin list refcount underflow at seq {seq}");
        list.count -= 1;
        if list.count == 0 && seq == front {
            state.reclaim_fast();
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Attaches `pin` to `seq`.
    ///
    /// Pins without a flush callback hold a reference but are never picked
    /// by reclaim.
    ///
    /// # Panics
    ///
    /// Panics if `pin` is already active or `seq` has no live list.
    pub fn add(&self, seq: u64, pin: &JournalPin, flush: Option<FlushFn>) {
        self.state.lock().add_pin(seq, pin.id, flush);
        self.changed.notify_all();
    }

    /// Detaches `pin`. Dropping an inactive pin does nothing.
    pub fn drop_pin(&self, pin: &JournalPin) {
        let dropped = self.state.lock().drop_pin(pin.id);
        if dropped {
            self.changed.notify_all();
        }
    }

    /// Moves `pin` onto `src`'s sequence number if that is older than where
    /// `pin` is now, or if `pin` is inactive.
    pub fn add_if_older(&self, src: &JournalPin, pin: &JournalPin, flush: Option<FlushFn>) {
        let mut state = self.state.lock();
        let Some(src_seq) = state.pins.get(&src.id).map(|p| p.seq) else {
            return;
        };
        let older = match state.pins.get(&pin.id) {
            None => true,
            Some(current) => src_seq < current.seq,
        };
        if older {
            state.drop_pin(pin.id);
            state.add_pin(src_seq, pin.id, flush);
            drop(state);
            self.changed.notify_all();
        }
    }

    /// Sequence `pin` is attached to, or 0 if inactive.
    #[must_use]
    pub fn seq_of(&self, pin: &JournalPin) -> u64 {
        self.state.lock().pins.get(&pin.id).map_or(0, |p| p.seq)
    }

    /// Returns true if `pin` is attached.
    #[must_use]
    pub fn is_active(&self, pin: &JournalPin) -> bool {
        self.state.lock().pins.contains_key(&pin.id)
    }

    /// Pops every fully released list from the front of the window.
    pub fn reclaim_fast(&self) {
        let popped = self.state.lock().reclaim_fast();
        if popped {
            self.changed.notify_all();
        }
    }

    /// Finds the oldest flushable pin at or below `seq_to_flush`, moves it
    /// to its list's flushed set and returns it with its sequence.
    #[must_use]
    pub fn get_next_pin(&self, seq_to_flush: u64) -> Option<(u64, FlushFn)> {
        let mut state = self.state.lock();
        Self::next_pin_locked(&mut state, seq_to_flush)
    }

    fn next_pin_locked(state: &mut LedgerState, seq_to_flush: u64) -> Option<(u64, FlushFn)> {
        state.reclaim_fast();

        let front = state.front;
        let mut found = None;
        for (idx, list) in state.lists.iter_mut().enumerate() {
            let seq = front + idx as u64;
            if seq > seq_to_flush {
                break;
            }
            if !list.active.is_empty() {
                let id = list.active.remove(0);
                list.flushed.push(id);
                found = Some((seq, id));
                break;
            }
        }

        let (seq, id) = found?;
        let flush = state
            .pins
            .get(&id)
            .and_then(|p| p.flush.clone())
            .unwrap_or_else(|| panic!("{id} on an active list without a flush callback"));
        Some((seq, flush))
    }

    /// One round of a flush-until-`seq_to_flush` loop, checked atomically.
    ///
    /// Finishes when no flushable pin remains at or below the target and
    /// either the window has moved past it, only the newest entry's own
    /// reference is left, or the window is empty. Before replay completes the
    /// unreplayed entries hold references that cannot be flushed, so the loop
    /// reports done.
    #[must_use]
    pub fn flush_step(&self, seq_to_flush: u64, replay_done: bool) -> FlushStep {
        let mut state = self.state.lock();
        if let Some((seq, flush)) = Self::next_pin_locked(&mut state, seq_to_flush) {
            return FlushStep::Flush { seq, flush };
        }

        let only_open_entry = state.lists.len() == 1 && state.lists[0].count == 1;
        if !replay_done || state.front > seq_to_flush || only_open_entry || state.lists.is_empty() {
            FlushStep::Done
        } else {
            FlushStep::Wait
        }
    }

    /// Blocks until the ledger changes or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) {
        let mut state = self.state.lock();
        let _ = self.changed.wait_for(&mut state, timeout);
    }

    /// Wakes everything blocked in [`PinLedger::wait`].
    pub fn wake(&self) {
        self.changed.notify_all();
    }

    /// Oldest sequence number still needed on recovery.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.state.lock().front
    }

    /// One past the newest sequence in the window.
    #[must_use]
    pub fn back(&self) -> u64 {
        self.state.lock().back()
    }

    /// Number of lists in the window.
    #[must_use]
    pub fn used(&self) -> usize {
        self.state.lock().lists.len()
    }

    /// Reference count of `seq`, or `None` if it is outside the window.
    #[must_use]
    pub fn count(&self, seq: u64) -> Option<u64> {
        let mut state = self.state.lock();
        state.list_mut(seq).map(|l| l.count)
    }

    /// Devices recorded for `seq`.
    #[must_use]
    pub fn devs(&self, seq: u64) -> Option<DeviceSet> {
        let mut state = self.state.lock();
        state.list_mut(seq).map(|l| l.devs)
    }

    /// Records the devices the entry for `seq` landed on.
    pub fn set_devs(&self, seq: u64, devs: DeviceSet) {
        if let Some(list) = self.state.lock().list_mut(seq) {
            list.devs = devs;
        }
    }

    /// Newest sequence whose entry matches `pred`, or 0.
    #[must_use]
    pub fn newest_matching(&self, pred: impl Fn(DeviceSet) -> bool) -> u64 {
        let state = self.state.lock();
        let front = state.front;
        state
            .lists
            .iter()
            .enumerate()
            .filter(|(_, l)| pred(l.devs))
            .map(|(idx, _)| front + idx as u64)
            .last()
            .unwrap_or(0)
    }

    /// Device sets of every entry still in the window.
    #[must_use]
    pub fn window_devs(&self) -> Vec<DeviceSet> {
        self.state.lock().lists.iter().map(|l| l.devs).collect()
    }
}

impl fmt::Debug for PinLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PinLedger")
            .field("front", &state.front)
            .field("used", &state.lists.len())
            .field("capacity", &self.capacity)
            .field("active_pins", &state.pins.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingFlush(AtomicUsize);

    impl PinFlush for CountingFlush {
        fn flush(&self, _seq: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> Arc<CountingFlush> {
        Arc::new(CountingFlush(AtomicUsize::new(0)))
    }

    fn ledger_with(seqs: u64) -> PinLedger {
        let ledger = PinLedger::new(16);
        for seq in 1..=seqs {
            ledger.open_seq(seq, DeviceSet::EMPTY);
        }
        ledger
    }

    #[test]
    fn add_and_drop_track_counts() {
        let ledger = ledger_with(1);
        let pin = JournalPin::new();

        ledger.add(1, &pin, Some(counting()));
        assert_eq!(ledger.count(1), Some(2));
        assert_eq!(ledger.seq_of(&pin), 1);

        ledger.drop_pin(&pin);
        assert_eq!(ledger.count(1), Some(1));
        assert_eq!(ledger.seq_of(&pin), 0);
    }

    #[test]
    fn drop_of_inactive_pin_is_noop() {
        let ledger = ledger_with(2);
        let pin = JournalPin::new();

        ledger.drop_pin(&pin);
        ledger.add(2, &pin, None);
        ledger.drop_pin(&pin);
        ledger.drop_pin(&pin);
        assert_eq!(ledger.count(2), Some(1));
        assert_eq!(ledger.last_seq(), 1);
    }

    #[test]
    #[should_panic(expected = "already active")]
    fn double_add_panics() {
        let ledger = ledger_with(1);
        let pin = JournalPin::new();
        ledger.add(1, &pin, None);
        ledger.add(1, &pin, None);
    }

    #[test]
    #[should_panic(expected = "no pin list")]
    fn add_to_reclaimed_seq_panics() {
        let ledger = ledger_with(2);
        ledger.put(1);
        assert_eq!(ledger.last_seq(), 2);
        ledger.add(1, &JournalPin::new(), None);
    }

    #[test]
    fn front_waits_for_pins() {
        let ledger = ledger_with(3);
        let pin = JournalPin::new();
        ledger.add(1, &pin, Some(counting()));

        ledger.put(1);
        ledger.put(2);
        assert_eq!(ledger.last_seq(), 1, "pinned seq 1 must not be reclaimed");

        ledger.drop_pin(&pin);
        assert_eq!(ledger.last_seq(), 3);
        assert_eq!(ledger.used(), 1);
    }

    #[test]
    fn add_if_older_keeps_oldest() {
        let ledger = ledger_with(8);
        let a = JournalPin::new();
        let b = JournalPin::new();
        let p = JournalPin::new();
        ledger.add(5, &a, Some(counting()));
        ledger.add(8, &b, Some(counting()));

        ledger.add_if_older(&a, &p, Some(counting()));
        ledger.add_if_older(&b, &p, Some(counting()));
        assert_eq!(ledger.seq_of(&p), 5);

        let inactive = JournalPin::new();
        ledger.add_if_older(&inactive, &p, None);
        assert_eq!(ledger.seq_of(&p), 5);
        assert_eq!(ledger.count(5), Some(3));
        assert_eq!(ledger.count(8), Some(2));
    }

    #[test]
    fn add_if_older_moves_newer_pin_back() {
        let ledger = ledger_with(4);
        let old = JournalPin::new();
        let p = JournalPin::new();
        ledger.add(2, &old, Some(counting()));
        ledger.add(4, &p, Some(counting()));

        ledger.add_if_older(&old, &p, Some(counting()));
        assert_eq!(ledger.seq_of(&p), 2);
        assert_eq!(ledger.count(4), Some(1));
    }

    #[test]
    fn get_next_pin_scans_oldest_first_and_respects_target() {
        let ledger = ledger_with(4);
        let early = JournalPin::new();
        let late = JournalPin::new();
        let unflushable = JournalPin::new();
        ledger.add(1, &unflushable, None);
        ledger.add(2, &early, Some(counting()));
        ledger.add(4, &late, Some(counting()));

        assert!(ledger.get_next_pin(1).is_none());
        let (seq, _) = ledger.get_next_pin(3).unwrap();
        assert_eq!(seq, 2);
        assert!(ledger.get_next_pin(3).is_none(), "flushed pins are not returned twice");

        let (seq, flush) = ledger.get_next_pin(u64::MAX).unwrap();
        assert_eq!(seq, 4);
        flush.flush(seq);

        ledger.drop_pin(&early);
        assert_eq!(ledger.count(2), Some(1));
    }

    #[test]
    fn flush_step_reports_completion() {
        let ledger = ledger_with(2);
        let pin = JournalPin::new();
        ledger.add(1, &pin, Some(counting()));

        assert!(matches!(ledger.flush_step(1, true), FlushStep::Flush { seq: 1, .. }));
        assert!(matches!(ledger.flush_step(1, true), FlushStep::Wait));
        assert!(matches!(ledger.flush_step(1, false), FlushStep::Done));

        ledger.drop_pin(&pin);
        ledger.put(1);
        assert!(matches!(ledger.flush_step(1, true), FlushStep::Done));
        assert!(matches!(ledger.flush_step(u64::MAX, true), FlushStep::Done));
    }

    #[test]
    fn newest_matching_and_window_devs() {
        let ledger = PinLedger::new(8);
        let d0 = DeviceSet::single(crate::types::DeviceId::new(0));
        let d1 = DeviceSet::single(crate::types::DeviceId::new(1));
        ledger.open_seq(1, d0);
        ledger.open_seq(2, d1);
        ledger.open_seq(3, d0);

        assert_eq!(ledger.newest_matching(|d| d == d1), 2);
        assert_eq!(ledger.newest_matching(|d| d == d0), 3);
        assert_eq!(ledger.newest_matching(|d| d.len() > 1), 0);
        assert_eq!(ledger.window_devs(), vec![d0, d1, d0]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize, u64),
        Drop(usize),
        AddIfOlder(usize, usize),
        Put,
        Open,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..6usize, 0..8u64).prop_map(|(p, s)| Op::Add(p, s)),
            (0..6usize).prop_map(Op::Drop),
            (0..6usize, 0..6usize).prop_map(|(a, b)| Op::AddIfOlder(a, b)),
            Just(Op::Put),
            Just(Op::Open),
        ]
    }

    proptest! {
        #[test]
        fn watermark_never_moves_backwards(ops in prop::collection::vec(op(), 1..200)) {
            let ledger = PinLedger::new(64);
            let pins: Vec<JournalPin> = (0..6).map(|_| JournalPin::new()).collect();
            let mut next_seq = 1u64;
            let mut unput: VecDeque<u64> = VecDeque::new();
            let mut last = ledger.last_seq();

            for op in ops {
                match op {
                    Op::Open if ledger.has_room() => {
                        ledger.open_seq(next_seq, DeviceSet::EMPTY);
                        unput.push_back(next_seq);
                        next_seq += 1;
                    }
                    Op::Open => {}
                    Op::Put => {
                        if let Some(seq) = unput.pop_front() {
                            ledger.put(seq);
                        }
                    }
                    Op::Add(p, offset) => {
                        let pin = &pins[p];
                        if ledger.is_active(pin) {
                            continue;
                        }
                        // Only sequences whose list is still referenced accept pins.
                        let seq = ledger.last_seq() + offset;
                        if ledger.count(seq).unwrap_or(0) > 0 {
                            ledger.add(seq, pin, Some(counting()));
                        }
                    }
                    Op::Drop(p) => ledger.drop_pin(&pins[p]),
                    Op::AddIfOlder(a, b) => {
                        if a != b {
                            ledger.add_if_older(&pins[a], &pins[b], Some(counting()));
                        }
                    }
                }

                let now = ledger.last_seq();
                prop_assert!(now >= last);
                last = now;

                // No list still referenced has been reclaimed.
                for pin in &pins {
                    let seq = ledger.seq_of(pin);
                    if seq != 0 {
                        prop_assert!(seq >= now);
                        prop_assert!(ledger.count(seq).unwrap() > 0);
                    }
                }
                if let Some(&seq) = unput.front() {
                    prop_assert!(seq >= now);
                }
            }
        }
    }
}

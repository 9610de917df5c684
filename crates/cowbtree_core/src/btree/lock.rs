//! Shared/intent/exclusive node lock.
//!
//! Any number of readers may hold the lock alongside at most one intent
//! holder. Only the intent holder may take the write lock, which excludes
//! readers. The lock sequence number changes on every write lock and unlock,
//! so a holder that dropped its lock can tell whether the node changed
//! before it relocks.
//!
//! Intent and write holders are identified by transaction id.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockType {
    /// Shared.
    Read,
    /// Exclusive among intent holders, shared with readers.
    Intent,
    /// Exclusive.
    Write,
}

#[derive(Debug, Default)]
struct SixState {
    readers: u32,
    intent: Option<u64>,
    write: bool,
    seq: u64,
}

/// A three-mode node lock.
#[derive(Debug, Default)]
pub struct SixLock {
    state: Mutex<SixState>,
    released: Condvar,
    write_locks: AtomicU64,
}

impl SixLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lock sequence number.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.state.lock().seq
    }

    /// Number of times the write lock has been taken.
    #[must_use]
    pub fn write_locks(&self) -> u64 {
        self.write_locks.load(Ordering::Relaxed)
    }

    /// Intent holder, if any.
    #[must_use]
    pub fn intent_owner(&self) -> Option<u64> {
        self.state.lock().intent
    }

    /// Returns true if the write lock is held.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().write
    }

    /// Takes a read lock if no writer holds the lock.
    #[must_use]
    pub fn try_read(&self) -> bool {
        let mut state = self.state.lock();
        if state.write {
            return false;
        }
        state.readers += 1;
        true
    }

    /// Takes a read lock, waiting out any writer.
    pub fn lock_read(&self) {
        let mut state = self.state.lock();
        while state.write {
            self.released.wait(&mut state);
        }
        state.readers += 1;
    }

    /// Releases a read lock.
    ///
    /// # Panics
    ///
    /// Panics if no read lock is held.
    pub fn unlock_read(&self) {
        let mut state = self.state.lock();
        assert!(state.readers > 0, "unlocking a read lock that is not held");
        state.readers -= 1;
        if state.readers == 0 {
            self.released.notify_all();
        }
    }

    /// Takes the intent lock for `owner` if it is free.
    #[must_use]
    pub fn try_intent(&self, owner: u64) -> bool {
        let mut state = self.state.lock();
        if state.intent.is_some() {
            return false;
        }
        state.intent = Some(owner);
        true
    }

    /// Takes the intent lock for `owner`, waiting for the current holder.
    pub fn lock_intent(&self, owner: u64) {
        let mut state = self.state.lock();
        while state.intent.is_some() {
            self.released.wait(&mut state);
        }
        state.intent = Some(owner);
    }

    /// Retakes the intent lock only if nothing was written since `seq` was
    /// observed.
    #[must_use]
    pub fn relock_intent(&self, owner: u64, seq: u64) -> bool {
        let mut state = self.state.lock();
        if state.intent.is_some() || state.seq != seq {
            return false;
        }
        state.intent = Some(owner);
        true
    }

    /// Releases the intent lock.
    ///
    /// # Panics
    ///
    /// Panics if `owner` does not hold it or still holds the write lock.
    pub fn unlock_intent(&self, owner: u64) {
        let mut state = self.state.lock();
        assert_eq!(state.intent, Some(owner), "intent lock not held by {owner}");
        assert!(!state.write, "releasing intent while write locked");
        state.intent = None;
        self.released.notify_all();
    }

    /// Upgrades `owner`'s intent lock to a write lock, waiting for readers
    /// to drain.
    ///
    /// # Panics
    ///
    /// Panics if `owner` does not hold the intent lock.
    pub fn lock_write(&self, owner: u64) {
        let mut state = self.state.lock();
        assert_eq!(state.intent, Some(owner), "write lock requires intent");
        assert!(!state.write, "write lock taken twice");
        state.write = true;
        while state.readers > 0 {
            self.released.wait(&mut state);
        }
        state.seq += 1;
        self.write_locks.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops the write lock back to intent.
    ///
    /// # Panics
    ///
    /// Panics if `owner` does not hold the write lock.
    pub fn unlock_write(&self, owner: u64) {
        let mut state = self.state.lock();
        assert!(state.write && state.intent == Some(owner), "write lock not held by {owner}");
        state.write = false;
        state.seq += 1;
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share_with_intent() {
        let lock = SixLock::new();
        assert!(lock.try_read());
        assert!(lock.try_intent(1));
        assert!(lock.try_read());
        assert!(!lock.try_intent(2));
        lock.unlock_read();
        lock.unlock_read();
        lock.unlock_intent(1);
        assert!(lock.try_intent(2));
    }

    #[test]
    fn write_bumps_seq_and_blocks_readers() {
        let lock = SixLock::new();
        assert!(lock.try_intent(7));
        let before = lock.seq();

        lock.lock_write(7);
        assert!(!lock.try_read());
        assert_eq!(lock.seq(), before + 1);

        lock.unlock_write(7);
        assert_eq!(lock.seq(), before + 2);
        assert!(lock.try_read());
        lock.unlock_read();
        assert_eq!(lock.write_locks(), 1);
    }

    #[test]
    fn relock_fails_after_a_write() {
        let lock = SixLock::new();
        let seq = lock.seq();
        assert!(lock.relock_intent(1, seq));
        lock.unlock_intent(1);

        assert!(lock.try_intent(2));
        lock.lock_write(2);
        lock.unlock_write(2);
        lock.unlock_intent(2);

        assert!(!lock.relock_intent(1, seq));
        assert!(lock.relock_intent(1, lock.seq()));
    }

    #[test]
    fn write_waits_for_readers() {
        let lock = Arc::new(SixLock::new());
        assert!(lock.try_read());
        assert!(lock.try_intent(1));

        let writer = {
            let lock = lock.clone();
            thread::spawn(move || {
                lock.lock_write(1);
                lock.unlock_write(1);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(lock.write_locks(), 0);

        lock.unlock_read();
        writer.join().unwrap();
        assert_eq!(lock.write_locks(), 1);
    }

    #[test]
    #[should_panic(expected = "write lock requires intent")]
    fn write_without_intent_panics() {
        SixLock::new().lock_write(3);
    }
}

//! Journal reclaim: discarding old buckets and flushing pins so the oldest
//! needed sequence number keeps moving.

use super::{Journal, WAIT_SLICE};
use crate::error::CoreResult;
use crate::journal::FlushStep;
use crate::types::DeviceId;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

impl Journal {
    /// Frees buckets holding only entries older than the `last_seq` recorded
    /// on disk.
    fn discard_buckets(&self) {
        let _reclaim = self.reclaim_lock.lock();
        let mut state = self.state.lock();
        let last_seq_ondisk = state.last_seq_ondisk;
        for (idx, dev) in state.devices.iter_mut().enumerate() {
            while dev.last_idx != dev.cur_idx && dev.bucket_seq[dev.last_idx] < last_seq_ondisk {
                if self.discard {
                    dev.discards += 1;
                    debug!(dev = idx, bucket = dev.last_idx, "discarding journal bucket");
                }
                dev.last_idx = (dev.last_idx + 1) % dev.nr();
            }
        }
    }

    /// Sequence number reclaim flushes up to: far enough that half of each
    /// device's ring and half of the pin window stay free.
    fn reclaim_target(&self) -> u64 {
        let state = self.state.lock();
        let ring = state
            .devices
            .iter()
            .map(|dev| dev.bucket_seq[(dev.cur_idx + dev.nr() / 2) % dev.nr()])
            .max()
            .unwrap_or(0);
        let window = state.seq.saturating_sub(self.pins.capacity() as u64 / 2);
        ring.max(window).min(state.seq)
    }

    /// One reclaim pass.
    ///
    /// Discards free buckets, then flushes every pin at or below the reclaim
    /// target. If nothing has been flushed for longer than the reclaim delay,
    /// at least one pin is flushed regardless of the target.
    pub fn reclaim_work(&self) {
        self.discard_buckets();

        let seq_to_flush = self.reclaim_target();
        let mut min_nr = usize::from(self.last_flushed.lock().elapsed() > self.reclaim_delay);
        let mut flushed = 0usize;

        loop {
            let target = if min_nr > 0 { u64::MAX } else { seq_to_flush };
            let Some((seq, flush)) = self.pins.get_next_pin(target) else {
                break;
            };
            min_nr = min_nr.saturating_sub(1);
            flush.flush(seq);
            flushed += 1;
            *self.last_flushed.lock() = Instant::now();
        }

        if flushed > 0 {
            debug!(
                seq_to_flush,
                flushed,
                last_seq = self.pins.last_seq(),
                "journal reclaim pass"
            );
        }
    }

    /// Flushes every pin at or below `seq_to_flush` and waits until nothing
    /// at or below it is pinned.
    ///
    /// Afterwards an empty entry is written if the `last_seq` on disk lags
    /// the ledger, or if everything was flushed and the tree roots changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal failed.
    pub fn flush_pins(&self, seq_to_flush: u64) -> CoreResult<()> {
        if !self.is_started() {
            return Ok(());
        }

        loop {
            match self.pins.flush_step(seq_to_flush, self.replay_done()) {
                FlushStep::Flush { seq, flush } => flush.flush(seq),
                FlushStep::Wait => {
                    self.check_error()?;
                    self.pins.wait(WAIT_SLICE);
                }
                FlushStep::Done => break,
            }
        }
        self.check_error()?;

        if self.pins.last_seq() != self.last_seq_ondisk() || (seq_to_flush == u64::MAX && self.roots_dirty()) {
            self.meta()?;
        }
        Ok(())
    }

    /// Flushes every pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal failed.
    pub fn flush_all_pins(&self) -> CoreResult<()> {
        self.flush_pins(u64::MAX)
    }

    /// Flushes every pin up to the newest entry that landed on `dev`, or
    /// with `None`, the newest entry with fewer replicas than configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal failed.
    pub fn flush_device_pins(&self, dev: Option<DeviceId>) -> CoreResult<()> {
        let replicas = self.metadata_replicas;
        let seq = self.pins.newest_matching(|devs| match dev {
            Some(dev) => devs.contains(dev),
            None => devs.len() < replicas,
        });
        debug!(?dev, seq, "flushing device pins");
        if seq == 0 {
            return Ok(());
        }
        self.flush_pins(seq)
    }
}

/// Background thread running [`Journal::reclaim_work`] every reclaim delay
/// and whenever it is kicked.
///
/// The thread exits when the scheduler is dropped or the journal goes
/// read-only or fails.
pub struct ReclaimScheduler {
    kick: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ReclaimScheduler {
    /// Spawns the reclaim thread.
    #[must_use]
    pub fn start(journal: Arc<Journal>) -> Self {
        let (kick, receiver) = mpsc::channel();
        let delay = journal.reclaim_delay.max(Duration::from_millis(1));

        let handle = thread::spawn(move || loop {
            match receiver.recv_timeout(delay) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if journal.is_read_only() {
                debug!("journal read-only, stopping reclaim");
                break;
            }
            if journal.has_failed() {
                warn!("journal failed, stopping reclaim");
                break;
            }
            journal.reclaim_work();
        });

        Self {
            kick: Some(kick),
            handle: Some(handle),
        }
    }

    /// Requests a reclaim pass as soon as possible.
    pub fn kick(&self) {
        if let Some(kick) = &self.kick {
            let _ = kick.send(());
        }
    }

    /// Returns true while the reclaim thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ReclaimScheduler {
    fn drop(&mut self) {
        self.kick.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ReclaimScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReclaimScheduler")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::journal::{FlushFn, JournalPin, PinFlush, PinLedger, ResFlags};
    use cowbtree_storage::InMemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DropOnFlush {
        ledger: Arc<PinLedger>,
        pin: JournalPin,
        flushes: AtomicUsize,
    }

    impl PinFlush for DropOnFlush {
        fn flush(&self, _seq: u64) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            self.ledger.drop_pin(&self.pin);
        }
    }

    fn journal(config: &Config) -> Arc<Journal> {
        let (journal, _) = Journal::open(config, Box::new(InMemoryBackend::new())).unwrap();
        Arc::new(journal)
    }

    fn config() -> Config {
        Config::new()
            .journal_entry_u64s(64)
            .journal_buckets(8)
            .journal_devices(2)
            .pin_window(16)
    }

    // Pins a fresh flusher at a new entry and closes that entry.
    fn pinned_entry(journal: &Journal) -> Arc<DropOnFlush> {
        let flusher = Arc::new(DropOnFlush {
            ledger: journal.pins().clone(),
            pin: JournalPin::new(),
            flushes: AtomicUsize::new(0),
        });
        let res = journal.reserve(1, ResFlags::NONE).unwrap();
        let flush: FlushFn = flusher.clone();
        journal.pins().add(res.seq(), &flusher.pin, Some(flush));
        journal.release(res).unwrap();
        journal.close_entry().unwrap();
        flusher
    }

    #[test]
    fn flush_all_pins_flushes_and_publishes_last_seq() {
        let journal = journal(&config());
        let a = pinned_entry(&journal);
        let b = pinned_entry(&journal);
        assert_eq!(journal.last_seq_ondisk(), 1);

        journal.flush_all_pins().unwrap();

        assert_eq!(a.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(b.flushes.load(Ordering::SeqCst), 1);
        assert!(!journal.pins().is_active(&a.pin));
        assert!(journal.last_seq_ondisk() >= 3);
    }

    #[test]
    fn flush_pins_stops_at_target() {
        let journal = journal(&config());
        let a = pinned_entry(&journal);
        let b = pinned_entry(&journal);

        journal.flush_pins(1).unwrap();

        assert_eq!(a.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(b.flushes.load(Ordering::SeqCst), 0);
        assert_eq!(journal.pins().last_seq(), 2);
        assert_eq!(journal.last_seq_ondisk(), 2);
    }

    #[test]
    fn flush_device_pins_targets_newest_entry_on_device() {
        let config = config().metadata_replicas(1);
        let journal = journal(&config);
        let on_dev0 = pinned_entry(&journal);
        let on_dev1 = pinned_entry(&journal);
        let on_dev0_again = pinned_entry(&journal);

        journal.flush_device_pins(Some(DeviceId::new(1))).unwrap();

        assert_eq!(on_dev0.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(on_dev1.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(on_dev0_again.flushes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reclaim_discards_buckets_behind_last_seq_ondisk() {
        let config = config().journal_devices(1).journal_buckets(4);
        let journal = journal(&config);
        for _ in 0..6 {
            journal.meta().unwrap();
            journal.reclaim_work();
        }
        assert!(journal.discards(DeviceId::new(0)) >= 4);
        assert_eq!(journal.last_durable_seq(), 6);
    }

    #[test]
    fn full_device_ring_recovers_through_reclaim() {
        let config = config().journal_devices(1).journal_buckets(4);
        let journal = journal(&config);
        let mut last = 0;
        for _ in 0..12 {
            let res = journal.reserve(60, ResFlags::NONE).unwrap();
            assert!(res.seq() > last);
            last = res.seq();
            journal.release(res).unwrap();
        }
        assert!(journal.discards(DeviceId::new(0)) > 0);
    }

    #[test]
    fn reclaim_flushes_stale_pins_after_delay() {
        let config = config().reclaim_delay(Duration::from_millis(1));
        let journal = journal(&config);
        let flusher = pinned_entry(&journal);
        thread::sleep(Duration::from_millis(5));

        journal.reclaim_work();
        assert_eq!(flusher.flushes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scheduler_runs_reclaim_in_background() {
        let config = config().reclaim_delay(Duration::from_millis(2));
        let journal = journal(&config);
        let flusher = pinned_entry(&journal);

        let scheduler = ReclaimScheduler::start(journal.clone());
        scheduler.kick();
        let deadline = Instant::now() + Duration::from_secs(5);
        while journal.pins().is_active(&flusher.pin) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!journal.pins().is_active(&flusher.pin));
        assert!(scheduler.is_running());

        journal.set_read_only(true);
        drop(scheduler);
    }
}

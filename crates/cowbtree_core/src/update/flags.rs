//! Commit flags.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Flags controlling a commit.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitFlags(u32);

impl CommitFlags {
    /// No flags.
    pub const NONE: CommitFlags = CommitFlags(0);
    /// Report restarts to the caller as [`Interrupted`](crate::CoreError::Interrupted)
    /// instead of retrying internally.
    pub const ATOMIC: CommitFlags = CommitFlags(1 << 0);
    /// Keep locks after the commit; skips merging and downgrading.
    pub const NOUNLOCK: CommitFlags = CommitFlags(1 << 1);
    /// The commit must not fail for lack of space.
    pub const NOFAIL: CommitFlags = CommitFlags(1 << 2);
    /// Skip the read-only check.
    pub const NOCHECK_RW: CommitFlags = CommitFlags(1 << 3);
    /// Switch a read-only store to read-write instead of failing.
    pub const LAZY_RW: CommitFlags = CommitFlags(1 << 4);
    /// May use the btree node reserve.
    pub const USE_RESERVE: CommitFlags = CommitFlags(1 << 5);
    /// May use every node, including the allocator's reserve.
    pub const USE_ALLOC_RESERVE: CommitFlags = CommitFlags(1 << 6);
    /// Replaying the journal: no reservation, pins at the replay sequence.
    pub const JOURNAL_REPLAY: CommitFlags = CommitFlags(1 << 7);
    /// May use journal space held back for metadata.
    pub const JOURNAL_RESERVED: CommitFlags = CommitFlags(1 << 8);
    /// Do not subtract keys being overwritten from accounting.
    pub const NOMARK_OVERWRITES: CommitFlags = CommitFlags(1 << 9);
    /// Skip accounting entirely.
    pub const NOMARK: CommitFlags = CommitFlags(1 << 10);
    /// Turn an internal retry into [`Interrupted`](crate::CoreError::Interrupted).
    pub const NO_CLEAR_REPLICAS: CommitFlags = CommitFlags(1 << 11);
    /// The insert may invalidate a bucket; overwritten allocations are
    /// counted as invalidated.
    pub const BUCKET_INVALIDATE: CommitFlags = CommitFlags(1 << 12);
    /// Never block; anything that would is reported as
    /// [`Interrupted`](crate::CoreError::Interrupted).
    pub const NOWAIT: CommitFlags = CommitFlags(1 << 13);
    /// The caller already holds the gc lock.
    pub const GC_LOCK_HELD: CommitFlags = CommitFlags(1 << 14);

    const NAMES: [(CommitFlags, &'static str); 15] = [
        (Self::ATOMIC, "ATOMIC"),
        (Self::NOUNLOCK, "NOUNLOCK"),
        (Self::NOFAIL, "NOFAIL"),
        (Self::NOCHECK_RW, "NOCHECK_RW"),
        (Self::LAZY_RW, "LAZY_RW"),
        (Self::USE_RESERVE, "USE_RESERVE"),
        (Self::USE_ALLOC_RESERVE, "USE_ALLOC_RESERVE"),
        (Self::JOURNAL_REPLAY, "JOURNAL_REPLAY"),
        (Self::JOURNAL_RESERVED, "JOURNAL_RESERVED"),
        (Self::NOMARK_OVERWRITES, "NOMARK_OVERWRITES"),
        (Self::NOMARK, "NOMARK"),
        (Self::NO_CLEAR_REPLICAS, "NO_CLEAR_REPLICAS"),
        (Self::BUCKET_INVALIDATE, "BUCKET_INVALIDATE"),
        (Self::NOWAIT, "NOWAIT"),
        (Self::GC_LOCK_HELD, "GC_LOCK_HELD"),
    ];

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: CommitFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// These flags without the ones in `other`.
    #[must_use]
    pub const fn without(self, other: CommitFlags) -> CommitFlags {
        CommitFlags(self.0 & !other.0)
    }
}

impl BitOr for CommitFlags {
    type Output = CommitFlags;

    fn bitor(self, rhs: Self) -> Self {
        CommitFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for CommitFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for CommitFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (flag, name) in Self::NAMES {
            if self.contains(flag) && flag != Self::NONE {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

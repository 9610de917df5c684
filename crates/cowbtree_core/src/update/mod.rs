//! Transactions and the commit engine.
//!
//! A [`BtreeTrans`] collects iterators and pending updates, then
//! [`BtreeTrans::commit`] applies them all under one journal reservation.
//! Transient failures (full leaves, missing replicas entries, a busy
//! journal, lost locks) restart the commit internally unless the caller
//! asked for [`CommitFlags::ATOMIC`], in which case they surface as
//! [`CoreError::Interrupted`](crate::CoreError::Interrupted).

mod commit;
mod flags;
mod ops;
mod trans;

pub use flags::CommitFlags;
pub use trans::{BtreeTrans, TRANS_INLINE};

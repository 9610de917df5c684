//! # cowbtree core
//!
//! Transactional update engine for a copy-on-write B-tree.
//!
//! This crate provides:
//! - A write-ahead [`Journal`] with a bounded pin window and background
//!   reclaim
//! - Leaf nodes with shared/intent/exclusive locks, splits and merges
//! - Transactions that commit several updates atomically under one journal
//!   reservation, restarting internally on transient failures
//! - Space and replicas accounting applied with every commit
//! - Range deletes and crash recovery by journal replay
//!
//! ```rust,ignore
//! use cowbtree_core::{BtreeId, CommitFlags, Config, Key, Pos, Store};
//!
//! let store = Store::new(Config::default())?;
//! store.btree_insert(BtreeId::Dirents, Key::inline(Pos::new(1, 1), &b"a"[..]), None, None, CommitFlags::NONE)?;
//! store.delete_range(BtreeId::Dirents, Pos::new(1, 0), Pos::new(2, 0), None)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod accounting;
pub mod btree;
mod config;
mod error;
pub mod journal;
mod key;
mod store;
mod types;
mod update;

pub use accounting::{Accounting, DataType, DiskReservation, Usage};
pub use btree::{IterFlags, IterId, NodeImages, Tree, Uptodate};
pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use journal::{Journal, JournalPin, PinLedger, ReclaimScheduler};
pub use key::{Key, KeyValue, KEY_U64S};
pub use store::{FaultInjector, Store};
pub use types::{BtreeId, DeviceId, DeviceSet, NodeId, Pos};
pub use update::{BtreeTrans, CommitFlags, TRANS_INLINE};

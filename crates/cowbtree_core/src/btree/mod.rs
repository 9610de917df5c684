//! Reference B-tree layer: leaves, node locks, extents and the leaf tables
//! the commit engine works against.

mod extents;
mod images;
mod iter;
mod lock;
mod node;
mod tree;

pub use extents::{can_insert, lookup_pos, trim_atomic};
pub use images::NodeImages;
pub use iter::{IterFlags, IterId, Uptodate};
pub(crate) use iter::BtreeIter;
pub use lock::{LockType, SixLock};
pub(crate) use node::NodeIo;
pub use node::{InsertOutcome, Node, NodeData, MAX_BSETS};
pub use tree::{NodeBudget, ReserveLevel, Tree};

#[cfg(test)]
pub(crate) fn test_io(capacity: u64) -> std::sync::Arc<NodeIo> {
    use crate::config::Config;
    use crate::journal::Journal;
    use cowbtree_storage::InMemoryBackend;
    use std::sync::Arc;

    let (journal, _) = Journal::open(&Config::new(), Box::new(InMemoryBackend::new())).unwrap();
    Arc::new(NodeIo {
        journal: Arc::new(journal),
        images: NodeImages::new(),
        capacity_u64s: capacity,
    })
}

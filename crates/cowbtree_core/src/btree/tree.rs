//! Per-btree table of leaves.
//!
//! The leaves of one B-tree partition `[Pos::MIN, Pos::MAX]` into disjoint
//! ranges. A leaf's range never changes: splits and merges build new leaves,
//! swap them into the table and mark the old ones dying. Anyone who looked a
//! leaf up must check it is not dying once they hold its lock.

use super::node::{Node, NodeIo};
use crate::error::{CoreError, CoreResult};
use crate::key::Key;
use crate::types::{BtreeId, NodeId, Pos};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// How deep into the node reserve an operation may dip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReserveLevel {
    /// Leaves both reserves untouched.
    Normal,
    /// May use the btree reserve.
    Btree,
    /// May use every node.
    Alloc,
}

/// Node budget shared by every tree of a store.
#[derive(Debug)]
pub struct NodeBudget {
    max_nodes: usize,
    reserve: usize,
    live: AtomicUsize,
    next_id: AtomicU64,
}

impl NodeBudget {
    /// Creates a budget of `max_nodes`, holding `reserve` back per level.
    #[must_use]
    pub fn new(max_nodes: usize, reserve: usize) -> Self {
        Self {
            max_nodes,
            reserve,
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Nodes currently allocated.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn limit(&self, level: ReserveLevel) -> usize {
        match level {
            ReserveLevel::Normal => self.max_nodes.saturating_sub(2 * self.reserve),
            ReserveLevel::Btree => self.max_nodes.saturating_sub(self.reserve),
            ReserveLevel::Alloc => self.max_nodes,
        }
    }

    /// Allocates `nr` nodes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSpace`] if that would exceed the limit for
    /// `level`.
    pub fn alloc(&self, nr: usize, level: ReserveLevel) -> CoreResult<()> {
        let limit = self.limit(level);
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live + nr <= limit).then_some(live + nr)
            })
            .map(|_| ())
            .map_err(|_| CoreError::NoSpace)
    }

    /// Returns `nr` nodes to the budget.
    pub fn free(&self, nr: usize) {
        self.live.fetch_sub(nr, Ordering::AcqRel);
    }

    fn next_id(&self) -> NodeId {
        NodeId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// The leaves of one B-tree.
pub struct Tree {
    btree_id: BtreeId,
    nodes: RwLock<Vec<Arc<Node>>>,
    io: Arc<NodeIo>,
    budget: Arc<NodeBudget>,
    splits: AtomicU64,
    merges: AtomicU64,
}

impl Tree {
    /// Builds a tree from the durable keys of `btree_id`.
    ///
    /// Keys are packed into leaves filled to about two thirds; an empty
    /// tree gets a single placeholder leaf.
    pub(crate) fn new(btree_id: BtreeId, keys: Vec<Key>, io: Arc<NodeIo>, budget: Arc<NodeBudget>) -> Self {
        let nodes = if keys.is_empty() {
            vec![Node::fake(budget.next_id(), btree_id, (Pos::MIN, Pos::MAX), io.clone())]
        } else {
            let target = (io.capacity_u64s * 2 / 3).max(1);
            let mut chunks: Vec<Vec<Key>> = vec![Vec::new()];
            let mut used = 0;
            for key in keys {
                if used + key.u64s() > target && chunks.last().is_some_and(|c| !c.is_empty()) {
                    chunks.push(Vec::new());
                    used = 0;
                }
                used += key.u64s();
                if let Some(chunk) = chunks.last_mut() {
                    chunk.push(key);
                }
            }

            let count = chunks.len();
            let mut min = Pos::MIN;
            let mut nodes = Vec::with_capacity(count);
            for (idx, chunk) in chunks.into_iter().enumerate() {
                let max = match chunk.last() {
                    Some(key) if idx + 1 < count => key.pos,
                    _ => Pos::MAX,
                };
                nodes.push(Node::new(budget.next_id(), btree_id, (min, max), chunk, true, io.clone()));
                if max != Pos::MAX {
                    min = max.successor();
                }
            }
            budget.live.fetch_add(count, Ordering::AcqRel);
            nodes
        };

        Self {
            btree_id,
            nodes: RwLock::new(nodes),
            io,
            budget,
            splits: AtomicU64::new(0),
            merges: AtomicU64::new(0),
        }
    }

    /// Tree id.
    #[must_use]
    pub fn btree_id(&self) -> BtreeId {
        self.btree_id
    }

    /// The leaf covering `pos`.
    ///
    /// The leaf may be replaced as soon as this returns; check
    /// [`NodeData::is_dying`](super::NodeData::is_dying) under its lock.
    #[must_use]
    pub fn lookup(&self, pos: Pos) -> Arc<Node> {
        let nodes = self.nodes.read();
        let idx = nodes.partition_point(|n| n.min() <= pos);
        nodes[idx - 1].clone()
    }

    /// The leaf after `node`, if any.
    #[must_use]
    pub fn next(&self, node: &Node) -> Option<Arc<Node>> {
        (node.max() != Pos::MAX).then(|| self.lookup(node.max().successor()))
    }

    /// The leaf before `node`, if any.
    #[must_use]
    pub fn prev(&self, node: &Node) -> Option<Arc<Node>> {
        (node.min() != Pos::MIN).then(|| self.lookup(node.min().predecessor()))
    }

    /// Snapshot of the leaf table.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    /// Number of leaf splits so far.
    #[must_use]
    pub fn splits(&self) -> u64 {
        self.splits.load(Ordering::Relaxed)
    }

    /// Number of leaf merges so far.
    #[must_use]
    pub fn merges(&self) -> u64 {
        self.merges.load(Ordering::Relaxed)
    }

    fn replace(&self, old: &[&Arc<Node>], new: &[Arc<Node>]) {
        let mut nodes = self.nodes.write();
        let first = nodes
            .iter()
            .position(|n| n.id() == old[0].id())
            .unwrap_or_else(|| panic!("{} missing from the leaf table", old[0].id()));
        let removed: Vec<Arc<Node>> = nodes.splice(first..first + old.len(), new.iter().cloned()).collect();
        debug_assert!(removed.iter().zip(old).all(|(r, o)| r.id() == o.id()));
        debug_assert!(nodes.windows(2).all(|w| w[0].max().successor() == w[1].min()));
    }

    fn new_node(&self, range: (Pos, Pos), keys: Vec<Key>, old: &[&Arc<Node>]) -> Arc<Node> {
        let dirty = old.iter().map(|n| n.data()).filter(|d| d.is_dirty()).map(|d| d.journal_seq()).max();
        let node = Node::new(self.budget.next_id(), self.btree_id, range, keys, dirty.is_none(), self.io.clone());

        if let Some(journal_seq) = dirty {
            node.data().inherit_dirty(journal_seq);
            let pins = self.io.journal.pins();
            for src in old {
                pins.add_if_older(src.pin(0), node.pin(0), Some(node.flush_fn()));
                pins.add_if_older(src.pin(1), node.pin(0), Some(node.flush_fn()));
            }
        }
        node
    }

    /// Splits `node`, which `owner` holds intent on, into two leaves; a node
    /// whose live keys fill at most half of it is rewritten as one leaf
    /// instead, and a placeholder becomes a real leaf.
    ///
    /// The old node is left dying with its intent lock still held.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSpace`] if the node budget for `level` is
    /// exhausted.
    pub fn split(&self, node: &Arc<Node>, owner: u64, level: ReserveLevel) -> CoreResult<()> {
        let (keys, live_u64s) = {
            let data = node.data();
            assert!(!data.is_dying(), "splitting dying {}", node.id());
            (data.live_keys(), data.live_u64s())
        };

        let halves = !node.is_fake() && keys.len() >= 2 && live_u64s > self.io.capacity_u64s / 2;
        let nr_new = if halves { 2 } else { 1 };
        self.budget.alloc(nr_new, level)?;

        node.lock().lock_write(owner);
        let new = if halves {
            let mut acc = 0;
            let split_at = keys
                .iter()
                .position(|k| {
                    acc += k.u64s();
                    acc >= live_u64s / 2
                })
                .unwrap_or(0)
                .min(keys.len() - 2);
            let pivot = keys[split_at].pos;
            let (left, right) = keys.split_at(split_at + 1);
            vec![
                self.new_node((node.min(), pivot), left.to_vec(), &[node]),
                self.new_node((pivot.successor(), node.max()), right.to_vec(), &[node]),
            ]
        } else {
            vec![self.new_node((node.min(), node.max()), keys, &[node])]
        };

        node.data().set_dying();
        node.drop_pins();
        self.replace(&[node], &new);
        if !node.is_fake() {
            self.budget.free(1);
        }
        node.lock().unlock_write(owner);

        self.io.journal.mark_roots_dirty();
        self.splits.fetch_add(1, Ordering::Relaxed);
        debug!(
            btree = %self.btree_id,
            old = %node.id(),
            new = ?new.iter().map(|n| n.id().as_u64()).collect::<Vec<_>>(),
            live_u64s,
            "leaf split"
        );
        Ok(())
    }

    /// Tries to merge `node`, which `owner` holds intent on, with a
    /// sibling. Best effort: gives up on a sibling that is locked, too big,
    /// or when no node can be allocated.
    ///
    /// Returns true if a merge happened; `node` is then dying.
    pub fn maybe_merge(&self, node: &Arc<Node>, owner: u64, threshold: u64) -> bool {
        if node.is_fake() {
            return false;
        }
        for dir in 0..2 {
            let (live, hint) = {
                let data = node.data();
                if data.is_dying() {
                    return false;
                }
                (data.live_u64s(), data.sib_u64s(dir))
            };
            if hint > threshold {
                continue;
            }
            let sibling = if dir == 0 { self.prev(node) } else { self.next(node) };
            let Some(sibling) = sibling else {
                continue;
            };
            if !sibling.lock().try_intent(owner) {
                continue;
            }

            let (dying, sib_live) = {
                let data = sibling.data();
                (data.is_dying(), data.live_u64s())
            };
            let combined = live + sib_live;
            if dying || combined > threshold || self.budget.alloc(1, ReserveLevel::Alloc).is_err() {
                node.data().set_sib_u64s(dir, combined);
                sibling.lock().unlock_intent(owner);
                continue;
            }

            self.merge(node, &sibling, dir, owner);
            sibling.lock().unlock_intent(owner);
            return true;
        }
        false
    }

    fn merge(&self, node: &Arc<Node>, sibling: &Arc<Node>, dir: usize, owner: u64) {
        let (left, right) = if dir == 0 { (sibling, node) } else { (node, sibling) };
        left.lock().lock_write(owner);
        right.lock().lock_write(owner);

        let mut keys = left.data().live_keys();
        keys.extend(right.data().live_keys());
        let merged = self.new_node((left.min(), right.max()), keys, &[left, right]);

        for old in [left, right] {
            old.data().set_dying();
            old.drop_pins();
        }
        self.replace(&[left, right], std::slice::from_ref(&merged));
        self.budget.free(2);
        right.lock().unlock_write(owner);
        left.lock().unlock_write(owner);

        self.io.journal.mark_roots_dirty();
        self.merges.fetch_add(1, Ordering::Relaxed);
        debug!(
            btree = %self.btree_id,
            left = %left.id(),
            right = %right.id(),
            merged = %merged.id(),
            "leaf merge"
        );
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("btree_id", &self.btree_id)
            .field("nodes", &self.nodes.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::test_io;

    const OWNER: u64 = 42;

    fn tree(keys: Vec<Key>, capacity: u64) -> (Tree, Arc<NodeBudget>) {
        let budget = Arc::new(NodeBudget::new(64, 2));
        (Tree::new(BtreeId::Inodes, keys, test_io(capacity), budget.clone()), budget)
    }

    fn keys(range: std::ops::Range<u64>) -> Vec<Key> {
        range.map(|i| Key::inline(Pos::new(1, i), vec![0u8; 8])).collect()
    }

    fn ranges(tree: &Tree) -> Vec<(Pos, Pos)> {
        tree.nodes().iter().map(|n| (n.min(), n.max())).collect()
    }

    #[test]
    fn empty_tree_has_placeholder_leaf() {
        let (tree, budget) = tree(Vec::new(), 64);
        let node = tree.lookup(Pos::new(5, 5));
        assert!(node.is_fake());
        assert_eq!(budget.live(), 0);
    }

    #[test]
    fn build_packs_keys_into_covering_leaves() {
        let (tree, budget) = tree(keys(0..30), 60);
        let ranges = ranges(&tree);
        assert!(ranges.len() > 1);
        assert_eq!(ranges[0].0, Pos::MIN);
        assert_eq!(ranges[ranges.len() - 1].1, Pos::MAX);
        assert_eq!(budget.live(), ranges.len());
        for i in 0..30 {
            let node = tree.lookup(Pos::new(1, i));
            assert!(node.data().get(Pos::new(1, i)).is_some());
        }
    }

    #[test]
    fn split_halves_a_full_leaf() {
        let (tree, budget) = tree(keys(0..10), 64);
        let node = tree.lookup(Pos::new(1, 0));
        assert!(node.lock().try_intent(OWNER));

        tree.split(&node, OWNER, ReserveLevel::Normal).unwrap();
        assert!(node.data().is_dying());
        node.lock().unlock_intent(OWNER);

        let ranges = ranges(&tree);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].1.successor(), ranges[1].0);
        assert_eq!(budget.live(), 2);
        assert_eq!(tree.splits(), 1);
        let total: usize = tree.nodes().iter().map(|n| n.data().live_keys().len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn split_of_placeholder_makes_real_leaf() {
        let (tree, budget) = tree(Vec::new(), 64);
        let fake = tree.lookup(Pos::MIN);
        assert!(fake.lock().try_intent(OWNER));
        tree.split(&fake, OWNER, ReserveLevel::Normal).unwrap();
        fake.lock().unlock_intent(OWNER);

        let node = tree.lookup(Pos::MIN);
        assert!(!node.is_fake());
        assert_eq!(node.capacity(), 64);
        assert_eq!(budget.live(), 1);
    }

    #[test]
    fn split_respects_node_budget() {
        let budget = Arc::new(NodeBudget::new(5, 2));
        let tree = Tree::new(BtreeId::Inodes, keys(0..10), test_io(64), budget.clone());
        let node = tree.lookup(Pos::new(1, 0));
        assert!(node.lock().try_intent(OWNER));

        assert!(matches!(
            tree.split(&node, OWNER, ReserveLevel::Normal),
            Err(CoreError::NoSpace)
        ));
        tree.split(&node, OWNER, ReserveLevel::Btree).unwrap();
        node.lock().unlock_intent(OWNER);
    }

    #[test]
    fn small_siblings_merge() {
        let (tree, budget) = tree(keys(0..30), 60);
        let before = tree.nodes().len();
        let node = tree.lookup(Pos::new(1, 0));
        assert!(node.lock().try_intent(OWNER));

        assert!(tree.maybe_merge(&node, OWNER, 1000));
        node.lock().unlock_intent(OWNER);
        assert_eq!(tree.nodes().len(), before - 1);
        assert_eq!(budget.live(), before - 1);
        assert_eq!(tree.merges(), 1);
        assert_eq!(tree.lookup(Pos::new(1, 0)).min(), Pos::MIN);
    }

    #[test]
    fn merge_skips_locked_sibling_and_big_pairs() {
        let (tree, _budget) = tree(keys(0..30), 60);
        let node = tree.lookup(Pos::new(1, 0));
        let next = tree.next(&node).unwrap();
        assert!(node.lock().try_intent(OWNER));
        assert!(next.lock().try_intent(7));
        assert!(!tree.maybe_merge(&node, OWNER, 1000));
        next.lock().unlock_intent(7);

        assert!(!tree.maybe_merge(&node, OWNER, 10));
        assert!(node.data().sib_u64s(1) > 10);
        node.lock().unlock_intent(OWNER);
    }
}

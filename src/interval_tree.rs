//! Treap-backed set of disjoint intervals, split across three forests.
//!
//! - `root`: regions the collector owns, not yet seen in the current GC pass
//! - `marked`: collector-owned regions that survived the current pass
//! - `unhandled`: regions the collector does not know about (stack slots,
//!   statics). They are always treated as live.
//!
//! Nodes live in an [`Arena`], so a node's [`NodeId`] is stable across every
//! split, merge and relocation. Callers use it as the identity of the value.
//! Priorities are random and only affect balance.

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    arena::{Arena, SlotId},
    error::ShadowError,
    interval::{Address, Interval, Shift},
};

pub type NodeId = SlotId;

pub trait Span {
    fn interval(&self) -> &Interval;
    fn interval_mut(&mut self) -> &mut Interval;
}

impl Span for Interval {
    fn interval(&self) -> &Interval {
        self
    }

    fn interval_mut(&mut self) -> &mut Interval {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forest {
    Root,
    Marked,
    UnhandledByGc,
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    priority: u32,
    left: Option<NodeId>,
    right: Option<NodeId>,
}

type Tree = Option<NodeId>;

pub struct IntervalTree<T> {
    nodes: Arena<Node<T>>,
    root: Tree,
    marked: Tree,
    unhandled: Tree,
    rng: StdRng,
}

impl<T: Span> Default for IntervalTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Span> IntervalTree<T> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Deterministic priorities, for reproducible replays and tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            nodes: Arena::new(),
            root: None,
            marked: None,
            unhandled: None,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.nodes.get(id).map(|node| &node.value)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.nodes.get_mut(id).map(|node| &mut node.value)
    }

    pub fn contains_id(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    fn tree(&self, forest: Forest) -> Tree {
        match forest {
            Forest::Root => self.root,
            Forest::Marked => self.marked,
            Forest::UnhandledByGc => self.unhandled,
        }
    }

    fn tree_mut(&mut self, forest: Forest) -> &mut Tree {
        match forest {
            Forest::Root => &mut self.root,
            Forest::Marked => &mut self.marked,
            Forest::UnhandledByGc => &mut self.unhandled,
        }
    }

    fn left_of(&self, id: NodeId) -> Address {
        self.nodes[id].value.interval().left
    }

    fn merge(&mut self, left: Tree, right: Tree) -> Tree {
        let (l, r) = match (left, right) {
            (None, tree) | (tree, None) => return tree,
            (Some(l), Some(r)) => (l, r),
        };
        if self.nodes[l].priority > self.nodes[r].priority {
            let l_right = self.nodes[l].right;
            let merged = self.merge(l_right, Some(r));
            self.nodes[l].right = merged;
            Some(l)
        } else {
            let r_left = self.nodes[r].left;
            let merged = self.merge(Some(l), r_left);
            self.nodes[r].left = merged;
            Some(r)
        }
    }

    /// Splits into nodes starting before `point` and nodes starting at or
    /// after it.
    fn split(&mut self, tree: Tree, point: Address) -> (Tree, Tree) {
        let Some(id) = tree else {
            return (None, None);
        };
        if self.left_of(id) >= point {
            let child = self.nodes[id].left;
            let (less, rest) = self.split(child, point);
            self.nodes[id].left = rest;
            (less, Some(id))
        } else {
            let child = self.nodes[id].right;
            let (rest, greater) = self.split(child, point);
            self.nodes[id].right = rest;
            (Some(id), greater)
        }
    }

    /// Detaches every node of `forest` starting inside `interval` and returns
    /// them as a standalone treap. The outer parts are merged back.
    fn cut_from_tree(&mut self, forest: Forest, interval: &Interval) -> Tree {
        let tree = self.tree(forest);
        let (before, rest) = self.split(tree, interval.left);
        let (inside, after) = match interval.right.checked_add(1) {
            Some(end) => self.split(rest, end),
            None => (rest, None),
        };
        let remaining = self.merge(before, after);
        *self.tree_mut(forest) = remaining;
        inside
    }

    fn add_to_tree(&mut self, forest: Forest, id: NodeId) {
        let tree = self.tree(forest);
        let left = self.left_of(id);
        let (less, greater) = self.split(tree, left);
        let with_node = self.merge(less, Some(id));
        let merged = self.merge(with_node, greater);
        *self.tree_mut(forest) = merged;
    }

    /// Splices a detached treap into `forest`. Its nodes must all fall
    /// between `at` and the next node of the forest.
    fn splice(&mut self, forest: Forest, subtree: Tree, at: Address) {
        let tree = self.tree(forest);
        let (less, greater) = self.split(tree, at);
        let with_subtree = self.merge(less, subtree);
        let merged = self.merge(with_subtree, greater);
        *self.tree_mut(forest) = merged;
    }

    pub fn add(&mut self, value: T) -> NodeId {
        let interval = value.interval();
        let forest = if !interval.is_handled_by_gc() {
            Forest::UnhandledByGc
        } else if interval.is_marked() {
            Forest::Marked
        } else {
            Forest::Root
        };
        let priority = self.rng.random::<u32>();
        let id = self.nodes.insert(Node {
            value,
            priority,
            left: None,
            right: None,
        });
        self.add_to_tree(forest, id);
        id
    }

    fn find_in_tree(&self, tree: Tree, point: Address) -> Option<NodeId> {
        let mut current = tree;
        while let Some(id) = current {
            let node = &self.nodes[id];
            let interval = node.value.interval();
            if interval.contains(point) {
                return Some(id);
            }
            current = if interval.left > point {
                node.left
            } else {
                node.right
            };
        }
        None
    }

    /// Looks `point` up in `root`, then `marked`, then the GC-exempt forest.
    pub fn find(&self, point: Address) -> Option<NodeId> {
        self.find_in_tree(self.root, point)
            .or_else(|| self.find_in_tree(self.marked, point))
            .or_else(|| self.find_in_tree(self.unhandled, point))
    }

    /// Which forest currently holds `id`.
    pub fn forest_of(&self, id: NodeId) -> Option<Forest> {
        let left = self.get(id)?.interval().left;
        [Forest::Root, Forest::Marked, Forest::UnhandledByGc]
            .into_iter()
            .find(|&forest| self.find_in_tree(self.tree(forest), left) == Some(id))
    }

    /// Any node of `tree` overlapping `interval`. Nodes in a forest are
    /// disjoint, so only the last one starting at or before `interval.right`
    /// can reach into it.
    fn overlapping_in_tree(&self, tree: Tree, interval: &Interval) -> Option<NodeId> {
        let mut current = tree;
        let mut candidate = None;
        while let Some(id) = current {
            let node = &self.nodes[id];
            if node.value.interval().left <= interval.right {
                candidate = Some(id);
                current = node.right;
            } else {
                current = node.left;
            }
        }
        candidate.filter(|&id| self.nodes[id].value.interval().right >= interval.left)
    }

    pub fn intersects_unhandled(&self, interval: &Interval) -> bool {
        self.overlapping_in_tree(self.unhandled, interval).is_some()
    }

    /// A node of any forest overlapping `interval`.
    pub fn overlapping(&self, interval: &Interval) -> Option<NodeId> {
        [Forest::Root, Forest::Marked, Forest::UnhandledByGc]
            .into_iter()
            .find_map(|forest| self.overlapping_in_tree(self.tree(forest), interval))
    }

    fn collect(&self, tree: Tree, out: &mut Vec<NodeId>) {
        let mut stack = Vec::new();
        let mut current = tree;
        loop {
            while let Some(id) = current {
                stack.push(id);
                current = self.nodes[id].left;
            }
            let Some(id) = stack.pop() else {
                break;
            };
            out.push(id);
            current = self.nodes[id].right;
        }
    }

    fn subtree_ids(&self, tree: Tree) -> Vec<NodeId> {
        let mut ids = Vec::new();
        self.collect(tree, &mut ids);
        ids
    }

    fn all_ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(self.len());
        self.collect(self.root, &mut ids);
        self.collect(self.marked, &mut ids);
        self.collect(self.unhandled, &mut ids);
        ids
    }

    /// The collector copied `interval` by `shift`. Every node starting inside
    /// it moves to its new address and is remembered as a survivor.
    pub fn move_and_mark(&mut self, interval: &Interval, shift: &Shift) -> Result<(), ShadowError> {
        if self.intersects_unhandled(interval) {
            return Err(ShadowError::UnhandledByGcMoved {
                left: interval.left,
                right: interval.right,
            });
        }
        let mut target = interval.clone();
        target.move_by(shift);
        if let Some(existing) = self.overlapping_in_tree(self.marked, &target) {
            let other = self.nodes[existing].value.interval();
            return Err(ShadowError::Overlap {
                first: (target.left, target.right),
                second: (other.left, other.right),
            });
        }

        let cut = self.cut_from_tree(Forest::Root, interval);
        for id in self.subtree_ids(cut) {
            let moved = self.nodes[id].value.interval_mut();
            moved.move_by(shift);
            moved.mark();
        }
        self.splice(Forest::Marked, cut, target.left);
        Ok(())
    }

    /// `interval` survived the current pass in place.
    pub fn mark(&mut self, interval: &Interval) -> Result<(), ShadowError> {
        if self.intersects_unhandled(interval) {
            return Err(ShadowError::UnhandledByGcMarked {
                left: interval.left,
                right: interval.right,
            });
        }
        if let Some(other) = self.overlapping_in_tree(self.marked, interval) {
            let other = self.nodes[other].value.interval();
            return Err(ShadowError::Overlap {
                first: (interval.left, interval.right),
                second: (other.left, other.right),
            });
        }
        let cut = self.cut_from_tree(Forest::Root, interval);
        for id in self.subtree_ids(cut) {
            self.nodes[id].value.interval_mut().mark();
        }
        self.splice(Forest::Marked, cut, interval.left);
        Ok(())
    }

    /// Sweeps the pass: everything still in `root` is dead and handed back,
    /// survivors are unmarked and become the new `root`. The GC-exempt
    /// forest is left alone.
    pub fn clear_unmarked(&mut self) -> Vec<(NodeId, T)> {
        let root = self.root.take();
        let dead = self.subtree_ids(root);
        let swept = dead
            .into_iter()
            .filter_map(|id| self.nodes.remove(id).map(|node| (id, node.value)))
            .collect();

        for id in self.subtree_ids(self.marked) {
            self.nodes[id].value.interval_mut().unmark();
        }
        self.root = self.marked.take();
        swept
    }

    /// Retires GC-exempt regions. Each id's range is cut out of the
    /// GC-exempt forest and every node inside it is released.
    pub fn delete_intervals(&mut self, ids: &[NodeId]) -> Vec<(NodeId, T)> {
        let mut deleted = Vec::with_capacity(ids.len());
        for &id in ids {
            let Some(interval) = self.get(id).map(|value| value.interval().clone()) else {
                log::warn!("Deleting interval {:?} that is no longer tracked", id);
                continue;
            };
            if interval.is_handled_by_gc() {
                log::warn!("Interval {} is owned by the collector, not deleting", interval);
                continue;
            }
            let cut = self.cut_from_tree(Forest::UnhandledByGc, &interval);
            for node_id in self.subtree_ids(cut) {
                if let Some(node) = self.nodes.remove(node_id) {
                    deleted.push((node_id, node.value));
                }
            }
        }
        deleted
    }

    /// Every node not announced yet, flagged as announced.
    pub fn flush(&mut self) -> Vec<NodeId> {
        let mut fresh = Vec::new();
        for id in self.all_ids() {
            let interval = self.nodes[id].value.interval_mut();
            if !interval.is_flushed() {
                interval.flush();
                fresh.push(id);
            }
        }
        fresh
    }

    /// All values, `root` first, then `marked`, then GC-exempt; each forest
    /// in address order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> {
        self.all_ids()
            .into_iter()
            .map(move |id| (id, &self.nodes[id].value))
    }

    /// Checks the treap key order of every forest and that no two tracked
    /// intervals overlap, within or across forests.
    pub fn check_disjoint(&self) -> Result<(), ShadowError> {
        let mut intervals = Vec::with_capacity(self.len());
        for forest in [Forest::Root, Forest::Marked, Forest::UnhandledByGc] {
            let ids = self.subtree_ids(self.tree(forest));
            for pair in ids.windows(2) {
                let (a, b) = (self.left_of(pair[0]), self.left_of(pair[1]));
                if a >= b {
                    log::error!("{:?} forest out of order: {:#x} before {:#x}", forest, a, b);
                    return Err(ShadowError::OutOfOrder {
                        before: a,
                        after: b,
                    });
                }
            }
            intervals.extend(ids.iter().map(|&id| self.nodes[id].value.interval()));
        }
        intervals.sort_by_key(|interval| interval.left);
        for pair in intervals.windows(2) {
            if pair[0].intersects(pair[1]) {
                return Err(ShadowError::Overlap {
                    first: (pair[0].left, pair[0].right),
                    second: (pair[1].left, pair[1].right),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> IntervalTree<Interval> {
        IntervalTree::with_seed(7)
    }

    fn exempt(left: Address, size: usize) -> Interval {
        let mut interval = Interval::new(left, size);
        interval.disable_gc();
        interval
    }

    #[test]
    fn test_add_and_find() {
        let mut tree = tree();
        let ids: Vec<_> = (0..64)
            .map(|i| tree.add(Interval::new(0x1000 + i * 0x20, 0x10)))
            .collect();
        assert_eq!(tree.len(), 64);

        for (i, &id) in ids.iter().enumerate() {
            let base = 0x1000 + i * 0x20;
            assert_eq!(tree.find(base), Some(id));
            assert_eq!(tree.find(base + 0xf), Some(id));
            assert_eq!(tree.find(base + 0x10), None);
        }
        assert_eq!(tree.find(0xfff), None);
        tree.check_disjoint().unwrap();
    }

    #[test]
    fn test_forest_placement() {
        let mut tree = tree();
        let heap = tree.add(Interval::new(0x1000, 8));
        let local = tree.add(exempt(0x7000, 8));
        let mut survivor = Interval::new(0x2000, 8);
        survivor.mark();
        let survivor = tree.add(survivor);

        assert_eq!(tree.forest_of(heap), Some(Forest::Root));
        assert_eq!(tree.forest_of(local), Some(Forest::UnhandledByGc));
        assert_eq!(tree.forest_of(survivor), Some(Forest::Marked));
        assert_eq!(tree.find(0x7004), Some(local));
    }

    #[test]
    fn test_mark_then_sweep() {
        let mut tree = tree();
        let ids: Vec<_> = (0..10)
            .map(|i| tree.add(Interval::new(0x1000 + i * 0x10, 0x10)))
            .collect();
        let local = tree.add(exempt(0x9000, 4));

        // survivors: objects 2..=4 and 7
        tree.mark(&Interval::from_bounds(0x1020, 0x104f)).unwrap();
        tree.mark(&Interval::new(0x1070, 0x10)).unwrap();

        let swept = tree.clear_unmarked();
        let swept_ids: Vec<_> = swept.iter().map(|(id, _)| *id).collect();
        assert_eq!(
            swept_ids,
            vec![ids[0], ids[1], ids[5], ids[6], ids[8], ids[9]]
        );
        for &id in &swept_ids {
            assert!(!tree.contains_id(id));
        }
        for i in [2, 3, 4, 7] {
            let found = tree.find(0x1000 + i * 0x10 + 3).unwrap();
            assert_eq!(found, ids[i]);
            assert_eq!(tree.forest_of(found), Some(Forest::Root));
            assert!(!tree.get(found).unwrap().is_marked());
        }
        assert_eq!(tree.find(0x1005), None);
        assert_eq!(tree.find(0x9000), Some(local));
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_move_and_mark_keeps_identity() {
        let mut tree = tree();
        let a = tree.add(Interval::new(0x1000, 0x10));
        let b = tree.add(Interval::new(0x1010, 0x20));
        let c = tree.add(Interval::new(0x1100, 0x10));

        tree.move_and_mark(&Interval::new(0x1000, 0x30), &Shift::new(0x1000, 0x5000))
            .unwrap();
        assert_eq!(tree.find(0x5000), Some(a));
        assert_eq!(tree.find(0x5015), Some(b));
        assert_eq!(tree.find(0x1005), None);
        assert_eq!(tree.forest_of(a), Some(Forest::Marked));
        assert_eq!(tree.forest_of(c), Some(Forest::Root));

        let swept = tree.clear_unmarked();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, c);
        assert_eq!(tree.get(b).unwrap(), &Interval::new(0x5010, 0x20));
        tree.check_disjoint().unwrap();
    }

    #[test]
    fn test_move_down_into_freed_space() {
        let mut tree = tree();
        let survivor = tree.add(Interval::new(0x3000, 0x10));
        let other = tree.add(Interval::new(0x1000, 0x10));
        tree.mark(&Interval::new(0x1000, 0x10)).unwrap();
        tree.move_and_mark(&Interval::new(0x3000, 0x10), &Shift::new(0x3000, 0x1010))
            .unwrap();

        assert_eq!(tree.find(0x1010), Some(survivor));
        assert_eq!(tree.find(0x1000), Some(other));
        assert!(tree.clear_unmarked().is_empty());
        tree.check_disjoint().unwrap();
    }

    #[test]
    fn test_moving_exempt_memory_is_rejected() {
        let mut tree = tree();
        let heap = tree.add(Interval::new(0x1000, 0x10));
        // GC-exempt region starts before the range but reaches into it
        let local = tree.add(exempt(0x0ff8, 0x10));

        let result = tree.move_and_mark(&Interval::new(0x1000, 0x10), &Shift::new(0x1000, 0x2000));
        assert!(matches!(result, Err(ShadowError::UnhandledByGcMoved { .. })));
        let result = tree.mark(&Interval::new(0x1000, 0x10));
        assert!(matches!(result, Err(ShadowError::UnhandledByGcMarked { .. })));

        // nothing was mutated
        assert_eq!(tree.forest_of(heap), Some(Forest::Root));
        assert_eq!(tree.forest_of(local), Some(Forest::UnhandledByGc));
    }

    #[test]
    fn test_moving_onto_survivor_is_rejected() {
        let mut tree = tree();
        tree.add(Interval::new(0x1000, 0x10));
        tree.add(Interval::new(0x2000, 0x10));
        tree.mark(&Interval::new(0x2000, 0x10)).unwrap();

        let result = tree.move_and_mark(&Interval::new(0x1000, 0x10), &Shift::new(0x1000, 0x2008));
        assert!(matches!(result, Err(ShadowError::Overlap { .. })));
        assert!(tree.find(0x1000).is_some());
    }

    #[test]
    fn test_marking_twice_is_rejected() {
        let mut tree = tree();
        let heap = tree.add(Interval::new(0x1000, 0x10));
        tree.mark(&Interval::new(0x1000, 0x10)).unwrap();

        let result = tree.mark(&Interval::new(0x1008, 0x10));
        assert!(matches!(
            result,
            Err(ShadowError::Overlap {
                first: (0x1008, 0x1017),
                second: (0x1000, 0x100f),
            })
        ));
        assert_eq!(tree.forest_of(heap), Some(Forest::Marked));
        tree.check_disjoint().unwrap();
    }

    #[test]
    fn test_overlapping_spans_all_forests() {
        let mut tree = tree();
        let heap = tree.add(Interval::new(0x1000, 0x10));
        let survivor = tree.add(Interval::new(0x2000, 0x10));
        tree.mark(&Interval::new(0x2000, 0x10)).unwrap();
        let local = tree.add(exempt(0x3000, 0x10));

        assert_eq!(tree.overlapping(&Interval::new(0x0ff8, 0x10)), Some(heap));
        assert_eq!(tree.overlapping(&Interval::new(0x200f, 1)), Some(survivor));
        assert_eq!(tree.overlapping(&Interval::new(0x2ff0, 0x20)), Some(local));
        assert_eq!(tree.overlapping(&Interval::new(0x1010, 0x10)), None);
    }

    #[test]
    fn test_delete_exempt_intervals() {
        let mut tree = tree();
        let first = tree.add(exempt(0x7000, 8));
        let second = tree.add(exempt(0x7010, 8));
        let heap = tree.add(Interval::new(0x1000, 8));

        let deleted = tree.delete_intervals(&[first, heap]);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].0, first);
        assert_eq!(tree.find(0x7000), None);
        assert_eq!(tree.find(0x7010), Some(second));
        assert_eq!(tree.find(0x1000), Some(heap));

        // already gone
        assert!(tree.delete_intervals(&[first]).is_empty());
    }

    #[test]
    fn test_flush_exactly_once() {
        let mut tree = tree();
        let a = tree.add(Interval::new(0x1000, 8));
        let b = tree.add(exempt(0x7000, 8));
        let flushed = tree.flush();
        assert_eq!(flushed, vec![a, b]);
        assert!(tree.flush().is_empty());

        let c = tree.add(Interval::new(0x2000, 8));
        assert_eq!(tree.flush(), vec![c]);
        assert!(tree.flush().is_empty());
    }

    #[test]
    fn test_check_disjoint_reports_overlap() {
        let mut tree = tree();
        tree.add(Interval::new(0x1000, 0x10));
        tree.add(exempt(0x100c, 4));
        assert!(matches!(
            tree.check_disjoint(),
            Err(ShadowError::Overlap { .. })
        ));
    }

    #[test]
    fn test_check_disjoint_reports_out_of_order() {
        let mut tree = tree();
        let first = tree.add(Interval::new(0x1000, 0x10));
        tree.add(Interval::new(0x2000, 0x10));
        tree.check_disjoint().unwrap();

        // disjoint, but stored at the wrong key
        let interval = &mut tree.nodes[first].value;
        interval.left = 0x3000;
        interval.right = 0x300f;
        assert!(matches!(
            tree.check_disjoint(),
            Err(ShadowError::OutOfOrder {
                before: 0x3000,
                after: 0x2000,
            })
        ));
    }

    #[test]
    fn test_iter_order() {
        let mut tree = tree();
        tree.add(exempt(0x50, 1));
        tree.add(Interval::new(0x30, 1));
        tree.add(Interval::new(0x10, 1));
        let lefts: Vec<_> = tree.iter().map(|(_, interval)| interval.left).collect();
        assert_eq!(lefts, vec![0x10, 0x30, 0x50]);
    }
}

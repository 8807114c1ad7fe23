//! # Augmented interval store
//!
//! An [`AreaStore`] holds pairwise disjoint, non-empty address intervals. It
//! keeps two views of the same set that must always agree:
//!
//! * a height-balanced (AVL) binary search tree keyed by start address, in
//!   which every node caches `subtree_max`: the largest interval size found
//!   anywhere in its subtree, itself included;
//! * a doubly linked list in ascending address order, giving O(1) access to
//!   a node's neighbors.
//!
//! The tree is what makes [`find_lowest_fit`](AreaStore::find_lowest_fit)
//! logarithmic: whole subtrees whose `subtree_max` is too small are skipped.
//! The list is what makes [`merge_or_insert`](AreaStore::merge_or_insert)
//! cheap: once the link position of a new interval is known, its two
//! possible merge partners are one hop away.
//!
//! Nodes live in an index arena. A [`NodeId`] stays valid until the node is
//! removed; rotations and removals relink nodes, they never move payloads.
//!
//! The same structure backs the Free, Busy and Purgatory stores. Keeping
//! `subtree_max` current in the stores that never search costs a few
//! comparisons per update and keeps a single code path.

use crate::error::{Violation, VmallocError};
use crate::range::{VaRange, align_up};
use crate::vm_area::VmAreaId;
use alloc::vec::Vec;
use core::cmp::max;

pub(crate) type NodeId = usize;

const NIL: NodeId = usize::MAX;

/// What a busy interval is used for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AreaOwner {
    /// Raw reservation, or an interval in the free or purgatory store.
    Unowned,
    /// Backing range of a per-worker block.
    Block,
    /// Backing range of a described VM area.
    VmArea(VmAreaId),
}

/// An interval together with its owner tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VmapArea {
    pub range: VaRange,
    pub owner: AreaOwner,
}

impl VmapArea {
    #[must_use]
    pub const fn unowned(range: VaRange) -> Self {
        Self {
            range,
            owner: AreaOwner::Unowned,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Side {
    Left,
    Right,
}

struct Node {
    area: VmapArea,
    subtree_max: u64,
    height: u32,
    parent: NodeId,
    left: NodeId,
    right: NodeId,
    prev: NodeId,
    next: NodeId,
}

impl Node {
    const fn new(area: VmapArea) -> Self {
        Self {
            area,
            subtree_max: area.range.size(),
            height: 1,
            parent: NIL,
            left: NIL,
            right: NIL,
            prev: NIL,
            next: NIL,
        }
    }
}

pub(crate) struct AreaStore {
    nodes: Vec<Node>,
    vacant: Vec<NodeId>,
    root: NodeId,
    head: NodeId,
    tail: NodeId,
    len: usize,
    bytes: u64,
}

impl Default for AreaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AreaStore {
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            vacant: Vec::new(),
            root: NIL,
            head: NIL,
            tail: NIL,
            len: 0,
            bytes: 0,
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sum of the sizes of all intervals.
    #[inline]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    #[inline]
    pub fn area(&self, id: NodeId) -> &VmapArea {
        &self.nodes[id].area
    }

    pub fn first(&self) -> Option<&VmapArea> {
        (self.head != NIL).then(|| self.area(self.head))
    }

    pub fn last(&self) -> Option<&VmapArea> {
        (self.tail != NIL).then(|| self.area(self.tail))
    }

    /// Largest interval size in the whole store.
    pub fn max_size(&self) -> u64 {
        self.sm(self.root)
    }

    /// Intervals in ascending address order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            store: self,
            cur: self.head,
        }
    }

    /// Node whose interval contains `addr`.
    pub fn find_enclosing(&self, addr: u64) -> Option<NodeId> {
        let mut cur = self.root;
        while cur != NIL {
            let node = &self.nodes[cur];
            if addr < node.area.range.start {
                cur = node.left;
            } else if addr >= node.area.range.end {
                cur = node.right;
            } else {
                return Some(cur);
            }
        }
        None
    }

    /// Node whose interval starts exactly at `addr`.
    pub fn find_exact(&self, addr: u64) -> Option<NodeId> {
        self.find_enclosing(addr)
            .filter(|&id| self.nodes[id].area.range.start == addr)
    }

    /// Insert without merging.
    pub fn insert(&mut self, area: VmapArea) -> Result<NodeId, VmallocError> {
        let (parent, side) = self.find_link(area.range)?;
        Ok(self.link(area, parent, side))
    }

    /// Insert `area`, coalescing with touching neighbors.
    ///
    /// Returns the node now holding `area`'s addresses and how many interval
    /// objects were retired by merging (the caller returns that many units to
    /// the area cache). The successor is tried before the predecessor; when
    /// both touch, the successor node is retired too.
    pub fn merge_or_insert(&mut self, area: VmapArea) -> Result<(NodeId, usize), VmallocError> {
        let (parent, side) = self.find_link(area.range)?;
        let (prev, next) = match (parent, side) {
            (NIL, _) => (NIL, NIL),
            (p, Side::Left) => (self.nodes[p].prev, p),
            (p, Side::Right) => (p, self.nodes[p].next),
        };

        let mut merged = NIL;
        let mut retired = 0;

        if next != NIL && self.nodes[next].area.range.start == area.range.end {
            let end = self.nodes[next].area.range.end;
            self.set_range(next, VaRange::new(area.range.start, end));
            merged = next;
            retired += 1;
        }

        if prev != NIL && self.nodes[prev].area.range.end == area.range.start {
            let end = if merged == NIL {
                area.range.end
            } else {
                self.remove(merged).range.end
            };
            let start = self.nodes[prev].area.range.start;
            self.set_range(prev, VaRange::new(start, end));
            merged = prev;
            retired += 1;
        }

        if merged == NIL {
            Ok((self.link(area, parent, side), 0))
        } else {
            Ok((merged, retired))
        }
    }

    /// Unlink `id` and return its interval.
    pub fn remove(&mut self, id: NodeId) -> VmapArea {
        let Node {
            area,
            left,
            right,
            prev,
            next,
            parent,
            ..
        } = self.nodes[id];

        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }

        let fix_from = if left == NIL || right == NIL {
            let child = if left == NIL { right } else { left };
            self.replace_child(parent, id, child);
            parent
        } else {
            // Both children present: the in-order successor is the list
            // successor, the leftmost node of the right subtree.
            let succ = next;
            let succ_parent = self.nodes[succ].parent;
            let fix_from = if succ_parent == id {
                succ
            } else {
                let succ_right = self.nodes[succ].right;
                self.nodes[succ_parent].left = succ_right;
                if succ_right != NIL {
                    self.nodes[succ_right].parent = succ_parent;
                }
                self.nodes[succ].right = right;
                self.nodes[right].parent = succ;
                succ_parent
            };
            self.nodes[succ].left = left;
            self.nodes[left].parent = succ;
            self.replace_child(parent, id, succ);
            fix_from
        };

        self.free_node(id);
        self.len -= 1;
        self.bytes -= area.range.size();
        self.fixup(fix_from);
        area
    }

    /// Change the bounds of `id` in place.
    ///
    /// The new range must keep the node between its list neighbors.
    pub fn set_range(&mut self, id: NodeId, range: VaRange) {
        debug_assert!(!range.is_empty());
        debug_assert!(self.fits_between_neighbors(id, range));
        let old = self.nodes[id].area.range;
        self.nodes[id].area.range = range;
        self.bytes = self.bytes - old.size() + range.size();
        self.fixup(id);
    }

    /// Lowest-addressed node able to host `size` bytes at `align` at or
    /// above `vstart`.
    ///
    /// `search` is the size used to prune subtrees via `subtree_max`; it is
    /// at least `size` and accounts for alignment slack.
    pub fn find_lowest_fit(&self, size: u64, align: u64, vstart: u64, search: u64) -> Option<NodeId> {
        let mut node = self.root;
        while node != NIL {
            let n = &self.nodes[node];
            if self.sm(n.left) >= search && vstart < n.area.range.start {
                node = n.left;
                continue;
            }
            if is_within(n.area.range, size, align, vstart) {
                return Some(node);
            }
            if self.sm(n.right) >= search {
                node = n.right;
                continue;
            }

            // Dead end: climb until an ancestor reached from its left side
            // either fits or has a promising right subtree.
            loop {
                let child = node;
                node = self.nodes[node].parent;
                if node == NIL {
                    return None;
                }
                let n = &self.nodes[node];
                if n.right == child {
                    continue;
                }
                if is_within(n.area.range, size, align, vstart) {
                    return Some(node);
                }
                if self.sm(n.right) >= search {
                    node = n.right;
                    break;
                }
            }
        }
        None
    }

    /// Remove every interval, returning them in address order.
    pub fn drain(&mut self) -> Vec<VmapArea> {
        let out = self.iter().copied().collect();
        *self = Self::new();
        out
    }

    /// Re-derive every cached property and compare.
    pub fn check_invariants(&self) -> Result<(), VmallocError> {
        let mut in_order = Vec::with_capacity(self.len);
        if self.root != NIL {
            if self.nodes[self.root].parent != NIL {
                return Err(self.order_mismatch(self.root));
            }
            self.verify_subtree(self.root, &mut in_order)?;
        }

        let mut cur = self.head;
        let mut prev = NIL;
        let mut bytes = 0u64;
        for &expected in &in_order {
            if cur != expected || self.nodes[cur].prev != prev {
                return Err(self.order_mismatch(expected));
            }
            let range = self.nodes[cur].area.range;
            if range.is_empty() {
                return Err(self.order_mismatch(cur));
            }
            if prev != NIL && self.nodes[prev].area.range.end > range.start {
                return Err(Violation::Overlap {
                    new: range,
                    existing: self.nodes[prev].area.range,
                }
                .into());
            }
            bytes += range.size();
            prev = cur;
            cur = self.nodes[cur].next;
        }
        if cur != NIL || self.tail != prev {
            return Err(self.order_mismatch(prev));
        }
        if in_order.len() != self.len || bytes != self.bytes {
            return Err(Violation::Accounting {
                expected: self.bytes,
                actual: bytes,
            }
            .into());
        }
        Ok(())
    }

    fn verify_subtree(&self, id: NodeId, out: &mut Vec<NodeId>) -> Result<(u64, u32), VmallocError> {
        let node = &self.nodes[id];
        let mut max_size = node.area.range.size();
        let mut heights = [0u32; 2];

        for (slot, child) in [node.left, node.right].into_iter().enumerate() {
            if child == NIL {
                if slot == 0 {
                    out.push(id);
                }
                continue;
            }
            if self.nodes[child].parent != id {
                return Err(self.order_mismatch(child));
            }
            let (child_max, child_height) = self.verify_subtree(child, out)?;
            max_size = max(max_size, child_max);
            heights[slot] = child_height;
            if slot == 0 {
                out.push(id);
            }
        }

        if node.subtree_max != max_size {
            return Err(Violation::AugmentMismatch {
                area: node.area.range,
                cached: node.subtree_max,
                actual: max_size,
            }
            .into());
        }
        let height = 1 + max(heights[0], heights[1]);
        if node.height != height || heights[0].abs_diff(heights[1]) > 1 {
            return Err(Violation::Unbalanced {
                area: node.area.range,
            }
            .into());
        }
        Ok((max_size, height))
    }

    fn order_mismatch(&self, id: NodeId) -> VmallocError {
        let area = if id == NIL {
            VaRange::default()
        } else {
            self.nodes[id].area.range
        };
        Violation::OrderMismatch { area }.into()
    }

    fn fits_between_neighbors(&self, id: NodeId, range: VaRange) -> bool {
        let node = &self.nodes[id];
        (node.prev == NIL || self.nodes[node.prev].area.range.end <= range.start)
            && (node.next == NIL || range.end <= self.nodes[node.next].area.range.start)
    }

    /// Where a new `range` would be attached.
    fn find_link(&self, range: VaRange) -> Result<(NodeId, Side), VmallocError> {
        debug_assert!(!range.is_empty());
        let mut parent = NIL;
        let mut side = Side::Left;
        let mut cur = self.root;
        while cur != NIL {
            let existing = self.nodes[cur].area.range;
            parent = cur;
            if range.end <= existing.start {
                side = Side::Left;
                cur = self.nodes[cur].left;
            } else if range.start >= existing.end {
                side = Side::Right;
                cur = self.nodes[cur].right;
            } else {
                log::error!("vmalloc: {range} overlaps with {existing}");
                return Err(Violation::Overlap {
                    new: range,
                    existing,
                }
                .into());
            }
        }
        Ok((parent, side))
    }

    fn link(&mut self, area: VmapArea, parent: NodeId, side: Side) -> NodeId {
        let id = self.alloc_node(area);
        self.nodes[id].parent = parent;

        if parent == NIL {
            self.root = id;
            self.head = id;
            self.tail = id;
        } else {
            match side {
                Side::Left => {
                    // A new left leaf directly precedes its parent.
                    let prev = self.nodes[parent].prev;
                    self.nodes[parent].left = id;
                    self.nodes[id].prev = prev;
                    self.nodes[id].next = parent;
                    self.nodes[parent].prev = id;
                    if prev == NIL {
                        self.head = id;
                    } else {
                        self.nodes[prev].next = id;
                    }
                }
                Side::Right => {
                    let next = self.nodes[parent].next;
                    self.nodes[parent].right = id;
                    self.nodes[id].prev = parent;
                    self.nodes[id].next = next;
                    self.nodes[parent].next = id;
                    if next == NIL {
                        self.tail = id;
                    } else {
                        self.nodes[next].prev = id;
                    }
                }
            }
        }

        self.len += 1;
        self.bytes += area.range.size();
        self.fixup(parent);
        id
    }

    fn alloc_node(&mut self, area: VmapArea) -> NodeId {
        if let Some(id) = self.vacant.pop() {
            self.nodes[id] = Node::new(area);
            id
        } else {
            self.nodes.push(Node::new(area));
            self.nodes.len() - 1
        }
    }

    fn free_node(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        node.parent = NIL;
        node.left = NIL;
        node.right = NIL;
        node.prev = NIL;
        node.next = NIL;
        self.vacant.push(id);
    }

    #[inline]
    fn height(&self, id: NodeId) -> u32 {
        if id == NIL { 0 } else { self.nodes[id].height }
    }

    #[inline]
    fn sm(&self, id: NodeId) -> u64 {
        if id == NIL {
            0
        } else {
            self.nodes[id].subtree_max
        }
    }

    fn update(&mut self, id: NodeId) {
        let (left, right) = (self.nodes[id].left, self.nodes[id].right);
        let height = 1 + max(self.height(left), self.height(right));
        let subtree_max = max(
            self.nodes[id].area.range.size(),
            max(self.sm(left), self.sm(right)),
        );
        let node = &mut self.nodes[id];
        node.height = height;
        node.subtree_max = subtree_max;
    }

    fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) {
        if parent == NIL {
            self.root = new;
        } else if self.nodes[parent].left == old {
            self.nodes[parent].left = new;
        } else {
            self.nodes[parent].right = new;
        }
        if new != NIL {
            self.nodes[new].parent = parent;
        }
    }

    fn rotate_left(&mut self, x: NodeId) -> NodeId {
        let y = self.nodes[x].right;
        let inner = self.nodes[y].left;
        let parent = self.nodes[x].parent;

        self.nodes[x].right = inner;
        if inner != NIL {
            self.nodes[inner].parent = x;
        }
        self.replace_child(parent, x, y);
        self.nodes[y].left = x;
        self.nodes[x].parent = y;

        self.update(x);
        self.update(y);
        y
    }

    fn rotate_right(&mut self, x: NodeId) -> NodeId {
        let y = self.nodes[x].left;
        let inner = self.nodes[y].right;
        let parent = self.nodes[x].parent;

        self.nodes[x].left = inner;
        if inner != NIL {
            self.nodes[inner].parent = x;
        }
        self.replace_child(parent, x, y);
        self.nodes[y].right = x;
        self.nodes[x].parent = y;

        self.update(x);
        self.update(y);
        y
    }

    /// Restore height, balance and `subtree_max` of `id`; returns the root
    /// of the (possibly rotated) subtree.
    fn balance(&mut self, id: NodeId) -> NodeId {
        self.update(id);
        let (left, right) = (self.nodes[id].left, self.nodes[id].right);
        let (hl, hr) = (self.height(left), self.height(right));

        if hl > hr + 1 {
            if self.height(self.nodes[left].left) < self.height(self.nodes[left].right) {
                self.rotate_left(left);
            }
            self.rotate_right(id)
        } else if hr > hl + 1 {
            if self.height(self.nodes[right].right) < self.height(self.nodes[right].left) {
                self.rotate_right(right);
            }
            self.rotate_left(id)
        } else {
            id
        }
    }

    /// Rebalance and re-augment every node from `id` up to the root.
    fn fixup(&mut self, mut id: NodeId) {
        while id != NIL {
            let top = self.balance(id);
            id = self.nodes[top].parent;
        }
    }
}

/// Whether `range` can host `size` bytes aligned to `align`, at or above
/// `vstart`.
pub(crate) fn is_within(range: VaRange, size: u64, align: u64, vstart: u64) -> bool {
    let base = max(range.start, vstart);
    align_up(base, align)
        .and_then(|nva| nva.checked_add(size))
        .is_some_and(|end| end <= range.end)
}

/// How a chosen address sits inside the free interval that hosts it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum FitType {
    /// The request consumes the whole interval.
    Full,
    /// Shares the interval's start; the tail stays free.
    LeftEdge,
    /// Shares the interval's end; the head stays free.
    RightEdge,
    /// Strictly inside; the interval splits in two.
    Interior,
}

impl FitType {
    pub fn classify(va: VaRange, nva: u64, size: u64) -> Option<Self> {
        let end = nva.checked_add(size)?;
        if nva < va.start || end > va.end {
            return None;
        }
        Some(match (va.start == nva, va.end == end) {
            (true, true) => Self::Full,
            (true, false) => Self::LeftEdge,
            (false, true) => Self::RightEdge,
            (false, false) => Self::Interior,
        })
    }
}

pub(crate) struct Iter<'a> {
    store: &'a AreaStore,
    cur: NodeId,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a VmapArea;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == NIL {
            return None;
        }
        let node = &self.store.nodes[self.cur];
        self.cur = node.next;
        Some(&node.area)
    }
}

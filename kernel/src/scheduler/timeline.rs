//! Timeline - ordered ready structure for the Fair and Deadline classes
//!
//! A red-black tree (intrusive-collections `RBTree`) of boxed nodes keyed by
//! `(key, insertion sequence)`. Fair keys by vruntime, Deadline by absolute
//! deadline. The sequence number makes every key unique and breaks ties in
//! insertion order, so equal keys leave in FIFO order.
//!
//! The leftmost entry is cached and recomputed from the tree after every
//! insert/remove instead of being patched incrementally.

use alloc::boxed::Box;

use intrusive_collections::{intrusive_adapter, KeyAdapter, RBTree, RBTreeLink};

use crate::scheduler::thread::TaskId;

/// Position of an entity in a [`Timeline`]; doubles as its node handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimelineKey {
    /// vruntime or absolute deadline
    pub key: u64,
    seq: u64,
}

struct TimelineNode {
    link: RBTreeLink,
    key: TimelineKey,
    task: TaskId,
}

intrusive_adapter!(TimelineAdapter = Box<TimelineNode>: TimelineNode { link: RBTreeLink });

impl<'a> KeyAdapter<'a> for TimelineAdapter {
    type Key = TimelineKey;

    fn get_key(&self, node: &'a TimelineNode) -> TimelineKey {
        node.key
    }
}

/// Ordered set of queued tasks with a cached minimum
pub struct Timeline {
    tree: RBTree<TimelineAdapter>,
    leftmost: Option<(TimelineKey, TaskId)>,
    next_seq: u64,
    len: usize,
}

impl Timeline {
    pub fn new() -> Self {
        Self {
            tree: RBTree::new(TimelineAdapter::new()),
            leftmost: None,
            next_seq: 0,
            len: 0,
        }
    }

    /// Insert `task` at `key`; returns the handle needed to remove it
    pub fn insert(&mut self, key: u64, task: TaskId) -> TimelineKey {
        let handle = TimelineKey { key, seq: self.next_seq };
        self.next_seq = self.next_seq.wrapping_add(1);
        self.tree.insert(Box::new(TimelineNode {
            link: RBTreeLink::new(),
            key: handle,
            task,
        }));
        self.len += 1;
        self.refresh_leftmost();
        handle
    }

    /// Remove the node at `handle`, if present
    pub fn remove(&mut self, handle: &TimelineKey) -> Option<TaskId> {
        let node = self.tree.find_mut(handle).remove()?;
        self.len -= 1;
        self.refresh_leftmost();
        Some(node.task)
    }

    /// Cached minimum entry
    pub fn leftmost(&self) -> Option<(TimelineKey, TaskId)> {
        self.leftmost
    }

    /// In-order walk, starting at the leftmost entry
    pub fn iter(&self) -> impl Iterator<Item = (TimelineKey, TaskId)> + '_ {
        self.tree.iter().map(|node| (node.key, node.task))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn refresh_leftmost(&mut self) {
        self.leftmost = self.tree.front().get().map(|node| (node.key, node.task));
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

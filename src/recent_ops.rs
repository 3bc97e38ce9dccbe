use std::collections::VecDeque;

use crate::model::Operation;

/// Default number of operations kept per user.
pub const DEFAULT_CAPACITY: usize = 10;

/// Bounded log of a user's most recent operations, newest first.
/// Appending beyond capacity evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct RecentOps {
    ops: VecDeque<Operation>,
    capacity: usize,
}

impl RecentOps {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ops: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, op: Operation) {
        if self.ops.len() == self.capacity {
            self.ops.pop_back();
        }
        self.ops.push_front(op);
    }

    /// Copy of the log, newest first.
    pub fn snapshot(&self) -> Vec<Operation> {
        self.ops.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl Default for RecentOps {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

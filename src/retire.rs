//! Deferred release of GPU objects until the fence proves they are unused.

use crate::gpu::{DescriptorSlot, ResourceId};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retiree {
    /// Fence value of the last frame that may reference the objects.
    pub fence_value: u64,
    pub resources: Vec<ResourceId>,
    pub slot: Option<DescriptorSlot>,
    /// Upload memory released with this entry, in bytes.
    pub staging_bytes: u64,
}

#[derive(Debug, Default)]
pub struct RetirementQueue {
    entries: VecDeque<Retiree>,
}

impl RetirementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fence values pushed must be non-decreasing.
    pub fn push(&mut self, retiree: Retiree) {
        debug_assert!(
            self.entries
                .back()
                .is_none_or(|last| last.fence_value <= retiree.fence_value)
        );
        self.entries.push_back(retiree);
    }

    /// Removes every entry whose fence value has been reached.
    pub fn collect(&mut self, completed: u64) -> Vec<Retiree> {
        let mut ready = Vec::new();
        while self.entries.front().is_some_and(|e| e.fence_value <= completed) {
            if let Some(entry) = self.entries.pop_front() {
                ready.push(entry);
            }
        }
        ready
    }

    pub fn drain_all(&mut self) -> Vec<Retiree> {
        self.entries.drain(..).collect()
    }

    pub fn staging_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.staging_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retiree(fence_value: u64, id: u64) -> Retiree {
        Retiree {
            fence_value,
            resources: vec![ResourceId(id)],
            slot: None,
            staging_bytes: 100,
        }
    }

    #[test]
    fn collects_only_completed_entries_in_order() {
        let mut queue = RetirementQueue::new();
        queue.push(retiree(1, 10));
        queue.push(retiree(2, 20));
        queue.push(retiree(2, 21));
        queue.push(retiree(4, 40));
        assert_eq!(queue.staging_bytes(), 400);

        assert!(queue.collect(0).is_empty());
        let ready = queue.collect(2);
        let ids: Vec<_> = ready.iter().map(|r| r.resources[0]).collect();
        assert_eq!(ids, vec![ResourceId(10), ResourceId(20), ResourceId(21)]);
        assert_eq!(queue.staging_bytes(), 100);

        assert_eq!(queue.drain_all(), vec![retiree(4, 40)]);
        assert_eq!(queue.staging_bytes(), 0);
    }
}

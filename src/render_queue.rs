//! FIFO of deferred GPU work, drained once per frame on the open command list.

use std::collections::VecDeque;

/// Two-phase queue: producers append to `pending`; a drain promotes pending
/// work into `active` and pops it front to back.
pub struct RenderQueue<C> {
    pending: Vec<C>,
    active: VecDeque<C>,
}

impl<C> RenderQueue<C> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            active: VecDeque::new(),
        }
    }

    pub fn push(&mut self, command: C) {
        self.pending.push(command);
    }

    /// Moves pending commands behind whatever is already active.
    pub fn promote(&mut self) {
        self.active.extend(self.pending.drain(..));
    }

    /// Next command to run, promoting pending work once the active queue is
    /// empty so commands queued mid-drain still run in enqueue order.
    pub fn next(&mut self) -> Option<C> {
        if self.active.is_empty() {
            self.promote();
        }
        self.active.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C> Default for RenderQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

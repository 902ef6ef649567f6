use crate::gpu::FRAME_COUNT;

/// Phase of the per-frame state machine driven by `GraphicsDevice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    PreRendering,
    Recording,
    Presenting,
}

/// Tracks the fence value each command allocator was last submitted with.
///
/// An allocator may only be reset once the fence has reached
/// [`FramePacer::required_for`] for it.
#[derive(Debug)]
pub struct FramePacer {
    fence_values: [u64; FRAME_COUNT],
    next_value: u64,
    last_submitted: u64,
}

impl FramePacer {
    pub fn new() -> Self {
        Self {
            fence_values: [0; FRAME_COUNT],
            next_value: 1,
            last_submitted: 0,
        }
    }

    pub fn required_for(&self, allocator: usize) -> u64 {
        self.fence_values[allocator % FRAME_COUNT]
    }

    /// Value the currently recording frame will signal when submitted.
    pub fn pending_value(&self) -> u64 {
        self.next_value
    }

    pub fn last_submitted(&self) -> u64 {
        self.last_submitted
    }

    /// Claims the next fence value for work recorded on `allocator`.
    pub fn submit(&mut self, allocator: usize) -> u64 {
        let value = self.next_value;
        self.fence_values[allocator % FRAME_COUNT] = value;
        self.last_submitted = value;
        self.next_value += 1;
        value
    }
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submissions_are_monotonic_per_allocator() {
        let mut pacer = FramePacer::new();
        assert_eq!(pacer.required_for(0), 0);
        assert_eq!(pacer.pending_value(), 1);
        assert_eq!(pacer.submit(0), 1);
        assert_eq!(pacer.submit(1), 2);
        assert_eq!(pacer.submit(0), 3);
        assert_eq!(pacer.required_for(0), 3);
        assert_eq!(pacer.required_for(1), 2);
        assert_eq!(pacer.last_submitted(), 3);
        assert_eq!(pacer.pending_value(), 4);
    }
}

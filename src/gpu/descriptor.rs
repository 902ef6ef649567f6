//! Free-list allocator over the shader-visible descriptor heap.

use super::{CpuDescriptorHandle, GpuDescriptorHandle, HeapInfo};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor heap exhausted ({capacity} slots in use)")]
    Exhausted { capacity: u32 },
    #[error("descriptor slot {0} freed twice")]
    DoubleFree(u32),
    #[error("descriptor handle does not belong to this heap")]
    ForeignHandle,
    #[error("descriptor heap has a zero handle increment")]
    ZeroIncrement,
}

/// A CPU/GPU handle pair naming one slot of the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSlot {
    pub cpu: CpuDescriptorHandle,
    pub gpu: GpuDescriptorHandle,
}

pub struct DescriptorHeapAllocator {
    heap: HeapInfo,
    free: Vec<u32>,
    live: Vec<bool>,
}

impl DescriptorHeapAllocator {
    pub fn new(heap: HeapInfo) -> Result<Self, DescriptorError> {
        if heap.increment == 0 {
            return Err(DescriptorError::ZeroIncrement);
        }
        // Reversed so the first allocations hand out 0, 1, 2, ...
        let free = (0..heap.capacity).rev().collect();
        Ok(Self {
            heap,
            free,
            live: vec![false; heap.capacity as usize],
        })
    }

    pub fn alloc(&mut self) -> Result<DescriptorSlot, DescriptorError> {
        let index = self.free.pop().ok_or(DescriptorError::Exhausted {
            capacity: self.heap.capacity,
        })?;
        self.live[index as usize] = true;
        Ok(self.slot(index))
    }

    pub fn free(&mut self, slot: DescriptorSlot) -> Result<(), DescriptorError> {
        let index = self.index_of(slot)?;
        if !self.is_live(index) {
            return Err(DescriptorError::DoubleFree(index));
        }
        self.live[index as usize] = false;
        self.free.push(index);
        Ok(())
    }

    /// Recovers the slot index from both handles and checks they agree.
    pub fn index_of(&self, slot: DescriptorSlot) -> Result<u32, DescriptorError> {
        let increment = self.heap.increment as u64;
        let cpu_offset = (slot.cpu.0 as u64)
            .checked_sub(self.heap.cpu_start.0 as u64)
            .ok_or(DescriptorError::ForeignHandle)?;
        let gpu_offset = slot
            .gpu
            .0
            .checked_sub(self.heap.gpu_start.0)
            .ok_or(DescriptorError::ForeignHandle)?;
        if cpu_offset % increment != 0 || gpu_offset % increment != 0 {
            return Err(DescriptorError::ForeignHandle);
        }
        let cpu_index = cpu_offset / increment;
        if cpu_index != gpu_offset / increment || cpu_index >= self.heap.capacity as u64 {
            return Err(DescriptorError::ForeignHandle);
        }
        Ok(cpu_index as u32)
    }

    fn slot(&self, index: u32) -> DescriptorSlot {
        let offset = index as u64 * self.heap.increment as u64;
        DescriptorSlot {
            cpu: CpuDescriptorHandle(self.heap.cpu_start.0 + offset as usize),
            gpu: GpuDescriptorHandle(self.heap.gpu_start.0 + offset),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.heap.capacity
    }

    pub fn free_count(&self) -> u32 {
        self.free.len() as u32
    }

    pub fn is_live(&self, index: u32) -> bool {
        self.live.get(index as usize).copied().unwrap_or(false)
    }
}

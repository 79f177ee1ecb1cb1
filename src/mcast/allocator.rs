//! Free-list allocator for the overflow region of the multicast table.
//!
//! Slot numbers are relative to the start of the overflow region; the manager adds the number of
//! hash bins to turn them into absolute table indices.

use std::collections::TryReserveError;

/// A fixed-size pool of slot numbers in `[0, capacity)` with O(1) allocate and free.
#[derive(Debug)]
pub struct FreeListAllocator {
    /// Stack of free slots, the next one to hand out on top.
    free: Vec<u32>,
    allocated: Vec<bool>,
}

impl FreeListAllocator {
    /// Create an allocator with every slot in `[0, capacity)` free.
    ///
    /// Fails only if the bookkeeping for `capacity` slots cannot be reserved.
    pub fn new(capacity: u32) -> Result<Self, TryReserveError> {
        let len = capacity as usize;
        let mut free = Vec::new();
        free.try_reserve_exact(len)?;
        let mut allocated = Vec::new();
        allocated.try_reserve_exact(len)?;

        // lowest slot on top of the stack
        free.extend((0..capacity).rev());
        allocated.resize(len, false);

        Ok(FreeListAllocator { free, allocated })
    }

    /// Take any free slot, or `None` when the pool is exhausted.
    pub fn allocate(&mut self) -> Option<u32> {
        let slot = self.free.pop()?;
        self.allocated[slot as usize] = true;
        Some(slot)
    }

    /// Return `slot` to the pool.
    ///
    /// The slot must currently be allocated; anything else is a caller bug.
    pub fn free(&mut self, slot: u32) {
        debug_assert!(
            self.is_allocated(slot),
            "freeing overflow slot {slot} which is not allocated"
        );
        self.allocated[slot as usize] = false;
        self.free.push(slot);
    }

    pub fn is_allocated(&self, slot: u32) -> bool {
        self.allocated.get(slot as usize).copied().unwrap_or(false)
    }

    pub fn capacity(&self) -> u32 {
        self.allocated.len() as u32
    }

    /// Number of slots that can still be allocated.
    pub fn available(&self) -> u32 {
        self.free.len() as u32
    }
}

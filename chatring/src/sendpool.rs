/// Pool of library-owned slots for sends whose bytes do not live in a
/// recv slot: ACK/ERROR/NOTIFICATION frames and re-framed records
/// assembled in an accumulator.
///
/// The data is copied into a slot so the SQE points at memory owned by
/// the pool; the slot is released on the send CQE. Slot indices travel
/// in the WRITE context with [`crate::completion::COPY_SLOT_BIT`] set.
pub struct SendCopyPool {
    backing: Vec<u8>,
    slot_size: u32,
    free_list: Vec<u16>,
    in_use: Vec<bool>,
}

impl SendCopyPool {
    /// Create a new pool with `count` slots, each `slot_size` bytes.
    pub fn new(count: u16, slot_size: u32) -> Self {
        let backing = vec![0u8; count as usize * slot_size as usize];
        let free_list: Vec<u16> = (0..count).rev().collect();
        SendCopyPool {
            backing,
            slot_size,
            free_list,
            in_use: vec![false; count as usize],
        }
    }

    /// Allocate a slot, copy `data` into it, and return (slot, ptr).
    /// Returns `None` if no slots are free or data exceeds the slot size.
    pub fn copy_in(&mut self, data: &[u8]) -> Option<(u16, *const u8)> {
        if data.len() > self.slot_size as usize {
            return None;
        }
        let idx = self.free_list.pop()?;
        let offset = idx as usize * self.slot_size as usize;
        self.backing[offset..offset + data.len()].copy_from_slice(data);
        self.in_use[idx as usize] = true;
        Some((idx, self.backing.as_ptr().wrapping_add(offset)))
    }

    /// Release a slot back to the free list (called on the send CQE).
    pub fn release(&mut self, idx: u16) {
        if idx as usize >= self.in_use.len() || !self.in_use[idx as usize] {
            return; // stale or double release
        }
        self.in_use[idx as usize] = false;
        self.free_list.push(idx);
    }

    /// Number of free slots.
    #[allow(dead_code)]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Number of slots holding an in-flight send.
    pub fn in_flight_count(&self) -> usize {
        self.in_use.len() - self.free_list.len()
    }
}

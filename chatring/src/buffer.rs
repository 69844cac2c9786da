use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{self, AtomicU16};
use std::time::Instant;

use tracing::{debug, warn};

/// Ownership state of one pool slot.
///
/// A slot is either published to the kernel's provided-buffer ring or
/// held by the application with a positive reference count. The kernel
/// alone moves a slot out of `Kernel` (by selecting it for a recv); only
/// the owning shard moves it back.
#[derive(Debug)]
pub enum SlotState {
    /// Published to the kernel ring, waiting to be selected for a recv.
    Kernel,
    /// Selected by the kernel; owned by the application until every
    /// outstanding reference is released.
    App {
        /// Client whose recv filled this slot.
        client: RawFd,
        /// Bytes the recv completion reported.
        bytes: u32,
        /// Outstanding references: one for the recv itself plus one per
        /// in-flight send borrowing the slot.
        refs: u32,
        /// When the kernel handed the slot to the application.
        since: Instant,
    },
}

struct Slot {
    state: SlotState,
    total_uses: u64,
}

/// A ring-mapped provided-buffer pool for multishot recv operations.
///
/// The kernel picks a slot from the ring at completion time; the slot
/// returns to the ring exactly once per selection, when its reference
/// count drains to zero. The pool is owned by one shard and never
/// touched from another thread.
pub struct BufferPool {
    /// Pointer to the mmap'd ring (shared with the kernel).
    ring_ptr: *mut u8,
    /// Size of the mmap'd ring region.
    ring_mmap_len: usize,
    /// Backing memory for all slots.
    backing: Vec<u8>,
    /// Buffer group ID.
    bgid: u16,
    /// Number of slots (power of two).
    ring_size: u16,
    /// Size of each slot.
    buf_size: u32,
    /// Current tail index (we write, kernel reads).
    tail: u16,
    /// Mask for ring index wrapping.
    mask: u16,
    /// Per-slot ownership state and usage counters.
    slots: Vec<Slot>,
    /// client fd -> slot most recently selected for its recv.
    client_slots: HashMap<RawFd, u16>,
}

/// An io_uring buf_ring entry (matches kernel struct io_uring_buf).
#[repr(C)]
struct BufRingEntry {
    addr: u64,
    len: u32,
    bid: u16,
    resv: u16,
}

impl BufferPool {
    /// Size of a single ring entry.
    const ENTRY_SIZE: usize = std::mem::size_of::<BufRingEntry>();

    /// Create a new pool with `ring_size` slots of `buf_size` bytes each
    /// and publish every slot to the kernel ring.
    ///
    /// `ring_size` must be a power of two; the ring memory is mmap'd so
    /// the kernel can access it directly.
    pub fn new(bgid: u16, ring_size: u16, buf_size: u32) -> io::Result<Self> {
        assert!(ring_size.is_power_of_two(), "ring_size must be power of 2");

        let ring_mmap_len = ring_size as usize * Self::ENTRY_SIZE;
        let backing = vec![0u8; ring_size as usize * buf_size as usize];

        let ring_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                ring_mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED,
                -1,
                0,
            )
        };
        if ring_ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let mut slots = Vec::with_capacity(ring_size as usize);
        for _ in 0..ring_size {
            slots.push(Slot {
                state: SlotState::Kernel,
                total_uses: 0,
            });
        }

        let mut pool = BufferPool {
            ring_ptr: ring_ptr as *mut u8,
            ring_mmap_len,
            backing,
            bgid,
            ring_size,
            buf_size,
            tail: 0,
            mask: ring_size - 1,
            slots,
            client_slots: HashMap::new(),
        };

        // Publish every slot, then make the entries visible to the kernel.
        for i in 0..ring_size {
            pool.push_entry(i);
        }
        pool.commit_tail();

        Ok(pool)
    }

    /// Get the ring pointer for `register_buf_ring()`.
    pub fn ring_addr(&self) -> u64 {
        self.ring_ptr as u64
    }

    /// Get the buffer group ID.
    pub fn bgid(&self) -> u16 {
        self.bgid
    }

    /// Get the ring size (number of slots).
    pub fn ring_entries(&self) -> u32 {
        self.ring_size as u32
    }

    /// Base address of a slot's backing memory.
    pub fn addr(&self, idx: u16) -> *const u8 {
        let offset = idx as usize * self.buf_size as usize;
        unsafe { self.backing.as_ptr().add(offset) }
    }

    /// The received bytes of an app-owned slot.
    pub fn slot_bytes(&self, idx: u16) -> &[u8] {
        let len = self.bytes_used(idx) as usize;
        let offset = idx as usize * self.buf_size as usize;
        &self.backing[offset..offset + len]
    }

    /// Mutable view of an app-owned slot's received bytes, for in-place
    /// frame rewriting before fan-out.
    pub fn slot_bytes_mut(&mut self, idx: u16) -> &mut [u8] {
        let len = self.bytes_used(idx) as usize;
        let offset = idx as usize * self.buf_size as usize;
        &mut self.backing[offset..offset + len]
    }

    /// Record that the kernel selected slot `idx` for a recv on `client`.
    ///
    /// Transitions the slot to app ownership with a reference count of
    /// one (the recv itself).
    pub fn on_kernel_selected(&mut self, idx: u16, client: RawFd, bytes: u32) {
        if idx >= self.ring_size {
            warn!(idx, "kernel reported out-of-range buffer index");
            return;
        }
        let slot = &mut self.slots[idx as usize];
        if let SlotState::App { client: owner, .. } = slot.state {
            warn!(idx, owner, "kernel selected a slot already app-owned");
        }
        slot.state = SlotState::App {
            client,
            bytes,
            refs: 1,
            since: Instant::now(),
        };
        slot.total_uses += 1;
        let uses = slot.total_uses;
        self.client_slots.insert(client, idx);
        debug!(idx, client, bytes, uses, "buffer selected");
    }

    /// Add one reference to an app-owned slot. Called once per outgoing
    /// send that borrows the slot.
    pub fn retain(&mut self, idx: u16) {
        match &mut self.slots[idx as usize].state {
            SlotState::App { refs, .. } => *refs += 1,
            SlotState::Kernel => warn!(idx, "retain on a kernel-owned slot"),
        }
    }

    /// Drop one reference. When the count drains to zero the slot's
    /// metadata is cleared and the slot is republished to the kernel
    /// ring.
    pub fn release(&mut self, idx: u16) {
        if idx >= self.ring_size {
            warn!(idx, "release of out-of-range buffer index");
            return;
        }
        let (client, held) = match &mut self.slots[idx as usize].state {
            SlotState::App { refs, client, since, .. } => {
                *refs -= 1;
                if *refs > 0 {
                    return;
                }
                (*client, since.elapsed())
            }
            SlotState::Kernel => {
                warn!(idx, "release of a slot already returned");
                return;
            }
        };
        self.slots[idx as usize].state = SlotState::Kernel;
        if self.client_slots.get(&client) == Some(&idx) {
            self.client_slots.remove(&client);
        }
        debug!(idx, client, held_us = held.as_micros() as u64, "buffer returned");
        self.push_entry(idx);
        self.commit_tail();
    }

    /// The client whose recv filled slot `idx`, if app-owned.
    #[allow(dead_code)]
    pub fn client_of(&self, idx: u16) -> Option<RawFd> {
        match self.slots[idx as usize].state {
            SlotState::App { client, .. } => Some(client),
            SlotState::Kernel => None,
        }
    }

    /// Received byte count of slot `idx`; zero when kernel-owned.
    pub fn bytes_used(&self, idx: u16) -> u32 {
        match self.slots[idx as usize].state {
            SlotState::App { bytes, .. } => bytes,
            SlotState::Kernel => 0,
        }
    }

    /// Outstanding references on slot `idx`; zero when kernel-owned.
    pub fn ref_count(&self, idx: u16) -> u32 {
        match self.slots[idx as usize].state {
            SlotState::App { refs, .. } => refs,
            SlotState::Kernel => 0,
        }
    }

    /// The slot most recently selected for a recv on `fd`, if still
    /// app-owned.
    pub fn find_by_client(&self, fd: RawFd) -> Option<u16> {
        self.client_slots.get(&fd).copied()
    }

    /// Forget the client attribution for `fd` when the connection dies.
    ///
    /// A slot with in-flight sends keeps its references and returns to
    /// the ring when they drain; this only severs the fd mapping so a
    /// reused descriptor cannot alias a stale slot.
    pub fn reclaim_client(&mut self, fd: RawFd) {
        if let Some(idx) = self.client_slots.remove(&fd) {
            debug!(
                fd,
                idx,
                refs = self.ref_count(idx),
                "dropping buffer attribution for closed client"
            );
        }
    }

    /// Number of slots currently app-owned.
    pub fn app_owned_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::App { .. }))
            .count()
    }

    fn push_entry(&mut self, bid: u16) {
        let ring_idx = (self.tail & self.mask) as usize;
        let entry_ptr = unsafe {
            self.ring_ptr
                .add(ring_idx * Self::ENTRY_SIZE)
                .cast::<BufRingEntry>()
        };
        let buf_offset = bid as usize * self.buf_size as usize;
        let buf_addr = unsafe { self.backing.as_ptr().add(buf_offset) };
        unsafe {
            ptr::write(
                entry_ptr,
                BufRingEntry {
                    addr: buf_addr as u64,
                    len: self.buf_size,
                    bid,
                    resv: 0,
                },
            );
        }
        self.tail = self.tail.wrapping_add(1);
    }

    fn commit_tail(&self) {
        // The tail lives at offset 14 within the ring header. The kernel
        // overlays the header with bufs[0]: struct io_uring_buf_ring {
        //   union { struct { u64 resv1; u32 resv2; u16 resv3; u16 tail; };
        //           struct io_uring_buf bufs[0]; }; };
        // io_uring_buf: { u64 addr(0); u32 len(8); u16 bid(12); u16 resv(14) }
        let tail_ptr = unsafe { self.ring_ptr.add(14).cast::<AtomicU16>() };
        unsafe {
            (*tail_ptr).store(self.tail, atomic::Ordering::Release);
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if !self.ring_ptr.is_null() {
            unsafe {
                libc::munmap(self.ring_ptr as *mut _, self.ring_mmap_len);
            }
        }
    }
}

// Safety: the pool is only accessed from the shard thread that owns it.
unsafe impl Send for BufferPool {}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> BufferPool {
        BufferPool::new(1, 8, 1024).unwrap()
    }

    #[test]
    fn selection_takes_app_ownership() {
        let mut pool = pool();
        pool.on_kernel_selected(3, 42, 515);
        assert_eq!(pool.client_of(3), Some(42));
        assert_eq!(pool.bytes_used(3), 515);
        assert_eq!(pool.ref_count(3), 1);
        assert_eq!(pool.find_by_client(42), Some(3));
        assert_eq!(pool.app_owned_count(), 1);
    }

    #[test]
    fn balanced_retain_release_returns_slot_once() {
        let mut pool = pool();
        pool.on_kernel_selected(0, 7, 515);
        let tail_before = pool.tail;

        // Fan-out to two recipients: two retains, then the initial
        // reference is released after both sends are enqueued.
        pool.retain(0);
        pool.retain(0);
        assert_eq!(pool.ref_count(0), 3);
        pool.release(0); // initial recv reference
        assert_eq!(pool.ref_count(0), 2);
        pool.release(0); // first send completion
        assert_eq!(pool.ref_count(0), 1);
        assert_eq!(pool.tail, tail_before, "slot returned early");
        pool.release(0); // second send completion
        assert_eq!(pool.ref_count(0), 0);
        assert_eq!(pool.app_owned_count(), 0);
        assert_eq!(pool.tail, tail_before.wrapping_add(1), "slot not returned");
        assert_eq!(pool.find_by_client(7), None);
    }

    #[test]
    fn double_release_does_not_republish_twice() {
        let mut pool = pool();
        pool.on_kernel_selected(1, 9, 10);
        pool.release(1);
        let tail = pool.tail;
        pool.release(1); // stray release on a kernel-owned slot
        assert_eq!(pool.tail, tail);
    }

    #[test]
    fn reselection_after_return() {
        let mut pool = pool();
        pool.on_kernel_selected(2, 5, 100);
        pool.release(2);
        // The kernel may hand the same slot to a different client.
        pool.on_kernel_selected(2, 6, 200);
        assert_eq!(pool.client_of(2), Some(6));
        assert_eq!(pool.find_by_client(5), None);
    }

    #[test]
    fn reclaim_severs_attribution_but_keeps_refs() {
        let mut pool = pool();
        pool.on_kernel_selected(4, 11, 515);
        pool.retain(4); // in-flight send
        pool.release(4); // initial reference
        pool.reclaim_client(11);
        assert_eq!(pool.find_by_client(11), None);
        assert_eq!(pool.ref_count(4), 1, "in-flight send still holds the slot");
        pool.release(4); // send completion drains the slot
        assert_eq!(pool.app_owned_count(), 0);
    }

    #[test]
    fn slot_bytes_reflect_recv_length() {
        let mut pool = pool();
        pool.on_kernel_selected(0, 3, 5);
        pool.slot_bytes_mut(0).copy_from_slice(b"abcde");
        assert_eq!(pool.slot_bytes(0), b"abcde");
    }

    #[test]
    fn exhaustion_accounting() {
        let mut pool = pool();
        for i in 0..8 {
            pool.on_kernel_selected(i, 100 + i as RawFd, 1);
        }
        assert_eq!(pool.app_owned_count(), 8);
        for i in 0..8 {
            pool.release(i);
        }
        assert_eq!(pool.app_owned_count(), 0);
    }
}

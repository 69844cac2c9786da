use std::io;
use std::os::fd::RawFd;

use io_uring::types::Fd;
use io_uring::{IoUring, opcode, squeue};

use crate::buffer::BufferPool;
use crate::completion::{NO_BUFFER, OpTag, UserData};

/// Wrapper around one io_uring instance providing high-level SQE
/// submission helpers for the relay's four operations.
///
/// Every submission's user_data carries the encoded operation context
/// (client descriptor, operation tag, buffer index), so completion
/// dispatch needs nothing beyond the CQE itself.
pub struct Ring {
    ring: IoUring,
    /// Recv buffer group ID for multishot recv.
    bgid: u16,
}

impl Ring {
    /// Create and configure the io_uring instance.
    ///
    /// The completion queue is sized at four times the submission queue
    /// so a burst of multishot recv completions cannot overflow it.
    pub fn setup(sq_entries: u32, bgid: u16) -> io::Result<Self> {
        let cq_entries = sq_entries.checked_mul(4).unwrap_or(sq_entries);

        let mut builder = IoUring::builder();
        builder.setup_cqsize(cq_entries);
        builder.setup_coop_taskrun();
        builder.setup_single_issuer();
        builder.setup_defer_taskrun();

        let ring = builder.build(sq_entries)?;

        Ok(Ring { ring, bgid })
    }

    /// Register the pool's provided-buffer ring with the kernel.
    pub fn register_buf_ring(&self, pool: &BufferPool) -> io::Result<()> {
        // Safety: ring_addr points to valid mmap'd memory that outlives
        // the registration.
        unsafe {
            self.ring.submitter().register_buf_ring(
                pool.ring_addr(),
                pool.ring_entries() as u16,
                pool.bgid(),
            )?;
        }
        Ok(())
    }

    /// Post a multishot accept on the listening socket. Completions
    /// yield new descriptors repeatedly until the socket closes.
    pub fn prepare_accept(&mut self, listen_fd: RawFd) -> io::Result<()> {
        let user_data = UserData::encode(OpTag::Accept, -1, NO_BUFFER);
        let entry = opcode::AcceptMulti::new(Fd(listen_fd))
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Post a multishot recv using the provided-buffer group. The kernel
    /// delivers completions until the socket closes or the submission is
    /// cancelled.
    pub fn prepare_recv(&mut self, client_fd: RawFd) -> io::Result<()> {
        let user_data = UserData::encode(OpTag::Read, client_fd, NO_BUFFER);
        let entry = opcode::RecvMulti::new(Fd(client_fd), self.bgid)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Post a single-shot send of `len` bytes from `ptr`. The buffer
    /// index travels in user_data so the completion can release the
    /// borrowed slot.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must remain valid until the CQE arrives; the
    /// buffer-pool reference counting guarantees this for pool slots.
    pub fn prepare_send(
        &mut self,
        client_fd: RawFd,
        ptr: *const u8,
        len: u32,
        buf_idx: u16,
    ) -> io::Result<()> {
        let user_data = UserData::encode(OpTag::Write, client_fd, buf_idx);
        let entry = opcode::Send::new(Fd(client_fd), ptr, len)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Post a single-shot close for a client descriptor.
    pub fn prepare_close(&mut self, client_fd: RawFd) -> io::Result<()> {
        let user_data = UserData::encode(OpTag::Close, client_fd, NO_BUFFER);
        let entry = opcode::Close::new(Fd(client_fd))
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Post an 8-byte eventfd read used to wake the shard loop for
    /// command-queue draining.
    pub fn prepare_eventfd_read(&mut self, eventfd: RawFd, buf: *mut u8) -> io::Result<()> {
        let user_data = UserData::encode(OpTag::Read, eventfd, NO_BUFFER);
        let entry = opcode::Read::new(Fd(eventfd), buf, 8)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Post an async cancel targeting the multishot recv armed for
    /// `client_fd`. The cancel's own completion carries a CLOSE context
    /// for the same descriptor so migration can continue on it.
    pub fn prepare_recv_cancel(&mut self, client_fd: RawFd) -> io::Result<()> {
        let target = UserData::encode(OpTag::Read, client_fd, NO_BUFFER);
        let user_data = UserData::encode(OpTag::Close, client_fd, NO_BUFFER);
        let entry = opcode::AsyncCancel::new(target.raw())
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit pending SQEs without waiting.
    pub fn submit(&self) -> io::Result<usize> {
        self.ring.submit()
    }

    /// Submit all pending SQEs and wait for at least `min_complete` CQEs.
    pub fn submit_and_wait(&self, min_complete: usize) -> io::Result<usize> {
        self.ring.submitter().submit_and_wait(min_complete)
    }

    /// Drain up to `cap` completions into `out` as (user_data, result,
    /// flags) tuples. The completion queue head advances past the
    /// entries taken.
    pub fn peek_completions(&mut self, out: &mut Vec<(u64, i32, u32)>, cap: usize) -> usize {
        out.clear();
        let mut cq = self.ring.completion();
        for cqe in (&mut cq).take(cap) {
            out.push((cqe.user_data(), cqe.result(), cqe.flags()));
        }
        drop(cq); // syncs the head back to the kernel
        out.len()
    }

    /// Push an SQE to the submission queue.
    ///
    /// If the queue is full, pending entries are flushed to the kernel
    /// and the push is retried exactly once; persistent failure is an
    /// error surfaced to the caller.
    ///
    /// # Safety
    /// The SQE must reference valid memory for the lifetime of the
    /// operation.
    unsafe fn push_sqe(&mut self, entry: squeue::Entry) -> io::Result<()> {
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                if self.ring.submission().push(&entry).is_err() {
                    crate::metrics::SQE_SUBMIT_FAILURES.increment();
                    return Err(io::Error::other("SQ still full after submit"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_and_register() {
        let ring = Ring::setup(2048, 1).unwrap();
        let pool = BufferPool::new(1, 8, 1024).unwrap();
        ring.register_buf_ring(&pool).unwrap();
    }

    #[test]
    fn empty_ring_peeks_nothing() {
        let mut ring = Ring::setup(2048, 1).unwrap();
        let mut batch = Vec::new();
        assert_eq!(ring.peek_completions(&mut batch, 256), 0);
    }

    #[test]
    fn eventfd_read_round_trips_through_the_ring() {
        let mut ring = Ring::setup(2048, 1).unwrap();
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(efd >= 0);
        let mut buf = [0u8; 8];

        ring.prepare_eventfd_read(efd, buf.as_mut_ptr()).unwrap();
        let val: u64 = 1;
        unsafe {
            libc::write(efd, &val as *const u64 as *const libc::c_void, 8);
        }
        ring.submit_and_wait(1).unwrap();

        let mut batch = Vec::new();
        let n = ring.peek_completions(&mut batch, 256);
        assert_eq!(n, 1);
        let (user_data, res, _flags) = batch[0];
        let ud = UserData(user_data);
        assert_eq!(ud.tag(), Some(OpTag::Read));
        assert_eq!(ud.fd(), efd);
        assert_eq!(res, 8);

        unsafe {
            libc::close(efd);
        }
    }
}

use std::os::fd::RawFd;

use crossbeam_channel::Sender;
use tracing::warn;

/// Work posted to a shard from outside its thread: accept handoff from
/// the listener, or a client migrating in from another shard. Actual
/// ring submissions always happen on the owning shard's thread when it
/// drains its queue.
#[derive(Debug)]
pub enum ShardCommand {
    /// Take ownership of `fd` as a member of `session_id`: arm recv,
    /// announce the join, and — when the command came from an explicit
    /// JOIN frame — acknowledge it.
    Adopt {
        fd: RawFd,
        session_id: u32,
        send_ack: bool,
    },
}

/// Posting side of one shard's command queue plus the eventfd that wakes
/// its ring out of `submit_and_wait`.
#[derive(Clone)]
pub struct ShardHandle {
    tx: Sender<ShardCommand>,
    eventfd: RawFd,
}

impl ShardHandle {
    pub fn new(tx: Sender<ShardCommand>, eventfd: RawFd) -> Self {
        ShardHandle { tx, eventfd }
    }

    /// Enqueue a command and wake the shard. Returns false if the shard
    /// has exited and its queue is disconnected.
    pub fn post(&self, cmd: ShardCommand) -> bool {
        if self.tx.send(cmd).is_err() {
            warn!("command posted to a stopped shard");
            return false;
        }
        self.wake();
        true
    }

    /// Wake the shard's ring via its eventfd.
    pub fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.eventfd, &val as *const u64 as *const libc::c_void, 8);
        }
    }
}

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Receiver;
use io_uring::cqueue;
use tracing::{debug, error, info, warn};

use crate::accumulator::AccumulatorTable;
use crate::buffer::BufferPool;
use crate::command::ShardCommand;
use crate::completion::{COPY_SLOT_BIT, NO_BUFFER, OpTag, UserData};
use crate::config::Config;
use crate::error::Error;
use crate::metrics;
use crate::registry::Registry;
use crate::ring::Ring;
use crate::sendpool::SendCopyPool;
use protocol_chat::FRAME_LEN;

/// A client in flight between shards: its recv on this ring has been
/// cancelled and the owning shard takes over once the cancellation
/// surfaces.
pub(crate) struct Migration {
    pub(crate) session_id: u32,
    pub(crate) shard: usize,
    pub(crate) send_ack: bool,
}

/// One worker: a single OS thread bound to one ring, one buffer pool,
/// and the sessions the registry hosts here. Nothing in this struct is
/// ever touched from another thread; cross-shard work arrives through
/// the command queue.
pub(crate) struct Shard {
    pub(crate) id: usize,
    pub(crate) ring: Ring,
    pub(crate) pool: BufferPool,
    pub(crate) send_pool: SendCopyPool,
    pub(crate) accumulators: AccumulatorTable,
    pub(crate) registry: Arc<Registry>,
    commands: Receiver<ShardCommand>,
    eventfd: RawFd,
    eventfd_buf: Box<[u8; 8]>,
    /// Clients serviced by this ring, with their current session.
    pub(crate) clients: HashMap<RawFd, u32>,
    pub(crate) migrations: HashMap<RawFd, Migration>,
    pending_closes: HashSet<RawFd>,
    pub(crate) echo_sender: bool,
    completion_batch: usize,
    cqe_batch: Vec<(u64, i32, u32)>,
    stop: Arc<AtomicBool>,
    draining: bool,
    pub(crate) broadcasts: u64,
}

impl Shard {
    pub(crate) fn new(
        id: usize,
        config: &Config,
        registry: Arc<Registry>,
        commands: Receiver<ShardCommand>,
        eventfd: RawFd,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let ring = Ring::setup(config.submission_queue_depth, config.buffer_group)
            .map_err(|e| Error::RingSetup(e.to_string()))?;
        let pool = BufferPool::new(
            config.buffer_group,
            config.buffers_per_shard,
            config.buffer_size,
        )?;
        ring.register_buf_ring(&pool)
            .map_err(|e| Error::BufferRegistration(e.to_string()))?;

        Ok(Shard {
            id,
            ring,
            pool,
            send_pool: SendCopyPool::new(config.send_copy_count, config.send_copy_slot_size),
            accumulators: AccumulatorTable::new(config.accumulator_capacity),
            registry,
            commands,
            eventfd,
            eventfd_buf: Box::new([0u8; 8]),
            clients: HashMap::new(),
            migrations: HashMap::new(),
            pending_closes: HashSet::new(),
            echo_sender: config.broadcast_echo_sender,
            completion_batch: config.completion_batch,
            cqe_batch: Vec::with_capacity(config.completion_batch),
            stop,
            draining: false,
            broadcasts: 0,
        })
    }

    /// The shard loop: drain commands, dispatch a completion batch, or
    /// block in `submit_and_wait(1)` when idle. EINTR is spurious and
    /// retried.
    pub(crate) fn run(&mut self) -> Result<(), Error> {
        let buf = self.eventfd_buf.as_mut_ptr();
        self.ring.prepare_eventfd_read(self.eventfd, buf)?;
        info!(shard = self.id, "shard started");

        loop {
            self.drain_commands();
            let _ = self.ring.submit();

            let n = self
                .ring
                .peek_completions(&mut self.cqe_batch, self.completion_batch);
            if n == 0 {
                if self.stop.load(Ordering::Acquire) {
                    break;
                }
                match self.ring.submit_and_wait(1) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!(shard = self.id, error = %e, "submit_and_wait failed");
                        return Err(Error::Io(e));
                    }
                }
                continue;
            }

            for i in 0..n {
                let (user_data, res, flags) = self.cqe_batch[i];
                self.dispatch(user_data, res, flags);
            }
            let _ = self.ring.submit();

            if self.stop.load(Ordering::Acquire) {
                break;
            }
        }

        self.draining = true;
        self.shutdown_drain();
        info!(shard = self.id, "shard stopped");
        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                ShardCommand::Adopt {
                    fd,
                    session_id,
                    send_ack,
                } => self.on_adopt(fd, session_id, send_ack),
            }
        }
    }

    fn dispatch(&mut self, user_data: u64, res: i32, flags: u32) {
        let ud = UserData(user_data);
        let Some(tag) = ud.tag() else {
            warn!(shard = self.id, user_data, "completion with invalid operation context");
            return;
        };
        let fd = ud.fd();
        match tag {
            OpTag::Read if fd == self.eventfd => {
                // Commands are drained at the top of the loop; just re-arm.
                if !self.draining {
                    let buf = self.eventfd_buf.as_mut_ptr();
                    let _ = self.ring.prepare_eventfd_read(self.eventfd, buf);
                }
            }
            OpTag::Read => self.on_read(fd, res, flags),
            OpTag::Write => self.on_write(fd, res, ud.buffer_index()),
            OpTag::Close => self.on_close(fd),
            OpTag::Accept => {
                warn!(shard = self.id, "unexpected accept completion on a worker ring");
            }
        }
    }

    /// Take ownership of a client handed over by the listener or by a
    /// migrating shard: arm recv, acknowledge an explicit JOIN, and
    /// announce the join to the other members.
    fn on_adopt(&mut self, fd: RawFd, session_id: u32, send_ack: bool) {
        debug!(shard = self.id, fd, session_id, "adopting client");
        self.clients.insert(fd, session_id);
        if let Err(e) = self.ring.prepare_recv(fd) {
            error!(fd, error = %e, "failed to arm recv for adopted client");
            self.clients.remove(&fd);
            self.registry.remove(fd);
            self.post_close(fd);
            return;
        }
        if send_ack {
            self.send_ack(fd, session_id);
        }
        self.announce_join(session_id, fd);
    }

    fn on_read(&mut self, fd: RawFd, res: i32, flags: u32) {
        if res <= 0 {
            if let Some(migration) = self.migrations.remove(&fd) {
                // Our own cancellation surfacing; hand the client over.
                self.finish_migration(fd, migration);
                return;
            }
            if res == -libc::ENOBUFS {
                metrics::BUFFER_RING_EMPTY.increment();
                warn!(shard = self.id, fd, "recv reported no buffer available");
                if self.clients.contains_key(&fd) {
                    let _ = self.ring.prepare_recv(fd);
                }
                return;
            }
            if !self.clients.contains_key(&fd) {
                return; // already torn down
            }
            self.teardown(fd, res);
            return;
        }

        let Some(buf_idx) = cqueue::buffer_select(flags) else {
            error!(fd, "recv completion without a provided buffer");
            if self.clients.contains_key(&fd) {
                self.teardown(fd, res);
            }
            return;
        };

        self.pool.on_kernel_selected(buf_idx, fd, res as u32);
        metrics::BYTES_RECEIVED.add(res as u64);

        if self.clients.contains_key(&fd) {
            self.process_received(fd, buf_idx, res as usize);
        } else {
            // Mid-migration or already forgotten: the bytes have no home.
            metrics::FRAMES_DROPPED.increment();
            self.pool.release(buf_idx);
        }

        // A terminal completion (no MORE flag) ends the multishot recv.
        if !cqueue::more(flags) && self.clients.contains_key(&fd) {
            let _ = self.ring.prepare_recv(fd);
        }
    }

    /// Walk the received bytes on record boundaries. Frames that arrived
    /// intact are handled in place; a partial tail waits in the
    /// accumulator. The initial recv reference is released only after
    /// every frame's fan-out has been enqueued.
    fn process_received(&mut self, fd: RawFd, buf_idx: u16, len: usize) {
        if self.accumulators.has_pending(fd) {
            self.accumulators.append(fd, self.pool.slot_bytes(buf_idx));
            self.pool.release(buf_idx);
            self.drain_accumulator(fd);
            return;
        }

        let mut offset = 0;
        while len - offset >= FRAME_LEN {
            self.handle_slot_frame(fd, buf_idx, offset);
            offset += FRAME_LEN;
            if !self.clients.contains_key(&fd) {
                // The frame closed or migrated this client; anything
                // after it in the buffer has no home.
                offset = len;
                break;
            }
        }
        if offset < len {
            self.accumulators
                .append(fd, &self.pool.slot_bytes(buf_idx)[offset..]);
        }
        self.pool.release(buf_idx);
    }

    fn drain_accumulator(&mut self, fd: RawFd) {
        while self.accumulators.data(fd).len() >= FRAME_LEN {
            let mut record = [0u8; FRAME_LEN];
            record.copy_from_slice(&self.accumulators.data(fd)[..FRAME_LEN]);
            self.accumulators.consume(fd, FRAME_LEN);
            self.handle_copied_frame(fd, &mut record);
            if !self.clients.contains_key(&fd) {
                self.accumulators.remove(fd);
                break;
            }
        }
    }

    fn on_write(&mut self, fd: RawFd, res: i32, buf_idx: u16) {
        if res < 0 {
            metrics::SEND_ERRORS.increment();
            warn!(fd, res, "send failed");
        } else {
            metrics::BYTES_SENT.add(res as u64);
            metrics::MESSAGES_SENT.increment();
            if (res as usize) < FRAME_LEN {
                debug!(fd, res, "short send");
            }
        }
        // One reference per completed send, whatever the result.
        if buf_idx == NO_BUFFER {
            return;
        }
        if buf_idx & COPY_SLOT_BIT != 0 {
            self.send_pool.release(buf_idx & !COPY_SLOT_BIT);
        } else {
            self.pool.release(buf_idx);
        }
    }

    fn on_close(&mut self, fd: RawFd) {
        if let Some(migration) = self.migrations.remove(&fd) {
            // Completion of the recv cancellation, not of a close.
            self.finish_migration(fd, migration);
            return;
        }
        if self.pending_closes.remove(&fd) {
            self.pool.reclaim_client(fd);
            metrics::CONNECTIONS_CLOSED.increment();
            metrics::CONNECTIONS_ACTIVE.decrement();
            debug!(shard = self.id, fd, "connection closed");
        }
    }

    /// End-of-stream or unrecoverable recv error: remove the client from
    /// its session, tell the remaining members, reclaim its buffer, and
    /// post the close.
    pub(crate) fn teardown(&mut self, fd: RawFd, res: i32) {
        if res < 0 {
            error!(shard = self.id, fd, res, "recv failed, closing connection");
        } else {
            debug!(shard = self.id, fd, "peer closed connection");
        }
        if let Some((session_id, remaining)) = self.registry.remove(fd) {
            debug!(fd, session_id, "removed from session on disconnect");
            self.notify_disconnect(fd, &remaining);
        }
        self.forget_client(fd);
    }

    /// Drop all local state for a client and post its close.
    pub(crate) fn forget_client(&mut self, fd: RawFd) {
        self.clients.remove(&fd);
        self.accumulators.remove(fd);
        self.pool.reclaim_client(fd);
        self.post_close(fd);
    }

    pub(crate) fn post_close(&mut self, fd: RawFd) {
        if !self.pending_closes.insert(fd) {
            return; // close already posted
        }
        if let Err(e) = self.ring.prepare_close(fd) {
            error!(fd, error = %e, "failed to post close");
        }
    }

    pub(crate) fn finish_migration(&mut self, fd: RawFd, migration: Migration) {
        debug!(
            shard = self.id,
            fd,
            session_id = migration.session_id,
            to_shard = migration.shard,
            "handing client to owning shard"
        );
        let handle = self.registry.shard_handle(migration.shard);
        let posted = handle.post(ShardCommand::Adopt {
            fd,
            session_id: migration.session_id,
            send_ack: migration.send_ack,
        });
        if !posted {
            // The owning shard is gone. No ring services this descriptor
            // any more (our recv is cancelled, the new one was never
            // armed), so close it directly rather than through a ring.
            self.registry.remove(fd);
            unsafe {
                libc::close(fd);
            }
            metrics::CONNECTIONS_CLOSED.increment();
            metrics::CONNECTIONS_ACTIVE.decrement();
        }
    }

    /// Close every serviced client, then drain the completion queue
    /// until in-flight closes and app-owned buffers reach zero.
    fn shutdown_drain(&mut self) {
        let fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for fd in fds {
            self.registry.remove(fd);
            self.forget_client(fd);
        }

        for _ in 0..100 {
            if self.pending_closes.is_empty() && self.pool.app_owned_count() == 0 {
                break;
            }
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
            let n = self
                .ring
                .peek_completions(&mut self.cqe_batch, self.completion_batch);
            for i in 0..n {
                let (user_data, res, flags) = self.cqe_batch[i];
                self.dispatch(user_data, res, flags);
            }
        }

        info!(
            shard = self.id,
            app_owned = self.pool.app_owned_count(),
            sends_in_flight = self.send_pool.in_flight_count(),
            "shard drained"
        );
        unsafe {
            libc::close(self.eventfd);
        }
    }
}

//! Protocol dispatch: interpreting parsed frames and driving broadcasts.
//!
//! Frames that arrived intact in a recv slot fan out zero-copy: the
//! frame is rewritten in place (client CHAT tag → server CHAT tag,
//! payload sanitized and compacted) and every send borrows the slot
//! under one reference each. Frames assembled in the accumulator, and
//! every server-built frame, go through the send-copy pool instead.

use std::os::fd::RawFd;

use tracing::{debug, warn};

use crate::completion::COPY_SLOT_BIT;
use crate::metrics;
use crate::registry::{JoinError, JoinOutcome};
use crate::shard::{Migration, Shard};
use protocol_chat::{
    FRAME_LEN, HEADER_LEN, Tag, decode, encode, join_session_id, sanitize_in_place,
};

impl Shard {
    /// Handle one record sitting at `offset` within a recv slot.
    pub(crate) fn handle_slot_frame(&mut self, fd: RawFd, buf_idx: u16, offset: usize) {
        let record = &self.pool.slot_bytes(buf_idx)[offset..offset + FRAME_LEN];
        let (tag, payload_len) = match decode(record) {
            Ok(view) => (view.tag, view.payload.len()),
            Err(e) => {
                warn!(fd, error = %e, "dropping malformed frame");
                metrics::FRAMES_DROPPED.increment();
                return;
            }
        };
        metrics::FRAMES_RECEIVED.increment();

        match tag {
            Tag::ClientJoin => {
                let session_id = {
                    let record = &self.pool.slot_bytes(buf_idx)[offset..offset + FRAME_LEN];
                    join_session_id(&record[HEADER_LEN..HEADER_LEN + payload_len])
                };
                self.handle_join(fd, session_id);
            }
            Tag::ClientLeave => self.handle_leave(fd),
            Tag::ClientChat => self.handle_chat_slot(fd, buf_idx, offset, payload_len),
            Tag::ClientCommand => {
                debug!(fd, "dropping reserved COMMAND frame");
            }
            _ => {
                warn!(fd, tag = tag as u8, "dropping server-tagged frame from client");
                metrics::FRAMES_DROPPED.increment();
            }
        }
    }

    /// Handle one record drained from the re-framing accumulator.
    pub(crate) fn handle_copied_frame(&mut self, fd: RawFd, record: &mut [u8; FRAME_LEN]) {
        let (tag, payload_len) = match decode(record) {
            Ok(view) => (view.tag, view.payload.len()),
            Err(e) => {
                warn!(fd, error = %e, "dropping malformed frame");
                metrics::FRAMES_DROPPED.increment();
                return;
            }
        };
        metrics::FRAMES_RECEIVED.increment();

        match tag {
            Tag::ClientJoin => {
                let session_id = join_session_id(&record[HEADER_LEN..HEADER_LEN + payload_len]);
                self.handle_join(fd, session_id);
            }
            Tag::ClientLeave => self.handle_leave(fd),
            Tag::ClientChat => self.handle_chat_copy(fd, record, payload_len),
            Tag::ClientCommand => {
                debug!(fd, "dropping reserved COMMAND frame");
            }
            _ => {
                warn!(fd, tag = tag as u8, "dropping server-tagged frame from client");
                metrics::FRAMES_DROPPED.increment();
            }
        }
    }

    fn handle_join(&mut self, fd: RawFd, session_id: Option<u32>) {
        let Some(session_id) = session_id else {
            warn!(fd, "JOIN with invalid payload");
            self.send_server_frame(fd, Tag::ServerError, b"invalid join payload");
            return;
        };

        match self.registry.join(fd, session_id) {
            Err(JoinError::UnknownSession(id)) => {
                warn!(fd, session_id = id, "JOIN of unknown session");
                let text = format!("unknown session {id}");
                self.send_server_frame(fd, Tag::ServerError, text.as_bytes());
            }
            Ok(JoinOutcome::AlreadyMember) => {
                self.send_ack(fd, session_id);
            }
            Ok(JoinOutcome::Joined { shard, .. }) if shard == self.id => {
                self.clients.insert(fd, session_id);
                self.send_ack(fd, session_id);
                self.announce_join(session_id, fd);
            }
            Ok(JoinOutcome::Joined { shard, .. }) => {
                // The target session lives on another shard: stop
                // servicing the descriptor here, then hand it over once
                // the recv cancellation surfaces.
                debug!(fd, session_id, to_shard = shard, "migrating client");
                self.clients.remove(&fd);
                self.accumulators.remove(fd);
                self.migrations.insert(
                    fd,
                    Migration {
                        session_id,
                        shard,
                        send_ack: true,
                    },
                );
                if self.ring.prepare_recv_cancel(fd).is_err() {
                    // Cancellation could not even be queued; hand over
                    // immediately rather than strand the client.
                    if let Some(migration) = self.migrations.remove(&fd) {
                        self.finish_migration(fd, migration);
                    }
                }
            }
        }
    }

    /// LEAVE removes the client from its session and ends the
    /// connection; the remaining members learn about the departure.
    fn handle_leave(&mut self, fd: RawFd) {
        if let Some((session_id, remaining)) = self.registry.remove(fd) {
            debug!(fd, session_id, "client left session");
            self.notify_disconnect(fd, &remaining);
        }
        self.forget_client(fd);
    }

    /// Zero-copy CHAT fan-out from a recv slot.
    fn handle_chat_slot(&mut self, fd: RawFd, buf_idx: u16, offset: usize, payload_len: usize) {
        let Some(session_id) = self.registry.session_of(fd) else {
            debug!(fd, "CHAT from a client in no session");
            metrics::FRAMES_DROPPED.increment();
            return;
        };
        let members = self.registry.session_members(session_id);
        if members.len() < 2 {
            debug!(fd, session_id, "CHAT in a session of one dropped");
            metrics::FRAMES_DROPPED.increment();
            return;
        }

        // Rewrite the record in place: server tag, sanitized payload.
        let kept = {
            let record = &mut self.pool.slot_bytes_mut(buf_idx)[offset..offset + FRAME_LEN];
            let data_end = HEADER_LEN + payload_len;
            let kept = sanitize_in_place(&mut record[HEADER_LEN..data_end]);
            if kept > 0 {
                record[0] = Tag::ServerChat as u8;
                record[1..3].copy_from_slice(&(kept as u16).to_le_bytes());
                record[HEADER_LEN + kept..data_end].fill(0);
            }
            kept
        };
        if kept == 0 {
            debug!(fd, "CHAT empty after sanitization");
            metrics::FRAMES_DROPPED.increment();
            return;
        }

        let ptr = unsafe { self.pool.addr(buf_idx).add(offset) };
        for &target in &members {
            if target == fd && !self.echo_sender {
                continue;
            }
            // One reference per outgoing send; the recv's own reference
            // is released by the caller after the whole fan-out.
            self.pool.retain(buf_idx);
            if let Err(e) = self.ring.prepare_send(target, ptr, FRAME_LEN as u32, buf_idx) {
                warn!(target, error = %e, "failed to queue broadcast send");
                self.pool.release(buf_idx);
            }
        }
        self.finish_broadcast(session_id, members.len());
    }

    /// CHAT fan-out for a record assembled in the accumulator; each
    /// recipient's send carries its own copy-pool slot.
    fn handle_chat_copy(&mut self, fd: RawFd, record: &mut [u8; FRAME_LEN], payload_len: usize) {
        let Some(session_id) = self.registry.session_of(fd) else {
            debug!(fd, "CHAT from a client in no session");
            metrics::FRAMES_DROPPED.increment();
            return;
        };
        let members = self.registry.session_members(session_id);
        if members.len() < 2 {
            debug!(fd, session_id, "CHAT in a session of one dropped");
            metrics::FRAMES_DROPPED.increment();
            return;
        }

        let kept = sanitize_in_place(&mut record[HEADER_LEN..HEADER_LEN + payload_len]);
        if kept == 0 {
            debug!(fd, "CHAT empty after sanitization");
            metrics::FRAMES_DROPPED.increment();
            return;
        }
        record[0] = Tag::ServerChat as u8;
        record[1..3].copy_from_slice(&(kept as u16).to_le_bytes());
        record[HEADER_LEN + kept..].fill(0);

        for &target in &members {
            if target == fd && !self.echo_sender {
                continue;
            }
            self.send_copy(target, record);
        }
        self.finish_broadcast(session_id, members.len());
    }

    fn finish_broadcast(&mut self, session_id: u32, member_count: usize) {
        metrics::BROADCASTS.increment();
        self.broadcasts += 1;
        if self.broadcasts % 1000 == 0 {
            debug!(
                shard = self.id,
                session_id,
                members = member_count,
                broadcasts = self.broadcasts,
                "broadcast stats"
            );
        }
    }

    pub(crate) fn send_ack(&mut self, fd: RawFd, session_id: u32) {
        let text = format!("joined session:{session_id}");
        self.send_server_frame(fd, Tag::ServerAck, text.as_bytes());
    }

    /// Announce a join to the other members of the session.
    pub(crate) fn announce_join(&mut self, session_id: u32, joiner: RawFd) {
        let members = self.registry.session_members(session_id);
        if members.len() < 2 {
            return;
        }
        let text = format!("joined session:{session_id}");
        for &member in &members {
            if member != joiner {
                self.send_server_frame(member, Tag::ServerNotification, text.as_bytes());
            }
        }
    }

    /// Tell the remaining members that a client is gone.
    pub(crate) fn notify_disconnect(&mut self, fd: RawFd, remaining: &[RawFd]) {
        if remaining.is_empty() {
            return;
        }
        let text = format!("user {fd} disconnected");
        for &member in remaining {
            self.send_server_frame(member, Tag::ServerNotification, text.as_bytes());
        }
    }

    /// Build a server frame and send it through the copy pool.
    pub(crate) fn send_server_frame(&mut self, fd: RawFd, tag: Tag, payload: &[u8]) {
        let mut frame = [0u8; FRAME_LEN];
        encode(tag, payload, &mut frame);
        self.send_copy(fd, &frame);
    }

    fn send_copy(&mut self, fd: RawFd, frame: &[u8; FRAME_LEN]) {
        let Some((slot, ptr)) = self.send_pool.copy_in(frame) else {
            metrics::SEND_POOL_EXHAUSTED.increment();
            warn!(fd, "send copy pool exhausted, dropping frame");
            return;
        };
        if let Err(e) = self
            .ring
            .prepare_send(fd, ptr, FRAME_LEN as u32, COPY_SLOT_BIT | slot)
        {
            warn!(fd, error = %e, "failed to queue send");
            self.send_pool.release(slot);
        }
    }
}

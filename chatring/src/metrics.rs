//! chatring runtime metrics.
//!
//! Process-wide counters for connections, frames, broadcasts, and pool
//! exhaustion, exposed through the metriken registry.

use metriken::{Counter, Gauge, metric};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "chatring/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "chatring/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "chatring/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Frames ───────────────────────────────────────────────────────

#[metric(name = "chatring/frames/received", description = "Client frames received")]
pub static FRAMES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "chatring/frames/dropped",
    description = "Frames dropped (malformed, oversize, or not deliverable)"
)]
pub static FRAMES_DROPPED: Counter = Counter::new();

#[metric(name = "chatring/messages/sent", description = "Frames sent to clients")]
pub static MESSAGES_SENT: Counter = Counter::new();

#[metric(name = "chatring/broadcasts", description = "CHAT fan-outs performed")]
pub static BROADCASTS: Counter = Counter::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "chatring/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "chatring/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Failures ─────────────────────────────────────────────────────

#[metric(
    name = "chatring/send/errors",
    description = "Send completions with a negative result"
)]
pub static SEND_ERRORS: Counter = Counter::new();

#[metric(
    name = "chatring/pool/buffer_ring_empty",
    description = "Recv completions reporting no buffer available"
)]
pub static BUFFER_RING_EMPTY: Counter = Counter::new();

#[metric(
    name = "chatring/pool/send_exhausted",
    description = "Send copy pool exhaustion events"
)]
pub static SEND_POOL_EXHAUSTED: Counter = Counter::new();

#[metric(
    name = "chatring/sqe/submit_failures",
    description = "SQE submission failures"
)]
pub static SQE_SUBMIT_FAILURES: Counter = Counter::new();

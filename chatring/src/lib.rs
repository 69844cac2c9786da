//! chatring — an io_uring-native multi-tenant chat relay for Linux.
//!
//! Many TCP clients connect, each joins exactly one session (room), and
//! every chat frame a client sends is fanned out to the other members of
//! its session. The engine is a thread-per-shard completion-loop design
//! built directly on io_uring: one ring, one provided-buffer pool, and a
//! disjoint set of sessions per shard, with a dedicated listener shard
//! running a multishot accept. Received frames broadcast zero-copy from
//! the recv buffer under per-slot reference counting.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use chatring::{ConfigBuilder, ServerBuilder};
//!
//! fn main() -> Result<(), chatring::Error> {
//!     let config = ConfigBuilder::new().port(7878).build()?;
//!     let (shutdown, handles) = ServerBuilder::new(config).launch()?;
//!     // ... wait for a termination signal ...
//!     shutdown.shutdown();
//!     for h in handles {
//!         h.join().unwrap()?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux 6.1+ only. Requires io_uring with multishot accept, multishot
//! recv, and ring-provided buffers.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod accumulator;
pub(crate) mod buffer;
pub(crate) mod command;
pub(crate) mod completion;
pub(crate) mod handler;
pub(crate) mod listener;
pub(crate) mod registry;
pub(crate) mod ring;
pub(crate) mod sendpool;
pub(crate) mod shard;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;

/// Engine configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Engine errors.
pub use error::Error;
/// Builder for launching the relay.
pub use server::ServerBuilder;
/// Handle for triggering graceful shutdown.
pub use server::ShutdownHandle;

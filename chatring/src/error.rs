use std::io;

use thiserror::Error;

/// Errors returned by the chatring engine.
#[derive(Debug, Error)]
pub enum Error {
    /// io_uring setup or operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Ring setup failed (e.g., unsupported kernel features).
    #[error("ring setup: {0}")]
    RingSetup(String),
    /// Provided-buffer ring registration failed.
    #[error("buffer registration: {0}")]
    BufferRegistration(String),
    /// Listening socket could not be created, bound, or put to listen.
    #[error("bind: {0}")]
    Bind(String),
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// System resource limit too low (e.g., RLIMIT_NOFILE).
    #[error("{0}")]
    ResourceLimit(String),
}

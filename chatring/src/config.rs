use std::net::IpAddr;
use std::path::PathBuf;

use protocol_chat::FRAME_LEN;

/// Configuration for the relay engine.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind. Defaults to all interfaces.
    pub host: IpAddr,
    /// TCP port to bind.
    pub port: u16,
    /// Number of worker shards. 0 = host concurrency minus one, floor two.
    pub shards: usize,
    /// Provided-buffer slots per shard. Power of two, at most 32768.
    pub buffers_per_shard: u16,
    /// Size of each provided-buffer slot in bytes. Power of two, at least
    /// one full frame (515 bytes).
    pub buffer_size: u32,
    /// Submission queue entries per ring. Power of two. The completion
    /// queue is sized at four times this.
    pub submission_queue_depth: u32,
    /// Maximum completions dispatched per loop iteration.
    pub completion_batch: usize,
    /// Whether a CHAT broadcast is echoed back to its sender.
    pub broadcast_echo_sender: bool,
    /// Provided-buffer group id registered with each shard's ring.
    pub buffer_group: u16,
    /// TCP listen backlog. Defaults to the system maximum.
    pub backlog: i32,
    /// Enable TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,
    /// Number of send-copy pool slots per shard. Each in-flight
    /// server-built frame holds one slot until its send completes.
    /// Bounded to 15 bits by the WRITE context encoding.
    pub send_copy_count: u16,
    /// Size of each send-copy pool slot in bytes. Must fit one frame.
    pub send_copy_slot_size: u32,
    /// Initial capacity of per-connection re-framing accumulators.
    pub accumulator_capacity: usize,
    /// Whether to pin each shard thread to a CPU core.
    pub pin_to_core: bool,
    /// Starting CPU core index for pinning.
    pub core_offset: usize,
    /// Optional log file path; log records go to stdout and, when set,
    /// this file as well.
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 7878,
            shards: 0,
            buffers_per_shard: 4096,
            buffer_size: 2048,
            submission_queue_depth: 2048,
            completion_batch: 256,
            broadcast_echo_sender: false,
            buffer_group: 1,
            backlog: libc::SOMAXCONN,
            tcp_nodelay: true,
            send_copy_count: 1024,
            send_copy_slot_size: 1024,
            accumulator_capacity: 2048,
            pin_to_core: false,
            core_offset: 0,
            log_file: None,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is
    /// out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.buffers_per_shard == 0 || !self.buffers_per_shard.is_power_of_two() {
            return Err(crate::error::Error::Config(
                "buffers_per_shard must be a power of two".into(),
            ));
        }
        if self.buffers_per_shard > 32768 {
            return Err(crate::error::Error::Config(
                "buffers_per_shard must be <= 32768".into(),
            ));
        }
        if !self.buffer_size.is_power_of_two() || (self.buffer_size as usize) < FRAME_LEN {
            return Err(crate::error::Error::Config(format!(
                "buffer_size must be a power of two >= {FRAME_LEN}"
            )));
        }
        if self.submission_queue_depth == 0 || !self.submission_queue_depth.is_power_of_two() {
            return Err(crate::error::Error::Config(
                "submission_queue_depth must be a power of two".into(),
            ));
        }
        if self.completion_batch == 0 {
            return Err(crate::error::Error::Config(
                "completion_batch must be > 0".into(),
            ));
        }
        if self.send_copy_count == 0 || self.send_copy_count > 0x7FFF {
            return Err(crate::error::Error::Config(
                "send_copy_count must be in 1..=32767".into(),
            ));
        }
        if (self.send_copy_slot_size as usize) < FRAME_LEN {
            return Err(crate::error::Error::Config(format!(
                "send_copy_slot_size must be >= {FRAME_LEN}"
            )));
        }
        Ok(())
    }

    /// Resolve the worker shard count: an explicit value wins, otherwise
    /// host concurrency minus one (the listener gets its own thread),
    /// never fewer than two.
    pub fn resolve_shards(&self) -> usize {
        if self.shards != 0 {
            return self.shards;
        }
        let cpus = num_cpus();
        std::cmp::max(cpus.saturating_sub(1), 2)
    }
}

/// Get the number of available CPU cores.
pub(crate) fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn host(mut self, host: IpAddr) -> Self {
        self.config.host = host;
        self
    }

    /// Set the TCP port to bind.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the number of worker shards. 0 = host concurrency minus one.
    pub fn shards(mut self, n: usize) -> Self {
        self.config.shards = n;
        self
    }

    /// Set the provided-buffer pool geometry for each shard.
    pub fn buffers(mut self, count: u16, size: u32) -> Self {
        self.config.buffers_per_shard = count;
        self.config.buffer_size = size;
        self
    }

    /// Set the submission queue depth per ring.
    pub fn submission_queue_depth(mut self, n: u32) -> Self {
        self.config.submission_queue_depth = n;
        self
    }

    /// Set the maximum completions dispatched per loop iteration.
    pub fn completion_batch(mut self, n: usize) -> Self {
        self.config.completion_batch = n;
        self
    }

    /// Whether a CHAT broadcast is echoed back to its sender.
    pub fn broadcast_echo_sender(mut self, echo: bool) -> Self {
        self.config.broadcast_echo_sender = echo;
        self
    }

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Enable or disable TCP_NODELAY on accepted connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Set the number and size of send-copy pool slots.
    pub fn send_pool(mut self, count: u16, slot_size: u32) -> Self {
        self.config.send_copy_count = count;
        self.config.send_copy_slot_size = slot_size;
        self
    }

    /// Enable or disable CPU core pinning for shard threads.
    pub fn pin_to_core(mut self, enable: bool) -> Self {
        self.config.pin_to_core = enable;
        self
    }

    /// Write log records to this file in addition to stdout.
    pub fn log_file(mut self, path: PathBuf) -> Self {
        self.config.log_file = Some(path);
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

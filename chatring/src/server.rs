use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, info, warn};

use crate::command::ShardHandle;
use crate::config::Config;
use crate::error::Error;
use crate::listener::{Listener, create_listener};
use crate::registry::Registry;
use crate::shard::Shard;

/// Result type for `launch` to avoid type-complexity warnings.
type LaunchResult = Result<(ShutdownHandle, Vec<thread::JoinHandle<Result<(), Error>>>), Error>;

/// Handle returned by `launch()` to trigger graceful shutdown.
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    shard_eventfds: Vec<RawFd>,
    listen_fd: RawFd,
    listen_fd_closed: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Signal the listener and every shard to shut down gracefully.
    ///
    /// Shards stop accepting work, close their connections, drain
    /// remaining completions, and exit returning `Ok(())`. The listen fd
    /// is closed to terminate the multishot accept.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if !self.listen_fd_closed.swap(true, Ordering::AcqRel) {
            unsafe {
                libc::close(self.listen_fd);
            }
        }
        // Wake every shard so it sees the flag even while blocked in
        // submit_and_wait.
        for &efd in &self.shard_eventfds {
            let val: u64 = 1;
            unsafe {
                libc::write(efd, &val as *const u64 as *const libc::c_void, 8);
            }
        }
    }
}

/// Builder for launching the relay: listener shard plus worker shards.
///
/// ```rust,no_run
/// use chatring::{Config, ServerBuilder};
///
/// fn main() -> Result<(), chatring::Error> {
///     let (shutdown, handles) = ServerBuilder::new(Config::default()).launch()?;
///     // ... run until a termination signal ...
///     shutdown.shutdown();
///     for h in handles {
///         h.join().unwrap()?;
///     }
///     Ok(())
/// }
/// ```
pub struct ServerBuilder {
    config: Config,
}

impl ServerBuilder {
    pub fn new(config: Config) -> Self {
        ServerBuilder { config }
    }

    /// Bind the listening socket and start all threads.
    pub fn launch(self) -> LaunchResult {
        self.config.validate()?;
        let shard_count = self.config.resolve_shards();

        raise_nofile_limit()?;

        let addr = SocketAddr::new(self.config.host, self.config.port);
        let listen_fd = create_listener(addr, self.config.backlog)?;
        info!(%addr, shards = shard_count, "listening");

        let stop = Arc::new(AtomicBool::new(false));

        // Per-shard command channels and eventfds.
        let mut handles_for_registry = Vec::with_capacity(shard_count);
        let mut shard_rxs = Vec::with_capacity(shard_count);
        let mut shard_eventfds = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            let (tx, rx) = crossbeam_channel::unbounded();
            let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if efd < 0 {
                let err = io::Error::last_os_error();
                for &fd in &shard_eventfds {
                    unsafe {
                        libc::close(fd);
                    }
                }
                unsafe {
                    libc::close(listen_fd);
                }
                return Err(Error::Io(err));
            }
            handles_for_registry.push(ShardHandle::new(tx, efd));
            shard_rxs.push(rx);
            shard_eventfds.push(efd);
        }

        let registry = Arc::new(Registry::new(handles_for_registry));

        // Spawn worker shards. Rings are created on their own threads
        // (single-issuer setup requires it).
        let mut handles = Vec::with_capacity(shard_count + 1);
        for (shard_id, rx) in shard_rxs.into_iter().enumerate() {
            let config = self.config.clone();
            let registry = registry.clone();
            let stop = stop.clone();
            let eventfd = shard_eventfds[shard_id];

            let handle = thread::Builder::new()
                .name(format!("chatring-shard-{shard_id}"))
                .spawn(move || {
                    if config.pin_to_core {
                        pin_to_core(config.core_offset + shard_id)?;
                    }
                    let mut shard = Shard::new(shard_id, &config, registry, rx, eventfd, stop)?;
                    shard.run()
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        // Spawn the listener shard with its own wake eventfd.
        let listener_eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if listener_eventfd < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(listen_fd);
            }
            return Err(Error::Io(err));
        }
        shard_eventfds.push(listener_eventfd);
        {
            let config = self.config.clone();
            let registry = registry.clone();
            let stop = stop.clone();
            let handle = thread::Builder::new()
                .name("chatring-listener".to_string())
                .spawn(move || {
                    let mut listener =
                        Listener::new(&config, listen_fd, listener_eventfd, registry, stop)?;
                    listener.run()
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        let shutdown = ShutdownHandle {
            stop,
            shard_eventfds,
            listen_fd,
            listen_fd_closed: Arc::new(AtomicBool::new(false)),
        };

        Ok((shutdown, handles))
    }
}

/// Raise the soft RLIMIT_NOFILE toward the hard limit so the relay can
/// hold tens of thousands of descriptors.
fn raise_nofile_limit() -> Result<(), Error> {
    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if ret != 0 {
        return Err(Error::ResourceLimit(format!(
            "getrlimit(RLIMIT_NOFILE): {}",
            io::Error::last_os_error()
        )));
    }
    if rlim.rlim_cur >= rlim.rlim_max {
        return Ok(());
    }
    let old = rlim.rlim_cur;
    rlim.rlim_cur = rlim.rlim_max;
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
    if ret != 0 {
        warn!(
            soft = old,
            "could not raise RLIMIT_NOFILE: {}",
            io::Error::last_os_error()
        );
    } else {
        debug!(from = old, to = rlim.rlim_cur, "raised RLIMIT_NOFILE");
    }
    Ok(())
}

/// Pin the current thread to a specific CPU core.
fn pin_to_core(core: usize) -> Result<(), Error> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

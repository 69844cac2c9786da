use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use io_uring::cqueue;
use tracing::{debug, error, info, warn};

use crate::command::ShardCommand;
use crate::completion::{OpTag, UserData};
use crate::config::Config;
use crate::error::Error;
use crate::metrics;
use crate::registry::{JoinOutcome, Registry};
use crate::ring::Ring;

/// The accepting shard: a dedicated thread owning its own ring, running
/// a multishot accept and handing every new descriptor to the registry's
/// least-loaded session. It performs no read or write work.
pub(crate) struct Listener {
    ring: Ring,
    listen_fd: RawFd,
    registry: Arc<Registry>,
    stop: Arc<AtomicBool>,
    eventfd: RawFd,
    eventfd_buf: Box<[u8; 8]>,
    tcp_nodelay: bool,
    completion_batch: usize,
    cqe_batch: Vec<(u64, i32, u32)>,
}

impl Listener {
    pub(crate) fn new(
        config: &Config,
        listen_fd: RawFd,
        eventfd: RawFd,
        registry: Arc<Registry>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let ring = Ring::setup(config.submission_queue_depth, config.buffer_group)
            .map_err(|e| Error::RingSetup(e.to_string()))?;
        Ok(Listener {
            ring,
            listen_fd,
            registry,
            stop,
            eventfd,
            eventfd_buf: Box::new([0u8; 8]),
            tcp_nodelay: config.tcp_nodelay,
            completion_batch: config.completion_batch,
            cqe_batch: Vec::with_capacity(config.completion_batch),
        })
    }

    pub(crate) fn run(&mut self) -> Result<(), Error> {
        self.ring.prepare_accept(self.listen_fd)?;
        let buf = self.eventfd_buf.as_mut_ptr();
        self.ring.prepare_eventfd_read(self.eventfd, buf)?;
        info!("listener started");

        'outer: loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let n = self
                .ring
                .peek_completions(&mut self.cqe_batch, self.completion_batch);
            if n == 0 {
                match self.ring.submit_and_wait(1) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if self.stop.load(Ordering::Acquire) {
                            break;
                        }
                        error!(error = %e, "listener submit_and_wait failed");
                        return Err(Error::Io(e));
                    }
                }
                continue;
            }

            let mut rearm = false;
            for i in 0..n {
                let (user_data, res, flags) = self.cqe_batch[i];
                let ud = UserData(user_data);
                if ud.tag() == Some(OpTag::Read) && ud.fd() == self.eventfd {
                    // Shutdown wake; the stop check at the loop top exits.
                    continue;
                }
                if ud.tag() != Some(OpTag::Accept) {
                    warn!(user_data, "non-accept completion on the listener ring");
                    continue;
                }
                if res < 0 {
                    if self.stop.load(Ordering::Acquire) {
                        break 'outer;
                    }
                    match -res {
                        libc::ECONNABORTED | libc::EMFILE | libc::ENFILE | libc::EINTR => {
                            warn!(res, "accept failed, continuing");
                        }
                        _ => {
                            // The listening socket is gone.
                            error!(res, "accept failed fatally");
                            break 'outer;
                        }
                    }
                } else {
                    self.on_accept(res);
                }
                // A terminal completion ends the multishot accept.
                if !cqueue::more(flags) {
                    rearm = true;
                }
            }
            if rearm && !self.stop.load(Ordering::Acquire) {
                self.ring.prepare_accept(self.listen_fd)?;
                let _ = self.ring.submit();
            }
        }

        unsafe {
            libc::close(self.eventfd);
        }
        info!("listener stopped");
        Ok(())
    }

    /// Assign an accepted descriptor to the least-loaded session and
    /// hand it to the owning shard.
    fn on_accept(&mut self, fd: RawFd) {
        if self.tcp_nodelay {
            set_tcp_nodelay(fd);
        }
        metrics::CONNECTIONS_ACCEPTED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();

        let session_id = self.registry.next_available_session();
        match self.registry.join(fd, session_id) {
            Ok(JoinOutcome::Joined { shard, .. }) => {
                debug!(fd, session_id, shard, "accepted connection assigned");
                let posted = self.registry.shard_handle(shard).post(ShardCommand::Adopt {
                    fd,
                    session_id,
                    send_ack: false,
                });
                if !posted {
                    // The owning shard is gone and no recv was ever armed
                    // for this descriptor, so close it directly rather
                    // than through a ring.
                    self.registry.remove(fd);
                    unsafe {
                        libc::close(fd);
                    }
                    metrics::CONNECTIONS_CLOSED.increment();
                    metrics::CONNECTIONS_ACTIVE.decrement();
                }
            }
            // A brand-new descriptor cannot already be a member, and the
            // session ids created at init never disappear.
            _ => {
                error!(fd, session_id, "failed to assign accepted connection");
                unsafe {
                    libc::close(fd);
                }
                metrics::CONNECTIONS_CLOSED.increment();
                metrics::CONNECTIONS_ACTIVE.decrement();
            }
        }
    }
}

fn set_tcp_nodelay(fd: RawFd) {
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Create the listening socket: SO_REUSEADDR, bind, listen.
pub(crate) fn create_listener(addr: SocketAddr, backlog: i32) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::Bind(io::Error::last_os_error().to_string()));
    }

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);

    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Bind(format!("bind {addr}: {err}")));
    }

    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Bind(format!("listen {addr}: {err}")));
    }

    Ok(fd)
}

/// Write a SocketAddr into a sockaddr_storage, return the address length.
fn socket_addr_to_sockaddr(addr: SocketAddr, storage: &mut libc::sockaddr_storage) -> u32 {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as u32
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as u32
        }
    }
}

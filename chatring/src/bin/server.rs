//! The relay server binary.
//!
//! Usage: `chatring-server <host> <port>`
//!
//! Runs until SIGINT or SIGTERM, then stops accepting, halts the shards,
//! and closes all descriptors. Set `CHATRING_LOG_FILE` to also write log
//! records to a file.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use chatring::{ConfigBuilder, ServerBuilder};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::Release);
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("Usage: {} <host> <port>", args[0]);
        return ExitCode::FAILURE;
    }

    let host: IpAddr = match args[1].parse() {
        Ok(host) => host,
        Err(_) => {
            eprintln!("invalid host address: {}", args[1]);
            return ExitCode::FAILURE;
        }
    };
    let port: u16 = match args[2].parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("invalid port: {}", args[2]);
            return ExitCode::FAILURE;
        }
    };

    let log_file = std::env::var_os("CHATRING_LOG_FILE").map(PathBuf::from);
    init_logging(log_file.as_deref());

    let mut builder = ConfigBuilder::new().host(host).port(port);
    if let Some(path) = log_file {
        builder = builder.log_file(path);
    }
    let config = match builder.build() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    let (shutdown, handles) = match ServerBuilder::new(config).launch() {
        Ok(launched) => launched,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };
    info!(%host, port, "server started");

    while !STOP.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    shutdown.shutdown();

    let mut failed = false;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "shard exited with error");
                failed = true;
            }
            Err(_) => {
                error!("shard thread panicked");
                failed = true;
            }
        }
    }

    info!("shutdown complete");
    if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

/// Log to stdout, and to the configured file as well when set.
fn init_logging(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file.and_then(|path| std::fs::File::create(path).ok()) {
        Some(file) => {
            let writer = std::io::stdout.and(std::sync::Mutex::new(file));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

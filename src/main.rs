//! Binary entry point for `tarfs`.
//!
//! Mounts the archive, runs ingest (inline or on a worker thread with
//! `--no-timeout`), keeps the periodic sync ticking when `--sync` was
//! given, and tears the filesystem down on SIGINT/SIGTERM. Serving actual
//! filesystem requests is the job of a host layer driving the
//! [`tarfs::Backend`] trait; this binary only owns the mount lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use tarfs::cli::Args;
use tarfs::{Backend, Filesystem};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    // SAFETY: on_signal only touches an atomic flag, which is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(path) = &args.debug {
        match std::fs::File::create(path) {
            Ok(file) => {
                builder
                    .target(env_logger::Target::Pipe(Box::new(file)))
                    .filter_level(log::LevelFilter::Debug);
            }
            Err(e) => eprintln!("tarfs: cannot open debug file {}: {}", path.display(), e),
        }
    }
    builder.init();
}

fn run(args: &Args) -> anyhow::Result<()> {
    let opts = args.to_options();
    let interval = opts.interval;

    let fs = Arc::new(Filesystem::new(opts).with_context(|| {
        format!("cannot mount archive {}", args.archive.display())
    })?);
    fs.init()
        .with_context(|| format!("invalid tar archive {}", args.archive.display()))?;

    info!("mounted {}", args.archive.display());
    install_signal_handlers();

    // Idle until shutdown, syncing on the interval if one was requested.
    let ticker = interval.map(|secs| crossbeam_channel::tick(Duration::from_secs(secs.max(1))));
    while !SHUTDOWN.load(Ordering::SeqCst) {
        match &ticker {
            Some(tick) => {
                if tick.recv_timeout(Duration::from_millis(200)).is_ok() {
                    if let Err(e) = fs.sync_fs(false) {
                        error!("periodic sync failed: {}", e);
                    }
                }
            }
            None => std::thread::sleep(Duration::from_millis(200)),
        }
    }

    info!("shutting down");
    fs.go_away().context("teardown failed")?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(&args);

    if let Err(e) = run(&args) {
        eprintln!("tarfs: {:#}", e);
        std::process::exit(1);
    }
}

//! pvfs2-client-core: the upcall dispatcher process.
//!
//! Normally run under the pvfs2-client supervisor, which restarts it
//! on signalled exits and interprets its exit status.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use nix::sys::signal::{self, SigHandler, Signal};

use pvfs2_client::dev::Device;
use pvfs2_client::dispatch::{ClientCore, CoreConfig};
use pvfs2_client::error::PvfsError;
use pvfs2_client::security::DEFAULT_KEYFILE;
use pvfs2_client::supervisor::exit_status_byte;
use pvfs2_client::sysint::UnroutedServer;

#[derive(Parser, Debug)]
#[command(
    name = "pvfs2-client-core",
    version,
    about = "PVFS2/OrangeFS client core (upcall dispatcher)"
)]
struct Args {
    #[arg(short = 'a', long = "acache-timeout", value_name = "MS")]
    acache_timeout: Option<u32>,
    #[arg(short = 'n', long = "ncache-timeout", value_name = "MS")]
    ncache_timeout: Option<u32>,
    #[arg(long, value_name = "N")]
    acache_soft_limit: Option<u32>,
    #[arg(long, value_name = "N")]
    acache_hard_limit: Option<u32>,
    #[arg(long, value_name = "P")]
    acache_reclaim_percentage: Option<u32>,
    #[arg(long, value_name = "N")]
    ncache_soft_limit: Option<u32>,
    #[arg(long, value_name = "N")]
    ncache_hard_limit: Option<u32>,
    #[arg(long, value_name = "P")]
    ncache_reclaim_percentage: Option<u32>,
    #[arg(long, value_name = "S")]
    perf_time_interval_secs: Option<u64>,
    #[arg(long, value_name = "N")]
    perf_history_size: Option<usize>,
    #[arg(long, value_name = "MASK")]
    gossip_mask: Option<String>,
    #[arg(long, value_name = "N")]
    desc_count: Option<usize>,
    #[arg(long, value_name = "N")]
    desc_size: Option<usize>,
    #[arg(long, value_name = "LIST")]
    events: Option<String>,
    #[arg(short = 'k', long = "keyfile", value_name = "FILE")]
    keyfile: Option<PathBuf>,
    /// Request device path (testing hook)
    #[arg(long, value_name = "PATH")]
    device: Option<PathBuf>,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn stop_handler(_signum: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn config_from(args: &Args) -> CoreConfig {
    let mut config = CoreConfig {
        acache_timeout_ms: args.acache_timeout,
        acache_soft_limit: args.acache_soft_limit,
        acache_hard_limit: args.acache_hard_limit,
        acache_reclaim_percentage: args.acache_reclaim_percentage,
        ncache_timeout_ms: args.ncache_timeout,
        ncache_soft_limit: args.ncache_soft_limit,
        ncache_hard_limit: args.ncache_hard_limit,
        ncache_reclaim_percentage: args.ncache_reclaim_percentage,
        perf_time_interval_secs: args.perf_time_interval_secs,
        perf_history_size: args.perf_history_size,
        key_file: Some(
            args.keyfile
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KEYFILE)),
        ),
        ..CoreConfig::default()
    };
    if let Some(n) = args.desc_count {
        config.io_desc_count = n;
    }
    if let Some(n) = args.desc_size {
        config.io_desc_size = n;
    }
    config
}

fn exit_with(error: PvfsError) -> ! {
    std::process::exit(exit_status_byte(error) as i32);
}

fn main() {
    let args = Args::parse();
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(mask) = &args.gossip_mask {
        builder.parse_filters(mask);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.init();

    for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
        unsafe {
            let _ = signal::signal(sig, SigHandler::Handler(stop_handler));
        }
    }

    if let Some(events) = &args.events {
        info!("event tracing requested: {}", events);
    }

    let device = match &args.device {
        Some(path) => Device::open_path(path),
        None => Device::open(),
    };
    let device = match device {
        Ok(dev) => dev,
        Err(e) => {
            error!("cannot open request device: {}", e);
            // a racing module load looks like ENOENT/ENODEV; the
            // supervisor sleeps and retries on this status
            exit_with(PvfsError::EDEVINIT);
        }
    };

    // the transport library is linked by the embedder; standalone
    // builds dispatch against the unrouted placeholder
    let server = Arc::new(UnroutedServer);
    let mut core = match ClientCore::new(config_from(&args), server, Arc::new(device)) {
        Ok(core) => core,
        Err(e) => {
            error!("client core initialization failed: {}", e);
            exit_with(e);
        }
    };
    core.start();
    info!("pvfs2-client-core ready");

    match core.run(&STOP) {
        Ok(()) => {}
        Err(e) => {
            error!("client core terminated: {}", e);
            exit_with(e);
        }
    }
}

//! pvfs2-client: supervising parent of the client core.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use log::info;

use pvfs2_client::supervisor::{Supervisor, SupervisorOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogType {
    File,
    Syslog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogStamp {
    Usec,
    None,
    Datetime,
}

#[derive(Parser, Debug)]
#[command(
    name = "pvfs2-client",
    version,
    about = "PVFS2/OrangeFS client supervisor"
)]
struct Args {
    /// Run in the foreground instead of daemonizing
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log destination file
    #[arg(short = 'L', long = "logfile", value_name = "FILE")]
    logfile: Option<PathBuf>,

    /// Attribute cache timeout, milliseconds
    #[arg(short = 'a', long = "acache-timeout", value_name = "MS")]
    acache_timeout: Option<u32>,

    /// Name cache timeout, milliseconds
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

    /// Perf counter rollover interval, seconds
    #[arg(long, value_name = "S")]
    perf_time_interval_secs: Option<u64>,
    /// Perf counter history samples
    #[arg(long, value_name = "N")]
    perf_history_size: Option<usize>,

    /// Logging mask passed to the core (log filter syntax)
    #[arg(long, value_name = "MASK")]
    gossip_mask: Option<String>,

    #[arg(long, value_enum, default_value = "file")]
    logtype: LogType,

    #[arg(long, value_enum, default_value = "usec")]
    logstamp: LogStamp,

    /// Shared I/O region descriptor count
    #[arg(long, value_name = "N")]
    desc_count: Option<usize>,
    /// Shared I/O region descriptor size, bytes
    #[arg(long, value_name = "N")]
    desc_size: Option<usize>,

    /// Event tracing list passed to the core
    #[arg(long, value_name = "LIST")]
    events: Option<String>,

    /// Path of the pvfs2-client-core executable
    #[arg(short = 'p', long = "path", value_name = "PATH", default_value = "pvfs2-client-core")]
    core_path: PathBuf,

    /// Client private key (PEM)
    #[arg(short = 'k', long = "keyfile", value_name = "FILE")]
    keyfile: Option<PathBuf>,
}

fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(mask) = &args.gossip_mask {
        builder.parse_filters(mask);
    } else if args.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    match args.logstamp {
        LogStamp::None => {
            builder.format_timestamp(None);
        }
        LogStamp::Usec => {
            builder.format_timestamp_micros();
        }
        LogStamp::Datetime => {
            builder.format_timestamp_secs();
        }
    }
    if args.logtype == LogType::File {
        if let Some(path) = &args.logfile {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(
                        Box::new(file) as Box<dyn Write + Send>
                    ));
                }
                Err(e) => eprintln!("cannot open logfile {}: {}", path.display(), e),
            }
        }
    }
    builder.init();
}

/// Options the core needs again on its own command line.
fn core_args(args: &Args) -> Vec<String> {
    let mut out = Vec::new();
    let mut push_val = |flag: &str, value: String| {
        out.push(flag.to_owned());
        out.push(value);
    };
    if let Some(v) = args.acache_timeout {
        push_val("--acache-timeout", v.to_string());
    }
    if let Some(v) = args.ncache_timeout {
        push_val("--ncache-timeout", v.to_string());
    }
    if let Some(v) = args.acache_soft_limit {
        push_val("--acache-soft-limit", v.to_string());
    }
    if let Some(v) = args.acache_hard_limit {
        push_val("--acache-hard-limit", v.to_string());
    }
    if let Some(v) = args.acache_reclaim_percentage {
        push_val("--acache-reclaim-percentage", v.to_string());
    }
    if let Some(v) = args.ncache_soft_limit {
        push_val("--ncache-soft-limit", v.to_string());
    }
    if let Some(v) = args.ncache_hard_limit {
        push_val("--ncache-hard-limit", v.to_string());
    }
    if let Some(v) = args.ncache_reclaim_percentage {
        push_val("--ncache-reclaim-percentage", v.to_string());
    }
    if let Some(v) = args.perf_time_interval_secs {
        push_val("--perf-time-interval-secs", v.to_string());
    }
    if let Some(v) = args.perf_history_size {
        push_val("--perf-history-size", v.to_string());
    }
    if let Some(v) = &args.gossip_mask {
        push_val("--gossip-mask", v.clone());
    }
    if let Some(v) = args.desc_count {
        push_val("--desc-count", v.to_string());
    }
    if let Some(v) = args.desc_size {
        push_val("--desc-size", v.to_string());
    }
    if let Some(v) = &args.events {
        push_val("--events", v.clone());
    }
    if let Some(v) = &args.keyfile {
        push_val("--keyfile", v.display().to_string());
    }
    out
}

fn main() {
    let args = Args::parse();
    init_logging(&args);

    if !args.foreground {
        if let Err(e) = nix::unistd::daemon(false, args.logfile.is_some()) {
            eprintln!("failed to daemonize: {}", e);
            std::process::exit(1);
        }
    }

    info!("pvfs2-client starting (core: {})", args.core_path.display());
    let mut supervisor = Supervisor::new(SupervisorOptions {
        core_path: args.core_path.clone(),
        core_args: core_args(&args),
    });
    std::process::exit(supervisor.run());
}

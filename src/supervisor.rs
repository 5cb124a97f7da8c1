//! Client supervisor.
//!
//! Forks and re-execs the dispatcher (`pvfs2-client-core`), watches its
//! exits, and enforces the restart budget: a device-init race retries
//! quietly, a missing device is terminal, and a storm of signalled
//! exits aborts rather than flapping forever.  Termination signals to
//! the supervisor are forwarded so the core drains before the parent
//! leaves.

use std::ffi::CString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::PvfsError;

/// Window within which signalled exits count against the budget.
pub const CLIENT_RESTART_INTERVAL_SECS: u64 = 10;
/// Signalled exits tolerated inside one window.
pub const CLIENT_MAX_RESTARTS: u32 = 10;

/// Retries of the 2.4-kernel device-init race before giving up.
const MAX_DEVINIT_RETRIES: u32 = 10;

/// The exit-status byte a child reports for a PVFS error (exit codes
/// truncate to eight bits on the way through wait).
pub fn exit_status_byte(error: PvfsError) -> u8 {
    error.to_wire_status() as u8
}

/// What a child exit means for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Clean zero exit.
    Clean,
    /// The device-init race; sleep and retry.
    DevInitRace,
    /// The device is gone; terminal.
    DeviceGone,
    /// Any other voluntary exit; terminal.
    OtherFailure,
}

/// Classify a `WIFEXITED` status byte.
pub fn classify_exit_code(code: u8) -> ExitClass {
    if code == 0 {
        ExitClass::Clean
    } else if code == exit_status_byte(PvfsError::EDEVINIT) {
        ExitClass::DevInitRace
    } else if code == exit_status_byte(PvfsError::ENODEV) {
        ExitClass::DeviceGone
    } else {
        ExitClass::OtherFailure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart,
    Abort,
}

/// Counts signalled exits inside a sliding quiet window.
#[derive(Debug)]
pub struct RestartBudget {
    interval: Duration,
    max_restarts: u32,
    count: u32,
    last: Option<Instant>,
}

impl RestartBudget {
    pub fn new() -> RestartBudget {
        RestartBudget::with_limits(
            Duration::from_secs(CLIENT_RESTART_INTERVAL_SECS),
            CLIENT_MAX_RESTARTS,
        )
    }

    pub fn with_limits(interval: Duration, max_restarts: u32) -> RestartBudget {
        RestartBudget {
            interval,
            max_restarts,
            count: 0,
            last: None,
        }
    }

    /// Record a signalled exit.  Inside the window the count grows and
    /// eventually aborts; a quiet period resets it.
    pub fn record_signal_exit(&mut self, now: Instant) -> RestartDecision {
        match self.last {
            Some(prev) if now.duration_since(prev) < self.interval => {
                self.count += 1;
                if self.count >= self.max_restarts {
                    return RestartDecision::Abort;
                }
            }
            _ => self.count = 0,
        }
        self.last = Some(now);
        RestartDecision::Restart
    }

    pub fn restarts_in_window(&self) -> u32 {
        self.count
    }
}

impl Default for RestartBudget {
    fn default() -> Self {
        Self::new()
    }
}

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_handler(signum: libc::c_int) {
    PENDING_SIGNAL.store(signum, Ordering::SeqCst);
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Path of the core executable (`-p`).
    pub core_path: PathBuf,
    /// argv forwarded to the core.
    pub core_args: Vec<String>,
}

/// The supervising parent process.
pub struct Supervisor {
    options: SupervisorOptions,
    budget: RestartBudget,
    devinit_retries: u32,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Supervisor {
        Supervisor {
            options,
            budget: RestartBudget::new(),
            devinit_retries: 0,
        }
    }

    fn install_handlers() {
        for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
            unsafe {
                let _ = signal::signal(sig, SigHandler::Handler(forward_handler));
            }
        }
        unsafe {
            let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
        }
    }

    /// Run until the core exits terminally.  Returns the shell exit
    /// code: 0 for a clean stop, 1 for an abort.
    pub fn run(&mut self) -> i32 {
        Self::install_handlers();
        loop {
            let child = match self.spawn_core() {
                Ok(pid) => pid,
                Err(e) => {
                    error!("could not start {}: {}", self.options.core_path.display(), e);
                    return 1;
                }
            };
            info!("started pvfs2-client-core as pid {}", child);

            match self.wait_for(child) {
                ChildOutcome::Exited(code) => match classify_exit_code(code) {
                    ExitClass::Clean => {
                        info!("client core exited cleanly");
                        return 0;
                    }
                    ExitClass::DevInitRace => {
                        self.devinit_retries += 1;
                        if self.devinit_retries > MAX_DEVINIT_RETRIES {
                            error!("device never initialized; giving up");
                            return 1;
                        }
                        warn!(
                            "device-init race (attempt {}); retrying in 1s",
                            self.devinit_retries
                        );
                        std::thread::sleep(Duration::from_secs(1));
                    }
                    ExitClass::DeviceGone => {
                        error!("request device is gone; not restarting");
                        return 1;
                    }
                    ExitClass::OtherFailure => {
                        error!("client core exited with status {}", code);
                        return 1;
                    }
                },
                ChildOutcome::Signaled(sig) => {
                    warn!("client core killed by signal {}", sig);
                    match self.budget.record_signal_exit(Instant::now()) {
                        RestartDecision::Restart => {
                            info!(
                                "restarting client core ({} restarts in window)",
                                self.budget.restarts_in_window()
                            );
                        }
                        RestartDecision::Abort => {
                            error!(
                                "client core restarted more than {} times in {}s; aborting",
                                CLIENT_MAX_RESTARTS, CLIENT_RESTART_INTERVAL_SECS
                            );
                            return 1;
                        }
                    }
                }
                ChildOutcome::Forwarded => {
                    info!("terminating on forwarded signal");
                    return 0;
                }
            }
        }
    }

    fn spawn_core(&self) -> std::io::Result<Pid> {
        let path = CString::new(self.options.core_path.as_os_str().as_encoded_bytes())
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut argv = vec![path.clone()];
        for arg in &self.options.core_args {
            argv.push(
                CString::new(arg.as_str())
                    .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?,
            );
        }
        match unsafe { fork() }.map_err(std::io::Error::from)? {
            ForkResult::Child => {
                // no core files from the child
                let limit = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                unsafe {
                    libc::setrlimit(libc::RLIMIT_CORE, &limit);
                }
                let _ = nix::unistd::execvp(&path, &argv);
                // exec failed; report as a plain failure exit
                std::process::exit(1);
            }
            ForkResult::Parent { child } => Ok(child),
        }
    }

    fn wait_for(&self, child: Pid) -> ChildOutcome {
        loop {
            let pending = PENDING_SIGNAL.swap(0, Ordering::SeqCst);
            if pending != 0 {
                // forward to the whole group, then drain the child
                if let Ok(sig) = Signal::try_from(pending) {
                    let _ = signal::kill(child, sig);
                }
                let _ = waitpid(child, None);
                return ChildOutcome::Forwarded;
            }
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    return ChildOutcome::Exited(code as u8);
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    return ChildOutcome::Signaled(sig as i32);
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    error!("waitpid failed: {}", e);
                    return ChildOutcome::Exited(1);
                }
            }
        }
    }
}

enum ChildOutcome {
    Exited(u8),
    Signaled(i32),
    Forwarded,
}

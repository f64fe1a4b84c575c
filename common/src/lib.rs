//! Common utilities and types for rwave file distribution
//!
//! This crate implements the distribution scheduler behind the `rwave` tool: a file is copied
//! from an origin host to many target hosts, and every host that received it becomes a source
//! (a *seed*) for the remaining ones.
//!
//! # Core Modules
//!
//! - [`registry`] - Per-target state machine and completion tracking
//! - [`seeds`] - Pool of hosts that hold a complete copy of the file
//! - [`worker`] - Delivery of the file to a single target, with retries
//! - [`distribute`] - Dispatcher bounding the number of concurrent workers
//! - [`metrics`] - Per-transfer records and the statistics log
//! - [`transport`] - The point-to-point transfer collaborator
//! - [`hosts`] - Host lists, host files and numeric host ranges
//!
//! # Runtime
//!
//! [`run`] sets up logging, builds the tokio runtime, configures launch throttling and
//! optionally prints periodic progress while the given async function executes.
//!
//! ```rust,no_run
//! # fn example() {
//! let summary = common::run(
//!     None,
//!     common::OutputConfig::default(),
//!     common::RuntimeConfig::default(),
//!     common::ThrottleConfig::default(),
//!     || async { Ok::<_, anyhow::Error>(common::Summary::default()) },
//! );
//! if summary.is_none() {
//!     std::process::exit(1);
//! }
//! # }
//! ```

use anyhow::Context;
use std::io::IsTerminal;
use tracing::instrument;

pub mod config;
pub mod distribute;
pub mod hosts;
pub mod metrics;
pub mod progress;
pub mod registry;
pub mod seeds;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig};
pub use distribute::{Dispatcher, Error, Report, Settings, Summary};
pub use registry::{Outcome, Target, TargetState};
pub use seeds::Seed;
pub use transport::{TransferOutcome, Transport};

pub static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

/// Periodic progress output
#[derive(Debug, Clone)]
pub struct ProgressSettings {
    /// Human readable delay between updates, e.g. "500ms" or "10s" (default: 10s)
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    fn delay(&self) -> anyhow::Result<std::time::Duration> {
        match self.progress_delay.as_deref() {
            Some(delay) => humantime::parse_duration(delay)
                .with_context(|| format!("invalid progress delay {delay:?}")),
            None => Ok(std::time::Duration::from_secs(10)),
        }
    }
}

/// Name of the machine we are running on.
pub fn local_hostname() -> anyhow::Result<String> {
    let name = nix::unistd::gethostname().context("failed reading local hostname")?;
    name.into_string()
        .map_err(|name| anyhow::anyhow!("local hostname {name:?} is not valid UTF-8"))
}

fn init_tracing(output: &OutputConfig) {
    let level = if output.quiet {
        tracing::level_filters::LevelFilter::OFF
    } else {
        output.log_level().into()
    };
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    // ignore the error, a subscriber may already be installed (e.g. in tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build().context("failed building tokio runtime")
}

async fn print_progress(delay: std::time::Duration) {
    let mut printer = progress::ProgressPrinter::new(&PROGRESS);
    loop {
        tokio::time::sleep(delay).await;
        match printer.print() {
            Ok(text) => eprintln!("{text}"),
            Err(error) => {
                tracing::error!("failed formatting progress: {:#}", &error);
                return;
            }
        }
    }
}

/// Run `func` on a freshly configured runtime.
///
/// Returns `None` if the configuration is invalid or `func` failed; the error has been logged
/// already in that case.
#[instrument(skip(func))]
pub fn run<Fut, Summary, Error>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle: ThrottleConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    init_tracing(&output);
    if let Err(error) = throttle.validate() {
        tracing::error!("{}", error);
        return None;
    }
    let progress_delay = match progress.as_ref().map(ProgressSettings::delay).transpose() {
        Ok(delay) => delay,
        Err(error) => {
            tracing::error!("{:#}", &error);
            return None;
        }
    };
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("{:#}", &error);
            return None;
        }
    };
    let res = runtime.block_on(async {
        if throttle.launch_throttle > 0 {
            // replenish in 10 steps per second for a smoother launch rate
            let (tokens, interval) = if throttle.launch_throttle >= 10 {
                (
                    throttle.launch_throttle / 10,
                    std::time::Duration::from_millis(100),
                )
            } else {
                (
                    1,
                    std::time::Duration::from_secs_f64(1.0 / throttle.launch_throttle as f64),
                )
            };
            throttle::init_launch_tokens(tokens);
            tokio::spawn(throttle::run_launch_replenish_thread(tokens, interval));
        }
        let printer = progress_delay.map(|delay| tokio::spawn(print_progress(delay)));
        let res = func().await;
        if let Some(printer) = printer {
            printer.abort();
        }
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{}", &error);
            }
            None
        }
    }
}

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rwave",
    version,
    about = "Distribute a file to many hosts over SSH, using every host that received it as a new source",
    long_about = "`rwave` copies one file to a large number of hosts. Every host that received the file \
becomes a seed for the remaining ones, so the number of parallel transfers grows as the run \
progresses. Transfers run `scp` on the seed host through `ssh`.

EXAMPLE:
    # Copy an image to 200 nodes, at most 100 transfers at a time
    rwave image.tar /tmp/image.tar --range 'node[001-200]' --concurrency 100 --summary

    # Hosts from a file, logging in as `deploy`, with statistics appended to rwave.log
    rwave image.tar /tmp/image.tar -f hosts.txt -u deploy --stats"
)]
struct Args {
    // Hosts
    /// Whitespace separated list of target hosts (can be specified multiple times)
    #[arg(short = 'l', long = "hosts", value_name = "HOSTS", action = clap::ArgAction::Append, help_heading = "Hosts")]
    hosts: Vec<String>,

    /// File with one target host per line; blank lines and `#` comments are ignored
    #[arg(short = 'f', long = "host-file", value_name = "PATH", action = clap::ArgAction::Append, help_heading = "Hosts")]
    host_files: Vec<std::path::PathBuf>,

    /// Numeric host range, e.g. 'node[01-16,20]' (can be specified multiple times)
    ///
    /// Numbers are zero padded to the width of the range start.
    #[arg(short = 'r', long = "range", value_name = "RANGE", action = clap::ArgAction::Append, help_heading = "Hosts")]
    ranges: Vec<String>,

    /// User name for logging into every host, including the origin
    #[arg(short = 'u', long = "user", value_name = "USER", help_heading = "Hosts")]
    user: Option<String>,

    /// Host holding the source file (default: local hostname)
    #[arg(long, value_name = "HOST", help_heading = "Hosts")]
    origin: Option<String>,

    // Distribution
    /// Maximum number of transfers running at the same time
    #[arg(
        long,
        default_value = "250",
        value_name = "N",
        help_heading = "Distribution"
    )]
    concurrency: usize,

    /// Transfer attempts per host before giving up on it
    #[arg(
        long,
        default_value = "3",
        value_name = "N",
        help_heading = "Distribution"
    )]
    max_attempts: usize,

    /// Abort a single transfer attempt after this long, e.g. "90s" or "10min"
    ///
    /// Without it a stuck transfer holds its slot indefinitely.
    #[arg(long, value_name = "DURATION", help_heading = "Distribution")]
    attempt_timeout: Option<String>,

    /// Wait this long before retrying after a transfer could not be started
    #[arg(
        long,
        default_value = "5s",
        value_name = "DURATION",
        help_heading = "Distribution"
    )]
    launch_backoff: String,

    /// Check every host with `ssh <host> exit` first and skip the unreachable ones
    #[arg(long, help_heading = "Distribution")]
    check_reachable: bool,

    // SSH
    /// SSH and scp port for all hosts (default: ssh default or ~/.ssh/config)
    #[arg(long, value_name = "PORT", help_heading = "SSH")]
    ssh_port: Option<u16>,

    /// Give up connecting to a host after this long, e.g. "10s"
    #[arg(long, value_name = "DURATION", help_heading = "SSH")]
    connect_timeout: Option<String>,

    /// Extra option passed to scp on the seed (can be specified multiple times)
    ///
    /// Example: --scp-option=-c --scp-option=aes128-ctr
    #[arg(long = "scp-option", value_name = "OPTION", action = clap::ArgAction::Append, allow_hyphen_values = true, help_heading = "SSH")]
    scp_options: Vec<String>,

    // Statistics
    /// Append per-transfer statistics to the statistics file after the run
    #[arg(short = 's', long = "stats", help_heading = "Statistics")]
    stats: bool,

    /// Statistics file
    #[arg(
        long,
        default_value = "rwave.log",
        value_name = "PATH",
        help_heading = "Statistics"
    )]
    stats_file: std::path::PathBuf,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Sets the delay between progress updates (default: 10s)
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Throttle the number of transfers started per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    launch_throttle: usize,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// File to distribute
    #[arg()]
    file: std::path::PathBuf,

    /// Destination path of the file on every target host
    #[arg()]
    dest: String,
}

fn parse_duration(value: &str, option: &str) -> Result<std::time::Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid {option} {value:?}"))
}

async fn collect_hosts(args: &Args) -> Result<common::hosts::HostSet> {
    let mut hosts = common::hosts::HostSet::new();
    for list in &args.hosts {
        hosts.extend(common::hosts::parse_host_list(list));
    }
    for path in &args.host_files {
        hosts.extend(common::hosts::read_host_file(path).await?);
    }
    for range in &args.ranges {
        hosts.extend(common::hosts::expand_range(range)?);
    }
    Ok(hosts)
}

/// The first interrupt stops launching new transfers, a second one calls `force_exit`.
///
/// `next_interrupt` resolves to false once no more interrupts can be received.
async fn handle_interrupts<F, Fut>(
    mut next_interrupt: F,
    cancel: tokio_util::sync::CancellationToken,
    force_exit: impl FnOnce(),
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    if !next_interrupt().await {
        return;
    }
    tracing::warn!(
        "interrupted, waiting for running transfers to finish (press Ctrl-C again to quit)"
    );
    cancel.cancel();
    if next_interrupt().await {
        eprintln!("interrupted again, exiting");
        force_exit();
    }
}

#[instrument]
async fn async_main(args: Args) -> Result<common::Summary> {
    let metadata = tokio::fs::metadata(&args.file)
        .await
        .with_context(|| format!("cannot access {:?}", args.file))?;
    if !metadata.is_file() {
        return Err(anyhow!("{:?} is not a regular file", args.file));
    }
    let source = tokio::fs::canonicalize(&args.file)
        .await
        .with_context(|| format!("failed resolving {:?}", args.file))?;
    let source = source
        .to_str()
        .ok_or_else(|| anyhow!("source path {:?} is not valid UTF-8", source))?
        .to_string();
    let hosts = collect_hosts(&args).await?;
    let targets = common::hosts::build_targets(&hosts, args.user.as_deref(), &args.dest);
    if targets.is_empty() {
        return Err(common::Error::NoTargets.into());
    }
    let origin_host = match &args.origin {
        Some(origin) => origin.clone(),
        None => common::local_hostname()?,
    };
    let origin = common::Seed::new(
        common::hosts::qualify(&origin_host, args.user.as_deref()),
        source,
    );
    let settings = common::Settings {
        concurrency_limit: args.concurrency,
        max_attempts: args.max_attempts,
        attempt_timeout: args
            .attempt_timeout
            .as_deref()
            .map(|value| parse_duration(value, "attempt timeout"))
            .transpose()?,
        launch_backoff: parse_duration(&args.launch_backoff, "launch backoff")?,
        check_reachable: args.check_reachable,
    };
    let transport = remote::SshTransport::new(remote::SshConfig {
        port: args.ssh_port,
        connect_timeout: args
            .connect_timeout
            .as_deref()
            .map(|value| parse_duration(value, "connect timeout"))
            .transpose()?,
        scp_options: args.scp_options.clone(),
    });
    let cancel = tokio_util::sync::CancellationToken::new();
    tokio::spawn(handle_interrupts(
        || async { tokio::signal::ctrl_c().await.is_ok() },
        cancel.clone(),
        || {
            std::process::exit(130);
        },
    ));
    println!(
        "transferring {} to {} host(s)...",
        args.file.display(),
        targets.len()
    );
    let report = common::Dispatcher::new(std::sync::Arc::new(transport), settings)
        .with_cancellation(cancel)
        .distribute(targets, origin)
        .await?;
    if args.stats {
        common::metrics::append_to_log(&args.stats_file, &report.metrics).await?;
    }
    let summary = report.summary;
    println!("received by: {}/{} hosts", summary.done, summary.targets);
    println!("file size: {}", bytesize::ByteSize(metadata.len()));
    println!("elapsed time: {:.2}s", summary.elapsed.as_secs_f64());
    for outcome in report.failed() {
        tracing::error!(
            "{}: {}",
            &outcome.target,
            outcome.error.as_deref().unwrap_or("failed")
        );
    }
    if summary.failed > 0 {
        return Err(common::Error::Failed { summary }.into());
    }
    Ok(summary)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        launch_throttle: args.launch_throttle,
    };
    let res = common::run(
        if args.progress || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}

//! Epidemic distribution of one file across many hosts
//!
//! The dispatcher drains the target registry, starting one worker per target while holding a
//! concurrency slot for it. Every worker that succeeds turns its target into another seed, so
//! the number of sources grows as the run progresses.
//!
//! # Retry diversity
//!
//! Seeds are never removed from the pool, even when transfers from them keep failing. To avoid
//! drawing the same bad seed over and over, a worker skips seeds that already failed for its
//! target whenever another seed is idle at that moment.

use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tracing::instrument;

use crate::registry::{Outcome, Target, TargetState};
use crate::seeds::Seed;
use crate::transport::Transport;
use crate::worker::{self, Shared};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("There are no targets")]
    NoTargets,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("{} of {} target(s) did not receive the file", .summary.failed, .summary.targets)]
    Failed { summary: Summary },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Scheduler configuration for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum number of workers running at the same time
    pub concurrency_limit: usize,
    /// Transfer attempts per target before it is given up
    pub max_attempts: usize,
    /// Upper bound for a single transfer attempt (None = wait forever)
    pub attempt_timeout: Option<std::time::Duration>,
    /// Pause before retrying after a worker could not be launched
    pub launch_backoff: std::time::Duration,
    /// Probe every target before dispatching and fail the unreachable ones right away
    pub check_reachable: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency_limit: 250,
            max_attempts: 3,
            attempt_timeout: None,
            launch_backoff: std::time::Duration::from_secs(5),
            check_reachable: false,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency_limit == 0 {
            return Err("concurrency limit must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max attempts must be at least 1".to_string());
        }
        if self.attempt_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err("attempt timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    pub targets: usize,
    pub done: usize,
    pub failed: usize,
    pub attempts: usize,
    pub seeds: usize,
    pub peak_workers: usize,
    pub elapsed: std::time::Duration,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "targets: {}\n\
            received: {}\n\
            failed: {}\n\
            transfer attempts: {}\n\
            seeds: {}\n\
            peak workers: {}\n\
            elapsed: {:.2}s",
            self.targets,
            self.done,
            self.failed,
            self.attempts,
            self.seeds,
            self.peak_workers,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Everything known about a finished run.
#[derive(Debug, Clone)]
pub struct Report {
    pub summary: Summary,
    /// One outcome per target, in completion order
    pub outcomes: Vec<Outcome>,
    pub metrics: Vec<crate::metrics::MetricsRecord>,
    pub seeds: Vec<Seed>,
}

impl Report {
    pub fn failed(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.state == TargetState::Failed)
    }
}

/// Starts worker tasks for the dispatcher.
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        task: futures::future::BoxFuture<'static, ()>,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>>;
}

/// Runs every worker as a task on the current tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

impl Launcher for TokioLauncher {
    fn launch(
        &self,
        task: futures::future::BoxFuture<'static, ()>,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current()?;
        Ok(handle.spawn(task))
    }
}

pub struct Dispatcher<T, L = TokioLauncher> {
    transport: Arc<T>,
    launcher: L,
    settings: Settings,
    cancel: tokio_util::sync::CancellationToken,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: Arc<T>, settings: Settings) -> Self {
        Self {
            transport,
            launcher: TokioLauncher,
            settings,
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }
}

impl<T: Transport, L: Launcher> Dispatcher<T, L> {
    pub fn with_launcher<M: Launcher>(self, launcher: M) -> Dispatcher<T, M> {
        Dispatcher {
            transport: self.transport,
            launcher,
            settings: self.settings,
            cancel: self.cancel,
        }
    }

    /// Token that stops dispatching new workers when cancelled.
    ///
    /// Workers already running finish their current attempt but do not retry. Targets that
    /// were never dispatched are reported as failed.
    pub fn with_cancellation(mut self, cancel: tokio_util::sync::CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Deliver the file from `origin` to every target.
    ///
    /// Duplicate targets are collapsed. Returns once every target reached a terminal state.
    #[instrument(skip_all, fields(origin = %origin, targets = targets.len()))]
    pub async fn distribute(&self, targets: Vec<Target>, origin: Seed) -> Result<Report, Error> {
        self.settings.validate().map_err(Error::InvalidSettings)?;
        if targets.is_empty() {
            return Err(Error::NoTargets);
        }
        let shared = Arc::new(Shared::new(
            self.transport.clone(),
            self.settings.clone(),
            self.cancel.clone(),
        ));
        for target in targets {
            shared.registry.enqueue(target);
        }
        let total = shared.registry.len();
        tracing::info!("distributing to {} unique target(s)", total);
        shared.seeds.promote(origin);
        let slots = throttle::Slots::new(self.settings.concurrency_limit);
        if self.settings.check_reachable {
            check_reachable(&shared, self.settings.concurrency_limit).await;
        }
        let handles = self.dispatch(&shared, &slots).await?;
        for (target, handle) in handles {
            if let Err(error) = handle.await {
                tracing::error!("worker for {} did not finish: {}", &target, &error);
                shared
                    .registry
                    .mark_done(Outcome::failed(target, 0, format!("worker failed: {error}")));
            }
        }
        shared.registry.wait_until_all_done().await;
        let outcomes = shared.registry.outcomes();
        let summary = Summary {
            targets: total,
            done: outcomes
                .iter()
                .filter(|outcome| outcome.state == TargetState::Done)
                .count(),
            failed: outcomes
                .iter()
                .filter(|outcome| outcome.state == TargetState::Failed)
                .count(),
            attempts: outcomes.iter().map(|outcome| outcome.attempts).sum(),
            seeds: shared.seeds.len(),
            peak_workers: shared.peak_workers(),
            elapsed: shared.metrics.elapsed(),
        };
        tracing::info!(
            "distribution finished: {}/{} received the file",
            summary.done,
            summary.targets
        );
        Ok(Report {
            summary,
            outcomes,
            metrics: shared.metrics.records(),
            seeds: shared.seeds.members(),
        })
    }

    async fn dispatch(
        &self,
        shared: &Arc<Shared<T>>,
        slots: &throttle::Slots,
    ) -> anyhow::Result<Vec<(Target, tokio::task::JoinHandle<()>)>> {
        let mut handles = vec![];
        loop {
            let slot = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    abort_pending(shared);
                    break;
                }
                slot = slots.acquire() => slot?,
            };
            throttle::get_launch_token().await;
            let Some(target) = shared.registry.dequeue() else {
                tracing::debug!("no pending targets left, waiting for in-flight transfers");
                break;
            };
            let task = {
                let shared = shared.clone();
                let target = target.clone();
                async move {
                    worker::run(shared, target, slot).await;
                }
                .boxed()
            };
            match self.launcher.launch(task) {
                Ok(handle) => handles.push((target, handle)),
                Err(error) => {
                    // the dropped task released its slot
                    tracing::error!(
                        "failed launching worker for {}: {:#}, trying again in {:?}",
                        &target,
                        &error,
                        self.settings.launch_backoff
                    );
                    shared.registry.requeue(target);
                    tokio::time::sleep(self.settings.launch_backoff).await;
                }
            }
        }
        Ok(handles)
    }
}

fn abort_pending<T: Transport>(shared: &Shared<T>) {
    let pending = shared.registry.drain_pending();
    if !pending.is_empty() {
        tracing::warn!("aborting: {} target(s) will not be attempted", pending.len());
    }
    for target in pending {
        shared
            .registry
            .mark_done(Outcome::failed(target, 0, "aborted before transfer"));
    }
}

async fn check_reachable<T: Transport>(shared: &Arc<Shared<T>>, limit: usize) {
    let mut targets = vec![];
    while let Some(target) = shared.registry.dequeue() {
        targets.push(target);
    }
    tracing::info!("checking that {} host(s) are reachable", targets.len());
    let mut probes = futures::stream::iter(targets)
        .map(|target| async move {
            let reachable = shared.transport.is_reachable(&target.host).await;
            (target, reachable)
        })
        .buffer_unordered(limit);
    while let Some((target, reachable)) = probes.next().await {
        if reachable {
            shared.registry.requeue(target);
        } else {
            tracing::error!("{} is not reachable, skipping", &target.host);
            shared
                .registry
                .mark_done(Outcome::failed(target, 0, "host is not reachable"));
        }
    }
}

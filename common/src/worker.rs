//! Per-target worker: seed checkout, attempts with retry and the terminal outcome

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::instrument;

use crate::distribute::Settings;
use crate::metrics::MetricsRecorder;
use crate::registry::{Outcome, Registry, Target};
use crate::seeds::{Seed, SeedPool};
use crate::transport::{TransferOutcome, Transport};

/// State shared by the dispatcher and all of its workers for one run.
#[derive(Debug)]
pub struct Shared<T> {
    pub registry: Registry,
    pub seeds: SeedPool,
    pub metrics: MetricsRecorder,
    pub transport: Arc<T>,
    pub settings: Settings,
    pub cancel: tokio_util::sync::CancellationToken,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl<T: Transport> Shared<T> {
    pub fn new(
        transport: Arc<T>,
        settings: Settings,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            registry: Registry::new(),
            seeds: SeedPool::new(),
            metrics: MetricsRecorder::new(),
            transport,
            settings,
            cancel,
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }

    /// Workers currently running.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Highest number of workers that ran at the same time.
    pub fn peak_workers(&self) -> usize {
        self.peak_active.load(Ordering::Acquire)
    }
}

struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
}

impl<'a> ActiveGuard<'a> {
    fn new(active: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::AcqRel) + 1;
        peak.fetch_max(now, Ordering::AcqRel);
        Self { active }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Deliver the file to one target.
///
/// Owns the concurrency slot for the duration of the work and reports exactly one terminal
/// outcome to the registry, whatever happens to the individual attempts.
#[instrument(skip_all, fields(target = %target))]
pub async fn run<T: Transport>(
    shared: Arc<Shared<T>>,
    target: Target,
    slot: throttle::Slot,
) -> Outcome {
    let active = ActiveGuard::new(&shared.active, &shared.peak_active);
    let progress_guard = crate::PROGRESS.workers.enter();
    let outcome = transfer_with_retries(&shared, &target).await;
    match &outcome.error {
        None => tracing::debug!("{} done after {} attempt(s)", &target, outcome.attempts),
        Some(error) => tracing::error!(
            "{}: giving up after {} attempt(s): {}",
            &target,
            outcome.attempts,
            error
        ),
    }
    drop(progress_guard);
    drop(active);
    drop(slot);
    shared.registry.mark_done(outcome.clone());
    outcome
}

async fn transfer_with_retries<T: Transport>(shared: &Shared<T>, target: &Target) -> Outcome {
    let max_attempts = std::cmp::max(1, shared.settings.max_attempts);
    let mut failed_seeds = HashSet::new();
    let mut last_error = String::from("no transfer attempted");
    let mut attempts = 0;
    while attempts < max_attempts {
        if attempts > 0 && shared.cancel.is_cancelled() {
            last_error = format!("aborted, last error: {last_error}");
            break;
        }
        let seed = match shared.seeds.checkout_avoiding(&failed_seeds).await {
            Ok(seed) => seed,
            Err(error) => return Outcome::failed(target.clone(), attempts, format!("{error:#}")),
        };
        attempts += 1;
        crate::PROGRESS.attempts.inc();
        tracing::debug!("attempt {}/{}: {} -> {}", attempts, max_attempts, &seed, target);
        let result = attempt(shared, &seed, target).await;
        // the seed stays usable whatever happened on this attempt
        shared.seeds.checkin(seed.clone());
        match result {
            TransferOutcome::Success => {
                tracing::info!("{} -> {}... success", &seed, target);
                shared
                    .metrics
                    .record_with(|| shared.seeds.promote(Seed::from(target)));
                crate::PROGRESS.transfers_succeeded.inc();
                crate::PROGRESS.seeds_promoted.inc();
                return Outcome::done(target.clone(), attempts);
            }
            TransferOutcome::Failure { .. } => {
                tracing::warn!("{} -> {}... {}", &seed, target, &result);
                crate::PROGRESS.transfers_failed.inc();
                last_error = result.to_string();
                failed_seeds.insert(seed);
            }
        }
    }
    Outcome::failed(target.clone(), attempts, last_error)
}

async fn attempt<T: Transport>(
    shared: &Shared<T>,
    seed: &Seed,
    target: &Target,
) -> TransferOutcome {
    let transfer = shared.transport.transfer(seed, target);
    match shared.settings.attempt_timeout {
        Some(timeout) => tokio::time::timeout(timeout, transfer)
            .await
            .unwrap_or_else(|_| {
                TransferOutcome::failure(
                    None,
                    format!("timed out after {}", humantime::format_duration(timeout)),
                )
            }),
        None => transfer.await,
    }
}

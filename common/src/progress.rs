//! Progress counters shared by all workers and the periodic progress printer
//!
//! Counters are kept per thread and summed on read, so workers never contend on them.

/// Monotonic counter with one cell per thread.
#[derive(Debug, Default)]
pub struct TlsCounter {
    cells: thread_local::ThreadLocal<parking_lot::Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, value: u64) {
        *self.cells.get_or_default().lock() += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.cells.iter().map(|cell| *cell.lock()).sum()
    }
}

/// Worker tasks launched and finished.
#[derive(Debug, Default)]
pub struct WorkerGauge {
    launched: TlsCounter,
    finished: TlsCounter,
}

/// Counts a worker as running until dropped.
pub struct RunningWorker<'a> {
    gauge: &'a WorkerGauge,
}

impl Drop for RunningWorker<'_> {
    fn drop(&mut self) {
        self.gauge.finished.inc();
    }
}

impl WorkerGauge {
    pub fn enter(&self) -> RunningWorker<'_> {
        self.launched.inc();
        RunningWorker { gauge: self }
    }

    pub fn finished(&self) -> u64 {
        self.finished.get()
    }

    /// Workers currently running.
    ///
    /// The two counters are read separately, so a worker finishing in between may make
    /// `finished` overtake `launched` for one reading.
    pub fn running(&self) -> u64 {
        let finished = self.finished.get();
        self.launched.get().saturating_sub(finished)
    }
}

/// Process-wide counters updated by the workers.
pub struct Progress {
    pub workers: WorkerGauge,
    pub attempts: TlsCounter,
    pub transfers_succeeded: TlsCounter,
    pub transfers_failed: TlsCounter,
    pub seeds_promoted: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            workers: Default::default(),
            attempts: Default::default(),
            transfers_succeeded: Default::default(),
            transfers_failed: Default::default(),
            seeds_promoted: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_succeeded: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_succeeded: progress.transfers_succeeded.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> anyhow::Result<String> {
        let time_now = std::time::Instant::now();
        let succeeded = self.progress.transfers_succeeded.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let average_rate = succeeded as f64 / total_duration_secs;
        let current_rate =
            succeeded.saturating_sub(self.last_succeeded) as f64 / curr_duration_secs;
        self.last_succeeded = succeeded;
        self.last_update = time_now;
        Ok(format!(
            "---------------------\n\
            WORKERS:\n\
            in flight: {:>10}\n\
            finished:  {:>10}\n\
            -----------------------\n\
            TRANSFERS:\n\
            attempts:  {:>10}\n\
            succeeded: {:>10}\n\
            failed:    {:>10}\n\
            seeds:     {:>10}\n\
            average:   {:>10.2} hosts/s\n\
            current:   {:>10.2} hosts/s",
            self.progress.workers.running(),
            self.progress.workers.finished(),
            self.progress.attempts.get(),
            succeeded,
            self.progress.transfers_failed.get(),
            self.progress.seeds_promoted.get(),
            average_rate,
            current_rate,
        ))
    }
}

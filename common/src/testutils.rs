use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::registry::Target;
use crate::seeds::Seed;
use crate::transport::{TransferOutcome, Transport};

/// One call to [`MockTransport::transfer`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    pub seed: String,
    pub target: String,
    pub success: bool,
}

/// In-memory transport with scripted failures.
#[derive(Debug, Default)]
pub struct MockTransport {
    failing_hosts: HashSet<String>,
    failing_seeds: HashSet<String>,
    hanging_hosts: HashSet<String>,
    unreachable_hosts: HashSet<String>,
    delay: Option<std::time::Duration>,
    log: parking_lot::Mutex<Vec<TransferLog>>,
    attempts: parking_lot::Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    busy_seeds: parking_lot::Mutex<HashSet<String>>,
    shared_seed_uses: AtomicUsize,
}

/// Marks one transfer as running until dropped, including when a timeout drops the future.
struct InFlight<'a> {
    transport: &'a MockTransport,
    seed: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.transport.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.transport.busy_seeds.lock().remove(&self.seed);
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transfer to `host` fails.
    pub fn failing_host(mut self, host: &str) -> Self {
        self.failing_hosts.insert(host.to_string());
        self
    }

    /// Every transfer from `host` fails.
    pub fn failing_seed(mut self, host: &str) -> Self {
        self.failing_seeds.insert(host.to_string());
        self
    }

    /// Transfers to `host` never complete.
    pub fn hanging_host(mut self, host: &str) -> Self {
        self.hanging_hosts.insert(host.to_string());
        self
    }

    pub fn unreachable_host(mut self, host: &str) -> Self {
        self.unreachable_hosts.insert(host.to_string());
        self
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn attempts_to(&self, host: &str) -> usize {
        self.attempts.lock().get(host).copied().unwrap_or(0)
    }

    pub fn log(&self) -> Vec<TransferLog> {
        self.log.lock().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Transfers that started from a seed another transfer was still using.
    pub fn shared_seed_uses(&self) -> usize {
        self.shared_seed_uses.load(Ordering::Acquire)
    }

    fn start(&self, seed: &Seed) -> InFlight<'_> {
        if !self.busy_seeds.lock().insert(seed.host.clone()) {
            self.shared_seed_uses.fetch_add(1, Ordering::AcqRel);
        }
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        InFlight {
            transport: self,
            seed: seed.host.clone(),
        }
    }
}

impl Transport for MockTransport {
    async fn transfer(&self, seed: &Seed, target: &Target) -> TransferOutcome {
        *self.attempts.lock().entry(target.host.clone()).or_default() += 1;
        let running = self.start(seed);
        if self.hanging_hosts.contains(&target.host) {
            std::future::pending::<()>().await;
        }
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        let success =
            !self.failing_hosts.contains(&target.host) && !self.failing_seeds.contains(&seed.host);
        self.log.lock().push(TransferLog {
            seed: seed.host.clone(),
            target: target.host.clone(),
            success,
        });
        drop(running);
        if success {
            TransferOutcome::Success
        } else {
            TransferOutcome::failure(Some(1), format!("lost connection to {}", target.host))
        }
    }

    async fn is_reachable(&self, host: &str) -> bool {
        !self.unreachable_hosts.contains(host)
    }
}

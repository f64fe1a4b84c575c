//! Pool of hosts holding a full copy of the file
//!
//! Idle seeds travel through an unbounded channel, so a checkout waits while every seed is
//! busy and each seed is held by at most one worker. Membership is tracked separately because
//! seeds are never removed: once a host has the file it stays a seed until the run ends.

use std::collections::HashSet;

use anyhow::Context;

use crate::registry::Target;

/// A host usable as a transfer source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Seed {
    /// Host address, optionally qualified as `user@host`
    pub host: String,
    /// Location of the file on the host
    pub path: String,
}

impl Seed {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }
}

impl From<&Target> for Seed {
    fn from(target: &Target) -> Self {
        Self {
            host: target.host.clone(),
            path: target.path.clone(),
        }
    }
}

impl std::fmt::Display for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.path)
    }
}

#[derive(Debug)]
pub struct SeedPool {
    idle_tx: async_channel::Sender<Seed>,
    idle_rx: async_channel::Receiver<Seed>,
    members: parking_lot::Mutex<Vec<Seed>>,
}

impl Default for SeedPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SeedPool {
    pub fn new() -> Self {
        let (idle_tx, idle_rx) = async_channel::unbounded();
        Self {
            idle_tx,
            idle_rx,
            members: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Take an idle seed, waiting until one is checked in if necessary.
    pub async fn checkout(&self) -> anyhow::Result<Seed> {
        let seed = self
            .idle_rx
            .recv()
            .await
            .context("seed pool channel closed")?;
        tracing::trace!("checked out seed {}", &seed);
        Ok(seed)
    }

    /// Take an idle seed, preferring one that is not in `avoid`.
    ///
    /// Waits only for the first seed. If that one is to be avoided, the other idle seeds are
    /// scanned without waiting; when all of them are to be avoided as well, the first one is
    /// returned anyway.
    pub async fn checkout_avoiding(&self, avoid: &HashSet<Seed>) -> anyhow::Result<Seed> {
        let first = self.checkout().await?;
        if !avoid.contains(&first) {
            return Ok(first);
        }
        let mut skipped = vec![];
        let mut chosen = None;
        while let Ok(seed) = self.idle_rx.try_recv() {
            if avoid.contains(&seed) {
                skipped.push(seed);
            } else {
                chosen = Some(seed);
                break;
            }
        }
        for seed in skipped {
            self.checkin(seed);
        }
        match chosen {
            Some(seed) => {
                tracing::debug!("skipped seed {} in favor of {}", &first, &seed);
                self.checkin(first);
                Ok(seed)
            }
            None => Ok(first),
        }
    }

    /// Return a checked-out seed to the pool.
    pub fn checkin(&self, seed: Seed) {
        tracing::trace!("checked in seed {}", &seed);
        if let Err(error) = self.idle_tx.try_send(seed) {
            // unbounded and never closed while the pool is alive
            tracing::error!("failed returning seed to the pool: {}", error);
        }
    }

    /// Add a host that just received the file as a new seed; returns the number of seeds.
    pub fn promote(&self, seed: Seed) -> usize {
        let mut members = self.members.lock();
        if members.contains(&seed) {
            tracing::warn!("{} is already a seed", &seed);
            return members.len();
        }
        members.push(seed.clone());
        let count = members.len();
        // under the membership lock so counts reported by concurrent promotions stay ordered
        self.checkin(seed);
        count
    }

    /// Number of seeds, including the ones currently checked out.
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of seeds waiting in the pool.
    pub fn available(&self) -> usize {
        self.idle_rx.len()
    }

    pub fn members(&self) -> Vec<Seed> {
        self.members.lock().clone()
    }
}

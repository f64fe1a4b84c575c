//! Pending recipients and completion tracking
//!
//! The registry owns every target for the lifetime of a run. It hands out pending targets to
//! the dispatcher, records one terminal outcome per target and lets callers wait until no
//! target is outstanding anymore.

use std::collections::{HashMap, VecDeque};

/// A host that should receive the file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Host address, optionally qualified as `user@host`
    pub host: String,
    /// Destination path on the host
    pub path: String,
}

impl Target {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl TargetState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TargetState::Done | TargetState::Failed)
    }
}

/// Terminal result for a single target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub target: Target,
    pub state: TargetState,
    pub attempts: usize,
    /// Diagnostic of the last failed attempt
    pub error: Option<String>,
}

impl Outcome {
    pub fn done(target: Target, attempts: usize) -> Self {
        Self {
            target,
            state: TargetState::Done,
            attempts,
            error: None,
        }
    }

    pub fn failed(target: Target, attempts: usize, error: impl Into<String>) -> Self {
        Self {
            target,
            state: TargetState::Failed,
            attempts,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Target>,
    states: HashMap<Target, TargetState>,
    outstanding: usize,
    outcomes: Vec<Outcome>,
}

#[derive(Debug)]
pub struct Registry {
    state: parking_lot::Mutex<State>,
    // published under the state lock so the count and the wake-up are one step
    outstanding_tx: tokio::sync::watch::Sender<usize>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (outstanding_tx, _) = tokio::sync::watch::channel(0);
        Self {
            state: parking_lot::Mutex::new(State::default()),
            outstanding_tx,
        }
    }

    /// Add a new target. Returns `false` (and changes nothing) if the target is already known.
    pub fn enqueue(&self, target: Target) -> bool {
        let mut state = self.state.lock();
        if state.states.contains_key(&target) {
            tracing::debug!("ignoring duplicate target {}", &target);
            return false;
        }
        state.states.insert(target.clone(), TargetState::Pending);
        state.pending.push_back(target);
        state.outstanding += 1;
        self.outstanding_tx.send_replace(state.outstanding);
        true
    }

    /// Put a dequeued target back without counting it again.
    pub fn requeue(&self, target: Target) {
        let mut state = self.state.lock();
        match state.states.get(&target).copied() {
            Some(TargetState::InFlight) => {
                state.states.insert(target.clone(), TargetState::Pending);
                state.pending.push_back(target);
            }
            other => {
                tracing::warn!("cannot requeue {} in state {:?}", &target, other);
            }
        }
    }

    /// Pull the next pending target without waiting.
    pub fn dequeue(&self) -> Option<Target> {
        let mut state = self.state.lock();
        let target = state.pending.pop_front()?;
        state.states.insert(target.clone(), TargetState::InFlight);
        Some(target)
    }

    /// Record the terminal outcome of a target.
    ///
    /// The outstanding count is decremented exactly once per target; a second outcome for the
    /// same target is logged and dropped.
    pub fn mark_done(&self, outcome: Outcome) {
        let mut state = self.state.lock();
        if !outcome.state.is_terminal() {
            tracing::error!(
                "refusing non-terminal outcome {:?} for {}",
                outcome.state,
                &outcome.target
            );
            return;
        }
        match state.states.get(&outcome.target).copied() {
            None => {
                tracing::error!("outcome for unknown target {}", &outcome.target);
                return;
            }
            Some(current) if current.is_terminal() => {
                tracing::warn!(
                    "target {} already finished as {:?}",
                    &outcome.target,
                    current
                );
                return;
            }
            Some(TargetState::Pending) => {
                state.pending.retain(|target| target != &outcome.target);
            }
            Some(_) => {}
        }
        state
            .states
            .insert(outcome.target.clone(), outcome.state);
        state.outcomes.push(outcome);
        state.outstanding -= 1;
        self.outstanding_tx.send_replace(state.outstanding);
    }

    /// Remove every target that has not been handed out yet.
    pub fn drain_pending(&self) -> Vec<Target> {
        let mut state = self.state.lock();
        state.pending.drain(..).collect()
    }

    /// Wait until every enqueued target has reached a terminal state.
    pub async fn wait_until_all_done(&self) {
        let mut outstanding_rx = self.outstanding_tx.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = outstanding_rx.wait_for(|outstanding| *outstanding == 0).await;
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self, target: &Target) -> Option<TargetState> {
        self.state.lock().states.get(target).copied()
    }

    /// Terminal outcomes in completion order.
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.state.lock().outcomes.clone()
    }
}

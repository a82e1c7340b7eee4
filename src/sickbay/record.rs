//! Per-component health record
//!
//! The record is the single source of truth for a component's health. All
//! mutations are synchronous and O(1) so callers can hold the record lock for
//! the duration of a commit and release it before any `.await`.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::policy::{self, RestartMode, RestartPolicy};
use super::probe::{ProbeKind, ProbeOutcome, ProbeSet};
use crate::component::state::{Lifecycle, LifecycleEvent, Rejected};
use crate::component::{ComponentHandle, ComponentKind, State};

/// Result of committing a probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// The run the probe was started against is gone
    Stale,
    /// Recorded without a state change
    Unchanged,
    /// Recorded and the component moved to a new state
    Moved(State),
}

/// What to do with an unhealthy component
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    /// Sleep `delay`, then relaunch (only if `generation` still matches)
    Restart {
        delay: Duration,
        attempt: u32,
        generation: u64,
    },
    /// Automatic recovery is over; the leftover handle should be stopped
    GiveUp {
        reason: String,
        handle: Option<ComponentHandle>,
    },
}

/// Mutable health state of one component
#[derive(Debug, Default)]
pub struct HealthRecord {
    lifecycle: Lifecycle,
    /// PID or container of the current run
    pub handle: Option<ComponentHandle>,
    /// Reset to 0 on any probe success
    pub consecutive_failures: u32,
    /// Start of the current run
    pub started_at: Option<Instant>,
    /// Wall-clock start of the current run, for display
    pub started_wall: Option<DateTime<Utc>>,
    /// When startup succeeded for the current run
    pub running_since: Option<Instant>,
    /// Restart trigger times, oldest first
    pub restart_history: VecDeque<Instant>,
    /// Restarts since registration or the last manual restart
    pub restart_count: u32,
    /// Exponential backoff attempt index
    pub backoff_attempt: u32,
    pub last_error: Option<String>,
    /// Readiness flag
    pub ready: bool,
    readiness_failures: u32,
    /// Bumped on every launch and every explicit stop
    pub generation: u64,
    startup_probed: Option<Instant>,
    liveness_probed: Option<Instant>,
    readiness_probed: Option<Instant>,
    last_outcome: Option<String>,
}

impl HealthRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// First launch after registration
    pub fn launch(
        &mut self,
        handle: Option<ComponentHandle>,
        launch_error: Option<String>,
        now: Instant,
    ) -> Result<State, Rejected> {
        let state = self.lifecycle.fire(LifecycleEvent::Launch)?;
        self.begin_run(handle, launch_error, now);
        Ok(state)
    }

    /// Reset per-run fields for a fresh Starting run
    fn begin_run(&mut self, handle: Option<ComponentHandle>, launch_error: Option<String>, now: Instant) {
        self.generation += 1;
        self.handle = handle;
        self.started_at = Some(now);
        self.started_wall = Some(Utc::now());
        self.running_since = None;
        self.ready = false;
        self.readiness_failures = 0;
        self.startup_probed = None;
        self.liveness_probed = None;
        self.readiness_probed = None;

        // A start that failed counts as the first failed check of the new run
        match launch_error {
            Some(err) => {
                self.consecutive_failures = 1;
                self.last_error = Some(err);
            }
            None => self.consecutive_failures = 0,
        }
    }

    /// Probes whose interval has elapsed for the current state
    pub fn due_probes(&self, probes: &ProbeSet, now: Instant) -> Vec<ProbeKind> {
        let due = |last: Option<Instant>, interval: Duration| {
            last.is_none_or(|at| now.saturating_duration_since(at) >= interval)
        };

        let mut kinds = Vec::new();
        match self.state() {
            State::Starting => {
                if due(self.startup_probed, probes.startup.interval) {
                    kinds.push(ProbeKind::Startup);
                }
            }
            State::Running => {
                if due(self.liveness_probed, probes.liveness.interval) {
                    kinds.push(ProbeKind::Liveness);
                }
                if let Some(readiness) = &probes.readiness {
                    if due(self.readiness_probed, readiness.interval) {
                        kinds.push(ProbeKind::Readiness);
                    }
                }
            }
            _ => {}
        }
        kinds
    }

    /// Commit a probe outcome against the run it was started for
    pub fn apply_probe(
        &mut self,
        generation: u64,
        outcome: &ProbeOutcome,
        probes: &ProbeSet,
        restart: &RestartPolicy,
        now: Instant,
    ) -> Commit {
        if generation != self.generation {
            return Commit::Stale;
        }
        self.last_outcome = Some(outcome.summary());

        match (outcome.kind, self.state()) {
            (ProbeKind::Startup, State::Starting) => {
                self.startup_probed = Some(outcome.at);
                if outcome.passed {
                    self.consecutive_failures = 0;
                    self.last_error = None;
                    self.running_since = Some(now);
                    // Without a readiness probe, a running component is ready
                    self.ready = probes.readiness.is_none();
                    return self.fire(LifecycleEvent::Ready);
                }

                self.record_failure(outcome);
                let elapsed = self
                    .started_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                if elapsed >= probes.startup.tolerance_window() {
                    return self.fire(LifecycleEvent::Stall);
                }
                Commit::Unchanged
            }
            (ProbeKind::Liveness, State::Running) => {
                self.liveness_probed = Some(outcome.at);
                let stable = policy::is_stable(self.running_since, now, restart.min_uptime());
                if outcome.passed {
                    self.consecutive_failures = 0;
                    self.last_error = None;
                    if stable {
                        self.backoff_attempt = 0;
                    }
                    return Commit::Unchanged;
                }

                self.record_failure(outcome);
                if policy::should_mark_unhealthy(
                    self.consecutive_failures,
                    probes.liveness.failure_threshold,
                ) {
                    if stable {
                        self.backoff_attempt = 0;
                    }
                    self.running_since = None;
                    self.ready = false;
                    return self.fire(LifecycleEvent::Sicken);
                }
                Commit::Unchanged
            }
            (ProbeKind::Readiness, State::Running) => {
                self.readiness_probed = Some(outcome.at);
                if outcome.passed {
                    self.readiness_failures = 0;
                    self.ready = true;
                } else {
                    self.readiness_failures += 1;
                    let threshold = probes
                        .readiness
                        .as_ref()
                        .map(|r| r.failure_threshold)
                        .unwrap_or(1);
                    if policy::should_mark_unhealthy(self.readiness_failures, threshold) {
                        self.ready = false;
                    }
                }
                Commit::Unchanged
            }
            // Probe was for a state the component already left
            _ => Commit::Unchanged,
        }
    }

    fn record_failure(&mut self, outcome: &ProbeOutcome) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = outcome.error.clone();
    }

    fn fire(&mut self, event: LifecycleEvent) -> Commit {
        match self.lifecycle.fire(event) {
            Ok(state) => Commit::Moved(state),
            Err(_) => Commit::Unchanged,
        }
    }

    /// Decide how to recover an Unhealthy component. `None` for any other state.
    pub fn decide_restart(&mut self, restart: &RestartPolicy, now: Instant) -> Option<RestartDecision> {
        if self.state() != State::Unhealthy {
            return None;
        }
        policy::prune_restart_history(&mut self.restart_history, now, restart.restart_window());

        let reason = if restart.mode == RestartMode::Never {
            Some("restart policy is 'never'".to_string())
        } else if restart.ceiling_reached(&self.restart_history, now) {
            Some(format!(
                "{} restarts within {}s",
                self.restart_history.len(),
                restart.restart_window
            ))
        } else {
            None
        };

        if let Some(reason) = reason {
            self.lifecycle.fire(LifecycleEvent::Condemn).ok()?;
            self.running_since = None;
            self.ready = false;
            return Some(RestartDecision::GiveUp {
                reason,
                handle: self.handle.take(),
            });
        }

        self.lifecycle.fire(LifecycleEvent::Restart).ok()?;
        let attempt = self.backoff_attempt;
        self.backoff_attempt = self.backoff_attempt.saturating_add(1);
        Some(RestartDecision::Restart {
            delay: restart.backoff(attempt),
            attempt,
            generation: self.generation,
        })
    }

    /// Commit a relaunch. Returns false when the restart was superseded.
    pub fn complete_restart(
        &mut self,
        generation: u64,
        handle: Option<ComponentHandle>,
        launch_error: Option<String>,
        now: Instant,
    ) -> bool {
        if generation != self.generation || self.state() != State::Restarting {
            return false;
        }
        if self.lifecycle.fire(LifecycleEvent::Relaunch).is_err() {
            return false;
        }
        self.restart_history.push_back(now);
        self.restart_count = self.restart_count.saturating_add(1);
        self.begin_run(handle, launch_error, now);
        true
    }

    /// Hand over the old handle for a pending relaunch, in the same step as the
    /// generation check. `None` when a newer run has taken over.
    pub fn relaunch_handle(&mut self, generation: u64) -> Option<Option<ComponentHandle>> {
        if generation != self.generation || self.state() != State::Restarting {
            return None;
        }
        Some(self.handle.take())
    }

    /// Explicit stop. Returns the handle that must be stopped.
    pub fn halt(&mut self) -> Result<Option<ComponentHandle>, Rejected> {
        self.lifecycle.fire(LifecycleEvent::Halt)?;
        self.generation += 1;
        self.consecutive_failures = 0;
        self.running_since = None;
        self.ready = false;
        Ok(self.handle.take())
    }

    /// Take whatever handle is left over (used for terminal states)
    pub fn take_handle(&mut self) -> Option<ComponentHandle> {
        self.handle.take()
    }

    /// Manual restart out of Failed or Stopped: history and backoff start over
    pub fn revive(
        &mut self,
        handle: Option<ComponentHandle>,
        launch_error: Option<String>,
        now: Instant,
    ) -> Result<State, Rejected> {
        let state = self.lifecycle.fire(LifecycleEvent::Revive)?;
        self.restart_history.clear();
        self.restart_count = 0;
        self.backoff_attempt = 0;
        self.last_error = None;
        self.begin_run(handle, launch_error, now);
        Ok(state)
    }

    /// Read-only view for the status query
    pub fn snapshot(
        &self,
        id: &str,
        kind: ComponentKind,
        restart: &RestartPolicy,
        now: Instant,
    ) -> ComponentStatus {
        let state = self.state();
        let uptime_secs = match state {
            State::Starting | State::Running | State::Unhealthy => self
                .started_at
                .map(|at| now.saturating_duration_since(at).as_secs()),
            _ => None,
        };
        let window = restart.restart_window();
        let restarts_in_window = self
            .restart_history
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < window)
            .count() as u32;
        let action = (state == State::Failed)
            .then(|| format!("manual restart required: harbormaster restart {}", id));

        ComponentStatus {
            id: id.to_string(),
            kind,
            state,
            handle: self.handle.as_ref().map(|h| h.to_string()),
            started_at: self.started_wall.filter(|_| uptime_secs.is_some()),
            uptime_secs,
            restart_count: self.restart_count,
            restarts_in_window,
            consecutive_failures: self.consecutive_failures,
            ready: self.ready,
            last_error: self.last_error.clone(),
            last_probe: self.last_outcome.clone(),
            action,
        }
    }
}

/// Status row for one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub id: String,
    pub kind: ComponentKind,
    pub state: State,
    /// PID or short container ID
    pub handle: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
    pub restarts_in_window: u32,
    pub consecutive_failures: u32,
    pub ready: bool,
    pub last_error: Option<String>,
    pub last_probe: Option<String>,
    /// Operator hint, set when automatic recovery has given up
    pub action: Option<String>,
}

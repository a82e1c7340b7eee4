//! Restart policy for unhealthy components
//!
//! Configuration plus the side-effect free decisions the Warden consults:
//! when to mark a component unhealthy, how long to back off, and when a
//! crash loop has tripped the restart ceiling.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

/// Whether unhealthy components are restarted at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    /// Restart on every sustained failure until the ceiling trips
    #[default]
    Always,
    /// Never restart; an unhealthy component goes straight to failed
    Never,
}

/// Restart configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RestartPolicy {
    /// Whether to restart at all
    #[serde(default)]
    pub mode: RestartMode,

    /// First backoff delay (seconds)
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u64,

    /// Backoff ceiling (seconds)
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: u64,

    /// Maximum restarts inside the trailing window before giving up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Trailing window for counting restarts (seconds)
    #[serde(default = "default_restart_window")]
    pub restart_window: u64,

    /// Uptime after which a run counts as stable and backoff resets (seconds)
    #[serde(default = "default_min_uptime")]
    pub min_uptime: u64,
}

fn default_backoff_base() -> u64 {
    1
}

fn default_backoff_cap() -> u64 {
    60
}

fn default_max_restarts() -> u32 {
    10
}

fn default_restart_window() -> u64 {
    600
}

fn default_min_uptime() -> u64 {
    10
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            mode: RestartMode::Always,
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            max_restarts: default_max_restarts(),
            restart_window: default_restart_window(),
            min_uptime: default_min_uptime(),
        }
    }
}

impl RestartPolicy {
    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window)
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_secs(self.min_uptime)
    }

    /// Backoff before restart attempt `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        next_backoff(
            attempt,
            Duration::from_secs(self.backoff_base),
            Duration::from_secs(self.backoff_cap),
        )
    }

    /// Check the ceiling against a restart history
    pub fn ceiling_reached(&self, history: &VecDeque<Instant>, now: Instant) -> bool {
        exceeds_restart_ceiling(history, now, self.restart_window(), self.max_restarts)
    }
}

// Builder methods - used by tests and by programmatic registration
#[cfg(test)]
impl RestartPolicy {
    pub fn never() -> Self {
        Self {
            mode: RestartMode::Never,
            ..Default::default()
        }
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_window(mut self, secs: u64) -> Self {
        self.restart_window = secs;
        self
    }

    pub fn with_backoff(mut self, base: u64, cap: u64) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_min_uptime(mut self, secs: u64) -> Self {
        self.min_uptime = secs;
        self
    }
}

/// Sustained failure: `threshold` consecutive failures (a zero threshold acts as one)
pub fn should_mark_unhealthy(consecutive_failures: u32, threshold: u32) -> bool {
    consecutive_failures >= threshold.max(1)
}

/// Exponential backoff: `base * 2^attempt`, capped
pub fn next_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// True when restarts inside the trailing window meet or exceed `max_restarts`
pub fn exceeds_restart_ceiling(
    history: &VecDeque<Instant>,
    now: Instant,
    window: Duration,
    max_restarts: u32,
) -> bool {
    let recent = history
        .iter()
        .filter(|t| now.saturating_duration_since(**t) < window)
        .count();
    recent >= max_restarts as usize
}

/// Evict restart timestamps that fell out of the trailing window
pub fn prune_restart_history(history: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    // History is ordered, so expired entries are all at the front
    while let Some(oldest) = history.front() {
        if now.saturating_duration_since(*oldest) >= window {
            history.pop_front();
        } else {
            break;
        }
    }
}

/// A run is stable once it has been Running for at least `min_uptime`
pub fn is_stable(running_since: Option<Instant>, now: Instant, min_uptime: Duration) -> bool {
    running_since.is_some_and(|since| now.saturating_duration_since(since) >= min_uptime)
}

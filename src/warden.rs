//! The Warden - Component Watchdog
//!
//! Single control loop that keeps components alive:
//! - Ticks fast while anything is starting, steadily otherwise
//! - Spawns at most one task per component; a hung probe only stalls its own component
//! - Restarts unhealthy components with exponential backoff
//! - Stops restarting once the restart ceiling trips, and says so loudly

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::component::launch::Launcher;
use crate::component::{ComponentHandle, State};
use crate::error::Error;
use crate::logbook::Logbook;
use crate::roster::{Claim, ComponentCell, Roster};
use crate::sickbay::probe::{Prober, run_probe};
use crate::sickbay::record::{Commit, RestartDecision};

/// Watchdog timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Tick period while any component is starting
    pub fast_tick: Duration,
    /// Tick period otherwise
    pub steady_tick: Duration,
    /// How long in-flight tasks get to finish on shutdown
    pub shutdown_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            fast_tick: Duration::from_secs(1),
            steady_tick: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// What a component task needs besides its cell
#[derive(Clone)]
struct Crew {
    prober: Arc<dyn Prober>,
    launcher: Arc<dyn Launcher>,
    logbook: Logbook,
}

/// The Warden supervises every registered component
pub struct Warden {
    roster: Arc<Roster>,
    crew: Crew,
    timing: Timing,
}

impl Warden {
    pub fn new(
        roster: Arc<Roster>,
        prober: Arc<dyn Prober>,
        launcher: Arc<dyn Launcher>,
        logbook: Logbook,
        timing: Timing,
    ) -> Self {
        Self {
            roster,
            crew: Crew {
                prober,
                launcher,
                logbook,
            },
            timing,
        }
    }

    /// Run the watchdog until `shutdown` flips to true (or its sender is dropped)
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(components = self.roster.count(), "watchdog started");
        let mut tasks = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "component task panicked");
                    }
                }
            }

            self.tick(&mut tasks, &shutdown);

            tokio::select! {
                _ = sleep(self.period()) => {}
                _ = stopped(&mut shutdown) => break,
            }
        }

        self.drain(tasks).await;
        info!("watchdog stopped");
    }

    /// Spawn a task for every idle component that has something to do
    fn tick(&self, tasks: &mut JoinSet<()>, shutdown: &watch::Receiver<bool>) {
        let now = Instant::now();
        for cell in self.roster.cells() {
            let Some(claim) = cell.try_claim() else {
                continue;
            };
            let pending = cell.read(|r| {
                r.state() == State::Unhealthy || !r.due_probes(&cell.spec().probes, now).is_empty()
            });
            if pending {
                tasks.spawn(tend(claim, self.crew.clone(), shutdown.clone()));
            }
        }
    }

    fn period(&self) -> Duration {
        let starting = self
            .roster
            .cells()
            .iter()
            .any(|c| c.state() == State::Starting);
        if starting {
            self.timing.fast_tick
        } else {
            self.timing.steady_tick
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        let grace = self.timing.shutdown_grace;
        let finished = timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(
                remaining = tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "in-flight component tasks did not finish, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

/// Resolves once shutdown is requested
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// One pass over one component: due probes, then recovery if it went unhealthy
async fn tend(claim: Claim, crew: Crew, mut shutdown: watch::Receiver<bool>) {
    let cell = Arc::clone(claim.cell());
    let spec = cell.spec();

    let (generation, handle, due) = cell.read(|r| {
        (
            r.generation,
            r.handle.clone(),
            r.due_probes(&spec.probes, Instant::now()),
        )
    });

    for kind in due {
        let Some(probe) = spec.probes.spec(kind) else {
            continue;
        };
        let outcome = run_probe(crew.prober.as_ref(), &spec.id, handle.as_ref(), kind, probe).await;
        let commit = cell.update(|r| {
            r.apply_probe(generation, &outcome, &spec.probes, &spec.restart, Instant::now())
        });

        match commit {
            Commit::Stale => {
                debug!(component = %spec.id, probe = %kind, "discarding probe result for a superseded run");
                return;
            }
            Commit::Moved(State::Running) => {
                info!(component = %spec.id, handle = ?handle.as_ref().map(|h| h.to_string()), "component is running");
            }
            Commit::Moved(state) => {
                warn!(
                    component = %spec.id,
                    state = %state,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    "component is {}", state
                );
                break;
            }
            Commit::Unchanged if !outcome.passed => {
                debug!(component = %spec.id, probe = %outcome.summary(), "probe failed");
            }
            Commit::Unchanged => {}
        }
    }

    if cell.state() == State::Unhealthy {
        recover(&cell, &crew, &mut shutdown).await;
    }
}

/// Restart an unhealthy component, or give up on it
async fn recover(cell: &ComponentCell, crew: &Crew, shutdown: &mut watch::Receiver<bool>) {
    let spec = cell.spec();
    let Some(decision) = cell.update(|r| r.decide_restart(&spec.restart, Instant::now())) else {
        return;
    };

    let (delay, attempt, generation) = match decision {
        RestartDecision::GiveUp { reason, handle } => {
            let (restart_count, last_error) =
                cell.read(|r| (r.restart_count, r.last_error.clone()));
            error!(
                component = %spec.id,
                restart_count,
                reason = %reason,
                last_error = last_error.as_deref().unwrap_or_default(),
                "CRASH LOOP: component marked failed, automatic restarts stopped; run `harbormaster restart {}` to recover",
                spec.id
            );
            if let Some(handle) = handle {
                stop_quietly(crew.launcher.as_ref(), &spec.id, &handle).await;
            }
            return;
        }
        RestartDecision::Restart {
            delay,
            attempt,
            generation,
        } => (delay, attempt, generation),
    };

    warn!(
        component = %spec.id,
        attempt,
        delay_ms = delay.as_millis() as u64,
        "restarting component after backoff"
    );

    // Ends early once a stop or manual restart starts a new generation
    tokio::select! {
        _ = sleep(delay) => {}
        _ = cell.superseded(generation) => {
            debug!(component = %spec.id, "restart superseded during backoff");
            return;
        }
        _ = stopped(shutdown) => {
            debug!(component = %spec.id, "shutdown during backoff, restart abandoned");
            return;
        }
    }

    let Some(old) = cell.update(|r| r.relaunch_handle(generation)) else {
        debug!(component = %spec.id, "restart superseded during backoff");
        return;
    };
    if let Some(old) = old {
        stop_quietly(crew.launcher.as_ref(), &spec.id, &old).await;
    }

    let config = crew.logbook.load_or_default(spec);

    let (handle, launch_error) = match crew.launcher.start(&config).await {
        Ok(handle) => (Some(handle), None),
        Err(e) => (None, Some(e.to_string())),
    };

    let committed = cell.update(|r| {
        r.complete_restart(generation, handle.clone(), launch_error.clone(), Instant::now())
    });

    match (committed, handle) {
        (true, _) if launch_error.is_some() => {
            warn!(component = %spec.id, error = launch_error.as_deref().unwrap_or_default(), "restart failed to start component");
        }
        (true, Some(handle)) => {
            info!(component = %spec.id, handle = %handle, "component restarted");
        }
        (false, Some(handle)) => {
            // Stopped or manually restarted while we were starting it
            debug!(component = %spec.id, handle = %handle, "restart superseded, stopping new instance");
            stop_quietly(crew.launcher.as_ref(), &spec.id, &handle).await;
        }
        _ => {}
    }
}

/// Stop a handle; "already gone" is expected and only logged at debug
pub async fn stop_quietly(launcher: &dyn Launcher, component: &str, handle: &ComponentHandle) {
    match launcher.stop(component, handle).await {
        Ok(()) => {}
        Err(Error::NotRunning(_)) => {
            debug!(component = %component, handle = %handle, "already stopped");
        }
        Err(e) => {
            warn!(component = %component, handle = %handle, error = %e, "failed to stop component");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentSpec;
    use crate::component::launch::LaunchConfig;
    use crate::sickbay::RestartPolicy;
    use crate::sickbay::probe::{ProbeSet, ProbeSpec, ProbeTarget};
    use crate::test_support::{ScriptedLauncher, ScriptedProber, Verdict};
    use tokio::task::JoinHandle;

    struct Harness {
        roster: Arc<Roster>,
        prober: Arc<ScriptedProber>,
        launcher: Arc<ScriptedLauncher>,
        shutdown: watch::Sender<bool>,
        watchdog: JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn cell(&self, id: &str) -> Arc<ComponentCell> {
            self.roster.get(id).unwrap()
        }
    }

    /// Register and launch `specs`, then start the watchdog
    async fn harness(specs: Vec<ComponentSpec>, prober: ScriptedProber) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let roster = Arc::new(Roster::new());
        let prober = Arc::new(prober);
        let launcher = Arc::new(ScriptedLauncher::new());
        let logbook = Logbook::new(dir.path());

        for spec in specs {
            let config = LaunchConfig::from_spec(&spec);
            let cell = roster.register(spec).unwrap();
            let handle = launcher.start(&config).await.unwrap();
            logbook.record(&config).unwrap();
            cell.update(|r| r.launch(Some(handle), None, Instant::now())).unwrap();
        }

        let (shutdown, rx) = watch::channel(false);
        let warden = Warden::new(
            Arc::clone(&roster),
            prober.clone(),
            launcher.clone(),
            logbook,
            Timing::default(),
        );
        let watchdog = tokio::spawn(warden.run(rx));

        Harness {
            roster,
            prober,
            launcher,
            shutdown,
            watchdog,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_within_window_reaches_running() {
        let prober = ScriptedProber::new();
        prober.queue("api-server", [Verdict::Fail; 5]);
        let h = harness(vec![ComponentSpec::native("api-server", "api-server")], prober).await;

        for _ in 0..30 {
            sleep(Duration::from_secs(1)).await;
            assert_ne!(h.cell("api-server").state(), State::Unhealthy);
        }

        let status = h.cell("api-server").snapshot(Instant::now());
        assert_eq!(status.state, State::Running);
        assert_eq!(status.restart_count, 0);
        assert_eq!(status.last_error, None);
        assert_eq!(h.launcher.starts("api-server"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_threshold_liveness_failures() {
        let spec = ComponentSpec::native("api-server", "api-server")
            .with_restart(RestartPolicy::default().with_backoff(5, 60));
        let h = harness(vec![spec], ScriptedProber::new()).await;

        sleep(Duration::from_secs(30)).await;
        assert_eq!(h.cell("api-server").state(), State::Running);

        h.prober.fail("api-server");
        let mut max_failures_while_running = 0;
        for _ in 0..120 {
            sleep(Duration::from_secs(1)).await;
            let (state, failures) = h.cell("api-server").read(|r| (r.state(), r.consecutive_failures));
            match state {
                State::Running => max_failures_while_running = max_failures_while_running.max(failures),
                State::Restarting => {
                    assert_eq!(failures, 3);
                    break;
                }
                other => panic!("unexpected state {}", other),
            }
        }
        assert_eq!(max_failures_while_running, 2);
        assert_eq!(h.cell("api-server").state(), State::Restarting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_api_server_recovers_after_liveness_failures() {
        let prober = ScriptedProber::new();
        // Startup passes, then three liveness failures, then healthy again
        prober.queue(
            "api-server",
            [Verdict::Pass, Verdict::Fail, Verdict::Fail, Verdict::Fail],
        );
        let h = harness(vec![ComponentSpec::native("api-server", "api-server")], prober).await;

        sleep(Duration::from_secs(120)).await;

        let status = h.cell("api-server").snapshot(Instant::now());
        assert_eq!(status.state, State::Running);
        assert_eq!(status.restart_count, 1);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.last_error, None);
        assert_eq!(h.launcher.starts("api-server"), 2);
        assert_eq!(h.launcher.stops("api-server"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_worker_crash_loop_ends_failed() {
        let probes = ProbeSet {
            startup: ProbeSpec::startup(ProbeTarget::Handle).with_failure_threshold(5),
            ..ProbeSet::default()
        };
        let spec = ComponentSpec::container("agent-worker", "ghcr.io/acme/agent-runner:1.4")
            .with_probes(probes);
        let prober = ScriptedProber::new();
        prober.fail("agent-worker");
        let h = harness(vec![spec], prober).await;

        for _ in 0..100 {
            sleep(Duration::from_secs(10)).await;
            if h.cell("agent-worker").state() == State::Failed {
                break;
            }
        }

        let status = h.cell("agent-worker").snapshot(Instant::now());
        assert_eq!(status.state, State::Failed);
        assert_eq!(status.restart_count, 10);
        assert!(status.action.unwrap().contains("harbormaster restart agent-worker"));
        assert_eq!(h.launcher.starts("agent-worker"), 11);

        // No 11th restart, ever
        sleep(Duration::from_secs(3600)).await;
        assert_eq!(h.cell("agent-worker").state(), State::Failed);
        assert_eq!(h.launcher.starts("agent-worker"), 11);
        assert_eq!(h.cell("agent-worker").read(|r| r.handle.clone()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_is_a_probe_failure() {
        let probes = ProbeSet {
            startup: ProbeSpec::startup(ProbeTarget::Handle).with_failure_threshold(3),
            ..ProbeSet::default()
        };
        let spec = ComponentSpec::native("workflow-worker", "workflow-worker").with_probes(probes);
        let prober = ScriptedProber::new();
        prober.queue("workflow-worker", [Verdict::Fail; 4]);
        let h = harness(vec![spec], prober).await;
        h.launcher.fail_starts("workflow-worker", 1);

        // Stall, restart with a failed start, stall again, restart for real
        sleep(Duration::from_secs(60)).await;

        let status = h.cell("workflow-worker").snapshot(Instant::now());
        assert_eq!(status.state, State::Running);
        assert_eq!(status.restart_count, 2);
        assert_eq!(h.launcher.starts("workflow-worker"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_does_not_delay_others() {
        let prober = ScriptedProber::new();
        prober.hang("workflow-engine");
        prober.queue("api-server", [Verdict::Fail, Verdict::Fail]);
        let h = harness(
            vec![
                ComponentSpec::native("workflow-engine", "engine"),
                ComponentSpec::native("api-server", "api-server"),
            ],
            prober,
        )
        .await;

        sleep(Duration::from_millis(2500)).await;

        assert_eq!(h.cell("api-server").state(), State::Running);
        assert_eq!(h.prober.calls("api-server"), 3);
        assert_eq!(h.cell("workflow-engine").state(), State::Starting);
        assert_eq!(h.prober.calls("workflow-engine"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_hung_probe_respects_grace() {
        let prober = ScriptedProber::new();
        prober.hang("workflow-engine");
        let spec = ComponentSpec::native("workflow-engine", "engine").with_probes(ProbeSet {
            startup: ProbeSpec::startup(ProbeTarget::Handle).with_timeout(Duration::from_secs(600)),
            ..ProbeSet::default()
        });
        let h = harness(vec![spec], prober).await;

        sleep(Duration::from_millis(100)).await;
        h.shutdown.send(true).unwrap();

        let cell = h.cell("workflow-engine");
        let done = timeout(Duration::from_secs(6), h.watchdog).await;
        assert!(done.is_ok());
        assert!(!cell.is_in_flight());
    }
}

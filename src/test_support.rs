//! Scripted probe and launcher fakes for watchdog and bridge tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::component::ComponentHandle;
use crate::component::launch::{LaunchConfig, Launcher};
use crate::error::{Error, Result};
use crate::sickbay::probe::{ProbeTarget, Prober};

/// How a scripted component answers probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    Hang,
}

#[derive(Debug, Default)]
struct Script {
    queued: VecDeque<Verdict>,
    fallback: Option<Verdict>,
    calls: usize,
}

/// Prober that answers from a per-component script (default: pass)
#[derive(Debug, Default)]
pub struct ScriptedProber {
    scripts: Mutex<HashMap<String, Script>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every probe for `component` with `verdict`
    pub fn set(&self, component: &str, verdict: Verdict) {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(component.to_string()).or_default();
        script.queued.clear();
        script.fallback = Some(verdict);
    }

    pub fn pass(&self, component: &str) {
        self.set(component, Verdict::Pass);
    }

    pub fn fail(&self, component: &str) {
        self.set(component, Verdict::Fail);
    }

    pub fn hang(&self, component: &str) {
        self.set(component, Verdict::Hang);
    }

    /// Answer the next probes from `verdicts`, then fall back
    pub fn queue(&self, component: &str, verdicts: impl IntoIterator<Item = Verdict>) {
        self.scripts
            .lock()
            .entry(component.to_string())
            .or_default()
            .queued
            .extend(verdicts);
    }

    pub fn calls(&self, component: &str) -> usize {
        self.scripts.lock().get(component).map(|s| s.calls).unwrap_or(0)
    }

    fn next(&self, component: &str) -> Verdict {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(component.to_string()).or_default();
        script.calls += 1;
        script
            .queued
            .pop_front()
            .or(script.fallback)
            .unwrap_or(Verdict::Pass)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn check(
        &self,
        component: &str,
        handle: Option<&ComponentHandle>,
        _target: &ProbeTarget,
        _timeout: Duration,
    ) -> std::result::Result<(), String> {
        let verdict = self.next(component);
        if handle.is_none() {
            return Err(format!("{} has no running process", component));
        }
        match verdict {
            Verdict::Pass => Ok(()),
            Verdict::Fail => Err(format!("{} probe failed", component)),
            Verdict::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// Launcher that hands out fake PIDs and records every call
#[derive(Debug)]
pub struct ScriptedLauncher {
    next_pid: AtomicU32,
    alive: Mutex<HashSet<ComponentHandle>>,
    starts: Mutex<Vec<LaunchConfig>>,
    stops: Mutex<Vec<(String, ComponentHandle)>>,
    failing_starts: Mutex<HashMap<String, u32>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            alive: Mutex::new(HashSet::new()),
            starts: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            failing_starts: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next `count` starts of `component` fail
    pub fn fail_starts(&self, component: &str, count: u32) {
        self.failing_starts.lock().insert(component.to_string(), count);
    }

    pub fn starts(&self, component: &str) -> usize {
        self.starts.lock().iter().filter(|c| c.component == component).count()
    }

    /// Components in the order they were started
    pub fn started(&self) -> Vec<String> {
        self.starts.lock().iter().map(|c| c.component.clone()).collect()
    }

    pub fn stops(&self, component: &str) -> usize {
        self.stops.lock().iter().filter(|(c, _)| c == component).count()
    }

    pub fn last_start(&self, component: &str) -> Option<LaunchConfig> {
        self.starts
            .lock()
            .iter()
            .rev()
            .find(|c| c.component == component)
            .cloned()
    }

    pub fn is_alive(&self, handle: &ComponentHandle) -> bool {
        self.alive.lock().contains(handle)
    }
}

impl Default for ScriptedLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn start(&self, config: &LaunchConfig) -> Result<ComponentHandle> {
        self.starts.lock().push(config.clone());

        let mut failing = self.failing_starts.lock();
        if let Some(remaining) = failing.get_mut(&config.component) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::LaunchFailed {
                    component: config.component.clone(),
                    message: "scripted start failure".to_string(),
                });
            }
        }
        drop(failing);

        let handle = ComponentHandle::Pid(self.next_pid.fetch_add(1, Ordering::Relaxed));
        self.alive.lock().insert(handle.clone());
        Ok(handle)
    }

    async fn stop(&self, component: &str, handle: &ComponentHandle) -> Result<()> {
        self.stops.lock().push((component.to_string(), handle.clone()));
        if self.alive.lock().remove(handle) {
            Ok(())
        } else {
            Err(Error::NotRunning(component.to_string()))
        }
    }
}

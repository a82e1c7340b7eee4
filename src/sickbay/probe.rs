//! Health probe definitions and execution
//!
//! Provides probe configuration for components and a bounded executor: every
//! probe invocation finishes within its timeout, and a timeout is reported as
//! a failed check rather than an error.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{Instant, timeout};

use crate::component::ComponentHandle;
use crate::component::launch::{ChildTable, DOCKER};

/// Which of the three probes is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Checked from launch until the first success
    Startup,
    /// Checked steadily once startup succeeded; drives restarts
    Liveness,
    /// Informational; drives the `ready` flag only
    Readiness,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Startup => write!(f, "startup"),
            ProbeKind::Liveness => write!(f, "liveness"),
            ProbeKind::Readiness => write!(f, "readiness"),
        }
    }
}

/// What a probe checks
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeTarget {
    /// Process or container existence only
    #[default]
    Handle,
    /// TCP connect (gRPC ports included)
    Tcp { address: String },
    /// HTTP GET expecting a 2xx response
    Http { url: String },
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::Handle => write!(f, "handle"),
            ProbeTarget::Tcp { address } => write!(f, "tcp://{}", address),
            ProbeTarget::Http { url } => write!(f, "{}", url),
        }
    }
}

/// A single probe definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    /// What to check
    pub target: ProbeTarget,
    /// Time between checks
    pub interval: Duration,
    /// Upper bound for one check
    pub timeout: Duration,
    /// Consecutive failures before acting
    pub failure_threshold: u32,
}

impl ProbeSpec {
    /// Frequent checks, tolerated for `failure_threshold * interval`
    pub fn startup(target: ProbeTarget) -> Self {
        Self {
            target,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            failure_threshold: 30,
        }
    }

    /// Steady checks; three failures (~30s) mark the component unhealthy
    pub fn liveness(target: ProbeTarget) -> Self {
        Self {
            target,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            failure_threshold: 3,
        }
    }

    pub fn readiness(target: ProbeTarget) -> Self {
        Self {
            target,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }

    /// Defaults for a probe kind
    pub fn defaults(kind: ProbeKind, target: ProbeTarget) -> Self {
        match kind {
            ProbeKind::Startup => Self::startup(target),
            ProbeKind::Liveness => Self::liveness(target),
            ProbeKind::Readiness => Self::readiness(target),
        }
    }

    /// How long a startup probe may keep failing before the run is abandoned
    pub fn tolerance_window(&self) -> Duration {
        self.interval.saturating_mul(self.failure_threshold.max(1))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }
}

/// The probes configured for one component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSet {
    pub startup: ProbeSpec,
    pub liveness: ProbeSpec,
    pub readiness: Option<ProbeSpec>,
}

impl ProbeSet {
    /// Startup and liveness probes against the same target
    pub fn for_target(target: ProbeTarget) -> Self {
        Self {
            startup: ProbeSpec::startup(target.clone()),
            liveness: ProbeSpec::liveness(target),
            readiness: None,
        }
    }

    pub fn spec(&self, kind: ProbeKind) -> Option<&ProbeSpec> {
        match kind {
            ProbeKind::Startup => Some(&self.startup),
            ProbeKind::Liveness => Some(&self.liveness),
            ProbeKind::Readiness => self.readiness.as_ref(),
        }
    }
}

impl Default for ProbeSet {
    fn default() -> Self {
        Self::for_target(ProbeTarget::Handle)
    }
}

/// Result of a single probe execution
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Which probe ran
    pub kind: ProbeKind,
    /// Whether the check passed
    pub passed: bool,
    /// Execution duration
    pub latency: Duration,
    /// Failure detail
    pub error: Option<String>,
    /// When the check started
    pub at: Instant,
}

impl ProbeOutcome {
    /// Get a summary string for this probe result
    pub fn summary(&self) -> String {
        let status = if self.passed { "ok" } else { "fail" };
        let latency_ms = self.latency.as_millis();
        match &self.error {
            Some(err) => format!("{}:{} ({}ms) - {}", self.kind, status, latency_ms, err),
            None => format!("{}:{} ({}ms)", self.kind, status, latency_ms),
        }
    }
}

/// Performs one health check against a component
#[async_trait]
pub trait Prober: Send + Sync {
    /// Check `target` for `component`. `Err` carries the failure detail.
    async fn check(
        &self,
        component: &str,
        handle: Option<&ComponentHandle>,
        target: &ProbeTarget,
        timeout: Duration,
    ) -> Result<(), String>;
}

/// Execute a probe, bounded by its timeout
pub async fn run_probe(
    prober: &dyn Prober,
    component: &str,
    handle: Option<&ComponentHandle>,
    kind: ProbeKind,
    spec: &ProbeSpec,
) -> ProbeOutcome {
    let at = Instant::now();
    let result = timeout(
        spec.timeout,
        prober.check(component, handle, &spec.target, spec.timeout),
    )
    .await;

    let error = match result {
        Ok(Ok(())) => None,
        Ok(Err(detail)) => Some(detail),
        Err(_) => Some(format!(
            "{} probe timed out after {}ms",
            kind,
            spec.timeout.as_millis()
        )),
    };

    ProbeOutcome {
        kind,
        passed: error.is_none(),
        latency: at.elapsed(),
        error,
        at,
    }
}

/// Probes real processes, containers and network endpoints
#[derive(Debug, Default, Clone)]
pub struct SystemProber {
    children: ChildTable,
}

impl SystemProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat children reaped by the launcher as dead, whatever now holds their PID
    pub fn tracking(children: ChildTable) -> Self {
        Self { children }
    }

    /// Signal 0: does the process exist
    fn check_process(&self, pid: u32) -> Result<(), String> {
        if self.children.has_exited(pid) {
            return Err(format!("process {} has exited", pid));
        }
        let raw = i32::try_from(pid).map_err(|_| format!("invalid PID: {}", pid))?;
        if raw <= 0 {
            return Err(format!("invalid PID: {}", pid));
        }
        match kill(Pid::from_raw(raw), None::<Signal>) {
            Ok(()) => Ok(()),
            // Exists, owned by someone else
            Err(Errno::EPERM) => Ok(()),
            Err(Errno::ESRCH) => Err(format!("process {} not running", pid)),
            Err(e) => Err(format!("failed to signal process {}: {}", pid, e)),
        }
    }

    /// Container must be running and not explicitly unhealthy
    async fn check_container(container: &str) -> Result<(), String> {
        let output = Command::new(DOCKER)
            .args([
                "inspect",
                "--format",
                "{{.State.Running}} {{if .State.Health}}{{.State.Health.Status}}{{end}}",
                container,
            ])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", DOCKER, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("container {} not found: {}", container, stderr.trim()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut fields = stdout.split_whitespace();
        if fields.next() != Some("true") {
            return Err(format!("container {} not running", container));
        }
        // Only fail on an explicit verdict; containers without a healthcheck report nothing
        if fields.next() == Some("unhealthy") {
            return Err(format!("container {} health status: unhealthy", container));
        }
        Ok(())
    }

    async fn check_handle(&self, handle: &ComponentHandle) -> Result<(), String> {
        match handle {
            ComponentHandle::Pid(pid) => self.check_process(*pid),
            ComponentHandle::Container(id) => Self::check_container(id).await,
        }
    }

    async fn check_tcp(address: &str) -> Result<(), String> {
        TcpStream::connect(address)
            .await
            .map(|_| ())
            .map_err(|e| format!("tcp {} not reachable: {}", address, e))
    }

    async fn check_http(url: &str, timeout: Duration) -> Result<(), String> {
        let url = url.to_string();
        tokio::task::spawn_blocking(move || {
            let agent: ureq::Agent = ureq::Agent::config_builder()
                .timeout_global(Some(timeout))
                .build()
                .into();
            agent
                .get(&url)
                .call()
                .map(|_| ())
                .map_err(|e| format!("http {} failed: {}", url, e))
        })
        .await
        .map_err(|e| format!("http probe task failed: {}", e))?
    }
}

#[async_trait]
impl Prober for SystemProber {
    async fn check(
        &self,
        component: &str,
        handle: Option<&ComponentHandle>,
        target: &ProbeTarget,
        timeout: Duration,
    ) -> Result<(), String> {
        // The handle must be alive before any network check means anything
        match handle {
            Some(handle) => self.check_handle(handle).await?,
            None => return Err(format!("{} has no running process", component)),
        }

        match target {
            ProbeTarget::Handle => Ok(()),
            ProbeTarget::Tcp { address } => Self::check_tcp(address).await,
            ProbeTarget::Http { url } => Self::check_http(url, timeout).await,
        }
    }
}

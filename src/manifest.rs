//! Configuration file parsing for Harbormaster
//!
//! Parses `harbormaster.toml` configuration files using serde

use crate::component::{ComponentKind, ComponentSpec};
use crate::error::{Error, Result};
use crate::sickbay::RestartPolicy;
use crate::sickbay::probe::{ProbeKind, ProbeSet, ProbeSpec, ProbeTarget};
use crate::warden::Timing;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default manifest file name
pub const DEFAULT_MANIFEST: &str = "harbormaster.toml";

/// Load configuration from a file
pub fn load(path: &Path) -> Result<HarbormasterConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: HarbormasterConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Deserialize)]
pub struct HarbormasterConfig {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Restart policy for components that don't set their own
    #[serde(default)]
    pub restart: RestartPolicy,

    /// Component definitions
    #[serde(default)]
    pub components: Vec<ComponentDef>,
}

impl HarbormasterConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Check for duplicate component ids
        let mut ids = HashSet::new();
        for component in &self.components {
            if component.id.trim().is_empty() {
                return Err(Error::ConfigValidation("Component with empty id".into()));
            }
            if !ids.insert(component.id.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate component id: {}",
                    component.id
                )));
            }
        }

        // Check that all dependencies exist
        for component in &self.components {
            for dep in &component.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(Error::UnknownDependency(dep.clone()));
                }
            }
        }

        // Check for self-dependencies
        for component in &self.components {
            if component.depends_on.contains(&component.id) {
                return Err(Error::ConfigValidation(format!(
                    "Component '{}' depends on itself",
                    component.id
                )));
            }
        }

        for component in &self.components {
            component.validate()?;
            validate_restart(
                &component.id,
                component.restart.as_ref().unwrap_or(&self.restart),
            )?;
        }

        self.daemon.validate()
    }

    /// Resolved component specs, in file order
    pub fn specs(&self) -> Vec<ComponentSpec> {
        self.components
            .iter()
            .map(|c| c.resolve(&self.restart))
            .collect()
    }
}

fn validate_restart(id: &str, restart: &RestartPolicy) -> Result<()> {
    if restart.backoff_base == 0 {
        return Err(Error::ConfigValidation(format!(
            "Component '{}': restart backoff_base must be at least 1 second",
            id
        )));
    }
    if restart.backoff_cap < restart.backoff_base {
        return Err(Error::ConfigValidation(format!(
            "Component '{}': restart backoff_cap ({}) is below backoff_base ({})",
            id, restart.backoff_cap, restart.backoff_base
        )));
    }
    if restart.restart_window == 0 {
        return Err(Error::ConfigValidation(format!(
            "Component '{}': restart_window must be positive",
            id
        )));
    }
    Ok(())
}

/// Daemon settings
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// State directory: launch configs, logs and the control socket
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Watchdog tick while any component is starting (seconds)
    #[serde(default = "default_fast_tick")]
    pub fast_tick: u64,

    /// Watchdog tick otherwise (seconds)
    #[serde(default = "default_steady_tick")]
    pub steady_tick: u64,

    /// Time in-flight watchdog tasks get on shutdown (seconds)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,

    /// Time between SIGTERM and SIGKILL when stopping a process (seconds)
    #[serde(default = "default_stop_grace")]
    pub stop_grace: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("harbormaster")
}

fn default_fast_tick() -> u64 {
    1
}

fn default_steady_tick() -> u64 {
    5
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_stop_grace() -> u64 {
    10
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fast_tick: default_fast_tick(),
            steady_tick: default_steady_tick(),
            shutdown_grace: default_shutdown_grace(),
            stop_grace: default_stop_grace(),
        }
    }
}

impl DaemonConfig {
    fn validate(&self) -> Result<()> {
        if self.fast_tick == 0 || self.steady_tick == 0 {
            return Err(Error::ConfigValidation(
                "daemon fast_tick and steady_tick must be at least 1 second".into(),
            ));
        }
        Ok(())
    }

    /// Watchdog timing
    pub fn timing(&self) -> Timing {
        Timing {
            fast_tick: Duration::from_secs(self.fast_tick),
            steady_tick: Duration::from_secs(self.steady_tick),
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace)
    }

    /// Control socket path
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("harbormaster.sock")
    }

    /// Component log directory
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Probe overrides; unset fields keep the defaults for the probe kind
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeDef {
    /// What to check (defaults to the component's `target`)
    pub target: Option<ProbeTarget>,

    /// Seconds between checks
    pub interval: Option<u64>,

    /// Seconds before a check counts as failed
    pub timeout: Option<u64>,

    /// Consecutive failures before acting
    pub failure_threshold: Option<u32>,
}

impl ProbeDef {
    fn resolve(&self, kind: ProbeKind, target: &ProbeTarget) -> ProbeSpec {
        let mut spec = ProbeSpec::defaults(kind, self.target.clone().unwrap_or_else(|| target.clone()));
        if let Some(interval) = self.interval {
            spec = spec.with_interval(Duration::from_secs(interval));
        }
        if let Some(timeout) = self.timeout {
            spec = spec.with_timeout(Duration::from_secs(timeout));
        }
        if let Some(threshold) = self.failure_threshold {
            spec = spec.with_failure_threshold(threshold);
        }
        spec
    }

    fn validate(&self, id: &str, kind: ProbeKind) -> Result<()> {
        let invalid = |field: &str| {
            Err(Error::ConfigValidation(format!(
                "Component '{}': {} probe {} must be positive",
                id, kind, field
            )))
        };
        if self.interval == Some(0) {
            return invalid("interval");
        }
        if self.timeout == Some(0) {
            return invalid("timeout");
        }
        if self.failure_threshold == Some(0) {
            return invalid("failure_threshold");
        }
        Ok(())
    }
}

/// Component definition
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentDef {
    /// Stable identifier
    pub id: String,

    /// native-process or container
    #[serde(default)]
    pub kind: ComponentKind,

    /// Components to launch first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Executable (native-process)
    pub program: Option<String>,

    /// Arguments for the program or the container command
    #[serde(default)]
    pub args: Vec<String>,

    /// Image reference (container)
    pub image: Option<String>,

    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Free-form mode recorded with the launch config
    pub mode: Option<String>,

    /// Default probe target for all probes of this component
    #[serde(default)]
    pub target: ProbeTarget,

    #[serde(default)]
    pub startup: ProbeDef,

    #[serde(default)]
    pub liveness: ProbeDef,

    /// Only probed when present
    pub readiness: Option<ProbeDef>,

    /// Replaces the global `[restart]` table for this component
    pub restart: Option<RestartPolicy>,
}

impl ComponentDef {
    fn validate(&self) -> Result<()> {
        match self.kind {
            ComponentKind::NativeProcess => {
                if self.program.as_deref().is_none_or(|p| p.trim().is_empty()) {
                    return Err(Error::ConfigValidation(format!(
                        "Component '{}' is a native process but has no program",
                        self.id
                    )));
                }
            }
            ComponentKind::Container => {
                if self.image.as_deref().is_none_or(|i| i.trim().is_empty()) {
                    return Err(Error::ConfigValidation(format!(
                        "Component '{}' is a container but has no image",
                        self.id
                    )));
                }
            }
        }

        self.startup.validate(&self.id, ProbeKind::Startup)?;
        self.liveness.validate(&self.id, ProbeKind::Liveness)?;
        if let Some(readiness) = &self.readiness {
            readiness.validate(&self.id, ProbeKind::Readiness)?;
        }
        Ok(())
    }

    /// Resolve into a component spec, falling back to `restart` for the policy
    pub fn resolve(&self, restart: &RestartPolicy) -> ComponentSpec {
        ComponentSpec {
            id: self.id.clone(),
            kind: self.kind,
            depends_on: self.depends_on.clone(),
            program: self.program.clone(),
            args: self.args.clone(),
            image: self.image.clone(),
            env: self.env.clone(),
            mode: self.mode.clone(),
            probes: ProbeSet {
                startup: self.startup.resolve(ProbeKind::Startup, &self.target),
                liveness: self.liveness.resolve(ProbeKind::Liveness, &self.target),
                readiness: self
                    .readiness
                    .as_ref()
                    .map(|r| r.resolve(ProbeKind::Readiness, &self.target)),
            },
            restart: self.restart.clone().unwrap_or_else(|| restart.clone()),
        }
    }
}

/// Written by `harbormaster init`
pub const STARTER_MANIFEST: &str = r#"# Harbormaster configuration
#
# Components are launched in dependency order and supervised until the
# daemon exits. Probe targets: { type = "handle" } (process/container
# exists), { type = "tcp", address = "host:port" }, { type = "http", url = "..." }.

[daemon]
# data_dir = "~/.local/share/harbormaster"
fast_tick = 1        # seconds, while a component is starting
steady_tick = 5      # seconds, otherwise
shutdown_grace = 5   # seconds for in-flight checks on shutdown
stop_grace = 10      # seconds between SIGTERM and SIGKILL

# Applies to every component without its own [components.restart]
[restart]
mode = "always"      # or "never"
backoff_base = 1     # seconds, doubled on each restart
backoff_cap = 60
max_restarts = 10    # within restart_window, then the component is failed
restart_window = 600
min_uptime = 10      # seconds running before backoff resets

[[components]]
id = "workflow-engine"
program = "workflow-engine"
args = ["start-dev", "--port", "7233"]
target = { type = "tcp", address = "127.0.0.1:7233" }

[[components]]
id = "api-server"
program = "api-server"
depends_on = ["workflow-engine"]
mode = "local"
target = { type = "tcp", address = "127.0.0.1:7234" }

[components.env]
ENGINE_ADDR = "127.0.0.1:7233"

[components.liveness]
interval = 10
timeout = 3
failure_threshold = 3

[[components]]
id = "workflow-worker"
program = "workflow-worker"
depends_on = ["api-server", "workflow-engine"]

[components.env]
API_ADDR = "127.0.0.1:7234"
ENGINE_ADDR = "127.0.0.1:7233"

[[components]]
id = "agent-worker"
kind = "container"
image = "ghcr.io/example/agent-runner:latest"
depends_on = ["api-server"]

[components.env]
API_ADDR = "host.docker.internal:7234"
"#;

//! Start and stop actions for supervised components
//!
//! Native processes are spawned directly and reaped by a background task so
//! that a crashed child never lingers as a zombie that still answers signal 0.
//! Containers are driven through the docker CLI.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ComponentHandle, ComponentKind, ComponentSpec};
use crate::error::{Error, Result};

/// Container engine CLI
pub const DOCKER: &str = "docker";

/// Newest launch config layout this build understands
pub const LAUNCH_CONFIG_VERSION: u32 = 1;

/// Exact parameters a component was started with
///
/// Stored on disk as loose JSON: unknown fields are ignored and missing
/// fields fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LaunchConfig {
    /// Layout version
    pub format: u32,
    pub component: String,
    pub kind: ComponentKind,
    pub program: Option<String>,
    pub args: Vec<String>,
    pub image: Option<String>,
    pub container_name: Option<String>,
    pub env: BTreeMap<String, String>,
    pub mode: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

impl LaunchConfig {
    /// Launch config derived from the manifest
    pub fn from_spec(spec: &ComponentSpec) -> Self {
        Self {
            format: LAUNCH_CONFIG_VERSION,
            component: spec.id.clone(),
            kind: spec.kind,
            program: spec.program.clone(),
            args: spec.args.clone(),
            image: spec.image.clone(),
            container_name: match spec.kind {
                ComponentKind::Container => Some(spec.container_name()),
                ComponentKind::NativeProcess => None,
            },
            env: spec.env.clone(),
            mode: spec.mode.clone(),
            recorded_at: None,
        }
    }

    /// Check that this record can start `spec`
    pub fn validate(&self, spec: &ComponentSpec) -> Result<()> {
        let invalid = |message: String| Error::LaunchConfigInvalid {
            component: spec.id.clone(),
            message,
        };

        if self.format > LAUNCH_CONFIG_VERSION {
            return Err(invalid(format!(
                "format {} is newer than supported format {}",
                self.format, LAUNCH_CONFIG_VERSION
            )));
        }
        if self.component != spec.id {
            return Err(invalid(format!("recorded for component '{}'", self.component)));
        }
        if self.kind != spec.kind {
            return Err(invalid(format!("recorded as {}, configured as {}", self.kind, spec.kind)));
        }
        match self.kind {
            ComponentKind::NativeProcess if self.program.as_deref().is_none_or(str::is_empty) => {
                Err(invalid("no program".to_string()))
            }
            ComponentKind::Container if self.image.as_deref().is_none_or(str::is_empty) => {
                Err(invalid("no image".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Starts and stops components
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start a component, returning its handle
    async fn start(&self, config: &LaunchConfig) -> Result<ComponentHandle>;

    /// Stop a component. `Error::NotRunning` when the handle is already gone.
    async fn stop(&self, component: &str, handle: &ComponentHandle) -> Result<()>;
}

/// Exit notifications for children we spawned, by PID
///
/// Shared with the prober: once a child has been reaped its PID may belong to
/// an unrelated process, so signals and signal-0 checks must not trust it.
#[derive(Debug, Clone, Default)]
pub struct ChildTable {
    exits: Arc<Mutex<HashMap<u32, watch::Receiver<bool>>>>,
}

impl ChildTable {
    fn insert(&self, pid: u32, exited: watch::Receiver<bool>) {
        self.exits.lock().insert(pid, exited);
    }

    fn remove(&self, pid: u32) {
        self.exits.lock().remove(&pid);
    }

    fn exit_receiver(&self, pid: u32) -> Option<watch::Receiver<bool>> {
        self.exits.lock().get(&pid).cloned()
    }

    /// True once a child we spawned with this PID has been reaped
    pub fn has_exited(&self, pid: u32) -> bool {
        self.exits
            .lock()
            .get(&pid)
            .is_some_and(|exited| *exited.borrow())
    }
}

/// Launcher for real processes and containers
pub struct SystemLauncher {
    /// Directory for component log files
    log_dir: PathBuf,
    /// Time between SIGTERM and SIGKILL
    stop_grace: Duration,
    children: ChildTable,
}

impl SystemLauncher {
    pub fn new(log_dir: impl Into<PathBuf>, stop_grace: Duration) -> Self {
        Self {
            log_dir: log_dir.into(),
            stop_grace,
            children: ChildTable::default(),
        }
    }

    /// Exit table for the processes this launcher spawned
    pub fn children(&self) -> ChildTable {
        self.children.clone()
    }

    fn log_path(&self, component: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", component))
    }

    async fn start_process(&self, config: &LaunchConfig) -> Result<ComponentHandle> {
        let launch_failed = |message: String| Error::LaunchFailed {
            component: config.component.clone(),
            message,
        };
        let program = config
            .program
            .as_deref()
            .ok_or_else(|| launch_failed("no program configured".to_string()))?;

        fs::create_dir_all(&self.log_dir)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&config.component))?;
        let log_err = log.try_clone()?;

        let mut child = Command::new(program)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| launch_failed(format!("{}: {}", program, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| launch_failed("process exited before reporting a PID".to_string()))?;

        // Reap the child as soon as it exits
        let (exited_tx, exited_rx) = watch::channel(false);
        let component = config.component.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(component = %component, pid, %status, "process exited"),
                Err(e) => warn!(component = %component, pid, error = %e, "failed to wait on process"),
            }
            let _ = exited_tx.send(true);
        });
        self.children.insert(pid, exited_rx);

        info!(component = %config.component, pid, program, "process started");
        Ok(ComponentHandle::Pid(pid))
    }

    async fn stop_process(&self, component: &str, pid: u32) -> Result<()> {
        let raw = i32::try_from(pid).map_err(|_| Error::StopFailed {
            component: component.to_string(),
            message: format!("invalid PID: {}", pid),
        })?;
        let target = Pid::from_raw(raw);

        // Reaped already: the PID may have been reused
        if self.children.has_exited(pid) {
            self.children.remove(pid);
            return Err(Error::NotRunning(component.to_string()));
        }

        match kill(target, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                self.children.remove(pid);
                return Err(Error::NotRunning(component.to_string()));
            }
            Err(e) => {
                return Err(Error::StopFailed {
                    component: component.to_string(),
                    message: format!("SIGTERM to {}: {}", pid, e),
                });
            }
        }

        if !self.wait_exit(pid, self.stop_grace).await {
            warn!(component = %component, pid, "process ignored SIGTERM, sending SIGKILL");
            match kill(target, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(Error::StopFailed {
                        component: component.to_string(),
                        message: format!("SIGKILL to {}: {}", pid, e),
                    });
                }
            }
            self.wait_exit(pid, self.stop_grace).await;
        }

        self.children.remove(pid);
        info!(component = %component, pid, "process stopped");
        Ok(())
    }

    /// Wait up to `limit` for `pid` to exit
    async fn wait_exit(&self, pid: u32, limit: Duration) -> bool {
        let exited = self.children.exit_receiver(pid);
        match exited {
            Some(mut rx) => {
                let exited = async move {
                    while !*rx.borrow_and_update() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                };
                tokio::time::timeout(limit, exited).await.is_ok()
            }
            // Not our child: poll for the PID to disappear
            None => {
                let deadline = tokio::time::Instant::now() + limit;
                loop {
                    if kill(Pid::from_raw(pid as i32), None::<Signal>) == Err(Errno::ESRCH) {
                        return true;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return false;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn docker(&self, component: &str, args: &[String]) -> Result<String> {
        let command = format!("{} {}", DOCKER, args.first().map(String::as_str).unwrap_or_default());
        let output = Command::new(DOCKER)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::CommandFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(component = %component, command = %command, stderr = %stderr, "docker command failed");
            Err(Error::CommandFailed {
                command,
                message: stderr,
            })
        }
    }

    async fn start_container(&self, config: &LaunchConfig) -> Result<ComponentHandle> {
        let launch_failed = |message: String| Error::LaunchFailed {
            component: config.component.clone(),
            message,
        };
        let image = config
            .image
            .as_deref()
            .ok_or_else(|| launch_failed("no image configured".to_string()))?;
        let name = config
            .container_name
            .clone()
            .unwrap_or_else(|| format!("harbormaster-{}", config.component));

        // A leftover container with the same name would block `run`
        let _ = self
            .docker(&config.component, &["rm".to_string(), "-f".to_string(), name.clone()])
            .await;

        let mut args = vec!["run".to_string(), "-d".to_string(), "--name".to_string(), name.clone()];
        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(image.to_string());
        args.extend(config.args.iter().cloned());

        let id = self
            .docker(&config.component, &args)
            .await
            .map_err(|e| launch_failed(e.to_string()))?;
        if id.is_empty() {
            return Err(launch_failed("docker run returned no container ID".to_string()));
        }

        info!(component = %config.component, container = %name, image, "container started");
        Ok(ComponentHandle::Container(id))
    }

    async fn stop_container(&self, component: &str, id: &str) -> Result<()> {
        match self
            .docker(component, &["rm".to_string(), "-f".to_string(), id.to_string()])
            .await
        {
            Ok(_) => {
                info!(component = %component, container = %id, "container removed");
                Ok(())
            }
            Err(Error::CommandFailed { message, .. }) if message.contains("No such container") => {
                Err(Error::NotRunning(component.to_string()))
            }
            Err(e) => Err(Error::StopFailed {
                component: component.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Launcher for SystemLauncher {
    async fn start(&self, config: &LaunchConfig) -> Result<ComponentHandle> {
        match config.kind {
            ComponentKind::NativeProcess => self.start_process(config).await,
            ComponentKind::Container => self.start_container(config).await,
        }
    }

    async fn stop(&self, component: &str, handle: &ComponentHandle) -> Result<()> {
        match handle {
            ComponentHandle::Pid(pid) => self.stop_process(component, *pid).await,
            ComponentHandle::Container(id) => self.stop_container(component, id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_spec_native() {
        let spec = ComponentSpec::native("api-server", "/usr/local/bin/api-server")
            .with_env("PORT", "7234");
        let config = LaunchConfig::from_spec(&spec);
        assert_eq!(config.format, LAUNCH_CONFIG_VERSION);
        assert_eq!(config.program.as_deref(), Some("/usr/local/bin/api-server"));
        assert_eq!(config.container_name, None);
        assert_eq!(config.env.get("PORT").map(String::as_str), Some("7234"));
        assert!(config.validate(&spec).is_ok());
    }

    #[test]
    fn test_from_spec_container() {
        let spec = ComponentSpec::container("agent-worker", "ghcr.io/acme/agent-runner:1.4");
        let config = LaunchConfig::from_spec(&spec);
        assert_eq!(config.container_name.as_deref(), Some("harbormaster-agent-worker"));
        assert!(config.validate(&spec).is_ok());
    }

    #[test]
    fn test_validate_rejects_mismatch() {
        let spec = ComponentSpec::native("api-server", "api-server");
        let mut config = LaunchConfig::from_spec(&spec);
        config.format = LAUNCH_CONFIG_VERSION + 1;
        assert!(matches!(
            config.validate(&spec),
            Err(Error::LaunchConfigInvalid { .. })
        ));

        let config = LaunchConfig::from_spec(&ComponentSpec::container("api-server", "img"));
        assert!(config.validate(&spec).is_err());

        let config = LaunchConfig {
            program: None,
            ..LaunchConfig::from_spec(&spec)
        };
        assert!(config.validate(&spec).is_err());
    }

    #[test]
    fn test_loose_json() {
        let json = r#"{"component":"api-server","kind":"native-process","program":"api-server","surprise":42}"#;
        let config: LaunchConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.format, 0);
        assert!(config.args.is_empty());
        assert!(config.validate(&ComponentSpec::native("api-server", "api-server")).is_ok());
    }

    #[tokio::test]
    async fn test_start_and_stop_process() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = SystemLauncher::new(dir.path(), Duration::from_secs(2));
        let spec = ComponentSpec::native("sleeper", "sleep");
        let config = LaunchConfig {
            args: vec!["30".to_string()],
            ..LaunchConfig::from_spec(&spec)
        };

        let handle = launcher.start(&config).await.unwrap();
        assert!(matches!(handle, ComponentHandle::Pid(_)));
        assert!(dir.path().join("sleeper.log").exists());

        launcher.stop("sleeper", &handle).await.unwrap();
        assert!(matches!(
            launcher.stop("sleeper", &handle).await,
            Err(Error::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_after_exit_sends_no_signal() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = SystemLauncher::new(dir.path(), Duration::from_secs(1));
        let spec = ComponentSpec::native("oneshot", "true");
        let handle = launcher.start(&LaunchConfig::from_spec(&spec)).await.unwrap();
        let ComponentHandle::Pid(pid) = handle else {
            panic!("expected a PID");
        };

        let children = launcher.children();
        for _ in 0..500 {
            if children.has_exited(pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(children.has_exited(pid));

        assert!(matches!(
            launcher.stop("oneshot", &handle).await,
            Err(Error::NotRunning(_))
        ));
        // Entry dropped; the PID is no longer ours
        assert!(!children.has_exited(pid));
    }

    #[tokio::test]
    async fn test_start_missing_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = SystemLauncher::new(dir.path(), Duration::from_secs(1));
        let spec = ComponentSpec::native("ghost", "/nonexistent/harbormaster-test-binary");
        let err = launcher.start(&LaunchConfig::from_spec(&spec)).await.unwrap_err();
        assert!(matches!(err, Error::LaunchFailed { .. }));
    }
}

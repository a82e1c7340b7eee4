//! Supervised component descriptors
//!
//! A component is an opaque unit: something we can start from a launch
//! config, stop, probe, and identify by PID or container ID.

pub mod launch;
pub mod state;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sickbay::policy::RestartPolicy;
use crate::sickbay::probe::ProbeSet;

pub use launch::{Launcher, SystemLauncher};
pub use state::State;

/// How a component is run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    /// Spawned directly as a child process
    #[default]
    NativeProcess,
    /// Run through the container engine
    Container,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::NativeProcess => write!(f, "native-process"),
            ComponentKind::Container => write!(f, "container"),
        }
    }
}

/// Identity of a running component
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentHandle {
    Pid(u32),
    Container(String),
}

impl fmt::Display for ComponentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentHandle::Pid(pid) => write!(f, "{}", pid),
            // Short form, like `docker ps`
            ComponentHandle::Container(id) => {
                let short: String = id.chars().take(12).collect();
                write!(f, "{}", short)
            }
        }
    }
}

/// Fully resolved description of a supervised component
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    /// Stable identifier (e.g. "api-server")
    pub id: String,
    /// Native process or container
    pub kind: ComponentKind,
    /// Components that must be launched before this one
    pub depends_on: Vec<String>,
    /// Program to execute (native process)
    pub program: Option<String>,
    /// Program arguments, or container command arguments
    pub args: Vec<String>,
    /// Image reference (container)
    pub image: Option<String>,
    /// Environment passed to the component
    pub env: BTreeMap<String, String>,
    /// Free-form mode flag recorded with the launch config (e.g. "local")
    pub mode: Option<String>,
    /// Health probes
    pub probes: ProbeSet,
    /// Restart policy
    pub restart: RestartPolicy,
}

impl ComponentSpec {
    /// Container name used for a container component
    pub fn container_name(&self) -> String {
        format!("harbormaster-{}", self.id)
    }
}

#[cfg(test)]
impl ComponentSpec {
    /// Minimal native-process spec for tests
    pub fn native(id: &str, program: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: ComponentKind::NativeProcess,
            depends_on: Vec::new(),
            program: Some(program.to_string()),
            args: Vec::new(),
            image: None,
            env: BTreeMap::new(),
            mode: None,
            probes: ProbeSet::default(),
            restart: RestartPolicy::default(),
        }
    }

    /// Minimal container spec for tests
    pub fn container(id: &str, image: &str) -> Self {
        Self {
            kind: ComponentKind::Container,
            program: None,
            image: Some(image.to_string()),
            ..Self::native(id, "")
        }
    }

    pub fn with_probes(mut self, probes: ProbeSet) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        assert_eq!(ComponentHandle::Pid(4242).to_string(), "4242");
        let long = "3f4e2a9b8c7d6e5f4a3b2c1d0e9f8a7b6c5d4e3f2a1b0c9d8e7f6a5b4c3d2e1f";
        assert_eq!(
            ComponentHandle::Container(long.to_string()).to_string(),
            "3f4e2a9b8c7d"
        );
        assert_eq!(ComponentHandle::Container("abc".into()).to_string(), "abc");
    }

    #[test]
    fn test_kind_serde() {
        let kind: ComponentKind = serde_json::from_str("\"container\"").unwrap();
        assert_eq!(kind, ComponentKind::Container);
        assert_eq!(
            serde_json::to_string(&ComponentKind::NativeProcess).unwrap(),
            "\"native-process\""
        );
    }

    #[test]
    fn test_container_name() {
        let spec = ComponentSpec::container("agent-worker", "ghcr.io/acme/agent-runner:1.4");
        assert_eq!(spec.container_name(), "harbormaster-agent-worker");
    }
}

//! Bridge for managing component lifecycle and dependencies
//!
//! Handles:
//! - Building dependency graphs from registered components
//! - Launching components in correct order (topological sort)
//! - Explicit stop and manual restart commands
//! - Stopping components in reverse order on shutdown

use crate::component::launch::{LaunchConfig, Launcher};
use crate::component::{ComponentHandle, ComponentSpec, State};
use crate::error::{Error, Result};
use crate::logbook::Logbook;
use crate::roster::{ComponentCell, Roster};
use crate::sickbay::ComponentStatus;
use crate::warden::stop_quietly;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Result of an explicit stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Was running (or trying to), now stopped
    Stopped,
    /// Nothing to do
    AlreadyStopped,
    /// Stays failed; only a manual restart leaves that state
    Failed,
}

/// Bridge for managing components
pub struct Bridge {
    /// Registered components
    roster: Arc<Roster>,

    /// Start/stop actions
    launcher: Arc<dyn Launcher>,

    /// Launch-config store
    logbook: Logbook,
}

impl Bridge {
    /// Create a new bridge over a roster
    pub fn new(roster: Arc<Roster>, launcher: Arc<dyn Launcher>, logbook: Logbook) -> Self {
        Self {
            roster,
            launcher,
            logbook,
        }
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub fn launcher(&self) -> Arc<dyn Launcher> {
        Arc::clone(&self.launcher)
    }

    pub fn logbook(&self) -> &Logbook {
        &self.logbook
    }

    /// Register a component for supervision
    pub fn register_component(&self, spec: ComponentSpec) -> Result<()> {
        let id = spec.id.clone();
        self.roster.register(spec)?;
        info!(component = %id, "component registered");
        Ok(())
    }

    /// Dependency graph over registered components (dependency -> dependent)
    fn graph(&self) -> Result<DiGraph<String, ()>> {
        let cells = self.roster.cells();
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();

        // Add nodes for each component
        for cell in &cells {
            let idx = graph.add_node(cell.id().to_string());
            node_map.insert(cell.id(), idx);
        }

        // Add edges for dependencies (dep -> component)
        for cell in &cells {
            let to = node_map[cell.id()];
            for dep in &cell.spec().depends_on {
                let from = node_map
                    .get(dep.as_str())
                    .ok_or_else(|| Error::UnknownDependency(dep.clone()))?;
                graph.add_edge(*from, to, ());
            }
        }

        Ok(graph)
    }

    /// Get the start order (topological sort)
    pub fn start_order(&self) -> Result<Vec<String>> {
        let graph = self.graph()?;
        toposort(&graph, None)
            .map(|nodes| nodes.iter().map(|n| graph[*n].clone()).collect())
            .map_err(|cycle| {
                // Get the node involved in the cycle
                let cycle_node = &graph[cycle.node_id()];
                Error::ConfigValidation(format!(
                    "Cyclic dependency detected involving component '{}'",
                    cycle_node
                ))
            })
    }

    /// Get the stop order (reverse of start order)
    pub fn stop_order(&self) -> Result<Vec<String>> {
        let mut order = self.start_order()?;
        order.reverse();
        Ok(order)
    }

    /// Launch every registered component in dependency order
    pub async fn launch_all(&self) -> Result<()> {
        for id in self.start_order()? {
            self.launch_component(&id).await?;
        }
        Ok(())
    }

    /// First launch of a registered component
    ///
    /// A start failure is not an error here: the component enters Starting with
    /// the failure recorded, and the watchdog takes it from there.
    pub async fn launch_component(&self, id: &str) -> Result<State> {
        let cell = self.roster.get(id)?;
        let _control = cell.control().await;

        let state = cell.state();
        if state != State::Stopped {
            return Ok(state);
        }

        let config = LaunchConfig::from_spec(cell.spec());
        let (handle, launch_error) = self.start(&cell, &config).await;
        if handle.is_some() {
            if let Err(e) = self.logbook.record(&config) {
                warn!(component = %id, error = %e, "failed to record launch config");
            }
        }

        cell.update(|r| r.launch(handle, launch_error, Instant::now()))
            .map_err(|rejected| rejected.into_error(id))
    }

    async fn start(
        &self,
        cell: &ComponentCell,
        config: &LaunchConfig,
    ) -> (Option<ComponentHandle>, Option<String>) {
        match self.launcher.start(config).await {
            Ok(handle) => {
                info!(component = %cell.id(), handle = %handle, "component launched");
                (Some(handle), None)
            }
            Err(e) => {
                error!(component = %cell.id(), error = %e, "component failed to launch");
                (None, Some(e.to_string()))
            }
        }
    }

    /// Explicit stop; stopping a stopped component is a no-op
    pub async fn stop_component(&self, id: &str) -> Result<StopOutcome> {
        let cell = self.roster.get(id)?;
        let _control = cell.control().await;

        let (outcome, handle) = cell.update(|r| match r.state() {
            State::Stopped => (StopOutcome::AlreadyStopped, r.take_handle()),
            State::Failed => (StopOutcome::Failed, r.take_handle()),
            // Every non-terminal state has a halt edge
            _ => match r.halt() {
                Ok(handle) => (StopOutcome::Stopped, handle),
                Err(_) => (StopOutcome::AlreadyStopped, None),
            },
        });

        if let Some(handle) = handle {
            stop_quietly(self.launcher.as_ref(), id, &handle).await;
        }
        if outcome == StopOutcome::Stopped {
            info!(component = %id, "component stopped");
        }
        Ok(outcome)
    }

    /// Stop (if needed) and start fresh, clearing restart history and backoff
    pub async fn manual_restart(&self, id: &str) -> Result<State> {
        let cell = self.roster.get(id)?;
        let _control = cell.control().await;

        let handle = cell.update(|r| {
            if r.state().is_terminal() {
                r.take_handle()
            } else {
                r.halt().ok().flatten()
            }
        });
        if let Some(handle) = handle {
            stop_quietly(self.launcher.as_ref(), id, &handle).await;
        }

        let config = self.logbook.load_or_default(cell.spec());
        let (handle, launch_error) = self.start(&cell, &config).await;

        let state = cell
            .update(|r| r.revive(handle, launch_error, Instant::now()))
            .map_err(|rejected| rejected.into_error(id))?;
        info!(component = %id, "component manually restarted, restart history cleared");
        Ok(state)
    }

    /// Snapshot of every component
    pub fn status(&self) -> Vec<ComponentStatus> {
        self.roster.snapshot(Instant::now())
    }

    /// Stop everything, dependents first
    pub async fn stop_all(&self) {
        let order = match self.stop_order() {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "no stop order, stopping in reverse registration order");
                self.roster
                    .cells()
                    .iter()
                    .rev()
                    .map(|c| c.id().to_string())
                    .collect()
            }
        };

        for id in order {
            if let Err(e) = self.stop_component(&id).await {
                warn!(component = %id, error = %e, "failed to stop component");
            }
        }
    }
}

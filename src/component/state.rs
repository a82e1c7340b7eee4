//! Component lifecycle state machine
//!
//! Type-safe state machine for component lifecycle management using state-machines crate.
//! Uses dynamic dispatch mode so the Warden can feed probe-driven events at runtime.

use std::fmt;

use serde::{Deserialize, Serialize};
use state_machines::state_machine;

use crate::error::Error;

state_machine! {
    name: ComponentMachine,
    dynamic: true,
    initial: Stopped,
    states: [Stopped, Starting, Running, Unhealthy, Restarting, Failed],
    events {
        launch {
            transition: { from: Stopped, to: Starting }
        }
        ready {
            transition: { from: Starting, to: Running }
        }
        stall {
            transition: { from: Starting, to: Unhealthy }
        }
        sicken {
            transition: { from: Running, to: Unhealthy }
        }
        restart {
            transition: { from: Unhealthy, to: Restarting }
        }
        condemn {
            transition: { from: Unhealthy, to: Failed }
        }
        relaunch {
            transition: { from: Restarting, to: Starting }
        }
        halt {
            transition: { from: [Starting, Running, Unhealthy, Restarting], to: Stopped }
        }
        revive {
            transition: { from: [Failed, Stopped], to: Starting }
        }
    }
}

/// Lifecycle state of a supervised component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Starting,
    Running,
    Unhealthy,
    Restarting,
    Stopped,
    Failed,
}

impl State {
    /// Parse state from the machine's state name
    pub fn from_machine(s: &str) -> Self {
        match s {
            "Starting" => State::Starting,
            "Running" => State::Running,
            "Unhealthy" => State::Unhealthy,
            "Restarting" => State::Restarting,
            "Failed" => State::Failed,
            _ => State::Stopped,
        }
    }

    /// Terminal for the automatic supervisor: only an explicit command leaves these
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Stopped | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Starting => "starting",
            State::Running => "running",
            State::Unhealthy => "unhealthy",
            State::Restarting => "restarting",
            State::Stopped => "stopped",
            State::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Lifecycle events, named after what triggers them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Component launched for the first time
    Launch,
    /// Startup probe succeeded
    Ready,
    /// Startup probe still failing after the tolerance window
    Stall,
    /// Liveness probe failed `threshold` times in a row
    Sicken,
    /// Restart ceiling not exceeded, recovery begins
    Restart,
    /// Restart ceiling exceeded, automatic recovery stops
    Condemn,
    /// Relaunch invoked
    Relaunch,
    /// Explicit stop requested
    Halt,
    /// Explicit manual restart
    Revive,
}

impl LifecycleEvent {
    fn machine_event(self) -> ComponentMachineEvent {
        match self {
            LifecycleEvent::Launch => ComponentMachineEvent::Launch,
            LifecycleEvent::Ready => ComponentMachineEvent::Ready,
            LifecycleEvent::Stall => ComponentMachineEvent::Stall,
            LifecycleEvent::Sicken => ComponentMachineEvent::Sicken,
            LifecycleEvent::Restart => ComponentMachineEvent::Restart,
            LifecycleEvent::Condemn => ComponentMachineEvent::Condemn,
            LifecycleEvent::Relaunch => ComponentMachineEvent::Relaunch,
            LifecycleEvent::Halt => ComponentMachineEvent::Halt,
            LifecycleEvent::Revive => ComponentMachineEvent::Revive,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleEvent::Launch => "launch",
            LifecycleEvent::Ready => "ready",
            LifecycleEvent::Stall => "stall",
            LifecycleEvent::Sicken => "sicken",
            LifecycleEvent::Restart => "restart",
            LifecycleEvent::Condemn => "condemn",
            LifecycleEvent::Relaunch => "relaunch",
            LifecycleEvent::Halt => "halt",
            LifecycleEvent::Revive => "revive",
        };
        f.write_str(s)
    }
}

/// Rejected transition: the event has no edge out of the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub state: State,
    pub event: LifecycleEvent,
}

impl Rejected {
    pub fn into_error(self, component: &str) -> Error {
        Error::InvalidTransition {
            component: component.to_string(),
            state: self.state.to_string(),
            event: self.event.to_string(),
        }
    }
}

/// Lifecycle wrapper around the dynamic machine
pub struct Lifecycle {
    machine: DynamicComponentMachine<()>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            machine: ComponentMachine::new(()).into_dynamic(),
        }
    }

    /// Get current state as enum
    pub fn state(&self) -> State {
        State::from_machine(self.machine.current_state())
    }

    /// Fire an event, returning the new state or the rejected edge
    pub fn fire(&mut self, event: LifecycleEvent) -> Result<State, Rejected> {
        let state = self.state();
        self.machine
            .handle(event.machine_event())
            .map(|_| self.state())
            .map_err(|_| Rejected { state, event })
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle").field("state", &self.state()).finish()
    }
}

//! Component registry
//!
//! Each component lives in its own cell with its own lock. The roster list
//! lock is only held long enough to clone `Arc`s out of it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::component::{ComponentSpec, State};
use crate::error::{Error, Result};
use crate::sickbay::{ComponentStatus, HealthRecord};

/// One registered component and its health record
#[derive(Debug)]
pub struct ComponentCell {
    spec: ComponentSpec,
    record: Mutex<HealthRecord>,
    /// Set while a watchdog task owns this component
    in_flight: AtomicBool,
    /// Serializes explicit user commands
    control: tokio::sync::Mutex<()>,
    /// Latest record generation, for waits that a new run must cut short
    generation: watch::Sender<u64>,
}

impl ComponentCell {
    pub fn new(spec: ComponentSpec) -> Self {
        Self {
            spec,
            record: Mutex::new(HealthRecord::new()),
            in_flight: AtomicBool::new(false),
            control: tokio::sync::Mutex::new(()),
            generation: watch::Sender::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &ComponentSpec {
        &self.spec
    }

    pub fn state(&self) -> State {
        self.record.lock().state()
    }

    pub fn snapshot(&self, now: Instant) -> ComponentStatus {
        self.record
            .lock()
            .snapshot(&self.spec.id, self.spec.kind, &self.spec.restart, now)
    }

    /// Read the record under its lock
    pub fn read<R>(&self, f: impl FnOnce(&HealthRecord) -> R) -> R {
        f(&self.record.lock())
    }

    /// Mutate the record under its lock. `f` must not block.
    pub fn update<R>(&self, f: impl FnOnce(&mut HealthRecord) -> R) -> R {
        let mut record = self.record.lock();
        let before = record.generation;
        let result = f(&mut record);
        let after = record.generation;
        drop(record);

        if after != before {
            self.generation.send_replace(after);
        }
        result
    }

    /// Resolves once the record moves past `generation`
    pub async fn superseded(&self, generation: u64) {
        let mut rx = self.generation.subscribe();
        while *rx.borrow_and_update() == generation {
            // The sender lives as long as the cell
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Claim the component for one watchdog task; `None` if a task is already in flight
    pub fn try_claim(self: &Arc<Self>) -> Option<Claim> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Claim {
                cell: Arc::clone(self),
            })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait for exclusive access for an explicit command
    pub async fn control(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.control.lock().await
    }
}

/// In-flight claim; released on drop, including when the task is aborted
#[derive(Debug)]
pub struct Claim {
    cell: Arc<ComponentCell>,
}

impl Claim {
    pub fn cell(&self) -> &Arc<ComponentCell> {
        &self.cell
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.cell.in_flight.store(false, Ordering::Release);
    }
}

/// All registered components, in registration order
#[derive(Debug, Default)]
pub struct Roster {
    cells: RwLock<Vec<Arc<ComponentCell>>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: ComponentSpec) -> Result<Arc<ComponentCell>> {
        let mut cells = self.cells.write();
        if cells.iter().any(|c| c.id() == spec.id) {
            return Err(Error::ComponentAlreadyRegistered(spec.id));
        }
        let cell = Arc::new(ComponentCell::new(spec));
        cells.push(Arc::clone(&cell));
        Ok(cell)
    }

    pub fn get(&self, id: &str) -> Result<Arc<ComponentCell>> {
        self.cells
            .read()
            .iter()
            .find(|c| c.id() == id)
            .cloned()
            .ok_or_else(|| Error::ComponentNotFound(id.to_string()))
    }

    pub fn cells(&self) -> Vec<Arc<ComponentCell>> {
        self.cells.read().clone()
    }

    pub fn count(&self) -> usize {
        self.cells.read().len()
    }

    /// Status of every component, never blocking on a watchdog task
    pub fn snapshot(&self, now: Instant) -> Vec<ComponentStatus> {
        self.cells().iter().map(|c| c.snapshot(now)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentHandle;
    use std::time::Duration;

    #[test]
    fn test_register_and_get() {
        let roster = Roster::new();
        roster.register(ComponentSpec::native("api-server", "api-server")).unwrap();
        roster.register(ComponentSpec::container("agent-worker", "agent:1")).unwrap();

        assert_eq!(roster.count(), 2);
        assert_eq!(roster.get("agent-worker").unwrap().id(), "agent-worker");
        assert!(matches!(roster.get("nope"), Err(Error::ComponentNotFound(_))));
    }

    #[test]
    fn test_register_duplicate() {
        let roster = Roster::new();
        roster.register(ComponentSpec::native("api-server", "a")).unwrap();
        let err = roster.register(ComponentSpec::native("api-server", "b")).unwrap_err();
        assert!(matches!(err, Error::ComponentAlreadyRegistered(id) if id == "api-server"));
        assert_eq!(roster.count(), 1);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let roster = Roster::new();
        let cell = roster.register(ComponentSpec::native("api-server", "a")).unwrap();

        let claim = cell.try_claim().unwrap();
        assert!(cell.is_in_flight());
        assert!(cell.try_claim().is_none());

        drop(claim);
        assert!(!cell.is_in_flight());
        assert!(cell.try_claim().is_some());
    }

    #[tokio::test]
    async fn test_superseded_wakes_on_new_generation() {
        let cell = Arc::new(ComponentCell::new(ComponentSpec::native("api-server", "a")));
        cell.update(|r| r.launch(Some(ComponentHandle::Pid(100)), None, Instant::now()))
            .unwrap();
        let generation = cell.read(|r| r.generation);

        // An older generation is already superseded
        tokio::time::timeout(Duration::from_secs(1), cell.superseded(generation - 1))
            .await
            .unwrap();

        let waiter = {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move { cell.superseded(generation).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        cell.update(|r| r.halt()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_snapshot_of_unlaunched_component() {
        let roster = Roster::new();
        roster.register(ComponentSpec::native("workflow-engine", "engine")).unwrap();
        let status = roster.snapshot(Instant::now());
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, State::Stopped);
        assert_eq!(status[0].handle, None);
        assert_eq!(status[0].restart_count, 0);
    }
}

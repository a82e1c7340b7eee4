//! Health monitoring and recovery for components
//!
//! Provides:
//! - Probe definitions and a bounded probe executor
//! - The per-component health record and its status snapshot
//! - Restart policy decisions (backoff, restart ceiling, stable uptime)

pub mod policy;
pub mod probe;
pub mod record;

pub use policy::RestartPolicy;
pub use probe::{ProbeKind, ProbeSet, Prober, SystemProber};
pub use record::{ComponentStatus, HealthRecord};

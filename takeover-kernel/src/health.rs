use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::guard::GuardState;
use crate::state::{PassLog, PassRecord};

#[derive(Debug, Serialize)]
pub struct SystemHealth {
    pub uptime_seconds: u64,
    pub guard: GuardState,
    /// Registered platform instances per platform type.
    pub platforms: BTreeMap<String, usize>,
    pub last_sync: Option<PassRecord>,
    pub last_monitor: Option<PassRecord>,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    sync: PassLog,
    monitor: PassLog,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now(), sync: PassLog::new(), monitor: PassLog::new() }
    }

    pub fn sync_log(&self) -> &PassLog {
        &self.sync
    }

    pub fn monitor_log(&self) -> &PassLog {
        &self.monitor
    }

    pub fn report(&self, guard: GuardState, platforms: BTreeMap<String, usize>) -> SystemHealth {
        SystemHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            guard,
            platforms,
            last_sync: self.sync.last(),
            last_monitor: self.monitor.last(),
        }
    }
}

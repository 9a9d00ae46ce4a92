use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Outcome of the most recent run of a background pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassRecord {
    pub started_at: String,
    pub finished_at: String,
    pub ok: bool,
    pub detail: Option<String>,
}

/// Last-run bookkeeping shared between a loop and the health endpoint.
#[derive(Clone, Default)]
pub struct PassLog {
    last: Shared<Option<PassRecord>>,
}

impl PassLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, started_at: OffsetDateTime, ok: bool, detail: Option<String>) {
        let finished_at = OffsetDateTime::now_utc();
        *self.last.lock() = Some(PassRecord {
            started_at: started_at.format(&Rfc3339).unwrap_or_default(),
            finished_at: finished_at.format(&Rfc3339).unwrap_or_default(),
            ok,
            detail,
        });
    }

    pub fn last(&self) -> Option<PassRecord> {
        self.last.lock().clone()
    }
}

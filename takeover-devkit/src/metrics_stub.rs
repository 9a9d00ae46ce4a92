/*!
In-memory metrics sink

Keeps every written batch so tests can assert on the samples the monitoring
loop produced, without an MQTT broker.
*/

use async_trait::async_trait;
use parking_lot::Mutex;

use takeover_kernel::metrics::MetricsSink;
use takeover_kernel::models::MetricSample;
use takeover_kernel::{Result, TakeoverError};

#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<MetricSample>>>,
    failing: Mutex<bool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn batches(&self) -> Vec<Vec<MetricSample>> {
        self.batches.lock().clone()
    }

    pub fn samples(&self) -> Vec<MetricSample> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn find(&self, resource_id: &str, counter_name: &str) -> Option<MetricSample> {
        self.samples()
            .into_iter()
            .find(|s| s.resource_id == resource_id && s.counter_name == counter_name)
    }
}

#[async_trait]
impl MetricsSink for MemorySink {
    async fn write(&self, batch: &[MetricSample]) -> Result<()> {
        if *self.failing.lock() {
            return Err(TakeoverError::RemoteConnect("metrics store unreachable".into()));
        }
        log::info!("[memory-sink] stored {} samples", batch.len());
        self.batches.lock().push(batch.to_vec());
        Ok(())
    }
}

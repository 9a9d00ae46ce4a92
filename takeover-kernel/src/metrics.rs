//! Utilization samples: reshaping platform counters into normalized records
//! and handing batches to a sink.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, QoS};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::{ComputeConf, MetricsConf};
use crate::error::{Result, TakeoverError};
use crate::models::{Counter, MetricSample};

/// Append-only destination for metric batches.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn write(&self, batch: &[MetricSample]) -> Result<()>;
}

/// Counters read for one resource (a VM or a hypervisor host).
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCounters {
    pub resource_id: String,
    pub source: String,
    pub counters: Vec<Counter>,
}

/// Tenant identity stamped on every sample.
#[derive(Debug, Clone, Default)]
pub struct SampleOwner {
    pub project_id: String,
    pub user_id: String,
}

impl From<&ComputeConf> for SampleOwner {
    fn from(conf: &ComputeConf) -> Self {
        Self { project_id: conf.project_id.clone(), user_id: conf.user_id.clone() }
    }
}

pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// One sample per counter, all sharing the same timestamp.
pub fn reshape(resources: &[ResourceCounters], owner: &SampleOwner, timestamp: &str) -> Vec<MetricSample> {
    resources
        .iter()
        .flat_map(|r| {
            r.counters.iter().map(move |c| MetricSample {
                counter_name: c.name.clone(),
                counter_unit: c.unit.clone(),
                resource_id: r.resource_id.clone(),
                counter_volume: c.volume,
                timestamp: timestamp.to_string(),
                source: r.source.clone(),
                project_id: owner.project_id.clone(),
                user_id: owner.user_id.clone(),
            })
        })
        .collect()
}

/// Publishes each batch as one JSON array on an MQTT topic.
pub struct MqttMetricsSink {
    client: AsyncClient,
    topic: String,
}

impl MqttMetricsSink {
    /// Must be called inside a tokio runtime: the event loop runs on a
    /// background task for the lifetime of the process.
    pub fn connect(conf: &MetricsConf) -> Self {
        let mut opts = MqttOptions::new("takeover-kernel-metrics", &conf.mqtt_host, conf.mqtt_port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);

        task::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(rumqttc::Incoming::ConnAck(_))) => info!("metrics MQTT connected"),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = ?e, "metrics MQTT error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self { client, topic: conf.topic.clone() }
    }
}

#[async_trait]
impl MetricsSink for MqttMetricsSink {
    async fn write(&self, batch: &[MetricSample]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_vec(batch)?;
        self.client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TakeoverError::RemoteRequest(format!("metrics publish: {e}")))?;
        debug!(topic = %self.topic, samples = batch.len(), "metrics published");
        Ok(())
    }
}

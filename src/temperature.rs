//! Periodic temperature reports.

use crate::device::{Capabilities, SharedDevice};
use crate::mqtt::Publisher;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Decides whether the poller runs at all.
///
/// A device without a thermometer disables reporting with a warning instead
/// of failing startup.
pub fn effective_interval(configured: Option<Duration>, capabilities: Capabilities) -> Option<Duration> {
    let interval = configured?;
    if !capabilities.temperature {
        warn!(
            "temperature_interval is set but the device cannot report temperature ({}), not polling",
            capabilities
        );
        return None;
    }
    Some(interval)
}

pub struct TemperaturePoller {
    device: SharedDevice,
    publisher: Arc<dyn Publisher>,
    topic: String,
    period: Duration,
    qos: QoS,
    retain: bool,
}

impl TemperaturePoller {
    pub fn new(
        device: SharedDevice,
        publisher: Arc<dyn Publisher>,
        topic: String,
        period: Duration,
        qos: QoS,
        retain: bool,
    ) -> Self {
        Self {
            device,
            publisher,
            topic,
            period,
            qos,
            retain,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// First reading one period after start, then every period.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Publishing temperature to {} every {:?}", self.topic, self.period);
        let Some(start) = Instant::now().checked_add(self.period) else {
            error!("Temperature interval {:?} is out of range, not polling", self.period);
            return;
        };
        let mut ticker = interval_at(start, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Temperature poller stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.report().await;
                }
            }
        }
    }

    /// Reads once and publishes the reading. Faults are logged only.
    pub async fn report(&self) -> Option<f32> {
        let reading = {
            let mut device = self.device.lock().await;
            device.read_temperature().await
        };

        match reading {
            Ok(temperature) => {
                self.publisher
                    .publish(&self.topic, format!("{:.1}", temperature), self.qos, self.retain);
                Some(temperature)
            }
            Err(e) => {
                error!("Failed to read temperature: {}", e);
                None
            }
        }
    }
}

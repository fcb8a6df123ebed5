use color_eyre::{eyre::eyre, Result};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};

/// One day, in seconds.
const MAX_RECONNECT_DELAY: u64 = 24 * 60 * 60;

/// Broker connection and topic settings, the `[mqtt]` table of the config file.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Defaults to `broadlink-<pid>`
    pub client_id: Option<String>,
    pub clean_session: bool,
    /// 0, 1 or 2
    pub qos: u8,
    pub retain: bool,
    pub topic_prefix: String,
    /// Seconds
    pub keep_alive: u64,
    /// Seconds to wait after a network fault before polling again
    pub reconnect_delay: u64,
    pub will_topic: String,
    pub will_payload: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: None,
            clean_session: false,
            qos: 0,
            retain: false,
            topic_prefix: "broadlink/".to_string(),
            keep_alive: 60,
            reconnect_delay: 10,
            will_topic: "clients/broadlink".to_string(),
            will_payload: "Adios!".to_string(),
        }
    }
}

impl MqttConfig {
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("broadlink-{}", std::process::id()))
    }

    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.qos > 2 {
            return Err(eyre!("mqtt.qos must be 0, 1 or 2, got {}", self.qos));
        }
        if self.topic_prefix.contains(['+', '#']) {
            return Err(eyre!(
                "mqtt.topic_prefix must not contain wildcards, got '{}'",
                self.topic_prefix
            ));
        }
        if self.keep_alive != 0 && self.keep_alive < 5 {
            return Err(eyre!(
                "mqtt.keep_alive must be 0 or at least 5 seconds, got {}",
                self.keep_alive
            ));
        }
        // Sent to the broker as a 16 bit value
        if self.keep_alive > u64::from(u16::MAX) {
            return Err(eyre!(
                "mqtt.keep_alive must be at most {} seconds, got {}",
                u16::MAX,
                self.keep_alive
            ));
        }
        if self.reconnect_delay > MAX_RECONNECT_DELAY {
            return Err(eyre!(
                "mqtt.reconnect_delay must be at most {} seconds, got {}",
                MAX_RECONNECT_DELAY,
                self.reconnect_delay
            ));
        }
        if matches!(self.client_id.as_deref(), Some("")) {
            return Err(eyre!("mqtt.client_id must not be empty"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(eyre!("mqtt.password is set but mqtt.username is missing"));
        }
        Ok(())
    }
}

use crate::dispatch::CommandMessage;
use rumqttc::{AsyncClient, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Topic suffix the bridge publishes temperature readings on. Never
/// dispatched as a command, even though it lives under the command prefix.
pub const TEMPERATURE_SUFFIX: &str = "temperature";

/// Derives every topic the bridge uses from the configured prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicLayout {
    prefix: String,
}

/// Where an incoming publish goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundRoute {
    Command(String),
    /// Our own temperature report echoing back
    Reserved,
    /// Outside the command namespace
    Foreign,
}

impl TopicLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn subscription(&self) -> String {
        format!("{}#", self.prefix)
    }

    pub fn temperature_topic(&self) -> String {
        format!("{}{}", self.prefix, TEMPERATURE_SUFFIX)
    }

    pub fn classify(&self, topic: &str) -> InboundRoute {
        match topic.strip_prefix(self.prefix.as_str()) {
            Some(TEMPERATURE_SUFFIX) => InboundRoute::Reserved,
            Some(name) if !name.is_empty() => InboundRoute::Command(name.to_string()),
            _ => InboundRoute::Foreign,
        }
    }
}

/// Hands command publishes to the dispatcher channel, in arrival order.
///
/// Never waits for the dispatcher: when its queue is full the command is
/// dropped with a warning so the broker event loop keeps running.
pub struct InboundRouter {
    layout: TopicLayout,
    commands: mpsc::Sender<CommandMessage>,
}

impl InboundRouter {
    pub fn new(layout: TopicLayout, commands: mpsc::Sender<CommandMessage>) -> Self {
        Self { layout, commands }
    }

    pub fn layout(&self) -> &TopicLayout {
        &self.layout
    }

    pub fn route(&self, topic: &str, payload: &[u8]) -> InboundRoute {
        let route = self.layout.classify(topic);
        match &route {
            InboundRoute::Command(name) => {
                let payload = String::from_utf8_lossy(payload).into_owned();
                debug!("Received MQTT message {} '{}'", topic, payload);
                match self.commands.try_send(CommandMessage::new(name.clone(), payload)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(message)) => warn!(
                        "Command queue is full, dropping '{}' for '{}'",
                        message.payload, message.name
                    ),
                    Err(TrySendError::Closed(_)) => {
                        warn!("Command dispatcher is gone, dropping message on {}", topic)
                    }
                }
            }
            InboundRoute::Reserved => debug!("Ignoring internal notification on {}", topic),
            InboundRoute::Foreign => debug!("Ignoring message on {}", topic),
        }
        route
    }
}

/// Outbound side of the broker session.
///
/// Publishing is fire-and-forget: callers are never blocked by a slow or
/// disconnected broker and failures are only logged.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: String, qos: QoS, retain: bool);
}

/// Whether the broker session is currently connected. Set by the session,
/// read by publishers.
#[derive(Clone, Debug, Default)]
pub struct LinkState(Arc<AtomicBool>);

impl LinkState {
    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Publishes through the session's client. Readings taken while the broker
/// is unreachable are dropped instead of piling up in the request queue.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    link: LinkState,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, link: LinkState) -> Self {
        Self { client, link }
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: String, qos: QoS, retain: bool) {
        if !self.link.is_online() {
            debug!("Broker offline, dropping '{}' for {}", payload, topic);
            return;
        }
        debug!("Publishing '{}' to {}", payload, topic);
        if let Err(e) = self.client.try_publish(topic, qos, retain, payload) {
            warn!("Failed to publish to {}: {}", topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_the_prefix() {
        let layout = TopicLayout::new("broadlink/");
        assert_eq!(layout.subscription(), "broadlink/#");
        assert_eq!(layout.temperature_topic(), "broadlink/temperature");
    }

    #[test]
    fn classification() {
        let layout = TopicLayout::new("broadlink/");
        assert_eq!(
            layout.classify("broadlink/livingroom/tv-power"),
            InboundRoute::Command("livingroom/tv-power".to_string())
        );
        assert_eq!(layout.classify("broadlink/temperature"), InboundRoute::Reserved);
        assert_eq!(
            layout.classify("broadlink/room/temperature"),
            InboundRoute::Command("room/temperature".to_string())
        );
        assert_eq!(layout.classify("broadlink/"), InboundRoute::Foreign);
        assert_eq!(layout.classify("other/tv"), InboundRoute::Foreign);
    }

    #[test]
    fn reserved_topic_never_reaches_the_dispatcher() {
        let (tx, mut rx) = mpsc::channel(10);
        let router = InboundRouter::new(TopicLayout::new("broadlink/"), tx);

        assert_eq!(
            router.route("broadlink/temperature", b"22.5"),
            InboundRoute::Reserved
        );
        router.route("elsewhere/tv", b"");
        router.route("broadlink/tv/power", b"record");

        assert_eq!(rx.try_recv().ok(), Some(CommandMessage::new("tv/power", "record")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn commands_keep_arrival_order() {
        let (tx, mut rx) = mpsc::channel(10);
        let router = InboundRouter::new(TopicLayout::new("ir/"), tx);

        for name in ["a", "b", "c"] {
            router.route(&format!("ir/{}", name), b"");
        }

        for name in ["a", "b", "c"] {
            assert_eq!(rx.recv().await.unwrap().name, name);
        }
    }

    #[test]
    fn closed_dispatcher_does_not_panic() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let router = InboundRouter::new(TopicLayout::new("broadlink/"), tx);

        assert_eq!(
            router.route("broadlink/fan", b""),
            InboundRoute::Command("fan".to_string())
        );
    }

    #[test]
    fn full_command_queue_drops_instead_of_waiting() {
        let (tx, mut rx) = mpsc::channel(1);
        let router = InboundRouter::new(TopicLayout::new("broadlink/"), tx);

        router.route("broadlink/tv/power", b"");
        assert_eq!(
            router.route("broadlink/tv/mute", b""),
            InboundRoute::Command("tv/mute".to_string())
        );

        assert_eq!(rx.try_recv().ok(), Some(CommandMessage::new("tv/power", "")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn link_state_is_shared_between_clones() {
        let link = LinkState::default();
        let seen_by_publisher = link.clone();
        assert!(!seen_by_publisher.is_online());

        link.set_online(true);
        assert!(seen_by_publisher.is_online());
    }
}

use std::time::Duration;

use chrono::{DateTime, Local};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use statum::{machine, state};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::MqttConfig;
use super::message_manager::{InboundRouter, LinkState, MqttPublisher, TopicLayout};
use crate::dispatch::CommandMessage;

/// Capacity of the client request queue.
const REQUEST_CAPACITY: usize = 100;

#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    pub messages_received: usize,
    pub reconnects: usize,
    pub last_activity: Option<DateTime<Local>>,
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Broker session supervisor.
///
/// Every network fault is logged, followed by a fixed pause, after which the
/// event loop is polled again and rumqttc reconnects. Subscriptions are
/// renewed on every ConnAck so a broker without a persistent session still
/// delivers commands after a reconnect.
///
/// The event loop is the only thing draining the client request queue, so
/// nothing in here may wait on that queue.
#[machine]
pub struct MqttSession<S: SessionState> {
    client: AsyncClient,
    eventloop: EventLoop,
    router: InboundRouter,
    link: LinkState,
    qos: QoS,
    reconnect_delay: Duration,
    stats: SessionStats,
}

/// Result of waiting for the broker handshake.
pub enum ConnectAttempt {
    Connected(MqttSession<Connected>),
    Failed(MqttSession<Disconnected>),
}

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id(), &config.broker, config.port);
    options
        .set_keep_alive(Duration::from_secs(config.keep_alive))
        .set_clean_session(config.clean_session)
        .set_last_will(LastWill::new(
            &config.will_topic,
            config.will_payload.as_bytes().to_vec(),
            QoS::AtMostOnce,
            false,
        ));

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }

    options
}

impl<S: SessionState> MqttSession<S> {
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}

impl MqttSession<Disconnected> {
    /// Builds the session and the publisher sharing its client.
    pub fn create(
        config: &MqttConfig,
        commands: mpsc::Sender<CommandMessage>,
    ) -> (Self, MqttPublisher) {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        let router = InboundRouter::new(TopicLayout::new(config.topic_prefix.clone()), commands);
        let link = LinkState::default();
        let publisher = MqttPublisher::new(client.clone(), link.clone());

        let session = Self::new(
            client,
            eventloop,
            router,
            link,
            config.qos(),
            Duration::from_secs(config.reconnect_delay),
            SessionStats::default(),
        );
        (session, publisher)
    }

    pub fn connect(self) -> MqttSession<Connecting> {
        debug!("Connecting to MQTT broker");
        self.transition()
    }

    /// Waits out the reconnect delay.
    pub async fn pause(mut self) -> Self {
        self.stats.reconnects += 1;
        info!(
            "Retrying broker connection in {:?} (attempt {})",
            self.reconnect_delay, self.stats.reconnects
        );
        tokio::time::sleep(self.reconnect_delay).await;
        self
    }

    /// Keeps the broker session alive until the task is dropped.
    pub async fn run_forever(self) {
        let mut session = self;
        loop {
            session = match session.connect().await_connack().await {
                ConnectAttempt::Connected(connected) => connected.deliver().await,
                ConnectAttempt::Failed(disconnected) => disconnected,
            }
            .pause()
            .await;
        }
    }
}

impl MqttSession<Connecting> {
    pub async fn await_connack(mut self) -> ConnectAttempt {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Connected to MQTT broker ({:?})", ack.code);
                    self.link.set_online(true);
                    return ConnectAttempt::Connected(self.transition());
                }
                Ok(event) => debug!("Ignoring {:?} while connecting", event),
                Err(e) => {
                    warn!("Connection to MQTT broker failed: {}", e);
                    return ConnectAttempt::Failed(self.transition());
                }
            }
        }
    }
}

impl MqttSession<Connected> {
    /// Subscribes to the command namespace and delivers publishes to the
    /// router until the connection drops.
    ///
    /// The subscription is queued without waiting. A request queue still
    /// full of publishes from before the outage is drained by the polls in
    /// between, and the subscription is retried until it fits.
    pub async fn deliver(mut self) -> MqttSession<Disconnected> {
        let subscription = self.router.layout().subscription();
        let mut subscribed = false;

        loop {
            if !subscribed {
                match self.client.try_subscribe(subscription.as_str(), self.qos) {
                    Ok(()) => {
                        info!("Subscribed to {}", subscription);
                        subscribed = true;
                    }
                    Err(e) => debug!("Subscription to {} deferred: {}", subscription, e),
                }
            }

            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.stats.messages_received += 1;
                    self.stats.last_activity = Some(Local::now());
                    self.router.route(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!("Subscription acknowledged: {:?}", ack.return_codes)
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Lost MQTT broker connection after {} messages: {}",
                        self.stats.messages_received, e
                    );
                    self.link.set_online(false);
                    return self.transition();
                }
            }
        }
    }
}

//! # MQTT Integration
//!
//! The bridge's only outward surface. A single broker session subscribes to
//! `<prefix>#`, turns every publish below the prefix into a
//! [`CommandMessage`](crate::dispatch::CommandMessage) and hands it to the
//! dispatcher channel. Temperature readings go the other way through a
//! [`Publisher`](message_manager::Publisher).
//!
//! ```text
//! mqtt/
//! ├── config.rs           - `[mqtt]` table and its validation
//! ├── message_manager.rs  - topic layout, inbound routing, publishing
//! └── mqtt_handler.rs     - broker session state machine
//! ```
//!
//! The session never gives up: network faults are logged, the supervisor
//! pauses for `reconnect_delay` seconds and then lets rumqttc reconnect.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use message_manager::{MqttPublisher, Publisher, TopicLayout};
pub use mqtt_handler::MqttSession;

//! # Rainfeed Bus
//!
//! Publish/subscribe client for gauge snapshot topics.
//!
//! ## Delivery
//!
//! Subscribers receive at-least-once delivery. A handler settles every
//! message: acknowledging it removes it from the group, refusing it makes
//! it come back after the ack deadline. Payloads that fail to decode are
//! still handed over so the consumer decides how to drop them.
//!
//! ## Backends
//!
//! - [`MqttTopic`]: MQTT broker, durable groups via shared subscriptions
//!   on a persistent session
//! - [`MemoryTopic`]: in-process topic for dry runs and tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod mqtt;
pub mod topic;

pub use memory::{MemoryTopic, MemoryTopicStats};
pub use mqtt::{MqttTopic, MqttTopicConfig};
pub use topic::{
    settled, BoxError, BusError, Settlement, SnapshotHandler, SnapshotTopic, DEFAULT_ACK_DEADLINE,
};

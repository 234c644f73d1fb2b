//! Topic and subscription naming for snapshot streams.
//!
//! One topic carries one snapshot stream. Consumers subscribe as
//! `<topic>.<group>`:
//!
//! - a named group is durable and shared: every consumer in the group gets
//!   a share of the stream, and the subscription outlives restarts
//! - an empty group gets a timestamp-derived name
//!   (`<topic>.v2024-01-01-10-30-00.123456`) and is removed on clean shutdown

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default topic for live gauge snapshots.
pub const DEFAULT_TOPIC: &str = "gauge-snapshots";

/// Prefix of broker-side shared subscription filters.
pub const SHARED_PREFIX: &str = "$share";

/// Whether a subscription survives consumer restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// Named group, kept by the broker across restarts
    Durable,
    /// Single listener, deleted on clean shutdown
    Ephemeral,
}

/// A resolved subscription on a snapshot topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Topic the subscription reads from
    pub topic: String,
    /// Consumer group (timestamp-derived for ephemeral subscriptions)
    pub group: String,
    /// Lifetime of the subscription
    pub durability: Durability,
}

impl Subscription {
    /// Resolve a subscription for `group` on `topic`.
    ///
    /// An empty group yields an ephemeral subscription named after `now`.
    ///
    /// # Errors
    ///
    /// Returns error if the topic or group is not a valid name.
    pub fn new(topic: &str, group: &str, now: DateTime<Utc>) -> Result<Self, TopicError> {
        validate_topic(topic)?;

        if group.is_empty() {
            return Ok(Self {
                topic: topic.to_string(),
                group: now.format("v%Y-%m-%d-%H-%M-%S%.6f").to_string(),
                durability: Durability::Ephemeral,
            });
        }

        if group.contains(['/', '+', '#', '.']) {
            return Err(TopicError::InvalidGroup(group.to_string()));
        }

        Ok(Self {
            topic: topic.to_string(),
            group: group.to_string(),
            durability: Durability::Durable,
        })
    }

    /// Subscription name, `<topic>.<group>`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}.{}", self.topic, self.group)
    }

    /// Whether the broker should keep this subscription across restarts.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.durability == Durability::Durable
    }

    /// Broker filter to subscribe with.
    ///
    /// Durable groups use a shared subscription so members split the work.
    #[must_use]
    pub fn filter(&self) -> String {
        match self.durability {
            Durability::Durable => format!("{SHARED_PREFIX}/{}/{}", self.group, self.topic),
            Durability::Ephemeral => self.topic.clone(),
        }
    }
}

/// Check that a topic name can be published to.
///
/// # Errors
///
/// Returns error if the name is empty, contains wildcards, or is reserved.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() || topic.contains(['+', '#']) || topic.starts_with('$') {
        return Err(TopicError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Errors for topic naming.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// Topic name cannot be used
    #[error("invalid topic name: {0:?}")]
    InvalidTopic(String),
    /// Group name cannot be used
    #[error("invalid consumer group: {0:?}")]
    InvalidGroup(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T10:30:00.123456Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn durable_group() {
        let sub = Subscription::new("gauge-snapshots", "firestore", now()).unwrap();

        assert!(sub.is_durable());
        assert_eq!(sub.name(), "gauge-snapshots.firestore");
        assert_eq!(sub.filter(), "$share/firestore/gauge-snapshots");
    }

    #[test]
    fn ephemeral_group_named_after_time() {
        let sub = Subscription::new("gauge-snapshots", "", now()).unwrap();

        assert!(!sub.is_durable());
        assert_eq!(sub.name(), "gauge-snapshots.v2024-01-01-10-30-00.123456");
        assert_eq!(sub.filter(), "gauge-snapshots");
    }

    #[test]
    fn invalid_names() {
        assert_eq!(
            Subscription::new("gauges/#", "a", now()),
            Err(TopicError::InvalidTopic("gauges/#".to_string()))
        );
        assert!(validate_topic("").is_err());
        assert!(validate_topic("$SYS/broker").is_err());
        assert_eq!(
            Subscription::new("gauges", "a/b", now()),
            Err(TopicError::InvalidGroup("a/b".to_string()))
        );
    }
}

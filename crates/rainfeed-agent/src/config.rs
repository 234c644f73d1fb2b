//! Agent configuration.

use crate::writer::WriterConfig;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Bus configuration
    pub bus: BusConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Merge engine tuning
    pub writer: WriterConfig,

    /// Section catalogue file
    pub catalogue_path: PathBuf,

    /// Pause between section loads at startup
    pub load_interval: Duration,

    /// Stop the agent after running this long
    pub shutdown_after: Duration,
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// MQTT broker URL; `None` runs on an in-process topic
    pub mqtt_broker: Option<String>,

    /// Topic carrying gauge snapshots
    pub topic: String,

    /// Consumer group; empty for an ephemeral subscription
    pub group: String,

    /// Identity of this replica within its group, stable across restarts
    pub instance_id: String,

    /// Delay before an unacknowledged snapshot is handled again
    pub ack_deadline: Duration,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Database path (for `SQLite`)
    pub db_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig {
                mqtt_broker: None,
                topic: rainfeed_proto::DEFAULT_TOPIC.to_string(),
                group: String::new(),
                instance_id: Uuid::new_v4().simple().to_string(),
                ack_deadline: rainfeed_bus::DEFAULT_ACK_DEADLINE,
            },
            persistence: PersistenceConfig {
                db_path: PathBuf::from("./rainfeed.db"),
            },
            writer: WriterConfig::default(),
            catalogue_path: PathBuf::from("./catalogue.json"),
            load_interval: Duration::from_millis(50),
            shutdown_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RAINFEED_MQTT_BROKER`: MQTT broker URL (unset: dry run in memory)
    /// - `RAINFEED_TOPIC`: Snapshot topic
    /// - `RAINFEED_GROUP`: Consumer group
    /// - `RAINFEED_INSTANCE_ID`: Replica id within the group (default:
    ///   `HOSTNAME`, else random per run)
    /// - `RAINFEED_DB_PATH`: `SQLite` database path
    /// - `RAINFEED_CATALOGUE`: Section catalogue JSON file
    /// - `RAINFEED_RETENTION_HOURS`: Reading retention window
    /// - `RAINFEED_MISSING_AFTER_MINUTES`: Silence before `snapshot.missing`
    /// - `RAINFEED_ACK_DEADLINE_SECS`: Redelivery delay
    /// - `RAINFEED_MAX_CONSECUTIVE_FAILURES`: Store failures before giving up
    /// - `RAINFEED_SHUTDOWN_AFTER_HOURS`: Maximum run time
    /// - `RAINFEED_LOAD_INTERVAL_MS`: Pause between section loads
    ///
    /// # Errors
    ///
    /// Returns error if a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns error if a numeric variable does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(broker) = lookup("RAINFEED_MQTT_BROKER").filter(|b| !b.is_empty()) {
            config.bus.mqtt_broker = Some(broker);
        }

        if let Some(topic) = lookup("RAINFEED_TOPIC") {
            config.bus.topic = topic;
        }

        if let Some(group) = lookup("RAINFEED_GROUP") {
            config.bus.group = group;
        }

        if let Some(instance_id) = lookup("RAINFEED_INSTANCE_ID")
            .or_else(|| lookup("HOSTNAME"))
            .filter(|id| !id.trim().is_empty())
        {
            config.bus.instance_id = instance_id.trim().to_string();
        }

        if let Some(db_path) = lookup("RAINFEED_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(path) = lookup("RAINFEED_CATALOGUE") {
            config.catalogue_path = PathBuf::from(path);
        }

        if let Some(hours) = parse::<i64>(&lookup, "RAINFEED_RETENTION_HOURS")? {
            config.writer.retention = chrono::Duration::hours(hours);
        }

        if let Some(minutes) = parse::<u64>(&lookup, "RAINFEED_MISSING_AFTER_MINUTES")? {
            config.writer.missing_after = Duration::from_secs(minutes * 60);
        }

        if let Some(secs) = parse::<u64>(&lookup, "RAINFEED_ACK_DEADLINE_SECS")? {
            config.bus.ack_deadline = Duration::from_secs(secs);
        }

        if let Some(max) = parse::<u32>(&lookup, "RAINFEED_MAX_CONSECUTIVE_FAILURES")? {
            config.writer.max_consecutive_failures = max.max(1);
        }

        if let Some(hours) = parse::<u64>(&lookup, "RAINFEED_SHUTDOWN_AFTER_HOURS")? {
            config.shutdown_after = Duration::from_secs(hours * 60 * 60);
        }

        if let Some(ms) = parse::<u64>(&lookup, "RAINFEED_LOAD_INTERVAL_MS")? {
            config.load_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Whether the agent runs without a broker.
    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.bus.mqtt_broker.is_none()
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {key}: {value:?}"))
        })
        .transpose()
}

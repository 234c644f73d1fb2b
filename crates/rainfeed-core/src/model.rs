//! Gauge data model shared by producers and the snapshot consumer.
//!
//! A [`Snapshot`] is what travels over the bus: one [`Station`] plus a batch
//! of [`Reading`]s. On the consuming side snapshots are folded into
//! [`Measure`]s, which are grouped per river section into a [`Record`].

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// The quantity a gauge measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StationKind {
    /// Discharge
    Flow,
    /// River stage
    Level,
    /// Water temperature
    Temperature,
    /// Rain gauge
    Rainfall,
    /// Anything an upstream feed reports that we do not classify
    #[default]
    #[serde(other)]
    Unknown,
}

impl StationKind {
    /// Wire label for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flow => "flow",
            Self::Level => "level",
            Self::Temperature => "temperature",
            Self::Rainfall => "rainfall",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a wire label; unrecognised labels map to [`StationKind::Unknown`].
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label {
            "flow" => Self::Flow,
            "level" => Self::Level,
            "temperature" => Self::Temperature,
            "rainfall" => Self::Rainfall,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for StationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and metadata for one gauge sensor.
///
/// A sensor can be known by up to three URLs. At least one of them is
/// non-empty and stays stable for the sensor's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Station {
    /// Canonical upstream identifier
    pub data_url: String,
    /// Stable internal identifier (may be empty until the first snapshot)
    pub alias_url: String,
    /// Web-facing identifier
    pub human_url: String,
    /// Station name
    pub name: String,
    /// River the station sits on
    pub river_name: String,
    /// Latitude
    pub lat: f32,
    /// Longitude
    pub lg: f32,
    /// Measured quantity
    #[serde(rename = "type")]
    pub kind: StationKind,
    /// Unit of the reading values
    pub unit: String,
}

impl Station {
    /// The three identity URLs in lookup order: data, alias, human.
    #[must_use]
    pub fn urls(&self) -> [&str; 3] {
        [&self.data_url, &self.alias_url, &self.human_url]
    }

    /// Whether the station carries at least one identity URL.
    #[must_use]
    pub fn has_identity(&self) -> bool {
        self.urls().iter().any(|url| !url.is_empty())
    }
}

/// One timestamped scalar observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Observation instant, whole seconds
    pub event_time: DateTime<Utc>,
    /// Observed value
    pub value: f32,
}

impl Reading {
    /// Create a reading, truncating the instant to whole seconds.
    #[must_use]
    pub fn new(event_time: DateTime<Utc>, value: f32) -> Self {
        Self {
            event_time: event_time.with_nanosecond(0).unwrap_or(event_time),
            value,
        }
    }

    /// Create a reading from epoch seconds.
    ///
    /// Returns `None` if the seconds are outside the representable range.
    #[must_use]
    pub fn at_epoch(secs: i64, value: f32) -> Option<Self> {
        DateTime::from_timestamp(secs, 0).map(|event_time| Self { event_time, value })
    }
}

/// A transport unit: one station plus a batch of readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Snapshot {
    /// Station metadata at the time of publishing
    pub station: Station,
    /// Readings in event-time order (usually one for live updates)
    pub readings: Vec<Reading>,
    /// Trace identifier shared by every message of one operation
    pub correlation_id: String,
    /// Identifier of the message that caused this one
    pub causation_id: String,
    /// Producer-side processing instant
    pub processed_time: DateTime<Utc>,
}

impl Snapshot {
    /// Create a snapshot processed now, without trace identifiers.
    #[must_use]
    pub fn new(station: Station, readings: Vec<Reading>) -> Self {
        Self {
            station,
            readings,
            correlation_id: String::new(),
            causation_id: String::new(),
            processed_time: Utc::now(),
        }
    }

    /// Attach trace identifiers.
    #[must_use]
    pub fn with_trace(
        mut self,
        correlation_id: impl Into<String>,
        causation_id: impl Into<String>,
    ) -> Self {
        self.correlation_id = correlation_id.into();
        self.causation_id = causation_id.into();
        self
    }
}

/// Immutable reference data that maps an upstream feed to a known measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Calibration {
    /// Reference URL matched against a station's data, alias or human URL
    pub url: String,
    /// Too low to paddle
    pub scrape: Option<f32>,
    /// Low but runnable
    pub low: Option<f32>,
    /// Medium
    pub medium: Option<f32>,
    /// High
    pub high: Option<f32>,
    /// Flood
    pub huge: Option<f32>,
}

/// The durable time series for one physical sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    /// Latest known station metadata
    pub station: Station,
    /// Calibration resolved when the measure was created
    pub calibration: Calibration,
    /// Deduplicated readings in ascending event-time order
    pub readings: Vec<Reading>,
    /// Processing instant of the last accepted snapshot
    pub processed_time: Option<DateTime<Utc>>,
}

impl Measure {
    /// Create an empty measure for a freshly resolved station.
    #[must_use]
    pub fn new(station: Station, calibration: Calibration) -> Self {
        Self {
            station,
            calibration,
            readings: Vec::new(),
            processed_time: None,
        }
    }
}

/// Catalogue entry for one river section and the feeds calibrated for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Section {
    /// Section identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Calibrations for every feed relevant to this section
    pub calibrations: Vec<Calibration>,
}

/// The persistence unit: one section with its ordered measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Section identifier
    pub section_id: String,
    /// Section display name
    pub name: String,
    /// Measures in creation order
    pub measures: Vec<Measure>,
}

impl Record {
    /// Create a record with no measures.
    #[must_use]
    pub fn new(section_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            section_id: section_id.into(),
            name: name.into(),
            measures: Vec::new(),
        }
    }
}

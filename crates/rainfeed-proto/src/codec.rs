//! Snapshot wire codec.
//!
//! A snapshot travels as one CBOR map. Keys are named explicitly below and
//! never depend on Rust declaration order:
//!
//! | Key | Meaning | CBOR type |
//! |-----|---------|-----------|
//! | `v` | wire version, absent means 1 | uint |
//! | `station` | map, see next table | map |
//! | `readings` | array of `{t, v}` maps | array |
//! | `correlation_id` | trace id | text |
//! | `causation_id` | parent trace id | text |
//! | `processed_time` | epoch seconds | int |
//!
//! Station map: `data_url`, `alias_url`, `human_url`, `name`, `river_name`,
//! `type`, `unit` as text; `lat`, `lg` as float32. Reading map: `t` epoch
//! seconds, `v` float32.
//!
//! Compatibility rules: decoders ignore keys they do not know, and any key
//! added later must have a default so older payloads still decode.
//! Timestamps are carried at whole-second precision.

use chrono::DateTime;
use rainfeed_core::{Reading, Snapshot, Station, StationKind};
use serde::{Deserialize, Serialize};

/// Current wire version written by [`encode`].
pub const WIRE_VERSION: u32 = 1;

fn default_version() -> u32 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
struct WireSnapshot {
    #[serde(default = "default_version")]
    v: u32,
    #[serde(default)]
    station: WireStation,
    #[serde(default)]
    readings: Vec<WireReading>,
    #[serde(default)]
    correlation_id: String,
    #[serde(default)]
    causation_id: String,
    #[serde(default)]
    processed_time: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct WireStation {
    data_url: String,
    alias_url: String,
    human_url: String,
    name: String,
    river_name: String,
    lat: f32,
    lg: f32,
    #[serde(rename = "type")]
    kind: String,
    unit: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireReading {
    t: i64,
    v: f32,
}

impl From<&Station> for WireStation {
    fn from(station: &Station) -> Self {
        Self {
            data_url: station.data_url.clone(),
            alias_url: station.alias_url.clone(),
            human_url: station.human_url.clone(),
            name: station.name.clone(),
            river_name: station.river_name.clone(),
            lat: station.lat,
            lg: station.lg,
            kind: station.kind.as_str().to_string(),
            unit: station.unit.clone(),
        }
    }
}

impl From<WireStation> for Station {
    fn from(wire: WireStation) -> Self {
        Self {
            kind: StationKind::from_label(&wire.kind),
            data_url: wire.data_url,
            alias_url: wire.alias_url,
            human_url: wire.human_url,
            name: wire.name,
            river_name: wire.river_name,
            lat: wire.lat,
            lg: wire.lg,
            unit: wire.unit,
        }
    }
}

/// Encode a snapshot into its wire form.
///
/// # Errors
///
/// Returns error if CBOR serialization fails.
pub fn encode(snapshot: &Snapshot) -> Result<Vec<u8>, CodecError> {
    let wire = WireSnapshot {
        v: WIRE_VERSION,
        station: WireStation::from(&snapshot.station),
        readings: snapshot
            .readings
            .iter()
            .map(|reading| WireReading {
                t: reading.event_time.timestamp(),
                v: reading.value,
            })
            .collect(),
        correlation_id: snapshot.correlation_id.clone(),
        causation_id: snapshot.causation_id.clone(),
        processed_time: snapshot.processed_time.timestamp(),
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&wire, &mut bytes).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decode a snapshot from its wire form.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for truncated or malformed payloads and
/// for timestamps outside the representable range.
pub fn decode(bytes: &[u8]) -> Result<Snapshot, CodecError> {
    let wire: WireSnapshot =
        ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;

    let readings = wire
        .readings
        .into_iter()
        .map(|reading| {
            Reading::at_epoch(reading.t, reading.v).ok_or_else(|| {
                CodecError::Decode(format!("reading time {} out of range", reading.t))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let processed_time = DateTime::from_timestamp(wire.processed_time, 0).ok_or_else(|| {
        CodecError::Decode(format!(
            "processed time {} out of range",
            wire.processed_time
        ))
    })?;

    Ok(Snapshot {
        station: wire.station.into(),
        readings,
        correlation_id: wire.correlation_id,
        causation_id: wire.causation_id,
        processed_time,
    })
}

/// Errors for snapshot encoding/decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed
    #[error("snapshot encode failed: {0}")]
    Encode(String),
    /// Payload was truncated or malformed
    #[error("snapshot decode failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn sample() -> Snapshot {
        let timestamp = DateTime::parse_from_rfc3339("2016-01-01T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);

        Snapshot {
            station: Station {
                data_url: "http://environment.data.gov.uk/flood-monitoring/id/measures/1029TH-level-downstage-i-15_min-mASD".to_string(),
                alias_url: "rloi://1234".to_string(),
                human_url: "http://environment.data.gov.uk/flood-monitoring/id/stations/1029TH".to_string(),
                name: "Bourton Dickler".to_string(),
                river_name: "Dikler".to_string(),
                lat: 51.874_767,
                lg: -1.740_083,
                kind: StationKind::Level,
                unit: "metre".to_string(),
            },
            readings: vec![
                Reading::new(timestamp + Duration::seconds(1), 1.23),
                Reading::new(timestamp + Duration::seconds(10), 4.56),
            ],
            correlation_id: "ABCDE".to_string(),
            causation_id: "FGHIJ".to_string(),
            processed_time: timestamp,
        }
    }

    #[test]
    fn snapshot_roundtrip() {
        let before = sample();

        let bytes = encode(&before).unwrap();
        let after = decode(&bytes).unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn sub_second_precision_is_truncated() {
        let mut before = sample();
        before.processed_time += Duration::milliseconds(640);

        let after = decode(&encode(&before).unwrap()).unwrap();

        assert_eq!(
            before.processed_time.timestamp(),
            after.processed_time.timestamp()
        );
        assert_eq!(after.processed_time.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        let bytes = encode(&sample()).unwrap();

        for len in 0..bytes.len() {
            match decode(&bytes[..len]) {
                Err(CodecError::Decode(_)) => {}
                other => panic!("prefix of {len} bytes decoded as {other:?}"),
            }
        }
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            decode(b"definitely not cbor"),
            Err(CodecError::Decode(_))
        ));
        // a valid CBOR integer, but not a snapshot map
        assert!(matches!(decode(&[0x18, 0x2a]), Err(CodecError::Decode(_))));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        #[derive(Serialize)]
        struct NewerSnapshot {
            v: u32,
            station: WireStation,
            readings: Vec<WireReading>,
            processed_time: i64,
            quality_flag: String,
        }

        let newer = NewerSnapshot {
            v: 2,
            station: WireStation {
                alias_url: "rloi://9".to_string(),
                ..WireStation::default()
            },
            readings: vec![WireReading { t: 100, v: 1.0 }],
            processed_time: 200,
            quality_flag: "good".to_string(),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&newer, &mut bytes).unwrap();

        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.station.alias_url, "rloi://9");
        assert_eq!(decoded.readings.len(), 1);
        assert_eq!(decoded.processed_time.timestamp(), 200);
    }

    #[test]
    fn older_payload_without_trace_ids_decodes() {
        #[derive(Serialize)]
        struct OlderSnapshot {
            station: WireStation,
            readings: Vec<WireReading>,
        }

        let older = OlderSnapshot {
            station: WireStation {
                data_url: "https://example.org/measures/1".to_string(),
                kind: "flow".to_string(),
                ..WireStation::default()
            },
            readings: vec![],
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&older, &mut bytes).unwrap();

        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.station.kind, StationKind::Flow);
        assert!(decoded.correlation_id.is_empty());
        assert_eq!(decoded.processed_time.timestamp(), 0);
    }

    #[test]
    fn out_of_range_time_is_a_decode_error() {
        let wire = WireSnapshot {
            v: WIRE_VERSION,
            station: WireStation::default(),
            readings: vec![WireReading { t: i64::MAX, v: 0.0 }],
            correlation_id: String::new(),
            causation_id: String::new(),
            processed_time: 0,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&wire, &mut bytes).unwrap();

        assert!(matches!(decode(&bytes), Err(CodecError::Decode(_))));
    }
}

//! Reading merge semantics for measures.
//!
//! Merging a snapshot into a measure is pure, in-memory work and cannot
//! fail. The steps, applied in order by [`Measure::absorb`]:
//!
//! | Step | Rule |
//! |------|------|
//! | Merge | Readings keyed by event time, incoming value wins at the same instant |
//! | Order | Ascending event time |
//! | Retention | Readings older than the cutoff are dropped |
//! | Metadata | Station replaced by the snapshot's station |
//! | Change detection | [`Checksum`] of station + readings compared before/after |

use crate::model::{Measure, Reading, Snapshot, Station};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Content fingerprint of a measure, used to suppress redundant writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(u64);

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Result of absorbing a snapshot into a measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Content changed and should be persisted
    Changed,
    /// Nothing observable changed
    Unchanged,
}

/// Combine two reading sets keyed by event time.
///
/// Readings from `incoming` replace existing readings at the same instant,
/// and later duplicates within `incoming` replace earlier ones. The result
/// is sorted by ascending event time.
#[must_use]
pub fn merge_readings(existing: &[Reading], incoming: &[Reading]) -> Vec<Reading> {
    let mut by_time: BTreeMap<DateTime<Utc>, f32> = existing
        .iter()
        .map(|reading| (reading.event_time, reading.value))
        .collect();

    for reading in incoming {
        by_time.insert(reading.event_time, reading.value);
    }

    by_time
        .into_iter()
        .map(|(event_time, value)| Reading { event_time, value })
        .collect()
}

/// Drop every reading whose event time is before `cutoff`.
///
/// Returns the number of readings removed.
pub fn remove_older_than(cutoff: DateTime<Utc>, readings: &mut Vec<Reading>) -> usize {
    let before = readings.len();
    readings.retain(|reading| reading.event_time >= cutoff);
    before - readings.len()
}

fn hash_station<H: Hasher>(station: &Station, state: &mut H) {
    station.data_url.hash(state);
    station.alias_url.hash(state);
    station.human_url.hash(state);
    station.name.hash(state);
    station.river_name.hash(state);
    station.lat.to_bits().hash(state);
    station.lg.to_bits().hash(state);
    station.kind.hash(state);
    station.unit.hash(state);
}

impl Measure {
    /// Fingerprint of the station metadata and readings.
    ///
    /// Calibration and processing time are not part of the fingerprint.
    #[must_use]
    pub fn checksum(&self) -> Checksum {
        use std::collections::hash_map::DefaultHasher;

        let mut hasher = DefaultHasher::new();
        hash_station(&self.station, &mut hasher);
        self.readings.len().hash(&mut hasher);
        for reading in &self.readings {
            reading.event_time.timestamp().hash(&mut hasher);
            reading.value.to_bits().hash(&mut hasher);
        }
        Checksum(hasher.finish())
    }

    /// Fold a snapshot into this measure.
    ///
    /// Readings before `cutoff` are dropped whether or not anything new was
    /// merged. `processed_time` only moves when the content changed.
    pub fn absorb(&mut self, snapshot: &Snapshot, cutoff: DateTime<Utc>) -> MergeOutcome {
        let before = self.checksum();

        self.readings = merge_readings(&self.readings, &snapshot.readings);
        let expired = remove_older_than(cutoff, &mut self.readings);
        self.station = snapshot.station.clone();

        let after = self.checksum();
        tracing::debug!(
            alias_url = %self.station.alias_url,
            incoming = snapshot.readings.len(),
            expired,
            total = self.readings.len(),
            %before,
            %after,
            "Absorbed snapshot"
        );

        if before == after {
            return MergeOutcome::Unchanged;
        }
        self.processed_time = Some(snapshot.processed_time);
        MergeOutcome::Changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Calibration, StationKind};
    use chrono::Duration;

    fn at(secs: i64, value: f32) -> Reading {
        Reading::at_epoch(secs, value).unwrap()
    }

    fn station(alias: &str) -> Station {
        Station {
            data_url: "https://environment.data.gov.uk/flood-monitoring/id/measures/1029TH-level"
                .to_string(),
            alias_url: alias.to_string(),
            name: "Bourton Dickler".to_string(),
            river_name: "Dikler".to_string(),
            lat: 51.874_767,
            lg: -1.740_083,
            kind: StationKind::Level,
            unit: "m".to_string(),
            ..Station::default()
        }
    }

    #[test]
    fn merge_replaces_and_sorts() {
        let existing = vec![at(100, 0.0), at(300, 3.0)];
        let incoming = vec![at(100, 1.0), at(200, 2.0)];

        let merged = merge_readings(&existing, &incoming);

        assert_eq!(merged, vec![at(100, 1.0), at(200, 2.0), at(300, 3.0)]);
    }

    #[test]
    fn merge_collapses_duplicates_within_batch() {
        let merged = merge_readings(&[], &[at(50, 1.0), at(10, 9.0), at(50, 2.0)]);
        assert_eq!(merged, vec![at(10, 9.0), at(50, 2.0)]);
    }

    #[test]
    fn retention_drops_old_readings() {
        let mut readings = vec![at(100, 1.0), at(200, 2.0), at(300, 3.0)];
        let cutoff = DateTime::from_timestamp(200, 0).unwrap();

        let removed = remove_older_than(cutoff, &mut readings);

        assert_eq!(removed, 1);
        assert_eq!(readings, vec![at(200, 2.0), at(300, 3.0)]);
    }

    #[test]
    fn absorb_same_snapshot_twice_is_unchanged() {
        let mut measure = Measure::new(station("rloi://1234"), Calibration::default());
        let snap = Snapshot::new(station("rloi://1234"), vec![at(1000, 1.0)]);
        let cutoff = DateTime::from_timestamp(0, 0).unwrap();

        assert_eq!(measure.absorb(&snap, cutoff), MergeOutcome::Changed);
        assert_eq!(measure.processed_time, Some(snap.processed_time));

        let later = Snapshot {
            processed_time: snap.processed_time + Duration::minutes(15),
            ..snap.clone()
        };
        assert_eq!(measure.absorb(&later, cutoff), MergeOutcome::Unchanged);
        assert_eq!(measure.processed_time, Some(snap.processed_time));
    }

    #[test]
    fn absorb_detects_metadata_drift() {
        let mut measure = Measure::new(station("rloi://1234"), Calibration::default());
        let cutoff = DateTime::from_timestamp(0, 0).unwrap();
        let snap = Snapshot::new(station("rloi://1234"), vec![at(1000, 1.0)]);
        measure.absorb(&snap, cutoff);

        let mut renamed = station("rloi://1234");
        renamed.name = "Bourton-on-the-Water".to_string();
        let snap = Snapshot::new(renamed, vec![at(1000, 1.0)]);

        assert_eq!(measure.absorb(&snap, cutoff), MergeOutcome::Changed);
        assert_eq!(measure.station.name, "Bourton-on-the-Water");
    }

    #[test]
    fn absorb_applies_retention_without_new_readings() {
        let mut measure = Measure::new(station("rloi://1234"), Calibration::default());
        measure.readings = vec![at(100, 1.0), at(5000, 2.0)];
        let snap = Snapshot::new(station("rloi://1234"), Vec::new());

        let outcome = measure.absorb(&snap, DateTime::from_timestamp(1000, 0).unwrap());

        assert_eq!(outcome, MergeOutcome::Changed);
        assert_eq!(measure.readings, vec![at(5000, 2.0)]);
    }

    #[test]
    fn checksum_ignores_calibration() {
        let mut a = Measure::new(station("x"), Calibration::default());
        let b = Measure::new(
            station("x"),
            Calibration {
                url: "https://example.org/cal".to_string(),
                low: Some(0.4),
                ..Calibration::default()
            },
        );
        assert_eq!(a.checksum(), b.checksum());

        a.readings.push(at(1, 0.1));
        assert_ne!(a.checksum(), b.checksum());
    }
}

//! # Rainfeed Core
//!
//! Data model and merge semantics for river gauge snapshots.
//!
//! This crate provides:
//! - The snapshot model shared by producers and consumers
//! - Reading merge, retention and change detection for measures
//! - Calibration lookup used to resolve a new station to a measure
//! - A clock abstraction so retention can be driven in tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod calibration;
pub mod clock;
pub mod merge;
pub mod model;

pub use calibration::find_calibration;
pub use clock::{Clock, FixedClock, SystemClock};
pub use merge::{merge_readings, remove_older_than, Checksum, MergeOutcome};
pub use model::{
    Calibration, Measure, Reading, Record, Section, Snapshot, Station, StationKind,
};

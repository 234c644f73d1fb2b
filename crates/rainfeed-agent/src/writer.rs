//! Per-section merge engine.
//!
//! One [`RecordWriter`] task owns one section's [`Record`]. Each routed
//! snapshot is resolved to a measure (creating it from the section's
//! calibrations on first sight), merged, trimmed to the retention window
//! and written back only when the measure's checksum moved.

use crate::identity::{identity_url, IdentityIndex};
use crate::persistence::{PersistenceError, RecordStore};
use crate::router::Delivery;
use rainfeed_core::{find_calibration, Clock, Measure, MergeOutcome, Record, Section, Snapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Tuning for a record writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Readings older than this are dropped on every merge
    pub retention: chrono::Duration,
    /// Silence after which `snapshot.missing` is reported
    pub missing_after: Duration,
    /// Consecutive store failures before the writer gives up
    pub max_consecutive_failures: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            retention: chrono::Duration::days(4),
            missing_after: Duration::from_secs(4 * 60 * 60),
            max_consecutive_failures: 3,
        }
    }
}

/// Lifecycle of a record writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Running, no snapshot seen yet
    AwaitingFirst,
    /// Running, at least one snapshot handled
    Active,
    /// Loop exited
    Stopped,
}

/// Observable progress of a record writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterStatus {
    /// Lifecycle state
    pub state: WriterState,
    /// Times `snapshot.missing` was reported
    pub missing_alerts: u64,
}

/// What happened to one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Record content changed and was stored
    Saved,
    /// Nothing changed, no write issued
    Unchanged,
}

/// Merge task state for one section.
pub struct RecordWriter {
    section: Section,
    record: Record,
    identity: Arc<IdentityIndex>,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    config: WriterConfig,
    status: watch::Sender<WriterStatus>,
    consecutive_failures: u32,
}

impl RecordWriter {
    /// Create a writer for `section`, starting from its loaded `record`.
    ///
    /// The record's measures are registered in `identity`.
    #[must_use]
    pub fn new(
        section: Section,
        record: Record,
        identity: Arc<IdentityIndex>,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        config: WriterConfig,
    ) -> Self {
        identity.seed(&record);
        let (status, _) = watch::channel(WriterStatus {
            state: WriterState::AwaitingFirst,
            missing_alerts: 0,
        });
        Self {
            section,
            record,
            identity,
            store,
            clock,
            config,
            status,
            consecutive_failures: 0,
        }
    }

    /// Section this writer owns.
    #[must_use]
    pub fn section_id(&self) -> &str {
        &self.section.id
    }

    /// Current in-memory record.
    #[must_use]
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Watch the writer's status; the last value stays readable after the
    /// writer stopped.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<WriterStatus> {
        self.status.subscribe()
    }

    /// Handle deliveries until cancelled or the inbox closes.
    ///
    /// Every delivery is answered: accepted once merged (and stored, if it
    /// changed anything), rejected otherwise.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`WriterError`]: a snapshot no calibration
    /// matches, or too many consecutive store failures.
    pub async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Delivery>,
        cancel: CancellationToken,
    ) -> Result<(), WriterError> {
        let idle = tokio::time::sleep(self.config.missing_after);
        tokio::pin!(idle);

        let result = loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break Ok(()),

                () = &mut idle => {
                    tracing::warn!(
                        event = "snapshot.missing",
                        section_id = %self.section.id,
                        silent_for_secs = self.config.missing_after.as_secs(),
                        "No snapshots received"
                    );
                    self.status.send_modify(|status| status.missing_alerts += 1);
                    idle.as_mut().reset(Instant::now() + self.config.missing_after);
                }

                delivery = inbox.recv() => {
                    let Some(delivery) = delivery else { break Ok(()) };
                    idle.as_mut().reset(Instant::now() + self.config.missing_after);
                    self.status.send_if_modified(|status| {
                        let first = status.state == WriterState::AwaitingFirst;
                        status.state = WriterState::Active;
                        first
                    });

                    let applied = self.apply(&delivery.snapshot).await;
                    match applied {
                        Ok(_) => delivery.accept(),
                        Err(err) if err.is_fatal() => {
                            delivery.reject(&err);
                            break Err(err);
                        }
                        Err(err) => delivery.reject(&err),
                    }
                }
            }
        };

        self.status.send_modify(|status| status.state = WriterState::Stopped);
        tracing::debug!(section_id = %self.section.id, "Record writer stopped");
        result
    }

    /// Merge one snapshot into the record and store it if it changed.
    ///
    /// A failed store leaves the record as it was before the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::MisroutedSnapshot`] if the snapshot matches no
    /// measure or calibration of this section, and a persistence error if
    /// the store fails.
    pub async fn apply(&mut self, snapshot: &Snapshot) -> Result<WriteOutcome, WriterError> {
        let url = identity_url(&snapshot.station);
        let (index, created) = match self.identity.resolve(&self.section.id, url) {
            Some(index) => (index, false),
            None => self.create_measure(snapshot, url)?,
        };
        let Some(measure) = self.record.measures.get_mut(index) else {
            return Err(WriterError::MisroutedSnapshot {
                section_id: self.section.id.clone(),
                alias_url: url.to_string(),
            });
        };

        let previous = (!created).then(|| measure.clone());
        let cutoff = self.clock.now() - self.config.retention;
        if measure.absorb(snapshot, cutoff) == MergeOutcome::Unchanged {
            tracing::debug!(
                section_id = %self.section.id,
                alias_url = url,
                "Snapshot changed nothing"
            );
            return Ok(WriteOutcome::Unchanged);
        }

        let span = tracing::info_span!(
            "snapshot.saved",
            section_id = %self.section.id,
            alias_url = url,
            correlation_id = %snapshot.correlation_id,
            causation_id = %snapshot.causation_id,
        );
        let stored = self.store.store(&self.record).instrument(span.clone()).await;
        match stored {
            Ok(()) => {
                self.consecutive_failures = 0;
                span.in_scope(|| {
                    tracing::info!(
                        event = "snapshot.saved",
                        section_id = %self.section.id,
                        alias_url = url,
                        readings = self.record.measures[index].readings.len(),
                        "Record stored"
                    );
                });
                Ok(WriteOutcome::Saved)
            }
            Err(source) => {
                if let Some(previous) = previous {
                    self.record.measures[index] = previous;
                } else {
                    self.record.measures.truncate(index);
                    self.identity.remove(&self.section.id, url);
                }
                self.consecutive_failures += 1;
                tracing::warn!(
                    event = "snapshot.store_failed",
                    section_id = %self.section.id,
                    error = %source,
                    consecutive = self.consecutive_failures,
                    "Record store failed"
                );

                if self.consecutive_failures >= self.config.max_consecutive_failures {
                    return Err(WriterError::PersistenceExhausted {
                        section_id: self.section.id.clone(),
                        attempts: self.consecutive_failures,
                        source,
                    });
                }
                Err(WriterError::Store {
                    section_id: self.section.id.clone(),
                    source,
                })
            }
        }
    }

    fn create_measure(
        &mut self,
        snapshot: &Snapshot,
        url: &str,
    ) -> Result<(usize, bool), WriterError> {
        let Some(calibration) = find_calibration(&self.section.calibrations, &snapshot.station)
        else {
            tracing::error!(
                event = "snapshot.misrouted",
                section_id = %self.section.id,
                alias_url = url,
                "Incorrectly routed snapshot"
            );
            return Err(WriterError::MisroutedSnapshot {
                section_id: self.section.id.clone(),
                alias_url: url.to_string(),
            });
        };

        let index = self.record.measures.len();
        if let Err(existing) = self.identity.insert_if_absent(&self.section.id, url, index) {
            return Ok((existing, false));
        }
        self.record.measures.push(Measure::new(
            snapshot.station.clone(),
            calibration.clone(),
        ));
        tracing::info!(
            section_id = %self.section.id,
            alias_url = url,
            calibration_url = %calibration.url,
            "Created measure"
        );
        Ok((index, true))
    }
}

/// Errors for record writers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WriterError {
    /// Snapshot reached a section it has no calibration for
    #[error("incorrectly routed snapshot: section {section_id} has no measure for {alias_url:?}")]
    MisroutedSnapshot {
        /// Section the snapshot was routed to
        section_id: String,
        /// Identity URL of the snapshot
        alias_url: String,
    },
    /// Record could not be stored; the snapshot can be retried
    #[error("storing section {section_id} failed: {source}")]
    Store {
        /// Section being stored
        section_id: String,
        /// Underlying store error
        source: PersistenceError,
    },
    /// Too many stores in a row failed
    #[error("storing section {section_id} failed {attempts} times in a row: {source}")]
    PersistenceExhausted {
        /// Section being stored
        section_id: String,
        /// Consecutive failures
        attempts: u32,
        /// Last store error
        source: PersistenceError,
    },
}

impl WriterError {
    /// Whether the writer must stop.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Store { .. })
    }
}

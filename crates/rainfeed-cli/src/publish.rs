//! Paced snapshot publishing.

use chrono::Utc;
use rainfeed_bus::{BusError, SnapshotTopic};
use rainfeed_core::Snapshot;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Publish pacing and failure tolerance.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Period the whole batch is spread across
    pub refresh_period: Duration,
    /// Upper bound on publishes per second; zero means one per millisecond
    pub max_per_second: u32,
    /// Consecutive publish failures before giving up
    pub max_consecutive_errors: u32,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            refresh_period: Duration::from_secs(15 * 60),
            max_per_second: 30,
            max_consecutive_errors: 3,
        }
    }
}

/// Counts from a publish run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Snapshots accepted by the bus
    pub published: usize,
    /// Publish attempts that failed
    pub failed: usize,
}

/// Gap between two publishes so `total` snapshots fill the refresh period
/// without exceeding the rate limit.
#[must_use]
pub fn duration_between_publish(config: &PublishConfig, total: usize) -> Duration {
    let total = u64::try_from(total.max(1)).unwrap_or(u64::MAX);
    let period_ms = u64::try_from(config.refresh_period.as_millis()).unwrap_or(u64::MAX);
    let min_ms = match config.max_per_second {
        0 => 1,
        max => (1000 / u64::from(max)).max(1),
    };
    Duration::from_millis((period_ms / total).max(min_ms))
}

/// Give a snapshot a correlation id if it has none and stamp it as
/// processed now.
#[must_use]
pub fn prepare(mut snapshot: Snapshot) -> Snapshot {
    if snapshot.correlation_id.is_empty() {
        snapshot.correlation_id = Uuid::new_v4().to_string();
    }
    snapshot.processed_time = Utc::now();
    snapshot
}

/// Publish `snapshots` evenly spaced, stopping early on cancellation.
///
/// # Errors
///
/// Returns the last publish error once `max_consecutive_errors` publishes
/// in a row have failed.
pub async fn publish_all(
    topic: &dyn SnapshotTopic,
    snapshots: Vec<Snapshot>,
    config: &PublishConfig,
    cancel: &CancellationToken,
) -> Result<PublishReport, BusError> {
    let every = duration_between_publish(config, snapshots.len());
    tracing::info!(
        topic = %topic.name(),
        total = snapshots.len(),
        every_ms = u64::try_from(every.as_millis()).unwrap_or(u64::MAX),
        "Publishing snapshots"
    );

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut report = PublishReport::default();
    let mut consecutive = 0;

    for snapshot in snapshots {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = prepare(snapshot);
        match topic.publish(&snapshot, cancel).await {
            Ok(()) => {
                consecutive = 0;
                report.published += 1;
                tracing::debug!(
                    data_url = %snapshot.station.data_url,
                    correlation_id = %snapshot.correlation_id,
                    "Published snapshot"
                );
            }
            Err(BusError::Cancelled) => break,
            Err(err) => {
                consecutive += 1;
                report.failed += 1;
                tracing::warn!(
                    error = %err,
                    data_url = %snapshot.station.data_url,
                    consecutive,
                    "Publish failed"
                );
                if consecutive >= config.max_consecutive_errors {
                    return Err(err);
                }
            }
        }
    }

    tracing::info!(
        published = report.published,
        failed = report.failed,
        "Publishing finished"
    );
    Ok(report)
}

//! Archive CSV import.
//!
//! Daily archives list one reading per row:
//!
//! ```text
//! dateTime,measure,value
//! 2016-01-30T00:00:00Z,http://environment.data.gov.uk/flood-monitoring/id/measures/0569TH-level-stage-i-15_min-mASD,3.430
//! ```
//!
//! Rows are grouped into one snapshot per measure URL. Some upstream values
//! arrive as `1.23|4.56`; those rows are skipped without counting as errors.
//! Once more than [`MAX_ROW_ERRORS`] rows have failed the import is
//! abandoned.

use chrono::{DateTime, Utc};
use rainfeed_core::{Reading, Snapshot, Station};
use std::collections::HashMap;
use std::io::BufRead;

/// Row errors tolerated before an import is abandoned.
pub const MAX_ROW_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImportState {
    Header,
    Rows,
    Done,
    Abandoned,
}

/// Result of a completed import.
#[derive(Debug, Default)]
pub struct ImportReport {
    /// One snapshot per measure URL, in order of first appearance
    pub snapshots: Vec<Snapshot>,
    /// Rows skipped as known-corrupt values
    pub skipped: usize,
    /// Rows that failed to parse
    pub errors: Vec<RowError>,
}

/// Row-by-row archive parser.
struct ArchiveImport {
    state: ImportState,
    report: ImportReport,
    by_url: HashMap<String, usize>,
}

impl ArchiveImport {
    fn new() -> Self {
        Self {
            state: ImportState::Header,
            report: ImportReport::default(),
            by_url: HashMap::new(),
        }
    }

    fn step(&mut self, line_no: usize, line: std::io::Result<String>) {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                self.fail(RowError::Read {
                    line: line_no,
                    message: err.to_string(),
                });
                return;
            }
        };
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            return;
        }

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() == 3 && fields[2].contains('|') {
            self.report.skipped += 1;
            return;
        }

        match self.state {
            ImportState::Header => self.state = ImportState::Rows,
            ImportState::Rows => {
                if self.report.errors.len() > MAX_ROW_ERRORS {
                    tracing::error!(
                        line = line_no,
                        errors = self.report.errors.len(),
                        "Too many row errors, abandoning archive import"
                    );
                    self.state = ImportState::Abandoned;
                    return;
                }
                match parse_row(line_no, &fields) {
                    Ok((url, reading)) => self.push(url, reading),
                    Err(err) => self.fail(err),
                }
            }
            ImportState::Done | ImportState::Abandoned => {}
        }
    }

    fn fail(&mut self, err: RowError) {
        tracing::warn!(error = %err, "Skipping archive row");
        self.report.errors.push(err);
    }

    fn push(&mut self, url: &str, reading: Reading) {
        let snapshots = &mut self.report.snapshots;
        let index = *self.by_url.entry(url.to_string()).or_insert_with(|| {
            snapshots.push(Snapshot::new(
                Station {
                    data_url: url.to_string(),
                    ..Station::default()
                },
                Vec::new(),
            ));
            snapshots.len() - 1
        });
        snapshots[index].readings.push(reading);
    }

    fn finish(mut self) -> Result<ImportReport, ImportError> {
        if self.state == ImportState::Abandoned {
            return Err(ImportError::Abandoned {
                errors: self.report.errors.len(),
            });
        }
        self.state = ImportState::Done;
        for snapshot in &mut self.report.snapshots {
            snapshot.readings.sort_by_key(|reading| reading.event_time);
        }
        Ok(self.report)
    }
}

/// Parse an archive CSV into per-measure snapshots.
///
/// # Errors
///
/// Returns [`ImportError::Abandoned`] once more than [`MAX_ROW_ERRORS`] rows
/// have failed.
pub fn import_archive(reader: impl BufRead) -> Result<ImportReport, ImportError> {
    let mut import = ArchiveImport::new();
    for (i, line) in reader.lines().enumerate() {
        import.step(i + 1, line);
        if import.state == ImportState::Abandoned {
            break;
        }
    }
    import.finish()
}

fn parse_row<'a>(line: usize, fields: &[&'a str]) -> Result<(&'a str, Reading), RowError> {
    let [time, url, value] = fields else {
        return Err(RowError::FieldCount {
            line,
            count: fields.len(),
        });
    };

    let event_time = DateTime::parse_from_rfc3339(time)
        .map_err(|_| RowError::Timestamp {
            line,
            value: (*time).to_string(),
        })?
        .with_timezone(&Utc);
    let value = value.trim().parse::<f32>().map_err(|_| RowError::Value {
        line,
        value: (*value).to_string(),
    })?;

    Ok((*url, Reading::new(event_time, value)))
}

/// A row that could not be imported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowError {
    /// Row does not have exactly three fields
    #[error("line {line}: expected 3 fields, found {count}")]
    FieldCount {
        /// Line number
        line: usize,
        /// Fields found
        count: usize,
    },
    /// Timestamp is not RFC 3339
    #[error("line {line}: {value:?} is not RFC3339")]
    Timestamp {
        /// Line number
        line: usize,
        /// Offending field
        value: String,
    },
    /// Value is not a number
    #[error("line {line}: {value:?} is not a float")]
    Value {
        /// Line number
        line: usize,
        /// Offending field
        value: String,
    },
    /// Line could not be read
    #[error("line {line}: {message}")]
    Read {
        /// Line number
        line: usize,
        /// I/O error
        message: String,
    },
}

/// Errors for archive import.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportError {
    /// Too many rows failed
    #[error("archive import abandoned after {errors} row errors")]
    Abandoned {
        /// Row errors seen
        errors: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "dateTime,measure,value\n";
    const LEVEL: &str =
        "http://environment.data.gov.uk/flood-monitoring/id/measures/0569TH-level-stage-i-15_min-mASD";
    const FLOW: &str =
        "http://environment.data.gov.uk/flood-monitoring/id/measures/0569TH-flow--i-15_min-m3_s";

    #[test]
    fn groups_rows_by_measure() {
        let csv = format!(
            "{HEADER}\
             2016-01-30T00:15:00Z,{LEVEL},3.431\n\
             2016-01-30T00:00:00Z,{LEVEL},3.430\n\
             2016-01-30T00:00:00Z,{FLOW},12.5\n"
        );

        let report = import_archive(csv.as_bytes()).unwrap();

        assert_eq!(report.snapshots.len(), 2);
        let level = &report.snapshots[0];
        assert_eq!(level.station.data_url, LEVEL);
        assert_eq!(level.readings.len(), 2);
        assert!(level.readings[0].event_time < level.readings[1].event_time);
        assert!((level.readings[0].value - 3.430).abs() < f32::EPSILON);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn pipe_values_are_skipped_not_errors() {
        let csv = format!(
            "{HEADER}\
             2016-01-30T00:00:00Z,{LEVEL},1.23|4.56\n\
             2016-01-30T00:15:00Z,{LEVEL},3.431\n"
        );

        let report = import_archive(csv.as_bytes()).unwrap();

        assert_eq!(report.skipped, 1);
        assert!(report.errors.is_empty());
        assert_eq!(report.snapshots[0].readings.len(), 1);
    }

    #[test]
    fn bad_rows_are_reported_and_skipped() {
        let csv = format!(
            "{HEADER}\
             yesterday,{LEVEL},3.4\n\
             2016-01-30T00:00:00Z,{LEVEL},high\n\
             2016-01-30T00:00:00Z,{LEVEL}\n\
             2016-01-30T00:15:00Z,{LEVEL},3.431\n"
        );

        let report = import_archive(csv.as_bytes()).unwrap();

        assert_eq!(report.errors.len(), 3);
        assert!(matches!(report.errors[0], RowError::Timestamp { line: 2, .. }));
        assert!(matches!(report.errors[1], RowError::Value { line: 3, .. }));
        assert!(matches!(
            report.errors[2],
            RowError::FieldCount { line: 4, count: 2 }
        ));
        assert_eq!(report.snapshots[0].readings.len(), 1);
    }

    #[test]
    fn abandons_after_too_many_errors() {
        let mut csv = HEADER.to_string();
        for _ in 0..=MAX_ROW_ERRORS {
            csv.push_str("garbage\n");
        }
        csv.push_str(&format!("2016-01-30T00:15:00Z,{LEVEL},3.431\n"));

        assert_eq!(
            import_archive(csv.as_bytes()).unwrap_err(),
            ImportError::Abandoned {
                errors: MAX_ROW_ERRORS + 1
            }
        );
    }

    #[test]
    fn ten_errors_are_tolerated() {
        let mut csv = HEADER.to_string();
        for _ in 0..MAX_ROW_ERRORS {
            csv.push_str("garbage\n");
        }
        csv.push_str(&format!("2016-01-30T00:15:00Z,{LEVEL},3.431\n"));

        let report = import_archive(csv.as_bytes()).unwrap();
        assert_eq!(report.errors.len(), MAX_ROW_ERRORS);
        assert_eq!(report.snapshots.len(), 1);
    }
}

//! Resolving a station to one of a section's calibrations.

use crate::model::{Calibration, Station};

/// Find the calibration whose reference URL matches one of the station's
/// identity URLs.
///
/// For each calibration the data, alias and human URLs are checked in that
/// order, and the last hit across all calibrations wins. Calibrations with
/// an empty reference URL never match.
#[must_use]
pub fn find_calibration<'a>(
    calibrations: &'a [Calibration],
    station: &Station,
) -> Option<&'a Calibration> {
    let mut found = None;
    for calibration in calibrations {
        if calibration.url.is_empty() {
            continue;
        }
        for url in station.urls() {
            if calibration.url == url {
                found = Some(calibration);
            }
        }
    }
    found
}

//! Resolution of incoming stations to existing measures.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rainfeed_core::{Record, Station};

/// The URL a measure is filed under within its section.
///
/// The alias URL when set, otherwise the first non-empty of the data and
/// human URLs.
#[must_use]
pub fn identity_url(station: &Station) -> &str {
    [&station.alias_url, &station.data_url, &station.human_url]
        .into_iter()
        .find(|url| !url.is_empty())
        .map_or("", String::as_str)
}

/// Shared index from `(section id, identity URL)` to the measure's position
/// in the section record.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    entries: DashMap<(String, String), usize>,
}

impl IdentityIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every measure of a loaded record.
    pub fn seed(&self, record: &Record) {
        for (index, measure) in record.measures.iter().enumerate() {
            let url = identity_url(&measure.station);
            if url.is_empty() {
                tracing::warn!(
                    section_id = %record.section_id,
                    index,
                    "Stored measure has no identity URL"
                );
                continue;
            }
            if let Err(existing) = self.insert_if_absent(&record.section_id, url, index) {
                tracing::warn!(
                    section_id = %record.section_id,
                    alias_url = url,
                    index,
                    existing,
                    "Duplicate measure in stored record"
                );
            }
        }
    }

    /// Measure position for an identity URL.
    #[must_use]
    pub fn resolve(&self, section_id: &str, url: &str) -> Option<usize> {
        self.entries
            .get(&(section_id.to_string(), url.to_string()))
            .map(|entry| *entry)
    }

    /// Register a new measure unless the URL is already taken.
    ///
    /// # Errors
    ///
    /// Returns the existing position if another measure holds the URL.
    pub fn insert_if_absent(&self, section_id: &str, url: &str, index: usize) -> Result<(), usize> {
        match self.entries.entry((section_id.to_string(), url.to_string())) {
            Entry::Occupied(entry) => Err(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(index);
                Ok(())
            }
        }
    }

    /// Forget a registration.
    pub fn remove(&self, section_id: &str, url: &str) {
        self.entries
            .remove(&(section_id.to_string(), url.to_string()));
    }

    /// Number of registered measures across all sections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no measure is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Section catalogue loading.
//!
//! The catalogue is a JSON array of sections, each with the calibrations of
//! the feeds that belong to it:
//!
//! ```json
//! [{ "id": "dart-upper", "name": "Upper Dart",
//!    "calibrations": [{ "url": "rloi://5012", "low": 0.4, "high": 1.1 }] }]
//! ```

use rainfeed_core::Section;
use std::collections::HashSet;
use std::path::Path;

/// Read and validate a catalogue file.
///
/// # Errors
///
/// Returns error if the file cannot be read or is not a valid catalogue.
pub fn load_catalogue(path: &Path) -> Result<Vec<Section>, CatalogueError> {
    let json = std::fs::read_to_string(path).map_err(|e| CatalogueError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    parse_catalogue(&json)
}

/// Parse and validate catalogue JSON.
///
/// # Errors
///
/// Returns error on malformed JSON, a section without id, or a duplicate
/// section id.
pub fn parse_catalogue(json: &str) -> Result<Vec<Section>, CatalogueError> {
    let sections: Vec<Section> =
        serde_json::from_str(json).map_err(|e| CatalogueError::Parse(e.to_string()))?;

    let mut seen = HashSet::new();
    for section in &sections {
        if section.id.is_empty() {
            return Err(CatalogueError::MissingId(section.name.clone()));
        }
        if !seen.insert(section.id.as_str()) {
            return Err(CatalogueError::DuplicateSection(section.id.clone()));
        }
        if section.calibrations.iter().all(|c| c.url.is_empty()) {
            tracing::warn!(section_id = %section.id, "Section has no calibrated feeds");
        }
    }

    Ok(sections)
}

/// Errors for catalogue loading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogueError {
    /// File could not be read
    #[error("cannot read catalogue {path}: {message}")]
    Io {
        /// Catalogue path
        path: String,
        /// I/O error
        message: String,
    },
    /// Content is not a catalogue
    #[error("invalid catalogue: {0}")]
    Parse(String),
    /// A section has no id
    #[error("section {0:?} has no id")]
    MissingId(String),
    /// Two sections share an id
    #[error("duplicate section id {0:?}")]
    DuplicateSection(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_sections_and_calibrations() {
        let sections = parse_catalogue(
            r#"[
                {"id": "dart-upper", "name": "Upper Dart",
                 "calibrations": [{"url": "rloi://5012", "low": 0.4, "high": 1.1}]},
                {"id": "tryweryn", "name": "Tryweryn", "calibrations": []}
            ]"#,
        )
        .unwrap();

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].calibrations[0].low, Some(0.4));
        assert_eq!(sections[0].calibrations[0].medium, None);
    }

    #[test]
    fn rejects_bad_catalogues() {
        assert!(matches!(
            parse_catalogue("{"),
            Err(CatalogueError::Parse(_))
        ));
        assert_eq!(
            parse_catalogue(r#"[{"id": "a"}, {"id": "a"}]"#),
            Err(CatalogueError::DuplicateSection("a".to_string()))
        );
        assert_eq!(
            parse_catalogue(r#"[{"name": "nameless"}]"#),
            Err(CatalogueError::MissingId("nameless".to_string()))
        );
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"id": "s1", "name": "One"}}]"#).unwrap();

        let sections = load_catalogue(file.path()).unwrap();
        assert_eq!(sections[0].id, "s1");

        assert!(matches!(
            load_catalogue(Path::new("/nonexistent/catalogue.json")),
            Err(CatalogueError::Io { .. })
        ));
    }
}

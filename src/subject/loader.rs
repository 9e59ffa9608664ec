use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::path::Path;

use super::Subject;
use crate::config::SubjectsConfig;
use crate::error::HarvestError;

/// Read subjects from a CSV file with a header row.
///
/// An unreadable file or missing column aborts the load. Bad rows are
/// logged and skipped, as are rows that resolve to a directory an earlier
/// row already claimed.
pub fn load_subjects(path: &Path, columns: &SubjectsConfig) -> Result<Vec<Subject>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Fields)
        .from_path(path)
        .with_context(|| format!("Failed to open subject list {}", path.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?
        .clone();

    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow!("Subject list {} has no {:?} column", path.display(), name))
    };
    let family_idx = column(&columns.family_column)?;
    let species_idx = column(&columns.species_column)?;

    let mut subjects = Vec::new();
    let mut seen = HashSet::new();

    for (index, record) in reader.records().enumerate() {
        // Header is line 1.
        let line = index + 2;

        let parsed = record
            .map_err(|e| HarvestError::Configuration(e.to_string()))
            .and_then(|record| {
                match (record.get(family_idx), record.get(species_idx)) {
                    (Some(family), Some(species)) => Subject::new(family, species),
                    _ => Err(HarvestError::Configuration(format!(
                        "expected at least {} fields, found {}",
                        family_idx.max(species_idx) + 1,
                        record.len()
                    ))),
                }
            });

        match parsed {
            Ok(subject) => {
                if seen.insert(subject.slug().to_string()) {
                    subjects.push(subject);
                } else {
                    tracing::warn!(line, subject = %subject, "Skipping repeated subject");
                }
            }
            Err(e) => {
                tracing::error!(line, error = %e, "Skipping malformed subject row");
            }
        }
    }

    tracing::info!(count = subjects.len(), path = %path.display(), "Loaded subjects");
    Ok(subjects)
}

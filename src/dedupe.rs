//! Pairwise duplicate removal inside one directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::discovery::discover_images;
use crate::error::HarvestError;
use crate::similarity::SimilarityEngine;

/// What a dedupe pass did to a folder.
#[derive(Debug, Clone, Default)]
pub struct DedupReport {
    pub scanned: usize,
    pub removed: Vec<PathBuf>,
    /// Survivors renamed to carry the marker suffix during this pass.
    pub marked: usize,
    pub errors: Vec<String>,
}

impl DedupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct FolderDeduplicator {
    engine: SimilarityEngine,
    extensions: Vec<String>,
    marker_suffix: String,
}

impl FolderDeduplicator {
    pub fn new(engine: SimilarityEngine, extensions: Vec<String>, marker_suffix: impl Into<String>) -> Self {
        Self {
            engine,
            extensions,
            marker_suffix: marker_suffix.into(),
        }
    }

    /// Remove every image that duplicates an earlier one (in path order),
    /// then mark the survivors.
    pub fn deduplicate(&self, folder: &Path) -> DedupReport {
        // Fixed for the whole pass; deletions only flip `removed`.
        let snapshot = discover_images(folder, &self.extensions);
        let mut removed = vec![false; snapshot.len()];
        let mut report = DedupReport {
            scanned: snapshot.len(),
            ..DedupReport::default()
        };

        for i in 0..snapshot.len() {
            if removed[i] || !snapshot[i].exists() {
                continue;
            }

            let kept = match self.engine.load_normalized(&snapshot[i]) {
                Ok(img) => img,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping comparisons for undecodable image");
                    report.errors.push(e.to_string());
                    continue;
                }
            };

            for j in (i + 1)..snapshot.len() {
                if removed[j] || !snapshot[j].exists() {
                    continue;
                }

                let other = match self.engine.load_normalized(&snapshot[j]) {
                    Ok(img) => img,
                    Err(e) => {
                        tracing::debug!(error = %e, "Skipping comparison with undecodable image");
                        continue;
                    }
                };

                let verdict = self.engine.compare_normalized(&kept, &other);
                if !verdict.is_duplicate {
                    continue;
                }

                match fs::remove_file(&snapshot[j]) {
                    Ok(()) => {
                        tracing::info!(
                            kept = %snapshot[i].display(),
                            removed = %snapshot[j].display(),
                            score = verdict.score,
                            "Duplicate removed"
                        );
                        removed[j] = true;
                        report.removed.push(snapshot[j].clone());
                    }
                    Err(e) => {
                        let e = HarvestError::filesystem(&snapshot[j], e);
                        tracing::error!(error = %e, "Failed to remove duplicate");
                        report.errors.push(e.to_string());
                    }
                }
            }
        }

        for (path, _) in snapshot.iter().zip(&removed).filter(|(_, gone)| !**gone) {
            if !path.exists() {
                continue;
            }
            match mark_deduplicated(path, &self.marker_suffix) {
                Ok(Some(_)) => report.marked += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to mark image as deduplicated");
                    report.errors.push(e.to_string());
                }
            }
        }

        tracing::info!(
            folder = %folder.display(),
            scanned = report.scanned,
            removed = report.removed.len(),
            "Completed checking folder"
        );
        report
    }
}

/// `name.jpg` -> `name<suffix>.jpg`. Returns the new path, or `None` when the
/// file already carries the suffix.
pub fn mark_deduplicated(path: &Path, suffix: &str) -> Result<Option<PathBuf>, HarvestError> {
    let Some(target) = marked_path(path, suffix) else {
        return Ok(None);
    };

    if target.exists() {
        return Err(HarvestError::filesystem(
            &target,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "marked name already taken"),
        ));
    }

    fs::rename(path, &target).map_err(|e| HarvestError::filesystem(path, e))?;
    Ok(Some(target))
}

fn marked_path(path: &Path, suffix: &str) -> Option<PathBuf> {
    let stem = path.file_stem()?.to_string_lossy();
    if stem.ends_with(suffix) {
        return None;
    }

    let name = match path.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    };
    Some(path.with_file_name(name))
}

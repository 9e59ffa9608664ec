//! Per-subject image acquisition with incremental duplicate filtering.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::discovery::discover_images;
use crate::error::HarvestError;
use crate::similarity::{Normalized, SimilarityEngine};
use crate::source::{ImageSource, SearchRequest};
use crate::subject::{Layout, Subject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Pending,
    Accepted,
    /// Terminal: the file has been deleted.
    Rejected,
}

/// A file in a subject directory and what has been decided about it.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub state: ImageState,
}

/// Images confirmed distinct for one subject during one run. Only paths are
/// held; pixels are decoded again for each comparison.
#[derive(Debug, Default)]
pub struct AcceptedSet {
    members: Vec<ImageRecord>,
}

impl AcceptedSet {
    /// Trust what is already on disk as mutually distinct.
    pub fn seed(paths: Vec<PathBuf>) -> Self {
        Self {
            members: paths
                .into_iter()
                .map(|path| ImageRecord {
                    path,
                    state: ImageState::Accepted,
                })
                .collect(),
        }
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.members.iter().any(|m| m.path == path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.members.iter().map(|m| m.path.as_path())
    }

    fn accept(&mut self, mut record: ImageRecord) {
        record.state = ImageState::Accepted;
        self.members.push(record);
    }
}

/// Why a candidate was kept or dropped.
#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Accept,
    /// Could not be decoded; kept rather than blocking acceptance.
    AcceptUndecodable(String),
    Duplicate { of: PathBuf, score: f64 },
    OverCapacity,
    AlreadyAccepted,
    Missing,
}

#[derive(Debug, Clone, Default)]
pub struct AcquireReport {
    /// Eligible files present before the source was called.
    pub present_before: usize,
    pub accepted: Vec<PathBuf>,
    pub rejected: Vec<PathBuf>,
    /// Per-image problems that did not stop the job.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// The directory was already full; the source was not called.
    Skipped { present: usize },
    Completed(AcquireReport),
}

pub struct Acquirer {
    engine: SimilarityEngine,
    source: Arc<dyn ImageSource>,
    layout: Layout,
    extensions: Vec<String>,
    max_images: usize,
    request_limit: usize,
    format: String,
    size_class: String,
}

impl Acquirer {
    pub fn new(config: &Config, source: Arc<dyn ImageSource>) -> Self {
        Self {
            engine: SimilarityEngine::from_config(&config.dedup),
            source,
            layout: Layout::new(&config.downloads.root),
            extensions: config.downloads.image_extensions.clone(),
            max_images: config.downloads.max_images_per_folder,
            request_limit: config.source.request_limit,
            format: config.source.format.clone(),
            size_class: config.source.size_class.clone(),
        }
    }

    pub fn acquire(&self, subject: &Subject) -> Result<AcquireOutcome, HarvestError> {
        let dir = self.layout.dir_for(subject);
        let present = discover_images(&dir, &self.extensions);

        if present.len() >= self.max_images {
            tracing::info!(
                subject = %subject,
                present = present.len(),
                "Skipping, enough images already present"
            );
            return Ok(AcquireOutcome::Skipped {
                present: present.len(),
            });
        }

        let mut report = AcquireReport {
            present_before: present.len(),
            ..AcquireReport::default()
        };
        let mut accepted = AcceptedSet::seed(present);

        let request = SearchRequest {
            query: subject.query().to_string(),
            limit: self.request_limit,
            format: self.format.clone(),
            size_class: self.size_class.clone(),
            output_dir: dir,
        };
        let candidates = self.source.search(&request)?;
        if candidates.is_empty() {
            return Err(HarvestError::adapter(
                subject.query(),
                format!("{} returned no images", self.source.source_name()),
            ));
        }

        for candidate in candidates {
            let record = ImageRecord {
                path: candidate.local_path,
                state: ImageState::Pending,
            };

            match self.judge(&record.path, &accepted) {
                Decision::Accept => {
                    report.accepted.push(record.path.clone());
                    accepted.accept(record);
                }
                Decision::AcceptUndecodable(error) => {
                    tracing::warn!(subject = %subject, error = %error, "Keeping undecodable candidate");
                    report.errors.push(error);
                    report.accepted.push(record.path.clone());
                    accepted.accept(record);
                }
                Decision::Duplicate { of, score } => {
                    tracing::info!(
                        subject = %subject,
                        url = %candidate.source_url,
                        duplicate_of = %of.display(),
                        score,
                        "Duplicate image removed"
                    );
                    self.reject(record, &mut report);
                }
                Decision::OverCapacity => {
                    tracing::debug!(subject = %subject, path = %record.path.display(), "Folder full, dropping candidate");
                    self.reject(record, &mut report);
                }
                Decision::AlreadyAccepted => {}
                Decision::Missing => {
                    let message = format!("candidate {} is not on disk", record.path.display());
                    tracing::warn!(subject = %subject, url = %candidate.source_url, "{}", message);
                    report.errors.push(message);
                }
            }
        }

        tracing::info!(
            subject = %subject,
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            total = accepted.len(),
            "Acquisition finished"
        );
        Ok(AcquireOutcome::Completed(report))
    }

    fn judge(&self, candidate: &Path, accepted: &AcceptedSet) -> Decision {
        if !candidate.exists() {
            return Decision::Missing;
        }
        if accepted.contains(candidate) {
            return Decision::AlreadyAccepted;
        }
        if accepted.len() >= self.max_images {
            return Decision::OverCapacity;
        }

        let normalized: Normalized = match self.engine.load_normalized(candidate) {
            Ok(img) => img,
            Err(e) => return Decision::AcceptUndecodable(e.to_string()),
        };

        for member in accepted.paths() {
            let existing = match self.engine.load_normalized(member) {
                Ok(img) => img,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping comparison with undecodable image");
                    continue;
                }
            };

            let verdict = self.engine.compare_normalized(&existing, &normalized);
            if verdict.is_duplicate {
                return Decision::Duplicate {
                    of: member.to_path_buf(),
                    score: verdict.score,
                };
            }
        }

        Decision::Accept
    }

    fn reject(&self, mut record: ImageRecord, report: &mut AcquireReport) {
        match fs::remove_file(&record.path) {
            Ok(()) => {
                record.state = ImageState::Rejected;
                tracing::debug!(path = %record.path.display(), state = ?record.state, "Candidate deleted");
                report.rejected.push(record.path);
            }
            Err(e) => {
                let e = HarvestError::filesystem(&record.path, e);
                tracing::error!(error = %e, "Failed to remove rejected image");
                report.errors.push(e.to_string());
            }
        }
    }
}

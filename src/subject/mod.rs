//! Download targets and where their images live.

pub mod loader;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::HarvestError;

pub use loader::load_subjects;

/// Characters allowed to survive sanitization besides ASCII letters and digits.
const EXTRA_VALID_CHARS: &str = "-_.() ";

/// One taxon to collect images for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    family: String,
    species: String,
    query: String,
    slug: String,
}

impl Subject {
    /// Build a subject from raw row text. Fails when either name has
    /// nothing usable left after sanitization.
    pub fn new(family: &str, species: &str) -> Result<Self, HarvestError> {
        let family = sanitize_name(family);
        let species = sanitize_name(species);

        if family.is_empty() || species.is_empty() {
            return Err(HarvestError::Configuration(format!(
                "subject needs both a family and a species name, got {:?} / {:?}",
                family, species
            )));
        }

        let query = format!("{} {}", family, species);
        let slug = format!("{}_{}", family, species).replace(' ', "_");

        Ok(Self {
            family,
            species,
            query,
            slug,
        })
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn species(&self) -> &str {
        &self.species
    }

    /// Human search text, `"<family> <species>"`.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Directory name, `"<family>_<species>"` without spaces.
    pub fn slug(&self) -> &str {
        &self.slug
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query)
    }
}

/// Keep only characters that are safe in a directory name, then trim.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || EXTRA_VALID_CHARS.contains(*c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Maps subjects onto the downloads tree.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, subject: &Subject) -> PathBuf {
        self.root.join(subject.slug())
    }
}

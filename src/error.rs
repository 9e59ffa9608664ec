//! Error taxonomy shared by the pipeline stages.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    /// The image source was unreachable or returned nothing usable.
    #[error("image source failed for {query:?}: {message}")]
    Adapter { query: String, message: String },

    /// An image could not be opened or decoded.
    #[error("failed to decode {}: {message}", path.display())]
    Decode { path: PathBuf, message: String },

    /// A delete, rename or directory operation failed.
    #[error("filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration value or malformed input row.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl HarvestError {
    pub fn adapter(query: impl Into<String>, message: impl Into<String>) -> Self {
        HarvestError::Adapter {
            query: query.into(),
            message: message.into(),
        }
    }

    pub fn decode(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        HarvestError::Decode {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HarvestError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Short label used in cycle summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            HarvestError::Adapter { .. } => "adapter",
            HarvestError::Decode { .. } => "decode",
            HarvestError::Filesystem { .. } => "filesystem",
            HarvestError::Configuration(_) => "configuration",
        }
    }
}

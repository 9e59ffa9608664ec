//! External image search sources.

pub mod google;

use std::path::PathBuf;

use crate::config::SourceConfig;
use crate::error::HarvestError;

pub use google::GoogleImageSource;

/// One search for one subject.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    /// File type to ask for, e.g. `jpg`.
    pub format: String,
    /// Size bucket understood by the source, e.g. `large`.
    pub size_class: String,
    /// Directory the source writes downloaded files into.
    pub output_dir: PathBuf,
}

/// An image the source has already written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub source_url: String,
    pub local_path: PathBuf,
}

/// Anything that turns a query into downloaded files.
pub trait ImageSource: Send + Sync {
    /// Search and download. Results keep the source's ranking order.
    fn search(&self, request: &SearchRequest) -> Result<Vec<SourceImage>, HarvestError>;

    /// Provider name for logs
    fn source_name(&self) -> &'static str;
}

pub fn create_source(config: &SourceConfig) -> Box<dyn ImageSource> {
    Box::new(GoogleImageSource::from_config(config))
}

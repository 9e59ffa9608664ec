use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HarvestError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub downloads: DownloadsConfig,

    #[serde(default)]
    pub subjects: SubjectsConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadsConfig {
    /// Parent directory holding one sub-directory per subject.
    #[serde(default = "default_downloads_root")]
    pub root: PathBuf,

    #[serde(default = "default_max_images_per_folder")]
    pub max_images_per_folder: usize,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_downloads_root() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_max_images_per_folder() -> usize {
    50
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "gif".to_string(),
        "bmp".to_string(),
        "webp".to_string(),
    ]
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            root: default_downloads_root(),
            max_images_per_folder: default_max_images_per_folder(),
            image_extensions: default_image_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectsConfig {
    #[serde(default = "default_family_column")]
    pub family_column: String,

    #[serde(default = "default_species_column")]
    pub species_column: String,
}

fn default_family_column() -> String {
    "Family".to_string()
}

fn default_species_column() -> String {
    "Species".to_string()
}

impl Default for SubjectsConfig {
    fn default() -> Self {
        Self {
            family_column: default_family_column(),
            species_column: default_species_column(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Correlation score above which two images count as the same picture.
    /// Lower values remove more, at the risk of dropping distinct images.
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f64,

    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,

    /// Longest side, in pixels, images are reduced to before correlating.
    #[serde(default = "default_working_size")]
    pub working_size: u32,

    /// Inserted before the extension of files that survived a dedupe pass.
    #[serde(default = "default_marker_suffix")]
    pub marker_suffix: String,
}

fn default_duplicate_threshold() -> f64 {
    0.6
}

fn default_blur_sigma() -> f32 {
    1.0
}

fn default_working_size() -> u32 {
    128
}

fn default_marker_suffix() -> String {
    "__DD".to_string()
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: default_duplicate_threshold(),
            blur_sigma: default_blur_sigma(),
            working_size: default_working_size(),
            marker_suffix: default_marker_suffix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of source-bound job starts per rate window.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,

    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,

    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Restart the whole pass after a cooldown instead of exiting.
    #[serde(default)]
    pub perpetual: bool,

    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

fn default_rate_limit() -> usize {
    3
}

fn default_rate_window_ms() -> u64 {
    1000
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_cooldown_seconds() -> u64 {
    3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            rate_window_ms: default_rate_window_ms(),
            worker_pool_size: default_worker_pool_size(),
            perpetual: false,
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

impl SchedulerConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Programmable search engine id (`cx`).
    #[serde(default)]
    pub engine_id: Option<String>,

    #[serde(default = "default_request_limit")]
    pub request_limit: usize,

    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default = "default_size_class")]
    pub size_class: String,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Downloads larger than this are abandoned.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_source_endpoint() -> String {
    "https://www.googleapis.com/customsearch/v1".to_string()
}

fn default_request_limit() -> usize {
    50
}

fn default_format() -> String {
    "jpg".to_string()
}

fn default_size_class() -> String {
    "large".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_bytes() -> u64 {
    20 * 1024 * 1024 // 20MB
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_source_endpoint(),
            api_key: None,
            engine_id: None,
            request_limit: default_request_limit(),
            format: default_format(),
            size_class: default_size_class(),
            timeout_seconds: default_timeout_seconds(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            downloads: DownloadsConfig::default(),
            subjects: SubjectsConfig::default(),
            dedup: DedupConfig::default(),
            scheduler: SchedulerConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

impl Config {
    /// Load from the default location, writing a default file if none exists.
    pub fn load() -> Result<Self> {
        Self::load_or_create(&Self::config_path())
    }

    /// Load `path`, or write the defaults there when it does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            let config = Config::default();
            config
                .save_to(path)
                .with_context(|| format!("Failed to write default config {}", path.display()))?;
            tracing::info!(path = %path.display(), "Wrote default config");
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), HarvestError> {
        let threshold = self.dedup.duplicate_threshold;
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(HarvestError::Configuration(format!(
                "dedup.duplicate_threshold must be within [-1, 1], got {}",
                threshold
            )));
        }
        if self.dedup.blur_sigma < 0.0 || !self.dedup.blur_sigma.is_finite() {
            return Err(HarvestError::Configuration(
                "dedup.blur_sigma must be a non-negative number".to_string(),
            ));
        }
        if self.dedup.working_size == 0 {
            return Err(HarvestError::Configuration(
                "dedup.working_size must be positive".to_string(),
            ));
        }
        if self.dedup.marker_suffix.is_empty() {
            return Err(HarvestError::Configuration(
                "dedup.marker_suffix must not be empty".to_string(),
            ));
        }
        if self.downloads.max_images_per_folder == 0 {
            return Err(HarvestError::Configuration(
                "downloads.max_images_per_folder must be positive".to_string(),
            ));
        }
        if self.scheduler.rate_limit == 0 || self.scheduler.rate_window_ms == 0 {
            return Err(HarvestError::Configuration(
                "scheduler.rate_limit and scheduler.rate_window_ms must be positive".to_string(),
            ));
        }
        if self.scheduler.worker_pool_size == 0 {
            return Err(HarvestError::Configuration(
                "scheduler.worker_pool_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// `$HARVEST_CONFIG`, else `<config dir>/taxon-harvest/config.toml`.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("HARVEST_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("taxon-harvest")
    }
}

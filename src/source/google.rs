use serde::Deserialize;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{ImageSource, SearchRequest, SourceImage};
use crate::config::SourceConfig;
use crate::error::HarvestError;
use crate::subject::sanitize_name;

/// The Custom Search API never returns more than this many results per page.
const PAGE_SIZE: usize = 10;
/// ...nor results past this rank.
const MAX_RESULTS: usize = 100;

/// Image search through the Google Custom Search JSON API.
pub struct GoogleImageSource {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<String>,
    engine_id: Option<String>,
    max_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    link: String,
}

impl GoogleImageSource {
    pub fn from_config(config: &SourceConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("taxon-harvest/", env!("CARGO_PKG_VERSION")))
            .build();

        Self {
            agent,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            engine_id: config.engine_id.clone(),
            max_bytes: config.max_bytes,
        }
    }

    fn credentials(&self, query: &str) -> Result<(&str, &str), HarvestError> {
        match (self.api_key.as_deref(), self.engine_id.as_deref()) {
            (Some(key), Some(cx)) if !key.is_empty() && !cx.is_empty() => Ok((key, cx)),
            _ => Err(HarvestError::adapter(
                query,
                "source.api_key and source.engine_id must be configured",
            )),
        }
    }

    /// Collect up to `limit` result links, page by page.
    fn search_links(&self, request: &SearchRequest) -> Result<Vec<String>, HarvestError> {
        let (key, cx) = self.credentials(&request.query)?;
        let wanted = request.limit.min(MAX_RESULTS);
        let mut links = Vec::new();

        while links.len() < wanted {
            let start = links.len() + 1;
            let num = (wanted - links.len()).min(PAGE_SIZE);

            let response: SearchResponse = self
                .agent
                .get(&self.endpoint)
                .query("key", key)
                .query("cx", cx)
                .query("q", &request.query)
                .query("searchType", "image")
                .query("num", &num.to_string())
                .query("start", &start.to_string())
                .query("imgSize", &request.size_class)
                .query("fileType", &request.format)
                .call()
                .map_err(|e| HarvestError::adapter(&request.query, e.to_string()))?
                .into_json()
                .map_err(|e| HarvestError::adapter(&request.query, format!("bad response: {}", e)))?;

            if response.items.is_empty() {
                break;
            }
            links.extend(response.items.into_iter().map(|item| item.link));
        }

        links.truncate(wanted);
        Ok(links)
    }

    fn download(&self, url: &str, target: &Path) -> anyhow::Result<()> {
        let response = self.agent.get(url).call()?;

        let content_type = response.content_type().to_string();
        if !content_type.is_empty() && !content_type.starts_with("image/") {
            anyhow::bail!("not an image ({})", content_type);
        }

        let mut body = Vec::new();
        response
            .into_reader()
            .take(self.max_bytes + 1)
            .read_to_end(&mut body)?;

        if body.is_empty() {
            anyhow::bail!("empty body");
        }
        if body.len() as u64 > self.max_bytes {
            anyhow::bail!("larger than {} bytes", self.max_bytes);
        }

        fs::write(target, &body)?;
        Ok(())
    }
}

impl ImageSource for GoogleImageSource {
    fn search(&self, request: &SearchRequest) -> Result<Vec<SourceImage>, HarvestError> {
        let links = self.search_links(request)?;
        if links.is_empty() {
            return Err(HarvestError::adapter(&request.query, "no results"));
        }

        fs::create_dir_all(&request.output_dir)
            .map_err(|e| HarvestError::filesystem(&request.output_dir, e))?;

        let mut images = Vec::new();
        for (index, link) in links.into_iter().enumerate() {
            let target = unique_path(&request.output_dir.join(file_name_for(
                index + 1,
                &link,
                &request.format,
            )));

            match self.download(&link, &target) {
                Ok(()) => {
                    tracing::debug!(url = %link, path = %target.display(), "Downloaded image");
                    images.push(SourceImage {
                        source_url: link,
                        local_path: target,
                    });
                }
                Err(e) => {
                    tracing::warn!(url = %link, error = %e, "Download failed");
                }
            }
        }

        if images.is_empty() {
            return Err(HarvestError::adapter(&request.query, "no image could be downloaded"));
        }
        Ok(images)
    }

    fn source_name(&self) -> &'static str {
        "Google Custom Search"
    }
}

/// `NNN_<last url segment>.<format>`, safe for any filesystem.
fn file_name_for(index: usize, url: &str, format: &str) -> String {
    let segment = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let stem = segment.rsplit_once('.').map(|(s, _)| s).unwrap_or(segment);

    let mut stem = sanitize_name(stem).replace(' ', "_");
    stem.truncate(40);
    if stem.is_empty() {
        stem = "image".to_string();
    }

    format!("{:03}_{}.{}", index, stem, format)
}

/// Never overwrite an image kept by an earlier run.
fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (1..)
        .map(|n| path.with_file_name(format!("{}-{}{}", stem, n, ext)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

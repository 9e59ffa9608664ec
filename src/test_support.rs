//! Synthetic images for tests.

use image::{imageops, ImageBuffer, Rgb, RgbImage};
use std::f64::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::error::HarvestError;
use crate::source::{ImageSource, SearchRequest, SourceImage};

/// Smooth separable wave pattern. Patterns with different `(fx, fy)` pairs
/// are close to uncorrelated; the same pair at another size is the same
/// picture.
pub fn wave(fx: u32, fy: u32, width: u32, height: u32) -> RgbImage {
    ImageBuffer::from_fn(width, height, |x, y| {
        let u = x as f64 / width as f64;
        let v = y as f64 / height as f64;
        let value = (2.0 * PI * fx as f64 * u).sin() * (2.0 * PI * fy as f64 * v).sin();
        let level = (128.0 + 110.0 * value).round().clamp(0.0, 255.0) as u8;
        Rgb([level, level.saturating_sub(20), 255 - level])
    })
}

/// Deterministic white noise.
pub fn noise(seed: u64, width: u32, height: u32) -> RgbImage {
    ImageBuffer::from_fn(width, height, |x, y| {
        let mut h = seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add((y as u64) << 32 | x as u64);
        h ^= h >> 33;
        h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
        h ^= h >> 33;
        h = h.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
        h ^= h >> 33;
        let level = (h & 0xFF) as u8;
        Rgb([level, level, level])
    })
}

pub fn flat(level: u8, width: u32, height: u32) -> RgbImage {
    ImageBuffer::from_pixel(width, height, Rgb([level, level, level]))
}

pub fn resized(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    imageops::resize(img, width, height, imageops::FilterType::Triangle)
}

pub fn write(path: &Path, img: &RgbImage) {
    img.save(path).unwrap();
}

/// In-process source that writes the same pictures for every subject.
pub struct ScriptedSource {
    images: Vec<RgbImage>,
    fail_queries: Vec<String>,
    calls: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
    on_search: Option<Box<dyn Fn(usize) + Send + Sync>>,
}

impl ScriptedSource {
    pub fn new(images: Vec<RgbImage>) -> Self {
        Self {
            images,
            fail_queries: Vec::new(),
            calls: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
            on_search: None,
        }
    }

    pub fn failing_for(mut self, query: &str) -> Self {
        self.fail_queries.push(query.to_string());
        self
    }

    /// Called with the 1-based call count before each search.
    pub fn on_search(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_search = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// When each search call began, earliest first.
    pub fn search_starts(&self) -> Vec<Instant> {
        let mut starts = self.starts.lock().unwrap().clone();
        starts.sort();
        starts
    }
}

impl ImageSource for ScriptedSource {
    fn search(&self, request: &SearchRequest) -> Result<Vec<SourceImage>, HarvestError> {
        self.starts.lock().unwrap().push(Instant::now());
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.on_search {
            hook(call);
        }

        if self.fail_queries.iter().any(|q| q == &request.query) {
            return Err(HarvestError::adapter(&request.query, "scripted failure"));
        }

        std::fs::create_dir_all(&request.output_dir)
            .map_err(|e| HarvestError::filesystem(&request.output_dir, e))?;

        Ok(self
            .images
            .iter()
            .take(request.limit)
            .enumerate()
            .map(|(index, img)| {
                let local_path = request
                    .output_dir
                    .join(format!("{:03}_call{}.png", index + 1, call));
                write(&local_path, img);
                SourceImage {
                    source_url: format!("https://images.test/{}/{}", call, index + 1),
                    local_path,
                }
            })
            .collect())
    }

    fn source_name(&self) -> &'static str {
        "scripted"
    }
}

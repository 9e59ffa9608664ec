//! Near-duplicate detection by normalized cross-correlation.
//!
//! Both images are reduced to blurred grayscale, brought to a common size
//! (only ever by shrinking) and correlated. The score lies in `[-1, 1]`;
//! re-encoded or resized copies of the same picture score close to 1,
//! unrelated pictures close to 0.

use image::{imageops, DynamicImage, GrayImage, ImageReader};
use std::path::Path;

use crate::config::DedupConfig;
use crate::error::HarvestError;

/// Result of comparing two images.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityVerdict {
    pub score: f64,
    pub is_duplicate: bool,
}

/// An image after grayscale conversion and smoothing, ready to correlate.
#[derive(Debug, Clone)]
pub struct Normalized {
    gray: GrayImage,
}

#[derive(Debug, Clone)]
pub struct SimilarityEngine {
    threshold: f64,
    blur_sigma: f32,
    working_size: u32,
}

impl SimilarityEngine {
    pub fn new(threshold: f64) -> Self {
        let defaults = DedupConfig::default();
        Self {
            threshold,
            blur_sigma: defaults.blur_sigma,
            working_size: defaults.working_size,
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self {
            threshold: config.duplicate_threshold,
            blur_sigma: config.blur_sigma,
            working_size: config.working_size.max(1),
        }
    }

    /// Open and decode an image, sniffing the format from its content.
    pub fn load(path: &Path) -> Result<DynamicImage, HarvestError> {
        let img = ImageReader::open(path)
            .map_err(|e| HarvestError::decode(path, e))?
            .with_guessed_format()
            .map_err(|e| HarvestError::decode(path, e))?
            .decode()
            .map_err(|e| HarvestError::decode(path, e))?;

        if img.width() == 0 || img.height() == 0 {
            return Err(HarvestError::decode(path, "image has no pixels"));
        }
        Ok(img)
    }

    /// Grayscale plus a fixed Gaussian blur to wash out compression noise.
    pub fn normalize(&self, img: &DynamicImage) -> Normalized {
        let gray = img.to_luma8();
        let gray = if self.blur_sigma > 0.0 {
            imageops::blur(&gray, self.blur_sigma)
        } else {
            gray
        };
        Normalized { gray }
    }

    pub fn load_normalized(&self, path: &Path) -> Result<Normalized, HarvestError> {
        Self::load(path).map(|img| self.normalize(&img))
    }

    pub fn compare(&self, a: &DynamicImage, b: &DynamicImage) -> SimilarityVerdict {
        self.compare_normalized(&self.normalize(a), &self.normalize(b))
    }

    pub fn compare_files(&self, a: &Path, b: &Path) -> Result<SimilarityVerdict, HarvestError> {
        let a = self.load_normalized(a)?;
        let b = self.load_normalized(b)?;
        Ok(self.compare_normalized(&a, &b))
    }

    pub fn compare_normalized(&self, a: &Normalized, b: &Normalized) -> SimilarityVerdict {
        let (base, template) = reconcile(&a.gray, &b.gray);
        let (base, template) = self.shrink_to_working_size(base, template);
        let score = match_template(&base, &template);

        SimilarityVerdict {
            score,
            is_duplicate: score > self.threshold,
        }
    }

    /// Scale both images by the same factor so the longest side fits the
    /// working size.
    fn shrink_to_working_size(&self, base: GrayImage, template: GrayImage) -> (GrayImage, GrayImage) {
        let (w, h) = base.dimensions();
        let longest = w.max(h);
        if longest <= self.working_size {
            return (base, template);
        }

        let scale = self.working_size as f64 / longest as f64;
        let shrink = |img: &GrayImage| {
            let (w, h) = img.dimensions();
            let nw = ((w as f64 * scale).round() as u32).max(1);
            let nh = ((h as f64 * scale).round() as u32).max(1);
            imageops::resize(img, nw, nh, imageops::FilterType::Triangle)
        };
        (shrink(&base), shrink(&template))
    }
}

/// Bring both images to the common box `(min width, min height)`. Each
/// image is only ever shrunk, one axis at a time, so neither is upsampled.
/// Returns `(base, template)` of equal size.
fn reconcile(a: &GrayImage, b: &GrayImage) -> (GrayImage, GrayImage) {
    let (aw, ah) = a.dimensions();
    let (bw, bh) = b.dimensions();
    let target = (aw.min(bw), ah.min(bh));

    let fit = |img: &GrayImage| {
        if img.dimensions() == target {
            img.clone()
        } else {
            imageops::resize(img, target.0, target.1, imageops::FilterType::Triangle)
        }
    };
    (fit(a), fit(b))
}

/// Maximum mean-subtracted normalized cross-correlation of `template` over
/// every placement inside `base`.
fn match_template(base: &GrayImage, template: &GrayImage) -> f64 {
    let (bw, bh) = base.dimensions();
    let (tw, th) = template.dimensions();
    if tw > bw || th > bh {
        return match_template(template, base);
    }

    let t: Vec<f64> = template.pixels().map(|p| p.0[0] as f64).collect();
    let n = t.len() as f64;
    let t_mean = t.iter().sum::<f64>() / n;
    let t_dev: Vec<f64> = t.iter().map(|v| v - t_mean).collect();
    let t_energy: f64 = t_dev.iter().map(|v| v * v).sum();

    let mut best = f64::NEG_INFINITY;
    for oy in 0..=(bh - th) {
        for ox in 0..=(bw - tw) {
            let window = |x: u32, y: u32| base.get_pixel(ox + x, oy + y).0[0] as f64;

            let mut sum = 0.0;
            for y in 0..th {
                for x in 0..tw {
                    sum += window(x, y);
                }
            }
            let w_mean = sum / n;

            let mut cross = 0.0;
            let mut w_energy = 0.0;
            for y in 0..th {
                for x in 0..tw {
                    let dw = window(x, y) - w_mean;
                    cross += dw * t_dev[(y * tw + x) as usize];
                    w_energy += dw * dw;
                }
            }

            let score = correlation(cross, w_energy, t_energy, w_mean, t_mean);
            if score > best {
                best = score;
            }
        }
    }
    best
}

/// Total deviation energy below this counts as a flat image.
const FLAT_ENERGY: f64 = 1e-6;

fn correlation(cross: f64, a_energy: f64, b_energy: f64, a_mean: f64, b_mean: f64) -> f64 {
    match (a_energy < FLAT_ENERGY, b_energy < FLAT_ENERGY) {
        (true, true) => {
            if (a_mean - b_mean).abs() <= 1.0 {
                1.0
            } else {
                0.0
            }
        }
        (true, false) | (false, true) => 0.0,
        (false, false) => (cross / (a_energy * b_energy).sqrt()).clamp(-1.0, 1.0),
    }
}

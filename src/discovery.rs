use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext_lower)
        })
        .unwrap_or(false)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Image files directly inside `directory`, sorted by path.
///
/// A missing directory yields an empty list.
pub fn discover_images(directory: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| !is_hidden(p) && has_image_extension(p, extensions))
        .collect();

    // Sort by path for consistent ordering
    images.sort();
    images
}

/// Every directory under `root` (recursively) that directly holds at least
/// one image, sorted.
pub fn discover_image_folders(root: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let folders: BTreeSet<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !is_hidden(e.path()) && has_image_extension(e.path(), extensions))
        .filter_map(|e| e.path().parent().map(Path::to_path_buf))
        .collect();

    folders.into_iter().collect()
}

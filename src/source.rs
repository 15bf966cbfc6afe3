//! Image source adapter.
//!
//! Enumerates candidate receipt images from a folder (or accepts a single
//! in-memory buffer) and applies the resize normalization before anything is
//! handed to extraction: if either dimension is at or above [`MAX_EDGE_PX`],
//! the image is scaled so its longer side is exactly [`MAX_EDGE_PX`] with
//! aspect ratio preserved. Folder mode persists the resized bytes back to the
//! source file; in-memory mode just returns them.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::ImageOutputFormat;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};

/// Longer-edge ceiling applied before extraction.
pub const MAX_EDGE_PX: u32 = 1200;

/// Extensions accepted by the folder scan (matched case-insensitively).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// List candidate images in `dir`, sorted by filename.
///
/// Fails with `NoImagesFound` when nothing matches, a hard stop for that
/// batch rather than a per-item failure.
pub fn scan_folder(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| PipelineError::NoImagesFound(format!("{} ({e})", dir.display())))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_supported_extension(path))
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(PipelineError::NoImagesFound(dir.display().to_string()));
    }

    debug!("scan_folder: {} candidate(s) in {}", paths.len(), dir.display());
    Ok(paths)
}

/// Read one source file and normalize its size, writing the resized image
/// back over the original when a resize was needed. Returns the bytes to
/// hand to extraction.
pub fn load_normalized(path: &Path) -> PipelineResult<Vec<u8>> {
    let bytes = std::fs::read(path)
        .map_err(|e| PipelineError::UnreadableImage(format!("{}: {e}", path.display())))?;

    let img = decode(&bytes, path)?;
    match resize_plan(img.width(), img.height()) {
        Some((w, h)) => {
            let resized = img.resize_exact(w, h, image::imageops::FilterType::Triangle);
            resized
                .save(path)
                .map_err(|e| PipelineError::UnreadableImage(format!("{}: {e}", path.display())))?;
            info!(
                "resized {} from {}x{} to {w}x{h}",
                path.display(),
                img.width(),
                img.height()
            );
            encode_like(&resized, &bytes)
        }
        None => Ok(bytes),
    }
}

/// Normalize an in-memory buffer. No file is touched; callers get back either
/// the original bytes (already small enough) or a re-encoded resized image.
pub fn normalize_bytes(bytes: &[u8]) -> PipelineResult<Vec<u8>> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::UnreadableImage(e.to_string()))?;

    match resize_plan(img.width(), img.height()) {
        Some((w, h)) => {
            let resized = img.resize_exact(w, h, image::imageops::FilterType::Triangle);
            debug!(
                "normalize_bytes: {}x{} -> {w}x{h}",
                img.width(),
                img.height()
            );
            encode_like(&resized, bytes)
        }
        None => Ok(bytes.to_vec()),
    }
}

/// Move a successfully processed image into `archive_dir`, creating the
/// folder on first use. Keeps the filename.
pub fn archive(path: &Path, archive_dir: &Path) -> PipelineResult<PathBuf> {
    std::fs::create_dir_all(archive_dir)
        .map_err(|e| PipelineError::UnreadableImage(format!("{}: {e}", archive_dir.display())))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| PipelineError::UnreadableImage(format!("{}: no filename", path.display())))?;
    let target = archive_dir.join(file_name);

    // Rename first; fall back to copy+remove across filesystems.
    if std::fs::rename(path, &target).is_err() {
        std::fs::copy(path, &target)
            .and_then(|_| std::fs::remove_file(path))
            .map_err(|e| PipelineError::UnreadableImage(format!("{}: {e}", path.display())))?;
    }

    Ok(target)
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn decode(bytes: &[u8], path: &Path) -> PipelineResult<image::DynamicImage> {
    image::load_from_memory(bytes)
        .map_err(|e| PipelineError::UnreadableImage(format!("{}: {e}", path.display())))
}

/// Target dimensions when a resize is needed, `None` when the image is
/// already within bounds (never upscales).
fn resize_plan(width: u32, height: u32) -> Option<(u32, u32)> {
    if width < MAX_EDGE_PX && height < MAX_EDGE_PX {
        return None;
    }

    let (new_width, new_height) = if width >= height {
        let scaled = (height as u64 * MAX_EDGE_PX as u64 / width as u64) as u32;
        (MAX_EDGE_PX, scaled.max(1))
    } else {
        let scaled = (width as u64 * MAX_EDGE_PX as u64 / height as u64) as u32;
        (scaled.max(1), MAX_EDGE_PX)
    };

    if (new_width, new_height) == (width, height) {
        return None;
    }
    Some((new_width, new_height))
}

/// Re-encode a resized image in the same container format as the original
/// bytes (falls back to PNG when the format cannot be guessed).
fn encode_like(img: &image::DynamicImage, original: &[u8]) -> PipelineResult<Vec<u8>> {
    let format = image::guess_format(original)
        .map(ImageOutputFormat::from)
        .unwrap_or(ImageOutputFormat::Png);

    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), format)
        .map_err(|e| PipelineError::UnreadableImage(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            height,
            image::Rgb([200, 200, 200]),
        ));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("receipt-kanri-{tag}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn oversized_image_scales_longer_edge_to_1200() {
        let normalized = normalize_bytes(&png_bytes(2400, 1800)).unwrap();
        let img = image::load_from_memory(&normalized).unwrap();
        assert_eq!((img.width(), img.height()), (1200, 900));
    }

    #[test]
    fn portrait_image_scales_on_height() {
        let normalized = normalize_bytes(&png_bytes(1800, 2400)).unwrap();
        let img = image::load_from_memory(&normalized).unwrap();
        assert_eq!((img.width(), img.height()), (900, 1200));
    }

    #[test]
    fn small_image_is_untouched() {
        let original = png_bytes(800, 600);
        let normalized = normalize_bytes(&original).unwrap();
        assert_eq!(normalized, original);
    }

    #[test]
    fn square_at_threshold_is_not_upscaled() {
        assert_eq!(resize_plan(1200, 1200), None);
        assert_eq!(resize_plan(1300, 1300), Some((1200, 1200)));
        assert_eq!(resize_plan(1199, 300), None);
    }

    #[test]
    fn corrupt_bytes_are_rejected() {
        let err = normalize_bytes(b"not an image").unwrap_err();
        assert!(matches!(err, PipelineError::UnreadableImage(_)));
    }

    #[test]
    fn scan_filters_and_sorts() {
        let dir = temp_dir("scan");
        std::fs::write(dir.join("b.jpg"), b"x").unwrap();
        std::fs::write(dir.join("a.PNG"), b"x").unwrap();
        std::fs::write(dir.join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.join("nested")).unwrap();

        let paths = scan_folder(&dir).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.PNG", "b.jpg"]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn empty_folder_is_batch_fatal() {
        let dir = temp_dir("empty");
        let err = scan_folder(&dir).unwrap_err();
        assert!(matches!(err, PipelineError::NoImagesFound(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn archive_moves_the_file() {
        let dir = temp_dir("archive");
        let src = dir.join("receipt.jpg");
        std::fs::write(&src, b"data").unwrap();

        let archived = archive(&src, &dir.join("archive")).unwrap();
        assert!(!src.exists());
        assert!(archived.exists());
        assert_eq!(std::fs::read(archived).unwrap(), b"data");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}

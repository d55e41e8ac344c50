//! Frame sources.
//!
//! [`ImageDirSource`] replays a directory of still images in lexical
//! filename order, standing in for a live camera.

use crate::frame::Frame;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Extensions [`ImageDirSource`] picks up.
const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "pgm", "ppm"];

#[derive(Error, Debug)]
pub enum AcquireError {
    /// No frame this time; the next attempt may succeed.
    #[error("frame unavailable: {0}")]
    Unavailable(String),
    /// The source has no more frames.
    #[error("frame source closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("frame directory not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to list frame directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Something that produces frames, one per call.
pub trait FrameSource: Send {
    fn acquire(&mut self) -> Result<Frame, AcquireError>;
}

/// Replays the image files of a directory as grayscale frames.
pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    interval: Duration,
}

impl ImageDirSource {
    /// List image files in `dir`. `interval` paces acquisition like a camera's frame rate.
    pub fn open(dir: &Path, interval: Duration) -> Result<Self, SourceError> {
        if !dir.is_dir() {
            return Err(SourceError::NotFound(dir.to_path_buf()));
        }

        let entries = std::fs::read_dir(dir).map_err(|e| SourceError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        files.sort();

        tracing::info!(dir = %dir.display(), frames = files.len(), "opened frame directory");

        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            next: 0,
            interval,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn acquire(&mut self) -> Result<Frame, AcquireError> {
        let Some(path) = self.files.get(self.next) else {
            return Err(AcquireError::Closed);
        };
        let sequence = self.next as u32;
        self.next += 1;

        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }

        let image = image::open(path)
            .map_err(|e| AcquireError::Unavailable(format!("{}: {e}", path.display())))?;
        Ok(Frame::from_gray(image.to_luma8(), sequence))
    }
}

impl Drop for ImageDirSource {
    fn drop(&mut self) {
        tracing::debug!(dir = %self.dir.display(), replayed = self.next, "frame source released");
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn test_replays_images_in_order_then_closes() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::from_pixel(3, 2, Luma([10])).save(dir.path().join("b.png")).unwrap();
        GrayImage::from_pixel(3, 2, Luma([200])).save(dir.path().join("a.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ImageDirSource::open(dir.path(), Duration::ZERO).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.acquire().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.data[0], 200);
        assert!(!first.is_dark);

        let second = source.acquire().unwrap();
        assert_eq!(second.sequence, 1);
        assert!(second.is_dark);

        assert!(matches!(source.acquire(), Err(AcquireError::Closed)));
    }

    #[test]
    fn test_undecodable_image_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not a png").unwrap();
        GrayImage::from_pixel(2, 2, Luma([128])).save(dir.path().join("ok.png")).unwrap();

        let mut source = ImageDirSource::open(dir.path(), Duration::ZERO).unwrap();
        assert!(matches!(source.acquire(), Err(AcquireError::Unavailable(_))));
        let frame = source.acquire().unwrap();
        assert_eq!(frame.sequence, 1);
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageDirSource::open(&dir.path().join("missing"), Duration::ZERO),
            Err(SourceError::NotFound(_))
        ));
    }
}

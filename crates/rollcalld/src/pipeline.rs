//! Collaborators the session drives: face detection, face encoding and display.
//!
//! Detection and encoding are opaque to the attendance engine. The daemon
//! ships [`ReplayTrace`], which serves precomputed detections for replayed
//! frames, and two display sinks.

use rollcall_core::{Embedding, Region};
use rollcall_hw::Frame;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detection failed: {0}")]
    Detection(String),
    #[error("encoding failed: {0}")]
    Encoding(String),
}

/// Finds face regions in a frame.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Region>, PipelineError>;
}

/// Computes the live encoding of one detected face.
pub trait FaceEncoder: Send {
    fn encode(&mut self, frame: &Frame, region: &Region) -> Result<Embedding, PipelineError>;
}

/// Label drawn next to a detected face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLabel {
    pub region: Region,
    /// Matched identity, or `Unknown`.
    pub text: String,
    pub known: bool,
}

/// A processed frame with its face labels.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub labels: Vec<FaceLabel>,
}

/// Display collaborator.
pub trait FrameSink: Send {
    fn display(&mut self, annotated: &AnnotatedFrame);
}

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("detection trace not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read detection trace {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed detection trace {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TracedFace {
    pub region: Region,
    pub encoding: Embedding,
}

#[derive(Deserialize)]
struct TraceFile {
    frames: Vec<Vec<TracedFace>>,
}

/// Precomputed detections, indexed by frame sequence number.
///
/// ```json
/// {"frames": [[], [{"region": {"x": 10, "y": 12, "width": 80, "height": 80}, "encoding": [0.1, ...]}]]}
/// ```
#[derive(Clone, Default)]
pub struct ReplayTrace {
    frames: Arc<Vec<Vec<TracedFace>>>,
}

impl ReplayTrace {
    pub fn new(frames: Vec<Vec<TracedFace>>) -> Self {
        Self {
            frames: Arc::new(frames),
        }
    }

    pub fn load(path: &Path) -> Result<Self, TraceError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TraceError::NotFound(path.to_path_buf())
            } else {
                TraceError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        let file: TraceFile = serde_json::from_str(&raw).map_err(|e| TraceError::Malformed {
            path: path.to_path_buf(),
            source: e,
        })?;
        tracing::info!(path = %path.display(), frames = file.frames.len(), "loaded detection trace");
        Ok(Self::new(file.frames))
    }

    fn faces(&self, sequence: u32) -> &[TracedFace] {
        self.frames
            .get(sequence as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl FaceDetector for ReplayTrace {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Region>, PipelineError> {
        Ok(self.faces(frame.sequence).iter().map(|f| f.region).collect())
    }
}

impl FaceEncoder for ReplayTrace {
    fn encode(&mut self, frame: &Frame, region: &Region) -> Result<Embedding, PipelineError> {
        self.faces(frame.sequence)
            .iter()
            .find(|f| f.region == *region)
            .map(|f| f.encoding.clone())
            .ok_or_else(|| {
                PipelineError::Encoding(format!(
                    "no traced encoding for region {region:?} in frame {}",
                    frame.sequence
                ))
            })
    }
}

/// Logs the labels of every displayed frame.
pub struct LogSink;

impl FrameSink for LogSink {
    fn display(&mut self, annotated: &AnnotatedFrame) {
        if annotated.labels.is_empty() {
            return;
        }
        let labels: Vec<&str> = annotated.labels.iter().map(|l| l.text.as_str()).collect();
        tracing::debug!(frame = annotated.frame.sequence, ?labels, "faces");
    }
}

/// Writes the latest annotated frame to a PNG, outlining each face.
/// Known faces are outlined white, unknown ones black.
pub struct PreviewSink {
    path: PathBuf,
}

impl PreviewSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn render(annotated: &AnnotatedFrame) -> Option<image::GrayImage> {
        let mut image = annotated.frame.to_gray_image()?;
        for label in &annotated.labels {
            let shade = if label.known { 255 } else { 0 };
            outline(&mut image, &label.region, shade);
        }
        Some(image)
    }
}

impl FrameSink for PreviewSink {
    fn display(&mut self, annotated: &AnnotatedFrame) {
        let Some(image) = Self::render(annotated) else {
            tracing::warn!(frame = annotated.frame.sequence, "frame buffer size mismatch, preview skipped");
            return;
        };
        let tmp = self.path.with_extension("tmp.png");
        let result = image
            .save(&tmp)
            .map_err(|e| e.to_string())
            .and_then(|()| std::fs::rename(&tmp, &self.path).map_err(|e| e.to_string()));
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write preview");
        }
    }
}

fn outline(image: &mut image::GrayImage, region: &Region, shade: u8) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(w - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(h - 1);
    let (x0, x1) = (clamp_x(region.x), clamp_x(region.x + region.width));
    let (y0, y1) = (clamp_y(region.y), clamp_y(region.y + region.height));

    for x in x0..=x1 {
        image.put_pixel(x, y0, image::Luma([shade]));
        image.put_pixel(x, y1, image::Luma([shade]));
    }
    for y in y0..=y1 {
        image.put_pixel(x0, y, image::Luma([shade]));
        image.put_pixel(x1, y, image::Luma([shade]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn region(x: f32) -> Region {
        Region { x, y: 1.0, width: 2.0, height: 2.0, confidence: 0.9 }
    }

    fn frame(sequence: u32) -> Frame {
        Frame::from_gray(GrayImage::from_pixel(8, 8, Luma([128])), sequence)
    }

    fn trace() -> ReplayTrace {
        ReplayTrace::new(vec![
            vec![],
            vec![
                TracedFace { region: region(1.0), encoding: Embedding::new(vec![0.1, 0.2]) },
                TracedFace { region: region(4.0), encoding: Embedding::new(vec![0.9, 0.8]) },
            ],
        ])
    }

    #[test]
    fn test_trace_detects_per_sequence() {
        let mut t = trace();
        assert!(t.detect(&frame(0)).unwrap().is_empty());
        assert_eq!(t.detect(&frame(1)).unwrap(), vec![region(1.0), region(4.0)]);
        assert!(t.detect(&frame(9)).unwrap().is_empty());
    }

    #[test]
    fn test_trace_encodes_by_region() {
        let mut t = trace();
        let e = t.encode(&frame(1), &region(4.0)).unwrap();
        assert_eq!(e.values, vec![0.9, 0.8]);
        assert!(matches!(
            t.encode(&frame(1), &region(6.0)),
            Err(PipelineError::Encoding(_))
        ));
    }

    #[test]
    fn test_trace_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        std::fs::write(
            &path,
            r#"{"frames":[[{"region":{"x":1,"y":1,"width":2,"height":2},"encoding":[0.5]}]]}"#,
        )
        .unwrap();
        let mut t = ReplayTrace::load(&path).unwrap();
        assert_eq!(t.detect(&frame(0)).unwrap().len(), 1);
        assert!(matches!(
            ReplayTrace::load(&dir.path().join("missing.json")),
            Err(TraceError::NotFound(_))
        ));
    }

    #[test]
    fn test_preview_outlines_known_faces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.png");
        let mut sink = PreviewSink::new(path.clone());
        sink.display(&AnnotatedFrame {
            frame: frame(0),
            labels: vec![FaceLabel { region: region(1.0), text: "alice".into(), known: true }],
        });

        let written = image::open(&path).unwrap().to_luma8();
        assert_eq!(written.get_pixel(1, 1)[0], 255);
        assert_eq!(written.get_pixel(3, 3)[0], 255);
        assert_eq!(written.get_pixel(2, 2)[0], 128);
        assert_eq!(written.get_pixel(6, 6)[0], 128);
    }
}

//! rollcall-hw — Frame acquisition.
//!
//! Provides the grayscale frame type consumed by the recognition session
//! and the frame source abstraction it pulls from.

pub mod frame;
pub mod source;

pub use frame::Frame;
pub use source::{AcquireError, FrameSource, ImageDirSource, SourceError};

#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Error types for video loading.
///
/// Defines [`error::VideoError`] variants for missing files, undecodable frames
/// and GStreamer pipeline failures.
pub mod error;

/// Segment based frame index sampling.
///
/// See [`sampling::segment_indices`] for the index rule and
/// [`sampling::sampling_message`] for the textual summary handed to the model.
pub mod sampling;

/// A sampled video clip and frame resizing helpers.
pub mod clip;

/// Frame sources and the high-level [`source::load_video`] entry point.
pub mod source;

/// Read a directory of image files as a video.
pub mod frame_dir;

/// GStreamer video file decoding (feature-gated).
///
/// Requires the `gstreamer` feature flag and system GStreamer libraries.
#[cfg(feature = "gstreamer")]
pub mod gstreamer;

pub use clip::VideoClip;
pub use error::VideoError;
pub use source::{load_video, sample_clip, FrameSource};

use std::path::Path;

use image::RgbImage;
use log::debug;

use crate::{
    clip::VideoClip,
    error::VideoError,
    frame_dir::FrameDirectory,
    sampling::{sampling_message, segment_indices},
};

/// A random-access source of video frames.
pub trait FrameSource {
    /// Total number of frames in the source.
    fn frame_count(&mut self) -> Result<usize, VideoError>;

    /// Average frame rate in frames per second.
    fn fps(&self) -> f64;

    /// Read the frames at `indices`, in the given order.
    fn read_frames(&mut self, indices: &[usize]) -> Result<Vec<RgbImage>, VideoError>;
}

/// Sample `num_segments` frames from a source and describe them.
///
/// Frames are resized so that their shorter side equals `resolution`.
///
/// # Returns
///
/// The sampled clip and a message listing the frame timestamps.
pub fn sample_clip<S: FrameSource + ?Sized>(
    source: &mut S,
    num_segments: usize,
    resolution: u32,
) -> Result<(VideoClip, String), VideoError> {
    let total_frames = source.frame_count()?;
    let indices = segment_indices(total_frames, num_segments)?;
    debug!("Sampling frames {indices:?} out of {total_frames}");

    let frames = source.read_frames(&indices)?;
    let mut clip = VideoClip::new(frames, indices, source.fps());
    clip.resize_shorter_side(resolution);

    let msg = sampling_message(clip.timestamps());
    Ok((clip, msg))
}

/// Load a video from a file or a directory of frames.
///
/// Directories are read with [`FrameDirectory`]. Files are decoded with GStreamer and
/// require the `gstreamer` feature.
///
/// # Arguments
///
/// * `path` - Path to the video file or frame directory.
/// * `num_segments` - Number of frames to sample.
/// * `resolution` - Target length of the shorter frame side.
pub fn load_video(
    path: impl AsRef<Path>,
    num_segments: usize,
    resolution: u32,
) -> Result<(VideoClip, String), VideoError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(VideoError::FileDoesNotExist(path.to_path_buf()));
    }

    let mut source = open_source(path)?;
    sample_clip(source.as_mut(), num_segments, resolution)
}

fn open_source(path: &Path) -> Result<Box<dyn FrameSource>, VideoError> {
    if path.is_dir() {
        return Ok(Box::new(FrameDirectory::open(path)?));
    }

    #[cfg(feature = "gstreamer")]
    {
        Ok(Box::new(crate::gstreamer::GstVideoReader::open(path)?))
    }

    #[cfg(not(feature = "gstreamer"))]
    {
        Err(VideoError::UnsupportedSource(format!(
            "{} is a video file; enable the `gstreamer` feature to decode it",
            path.display()
        )))
    }
}

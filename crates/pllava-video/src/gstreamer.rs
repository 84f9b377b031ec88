use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use gstreamer::prelude::*;
use image::RgbImage;

use crate::{error::VideoError, source::FrameSource};

/// Maximum time to wait for the pipeline to preroll.
const PREROLL_TIMEOUT_SECS: u64 = 10;

/// A video file decoded with GStreamer.
///
/// Every read builds a fresh `decodebin` pipeline and walks the stream from the
/// start, keeping only the requested frames.
pub struct GstVideoReader {
    path: PathBuf,
    fps: f64,
    frame_count: Option<usize>,
}

impl GstVideoReader {
    /// Open a video file and read its frame rate and duration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VideoError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(VideoError::FileDoesNotExist(path));
        }

        // make sure that we do not initialize gstreamer several times
        if !gstreamer::INITIALIZED.load(std::sync::atomic::Ordering::Relaxed) {
            gstreamer::init()?;
        }

        let pipeline = DecodePipeline::new(&path)?;
        let info = pipeline.preroll()?;

        let fps = match info.fps() {
            f if f.numer() > 0 && f.denom() > 0 => f.numer() as f64 / f.denom() as f64,
            _ => {
                log::warn!(
                    "{} has no frame rate, assuming 1 frame per second",
                    path.display()
                );
                1.0
            }
        };

        let frame_count = pipeline
            .pipeline
            .query_duration::<gstreamer::ClockTime>()
            .map(|d| (d.nseconds() as f64 * 1e-9 * fps).round() as usize)
            .filter(|&n| n > 0);

        log::debug!(
            "Opened {} ({}x{}, {fps:.2} fps, {frame_count:?} frames)",
            path.display(),
            info.width(),
            info.height(),
        );

        Ok(Self {
            path,
            fps,
            frame_count,
        })
    }

    fn count_frames(&self) -> Result<usize, VideoError> {
        let pipeline = DecodePipeline::new(&self.path)?;
        pipeline.play()?;

        let mut count = 0;
        while pipeline.next_sample()?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

impl FrameSource for GstVideoReader {
    fn frame_count(&mut self) -> Result<usize, VideoError> {
        if let Some(count) = self.frame_count {
            return Ok(count);
        }
        let count = self.count_frames()?;
        if count == 0 {
            return Err(VideoError::NoFrames(self.path.display().to_string()));
        }
        self.frame_count = Some(count);
        Ok(count)
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn read_frames(&mut self, indices: &[usize]) -> Result<Vec<RgbImage>, VideoError> {
        let Some(&last_index) = indices.iter().max() else {
            return Ok(vec![]);
        };

        let pipeline = DecodePipeline::new(&self.path)?;
        pipeline.play()?;

        let (frames, decoded) = collect_requested(
            indices,
            || pipeline.next_sample(),
            DecodePipeline::sample_to_frame,
        )?;
        if decoded == 0 {
            return Err(VideoError::NoFrames(self.path.display().to_string()));
        }
        if decoded <= last_index {
            // the duration based frame count can overshoot the decoded stream
            log::warn!(
                "{} ended after {decoded} frames, repeating the last frame",
                self.path.display()
            );
        }
        Ok(frames)
    }
}

/// Walk a stream of samples and convert only the requested ones.
///
/// Indices past the end of the stream get the last sample. Returns the frames in the
/// order of `indices` and the number of samples pulled.
fn collect_requested<S>(
    indices: &[usize],
    mut next: impl FnMut() -> Result<Option<S>, VideoError>,
    convert: impl Fn(&S) -> Result<RgbImage, VideoError>,
) -> Result<(Vec<RgbImage>, usize), VideoError> {
    let Some(&last_index) = indices.iter().max() else {
        return Ok((vec![], 0));
    };

    // the same frame may be requested more than once
    let mut wanted: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (slot, &idx) in indices.iter().enumerate() {
        wanted.entry(idx).or_default().push(slot);
    }

    let mut frames: Vec<Option<RgbImage>> = vec![None; indices.len()];
    let mut last_sample = None;
    let mut frame_idx = 0;
    while frame_idx <= last_index {
        let Some(sample) = next()? else {
            break;
        };
        if let Some(slots) = wanted.get(&frame_idx) {
            let frame = convert(&sample)?;
            for &slot in slots {
                frames[slot] = Some(frame.clone());
            }
        }
        last_sample = Some(sample);
        frame_idx += 1;
    }

    let Some(last_sample) = last_sample else {
        return Ok((vec![], 0));
    };
    let fallback = match frames.iter().any(Option::is_none) {
        true => Some(convert(&last_sample)?),
        false => None,
    };
    let frames = frames
        .into_iter()
        .flat_map(|frame| frame.or_else(|| fallback.clone()))
        .collect();
    Ok((frames, frame_idx))
}

/// A `filesrc ! decodebin ! appsink` pipeline producing RGB frames.
struct DecodePipeline {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
}

impl DecodePipeline {
    fn new(path: &Path) -> Result<Self, VideoError> {
        let pipeline_str = format!(
            "filesrc location=\"{}\" ! \
            decodebin ! \
            videoconvert ! \
            video/x-raw,format=RGB ! \
            appsink name=sink sync=false",
            path.to_string_lossy()
        );
        log::trace!("Decode pipeline: {pipeline_str}");

        let pipeline = gstreamer::parse::launch(&pipeline_str)?
            .dynamic_cast::<gstreamer::Pipeline>()
            .map_err(|_| VideoError::PipelineError("not a pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| VideoError::PipelineError("missing appsink".to_string()))?
            .dynamic_cast::<gstreamer_app::AppSink>()
            .map_err(|_| VideoError::PipelineError("sink is not an appsink".to_string()))?;

        Ok(Self { pipeline, appsink })
    }

    /// Pause the pipeline and return the negotiated video format.
    fn preroll(&self) -> Result<gstreamer_video::VideoInfo, VideoError> {
        self.pipeline.set_state(gstreamer::State::Paused)?;
        let (res, _, _) = self
            .pipeline
            .state(gstreamer::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS));
        res?;

        let sample = self.appsink.pull_preroll()?;
        let caps = sample
            .caps()
            .ok_or_else(|| VideoError::InvalidFrame("missing caps".to_string()))?;
        Ok(gstreamer_video::VideoInfo::from_caps(caps)?)
    }

    fn play(&self) -> Result<(), VideoError> {
        self.pipeline.set_state(gstreamer::State::Playing)?;
        Ok(())
    }

    /// Pull the next decoded sample, or `None` at the end of the stream.
    fn next_sample(&self) -> Result<Option<gstreamer::Sample>, VideoError> {
        match self.appsink.pull_sample() {
            Ok(sample) => Ok(Some(sample)),
            Err(_) if self.appsink.is_eos() => Ok(None),
            Err(err) => Err(VideoError::PipelineError(err.to_string())),
        }
    }

    fn sample_to_frame(sample: &gstreamer::Sample) -> Result<RgbImage, VideoError> {
        let caps = sample
            .caps()
            .ok_or_else(|| VideoError::InvalidFrame("missing caps".to_string()))?;
        let info = gstreamer_video::VideoInfo::from_caps(caps)?;

        let buffer = sample
            .buffer()
            .ok_or_else(|| VideoError::InvalidFrame("missing buffer".to_string()))?
            .map_readable()?;

        frame_from_strided(
            buffer.as_slice(),
            info.width(),
            info.height(),
            info.stride()[0] as usize,
        )
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::error!("Failed to stop the decode pipeline: {err}");
        }
    }
}

/// Copy a packed RGB buffer with padded rows into an image.
fn frame_from_strided(
    data: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<RgbImage, VideoError> {
    let row_len = width as usize * 3;
    if height == 0
        || stride < row_len
        || data.len() < stride * (height as usize - 1) + row_len
    {
        return Err(VideoError::InvalidFrame(format!(
            "{} bytes for {width}x{height} with stride {stride}",
            data.len()
        )));
    }

    let mut pixels = Vec::with_capacity(row_len * height as usize);
    for row in data.chunks(stride).take(height as usize) {
        pixels.extend_from_slice(&row[..row_len]);
    }

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| VideoError::InvalidFrame("size mismatch".to_string()))
}

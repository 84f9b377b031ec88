use std::path::{Path, PathBuf};

use image::RgbImage;
use log::debug;

use crate::{error::VideoError, source::FrameSource};

const FRAME_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// A video stored as a directory of image files.
///
/// Frames are ordered by file name. Since there is no container to read a frame rate
/// from, the rate defaults to one frame per second and can be set with
/// [`FrameDirectory::with_fps`].
pub struct FrameDirectory {
    paths: Vec<PathBuf>,
    fps: f64,
}

impl FrameDirectory {
    /// Index the image files in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, VideoError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Err(VideoError::FileDoesNotExist(dir.to_path_buf()));
        }

        let mut paths = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        paths.sort();

        if paths.is_empty() {
            return Err(VideoError::NoFrames(dir.display().to_string()));
        }
        debug!("Found {} frames in {}", paths.len(), dir.display());

        Ok(Self { paths, fps: 1.0 })
    }

    /// Set the frame rate used to compute timestamps.
    pub fn with_fps(mut self, fps: f64) -> Self {
        if fps > 0.0 {
            self.fps = fps;
        }
        self
    }
}

impl FrameSource for FrameDirectory {
    fn frame_count(&mut self) -> Result<usize, VideoError> {
        Ok(self.paths.len())
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn read_frames(&mut self, indices: &[usize]) -> Result<Vec<RgbImage>, VideoError> {
        indices
            .iter()
            .map(|&idx| -> Result<RgbImage, VideoError> {
                let path = self.paths.get(idx).ok_or_else(|| {
                    VideoError::InvalidFrame(format!(
                        "frame {idx} out of {} frames",
                        self.paths.len()
                    ))
                })?;
                Ok(image::open(path)?.to_rgb8())
            })
            .collect()
    }
}

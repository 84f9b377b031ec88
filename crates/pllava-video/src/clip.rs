use image::{imageops::FilterType, RgbImage};

use crate::sampling::frame_timestamps;

/// A set of frames sampled from a video.
///
/// Frames are stored as 8-bit RGB images together with the index they were read from and
/// their timestamp in seconds.
#[derive(Clone, Debug)]
pub struct VideoClip {
    frames: Vec<RgbImage>,
    indices: Vec<usize>,
    timestamps: Vec<f64>,
}

impl VideoClip {
    /// Create a new clip from frames read at `indices` of a video running at `fps`.
    ///
    /// # Panics
    ///
    /// Panics if `frames` and `indices` do not have the same length.
    pub fn new(frames: Vec<RgbImage>, indices: Vec<usize>, fps: f64) -> Self {
        assert_eq!(frames.len(), indices.len(), "one index per frame");
        let timestamps = frame_timestamps(&indices, fps);
        Self {
            frames,
            indices,
            timestamps,
        }
    }

    /// The sampled frames.
    pub fn frames(&self) -> &[RgbImage] {
        &self.frames
    }

    /// The frame indices in the source video.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// The frame timestamps in seconds.
    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    /// Number of frames in the clip.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the clip holds no frame.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Resize every frame so that its shorter side equals `size`.
    pub fn resize_shorter_side(&mut self, size: u32) {
        for frame in self.frames.iter_mut() {
            *frame = resize_shorter_side(frame, size);
        }
    }
}

/// Compute the output size when the shorter side is scaled to `size`.
///
/// The longer side keeps the aspect ratio and is truncated to an integer.
pub fn shorter_side_size(width: u32, height: u32, size: u32) -> (u32, u32) {
    if width <= height {
        let long = (size as u64 * height as u64 / width.max(1) as u64) as u32;
        (size, long.max(1))
    } else {
        let long = (size as u64 * width as u64 / height.max(1) as u64) as u32;
        (long.max(1), size)
    }
}

/// Resize a frame so that its shorter side equals `size` using bilinear filtering.
pub fn resize_shorter_side(frame: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = shorter_side_size(frame.width(), frame.height(), size);
    if (width, height) == frame.dimensions() {
        return frame.clone();
    }
    image::imageops::resize(frame, width, height, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_shorter_side_size() {
        assert_eq!(shorter_side_size(640, 480, 336), (448, 336));
        assert_eq!(shorter_side_size(480, 640, 336), (336, 448));
        assert_eq!(shorter_side_size(336, 336, 336), (336, 336));
        // truncates like an integer cast
        assert_eq!(shorter_side_size(1920, 1080, 336), (597, 336));
    }

    #[test]
    fn test_clip_resize() {
        let frames = vec![RgbImage::from_pixel(64, 32, Rgb([10, 20, 30])); 2];
        let mut clip = VideoClip::new(frames, vec![0, 5], 5.0);
        clip.resize_shorter_side(16);

        assert_eq!(clip.len(), 2);
        assert_eq!(clip.frames()[0].dimensions(), (32, 16));
        assert_eq!(clip.frames()[1].get_pixel(3, 3), &Rgb([10, 20, 30]));
        assert_eq!(clip.timestamps(), &[0.0, 1.0]);
    }
}

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use pllava_video::VideoClip;
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::error::PllavaError;

/// CLIP normalization statistics.
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// An image size as written in `preprocessor_config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Square(usize),
    ShortestEdge { shortest_edge: usize },
    HeightWidth { height: usize, width: usize },
}

impl SizeSpec {
    /// Output `(width, height)` of a resize of an image of size `(width, height)`.
    fn resized(&self, width: usize, height: usize) -> (usize, usize) {
        match *self {
            SizeSpec::Square(edge) | SizeSpec::ShortestEdge { shortest_edge: edge } => {
                let (short, long) = (width.min(height), width.max(height));
                let long = (edge * long) / short.max(1);
                if width <= height {
                    (edge, long)
                } else {
                    (long, edge)
                }
            }
            SizeSpec::HeightWidth { height, width } => (width, height),
        }
    }

    /// Output `(width, height)` of a crop.
    fn crop(&self) -> (usize, usize) {
        match *self {
            SizeSpec::Square(edge) | SizeSpec::ShortestEdge { shortest_edge: edge } => (edge, edge),
            SizeSpec::HeightWidth { height, width } => (width, height),
        }
    }
}

/// Settings of the CLIP image processor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageProcessorConfig {
    pub do_resize: bool,
    pub size: SizeSpec,
    pub do_center_crop: bool,
    pub crop_size: SizeSpec,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    /// Pad frames to a square filled with the mean color before resizing.
    pub center_pad: bool,
}

impl Default for ImageProcessorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            size: SizeSpec::ShortestEdge { shortest_edge: 336 },
            do_center_crop: true,
            crop_size: SizeSpec::HeightWidth {
                height: 336,
                width: 336,
            },
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: CLIP_MEAN,
            image_std: CLIP_STD,
            center_pad: false,
        }
    }
}

impl ImageProcessorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PllavaError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn pad_to_square(&self, frame: &RgbImage) -> RgbImage {
        let (w, h) = frame.dimensions();
        if w == h {
            return frame.clone();
        }
        let side = w.max(h);
        let fill = self.image_mean.map(|m| (m * 255.0).round().clamp(0.0, 255.0) as u8);
        let mut canvas = RgbImage::from_pixel(side, side, Rgb(fill));
        imageops::overlay(
            &mut canvas,
            frame,
            ((side - w) / 2) as i64,
            ((side - h) / 2) as i64,
        );
        canvas
    }

    /// Resize, crop and normalize a frame into a `[3, H, W]` buffer.
    pub fn process(&self, frame: &RgbImage) -> (Vec<f32>, usize, usize) {
        let mut img = if self.center_pad {
            self.pad_to_square(frame)
        } else {
            frame.clone()
        };

        if self.do_resize {
            let (w, h) = self.size.resized(img.width() as usize, img.height() as usize);
            if (w, h) != (img.width() as usize, img.height() as usize) {
                img = imageops::resize(&img, w as u32, h as u32, FilterType::CatmullRom);
            }
        }

        if self.do_center_crop {
            let (cw, ch) = self.crop_size.crop();
            let (cw, ch) = (cw as u32, ch as u32);
            if img.width() < cw || img.height() < ch {
                img = imageops::resize(&img, cw, ch, FilterType::CatmullRom);
            } else if (img.width(), img.height()) != (cw, ch) {
                let x = (img.width() - cw) / 2;
                let y = (img.height() - ch) / 2;
                img = imageops::crop_imm(&img, x, y, cw, ch).to_image();
            }
        }

        let (w, h) = (img.width() as usize, img.height() as usize);
        let scale = if self.do_rescale {
            self.rescale_factor
        } else {
            1.0
        };
        let mut data = vec![0f32; 3 * h * w];
        for (x, y, px) in img.enumerate_pixels() {
            for c in 0..3 {
                let mut v = px[c] as f32 * scale;
                if self.do_normalize {
                    v = (v - self.image_mean[c]) / self.image_std[c];
                }
                data[c * h * w + y as usize * w + x as usize] = v;
            }
        }
        (data, h, w)
    }
}

/// Text and image preprocessing of PLLaVA.
pub struct PllavaProcessor {
    tokenizer: Tokenizer,
    image: ImageProcessorConfig,
}

impl PllavaProcessor {
    pub fn new(tokenizer: Tokenizer, image: ImageProcessorConfig) -> Self {
        Self { tokenizer, image }
    }

    /// Read `tokenizer.json` and, when given, `preprocessor_config.json`.
    pub fn from_files(
        tokenizer: impl AsRef<Path>,
        preprocessor_config: Option<&Path>,
    ) -> Result<Self, PllavaError> {
        let tokenizer = Tokenizer::from_file(tokenizer)?;
        let image = match preprocessor_config {
            Some(path) => ImageProcessorConfig::from_file(path)?,
            None => ImageProcessorConfig::default(),
        };
        Ok(Self::new(tokenizer, image))
    }

    /// Tokenize a prompt, adding the beginning-of-sequence token.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, PllavaError> {
        Ok(self.tokenizer.encode(text, true)?.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, PllavaError> {
        Ok(self.tokenizer.decode(ids, skip_special_tokens)?)
    }

    /// Id of a token of the vocabulary, added tokens included.
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// Preprocess the frames of every clip, in order.
    ///
    /// # Returns
    ///
    /// The pixel values with shape `[frames, 3, H, W]`.
    pub fn preprocess(
        &self,
        clips: &[VideoClip],
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor, PllavaError> {
        let frames = clips
            .iter()
            .flat_map(|clip| clip.frames().iter())
            .map(|frame| {
                let (data, h, w) = self.image.process(frame);
                Tensor::from_vec(data, (1, 3, h, w), &Device::Cpu)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        if frames.is_empty() {
            return Err(PllavaError::EmptyMedia(
                "no frames to preprocess".to_string(),
            ));
        }
        Ok(Tensor::cat(&frames, 0)?.to_dtype(dtype)?.to_device(device)?)
    }
}

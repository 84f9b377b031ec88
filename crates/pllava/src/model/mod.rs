pub mod lora;
pub mod norm;
pub mod projector;
pub mod text;
pub mod vision;
pub mod weights;

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Linear;

use crate::config::PllavaConfig;
use crate::device::DeviceMap;
use crate::error::PllavaError;
use crate::generation::Decoder;
use projector::Projector;
use text::LlamaText;
use vision::ClipVisionTower;
use weights::Weights;

pub(crate) fn linear_to_device(l: &Linear, device: &Device) -> candle_core::Result<Linear> {
    Ok(Linear::new(
        l.weight().to_device(device)?,
        l.bias().map(|b| b.to_device(device)).transpose()?,
    ))
}

/// PLLaVA: a CLIP vision tower, a pooling projector and a Llama decoder.
pub struct PllavaModel {
    config: PllavaConfig,
    vision: ClipVisionTower,
    projector: Projector,
    text: LlamaText,
}

impl PllavaModel {
    /// Build the model from checkpoint weights.
    pub fn load(w: &Weights, config: PllavaConfig) -> Result<Self, PllavaError> {
        config.validate()?;
        let feature_index = config.vision_feature_index()?;
        let drop_class_token = config.vision_feature_select_strategy == "default";

        let vision = ClipVisionTower::load(w, &config.vision_config, feature_index, drop_class_token)?;
        let projector = Projector::load(w, &config)?;
        let text = LlamaText::load(w, &config.text_config, config.vocab_size())?;

        Ok(Self {
            config,
            vision,
            projector,
            text,
        })
    }

    pub fn config(&self) -> &PllavaConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.text.dtype()
    }

    /// Device receiving the inputs of the model.
    pub fn device(&self) -> &Device {
        self.text.input_device()
    }

    /// Move the whole model to a single device.
    pub fn to_device(&mut self, device: &Device) -> Result<(), PllavaError> {
        self.vision.to_device(device)?;
        self.projector.to_device(device)?;
        self.text.to_device(device)?;
        Ok(())
    }

    /// Spread the model over several devices.
    pub fn dispatch(&mut self, map: &DeviceMap) -> Result<(), PllavaError> {
        self.vision.to_device(map.first())?;
        self.projector.to_device(map.first())?;
        self.text.dispatch(map)?;
        Ok(())
    }

    /// Encode frames into pooled media groups.
    ///
    /// # Arguments
    ///
    /// * `pixel_values` - Preprocessed frames with shape `[frames, 3, H, W]`, consecutive
    ///   runs of `num_frames` frames forming one group.
    ///
    /// # Returns
    ///
    /// The media embeddings with shape `[groups, tokens, hidden]`.
    pub fn encode_media(&self, pixel_values: &Tensor) -> Result<Tensor, PllavaError> {
        let frames = pixel_values.dim(0)?;
        let num_frames = self.config.num_frames;
        if frames == 0 || frames % num_frames != 0 {
            return Err(PllavaError::FrameCountMismatch { frames, num_frames });
        }

        let pixel_values = pixel_values.to_device(self.device())?;
        let features = self.vision.forward(&pixel_values)?;
        let media = self.projector.forward(&features)?;
        log::debug!("Encoded {frames} frames into media of shape {:?}", media.dims());
        Ok(media)
    }

    /// Embed a prompt, replacing every media token with the next media group.
    ///
    /// Returns the input embeddings with shape `[1, seq, hidden]`.
    pub fn embed_prompt(&self, ids: &[u32], media: Option<&Tensor>) -> Result<Tensor, PllavaError> {
        let media_token = self.config.image_token_index;
        let tokens = ids.iter().filter(|&&id| id == media_token).count();
        let groups = match media {
            Some(m) => m.dim(0)?,
            None => 0,
        };
        if tokens != groups {
            return Err(PllavaError::MediaTokenMismatch { tokens, groups });
        }

        let device = self.device();
        let dtype = self.dtype();
        let mut pieces = Vec::with_capacity(2 * groups + 1);
        for (i, run) in ids.split(|&id| id == media_token).enumerate() {
            if i > 0 {
                if let Some(m) = media {
                    pieces.push(m.i(i - 1)?.to_device(device)?.to_dtype(dtype)?);
                }
            }
            if !run.is_empty() {
                let run = Tensor::new(run, device)?;
                pieces.push(self.text.embed(&run)?);
            }
        }
        if pieces.is_empty() {
            return Err(PllavaError::EmptyMedia("the prompt has no tokens".to_string()));
        }

        Ok(Tensor::cat(&pieces, 0)?.unsqueeze(0)?)
    }

    pub fn clear_cache(&mut self) {
        self.text.clear_cache();
    }

    /// Start a generation from prompt embeddings.
    pub fn decoder(&mut self, prompt_embeds: Tensor) -> PllavaDecoder<'_> {
        self.clear_cache();
        PllavaDecoder {
            model: self,
            prompt_embeds: Some(prompt_embeds),
        }
    }
}

/// Incremental decoding over the language model of a [`PllavaModel`].
pub struct PllavaDecoder<'a> {
    model: &'a mut PllavaModel,
    prompt_embeds: Option<Tensor>,
}

impl Decoder for PllavaDecoder<'_> {
    fn prefill(&mut self) -> Result<Tensor, PllavaError> {
        let embeds = self.prompt_embeds.take().ok_or_else(|| {
            PllavaError::InvalidConfig("the prompt was already consumed".to_string())
        })?;
        Ok(self.model.text.forward(&embeds)?)
    }

    fn step(&mut self, tokens: &[u32]) -> Result<Tensor, PllavaError> {
        let ids = Tensor::new(tokens, self.model.device())?.unsqueeze(1)?;
        let embeds = self.model.text.embed(&ids)?;
        Ok(self.model.text.forward(&embeds)?)
    }

    fn reorder(&mut self, rows: &[usize]) -> Result<(), PllavaError> {
        let rows = rows.iter().map(|&r| r as u32).collect::<Vec<_>>();
        Ok(self.model.text.select_rows(&rows)?)
    }
}

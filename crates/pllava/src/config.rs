use std::path::Path;

use candle_core::{Result, Tensor};
use serde::Deserialize;

use crate::error::PllavaError;

/// Activation functions found in PLLaVA checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenAct {
    /// Exact GELU based on the error function.
    Gelu,
    /// GELU with the tanh approximation.
    #[serde(alias = "gelu_new")]
    GeluPytorchTanh,
    /// `x * sigmoid(1.702 * x)` as used by CLIP.
    QuickGelu,
    /// `x * sigmoid(x)`.
    Silu,
}

impl HiddenAct {
    /// Apply the activation.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Gelu => xs.gelu_erf(),
            Self::GeluPytorchTanh => xs.gelu(),
            Self::QuickGelu => xs * candle_nn::ops::sigmoid(&(xs * 1.702)?)?,
            Self::Silu => xs.silu(),
        }
    }
}

/// Configuration of the CLIP vision tower.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClipVisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub hidden_act: HiddenAct,
    pub layer_norm_eps: f64,
}

impl Default for ClipVisionConfig {
    // CLIP ViT-L/14 at 336px
    fn default() -> Self {
        Self {
            hidden_size: 1024,
            intermediate_size: 4096,
            num_hidden_layers: 24,
            num_attention_heads: 16,
            num_channels: 3,
            image_size: 336,
            patch_size: 14,
            hidden_act: HiddenAct::QuickGelu,
            layer_norm_eps: 1e-5,
        }
    }
}

impl ClipVisionConfig {
    /// Number of patches along one side of the image.
    pub fn patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// One or several end of sequence token ids.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Multiple(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            Self::Single(id) => vec![*id],
            Self::Multiple(ids) => ids.clone(),
        }
    }
}

/// Configuration of the Llama language model.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlamaTextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub hidden_act: HiddenAct,
    pub max_position_embeddings: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub tie_word_embeddings: bool,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<TokenIds>,
}

impl Default for LlamaTextConfig {
    // Llama 2 7B, the base of Vicuna 1.5
    fn default() -> Self {
        Self {
            vocab_size: 32000,
            hidden_size: 4096,
            intermediate_size: 11008,
            num_hidden_layers: 32,
            num_attention_heads: 32,
            num_key_value_heads: None,
            hidden_act: HiddenAct::Silu,
            max_position_embeddings: 4096,
            rms_norm_eps: 1e-6,
            rope_theta: 10000.0,
            tie_word_embeddings: false,
            bos_token_id: Some(1),
            eos_token_id: Some(TokenIds::Single(2)),
        }
    }
}

impl LlamaTextConfig {
    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Pooling applied by the projector over `(time, height, width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolingMethod {
    #[default]
    Avg,
    Max,
}

/// Configuration of a PLLaVA checkpoint, read from its `config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PllavaConfig {
    pub vision_config: ClipVisionConfig,
    pub text_config: LlamaTextConfig,
    pub image_token_index: u32,
    pub projector_hidden_act: HiddenAct,
    pub vision_feature_select_strategy: String,
    pub vision_feature_layer: i64,
    pub vocab_size: Option<usize>,
    pub use_pooling: bool,
    pub pooling_method: PoolingMethod,
    pub pooling_shape: [usize; 3],
    pub frame_shape: [usize; 2],
    pub num_frames: usize,
}

impl Default for PllavaConfig {
    fn default() -> Self {
        Self {
            vision_config: ClipVisionConfig::default(),
            text_config: LlamaTextConfig::default(),
            image_token_index: 32000,
            projector_hidden_act: HiddenAct::Gelu,
            vision_feature_select_strategy: "default".to_string(),
            vision_feature_layer: -2,
            vocab_size: None,
            use_pooling: true,
            pooling_method: PoolingMethod::Avg,
            pooling_shape: [8, 16, 16],
            frame_shape: [24, 24],
            num_frames: 4,
        }
    }
}

impl PllavaConfig {
    /// Read a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> std::result::Result<Self, PllavaError> {
        let data = std::fs::read_to_string(path)?;
        let config = serde_json::from_str::<Self>(&data)?;
        Ok(config)
    }

    /// Vocabulary size of the language model head.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size.unwrap_or(self.text_config.vocab_size)
    }

    /// Index of the vision hidden state fed to the projector, counting the embeddings as 0.
    pub fn vision_feature_index(&self) -> std::result::Result<usize, PllavaError> {
        let states = self.vision_config.num_hidden_layers as i64 + 1;
        let idx = if self.vision_feature_layer < 0 {
            states + self.vision_feature_layer
        } else {
            self.vision_feature_layer
        };
        if idx < 0 || idx >= states {
            return Err(PllavaError::InvalidConfig(format!(
                "vision_feature_layer {} out of {} hidden states",
                self.vision_feature_layer, states
            )));
        }
        Ok(idx as usize)
    }

    /// Check the invariants the model relies on.
    pub fn validate(&self) -> std::result::Result<(), PllavaError> {
        if self.num_frames == 0 {
            return Err(PllavaError::InvalidConfig(
                "num_frames must be strictly positive".to_string(),
            ));
        }
        if self.use_pooling && self.pooling_shape.iter().any(|&s| s == 0) {
            return Err(PllavaError::InvalidConfig(format!(
                "pooling_shape {:?} has an empty dimension",
                self.pooling_shape
            )));
        }
        let side = self.vision_config.patches_per_side();
        if self.frame_shape != [side, side] {
            return Err(PllavaError::InvalidConfig(format!(
                "frame_shape {:?} does not match {side}x{side} vision patches",
                self.frame_shape
            )));
        }
        match self.vision_feature_select_strategy.as_str() {
            "default" | "full" => {}
            other => {
                return Err(PllavaError::InvalidConfig(format!(
                    "unknown vision_feature_select_strategy `{other}`"
                )))
            }
        }
        self.vision_feature_index()?;
        Ok(())
    }
}

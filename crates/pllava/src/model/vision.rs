use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module};

use super::linear_to_device;
use super::norm::LayerNorm;
use super::weights::Weights;
use crate::config::{ClipVisionConfig, HiddenAct};

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(w: &Weights, c: &ClipVisionConfig, prefix: &str) -> Result<Self> {
        let h = c.hidden_size;
        Ok(Self {
            q_proj: w.linear(h, h, &format!("{prefix}.q_proj"), true)?,
            k_proj: w.linear(h, h, &format!("{prefix}.k_proj"), true)?,
            v_proj: w.linear(h, h, &format!("{prefix}.v_proj"), true)?,
            out_proj: w.linear(h, h, &format!("{prefix}.out_proj"), true)?,
            num_heads: c.num_attention_heads,
            head_dim: c.head_dim(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batches, patches, hidden_size) = x.dims3()?;

        let split_heads = |t: Tensor| {
            t.reshape((batches, patches, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split_heads(self.q_proj.forward(x)?)?;
        let k = split_heads(self.k_proj.forward(x)?)?;
        let v = split_heads(self.v_proj.forward(x)?)?;

        let y = {
            let in_dtype = q.dtype();
            let q = q.to_dtype(DType::F32)?;
            let k = k.to_dtype(DType::F32)?;
            let v = v.to_dtype(DType::F32)?;

            let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
            let att = candle_nn::ops::softmax_last_dim(&att)?;
            att.matmul(&v)?.to_dtype(in_dtype)?
        };

        let y = y
            .transpose(1, 2)?
            .reshape((batches, patches, hidden_size))?;
        self.out_proj.forward(&y)
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        for proj in [
            &mut self.q_proj,
            &mut self.k_proj,
            &mut self.v_proj,
            &mut self.out_proj,
        ] {
            *proj = linear_to_device(proj, device)?;
        }
        Ok(())
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
    act: HiddenAct,
}

impl Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.fc1.forward(x)?;
        let x = self.act.forward(&x)?;
        self.fc2.forward(&x)
    }
}

struct EncoderLayer {
    self_attn: Attention,
    layer_norm1: LayerNorm,
    mlp: Mlp,
    layer_norm2: LayerNorm,
}

impl EncoderLayer {
    /*
    vision_tower.vision_model.encoder.layers.0.self_attn.{q,k,v,out}_proj.{weight,bias}
    vision_tower.vision_model.encoder.layers.0.layer_norm1.{weight,bias}
    vision_tower.vision_model.encoder.layers.0.mlp.fc1.{weight,bias}
    vision_tower.vision_model.encoder.layers.0.mlp.fc2.{weight,bias}
    vision_tower.vision_model.encoder.layers.0.layer_norm2.{weight,bias}
     */
    fn load(w: &Weights, c: &ClipVisionConfig, prefix: &str) -> Result<Self> {
        let h = c.hidden_size;
        Ok(Self {
            self_attn: Attention::load(w, c, &format!("{prefix}.self_attn"))?,
            layer_norm1: w.layer_norm(h, c.layer_norm_eps, &format!("{prefix}.layer_norm1"))?,
            mlp: Mlp {
                fc1: w.linear(h, c.intermediate_size, &format!("{prefix}.mlp.fc1"), true)?,
                fc2: w.linear(c.intermediate_size, h, &format!("{prefix}.mlp.fc2"), true)?,
                act: c.hidden_act,
            },
            layer_norm2: w.layer_norm(h, c.layer_norm_eps, &format!("{prefix}.layer_norm2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let residual = x;
        let x = self.layer_norm1.forward(x)?;
        let x = (residual + self.self_attn.forward(&x)?)?;

        let residual = &x;
        let y = self.layer_norm2.forward(&x)?;
        residual + self.mlp.forward(&y)?
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        self.self_attn.to_device(device)?;
        self.layer_norm1 = self.layer_norm1.to_device(device)?;
        self.layer_norm2 = self.layer_norm2.to_device(device)?;
        self.mlp.fc1 = linear_to_device(&self.mlp.fc1, device)?;
        self.mlp.fc2 = linear_to_device(&self.mlp.fc2, device)?;
        Ok(())
    }
}

/// The CLIP ViT image encoder.
///
/// Only the encoder layers needed to reach the selected hidden state are kept, the
/// remaining layers and the post layer norm never contribute to the projector input.
pub struct ClipVisionTower {
    patch_embedding: Conv2d,
    class_embedding: Tensor,
    position_embedding: Tensor,
    pre_layrnorm: LayerNorm,
    layers: Vec<EncoderLayer>,
    patch_size: usize,
    drop_class_token: bool,
}

impl ClipVisionTower {
    /// Load the tower from `vision_tower.vision_model.*`.
    ///
    /// # Arguments
    ///
    /// * `w` - The checkpoint weights.
    /// * `c` - The vision configuration.
    /// * `feature_index` - Index of the hidden state to return, the embeddings being 0.
    /// * `drop_class_token` - Whether to remove the class token from the output.
    pub fn load(
        w: &Weights,
        c: &ClipVisionConfig,
        feature_index: usize,
        drop_class_token: bool,
    ) -> Result<Self> {
        let prefix = "vision_tower.vision_model";
        let h = c.hidden_size;
        let num_positions = c.patches_per_side() * c.patches_per_side() + 1;

        let patch_weight = w.get(
            (h, c.num_channels, c.patch_size, c.patch_size),
            &format!("{prefix}.embeddings.patch_embedding.weight"),
        )?;
        let conv_config = Conv2dConfig {
            stride: c.patch_size,
            ..Default::default()
        };

        let layers = (0..feature_index.min(c.num_hidden_layers))
            .map(|i| EncoderLayer::load(w, c, &format!("{prefix}.encoder.layers.{i}")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patch_embedding: Conv2d::new(patch_weight, None, conv_config),
            class_embedding: w.get(h, &format!("{prefix}.embeddings.class_embedding"))?,
            position_embedding: w.get(
                (num_positions, h),
                &format!("{prefix}.embeddings.position_embedding.weight"),
            )?,
            pre_layrnorm: w.layer_norm(h, c.layer_norm_eps, &format!("{prefix}.pre_layrnorm"))?,
            layers,
            patch_size: c.patch_size,
            drop_class_token,
        })
    }

    /// Encode a batch of frames.
    ///
    /// # Arguments
    ///
    /// * `pixel_values` - Normalized frames with shape `[frames, 3, H, W]`.
    ///
    /// # Returns
    ///
    /// Patch features with shape `[frames, patches, hidden]`.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let dtype = self.class_embedding.dtype();
        let (batches, _channels, height, _width) = pixel_values.dims4()?;
        let hidden = self.class_embedding.dim(0)?;

        // B,3,H,W => B,E,H/P,W/P => B,P,E
        let patches = self
            .patch_embedding
            .forward(&pixel_values.to_dtype(dtype)?)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let num_patches = (height / self.patch_size).pow(2);

        let class = self
            .class_embedding
            .reshape((1, 1, hidden))?
            .broadcast_as((batches, 1, hidden))?;
        let x = Tensor::cat(&[&class, &patches], 1)?;
        let x = x.broadcast_add(&self.position_embedding.narrow(0, 0, num_patches + 1)?)?;

        let mut x = self.pre_layrnorm.forward(&x)?;
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }

        if self.drop_class_token {
            x.narrow(D::Minus2, 1, num_patches)
        } else {
            Ok(x)
        }
    }

    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        self.patch_embedding = Conv2d::new(
            self.patch_embedding.weight().to_device(device)?,
            None,
            *self.patch_embedding.config(),
        );
        self.class_embedding = self.class_embedding.to_device(device)?;
        self.position_embedding = self.position_embedding.to_device(device)?;
        self.pre_layrnorm = self.pre_layrnorm.to_device(device)?;
        for layer in self.layers.iter_mut() {
            layer.to_device(device)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarBuilder;
    use std::collections::HashMap;

    fn tiny_config() -> ClipVisionConfig {
        ClipVisionConfig {
            hidden_size: 8,
            intermediate_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            num_channels: 3,
            image_size: 8,
            patch_size: 4,
            hidden_act: HiddenAct::QuickGelu,
            layer_norm_eps: 1e-5,
        }
    }

    fn tiny_weights(c: &ClipVisionConfig) -> Result<HashMap<String, Tensor>> {
        let device = Device::Cpu;
        let h = c.hidden_size;
        let p = "vision_tower.vision_model";
        let mut map = HashMap::new();
        let mut put = |name: String, shape: &[usize]| -> Result<()> {
            map.insert(name, Tensor::randn(0f32, 0.1, shape, &device)?);
            Ok(())
        };
        put(format!("{p}.embeddings.patch_embedding.weight"), &[h, 3, 4, 4])?;
        put(format!("{p}.embeddings.class_embedding"), &[h])?;
        put(format!("{p}.embeddings.position_embedding.weight"), &[5, h])?;
        put(format!("{p}.pre_layrnorm.weight"), &[h])?;
        put(format!("{p}.pre_layrnorm.bias"), &[h])?;
        for i in 0..c.num_hidden_layers {
            let l = format!("{p}.encoder.layers.{i}");
            for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
                put(format!("{l}.self_attn.{proj}.weight"), &[h, h])?;
                put(format!("{l}.self_attn.{proj}.bias"), &[h])?;
            }
            for norm in ["layer_norm1", "layer_norm2"] {
                put(format!("{l}.{norm}.weight"), &[h])?;
                put(format!("{l}.{norm}.bias"), &[h])?;
            }
            put(format!("{l}.mlp.fc1.weight"), &[16, h])?;
            put(format!("{l}.mlp.fc1.bias"), &[16])?;
            put(format!("{l}.mlp.fc2.weight"), &[h, 16])?;
            put(format!("{l}.mlp.fc2.bias"), &[h])?;
        }
        Ok(map)
    }

    #[test]
    fn test_vision_tower_shapes() -> Result<()> {
        let c = tiny_config();
        let vb = VarBuilder::from_tensors(tiny_weights(&c)?, DType::F32, &Device::Cpu);
        let weights = Weights::new(vb, None);

        let tower = ClipVisionTower::load(&weights, &c, 1, true)?;
        assert_eq!(tower.layers.len(), 1);

        let pixels = Tensor::randn(0f32, 1.0, (3, 3, 8, 8), &Device::Cpu)?;
        let features = tower.forward(&pixels)?;
        assert_eq!(features.dims(), &[3, 4, 8]);

        let tower = ClipVisionTower::load(&weights, &c, 2, false)?;
        assert_eq!(tower.forward(&pixels)?.dims(), &[3, 5, 8]);
        Ok(())
    }
}

use candle_core::{DType, Device, IndexOp, Result, Tensor};
use candle_nn::{rotary_emb::rope, Embedding, Linear, Module};

use super::linear_to_device;
use super::norm::RmsNorm;
use super::weights::Weights;
use crate::config::{HiddenAct, LlamaTextConfig};
use crate::device::DeviceMap;

/// Keys and values of the past positions of one attention layer.
///
/// Tensors have shape `[batch, kv_heads, seq, head_dim]`.
#[derive(Debug, Clone, Default)]
pub struct KvCache {
    kv: Option<(Tensor, Tensor)>,
}

impl KvCache {
    pub fn seq_len(&self) -> usize {
        self.kv
            .as_ref()
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }

    /// Append new keys and values and return the full sequences.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match &self.kv {
            Some((past_k, past_v)) => (
                Tensor::cat(&[past_k, k], 2)?,
                Tensor::cat(&[past_v, v], 2)?,
            ),
            None => (k.clone(), v.clone()),
        };
        self.kv = Some((k.clone(), v.clone()));
        Ok((k, v))
    }

    /// Keep the batch rows listed in `rows`, in that order. Rows may repeat.
    pub fn select_rows(&mut self, rows: &[u32]) -> Result<()> {
        if let Some((k, v)) = &self.kv {
            let idx = Tensor::new(rows, k.device())?;
            self.kv = Some((k.index_select(&idx, 0)?, v.index_select(&idx, 0)?));
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.kv = None;
    }
}

/// Rotary embedding tables for the positions `[offset, offset + seq_len)`.
fn rotary_tables(
    head_dim: usize,
    theta: f64,
    offset: usize,
    seq_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let inv_freq = (0..head_dim)
        .step_by(2)
        .map(|i| 1f32 / (theta as f32).powf(i as f32 / head_dim as f32))
        .collect::<Vec<_>>();
    let inv_freq_len = inv_freq.len();
    let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;

    let positions = Tensor::arange(offset as u32, (offset + seq_len) as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((seq_len, 1))?;
    let freqs = positions.matmul(&inv_freq)?;

    Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
}

fn causal_mask(seq_len: usize, total_len: usize, device: &Device) -> Result<Tensor> {
    let offset = total_len - seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| if j > i + offset { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Tensor::from_vec(mask, (seq_len, total_len), device)
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rope_theta: f64,
    cache: KvCache,
}

impl Attention {
    fn load(w: &Weights, c: &LlamaTextConfig, prefix: &str) -> Result<Self> {
        let h = c.hidden_size;
        let kv = c.num_key_value_heads() * c.head_dim();
        Ok(Self {
            q_proj: w.linear(h, h, &format!("{prefix}.q_proj"), false)?,
            k_proj: w.linear(h, kv, &format!("{prefix}.k_proj"), false)?,
            v_proj: w.linear(h, kv, &format!("{prefix}.v_proj"), false)?,
            o_proj: w.linear(h, h, &format!("{prefix}.o_proj"), false)?,
            num_heads: c.num_attention_heads,
            num_kv_heads: c.num_key_value_heads(),
            head_dim: c.head_dim(),
            rope_theta: c.rope_theta,
            cache: KvCache::default(),
        })
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let (batches, seq_len, hidden_size) = x.dims3()?;
        let index_pos = self.cache.seq_len();

        let q = self
            .q_proj
            .forward(x)?
            .reshape((batches, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((batches, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((batches, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (cos, sin) = rotary_tables(
            self.head_dim,
            self.rope_theta,
            index_pos,
            seq_len,
            q.dtype(),
            q.device(),
        )?;
        let q = rope(&q, &cos, &sin)?;
        let k = rope(&k, &cos, &sin)?;

        let (k, v) = self.cache.append(&k, &v)?;
        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?;

        let y = {
            let in_dtype = q.dtype();
            let q = q.to_dtype(DType::F32)?;
            let k = k.to_dtype(DType::F32)?;
            let v = v.to_dtype(DType::F32)?;

            let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
            let att = if seq_len == 1 {
                att
            } else {
                let mask = causal_mask(seq_len, k.dim(2)?, x.device())?;
                att.broadcast_add(&mask)?
            };
            let att = candle_nn::ops::softmax_last_dim(&att)?;
            att.matmul(&v.contiguous()?)?.to_dtype(in_dtype)?
        };

        let y = y
            .transpose(1, 2)?
            .reshape((batches, seq_len, hidden_size))?;
        self.o_proj.forward(&y)
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        for proj in [
            &mut self.q_proj,
            &mut self.k_proj,
            &mut self.v_proj,
            &mut self.o_proj,
        ] {
            *proj = linear_to_device(proj, device)?;
        }
        self.cache.clear();
        Ok(())
    }
}

struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    act: HiddenAct,
}

impl Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.act.forward(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

struct Block {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
    device: Device,
}

impl Block {
    /*
    language_model.model.layers.0.input_layernorm.weight
    language_model.model.layers.0.self_attn.{q,k,v,o}_proj.weight
    language_model.model.layers.0.post_attention_layernorm.weight
    language_model.model.layers.0.mlp.{gate,up,down}_proj.weight
     */
    fn load(w: &Weights, c: &LlamaTextConfig, prefix: &str) -> Result<Self> {
        let (h, i) = (c.hidden_size, c.intermediate_size);
        Ok(Self {
            input_layernorm: RmsNorm::new(
                w.get(h, &format!("{prefix}.input_layernorm.weight"))?,
                c.rms_norm_eps,
            ),
            self_attn: Attention::load(w, c, &format!("{prefix}.self_attn"))?,
            post_attention_layernorm: RmsNorm::new(
                w.get(h, &format!("{prefix}.post_attention_layernorm.weight"))?,
                c.rms_norm_eps,
            ),
            mlp: Mlp {
                gate_proj: w.linear(h, i, &format!("{prefix}.mlp.gate_proj"), false)?,
                up_proj: w.linear(h, i, &format!("{prefix}.mlp.up_proj"), false)?,
                down_proj: w.linear(i, h, &format!("{prefix}.mlp.down_proj"), false)?,
                act: c.hidden_act,
            },
            device: w.device().clone(),
        })
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let x = x.to_device(&self.device)?;
        let residual = &x;
        let h = self.input_layernorm.forward(&x)?;
        let h = (residual + self.self_attn.forward(&h)?)?;

        let residual = &h;
        let y = self.post_attention_layernorm.forward(&h)?;
        residual + self.mlp.forward(&y)?
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        self.input_layernorm = self.input_layernorm.to_device(device)?;
        self.post_attention_layernorm = self.post_attention_layernorm.to_device(device)?;
        self.self_attn.to_device(device)?;
        self.mlp.gate_proj = linear_to_device(&self.mlp.gate_proj, device)?;
        self.mlp.up_proj = linear_to_device(&self.mlp.up_proj, device)?;
        self.mlp.down_proj = linear_to_device(&self.mlp.down_proj, device)?;
        self.device = device.clone();
        Ok(())
    }
}

/// The Llama decoder of PLLaVA, with its language modeling head.
pub struct LlamaText {
    embed_tokens: Embedding,
    blocks: Vec<Block>,
    norm: RmsNorm,
    lm_head: Linear,
    hidden_size: usize,
    head_device: Device,
}

impl LlamaText {
    /// Load the decoder from `language_model.*`.
    pub fn load(w: &Weights, c: &LlamaTextConfig, vocab_size: usize) -> Result<Self> {
        let h = c.hidden_size;
        let embeddings = w.get((vocab_size, h), "language_model.model.embed_tokens.weight")?;
        let lm_head = if c.tie_word_embeddings {
            Linear::new(embeddings.clone(), None)
        } else {
            w.linear(h, vocab_size, "language_model.lm_head", false)?
        };

        let blocks = (0..c.num_hidden_layers)
            .map(|i| Block::load(w, c, &format!("language_model.model.layers.{i}")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            embed_tokens: Embedding::new(embeddings, h),
            blocks,
            norm: RmsNorm::new(w.get(h, "language_model.model.norm.weight")?, c.rms_norm_eps),
            lm_head,
            hidden_size: h,
            head_device: w.device().clone(),
        })
    }

    /// Embed token ids of shape `[seq]` or `[batch, seq]`.
    pub fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(ids)
    }

    /// Device of the token embeddings.
    pub fn input_device(&self) -> &Device {
        self.embed_tokens.embeddings().device()
    }

    pub fn dtype(&self) -> DType {
        self.embed_tokens.embeddings().dtype()
    }

    /// Number of positions held in the cache.
    pub fn cache_len(&self) -> usize {
        self.blocks
            .first()
            .map(|b| b.self_attn.cache.seq_len())
            .unwrap_or(0)
    }

    /// Run the decoder on new input embeddings.
    ///
    /// # Arguments
    ///
    /// * `embeds` - Embeddings of the new positions with shape `[batch, seq, hidden]`.
    ///
    /// # Returns
    ///
    /// The `F32` logits of the last position with shape `[batch, vocab]`.
    pub fn forward(&mut self, embeds: &Tensor) -> Result<Tensor> {
        let (_, seq_len, hidden) = embeds.dims3()?;
        if hidden != self.hidden_size {
            candle_core::bail!("expected hidden size {}, got {hidden}", self.hidden_size);
        }

        let mut x = embeds.clone();
        for block in self.blocks.iter_mut() {
            x = block.forward(&x)?;
        }
        let x = x.to_device(&self.head_device)?.i((.., seq_len - 1, ..))?;
        let x = self.norm.forward(&x)?;
        self.lm_head.forward(&x)?.to_dtype(DType::F32)
    }

    /// Keep the cached batch rows listed in `rows`.
    pub fn select_rows(&mut self, rows: &[u32]) -> Result<()> {
        for block in self.blocks.iter_mut() {
            block.self_attn.cache.select_rows(rows)?;
        }
        Ok(())
    }

    pub fn clear_cache(&mut self) {
        for block in self.blocks.iter_mut() {
            block.self_attn.cache.clear();
        }
    }

    /// Move every layer to `device`.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        self.dispatch_with(|_| device, device, device)
    }

    /// Spread the layers according to a device map.
    pub fn dispatch(&mut self, map: &DeviceMap) -> Result<()> {
        self.dispatch_with(|i| map.layer(i), map.first(), map.last())
    }

    fn dispatch_with<'d>(
        &mut self,
        layer_device: impl Fn(usize) -> &'d Device,
        first: &Device,
        last: &Device,
    ) -> Result<()> {
        self.embed_tokens = Embedding::new(
            self.embed_tokens.embeddings().to_device(first)?,
            self.hidden_size,
        );
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.to_device(layer_device(i))?;
        }
        self.norm = self.norm.to_device(last)?;
        self.lm_head = linear_to_device(&self.lm_head, last)?;
        self.head_device = last.clone();
        Ok(())
    }
}

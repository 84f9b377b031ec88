use candle_core::{Device, Result, Tensor};
use candle_nn::{Linear, Module};

use super::linear_to_device;
use super::weights::Weights;
use crate::config::{HiddenAct, PllavaConfig, PoolingMethod};

/// Bin boundaries of adaptive pooling, `[start, end)` for every output cell.
///
/// Cell `i` covers `floor(i * input / output)` to `ceil((i + 1) * input / output)`. Bins
/// overlap when the input does not divide evenly and repeat input cells when the
/// output is larger than the input.
pub fn adaptive_bins(input: usize, output: usize) -> Vec<(usize, usize)> {
    (0..output)
        .map(|i| {
            let start = i * input / output;
            let end = ((i + 1) * input).div_ceil(output);
            (start, end)
        })
        .collect()
}

/// Adaptive pooling of a single dimension.
pub fn adaptive_pool_dim(
    x: &Tensor,
    dim: usize,
    output: usize,
    method: PoolingMethod,
) -> Result<Tensor> {
    let input = x.dim(dim)?;
    if input == output {
        return Ok(x.clone());
    }

    let cells = adaptive_bins(input, output)
        .into_iter()
        .map(|(start, end)| {
            let bin = x.narrow(dim, start, end - start)?;
            match method {
                PoolingMethod::Avg => bin.mean_keepdim(dim),
                PoolingMethod::Max => bin.max_keepdim(dim),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&cells, dim)
}

/// Adaptive 3D pooling over the dimensions 1, 2 and 3 of a `[N, T, H, W, C]` tensor.
///
/// Adaptive bins are boxes, so pooling one axis after the other gives the same result
/// as pooling every box at once.
pub fn adaptive_pool3d(x: &Tensor, output: [usize; 3], method: PoolingMethod) -> Result<Tensor> {
    let x = adaptive_pool_dim(x, 1, output[0], method)?;
    let x = adaptive_pool_dim(&x, 2, output[1], method)?;
    adaptive_pool_dim(&x, 3, output[2], method)
}

/// Projects vision features into the language embedding space and pools them over
/// space and time.
pub struct Projector {
    linear_1: Linear,
    linear_2: Linear,
    act: HiddenAct,
    num_frames: usize,
    frame_shape: [usize; 2],
    pooling: Option<([usize; 3], PoolingMethod)>,
}

impl Projector {
    pub fn load(w: &Weights, config: &PllavaConfig) -> Result<Self> {
        let vision_hidden = config.vision_config.hidden_size;
        let text_hidden = config.text_config.hidden_size;
        Ok(Self {
            linear_1: w.linear(vision_hidden, text_hidden, "multi_modal_projector.linear_1", true)?,
            linear_2: w.linear(text_hidden, text_hidden, "multi_modal_projector.linear_2", true)?,
            act: config.projector_hidden_act,
            num_frames: config.num_frames,
            frame_shape: config.frame_shape,
            pooling: config
                .use_pooling
                .then_some((config.pooling_shape, config.pooling_method)),
        })
    }

    /// Project and pool the features of consecutive frame groups.
    ///
    /// # Arguments
    ///
    /// * `features` - Vision features with shape `[groups * num_frames, h * w, vision_hidden]`.
    ///
    /// # Returns
    ///
    /// One embedding sequence per group with shape `[groups, T' * h' * w', text_hidden]`.
    ///
    /// # Tensor Transformations
    ///
    /// 1. `G*T,HW,E` → `G*T,HW,D` (linear, activation, linear)
    /// 2. `G*T,HW,D` → `G,T,H,W,D` (split groups and the frame grid)
    /// 3. `G,T,H,W,D` → `G,T',H',W',D` (adaptive pooling)
    /// 4. `G,T',H',W',D` → `G,T'H'W',D`
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let (frames, patches, _) = features.dims3()?;
        let [h, w] = self.frame_shape;
        if patches != h * w {
            candle_core::bail!("expected {h}x{w} patches per frame, got {patches}");
        }
        if frames % self.num_frames != 0 {
            candle_core::bail!(
                "{frames} frames cannot be grouped by {} frames",
                self.num_frames
            );
        }
        let groups = frames / self.num_frames;

        let x = self.linear_1.forward(features)?;
        let x = self.act.forward(&x)?;
        let x = self.linear_2.forward(&x)?;
        let hidden = x.dim(2)?;

        let x = x.reshape((groups, self.num_frames, h, w, hidden))?;
        let x = match self.pooling {
            Some((shape, method)) => adaptive_pool3d(&x, shape, method)?,
            None => x,
        };
        let (groups, t, h, w, hidden) = x.dims5()?;
        x.reshape((groups, t * h * w, hidden))
    }

    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        self.linear_1 = linear_to_device(&self.linear_1, device)?;
        self.linear_2 = linear_to_device(&self.linear_2, device)?;
        Ok(())
    }
}

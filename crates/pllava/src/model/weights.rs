use candle_core::{DType, Device, Result, Shape, Tensor};
use candle_nn::{Linear, VarBuilder};
use log::debug;

use super::lora::{adapter_candidates, merge_lora, weight_candidates, LoraConfig};
use super::norm::LayerNorm;

/// Named access to the checkpoint tensors.
///
/// Resolves the alternative names a parameter may be saved under and folds LoRA
/// adapters into the weights they target.
pub struct Weights<'a> {
    vb: VarBuilder<'a>,
    lora: Option<LoraConfig>,
}

impl<'a> Weights<'a> {
    pub fn new(vb: VarBuilder<'a>, lora: Option<LoraConfig>) -> Self {
        Self { vb, lora }
    }

    pub fn dtype(&self) -> DType {
        self.vb.dtype()
    }

    pub fn device(&self) -> &Device {
        self.vb.device()
    }

    fn resolve(&self, candidates: &[String]) -> Option<String> {
        candidates
            .iter()
            .find(|name| self.vb.contains_tensor(name))
            .cloned()
    }

    /// Load the tensor `name` and check its shape.
    pub fn get(&self, shape: impl Into<Shape>, name: &str) -> Result<Tensor> {
        let candidates = weight_candidates(name);
        // an unresolved name goes through the builder to get its error message
        let resolved = self.resolve(&candidates).unwrap_or_else(|| name.to_string());
        self.vb.get(shape, &resolved)
    }

    /// Load the linear layer `module` mapping `in_dim` to `out_dim` features.
    pub fn linear(&self, in_dim: usize, out_dim: usize, module: &str, bias: bool) -> Result<Linear> {
        let mut weight = self.get((out_dim, in_dim), &format!("{module}.weight"))?;
        let bias = if bias {
            Some(self.get(out_dim, &format!("{module}.bias"))?)
        } else {
            None
        };

        if let Some(lora) = self.lora.as_ref().filter(|l| l.targets(module)) {
            let lora_a = self.resolve(&adapter_candidates(module, "lora_A"));
            let lora_b = self.resolve(&adapter_candidates(module, "lora_B"));
            match (lora_a, lora_b) {
                (Some(a), Some(b)) => {
                    let a = self.vb.get((lora.rank, in_dim), &a)?;
                    let b = self.vb.get((out_dim, lora.rank), &b)?;
                    weight = merge_lora(&weight, &a, &b, lora.scaling())?;
                }
                _ => debug!("No LoRA adapter found for {module}"),
            }
        }

        Ok(Linear::new(weight, bias))
    }

    /// Load the layer norm `module` over `size` features.
    pub fn layer_norm(&self, size: usize, eps: f64, module: &str) -> Result<LayerNorm> {
        let weight = self.get(size, &format!("{module}.weight"))?;
        let bias = self.get(size, &format!("{module}.bias"))?;
        Ok(LayerNorm::new(weight, bias, eps))
    }
}

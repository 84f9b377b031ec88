use candle_core::{DType, Result, Tensor};

/// Low-rank adapters applied to the language model attention.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraConfig {
    pub rank: usize,
    pub alpha: f64,
    pub target_modules: Vec<String>,
}

impl LoraConfig {
    /// Adapters of rank 128 on the query and value projections.
    pub fn new(alpha: f64) -> Self {
        Self {
            rank: 128,
            alpha,
            target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
        }
    }

    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    /// Whether the linear layer at `module_path` carries an adapter.
    pub fn targets(&self, module_path: &str) -> bool {
        let name = module_path.rsplit('.').next().unwrap_or(module_path);
        self.target_modules.iter().any(|m| m == name)
    }
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self::new(32.0)
    }
}

/// Fold an adapter into its base weight: `W + scaling * B @ A`.
///
/// `base` is `(out, in)`, `lora_a` is `(rank, in)` and `lora_b` is `(out, rank)`. The
/// product is computed in `F32` and cast back to the dtype of `base`.
pub fn merge_lora(base: &Tensor, lora_a: &Tensor, lora_b: &Tensor, scaling: f64) -> Result<Tensor> {
    let dtype = base.dtype();
    let delta = lora_b
        .to_dtype(DType::F32)?
        .matmul(&lora_a.to_dtype(DType::F32)?)?;
    let merged = (base.to_dtype(DType::F32)? + (delta * scaling)?)?;
    merged.to_dtype(dtype)
}

/// Prefix PEFT puts in front of the wrapped language model parameters.
const PEFT_PREFIX: &str = "language_model.base_model.model.";

/// Names a language model parameter can be stored under, most specific first.
///
/// A checkpoint saved from a PEFT wrapped model stores the parameters under
/// `language_model.base_model.model.*`, and the adapted linear layers under
/// `*.base_layer.weight`.
pub fn weight_candidates(name: &str) -> Vec<String> {
    let Some(rest) = name.strip_prefix("language_model.") else {
        return vec![name.to_string()];
    };
    let peft = format!("{PEFT_PREFIX}{rest}");

    let mut candidates = vec![];
    for stem in [peft, name.to_string()] {
        if let Some(module) = stem.strip_suffix(".weight") {
            candidates.push(format!("{module}.base_layer.weight"));
        } else if let Some(module) = stem.strip_suffix(".bias") {
            candidates.push(format!("{module}.base_layer.bias"));
        }
        candidates.push(stem.to_string());
    }
    candidates
}

/// Names the `A` or `B` adapter of a linear layer can be stored under.
///
/// `module` is the layer path without the parameter name, e.g.
/// `language_model.model.layers.0.self_attn.q_proj`, and `which` is `"lora_A"` or
/// `"lora_B"`.
pub fn adapter_candidates(module: &str, which: &str) -> Vec<String> {
    let stems = match module.strip_prefix("language_model.") {
        Some(rest) => vec![format!("{PEFT_PREFIX}{rest}"), module.to_string()],
        None => vec![module.to_string()],
    };
    stems
        .iter()
        .flat_map(|stem| {
            [
                format!("{stem}.{which}.default.weight"),
                format!("{stem}.{which}.weight"),
            ]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_merge_lora() -> Result<()> {
        let device = Device::Cpu;
        let base = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device)?;
        // rank 1 adapter
        let lora_a = Tensor::new(&[[1f32, 2.0]], &device)?;
        let lora_b = Tensor::new(&[[3f32], [4.0]], &device)?;

        let merged = merge_lora(&base, &lora_a, &lora_b, 0.5)?.to_vec2::<f32>()?;
        assert_eq!(merged, vec![vec![2.5, 3.0], vec![2.0, 5.0]]);
        Ok(())
    }

    #[test]
    fn test_merge_lora_keeps_dtype() -> Result<()> {
        let device = Device::Cpu;
        let base = Tensor::zeros((4, 3), DType::BF16, &device)?;
        let lora_a = Tensor::ones((2, 3), DType::BF16, &device)?;
        let lora_b = Tensor::ones((4, 2), DType::BF16, &device)?;

        let merged = merge_lora(&base, &lora_a, &lora_b, 0.25)?;
        assert_eq!(merged.dtype(), DType::BF16);
        let values = merged.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|&v| v == 0.5));
        Ok(())
    }

    #[test]
    fn test_lora_config() {
        let config = LoraConfig::new(32.0);
        approx::assert_relative_eq!(config.scaling(), 0.25);
        assert!(config.targets("language_model.model.layers.3.self_attn.q_proj"));
        assert!(config.targets("language_model.model.layers.3.self_attn.v_proj"));
        assert!(!config.targets("language_model.model.layers.3.self_attn.k_proj"));
    }

    #[test]
    fn test_weight_candidates() {
        assert_eq!(
            weight_candidates("language_model.model.layers.0.self_attn.q_proj.weight"),
            vec![
                "language_model.base_model.model.model.layers.0.self_attn.q_proj.base_layer.weight",
                "language_model.base_model.model.model.layers.0.self_attn.q_proj.weight",
                "language_model.model.layers.0.self_attn.q_proj.base_layer.weight",
                "language_model.model.layers.0.self_attn.q_proj.weight",
            ]
        );
        assert_eq!(
            weight_candidates("multi_modal_projector.linear_1.bias"),
            vec!["multi_modal_projector.linear_1.bias"]
        );
    }

    #[test]
    fn test_adapter_candidates() {
        let candidates =
            adapter_candidates("language_model.model.layers.1.self_attn.v_proj", "lora_B");
        assert_eq!(
            candidates[0],
            "language_model.base_model.model.model.layers.1.self_attn.v_proj.lora_B.default.weight"
        );
        assert_eq!(candidates.len(), 4);
        assert_eq!(
            candidates[3],
            "language_model.model.layers.1.self_attn.v_proj.lora_B.weight"
        );
    }
}

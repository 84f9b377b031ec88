use candle_core::{IndexOp, Tensor, D};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::PllavaError;

/// Score given to the beams that are copies of the first one before the first step.
const INACTIVE_BEAM_SCORE: f32 = -1e9;

/// Parameters of the answer generation.
#[derive(Debug, Clone, Copy)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub num_beams: usize,
    /// Minimum length of the full sequence, prompt included.
    pub min_length: usize,
    pub top_p: f64,
    pub repetition_penalty: f32,
    pub length_penalty: f64,
    pub temperature: f64,
    pub do_sample: bool,
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 200,
            num_beams: 1,
            min_length: 1,
            top_p: 1.0,
            repetition_penalty: 1.0,
            length_penalty: 1.0,
            temperature: 1.0,
            do_sample: true,
            seed: 42,
        }
    }
}

impl GenerationConfig {
    fn samples(&self) -> bool {
        self.do_sample && self.temperature > 0.0
    }
}

/// An autoregressive model seen from the search.
///
/// Every call returns `F32` logits of the next token, one row per running sequence.
pub trait Decoder {
    /// Consume the prompt. Returns logits with shape `[1, vocab]`.
    fn prefill(&mut self) -> Result<Tensor, PllavaError>;

    /// Append one token to every running sequence. Returns logits with shape
    /// `[tokens.len(), vocab]`.
    fn step(&mut self, tokens: &[u32]) -> Result<Tensor, PllavaError>;

    /// Rebuild the running sequences from the rows `rows` of the current ones.
    fn reorder(&mut self, rows: &[usize]) -> Result<(), PllavaError>;
}

/// Generate the continuation of `prompt`.
///
/// # Arguments
///
/// * `decoder` - The model, positioned right before the prompt.
/// * `prompt` - The prompt token ids, used for the length rules and the repetition penalty.
/// * `eos` - Token ids ending the generation.
/// * `config` - The generation parameters.
///
/// # Returns
///
/// The generated token ids, ending with the end-of-sequence token when one was produced.
pub fn generate<M: Decoder + ?Sized>(
    decoder: &mut M,
    prompt: &[u32],
    eos: &[u32],
    config: &GenerationConfig,
) -> Result<Vec<u32>, PllavaError> {
    if config.max_new_tokens == 0 {
        return Ok(vec![]);
    }
    let tokens = if config.num_beams > 1 {
        beam_search(decoder, prompt, eos, config)?
    } else {
        sample(decoder, prompt, eos, config)?
    };
    debug!("Generated {} tokens", tokens.len());
    Ok(tokens)
}

fn ban_tokens(row: &mut [f32], tokens: &[u32]) {
    for &t in tokens {
        if let Some(v) = row.get_mut(t as usize) {
            *v = f32::NEG_INFINITY;
        }
    }
}

fn check_logits(row: &[f32]) -> Result<(), PllavaError> {
    if row.iter().any(|v| v.is_nan()) || !row.iter().any(|v| v.is_finite()) {
        return Err(PllavaError::InvalidLogits(
            "No valid logits found - all values may be NaN or invalid".to_string(),
        ));
    }
    Ok(())
}

/// Greedy decoding or multinomial sampling of a single sequence.
fn sample<M: Decoder + ?Sized>(
    decoder: &mut M,
    prompt: &[u32],
    eos: &[u32],
    config: &GenerationConfig,
) -> Result<Vec<u32>, PllavaError> {
    let mut processor = if config.samples() {
        LogitsProcessor::new(config.seed, Some(config.temperature), Some(config.top_p))
    } else {
        LogitsProcessor::from_sampling(config.seed, Sampling::ArgMax)
    };

    let mut context = prompt.to_vec();
    let mut generated = Vec::with_capacity(config.max_new_tokens);
    let mut logits = decoder.prefill()?;

    for _ in 0..config.max_new_tokens {
        let mut row = logits.i(0)?;
        if config.repetition_penalty != 1.0 {
            row = candle_transformers::utils::apply_repeat_penalty(
                &row,
                config.repetition_penalty,
                &context,
            )?;
        }
        let mut values = row.to_vec1::<f32>()?;
        if context.len() < config.min_length {
            ban_tokens(&mut values, eos);
        }
        check_logits(&values)?;

        let vocab = values.len();
        let token = processor.sample(&Tensor::from_vec(values, vocab, row.device())?)?;
        generated.push(token);
        context.push(token);
        if eos.contains(&token) {
            break;
        }
        if generated.len() < config.max_new_tokens {
            logits = decoder.step(&[token])?;
        }
    }

    Ok(generated)
}

/// Finished beam search hypotheses, keeping the `num_beams` best.
struct BeamHypotheses {
    num_beams: usize,
    length_penalty: f64,
    beams: Vec<(f64, Vec<u32>)>,
}

impl BeamHypotheses {
    fn new(num_beams: usize, length_penalty: f64) -> Self {
        Self {
            num_beams,
            length_penalty,
            beams: Vec::with_capacity(num_beams + 1),
        }
    }

    fn worst_score(&self) -> f64 {
        self.beams
            .iter()
            .map(|(s, _)| *s)
            .fold(f64::INFINITY, f64::min)
    }

    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32, length: usize) {
        let score = sum_logprobs as f64 / (length as f64).powf(self.length_penalty);
        if self.beams.len() < self.num_beams || score > self.worst_score() {
            self.beams.push((score, tokens));
            if self.beams.len() > self.num_beams {
                let worst = self
                    .beams
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1 .0.total_cmp(&b.1 .0))
                    .map(|(i, _)| i);
                if let Some(i) = worst {
                    self.beams.remove(i);
                }
            }
        }
    }

    /// Whether no running beam can improve on the finished hypotheses anymore.
    fn is_done(&self, best_sum_logprobs: f32, cur_len: usize) -> bool {
        if self.beams.len() < self.num_beams {
            return false;
        }
        let best_possible = best_sum_logprobs as f64 / (cur_len as f64).powf(self.length_penalty);
        self.worst_score() >= best_possible
    }

    fn best(self) -> Option<Vec<u32>> {
        self.beams
            .into_iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, tokens)| tokens)
    }
}

/// Temperature and nucleus warping of one row of scores.
fn warp(row: &mut [f32], temperature: f64, top_p: f64, min_keep: usize) {
    if temperature != 1.0 {
        let t = temperature as f32;
        row.iter_mut().for_each(|v| *v /= t);
    }
    if top_p >= 1.0 {
        return;
    }

    let mut order = (0..row.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
    let max = row[order[0]];
    let total: f32 = row.iter().map(|v| (v - max).exp()).sum();

    let mut cumulative = 0.0f32;
    for (rank, &idx) in order.iter().enumerate() {
        let prob = (row[idx] - max).exp() / total;
        if rank >= min_keep && cumulative >= top_p as f32 {
            row[idx] = f32::NEG_INFINITY;
        }
        cumulative += prob;
    }
}

/// Indices of the `k` largest scores, best first.
fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut order = (0..scores.len()).collect::<Vec<_>>();
    let k = k.min(order.len());
    if k < order.len() {
        order.select_nth_unstable_by(k, |&a, &b| scores[b].total_cmp(&scores[a]));
        order.truncate(k);
    }
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    order.into_iter().map(|i| (i, scores[i])).collect()
}

/// Draw `k` distinct indices with probabilities `softmax(scores)`, best score first.
fn sample_top_k(scores: &[f32], k: usize, rng: &mut StdRng) -> Vec<(usize, f32)> {
    let keys = scores
        .iter()
        .map(|&s| {
            let u = rng.random::<f32>().max(f32::MIN_POSITIVE);
            s - (-u.ln()).ln()
        })
        .collect::<Vec<_>>();
    let mut picked = top_k(&keys, k)
        .into_iter()
        .map(|(i, _)| (i, scores[i]))
        .collect::<Vec<_>>();
    picked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    picked
}

/// Beam search, optionally with sampling of the candidates.
fn beam_search<M: Decoder + ?Sized>(
    decoder: &mut M,
    prompt: &[u32],
    eos: &[u32],
    config: &GenerationConfig,
) -> Result<Vec<u32>, PllavaError> {
    let n = config.num_beams;
    let sampling = config.samples();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut hypotheses = BeamHypotheses::new(n, config.length_penalty);

    let logits = decoder.prefill()?;
    let mut logits = logits.repeat((n, 1))?;
    decoder.reorder(&vec![0; n])?;

    let mut beams: Vec<Vec<u32>> = vec![vec![]; n];
    let mut beam_scores = std::iter::once(0.0)
        .chain(std::iter::repeat(INACTIVE_BEAM_SCORE))
        .take(n)
        .collect::<Vec<f32>>();
    let mut done = false;

    for step in 0..config.max_new_tokens {
        let cur_len = prompt.len() + step;
        let logprobs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        let vocab = logprobs.dim(1)?;

        let mut scores = Vec::with_capacity(n * vocab);
        for (b, beam) in beams.iter().enumerate() {
            let mut row = logprobs.i(b)?;
            if config.repetition_penalty != 1.0 {
                let context = [prompt, beam.as_slice()].concat();
                row = candle_transformers::utils::apply_repeat_penalty(
                    &row,
                    config.repetition_penalty,
                    &context,
                )?;
            }
            let mut row = row.to_vec1::<f32>()?;
            if cur_len < config.min_length {
                ban_tokens(&mut row, eos);
            }
            check_logits(&row)?;
            row.iter_mut().for_each(|v| *v += beam_scores[b]);
            if sampling {
                warp(&mut row, config.temperature, config.top_p, 2);
            }
            scores.extend(row);
        }

        let candidates = if sampling {
            sample_top_k(&scores, 2 * n, &mut rng)
        } else {
            top_k(&scores, 2 * n)
        };

        let mut next = Vec::with_capacity(n);
        for (rank, (flat, score)) in candidates.into_iter().enumerate() {
            let (b, token) = (flat / vocab, (flat % vocab) as u32);
            if eos.contains(&token) {
                if rank < n {
                    let mut tokens = beams[b].clone();
                    tokens.push(token);
                    hypotheses.add(tokens, score, cur_len);
                }
            } else {
                next.push((b, token, score));
            }
            if next.len() == n {
                break;
            }
        }
        // only possible with a tiny vocabulary made of end tokens
        while next.len() < n {
            let (b, token, _) = next.last().copied().unwrap_or((0, eos.first().copied().unwrap_or(0), 0.0));
            next.push((b, token, f32::NEG_INFINITY));
        }

        let best = next.iter().map(|c| c.2).fold(f32::NEG_INFINITY, f32::max);
        done = hypotheses.is_done(best, cur_len);

        beams = next
            .iter()
            .map(|&(b, token, _)| {
                let mut tokens = beams[b].clone();
                tokens.push(token);
                tokens
            })
            .collect();
        beam_scores = next.iter().map(|c| c.2).collect();

        if done || step + 1 == config.max_new_tokens {
            break;
        }
        let rows = next.iter().map(|c| c.0).collect::<Vec<_>>();
        let tokens = next.iter().map(|c| c.1).collect::<Vec<_>>();
        decoder.reorder(&rows)?;
        logits = decoder.step(&tokens)?;
    }

    if !done {
        for (tokens, score) in beams.into_iter().zip(beam_scores) {
            let length = prompt.len() + tokens.len();
            hypotheses.add(tokens, score, length);
        }
    }

    hypotheses
        .best()
        .ok_or_else(|| PllavaError::InvalidLogits("beam search produced no hypothesis".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    const EOS: u32 = 0;
    const A: u32 = 1;
    const B: u32 = 2;
    const C: u32 = 3;
    const VOCAB: usize = 5;

    /// A first order Markov chain over five tokens.
    ///
    /// From C the chain prefers A, but A rarely ends while B almost always does, so
    /// the best finished sequence goes through B.
    struct Markov {
        last: Vec<u32>,
        steps: usize,
    }

    impl Markov {
        fn new() -> Self {
            Self {
                last: vec![],
                steps: 0,
            }
        }

        fn next_probs(token: u32) -> [f32; VOCAB] {
            match token {
                C => [0.0, 0.6, 0.4, 0.0, 0.0],
                A => [0.3, 0.25, 0.24, 0.0, 0.21],
                B => [0.99, 0.004, 0.003, 0.002, 0.001],
                _ => [1.0, 0.0, 0.0, 0.0, 0.0],
            }
        }

        fn logits(&self) -> Result<Tensor, PllavaError> {
            let data = self
                .last
                .iter()
                .flat_map(|&t| Self::next_probs(t))
                .map(|p| p.max(1e-9).ln())
                .collect::<Vec<_>>();
            Ok(Tensor::from_vec(data, (self.last.len(), VOCAB), &Device::Cpu)?)
        }
    }

    impl Decoder for Markov {
        fn prefill(&mut self) -> Result<Tensor, PllavaError> {
            self.last = vec![C];
            self.logits()
        }

        fn step(&mut self, tokens: &[u32]) -> Result<Tensor, PllavaError> {
            assert_eq!(tokens.len(), self.last.len());
            self.steps += 1;
            self.last = tokens.to_vec();
            self.logits()
        }

        fn reorder(&mut self, rows: &[usize]) -> Result<(), PllavaError> {
            self.last = rows.iter().map(|&r| self.last[r]).collect();
            Ok(())
        }
    }

    fn deterministic(num_beams: usize) -> GenerationConfig {
        GenerationConfig {
            num_beams,
            do_sample: false,
            length_penalty: 0.0,
            max_new_tokens: 10,
            ..Default::default()
        }
    }

    fn run(config: &GenerationConfig) -> Result<Vec<u32>, PllavaError> {
        generate(&mut Markov::new(), &[C], &[EOS], config)
    }

    #[test]
    fn test_greedy_stops_at_eos() -> Result<(), PllavaError> {
        assert_eq!(run(&deterministic(1))?, vec![A, EOS]);
        Ok(())
    }

    #[test]
    fn test_beam_search_beats_greedy() -> Result<(), PllavaError> {
        // greedy: 0.6 * 0.3 = 0.18, beam: 0.4 * 0.99 = 0.396
        assert_eq!(run(&deterministic(2))?, vec![B, EOS]);
        Ok(())
    }

    #[test]
    fn test_min_length_bans_eos() -> Result<(), PllavaError> {
        let config = GenerationConfig {
            min_length: 3,
            ..deterministic(1)
        };
        assert_eq!(run(&config)?, vec![A, A, EOS]);
        Ok(())
    }

    #[test]
    fn test_repetition_penalty() -> Result<(), PllavaError> {
        let config = GenerationConfig {
            min_length: 3,
            repetition_penalty: 2.0,
            ..deterministic(1)
        };
        assert_eq!(run(&config)?, vec![A, B, EOS]);
        Ok(())
    }

    #[test]
    fn test_max_new_tokens() -> Result<(), PllavaError> {
        let config = GenerationConfig {
            max_new_tokens: 1,
            ..deterministic(1)
        };
        let mut markov = Markov::new();
        assert_eq!(generate(&mut markov, &[C], &[EOS], &config)?, vec![A]);
        assert_eq!(markov.steps, 0);

        let config = GenerationConfig {
            max_new_tokens: 0,
            ..deterministic(2)
        };
        assert!(run(&config)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_sampling_is_seeded() -> Result<(), PllavaError> {
        for num_beams in [1, 3] {
            let config = GenerationConfig {
                num_beams,
                temperature: 0.8,
                top_p: 0.9,
                seed: 7,
                ..Default::default()
            };
            let first = run(&config)?;
            assert_eq!(first, run(&config)?);
            assert!(!first.is_empty() && first.len() <= config.max_new_tokens);
        }
        Ok(())
    }

    #[test]
    fn test_warp_keeps_the_nucleus() {
        let mut row = [0.5f32.ln(), 0.3f32.ln(), 0.15f32.ln(), 0.05f32.ln()];
        warp(&mut row, 1.0, 0.7, 1);
        assert!(row[0].is_finite() && row[1].is_finite());
        assert_eq!(row[2], f32::NEG_INFINITY);
        assert_eq!(row[3], f32::NEG_INFINITY);
    }

    #[test]
    fn test_top_k_orders_scores() {
        let top = top_k(&[0.1, 0.7, -1.0, 0.7, 0.3], 3);
        assert_eq!(top, vec![(1, 0.7), (3, 0.7), (4, 0.3)]);
    }
}

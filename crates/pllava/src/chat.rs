use std::path::Path;

use log::{debug, info};
use pllava_video::{load_video, VideoClip};

use crate::conversation::Conversation;
use crate::error::PllavaError;
use crate::generation::{generate, GenerationConfig};
use crate::model::PllavaModel;
use crate::processor::PllavaProcessor;

/// Length of the shorter side of the sampled frames.
pub const RESOLUTION: u32 = 336;

/// Reply of the model to the last question.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    /// Generated token ids, the end-of-sequence token included when produced.
    pub tokens: Vec<u32>,
}

/// A chat about videos.
pub trait VideoChat {
    /// Sample a video, keep its frames in `img_list` and announce it in `conv`.
    ///
    /// Returns `"Received."`.
    fn upload_video(
        &mut self,
        path: &Path,
        conv: &mut Conversation,
        img_list: &mut Vec<VideoClip>,
        num_segments: usize,
    ) -> Result<String, PllavaError>;

    /// Set the system prompt and append the question.
    fn ask(&mut self, text: &str, conv: &mut Conversation, system: &str) -> Result<(), PllavaError> {
        ask_question(conv, text, system);
        Ok(())
    }

    /// Generate the answer to the dialogue and record it in `conv`.
    fn answer(
        &mut self,
        conv: &mut Conversation,
        img_list: &[VideoClip],
        config: &GenerationConfig,
    ) -> Result<Answer, PllavaError>;
}

/// Load a video and add its sampling message as a media query.
pub fn upload_video(
    path: &Path,
    conv: &mut Conversation,
    img_list: &mut Vec<VideoClip>,
    num_segments: usize,
) -> Result<String, PllavaError> {
    let (clip, msg) = load_video(path, num_segments, RESOLUTION)?;
    info!("Loaded {} frames from {}", clip.len(), path.display());
    img_list.push(clip);
    conv.user_query(&msg, None, None, true);
    Ok("Received.".to_string())
}

/// Set the system prompt and append a question with the template prompts.
pub fn ask_question(conv: &mut Conversation, text: &str, system: &str) {
    conv.system = system.to_string();
    let pre = conv.pre_query_prompt.clone();
    let post = conv.post_query_prompt.clone();
    conv.user_query(text, pre.as_deref(), post.as_deref(), false);
    if let Some(answer_prompt) = conv.answer_prompt.clone() {
        conv.assistant_response(&answer_prompt);
    }
}

/// Add media queries until the prompt holds one media token per media group.
pub fn pad_media_tokens(conv: &mut Conversation, groups: usize) {
    while conv.media_token_count() < groups {
        conv.user_query("", None, None, true);
    }
}

/// Extract the answer from decoded text.
///
/// Keeps the text after the last `split_tag`, drops what follows a `###` stop sign
/// and removes the closing separator. Works on the generated text alone as well as
/// on the whole decoded dialogue.
pub fn postprocess_answer(output: &str, split_tag: &str, ending: &str) -> String {
    let answer = output.rsplit(split_tag).next().unwrap_or(output);
    let answer = answer.split("###").next().unwrap_or(answer);
    answer.trim().trim_end_matches(ending.trim()).trim().to_string()
}

/// Decode the generated tokens into the answer of the assistant.
pub fn decode_answer(
    processor: &PllavaProcessor,
    tokens: &[u32],
    conv: &Conversation,
) -> Result<String, PllavaError> {
    let output = processor.decode(tokens, true)?;
    debug!("Generated: {output:?}");
    Ok(postprocess_answer(
        &output,
        conv.answer_split_tag(),
        conv.answer_ending(),
    ))
}

/// Video chat backed by a PLLaVA model.
pub struct ChatPllava {
    model: PllavaModel,
    processor: PllavaProcessor,
}

impl ChatPllava {
    pub fn new(model: PllavaModel, processor: PllavaProcessor) -> Self {
        Self { model, processor }
    }

    /// Token ids ending the answer.
    fn eos_ids(&self, conv: &Conversation) -> Vec<u32> {
        let mut eos = self
            .model
            .config()
            .text_config
            .eos_token_id
            .as_ref()
            .map(|ids| ids.to_vec())
            .unwrap_or_default();
        let named = ["</s>", conv.answer_ending().trim()];
        for id in named.into_iter().filter_map(|t| self.processor.token_id(t)) {
            if !eos.contains(&id) {
                eos.push(id);
            }
        }
        eos
    }
}

impl VideoChat for ChatPllava {
    fn upload_video(
        &mut self,
        path: &Path,
        conv: &mut Conversation,
        img_list: &mut Vec<VideoClip>,
        num_segments: usize,
    ) -> Result<String, PllavaError> {
        upload_video(path, conv, img_list, num_segments)
    }

    fn answer(
        &mut self,
        conv: &mut Conversation,
        img_list: &[VideoClip],
        config: &GenerationConfig,
    ) -> Result<Answer, PllavaError> {
        let frames = img_list.iter().map(VideoClip::len).sum::<usize>();
        if frames == 0 {
            return Err(PllavaError::EmptyMedia(
                "upload a video before asking for an answer".to_string(),
            ));
        }
        let num_frames = self.model.config().num_frames;
        if frames % num_frames != 0 {
            return Err(PllavaError::FrameCountMismatch { frames, num_frames });
        }
        pad_media_tokens(conv, frames / num_frames);

        let prompt = conv.get_prompt();
        debug!("Prompt: {prompt:?}");
        let ids = self.processor.encode(&prompt)?;

        let pixel_values = self
            .processor
            .preprocess(img_list, self.model.dtype(), self.model.device())?;
        let media = self.model.encode_media(&pixel_values)?;
        let embeds = self.model.embed_prompt(&ids, Some(&media))?;

        let eos = self.eos_ids(conv);
        let tokens = {
            let mut decoder = self.model.decoder(embeds);
            generate(&mut decoder, &ids, &eos, config)?
        };
        self.model.clear_cache();

        let text = decode_answer(&self.processor, &tokens, conv)?;
        conv.set_answer(&text);

        Ok(Answer { text, tokens })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ImageProcessorConfig;
    use image::{Rgb, RgbImage};
    use serde_json::json;
    use std::str::FromStr;
    use tokenizers::Tokenizer;

    const SYSTEM: &str = "You are a helpful video assistant.\n\
        ### INSTRUCTIONS:\n\
        1. Answer based on the video.\n";

    const SPECIAL_TOKENS: [&str; 3] = ["</s>", "<|im_start|>", "<|im_end|>"];

    /// A whitespace word-level processor whose vocabulary covers `text`.
    fn word_processor(text: &str) -> Result<PllavaProcessor, PllavaError> {
        let plain = SPECIAL_TOKENS
            .iter()
            .fold(text.to_string(), |acc, t| acc.replace(t, " "));
        let mut vocab = serde_json::Map::new();
        for word in SPECIAL_TOKENS
            .into_iter()
            .chain(["<unk>"])
            .chain(plain.split_whitespace())
        {
            let id = vocab.len();
            vocab.entry(word.to_string()).or_insert(json!(id));
        }
        let added_tokens = SPECIAL_TOKENS
            .iter()
            .enumerate()
            .map(|(id, content)| {
                json!({
                    "id": id,
                    "content": content,
                    "single_word": false,
                    "lstrip": false,
                    "rstrip": false,
                    "normalized": false,
                    "special": true
                })
            })
            .collect::<Vec<_>>();
        let tokenizer = json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": added_tokens,
            "normalizer": null,
            "pre_tokenizer": {"type": "WhitespaceSplit"},
            "post_processor": null,
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
        });
        let tokenizer = Tokenizer::from_str(&tokenizer.to_string())?;
        Ok(PllavaProcessor::new(tokenizer, ImageProcessorConfig::default()))
    }

    fn rendered_question(mode: &str, system: &str) -> Result<Conversation, PllavaError> {
        let mut conv = Conversation::template(mode)?;
        conv.user_query("The video contains 4 frames sampled at 1.0, 3.0, 5.0, 7.0 seconds.", None, None, true);
        ask_question(&mut conv, "What is the animal doing?", system);
        Ok(conv)
    }

    #[test]
    fn test_decode_answer_skips_system_instructions() -> Result<(), PllavaError> {
        let conv = rendered_question("plain", SYSTEM)?;
        let prompt = conv.get_prompt();
        assert!(prompt.contains("###"));

        let generated = " A dog runs.</s>";
        let processor = word_processor(&format!("{prompt}{generated}"))?;
        let ids = processor.encode(&prompt)?;
        let tokens = processor.encode(generated)?;

        assert_eq!(decode_answer(&processor, &tokens, &conv)?, "A dog runs.");

        let dialogue = processor.decode(&[ids, tokens].concat(), true)?;
        assert_eq!(
            postprocess_answer(&dialogue, conv.answer_split_tag(), conv.answer_ending()),
            "A dog runs."
        );
        Ok(())
    }

    #[test]
    fn test_decode_answer_chatml_template() -> Result<(), PllavaError> {
        let conv = rendered_question("eval_mvbench_llavanext", "SYS")?;
        let prompt = conv.get_prompt();
        assert!(prompt.ends_with("<|im_start|>assistant\n"));

        let generated = "A cat sleeps.<|im_end|>";
        let processor = word_processor(&format!("{prompt}{generated}"))?;
        let tokens = processor.encode(generated)?;
        assert_eq!(decode_answer(&processor, &tokens, &conv)?, "A cat sleeps.");

        let dialogue = "<|im_start|> system\nSYS<|im_end|>\n<|im_start|> user\n Q<|im_end|>\n\
            <|im_start|> assistant\nA cat.";
        assert_eq!(
            postprocess_answer(dialogue, conv.answer_split_tag(), conv.answer_ending()),
            "A cat."
        );
        Ok(())
    }

    #[test]
    fn test_postprocess_answer() {
        let output = "SYS USER: The video contains 4 frames. USER:What happens? ASSISTANT: A cat jumps.</s>";
        assert_eq!(postprocess_answer(output, "ASSISTANT:", "</s>"), "A cat jumps.");

        let output = "USER:q ASSISTANT: first ASSISTANT: second ###USER: more";
        assert_eq!(postprocess_answer(output, "ASSISTANT:", "</s>"), "second");

        assert_eq!(postprocess_answer("no tag here ", "ASSISTANT:", "</s>"), "no tag here");
    }

    #[test]
    fn test_ask_question_uses_template_prompts() -> Result<(), PllavaError> {
        let mut conv = Conversation::template("eval_videoqabench")?;
        ask_question(&mut conv, "What is shown?", "SYS");
        assert_eq!(conv.system, "SYS");
        assert_eq!(conv.messages.len(), 2);
        assert!(conv.messages[0].1.ends_with("Question: What is shown? \n"));
        assert!(conv.get_prompt().ends_with("ASSISTANT:\nAnswer: In the video,"));

        let mut conv = Conversation::plain();
        ask_question(&mut conv, "What is shown?", "");
        assert_eq!(conv.get_prompt(), "USER:What is shown? ASSISTANT:");
        Ok(())
    }

    #[test]
    fn test_pad_media_tokens() {
        let mut conv = Conversation::plain();
        conv.user_query("msg", None, None, true);
        pad_media_tokens(&mut conv, 3);
        assert_eq!(conv.media_token_count(), 3);
        pad_media_tokens(&mut conv, 2);
        assert_eq!(conv.media_token_count(), 3);
    }

    #[test]
    fn test_upload_video_from_frame_directory() -> Result<(), PllavaError> {
        let dir = tempfile::tempdir()?;
        for i in 0..8 {
            RgbImage::from_pixel(8, 4, Rgb([i * 10, 0, 0]))
                .save(dir.path().join(format!("frame_{i:03}.png")))?;
        }

        let mut conv = Conversation::plain();
        let mut img_list = Vec::new();
        let reply = upload_video(dir.path(), &mut conv, &mut img_list, 4)?;

        assert_eq!(reply, "Received.");
        assert_eq!(img_list.len(), 1);
        assert_eq!(img_list[0].len(), 4);
        assert_eq!(img_list[0].frames()[0].dimensions(), (672, 336));
        assert_eq!(conv.media_token_count(), 1);
        assert!(conv.messages[0].1.starts_with("<image> The video contains 4 frames"));
        Ok(())
    }
}

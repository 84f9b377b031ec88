use std::path::{Path, PathBuf};

use clap::Parser;
use log::info;
use pllava::{
    device::select_accelerator, load_pllava, ChatPllava, Conversation, GenerationConfig,
    LoadOptions, PllavaError, PllavaModel, PllavaProcessor, VideoChat,
};

/// System prompt of the video chat.
pub const SYSTEM: &str = "You are a powerful Video Magic ChatBot, a large vision-language assistant. 
You are able to understand the video content that the user provides and assist the user in a video-language related task.
The user might provide you with the video and maybe some extra noisy information to help you out or ask you a question. Make use of the information in a proper way to be competent for the job.
### INSTRUCTIONS:
1. Follow the user's instruction.
2. Be critical yet believe in yourself.
";

/// Answer a question about a video with PLLaVA
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Args {
    /// model identifier on the Hugging Face Hub or local checkpoint directory
    #[arg(long = "pretrained_model_name_or_path", alias = "pretrained-model-name-or-path")]
    pub pretrained_model_name_or_path: String,

    /// path to the input video file or frame directory
    #[arg(long = "video_path", alias = "video-path")]
    pub video_path: PathBuf,

    /// question about the video content
    #[arg(long)]
    pub question: String,

    /// number of frames per pooled media group
    #[arg(long = "num_frames", alias = "num-frames", default_value_t = 4)]
    pub num_frames: usize,

    /// number of segments the video is divided into
    #[arg(long = "num_segments", alias = "num-segments", default_value_t = 8)]
    pub num_segments: usize,

    /// beam search width
    #[arg(long = "num_beams", alias = "num-beams", default_value_t = 1)]
    pub num_beams: usize,

    /// sampling temperature
    #[arg(long, default_value_t = 1.0)]
    pub temperature: f64,

    /// merge the LoRA adapters of the weight directory
    #[arg(long = "use_lora", alias = "use-lora")]
    pub use_lora: bool,

    /// spread the model over every visible GPU
    #[arg(long = "use_multi_gpus", alias = "use-multi-gpus")]
    pub use_multi_gpus: bool,

    /// directory with fine-tuned weights
    #[arg(long = "weight_dir", alias = "weight-dir")]
    pub weight_dir: Option<PathBuf>,

    /// LoRA scaling factor, 32 when unset
    #[arg(long = "lora_alpha", alias = "lora-alpha")]
    pub lora_alpha: Option<u32>,

    /// conversation template
    #[arg(long = "conv_mode", alias = "conv-mode", default_value = "plain")]
    pub conv_mode: String,

    /// maximum number of generated tokens
    #[arg(long = "max_new_tokens", alias = "max-new-tokens", default_value_t = 200)]
    pub max_new_tokens: usize,

    /// nucleus sampling threshold
    #[arg(long = "top_p", alias = "top-p", default_value_t = 1.0)]
    pub top_p: f64,

    /// penalty applied to already generated tokens
    #[arg(long = "repetition_penalty", alias = "repetition-penalty", default_value_t = 1.0)]
    pub repetition_penalty: f32,

    /// seed of the sampler
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl Args {
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            num_frames: self.num_frames,
            use_lora: self.use_lora,
            weight_dir: self.weight_dir.clone(),
            lora_alpha: self.lora_alpha.map_or(32.0, f64::from),
            use_multi_gpus: self.use_multi_gpus,
            ..Default::default()
        }
    }

    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: self.max_new_tokens,
            num_beams: self.num_beams,
            temperature: self.temperature,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
            seed: self.seed,
            ..Default::default()
        }
    }
}

/// The steps needed to get a chat out of a checkpoint.
pub trait Runtime {
    type Model;
    type Chat: VideoChat;

    fn load(&mut self, repo: &str, options: &LoadOptions) -> Result<Self::Model, PllavaError>;

    /// Move a single device model to the accelerator.
    fn to_accelerator(&mut self, model: Self::Model) -> Result<Self::Model, PllavaError>;

    fn into_chat(&mut self, model: Self::Model) -> Self::Chat;
}

/// Runtime backed by the PLLaVA crate.
pub struct PllavaRuntime;

impl Runtime for PllavaRuntime {
    type Model = (PllavaModel, PllavaProcessor);
    type Chat = ChatPllava;

    fn load(&mut self, repo: &str, options: &LoadOptions) -> Result<Self::Model, PllavaError> {
        load_pllava(repo, options)
    }

    fn to_accelerator(&mut self, model: Self::Model) -> Result<Self::Model, PllavaError> {
        let (mut model, processor) = model;
        let (device, _) = select_accelerator();
        model.to_device(&device)?;
        Ok((model, processor))
    }

    fn into_chat(&mut self, model: Self::Model) -> Self::Chat {
        let (model, processor) = model;
        ChatPllava::new(model, processor)
    }
}

/// Load the model and wrap it in a chat.
pub fn init_model<R: Runtime>(runtime: &mut R, args: &Args) -> Result<R::Chat, PllavaError> {
    info!("Initializing PLLaVA");
    let mut model = runtime.load(&args.pretrained_model_name_or_path, &args.load_options())?;
    if !args.use_multi_gpus {
        model = runtime.to_accelerator(model)?;
    }
    Ok(runtime.into_chat(model))
}

/// Upload a video, ask one question and return the answer.
pub fn process_video_and_ask<C: VideoChat>(
    chat: &mut C,
    mut conv: Conversation,
    video_path: &Path,
    question: &str,
    num_segments: usize,
    config: &GenerationConfig,
) -> Result<String, PllavaError> {
    let mut img_list = Vec::new();
    info!("Processing video: {}", video_path.display());

    chat.upload_video(video_path, &mut conv, &mut img_list, num_segments)?;
    chat.ask(question, &mut conv, SYSTEM)?;
    let answer = chat.answer(&mut conv, &img_list, config)?;

    Ok(answer.text)
}

/// Run the whole question answering session.
pub fn run<R: Runtime>(runtime: &mut R, args: &Args) -> Result<String, PllavaError> {
    let template = Conversation::template(&args.conv_mode)?;
    let mut chat = init_model(runtime, args)?;
    process_video_and_ask(
        &mut chat,
        template,
        &args.video_path,
        &args.question,
        args.num_segments,
        &args.generation_config(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pllava::chat::{ask_question, postprocess_answer, Answer};
    use pllava::VideoClip;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    struct MockRuntime {
        log: Log,
        answer: String,
    }

    struct MockChat {
        log: Log,
        answer: String,
    }

    impl Runtime for MockRuntime {
        type Model = ();
        type Chat = MockChat;

        fn load(&mut self, repo: &str, options: &LoadOptions) -> Result<(), PllavaError> {
            self.log.borrow_mut().push(format!(
                "load {repo} frames={} lora={} alpha={}",
                options.num_frames, options.use_lora, options.lora_alpha
            ));
            Ok(())
        }

        fn to_accelerator(&mut self, model: ()) -> Result<(), PllavaError> {
            self.log.borrow_mut().push("to_accelerator".to_string());
            Ok(model)
        }

        fn into_chat(&mut self, _model: ()) -> MockChat {
            self.log.borrow_mut().push("into_chat".to_string());
            MockChat {
                log: self.log.clone(),
                answer: self.answer.clone(),
            }
        }
    }

    impl VideoChat for MockChat {
        fn upload_video(
            &mut self,
            path: &Path,
            conv: &mut Conversation,
            _img_list: &mut Vec<VideoClip>,
            num_segments: usize,
        ) -> Result<String, PllavaError> {
            self.log.borrow_mut().push(format!(
                "upload {} segments={num_segments} messages={}",
                path.display(),
                conv.messages.len()
            ));
            conv.user_query("The video contains 8 frames.", None, None, true);
            Ok("Received.".to_string())
        }

        fn ask(&mut self, text: &str, conv: &mut Conversation, system: &str) -> Result<(), PllavaError> {
            self.log
                .borrow_mut()
                .push(format!("ask {text} system={}", system == SYSTEM));
            ask_question(conv, text, system);
            Ok(())
        }

        fn answer(
            &mut self,
            conv: &mut Conversation,
            _img_list: &[VideoClip],
            config: &GenerationConfig,
        ) -> Result<Answer, PllavaError> {
            self.log.borrow_mut().push(format!(
                "answer beams={} max_new_tokens={} prompt={}",
                config.num_beams,
                config.max_new_tokens,
                conv.get_prompt().ends_with("USER:Why? ASSISTANT:")
            ));
            conv.set_answer(&self.answer);
            Ok(Answer {
                text: self.answer.clone(),
                tokens: vec![],
            })
        }
    }

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "video_qa",
            "--pretrained_model_name_or_path",
            "ermu2001/pllava-7b",
            "--video_path",
            "clip.mp4",
            "--question",
            "Why?",
        ];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    fn mock(answer: &str) -> (MockRuntime, Log) {
        let log = Log::default();
        let runtime = MockRuntime {
            log: log.clone(),
            answer: answer.to_string(),
        };
        (runtime, log)
    }

    #[test]
    fn test_default_arguments() {
        let args = args(&[]);
        assert_eq!(args.num_frames, 4);
        assert_eq!(args.num_segments, 8);
        assert_eq!(args.num_beams, 1);
        assert_eq!(args.temperature, 1.0);
        assert!(!args.use_lora && !args.use_multi_gpus);
        assert_eq!(args.weight_dir, None);
        assert_eq!(args.lora_alpha, None);
        assert_eq!(args.conv_mode, "plain");
        assert_eq!(args.generation_config().max_new_tokens, 200);
        assert_eq!(args.load_options().lora_alpha, 32.0);
    }

    #[test]
    fn test_hyphenated_flags() {
        let args = args(&["--num-beams", "3", "--use-lora", "--weight-dir", "tuned", "--lora-alpha", "4"]);
        assert_eq!(args.num_beams, 3);
        assert!(args.use_lora);
        assert_eq!(args.weight_dir, Some(PathBuf::from("tuned")));
        assert_eq!(args.load_options().lora_alpha, 4.0);
    }

    #[test]
    fn test_single_gpu_call_order() -> Result<(), PllavaError> {
        let (mut runtime, log) = mock("A dog runs.");
        let answer = run(&mut runtime, &args(&["--num_beams", "2"]))?;

        assert_eq!(answer, "A dog runs.");
        assert_eq!(
            *log.borrow(),
            vec![
                "load ermu2001/pllava-7b frames=4 lora=false alpha=32",
                "to_accelerator",
                "into_chat",
                "upload clip.mp4 segments=8 messages=0",
                "ask Why? system=true",
                "answer beams=2 max_new_tokens=200 prompt=true",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_multi_gpu_model_is_not_moved() -> Result<(), PllavaError> {
        let (mut runtime, log) = mock("ok");
        run(&mut runtime, &args(&["--use_multi_gpus"]))?;
        assert!(!log.borrow().iter().any(|call| call == "to_accelerator"));
        assert_eq!(log.borrow().len(), 5);
        Ok(())
    }

    #[test]
    fn test_answer_is_returned_unmodified() -> Result<(), PllavaError> {
        let (mut runtime, _) = mock("  two cats\n### ");
        assert_eq!(run(&mut runtime, &args(&[]))?, "  two cats\n### ");
        Ok(())
    }

    #[test]
    fn test_unknown_conv_mode_fails_before_loading() {
        let (mut runtime, log) = mock("ok");
        let result = run(&mut runtime, &args(&["--conv_mode", "nope"]));
        assert!(matches!(
            result,
            Err(PllavaError::UnknownConversationMode { ref mode, .. }) if mode == "nope"
        ));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_template_is_copied_per_session() -> Result<(), PllavaError> {
        let (mut runtime, log) = mock("ok");
        let args = args(&["--conv_mode", "eval_mvbench"]);
        run(&mut runtime, &args)?;
        run(&mut runtime, &args)?;
        assert_eq!(log.borrow()[3], log.borrow()[9]);
        Ok(())
    }

    #[test]
    fn test_answer_extracted_after_system_instructions() -> Result<(), PllavaError> {
        let mut conv = Conversation::plain();
        conv.user_query("The video contains 8 frames.", None, None, true);
        ask_question(&mut conv, "What happens?", SYSTEM);

        let dialogue = format!("{} A dog runs.</s>", conv.get_prompt());
        assert_eq!(
            postprocess_answer(&dialogue, conv.answer_split_tag(), conv.answer_ending()),
            "A dog runs."
        );
        assert_eq!(
            postprocess_answer(" A dog runs.</s>", conv.answer_split_tag(), conv.answer_ending()),
            "A dog runs."
        );
        Ok(())
    }
}

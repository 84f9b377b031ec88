//! Prompt templates used to talk to PLLaVA.
//!
//! A [`Conversation`] keeps the dialogue as a list of `(role, text)` messages and renders
//! it into the flat prompt string expected by the language model.

use crate::error::PllavaError;

/// Where the media placeholder goes when a user query carries a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStyle {
    /// The placeholder is prepended to the query text.
    Interleaf,
    /// The placeholder is sent as a message of its own, before the query.
    Alone,
}

/// Speaker of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// A dialogue between the user and the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub system: String,
    /// Role tags for the user and the assistant.
    pub roles: (String, String),
    pub messages: Vec<(Role, String)>,
    /// Separators closing a user and an assistant message.
    pub sep: (String, String),
    pub mm_token: String,
    pub mm_style: MediaStyle,
    pub pre_query_prompt: Option<String>,
    pub post_query_prompt: Option<String>,
    pub answer_prompt: Option<String>,
}

const SYSTEM_MVBENCH: &str = "Carefully watch the video and pay attention to the cause and sequence of events, the detail and movement of objects, and the action and pose of persons. Based on your observations, select the best option that accurately addresses the question.\n";

const SYSTEM_VCGBENCH: &str = "You are Video-ChatGPT, a large vision-language assistant. You are able to understand the video content that the user provides, and assist the user with a variety of tasks using natural language. Follow the instructions carefully and explain your answers in detail based on the provided video.\n";

const SYSTEM_RECAPTION: &str = "You are a powerful Video Magic ChatBot, a large vision-language assistant.
You are able to understand the video content that the user provides and assist the user in a video recaptioning task.
The user will provide you with the video and maybe some extra noisy information to help you out. Make use of the information in a proper way to be competent for the recaption job
### INSTRUCTIONS:
1. Follow the user's instruction.
2. Be critical yet believe in yourself.
";

const VIDEOQA_PRE_QUERY: &str = "The input consists of a sequence of key frames from a video. Answer the question concisely first and followed by significant events, characters, or objects that appear throughout the frames. Question:";

/// Names of the registered templates, in registration order.
pub const CONVERSATION_MODES: [&str; 8] = [
    "plain",
    "eval_vcgbench",
    "eval_mvbench",
    "eval_mvbench_llavanext",
    "eval_videoqabench",
    "eval_videoqa_llavanext",
    "eval_recaption",
    "eval_recaption_llavanext",
];

impl Conversation {
    fn vicuna(system: &str, mm_token: &str) -> Self {
        Self {
            system: system.to_string(),
            roles: ("USER:".to_string(), "ASSISTANT:".to_string()),
            messages: Vec::new(),
            sep: (" ".to_string(), "</s>".to_string()),
            mm_token: mm_token.to_string(),
            mm_style: MediaStyle::Interleaf,
            pre_query_prompt: None,
            post_query_prompt: None,
            answer_prompt: None,
        }
    }

    fn chatml(system: &str) -> Self {
        Self {
            system: format!("<|im_start|>system\n{system}"),
            roles: (
                "<|im_start|>user\n".to_string(),
                "<|im_start|>assistant\n".to_string(),
            ),
            messages: Vec::new(),
            sep: ("<|im_end|>\n".to_string(), "<|im_end|>\n".to_string()),
            mm_token: "<image>".to_string(),
            mm_style: MediaStyle::Interleaf,
            pre_query_prompt: None,
            post_query_prompt: None,
            answer_prompt: None,
        }
    }

    /// The plain Vicuna template with an empty system prompt.
    pub fn plain() -> Self {
        Self::vicuna("", "<image>")
    }

    /// Look up a template by name.
    ///
    /// # Errors
    ///
    /// Returns [`PllavaError::UnknownConversationMode`] listing the known names when
    /// `mode` is not registered.
    pub fn template(mode: &str) -> Result<Self, PllavaError> {
        let conv = match mode {
            "plain" => Self::plain(),
            "eval_vcgbench" => Self::vicuna(SYSTEM_VCGBENCH, "<image>\n"),
            "eval_mvbench" => Self::vicuna(SYSTEM_MVBENCH, "<image>"),
            "eval_mvbench_llavanext" => Self::chatml(SYSTEM_MVBENCH),
            "eval_videoqabench" => Self {
                pre_query_prompt: Some(VIDEOQA_PRE_QUERY.to_string()),
                post_query_prompt: Some("\n".to_string()),
                answer_prompt: Some("\nAnswer: In the video,".to_string()),
                ..Self::vicuna("", "<image>\n")
            },
            "eval_videoqa_llavanext" => Self {
                pre_query_prompt: Some(VIDEOQA_PRE_QUERY.to_string()),
                post_query_prompt: Some("\n".to_string()),
                answer_prompt: Some("\nAnswer: In the video,".to_string()),
                ..Self::chatml("Answer the question.")
            },
            "eval_recaption" => Self::vicuna(SYSTEM_RECAPTION, "<image>\n"),
            "eval_recaption_llavanext" => Self::chatml(SYSTEM_RECAPTION),
            _ => {
                return Err(PllavaError::UnknownConversationMode {
                    mode: mode.to_string(),
                    known: CONVERSATION_MODES.join(", "),
                })
            }
        };
        Ok(conv)
    }

    fn role_tag(&self, role: Role) -> &str {
        match role {
            Role::User => &self.roles.0,
            Role::Assistant => &self.roles.1,
        }
    }

    fn role_sep(&self, role: Role) -> &str {
        match role {
            Role::User => &self.sep.0,
            Role::Assistant => &self.sep.1,
        }
    }

    /// Render the dialogue into the prompt string.
    ///
    /// Each message is written as `role + text + sep`. When the last message comes from
    /// the user the assistant tag is appended so that the model answers next. When it
    /// comes from the assistant it is left open, without separator, so that the model
    /// continues it.
    pub fn get_prompt(&self) -> String {
        let mut ret = if self.system.is_empty() {
            String::new()
        } else {
            format!("{}{}", self.system, self.sep.0)
        };

        for (i, (role, message)) in self.messages.iter().enumerate() {
            ret.push_str(self.role_tag(*role));
            ret.push_str(message);
            if i + 1 < self.messages.len() {
                ret.push_str(self.role_sep(*role));
            } else if *role == Role::User {
                ret.push_str(self.role_sep(*role));
                ret.push_str(&self.roles.1);
            }
        }
        ret
    }

    /// Append a user message.
    ///
    /// # Arguments
    ///
    /// * `query` - The user text.
    /// * `pre_query_prompt` - Optional text put in front of the query, separated by a space.
    /// * `post_query_prompt` - Optional text put after the query, separated by a space.
    /// * `is_mm` - Whether the query comes with a media item.
    pub fn user_query(
        &mut self,
        query: &str,
        pre_query_prompt: Option<&str>,
        post_query_prompt: Option<&str>,
        is_mm: bool,
    ) {
        let mut query = query.to_string();
        if let Some(post) = post_query_prompt {
            query = format!("{query} {post}");
        }
        if let Some(pre) = pre_query_prompt {
            query = format!("{pre} {query}");
        }

        if is_mm {
            match self.mm_style {
                MediaStyle::Alone => self.messages.push((Role::User, self.mm_token.clone())),
                MediaStyle::Interleaf => {
                    if !query.contains(&self.mm_token) {
                        query = format!("{} {query}", self.mm_token);
                    }
                }
            }
        }
        self.messages.push((Role::User, query));
    }

    /// Append an assistant message.
    pub fn assistant_response(&mut self, response: &str) {
        self.messages.push((Role::Assistant, response.to_string()));
    }

    /// Record the final answer of the assistant.
    ///
    /// An open assistant message, e.g. an answer prompt, is replaced. Otherwise a new
    /// message is appended.
    pub fn set_answer(&mut self, answer: &str) {
        match self.messages.last_mut() {
            Some((Role::Assistant, text)) => *text = answer.to_string(),
            _ => self.assistant_response(answer),
        }
    }

    /// Number of media placeholders in the rendered prompt.
    pub fn media_token_count(&self) -> usize {
        self.get_prompt().matches(self.mm_token.as_str()).count()
    }

    /// Text that precedes the answer in the decoded output.
    pub fn answer_split_tag(&self) -> &str {
        // the tokenizer decodes the ChatML tag with a space after the special token
        if self.roles.1 == "<|im_start|>assistant\n" {
            "<|im_start|> assistant\n"
        } else {
            &self.roles.1
        }
    }

    /// Separator closing an assistant message.
    pub fn answer_ending(&self) -> &str {
        &self.sep.1
    }
}

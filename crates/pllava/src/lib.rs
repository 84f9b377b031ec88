//! # PLLaVA
//!
//! Video question answering with PLLaVA, a LLaVA model extended to videos by pooling
//! the features of several frames into one media group.
//!
//! The crate loads PLLaVA checkpoints from a local directory or the Hugging Face Hub,
//! samples and preprocesses video frames, and generates answers with greedy decoding,
//! multinomial sampling or beam search.
//!
//! # Features
//!
//! - `cuda`: run on NVIDIA GPUs, optionally spreading the decoder over several devices
//! - `gstreamer`: decode video files in addition to frame directories

/// Chat interface over a loaded model.
///
/// Uploads videos, asks questions and turns the generated tokens into answers.
pub mod chat;

/// Model configuration read from `config.json`.
pub mod config;

/// Conversation templates and prompt rendering.
pub mod conversation;

/// Accelerator selection and multi-GPU layer placement.
pub mod device;

/// Error types of the crate.
pub mod error;

/// Greedy, sampled and beam search decoding.
pub mod generation;

/// Checkpoint resolution and model loading.
pub mod loader;

/// The PLLaVA network: vision tower, pooling projector and Llama decoder.
pub mod model;

/// Tokenization and frame preprocessing.
pub mod processor;

pub use chat::{Answer, ChatPllava, VideoChat};
pub use conversation::Conversation;
pub use error::PllavaError;
pub use generation::GenerationConfig;
pub use loader::{load_pllava, LoadOptions};
pub use model::PllavaModel;
pub use processor::PllavaProcessor;
pub use pllava_video::VideoClip;

/// An error type for loading and running PLLaVA.
#[derive(thiserror::Error, Debug)]
pub enum PllavaError {
    /// Error to fetch a file from the Hugging Face Hub.
    #[error(transparent)]
    FailedToLoadModel(#[from] hf_hub::api::sync::ApiError),

    /// Error raised by a tensor operation.
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    /// Error raised by the tokenizer.
    #[error(transparent)]
    TokenizerError(#[from] tokenizers::Error),

    /// Error to read a local file.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Error to parse a json configuration file.
    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    /// Error to load or sample a video.
    #[error(transparent)]
    VideoError(#[from] pllava_video::VideoError),

    /// Error to process a frame image.
    #[error(transparent)]
    ImageError(#[from] image::ImageError),

    /// The requested conversation template does not exist.
    #[error("Unknown conversation mode `{mode}`, expected one of: {known}")]
    UnknownConversationMode {
        /// The requested mode.
        mode: String,
        /// Comma separated list of the registered modes.
        known: String,
    },

    /// The model configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A weight file or tensor could not be found.
    #[error("Missing weights: {0}")]
    MissingWeights(String),

    /// The number of frames is not a multiple of the frames per media group.
    #[error("Mismatched frame count: {frames} frames cannot be grouped by {num_frames}")]
    FrameCountMismatch {
        /// Total number of frames.
        frames: usize,
        /// Frames per pooled media group.
        num_frames: usize,
    },

    /// The prompt holds a different number of media tokens than media groups.
    #[error("Mismatched media count: tokens = {tokens}, groups = {groups}")]
    MediaTokenMismatch {
        /// Media tokens in the prompt.
        tokens: usize,
        /// Pooled media groups.
        groups: usize,
    },

    /// The logits hold non-finite values.
    #[error("Invalid logits detected: {0}")]
    InvalidLogits(String),

    /// Multi-GPU dispatch was requested without any CUDA device.
    #[error("No CUDA device available for multi-GPU dispatch")]
    NoAccelerator,

    /// No media was provided where some is required.
    #[error("Empty media provided: {0}")]
    EmptyMedia(String),
}

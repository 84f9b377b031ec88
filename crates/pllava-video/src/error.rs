/// An error type for the video module.
#[derive(thiserror::Error, Debug)]
pub enum VideoError {
    /// Error when the file does not exist.
    #[error("File does not exist: {0}")]
    FileDoesNotExist(std::path::PathBuf),

    /// Error to read from the file system.
    #[error("Failed to manipulate the file. {0}")]
    FileError(#[from] std::io::Error),

    /// Error to decode a frame image.
    #[error("Failed to decode the image. {0}")]
    ImageDecodeError(#[from] image::ImageError),

    /// The source holds no decodable frame.
    #[error("No frames found in {0}")]
    NoFrames(String),

    /// The number of segments must be strictly positive.
    #[error("Invalid number of segments: {0}")]
    InvalidSegments(usize),

    /// The path cannot be read with the enabled features.
    #[error("Unsupported video source: {0}")]
    UnsupportedSource(String),

    /// A decoded buffer does not match its negotiated caps.
    #[error("Invalid frame buffer: {0}")]
    InvalidFrame(String),

    /// Error to initialize GStreamer or build the pipeline.
    #[cfg(feature = "gstreamer")]
    #[error(transparent)]
    GStreamerError(#[from] gstreamer::glib::Error),

    /// Error reported by a GStreamer element.
    #[cfg(feature = "gstreamer")]
    #[error(transparent)]
    GStreamerBoolError(#[from] gstreamer::glib::BoolError),

    /// Error to change the pipeline state.
    #[cfg(feature = "gstreamer")]
    #[error(transparent)]
    StateChangeError(#[from] gstreamer::StateChangeError),

    /// Error while running the pipeline.
    #[cfg(feature = "gstreamer")]
    #[error("Pipeline error: {0}")]
    PipelineError(String),
}

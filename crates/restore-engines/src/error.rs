//! Engine-side errors and their mapping onto stage errors.

use restore_pipeline::{StageError, ToolError};

/// Errors raised while performing a stage.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Decoding or encoding an image failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Writing the restored PNG with metadata failed.
    #[error("PNG encoding error: {0}")]
    Png(#[from] png::EncodingError),

    /// A native tool failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Two images that must line up do not.
    #[error("size mismatch: {what} is {actual:?}, expected {expected:?}")]
    SizeMismatch {
        /// Which image was off.
        what: &'static str,
        /// Its dimensions.
        actual: (u32, u32),
        /// The dimensions it had to match.
        expected: (u32, u32),
    },

    /// Engine configuration is invalid.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}

impl From<EngineError> for StageError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Tool(e) => Self::Tool(e),
            EngineError::Io(e) => Self::Io(e),
            other => Self::Failed(other.to_string()),
        }
    }
}

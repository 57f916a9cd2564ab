use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Two tensors that must line up element-wise do not.
    #[error("shape mismatch in {stage}: {left:?} vs {right:?}")]
    ShapeMismatch {
        stage: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid {name} configuration: {reason}")]
    InvalidConfig { name: &'static str, reason: String },

    #[error("unknown architecture `{0}`")]
    UnknownArchitecture(String),

    #[error("architecture `{0}` is already registered")]
    DuplicateArchitecture(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to load record: {0}")]
    Record(String),

    #[error("tensor data: {0}")]
    TensorData(String),
}

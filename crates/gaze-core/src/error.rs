use thiserror::Error;

#[derive(Error, Debug)]
pub enum GazeError {
    #[error("unknown model name '{0}' (expected one of: face_res50, multi_region_res50, multi_region_res50_share_eyenet, face_poolformer24)")]
    UnknownModel(String),

    #[error("unknown load mode '{0}' (expected load_single_face or load_multi_region)")]
    UnknownLoadMode(String),

    #[error("model {model} expects {expected} input, got {actual}")]
    LoadModeMismatch {
        model: String,
        expected: String,
        actual: String,
    },

    #[error("input region '{0}' is not available")]
    MissingRegion(&'static str),

    #[error("tensor '{0}' not found")]
    MissingTensor(String),

    #[error("unexpected tensor '{0}'")]
    UnexpectedTensor(String),

    #[error("shape mismatch for '{name}': expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },

    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("missing metadata entry '{0}'")]
    MissingMetadata(&'static str),

    #[error("invalid metadata entry '{key}': {reason}")]
    InvalidMetadata { key: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, GazeError>;

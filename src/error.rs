use thiserror::Error;

use crate::model::Modality;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("frame set has no {0:?} frame")]
    MissingModality(Modality),

    #[error("feature extraction failed: {0}")]
    FeatureExtraction(String),

    #[error("appearance model failed: {0}")]
    AppearanceModel(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("tracker used before init")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

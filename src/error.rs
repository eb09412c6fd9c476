use std::path::PathBuf;
use thiserror::Error;

/// Result type for extraction operations.
pub type ExtractResult<T> = Result<T, ExtractError>;

/// Errors raised while extracting faces from a video.
///
/// Apart from `ModelInit`, none of these cross the per-video boundary of the
/// batch driver: they are logged there and the video is counted as failed.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("cannot open video {path:?}: {reason}")]
    SourceOpen { path: PathBuf, reason: String },

    #[error("failed to decode frame {frame} of {path:?}: {reason}")]
    Decode {
        path: PathBuf,
        frame: usize,
        reason: String,
    },

    #[error("detection failed on frame {frame}: {reason}")]
    Detection { frame: usize, reason: String },

    #[error("face {face} of frame {frame}: {reason}")]
    FaceProcessing {
        frame: usize,
        face: usize,
        reason: String,
    },

    #[error("failed to write {path:?}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    #[error("processing of {0:?} was cancelled")]
    Cancelled(PathBuf),

    #[error("processing of {path:?} exceeded its deadline of {seconds}s")]
    DeadlineExceeded { path: PathBuf, seconds: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to initialize {model}: {reason}")]
    ModelInit { model: &'static str, reason: String },
}

impl ExtractError {
    pub fn persistence(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn face(frame: usize, face: usize, reason: impl ToString) -> Self {
        Self::FaceProcessing {
            frame,
            face,
            reason: reason.to_string(),
        }
    }
}

/// Reasons a raw detection cannot be turned into a usable face image.
#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("face image is empty")]
    EmptyFace,

    #[error("pixel buffer holds {actual} values, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("unsupported channel count {0}")]
    UnsupportedChannels(u8),

    #[error("pixel buffer contains non-finite values")]
    NonFinite,
}

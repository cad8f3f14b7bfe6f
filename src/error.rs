//! Error taxonomy for the timelapse pipeline

use std::io;

use thiserror::Error;

use crate::capture::frame::PixelFormat;

pub type Result<T> = std::result::Result<T, LapseError>;

#[derive(Debug, Error)]
pub enum LapseError {
    /// The camera stalled mid-operation. Recovered inside the scheduler and
    /// the autofocus prescan, never returned from a run.
    #[error("camera timed out waiting for a frame")]
    CameraTimeout,

    #[error("no buffer to encode")]
    NoBuffer,

    #[error("no buffer available to return")]
    EmptyEncodeQueue,

    #[error("encoder completed frame {completed} but frame {expected} was submitted first")]
    OutOfOrderCompletion { expected: u64, completed: u64 },

    #[error("only YUV420 is supported, stream is {0:?}")]
    UnsupportedPixelFormat(PixelFormat),

    #[error("still stream is not configured")]
    StreamNotConfigured,

    #[error("frame plane holds {actual} bytes, expected at least {expected}")]
    ShortPlane { expected: usize, actual: usize },

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("no post-processing stage named {0:?}")]
    UnknownStage(String),

    #[error("camera error: {0}")]
    Camera(#[from] io::Error),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("output error: {0}")]
    Output(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("bad stage parameters: {0}")]
    Params(#[from] serde_json::Error),
}

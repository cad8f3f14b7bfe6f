//! Encoder contract and backends
//!
//! Encoders consume plane memory by reference count and report back on
//! their own threads: `input done` once a submitted buffer is no longer
//! needed, `output ready` for every encoded chunk.

pub mod raw;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst;

use std::sync::Arc;

use bytes::Bytes;

use crate::capture::frame::StreamInfo;
use crate::error::{LapseError, Result};
use crate::{Codec, EncoderConfig};

pub use raw::RawEncoder;

/// Called with the sequence tag of the consumed input, when the backend
/// can tell which one it was.
pub type InputDoneCallback = Arc<dyn Fn(Option<u64>) + Send + Sync>;

/// Called with encoded bytes, presentation timestamp in microseconds, and
/// whether the chunk starts a keyframe.
pub type OutputReadyCallback = Arc<dyn Fn(&[u8], i64, bool) + Send + Sync>;

/// One buffer submitted for encoding
#[derive(Debug, Clone)]
pub struct EncodeInput {
    pub sequence: u64,
    pub data: Bytes,
    pub info: StreamInfo,
    pub timestamp_us: i64,
}

pub trait Encoder: Send {
    /// Callbacks must be registered before the first buffer is submitted.
    fn set_input_done_callback(&mut self, callback: InputDoneCallback);
    fn set_output_ready_callback(&mut self, callback: OutputReadyCallback);

    fn encode_buffer(&mut self, input: EncodeInput) -> Result<()>;

    /// Drain everything submitted so far and release the backend.
    fn stop(&mut self);
}

/// Build the encoder for `config`; `info` must describe a configured stream.
pub fn create(config: &EncoderConfig, info: StreamInfo, framerate: f64) -> Result<Box<dyn Encoder>> {
    if !info.is_configured() {
        return Err(LapseError::StreamNotConfigured);
    }

    match config.codec {
        Codec::Yuv420 => Ok(Box::new(RawEncoder::new())),
        #[cfg(feature = "gstreamer-pipeline")]
        Codec::H264 => Ok(Box::new(gst::GstEncoder::new(config, info, framerate)?)),
        #[cfg(not(feature = "gstreamer-pipeline"))]
        Codec::H264 => {
            let _ = framerate;
            Err(LapseError::Encoder(
                "h264 needs the gstreamer-pipeline feature".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;

    #[test]
    fn unconfigured_stream_is_rejected() {
        let info = StreamInfo {
            width: 0,
            height: 0,
            stride: 0,
            format: PixelFormat::Yuv420,
        };
        let config = EncoderConfig {
            codec: Codec::Yuv420,
            ..Default::default()
        };
        assert!(matches!(
            create(&config, info, 30.0),
            Err(LapseError::StreamNotConfigured)
        ));
    }
}

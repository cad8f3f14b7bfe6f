pub mod capture;
pub mod encoder;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod postprocess;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use error::{LapseError, Result};

/// Frame rate used for presentation timestamps when none is configured
pub const DEFAULT_FRAMERATE: f64 = 30.0;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub lapse: LapseConfig,
    pub encoder: EncoderConfig,
    pub output: OutputConfig,
    pub post_process: Vec<StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub device: String, // Empty means auto-detect
    pub width: u32,
    pub height: u32,
    pub viewfinder_width: u32,
    pub viewfinder_height: u32,
    pub buffer_count: u32,
    pub capture_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LapseConfig {
    pub interval: String,
    pub timeout: String,
    pub autofocus_on_capture: bool,
    pub framerate: Option<f64>,
    pub keypress: bool,
    pub signal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Yuv420,
    H264,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub codec: Codec,
    pub bitrate: Option<u32>,
    pub intra: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: String, // "-" writes to stdout
    pub metadata: Option<PathBuf>,
}

/// One entry of the post-processing chain, resolved by name at setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            width: 1920,
            height: 1080,
            viewfinder_width: 640,
            viewfinder_height: 480,
            buffer_count: 2,
            capture_timeout_ms: 1000,
        }
    }
}

impl Default for LapseConfig {
    fn default() -> Self {
        Self {
            interval: "1000ms".into(),
            timeout: "5s".into(),
            autofocus_on_capture: false,
            framerate: None,
            keypress: false,
            signal: false,
        }
    }
}

impl LapseConfig {
    /// Time between captures; must be non-zero.
    pub fn interval(&self) -> Result<Duration> {
        let interval = utils::parse_duration(&self.interval)?;
        if interval.is_zero() {
            return Err(LapseError::InvalidParameter {
                name: "interval",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(interval)
    }

    pub fn timeout(&self) -> Result<Duration> {
        utils::parse_duration(&self.timeout)
    }

    /// Timestamp rate; must be finite and positive.
    pub fn framerate(&self) -> Result<f64> {
        match self.framerate {
            None => Ok(DEFAULT_FRAMERATE),
            Some(rate) if rate.is_finite() && rate > 0.0 => Ok(rate),
            Some(rate) => Err(LapseError::InvalidParameter {
                name: "framerate",
                reason: format!("{rate} is not a positive frame rate"),
            }),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            bitrate: None,
            intra: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: "timelapse.h264".into(),
            metadata: None,
        }
    }
}

impl Config {
    /// Layer an optional TOML file and `LAPSE_*` environment variables over
    /// the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("LAPSE").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

//! Temporal frame differencing ("motion extraction")
//!
//! Each output frame is the live frame minus the frame `frame_offset` ticks
//! earlier, or minus one fixed reference frame. Luma becomes the scaled
//! absolute difference; chroma becomes the signed difference centred on 128.

use serde::Deserialize;
use tracing::{debug, info};

use crate::capture::frame::{CapturedFrame, PixelFormat, StreamInfo};
use crate::error::{LapseError, Result};
use crate::postprocess::history::MotionHistoryRing;
use crate::postprocess::{PostProcessingStage, ProcessOutcome};

pub const NAME: &str = "motion_extraction";

/// Fade-in increment per produced frame
const FADE_STEP: f32 = 0.05;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MotionExtractionParams {
    pub frame_offset: u8,
    pub fixed_frame: bool,
    pub prerecord_frames: u8,
    pub scale: f32,
    pub skip_uv_diff: bool,
}

impl Default for MotionExtractionParams {
    fn default() -> Self {
        Self {
            frame_offset: 1,
            fixed_frame: false,
            prerecord_frames: 0,
            scale: 1.0,
            skip_uv_diff: false,
        }
    }
}

pub fn create() -> Box<dyn PostProcessingStage> {
    Box::new(MotionExtractionStage::default())
}

#[derive(Default)]
pub struct MotionExtractionStage {
    params: MotionExtractionParams,
    history: Option<MotionHistoryRing>,
    buffer_frame_start: u8,
    prerecord_count: u8,
    fade_factor: f32,
    y_size: usize,
    uv_size: usize,
}

impl MotionExtractionStage {
    pub fn with_params(params: MotionExtractionParams) -> Result<Self> {
        let mut stage = Self::default();
        stage.apply(params)?;
        Ok(stage)
    }

    fn apply(&mut self, mut params: MotionExtractionParams) -> Result<()> {
        if params.fixed_frame {
            params.frame_offset = 1;
        }
        if params.frame_offset == 0 {
            return Err(LapseError::InvalidParameter {
                name: "frame_offset",
                reason: "must be at least 1".into(),
            });
        }

        if params.prerecord_frames == 0 {
            self.buffer_frame_start = 0;
            self.fade_factor = 1.0;
        } else {
            // The last `frame_offset` warm-up frames seed the history.
            self.buffer_frame_start = params.prerecord_frames.saturating_sub(params.frame_offset);
            self.fade_factor = 0.0;
        }
        self.params = params;
        Ok(())
    }

    fn snapshot_size(&self) -> usize {
        if self.params.skip_uv_diff {
            self.y_size
        } else {
            self.y_size + self.uv_size
        }
    }

    /// Snapshots currently retained
    pub fn retained(&self) -> usize {
        self.history.as_ref().map_or(0, MotionHistoryRing::len)
    }

    /// (allocated, freed) snapshot counts
    pub fn snapshot_stats(&self) -> (usize, usize) {
        self.history.as_ref().map_or((0, 0), MotionHistoryRing::stats)
    }
}

impl PostProcessingStage for MotionExtractionStage {
    fn name(&self) -> &'static str {
        NAME
    }

    fn read(&mut self, params: &serde_json::Value) -> Result<()> {
        let params = if params.is_null() {
            MotionExtractionParams::default()
        } else {
            MotionExtractionParams::deserialize(params)?
        };
        self.apply(params)
    }

    fn configure(&mut self, stream: &StreamInfo) -> Result<()> {
        if stream.format != PixelFormat::Yuv420 {
            return Err(LapseError::UnsupportedPixelFormat(stream.format));
        }

        self.y_size = stream.stride as usize * stream.height as usize;
        self.uv_size = self.y_size / 2;
        self.prerecord_count = 0;
        self.history = Some(MotionHistoryRing::new(self.params.frame_offset as usize));

        info!("Motion extraction buffer size = {}", self.snapshot_size());
        Ok(())
    }

    fn process(&mut self, frame: &mut CapturedFrame) -> Result<ProcessOutcome> {
        if self.prerecord_count < self.buffer_frame_start {
            self.prerecord_count += 1;
            return Ok(ProcessOutcome::Skipped);
        }

        let size = self.snapshot_size();
        let y_size = self.y_size;
        let uv_size = (!self.params.skip_uv_diff).then_some(self.uv_size);
        let fixed = self.params.fixed_frame;

        let history = self.history.as_mut().ok_or(LapseError::StreamNotConfigured)?;
        let plane = frame.plane_mut(0).ok_or(LapseError::NoBuffer)?;
        if plane.len() < size {
            return Err(LapseError::ShortPlane {
                expected: size,
                actual: plane.len(),
            });
        }

        let ready = if fixed {
            !history.is_empty()
        } else {
            history.is_full()
        };
        if !ready {
            history.push(&plane[..size]);
            metrics::gauge!("motion_snapshots_live").set(history.len() as f64);
            return Ok(ProcessOutcome::Skipped);
        }

        let mut scale = self.params.scale;
        if self.fade_factor < 1.0 {
            self.fade_factor += FADE_STEP;
            scale = 1.0;
        }
        let fade = self.fade_factor;

        if fixed {
            let Some(reference) = history.peek() else {
                return Ok(ProcessOutcome::Skipped);
            };
            difference(plane, reference, y_size, uv_size, fade, scale);
        } else {
            // Pop before pushing so the ring never holds more than frame_offset.
            let Some(reference) = history.pop() else {
                return Ok(ProcessOutcome::Skipped);
            };
            history.push(&plane[..size]);
            difference(plane, &reference, y_size, uv_size, fade, scale);
        }

        debug!(sequence = frame.meta.sequence, fade, scale, "Motion extracted");
        Ok(ProcessOutcome::Produced)
    }

    fn stop(&mut self) {
        if let Some(history) = self.history.as_mut() {
            let freed = history.clear();
            debug!("Freed {} retained snapshots", freed);
            metrics::gauge!("motion_snapshots_live").set(0.0);
        }
    }
}

/// Difference `live` against `reference` in place.
///
/// Luma results are truncated and wrap modulo 256; chroma is offset by 128
/// and wraps the same way.
fn difference(
    live: &mut [u8],
    reference: &[u8],
    y_size: usize,
    uv_size: Option<usize>,
    fade: f32,
    scale: f32,
) {
    let (luma, chroma) = live.split_at_mut(y_size);
    let (ref_luma, ref_chroma) = reference.split_at(y_size);

    for (out, &old) in luma.iter_mut().zip(ref_luma) {
        let diff = (*out as f32 - old as f32 * fade).abs() * scale;
        *out = diff as u32 as u8;
    }

    if let Some(uv_size) = uv_size {
        for (out, &old) in chroma[..uv_size].iter_mut().zip(&ref_chroma[..uv_size]) {
            *out = (*out as i32 - old as i32 + 128) as u8;
        }
    }
}

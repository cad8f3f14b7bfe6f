use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// One sensor exposure, still owned by the pipeline that produced it.
///
/// Planes are writable while the frame is owned exclusively, which is when
/// post-processing stages run. [`CapturedFrame::freeze`] turns it into a
/// [`SharedFrame`] without copying the plane memory.
#[derive(Debug)]
pub struct CapturedFrame {
    planes: Vec<BytesMut>,

    /// Layout of the stream the frame came from
    pub info: StreamInfo,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// Completion timestamp for latency tracking
    pub timestamp: Instant,
}

impl CapturedFrame {
    pub fn new(planes: Vec<BytesMut>, info: StreamInfo, meta: FrameMetadata) -> Self {
        Self {
            planes,
            info,
            meta,
            timestamp: Instant::now(),
        }
    }

    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        self.planes.get(index).map(|p| &p[..])
    }

    pub fn plane_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.planes.get_mut(index).map(|p| &mut p[..])
    }

    pub fn freeze(self) -> SharedFrame {
        SharedFrame {
            planes: self.planes.into_iter().map(BytesMut::freeze).collect(),
            info: self.info,
            meta: self.meta,
            timestamp: self.timestamp,
        }
    }
}

/// Immutable frame whose planes can be handed out by reference count.
#[derive(Debug, Clone)]
pub struct SharedFrame {
    planes: Vec<Bytes>,
    pub info: StreamInfo,
    pub meta: FrameMetadata,
    pub timestamp: Instant,
}

impl SharedFrame {
    pub fn plane(&self, index: usize) -> Option<&Bytes> {
        self.planes.get(index)
    }
}

pub type SharedFramePtr = Arc<SharedFrame>;

/// Frame metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub exposure_time_us: Option<u32>,
    pub af_state: Option<AfState>,
    pub lens_position: Option<f32>,
    pub sensor_timestamp_us: Option<u64>, // Hardware timestamp if available
}

/// Autofocus scan status reported with each completed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AfState {
    Idle,
    Scanning,
    Focused,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

impl StreamInfo {
    pub fn is_configured(&self) -> bool {
        self.width != 0 && self.height != 0 && self.stride != 0
    }

    /// Bytes in one planar 4:2:0 frame of this geometry.
    pub fn yuv420_size(&self) -> usize {
        let luma = self.stride as usize * self.height as usize;
        luma + luma / 2
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuv420,
    Yuyv4,
    Mjpeg,
    Nv12,
}

//! V4L2 still capture with per-capture streaming and autofocus controls

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::camera::{AfMode, AfTrigger, Camera, CameraMsg, ControlList};
use crate::capture::frame::{AfState, CapturedFrame, FrameMetadata, PixelFormat, StreamInfo};
use crate::error::{LapseError, Result};
use crate::CameraConfig;

const V4L2_CID_CAMERA_CLASS_BASE: u32 = 0x009a_0000 | 0x900;
const V4L2_CID_FOCUS_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 10;
const V4L2_CID_FOCUS_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 12;
const V4L2_CID_AUTO_FOCUS_START: u32 = V4L2_CID_CAMERA_CLASS_BASE + 28;
const V4L2_CID_AUTO_FOCUS_STOP: u32 = V4L2_CID_CAMERA_CLASS_BASE + 29;
const V4L2_CID_AUTO_FOCUS_STATUS: u32 = V4L2_CID_CAMERA_CLASS_BASE + 30;

const V4L2_AUTO_FOCUS_STATUS_BUSY: i32 = 1 << 0;
const V4L2_AUTO_FOCUS_STATUS_REACHED: i32 = 1 << 1;
const V4L2_AUTO_FOCUS_STATUS_FAILED: i32 = 1 << 2;

#[repr(C)]
pub struct V4l2Control {
    id: u32,
    value: i32,
}

nix::ioctl_readwrite!(vidioc_g_ctrl, b'V', 27, V4l2Control);
nix::ioctl_readwrite!(vidioc_s_ctrl, b'V', 28, V4l2Control);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Viewfinder,
    Still,
}

/// Still camera on top of a V4L2 capture node.
///
/// The device streams only between [`Camera::start`] and [`Camera::stop`];
/// each still capture is a full stream on/off cycle.
pub struct V4l2StillCamera {
    config: CameraConfig,
    device: Option<Box<Device>>,
    controls: Option<File>,
    stream: Option<MmapStream<'static>>,
    mode: Option<(Mode, StreamInfo)>,
    sequence: u64,
}

impl V4l2StillCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            device: None,
            controls: None,
            stream: None,
            mode: None,
            sequence: 0,
        }
    }

    fn device(&self) -> Result<&Device> {
        self.device
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "camera not open").into())
    }

    fn configure(&mut self, mode: Mode, width: u32, height: u32) -> Result<()> {
        let device = self.device()?;

        let mut fmt = device.format()?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = FourCC::new(b"YU12");
        let fmt = device.set_format(&fmt)?;

        let format = if fmt.fourcc == FourCC::new(b"YU12") {
            PixelFormat::Yuv420
        } else if fmt.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv4
        } else if fmt.fourcc == FourCC::new(b"NV12") {
            PixelFormat::Nv12
        } else {
            PixelFormat::Mjpeg
        };

        let info = StreamInfo {
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
            format,
        };
        info!("Configured {:?} stream: {:?}", mode, info);
        self.mode = Some((mode, info));
        Ok(())
    }

    fn get_control(&self, id: u32) -> Option<i32> {
        let file = self.controls.as_ref()?;
        let mut ctrl = V4l2Control { id, value: 0 };
        match unsafe { vidioc_g_ctrl(file.as_raw_fd(), &mut ctrl) } {
            Ok(_) => Some(ctrl.value),
            Err(e) => {
                debug!(id, ?e, "Failed to read V4L2 control");
                None
            }
        }
    }

    fn set_control(&self, id: u32, value: i32) -> Result<()> {
        let file = self
            .controls
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "camera not open"))?;
        let mut ctrl = V4l2Control { id, value };
        unsafe { vidioc_s_ctrl(file.as_raw_fd(), &mut ctrl) }
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(())
    }

    fn af_state(&self) -> Option<AfState> {
        let status = self.get_control(V4L2_CID_AUTO_FOCUS_STATUS)?;
        Some(if status & V4L2_AUTO_FOCUS_STATUS_BUSY != 0 {
            AfState::Scanning
        } else if status & V4L2_AUTO_FOCUS_STATUS_REACHED != 0 {
            AfState::Focused
        } else if status & V4L2_AUTO_FOCUS_STATUS_FAILED != 0 {
            AfState::Failed
        } else {
            AfState::Idle
        })
    }
}

impl Camera for V4l2StillCamera {
    #[instrument(skip(self))]
    fn open(&mut self) -> Result<()> {
        info!("Opening V4L2 camera: {}", self.config.device);

        let device = Device::with_path(&self.config.device)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "device doesn't support video capture",
            )
            .into());
        }

        let controls = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.config.device)?;

        self.device = Some(Box::new(device));
        self.controls = Some(controls);
        Ok(())
    }

    fn close(&mut self) {
        self.stop();
        self.teardown();
        self.controls = None;
        self.device = None;
    }

    fn configure_viewfinder(&mut self) -> Result<()> {
        self.configure(
            Mode::Viewfinder,
            self.config.viewfinder_width,
            self.config.viewfinder_height,
        )
    }

    fn configure_still(&mut self) -> Result<()> {
        self.configure(Mode::Still, self.config.width, self.config.height)
    }

    fn teardown(&mut self) {
        self.stop();
        self.mode = None;
    }

    #[instrument(skip(self))]
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let device = self.device()?;
        let mut stream =
            MmapStream::with_buffers(device, Type::VideoCapture, self.config.buffer_count)?;
        stream.set_timeout(Duration::from_millis(self.config.capture_timeout_ms));

        self.stream = Some(stream);
        debug!("Capture stream started with {} buffers", self.config.buffer_count);
        Ok(())
    }

    fn stop(&mut self) {
        // Dropping the stream turns streaming off and unmaps the buffers.
        if self.stream.take().is_some() {
            debug!("Capture stream stopped");
        }
    }

    fn wait(&mut self) -> Result<CameraMsg> {
        let Some((_, info)) = self.mode else {
            return Err(LapseError::StreamNotConfigured);
        };
        let Some(stream) = self.stream.as_mut() else {
            return Ok(CameraMsg::Quit);
        };

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(CameraMsg::Timeout),
            Err(e) => return Err(e.into()),
        };

        // The mmap'd buffer goes back to the driver on the next dequeue.
        let plane = BytesMut::from(&buf[..meta.bytesused as usize]);
        let sensor_timestamp_us = meta.timestamp.sec as u64 * 1_000_000 + meta.timestamp.usec as u64;

        self.sequence += 1;
        let frame_meta = FrameMetadata {
            sequence: self.sequence,
            exposure_time_us: None,
            af_state: self.af_state(),
            lens_position: self.get_control(V4L2_CID_FOCUS_ABSOLUTE).map(|v| v as f32),
            sensor_timestamp_us: Some(sensor_timestamp_us),
        };

        Ok(CameraMsg::FrameReady(CapturedFrame::new(
            vec![plane],
            info,
            frame_meta,
        )))
    }

    fn set_controls(&mut self, controls: &ControlList) -> Result<()> {
        if controls.af_mode == Some(AfMode::Auto) {
            // Triggered scans need continuous autofocus off.
            self.set_control(V4L2_CID_FOCUS_AUTO, 0)?;
        }
        match controls.af_trigger {
            Some(AfTrigger::Start) => self.set_control(V4L2_CID_AUTO_FOCUS_START, 1)?,
            Some(AfTrigger::Cancel) => {
                if let Err(e) = self.set_control(V4L2_CID_AUTO_FOCUS_STOP, 1) {
                    warn!("Failed to stop autofocus: {}", e);
                }
            }
            None => {}
        }
        Ok(())
    }

    fn still_stream(&self) -> Option<StreamInfo> {
        match self.mode {
            Some((Mode::Still, info)) => Some(info),
            _ => None,
        }
    }
}

impl Drop for V4l2StillCamera {
    fn drop(&mut self) {
        self.close();
    }
}

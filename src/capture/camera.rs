//! Contract between the timelapse pipeline and a still-capture camera

use crate::capture::frame::{CapturedFrame, StreamInfo};
use crate::error::Result;

/// Outcome of one blocking [`Camera::wait`].
#[derive(Debug)]
pub enum CameraMsg {
    /// The driver did not deliver a frame in time
    Timeout,
    /// The camera was shut down underneath us
    Quit,
    FrameReady(CapturedFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfMode {
    /// Scan once per trigger, then hold the lens
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfTrigger {
    Start,
    Cancel,
}

/// Controls applied to a running or configured camera
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlList {
    pub af_mode: Option<AfMode>,
    pub af_trigger: Option<AfTrigger>,
}

impl ControlList {
    pub fn autofocus(trigger: AfTrigger) -> Self {
        Self {
            af_mode: Some(AfMode::Auto),
            af_trigger: Some(trigger),
        }
    }
}

/// A camera that produces single still frames on request.
///
/// Configurations are exclusive: [`Camera::teardown`] releases whichever
/// configuration is active so another can be applied.
pub trait Camera: Send {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);

    fn configure_viewfinder(&mut self) -> Result<()>;
    fn configure_still(&mut self) -> Result<()>;
    fn teardown(&mut self);

    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);

    /// Block until the next frame, a driver timeout, or shutdown.
    fn wait(&mut self) -> Result<CameraMsg>;

    fn set_controls(&mut self, controls: &ControlList) -> Result<()>;

    /// Layout of the configured still stream, if any.
    fn still_stream(&self) -> Option<StreamInfo>;
}

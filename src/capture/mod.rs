pub mod camera;
pub mod frame;
pub mod v4l2;

pub use camera::{Camera, CameraMsg, ControlList};
pub use frame::{CapturedFrame, FrameMetadata, PixelFormat, SharedFrame, StreamInfo};
pub use v4l2::V4l2StillCamera;

//! GStreamer-based H.264 encoding with hardware encoders preferred

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, error, info, warn};

use crate::capture::frame::StreamInfo;
use crate::encoder::{EncodeInput, Encoder, InputDoneCallback, OutputReadyCallback};
use crate::error::{LapseError, Result};
use crate::EncoderConfig;

fn encoder_error(context: &str, e: impl std::fmt::Display) -> LapseError {
    LapseError::Encoder(format!("{}: {}", context, e))
}

/// Plane memory lent to GStreamer. Dropped by the pipeline once the encoder
/// is done with the input, which is when the input-done callback fires.
struct InputMemory {
    data: Bytes,
    sequence: u64,
    done: Option<InputDoneCallback>,
}

impl AsRef<[u8]> for InputMemory {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for InputMemory {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            done(Some(self.sequence));
        }
    }
}

/// Byte offset and stride of each I420 plane in a camera buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaneLayout {
    offsets: [usize; 3],
    strides: [i32; 3],
}

impl PlaneLayout {
    fn of(info: &StreamInfo) -> Self {
        let stride = info.stride as i32;
        let luma = info.stride as usize * info.height as usize;
        Self {
            offsets: [0, luma, luma + luma / 4],
            strides: [stride, stride / 2, stride / 2],
        }
    }

    /// Caps carry no stride, so every buffer describes its own layout.
    fn attach(&self, info: &StreamInfo, buffer: &mut gst::BufferRef) -> Result<()> {
        gst_video::VideoMeta::add_full(
            buffer,
            gst_video::VideoFrameFlags::empty(),
            gst_video::VideoFormat::I420,
            info.width,
            info.height,
            &self.offsets,
            &self.strides,
        )
        .map_err(|e| encoder_error("Failed to describe buffer layout", e))?;
        Ok(())
    }
}

/// appsrc ! videoconvert ! <h264 encoder> ! h264parse ! appsink
pub struct GstEncoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    input_done: Option<InputDoneCallback>,
    output_ready: Option<OutputReadyCallback>,
    info: StreamInfo,
    layout: PlaneLayout,
    playing: bool,
}

impl GstEncoder {
    pub fn new(config: &EncoderConfig, info: StreamInfo, framerate: f64) -> Result<Self> {
        gst::init().map_err(|e| encoder_error("Failed to initialize GStreamer", e))?;

        info!("Initializing GStreamer encode pipeline");

        let pipeline_str = Self::build_pipeline_string(config, Self::detect_h264_encoder());
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| encoder_error("Failed to parse pipeline", e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| LapseError::Encoder("Failed to create pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| LapseError::Encoder("Failed to find appsrc element".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| LapseError::Encoder("Failed to cast to AppSrc".into()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| LapseError::Encoder("Failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| LapseError::Encoder("Failed to cast to AppSink".into()))?;

        let layout = PlaneLayout::of(&info);
        let fps = gst::Fraction::approximate_f64(framerate)
            .unwrap_or_else(|| gst::Fraction::new(framerate.round() as i32, 1));
        let video_info = gst_video::VideoInfo::builder(
            gst_video::VideoFormat::I420,
            info.width,
            info.height,
        )
        .fps(fps)
        .build()
        .map_err(|e| encoder_error("Invalid stream layout", e))?;
        let caps = video_info
            .to_caps()
            .map_err(|e| encoder_error("Failed to build caps", e))?;

        appsrc.set_caps(Some(&caps));
        appsrc.set_format(gst::Format::Time);
        appsrc.set_property("block", false);

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            input_done: None,
            output_ready: None,
            info,
            layout,
            playing: false,
        })
    }

    fn build_pipeline_string(config: &EncoderConfig, encoder: &str) -> String {
        // Encoders must not reorder frames: inputs are released in submission order.
        let properties = match encoder {
            "v4l2h264enc" => {
                let mut controls = vec!["controls".to_string()];
                if let Some(bitrate) = config.bitrate {
                    controls.push(format!("video_bitrate={}", bitrate));
                }
                if let Some(intra) = config.intra {
                    controls.push(format!("h264_i_frame_period={}", intra));
                }
                format!("extra-controls=\"{}\"", controls.join(","))
            }
            "x264enc" => {
                let mut props = vec!["tune=zerolatency".to_string()];
                if let Some(bitrate) = config.bitrate {
                    props.push(format!("bitrate={}", bitrate / 1000));
                }
                if let Some(intra) = config.intra {
                    props.push(format!("key-int-max={}", intra));
                }
                props.join(" ")
            }
            _ => {
                let mut props = Vec::new();
                if let Some(bitrate) = config.bitrate {
                    props.push(format!("bitrate={}", bitrate));
                }
                if let Some(intra) = config.intra {
                    props.push(format!("gop-size={}", intra));
                }
                props.join(" ")
            }
        };

        format!(
            "appsrc name=src ! \
             videoconvert ! \
             {} {} ! \
             h264parse ! \
             video/x-h264,stream-format=byte-stream,alignment=au ! \
             appsink name=sink sync=false",
            encoder, properties
        )
    }

    /// Detect best available H.264 encoder (hardware > software)
    fn detect_h264_encoder() -> &'static str {
        let encoders = [
            "v4l2h264enc", // V4L2 M2M hardware encoder
            "x264enc",     // Software encoder
            "openh264enc", // Software encoder (fallback)
        ];

        for encoder in &encoders {
            if let Some(factory) = gst::ElementFactory::find(encoder) {
                debug!(
                    "Found encoder: {} - {}",
                    encoder,
                    factory.metadata("long-name").unwrap_or("")
                );
                return encoder;
            }
        }

        warn!("No H.264 encoder found, pipeline will fail to build");
        "x264enc"
    }

    fn play(&mut self) -> Result<()> {
        if let Some(output_ready) = self.output_ready.clone() {
            self.appsink.set_callbacks(
                gst_app::AppSinkCallbacks::builder()
                    .new_sample(move |sink| {
                        let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                        let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                        let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                        let timestamp_us = buffer.pts().map(|pts| pts.useconds() as i64).unwrap_or(0);
                        let keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
                        output_ready(map.as_slice(), timestamp_us, keyframe);
                        Ok(gst::FlowSuccess::Ok)
                    })
                    .build(),
            );
        }

        info!("Starting GStreamer encode pipeline");
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| encoder_error("Failed to start pipeline", e))?;
        self.playing = true;
        Ok(())
    }
}

impl Encoder for GstEncoder {
    fn set_input_done_callback(&mut self, callback: InputDoneCallback) {
        self.input_done = Some(callback);
    }

    fn set_output_ready_callback(&mut self, callback: OutputReadyCallback) {
        self.output_ready = Some(callback);
    }

    fn encode_buffer(&mut self, input: EncodeInput) -> Result<()> {
        if !self.playing {
            self.play()?;
        }

        let mut buffer = gst::Buffer::from_slice(InputMemory {
            data: input.data,
            sequence: input.sequence,
            done: self.input_done.clone(),
        });
        {
            let buffer = buffer.make_mut();
            buffer.set_pts(gst::ClockTime::from_useconds(input.timestamp_us.max(0) as u64));
            self.layout.attach(&self.info, buffer)?;
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| encoder_error("Failed to push buffer", e))?;
        Ok(())
    }

    fn stop(&mut self) {
        if !self.playing {
            return;
        }
        self.playing = false;

        info!("Stopping GStreamer encode pipeline");
        if let Err(e) = self.appsrc.end_of_stream() {
            warn!("Failed to signal end of stream: {}", e);
        }

        // Let the encoder flush what it still holds.
        if let Some(bus) = self.pipeline.bus() {
            let msg = bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(5),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
            if let Some(msg) = msg {
                if let gst::MessageView::Error(err) = msg.view() {
                    error!("Encoder pipeline error: {}", err.error());
                }
            }
        }

        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline: {:?}", e);
        }
    }
}

impl Drop for GstEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x264_pipeline_carries_rate_control() {
        let config = EncoderConfig {
            bitrate: Some(4_000_000),
            intra: Some(15),
            ..Default::default()
        };
        let pipeline = GstEncoder::build_pipeline_string(&config, "x264enc");
        assert!(pipeline.contains("x264enc tune=zerolatency bitrate=4000 key-int-max=15"));
        assert!(pipeline.starts_with("appsrc name=src"));
        assert!(pipeline.ends_with("appsink name=sink sync=false"));
    }

    #[test]
    fn buffers_carry_the_camera_stride() {
        gst::init().unwrap();
        // Luma stride padded well past the width.
        let info = StreamInfo {
            width: 100,
            height: 10,
            stride: 128,
            format: crate::capture::frame::PixelFormat::Yuv420,
        };
        let layout = PlaneLayout::of(&info);
        assert_eq!(layout.offsets, [0, 1280, 1600]);
        assert_eq!(layout.strides, [128, 64, 64]);

        let mut buffer = gst::Buffer::from_slice(vec![0u8; info.yuv420_size()]);
        layout.attach(&info, buffer.make_mut()).unwrap();

        let meta = buffer.meta::<gst_video::VideoMeta>().unwrap();
        assert_eq!(meta.format(), gst_video::VideoFormat::I420);
        assert_eq!((meta.width(), meta.height()), (100, 10));
        assert_eq!(meta.stride(), &[128, 64, 64]);
        assert_eq!(meta.offset(), &[0, 1280, 1600]);
    }

    #[test]
    fn v4l2_pipeline_uses_extra_controls() {
        let config = EncoderConfig {
            bitrate: Some(10_000_000),
            ..Default::default()
        };
        let pipeline = GstEncoder::build_pipeline_string(&config, "v4l2h264enc");
        assert!(pipeline.contains("v4l2h264enc extra-controls=\"controls,video_bitrate=10000000\""));
    }
}

//! Test doubles for the camera, encoder and clock

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use flume::{Receiver, Sender};

use crate::capture::camera::{Camera, CameraMsg, ControlList};
use crate::capture::frame::{AfState, CapturedFrame, FrameMetadata, PixelFormat, StreamInfo};
use crate::encoder::{EncodeInput, Encoder, InputDoneCallback, OutputReadyCallback};
use crate::error::{LapseError, Result};
use crate::pipeline::clock::{Clock, WaitOutcome};

/// 8x4 planar YUV420
pub fn test_stream() -> StreamInfo {
    StreamInfo {
        width: 8,
        height: 4,
        stride: 8,
        format: PixelFormat::Yuv420,
    }
}

pub fn test_frame(sequence: u64, info: StreamInfo, fill: u8) -> CapturedFrame {
    let plane = BytesMut::from(&vec![fill; info.yuv420_size()][..]);
    CapturedFrame::new(
        vec![plane],
        info,
        FrameMetadata {
            sequence,
            ..Default::default()
        },
    )
}

/// Virtual time: waits jump straight to their deadline.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }

    fn wait_until(&self, deadline: Instant, wake: &Receiver<()>) -> WaitOutcome {
        if wake.try_recv().is_ok() {
            return WaitOutcome::Woken;
        }
        let mut now = self.now.lock().unwrap();
        if deadline > *now {
            *now = deadline;
        }
        WaitOutcome::Elapsed
    }
}

/// What the next [`Camera::wait`] returns.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Frame,
    Timeout,
    Quit,
    Fail,
}

type CaptureHook = Box<dyn FnMut(u64) + Send>;

/// Camera whose `wait` results are scripted; frames by default.
pub struct ScriptedCamera {
    pub info: StreamInfo,
    script: VecDeque<Step>,
    af_states: VecDeque<AfState>,
    latency: Vec<Duration>,
    clock: Option<ManualClock>,
    on_capture: Option<CaptureHook>,
    calls: Arc<Mutex<Vec<String>>>,
    streaming: bool,
    configured: Option<&'static str>,
    captures: u64,
    fill: u8,
}

impl ScriptedCamera {
    pub fn new() -> Self {
        Self {
            info: test_stream(),
            script: VecDeque::new(),
            af_states: VecDeque::new(),
            latency: Vec::new(),
            clock: None,
            on_capture: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            streaming: false,
            configured: None,
            captures: 0,
            fill: 0,
        }
    }

    pub fn script(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.extend(steps);
        self
    }

    pub fn af_states(mut self, states: impl IntoIterator<Item = AfState>) -> Self {
        self.af_states.extend(states);
        self
    }

    /// Advance `clock` by `latency[n]` on the n-th wait (last value repeats).
    pub fn latency(mut self, clock: ManualClock, latency: Vec<Duration>) -> Self {
        self.clock = Some(clock);
        self.latency = latency;
        self
    }

    /// Called with the running capture count after every delivered frame.
    pub fn on_capture(mut self, hook: impl FnMut(u64) + Send + 'static) -> Self {
        self.on_capture = Some(Box::new(hook));
        self
    }

    /// Each delivered frame is filled with `fill`, `fill + 1`, ...
    pub fn fill_from(mut self, fill: u8) -> Self {
        self.fill = fill;
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        self.calls.clone()
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl Camera for ScriptedCamera {
    fn open(&mut self) -> Result<()> {
        self.log("open");
        Ok(())
    }

    fn close(&mut self) {
        self.log("close");
    }

    fn configure_viewfinder(&mut self) -> Result<()> {
        self.log("configure_viewfinder");
        self.configured = Some("viewfinder");
        Ok(())
    }

    fn configure_still(&mut self) -> Result<()> {
        self.log("configure_still");
        self.configured = Some("still");
        Ok(())
    }

    fn teardown(&mut self) {
        self.log("teardown");
        self.configured = None;
    }

    fn start(&mut self) -> Result<()> {
        self.log("start");
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.log("stop");
        self.streaming = false;
    }

    fn wait(&mut self) -> Result<CameraMsg> {
        assert!(self.streaming, "wait() on a stopped camera");
        if let Some(clock) = &self.clock {
            let index = (self.captures as usize).min(self.latency.len().saturating_sub(1));
            if let Some(latency) = self.latency.get(index) {
                clock.advance(*latency);
            }
        }

        match self.script.pop_front().unwrap_or(Step::Frame) {
            Step::Timeout => Ok(CameraMsg::Timeout),
            Step::Quit => Ok(CameraMsg::Quit),
            Step::Fail => Err(LapseError::Camera(std::io::Error::other("sensor failure"))),
            Step::Frame => {
                let fill = self.fill.wrapping_add(self.captures as u8);
                let mut frame = test_frame(self.captures, self.info, fill);
                frame.meta.af_state = self.af_states.pop_front();
                frame.meta.lens_position = Some(self.captures as f32);
                self.captures += 1;
                if let Some(hook) = self.on_capture.as_mut() {
                    hook(self.captures);
                }
                Ok(CameraMsg::FrameReady(frame))
            }
        }
    }

    fn set_controls(&mut self, controls: &ControlList) -> Result<()> {
        self.log(format!(
            "set_controls {:?} {:?}",
            controls.af_mode, controls.af_trigger
        ));
        Ok(())
    }

    fn still_stream(&self) -> Option<StreamInfo> {
        (self.configured == Some("still")).then_some(self.info)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Submission {
    pub sequence: u64,
    pub timestamp_us: i64,
    pub len: usize,
}

/// Records submissions and completes them anonymously on a worker thread,
/// unless built with [`RecordingEncoder::holding`].
pub struct RecordingEncoder {
    hold: bool,
    submissions: Arc<Mutex<Vec<Submission>>>,
    input_done: Option<InputDoneCallback>,
    output_ready: Option<OutputReadyCallback>,
    worker: Option<(Sender<EncodeInput>, JoinHandle<()>)>,
    held: Vec<EncodeInput>,
}

impl RecordingEncoder {
    pub fn new() -> Self {
        Self {
            hold: false,
            submissions: Arc::new(Mutex::new(Vec::new())),
            input_done: None,
            output_ready: None,
            worker: None,
            held: Vec::new(),
        }
    }

    pub fn holding() -> Self {
        Self {
            hold: true,
            ..Self::new()
        }
    }

    pub fn submissions(&self) -> Arc<Mutex<Vec<Submission>>> {
        self.submissions.clone()
    }
}

impl Encoder for RecordingEncoder {
    fn set_input_done_callback(&mut self, callback: InputDoneCallback) {
        self.input_done = Some(callback);
    }

    fn set_output_ready_callback(&mut self, callback: OutputReadyCallback) {
        self.output_ready = Some(callback);
    }

    fn encode_buffer(&mut self, input: EncodeInput) -> Result<()> {
        self.submissions.lock().unwrap().push(Submission {
            sequence: input.sequence,
            timestamp_us: input.timestamp_us,
            len: input.data.len(),
        });

        if self.hold {
            self.held.push(input);
            return Ok(());
        }

        if self.worker.is_none() {
            let (tx, rx) = flume::unbounded::<EncodeInput>();
            let input_done = self.input_done.clone();
            let output_ready = self.output_ready.clone();
            let handle = std::thread::spawn(move || {
                for input in rx.iter() {
                    if let Some(output_ready) = &output_ready {
                        output_ready(&input.data, input.timestamp_us, true);
                    }
                    drop(input);
                    if let Some(input_done) = &input_done {
                        input_done(None);
                    }
                }
            });
            self.worker = Some((tx, handle));
        }
        if let Some((tx, _)) = &self.worker {
            tx.send(input).unwrap();
        }
        Ok(())
    }

    fn stop(&mut self) {
        if let Some((tx, handle)) = self.worker.take() {
            drop(tx);
            handle.join().unwrap();
        }
        self.held.clear();
    }
}

//! Fixed-cadence still capture loop

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::capture::camera::{Camera, CameraMsg};
use crate::capture::frame::CapturedFrame;
use crate::error::{LapseError, Result};
use crate::pipeline::cancel::{CancellationSource, ControlEvent};
use crate::pipeline::clock::{Clock, WaitOutcome};
use crate::pipeline::handoff::EncodeHandoff;
use crate::postprocess::PostProcessor;

/// Where the schedule stands. `next_capture_time` only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleState {
    pub next_capture_time: Instant,
    /// `None` runs until cancelled
    pub end_time: Option<Instant>,
    pub interval: Duration,
    pub frame_count: u64,
    pub delayed_frame_count: u64,
}

impl ScheduleState {
    /// A zero `timeout` means no end time.
    pub fn new(start: Instant, interval: Duration, timeout: Duration) -> Self {
        Self {
            next_capture_time: start,
            end_time: (!timeout.is_zero()).then(|| start + timeout),
            interval,
            frame_count: 0,
            delayed_frame_count: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time
            .is_some_and(|end| self.next_capture_time > end)
    }

    /// Move to the next slot. If `now` is already past it, snap to `now`
    /// and return how late we are.
    pub fn advance(&mut self, now: Instant) -> Option<Duration> {
        self.next_capture_time += self.interval;
        if now > self.next_capture_time {
            let late = now - self.next_capture_time;
            self.next_capture_time = now;
            self.delayed_frame_count += 1;
            return Some(late);
        }
        None
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The end time was reached
    Completed,
    /// Stopped by the user or by camera shutdown
    Cancelled,
    Failed(LapseError),
}

/// Counters and final schedule, reported on every exit path
#[derive(Debug)]
pub struct RunSummary {
    pub state: ScheduleState,
    pub outcome: RunOutcome,
}

impl RunSummary {
    pub fn frame_count(&self) -> u64 {
        self.state.frame_count
    }

    pub fn delayed_frame_count(&self) -> u64 {
        self.state.delayed_frame_count
    }
}

enum Shot {
    Frame(CapturedFrame),
    TimedOut,
    Quit,
}

pub struct CaptureScheduler<'a, K: Clock> {
    camera: &'a mut dyn Camera,
    clock: &'a K,
    cancel: &'a CancellationSource,
    handoff: &'a mut EncodeHandoff,
    post: &'a mut PostProcessor,
}

impl<'a, K: Clock> CaptureScheduler<'a, K> {
    pub fn new(
        camera: &'a mut dyn Camera,
        clock: &'a K,
        cancel: &'a CancellationSource,
        handoff: &'a mut EncodeHandoff,
        post: &'a mut PostProcessor,
    ) -> Self {
        Self {
            camera,
            clock,
            cancel,
            handoff,
            post,
        }
    }

    /// Capture one still per `interval` until `timeout` has elapsed or the
    /// run is cancelled. The camera only streams for the duration of each
    /// capture.
    pub fn run(&mut self, interval: Duration, timeout: Duration) -> RunSummary {
        let mut state = ScheduleState::new(self.clock.now(), interval, timeout);

        let start = chrono::Local::now();
        match chrono::Duration::from_std(timeout) {
            Ok(length) if !timeout.is_zero() => info!(
                "Start Time: {} End Time: {}",
                start.format("%c"),
                (start + length).format("%c")
            ),
            _ => info!("Start Time: {} End Time: none", start.format("%c")),
        }

        let outcome = loop {
            match self.tick(&mut state) {
                Ok(Some(outcome)) => break outcome,
                Ok(None) => {}
                Err(err) => {
                    error!("ERROR: *** {} ***", err);
                    self.camera.stop();
                    break RunOutcome::Failed(err);
                }
            }
        };

        info!("Captured frame = {}", state.frame_count);
        info!("Delayed frame = {}", state.delayed_frame_count);
        RunSummary { state, outcome }
    }

    /// One scheduling step. Returns the outcome once the loop should end.
    fn tick(&mut self, state: &mut ScheduleState) -> Result<Option<RunOutcome>> {
        if state.is_finished() {
            return Ok(Some(RunOutcome::Completed));
        }

        self.handoff.check()?;

        match self.cancel.poll() {
            ControlEvent::Stop => {
                info!("Stop requested");
                return Ok(Some(RunOutcome::Cancelled));
            }
            ControlEvent::Proceed => debug!("Proceed requested"),
            ControlEvent::None => {}
        }

        if self
            .clock
            .wait_until(state.next_capture_time, self.cancel.waker())
            == WaitOutcome::Woken
        {
            return Ok(None);
        }

        match self.capture_image()? {
            Shot::Frame(mut frame) => {
                self.post.process(&mut frame)?;
                self.handoff.enqueue(frame)?;
                state.frame_count += 1;
                metrics::counter!("lapse_frames_captured").increment(1);
            }
            Shot::TimedOut => {}
            Shot::Quit => {
                info!("Camera shut down");
                return Ok(Some(RunOutcome::Cancelled));
            }
        }

        if let Some(late) = state.advance(self.clock.now()) {
            warn!("Next frame capture delayed by {}ms", late.as_millis());
            metrics::counter!("lapse_frames_delayed").increment(1);
        }
        Ok(None)
    }

    fn capture_image(&mut self) -> Result<Shot> {
        self.camera.start()?;
        let started = self.clock.now();

        let shot = match self.camera.wait() {
            Ok(CameraMsg::FrameReady(frame)) => Shot::Frame(frame),
            Ok(CameraMsg::Timeout) | Err(LapseError::CameraTimeout) => {
                error!("ERROR: Device timeout detected, attempting a restart!!!");
                metrics::counter!("lapse_camera_timeouts").increment(1);
                self.camera.stop();
                self.camera.start()?;
                Shot::TimedOut
            }
            Ok(CameraMsg::Quit) => Shot::Quit,
            Err(err) => return Err(err),
        };
        self.camera.stop();

        let latency = self.clock.now().saturating_duration_since(started);
        metrics::histogram!("lapse_capture_latency_ms").record(latency.as_secs_f64() * 1000.0);
        Ok(shot)
    }
}

//! One-shot focus scan run before the timelapse starts

use tracing::{debug, error, info};

use crate::capture::camera::{AfTrigger, Camera, CameraMsg, ControlList};
use crate::capture::frame::AfState;
use crate::error::{LapseError, Result};
use crate::pipeline::cancel::{CancellationSource, ControlEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrescanState {
    Idle,
    Scanning,
    Complete,
    Cancelled,
}

pub struct AutofocusPrescan<'a> {
    camera: &'a mut dyn Camera,
    cancel: &'a CancellationSource,
    state: PrescanState,
}

impl<'a> AutofocusPrescan<'a> {
    pub fn new(camera: &'a mut dyn Camera, cancel: &'a CancellationSource) -> Self {
        Self {
            camera,
            cancel,
            state: PrescanState::Idle,
        }
    }

    /// Stream the viewfinder configuration and trigger a scan, returning
    /// once it settles or the user cancels. On completion the viewfinder
    /// configuration has been torn down.
    pub fn run(mut self) -> Result<PrescanState> {
        self.camera.configure_viewfinder()?;
        self.camera.start()?;
        self.camera
            .set_controls(&ControlList::autofocus(AfTrigger::Start))?;
        self.state = PrescanState::Scanning;

        info!("Running autofocus before capturing timelapse...");
        while self.state == PrescanState::Scanning {
            self.step()?;
        }
        Ok(self.state)
    }

    fn step(&mut self) -> Result<()> {
        let frame = match self.camera.wait() {
            Ok(CameraMsg::FrameReady(frame)) => frame,
            Ok(CameraMsg::Timeout) | Err(LapseError::CameraTimeout) => {
                error!("ERROR: Device timeout detected, attempting a restart!!!");
                self.camera.stop();
                return self.camera.start();
            }
            Ok(CameraMsg::Quit) => {
                self.camera.stop();
                self.state = PrescanState::Cancelled;
                return Ok(());
            }
            Err(err) => {
                self.camera.stop();
                return Err(err);
            }
        };

        if self.cancel.poll() == ControlEvent::Stop {
            info!("Autofocus cancelled");
            self.camera.stop();
            self.state = PrescanState::Cancelled;
            return Ok(());
        }

        let lens = frame.meta.lens_position.unwrap_or_default();
        match frame.meta.af_state {
            None | Some(AfState::Idle) => debug!("Current AF Scan Status: Idle."),
            Some(AfState::Scanning) => {
                debug!("Current AF Scan Status: Scanning. Lens position = {}", lens)
            }
            Some(state) => {
                info!(
                    "Autofocus completed ({:?}). Lens position set to {}",
                    state, lens
                );
                self.camera.stop();
                self.camera.teardown();
                self.state = PrescanState::Complete;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedCamera, Step};

    fn calls(camera: &ScriptedCamera) -> Vec<String> {
        camera.calls().lock().unwrap().clone()
    }

    #[test]
    fn scan_completes_and_tears_down_viewfinder() {
        let mut camera = ScriptedCamera::new().af_states([
            AfState::Idle,
            AfState::Scanning,
            AfState::Scanning,
            AfState::Focused,
        ]);
        let cancel = CancellationSource::new(false, false);

        let state = AutofocusPrescan::new(&mut camera, &cancel).run().unwrap();

        assert_eq!(state, PrescanState::Complete);
        assert_eq!(
            calls(&camera),
            [
                "configure_viewfinder",
                "start",
                "set_controls Some(Auto) Some(Start)",
                "stop",
                "teardown",
            ]
        );
        assert_eq!(camera.still_stream(), None);
    }

    #[test]
    fn failed_scan_still_completes() {
        let mut camera = ScriptedCamera::new().af_states([AfState::Scanning, AfState::Failed]);
        let cancel = CancellationSource::new(false, false);
        let state = AutofocusPrescan::new(&mut camera, &cancel).run().unwrap();
        assert_eq!(state, PrescanState::Complete);
    }

    #[test]
    fn timeout_restarts_and_keeps_scanning() {
        let mut camera = ScriptedCamera::new()
            .script([Step::Timeout, Step::Frame, Step::Frame])
            .af_states([AfState::Scanning, AfState::Focused]);
        let cancel = CancellationSource::new(false, false);

        let state = AutofocusPrescan::new(&mut camera, &cancel).run().unwrap();

        assert_eq!(state, PrescanState::Complete);
        let calls = calls(&camera);
        assert_eq!(calls.iter().filter(|c| *c == "start").count(), 2);
        assert_eq!(calls.last().map(String::as_str), Some("teardown"));
    }

    #[test]
    fn stop_request_cancels_scan() {
        let cancel = CancellationSource::new(true, false);
        let handle = cancel.handle();
        let mut camera = ScriptedCamera::new()
            .af_states([AfState::Scanning; 8])
            .on_capture(move |count: u64| {
                if count == 2 {
                    handle.key_pressed('x');
                }
            });

        let state = AutofocusPrescan::new(&mut camera, &cancel).run().unwrap();

        assert_eq!(state, PrescanState::Cancelled);
        let calls = calls(&camera);
        assert_eq!(calls.last().map(String::as_str), Some("stop"));
        assert!(!calls.iter().any(|c| c == "teardown"));
    }

    #[test]
    fn camera_quit_cancels_scan() {
        let mut camera = ScriptedCamera::new().script([Step::Frame, Step::Quit]);
        let cancel = CancellationSource::new(false, false);
        let state = AutofocusPrescan::new(&mut camera, &cancel).run().unwrap();
        assert_eq!(state, PrescanState::Cancelled);
    }

    #[test]
    fn camera_error_propagates() {
        let mut camera = ScriptedCamera::new().script([Step::Fail]);
        let cancel = CancellationSource::new(false, false);
        assert!(AutofocusPrescan::new(&mut camera, &cancel).run().is_err());
    }
}

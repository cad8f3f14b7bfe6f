//! One timelapse run, from opening the camera to the final counters

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, info, instrument};

use crate::capture::camera::{AfTrigger, Camera, ControlList};
use crate::capture::frame::{FrameMetadata, StreamInfo};
use crate::encoder::{self, Encoder, OutputReadyCallback};
use crate::error::{LapseError, Result};
use crate::output::Output;
use crate::pipeline::autofocus::{AutofocusPrescan, PrescanState};
use crate::pipeline::cancel::CancellationSource;
use crate::pipeline::clock::Clock;
use crate::pipeline::handoff::{EncodeHandoff, MetadataReadyCallback};
use crate::pipeline::scheduler::{CaptureScheduler, RunOutcome, RunSummary, ScheduleState};
use crate::postprocess::{PostProcessor, StageRegistry};
use crate::Config;

type SharedOutput = Arc<Mutex<Box<dyn Output>>>;

pub struct LapseApp<'a, K: Clock> {
    config: &'a Config,
    camera: &'a mut dyn Camera,
    clock: K,
    cancel: &'a CancellationSource,
    registry: StageRegistry,
}

impl<'a, K: Clock> LapseApp<'a, K> {
    pub fn new(
        config: &'a Config,
        camera: &'a mut dyn Camera,
        clock: K,
        cancel: &'a CancellationSource,
    ) -> Self {
        Self {
            config,
            camera,
            clock,
            cancel,
            registry: StageRegistry::default(),
        }
    }

    /// Run with the encoder selected by the configuration.
    pub fn run(self, output: Box<dyn Output>) -> Result<RunSummary> {
        let config = self.config;
        self.run_with(output, |info, framerate| {
            encoder::create(&config.encoder, info, framerate)
        })
    }

    /// Run with an encoder built by `make_encoder` once the still stream is
    /// configured.
    ///
    /// Setup failures are returned as errors. Once capturing has begun every
    /// exit, including failures, is reported through [`RunSummary`].
    #[instrument(skip_all)]
    pub fn run_with<F>(mut self, output: Box<dyn Output>, make_encoder: F) -> Result<RunSummary>
    where
        F: FnOnce(StreamInfo, f64) -> Result<Box<dyn Encoder>>,
    {
        let interval = self.config.lapse.interval()?;
        let timeout = self.config.lapse.timeout()?;
        let framerate = self.config.lapse.framerate()?;
        let mut post = PostProcessor::from_config(&self.registry, &self.config.post_process)?;

        self.camera.open()?;
        let result = self.session(interval, timeout, framerate, &mut post, output, make_encoder);
        post.stop();
        self.camera.close();
        result
    }

    fn session<F>(
        &mut self,
        interval: std::time::Duration,
        timeout: std::time::Duration,
        framerate: f64,
        post: &mut PostProcessor,
        output: Box<dyn Output>,
        make_encoder: F,
    ) -> Result<RunSummary>
    where
        F: FnOnce(StreamInfo, f64) -> Result<Box<dyn Encoder>>,
    {
        let autofocus = self.config.lapse.autofocus_on_capture;
        if autofocus {
            let prescan = AutofocusPrescan::new(&mut *self.camera, self.cancel).run()?;
            if prescan == PrescanState::Cancelled {
                return Ok(RunSummary {
                    state: ScheduleState::new(self.clock.now(), interval, timeout),
                    outcome: RunOutcome::Cancelled,
                });
            }
        }

        self.camera.configure_still()?;
        if autofocus {
            // Lock focus where the scan left it.
            self.camera
                .set_controls(&ControlList::autofocus(AfTrigger::Cancel))?;
        }

        let stream = self
            .camera
            .still_stream()
            .filter(StreamInfo::is_configured)
            .ok_or(LapseError::StreamNotConfigured)?;
        post.configure(&stream)?;

        let encoder = make_encoder(stream, framerate)?;
        info!(
            "Still stream {}x{} stride {}, {} fps timestamps",
            stream.width, stream.height, stream.stride, framerate
        );

        let output: SharedOutput = Arc::new(Mutex::new(output));
        let output_failure = Arc::new(Mutex::new(None::<io::Error>));
        let mut handoff = EncodeHandoff::start(
            encoder,
            framerate,
            output_ready(output.clone(), output_failure.clone()),
            self.config
                .output
                .metadata
                .is_some()
                .then(|| metadata_ready(output.clone(), output_failure.clone())),
        );

        let mut summary = CaptureScheduler::new(
            &mut *self.camera,
            &self.clock,
            self.cancel,
            &mut handoff,
            post,
        )
        .run(interval, timeout);

        self.camera.stop();
        handoff.stop();

        if !matches!(summary.outcome, RunOutcome::Failed(_)) {
            let failure = output_failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Err(err) = handoff.check() {
                summary.outcome = RunOutcome::Failed(err);
            } else if let Some(err) = failure {
                summary.outcome = RunOutcome::Failed(LapseError::Output(err));
            }
        }
        Ok(summary)
    }
}

fn record_failure(failure: &Mutex<Option<io::Error>>, err: io::Error) {
    error!("ERROR: *** output failed: {} ***", err);
    let mut failure = failure.lock().unwrap_or_else(PoisonError::into_inner);
    if failure.is_none() {
        *failure = Some(err);
    }
}

fn output_ready(output: SharedOutput, failure: Arc<Mutex<Option<io::Error>>>) -> OutputReadyCallback {
    Arc::new(move |data: &[u8], timestamp_us: i64, keyframe: bool| {
        let mut output = output.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = output.output_ready(data, timestamp_us, keyframe) {
            record_failure(&failure, err);
        }
    })
}

fn metadata_ready(
    output: SharedOutput,
    failure: Arc<Mutex<Option<io::Error>>>,
) -> MetadataReadyCallback {
    Arc::new(move |metadata: &FrameMetadata| {
        let mut output = output.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = output.metadata_ready(metadata) {
            record_failure(&failure, err);
        }
    })
}

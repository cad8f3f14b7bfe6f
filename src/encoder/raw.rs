//! Pass-through "yuv420" encoder running on its own worker thread

use std::thread::JoinHandle;

use flume::Sender;
use tracing::{debug, warn};

use crate::encoder::{EncodeInput, Encoder, InputDoneCallback, OutputReadyCallback};
use crate::error::{LapseError, Result};

/// Emits every submitted frame unchanged as a keyframe.
#[derive(Default)]
pub struct RawEncoder {
    input_done: Option<InputDoneCallback>,
    output_ready: Option<OutputReadyCallback>,
    worker: Option<(Sender<EncodeInput>, JoinHandle<()>)>,
}

impl RawEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&mut self) -> Result<Sender<EncodeInput>> {
        if let Some((tx, _)) = &self.worker {
            return Ok(tx.clone());
        }

        let (tx, rx) = flume::unbounded::<EncodeInput>();
        let input_done = self.input_done.clone();
        let output_ready = self.output_ready.clone();

        let handle = std::thread::Builder::new()
            .name("raw-encoder".into())
            .spawn(move || {
                for input in rx.iter() {
                    if let Some(output_ready) = &output_ready {
                        output_ready(&input.data, input.timestamp_us, true);
                    }
                    let sequence = input.sequence;
                    drop(input);
                    if let Some(input_done) = &input_done {
                        input_done(Some(sequence));
                    }
                }
                debug!("Raw encoder drained");
            })
            .map_err(|e| LapseError::Encoder(e.to_string()))?;
        self.worker = Some((tx.clone(), handle));
        Ok(tx)
    }
}

impl Encoder for RawEncoder {
    fn set_input_done_callback(&mut self, callback: InputDoneCallback) {
        self.input_done = Some(callback);
    }

    fn set_output_ready_callback(&mut self, callback: OutputReadyCallback) {
        self.output_ready = Some(callback);
    }

    fn encode_buffer(&mut self, input: EncodeInput) -> Result<()> {
        self.sender()?
            .send(input)
            .map_err(|_| LapseError::Encoder("raw encoder worker exited".into()))
    }

    fn stop(&mut self) {
        if let Some((tx, handle)) = self.worker.take() {
            drop(tx);
            if handle.join().is_err() {
                warn!("Raw encoder worker panicked");
            }
        }
    }
}

impl Drop for RawEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

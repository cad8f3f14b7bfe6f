//! Zero-copy handoff of captured frames to the encoder
//!
//! The tracking queue is the only state shared between the scheduler and
//! the encoder's completion context. Each entry keeps its frame alive until
//! the encoder reports the matching input as consumed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, warn};

use crate::capture::frame::{CapturedFrame, FrameMetadata, SharedFramePtr};
use crate::encoder::{EncodeInput, Encoder, OutputReadyCallback};
use crate::error::{LapseError, Result};

pub type MetadataReadyCallback = Arc<dyn Fn(&FrameMetadata) + Send + Sync>;

struct EncodeQueueEntry {
    sequence: u64,
    frame: SharedFramePtr,
}

struct Shared {
    queue: Mutex<VecDeque<EncodeQueueEntry>>,
    metadata_ready: Option<MetadataReadyCallback>,
    fatal: Mutex<Option<LapseError>>,
}

impl Shared {
    fn on_encode_complete(&self, completed: Option<u64>) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(entry) = queue.pop_front() else {
            self.latch(LapseError::EmptyEncodeQueue);
            return;
        };

        if let Some(completed) = completed {
            if completed != entry.sequence {
                self.latch(LapseError::OutOfOrderCompletion {
                    expected: entry.sequence,
                    completed,
                });
                return;
            }
        }

        if let Some(metadata_ready) = &self.metadata_ready {
            metadata_ready(&entry.frame.meta);
        }
        metrics::gauge!("lapse_encode_queue_depth").set(queue.len() as f64);
        // Dropping the entry releases our hold on the frame.
    }

    fn latch(&self, err: LapseError) {
        error!("ERROR: *** {} ***", err);
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }
}

/// Hands captured frames to an encoder and tracks them until completion.
pub struct EncodeHandoff {
    shared: Arc<Shared>,
    encoder: Option<Box<dyn Encoder>>,
    framerate: f64,
    frame_count: u64,
}

impl EncodeHandoff {
    /// Wire `encoder`'s callbacks and reset the timestamp counter.
    ///
    /// Metadata is forwarded on completion only when `metadata_ready` is set.
    pub fn start(
        mut encoder: Box<dyn Encoder>,
        framerate: f64,
        output_ready: OutputReadyCallback,
        metadata_ready: Option<MetadataReadyCallback>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            metadata_ready,
            fatal: Mutex::new(None),
        });

        let completion = shared.clone();
        encoder.set_input_done_callback(Arc::new(move |completed: Option<u64>| {
            completion.on_encode_complete(completed)
        }));
        encoder.set_output_ready_callback(output_ready);

        Self {
            shared,
            encoder: Some(encoder),
            framerate,
            frame_count: 0,
        }
    }

    /// Take ownership of `frame` and submit its plane memory for encoding.
    pub fn enqueue(&mut self, frame: CapturedFrame) -> Result<()> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| LapseError::Encoder("encoder is stopped".into()))?;

        let frame: SharedFramePtr = Arc::new(frame.freeze());
        let data = frame
            .plane(0)
            .filter(|plane| !plane.is_empty())
            .cloned()
            .ok_or(LapseError::NoBuffer)?;

        let sequence = self.frame_count;
        let timestamp_us = (self.frame_count as f64 * 1_000_000.0 / self.framerate) as i64;
        self.frame_count += 1;

        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.push_back(EncodeQueueEntry {
                sequence,
                frame: frame.clone(),
            });
            metrics::gauge!("lapse_encode_queue_depth").set(queue.len() as f64);
        }

        debug!(sequence, timestamp_us, size = data.len(), "Submitting frame to encoder");
        encoder.encode_buffer(EncodeInput {
            sequence,
            data,
            info: frame.info,
            timestamp_us,
        })
    }

    /// Surface a protocol violation seen on the completion context.
    pub fn check(&self) -> Result<()> {
        let mut fatal = self
            .shared
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Frames submitted but not yet released by the encoder.
    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn encoded_count(&self) -> u64 {
        self.frame_count
    }

    /// Drain and release the encoder.
    pub fn stop(&mut self) {
        let Some(mut encoder) = self.encoder.take() else {
            return;
        };
        encoder.stop();
        drop(encoder);

        let mut queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !queue.is_empty() {
            warn!("Encoder stopped with {} frames never completed", queue.len());
            queue.clear();
        }
    }
}

impl Drop for EncodeHandoff {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_frame, test_stream, RecordingEncoder};

    fn handoff_with(
        encoder: RecordingEncoder,
        metadata: Option<MetadataReadyCallback>,
    ) -> EncodeHandoff {
        EncodeHandoff::start(Box::new(encoder), 30.0, Arc::new(|_: &[u8], _: i64, _: bool| {}), metadata)
    }

    #[test]
    fn completions_follow_enqueue_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let encoder = RecordingEncoder::new();
        let submissions = encoder.submissions();
        let mut handoff = handoff_with(
            encoder,
            Some(Arc::new(move |meta: &FrameMetadata| {
                log.lock().unwrap().push(meta.sequence)
            })),
        );

        for sequence in [11, 12, 13, 14] {
            handoff.enqueue(test_frame(sequence, test_stream(), 1)).unwrap();
        }
        handoff.stop();

        assert_eq!(*seen.lock().unwrap(), vec![11, 12, 13, 14]);
        assert_eq!(handoff.pending(), 0);
        handoff.check().unwrap();

        let timestamps: Vec<i64> = submissions.lock().unwrap().iter().map(|s| s.timestamp_us).collect();
        assert_eq!(timestamps, vec![0, 33_333, 66_666, 100_000]);
    }

    #[test]
    fn metadata_is_not_forwarded_without_sink() {
        let mut handoff = handoff_with(RecordingEncoder::new(), None);
        handoff.enqueue(test_frame(1, test_stream(), 0)).unwrap();
        handoff.stop();
        handoff.check().unwrap();
    }

    #[test]
    fn frame_without_memory_is_fatal() {
        let mut handoff = handoff_with(RecordingEncoder::new(), None);
        let frame = CapturedFrame::new(Vec::new(), test_stream(), FrameMetadata::default());
        assert!(matches!(handoff.enqueue(frame), Err(LapseError::NoBuffer)));
        assert_eq!(handoff.pending(), 0);
    }

    #[test]
    fn completion_with_empty_queue_is_latched() {
        let handoff = handoff_with(RecordingEncoder::new(), None);
        handoff.shared.on_encode_complete(None);
        assert!(matches!(handoff.check(), Err(LapseError::EmptyEncodeQueue)));
        // Reported once.
        handoff.check().unwrap();
    }

    #[test]
    fn mismatched_tag_is_latched() {
        let mut handoff = handoff_with(RecordingEncoder::holding(), None);
        handoff.enqueue(test_frame(1, test_stream(), 0)).unwrap();
        handoff.enqueue(test_frame(2, test_stream(), 0)).unwrap();
        assert_eq!(handoff.pending(), 2);

        handoff.shared.on_encode_complete(Some(1));
        assert!(matches!(
            handoff.check(),
            Err(LapseError::OutOfOrderCompletion {
                expected: 0,
                completed: 1
            })
        ));
    }

    #[test]
    fn stalled_encoder_accumulates_frames() {
        let mut handoff = handoff_with(RecordingEncoder::holding(), None);
        for sequence in 0..5 {
            handoff.enqueue(test_frame(sequence, test_stream(), 0)).unwrap();
        }
        assert_eq!(handoff.pending(), 5);
        assert_eq!(handoff.encoded_count(), 5);
        handoff.stop();
        assert_eq!(handoff.pending(), 0);
    }
}

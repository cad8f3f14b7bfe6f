//! Per-frame post-processing stages, resolved by name at setup

pub mod history;
pub mod motion_extraction;

use std::collections::HashMap;

use tracing::info;

use crate::capture::frame::{CapturedFrame, StreamInfo};
use crate::error::{LapseError, Result};
use crate::StageConfig;

pub use motion_extraction::MotionExtractionStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The frame was consumed without being changed
    Skipped,
    /// The frame now carries the stage's output
    Produced,
}

/// A stage that rewrites frames in place.
///
/// `process` gets exclusive access to the frame and runs on the caller's
/// context. `stop` cannot overlap a `process` call since both take
/// `&mut self`.
pub trait PostProcessingStage: Send {
    fn name(&self) -> &'static str;

    /// Apply parameters. Called once, before `configure`.
    fn read(&mut self, params: &serde_json::Value) -> Result<()>;

    /// Validate the stream layout and size internal buffers.
    fn configure(&mut self, stream: &StreamInfo) -> Result<()>;

    fn process(&mut self, frame: &mut CapturedFrame) -> Result<ProcessOutcome>;

    /// Release everything the stage retains.
    fn stop(&mut self) {}
}

pub type StageFactory = fn() -> Box<dyn PostProcessingStage>;

/// Name to factory lookup for stages
pub struct StageRegistry {
    factories: HashMap<&'static str, StageFactory>,
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, factory: StageFactory) {
        self.factories.insert(name, factory);
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn PostProcessingStage>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| LapseError::UnknownStage(name.to_string()))
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(motion_extraction::NAME, motion_extraction::create);
        registry
    }
}

/// Ordered chain of configured stages
#[derive(Default)]
pub struct PostProcessor {
    stages: Vec<Box<dyn PostProcessingStage>>,
}

impl PostProcessor {
    pub fn from_config(registry: &StageRegistry, configs: &[StageConfig]) -> Result<Self> {
        let mut stages = Vec::with_capacity(configs.len());
        for config in configs {
            let mut stage = registry.create(&config.stage)?;
            stage.read(&config.params)?;
            info!("Post-processing stage: {}", stage.name());
            stages.push(stage);
        }
        Ok(Self { stages })
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn configure(&mut self, stream: &StreamInfo) -> Result<()> {
        self.stages
            .iter_mut()
            .try_for_each(|stage| stage.configure(stream))
    }

    pub fn process(&mut self, frame: &mut CapturedFrame) -> Result<()> {
        for stage in &mut self.stages {
            stage.process(frame)?;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        for stage in &mut self.stages {
            stage.stop();
        }
    }
}

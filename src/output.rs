//! Output sinks for encoded data and frame metadata

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::capture::frame::FrameMetadata;
use crate::OutputConfig;

/// Receives encoded chunks and, when enabled, per-frame metadata.
///
/// Both methods are called from the encoder's context, never the
/// scheduler's.
pub trait Output: Send {
    fn output_ready(&mut self, data: &[u8], timestamp_us: i64, keyframe: bool) -> io::Result<()>;
    fn metadata_ready(&mut self, metadata: &FrameMetadata) -> io::Result<()>;
}

/// Writes the encoded stream to a file (or stdout for `-`) and metadata as
/// JSON lines.
pub struct FileOutput {
    stream: BufWriter<Box<dyn Write + Send>>,
    metadata: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl FileOutput {
    pub fn create(config: &OutputConfig) -> io::Result<Self> {
        let stream: Box<dyn Write + Send> = if config.path == "-" {
            Box::new(io::stdout())
        } else {
            Box::new(File::create(&config.path)?)
        };
        info!("Writing encoded output to {}", config.path);

        let metadata = match &config.metadata {
            Some(path) => Some(Self::open_metadata(path)?),
            None => None,
        };

        Ok(Self::from_writer(stream, metadata))
    }

    pub fn from_writer(stream: Box<dyn Write + Send>, metadata: Option<BufWriter<File>>) -> Self {
        Self {
            stream: BufWriter::new(stream),
            metadata,
            bytes_written: 0,
        }
    }

    fn open_metadata(path: &Path) -> io::Result<BufWriter<File>> {
        info!("Writing frame metadata to {}", path.display());
        Ok(BufWriter::new(File::create(path)?))
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl Output for FileOutput {
    fn output_ready(&mut self, data: &[u8], timestamp_us: i64, keyframe: bool) -> io::Result<()> {
        debug!(len = data.len(), timestamp_us, keyframe, "Encoded output");
        self.stream.write_all(data)?;
        self.stream.flush()?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn metadata_ready(&mut self, metadata: &FrameMetadata) -> io::Result<()> {
        let Some(out) = self.metadata.as_mut() else {
            return Ok(());
        };
        serde_json::to_writer(&mut *out, metadata)?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::AfState;
    use std::io::Read;

    #[test]
    fn writes_stream_and_metadata_lines() {
        let dir = tempfile::tempdir().unwrap();
        let config = OutputConfig {
            path: dir.path().join("out.yuv").display().to_string(),
            metadata: Some(dir.path().join("meta.jsonl")),
        };

        let mut output = FileOutput::create(&config).unwrap();
        output.output_ready(&[1, 2, 3], 0, true).unwrap();
        output.output_ready(&[4], 33_333, false).unwrap();
        output
            .metadata_ready(&FrameMetadata {
                sequence: 4,
                af_state: Some(AfState::Focused),
                lens_position: Some(2.5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(output.bytes_written(), 4);
        drop(output);

        let mut stream = Vec::new();
        File::open(dir.path().join("out.yuv"))
            .unwrap()
            .read_to_end(&mut stream)
            .unwrap();
        assert_eq!(stream, vec![1, 2, 3, 4]);

        let meta = std::fs::read_to_string(dir.path().join("meta.jsonl")).unwrap();
        let line: serde_json::Value = serde_json::from_str(meta.lines().next().unwrap()).unwrap();
        assert_eq!(line["sequence"], 4);
        assert_eq!(line["af_state"], "Focused");
    }
}

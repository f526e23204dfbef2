//! Destinations for the mixed stereo stream.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::{
    fs::File,
    io::BufWriter,
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use crate::error::{Result, StemError};

/// Consumer of interleaved stereo `f32` frames at the pipeline's output rate.
pub trait AudioSink: Send {
    fn write(&mut self, interleaved: &[f32]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when playback (re)starts after the stream sat idle.
    fn resume(&mut self) {}
}

/// Builds a fresh sink for each loaded graph, given the output sample rate.
pub type SinkFactory = Arc<dyn Fn(u32) -> Result<Box<dyn AudioSink>> + Send + Sync>;

/// Discards audio, optionally blocking so consumption happens at real-time speed.
pub struct NullSink {
    pace: Option<Pacer>,
}

struct Pacer {
    sample_rate: u32,
    started: Instant,
    frames: u64,
}

impl Pacer {
    fn restart(&mut self) {
        self.started = Instant::now();
        self.frames = 0;
    }
}

impl NullSink {
    pub fn new() -> Self {
        Self { pace: None }
    }

    pub fn realtime(sample_rate: u32) -> Self {
        Self {
            pace: Some(Pacer {
                sample_rate: sample_rate.max(1),
                started: Instant::now(),
                frames: 0,
            }),
        }
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for NullSink {
    fn write(&mut self, interleaved: &[f32]) -> Result<()> {
        if let Some(p) = &mut self.pace {
            if p.frames == 0 {
                p.started = Instant::now();
            }
            p.frames += (interleaved.len() / 2) as u64;
            let due = Duration::from_secs_f64(p.frames as f64 / p.sample_rate as f64);
            let elapsed = p.started.elapsed();
            if due > elapsed {
                thread::sleep(due - elapsed);
            }
        }
        Ok(())
    }

    fn resume(&mut self) {
        if let Some(p) = &mut self.pace {
            p.restart();
        }
    }
}

/// Captures everything written, for inspection by the owner of the handle.
pub struct MemorySink {
    buffer: Arc<Mutex<Vec<f32>>>,
}

impl MemorySink {
    pub fn new(buffer: Arc<Mutex<Vec<f32>>>) -> Self {
        Self { buffer }
    }
}

impl AudioSink for MemorySink {
    fn write(&mut self, interleaved: &[f32]) -> Result<()> {
        self.buffer
            .lock()
            .map_err(|_| StemError::Sink("capture buffer poisoned".into()))?
            .extend_from_slice(interleaved);
        Ok(())
    }
}

/// Renders the mix to a 32-bit float stereo WAV file.
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
}

impl WavSink {
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self> {
        let spec = WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let writer = WavWriter::create(path.as_ref(), spec)
            .map_err(|e| StemError::Sink(format!("{}: {e}", path.as_ref().display())))?;
        Ok(Self {
            writer: Some(writer),
        })
    }
}

impl AudioSink for WavSink {
    fn write(&mut self, interleaved: &[f32]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StemError::Sink("wav sink already finalized".into()))?;
        for s in interleaved {
            writer
                .write_sample(*s)
                .map_err(|e| StemError::Sink(e.to_string()))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(w) = self.writer.as_mut() {
            w.flush().map_err(|e| StemError::Sink(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        if let Some(w) = self.writer.take() {
            if let Err(e) = w.finalize() {
                log::warn!("failed to finalize wav output: {e}");
            }
        }
    }
}

#![allow(dead_code)]

use crossbeam_channel::Receiver;
use hound::{SampleFormat, WavSpec, WavWriter};
use stem_mixer_core::{AudioSink, MemorySink, NullSink, SinkFactory};
use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn spec(rate: u32, channels: u16) -> WavSpec {
    WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// In-memory WAV holding a constant `value` on every channel.
pub fn dc_wav_bytes(rate: u32, channels: u16, seconds: f32, value: f32) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut w = WavWriter::new(&mut cursor, spec(rate, channels)).unwrap();
        let frames = (rate as f32 * seconds) as usize;
        let sample = (value * i16::MAX as f32) as i16;
        for _ in 0..frames * channels as usize {
            w.write_sample(sample).unwrap();
        }
        w.finalize().unwrap();
    }
    cursor.into_inner()
}

pub fn write_dc_wav(path: &Path, rate: u32, channels: u16, seconds: f32, value: f32) -> PathBuf {
    std::fs::write(path, dc_wav_bytes(rate, channels, seconds, value)).unwrap();
    path.to_path_buf()
}

/// Collect events until `done` matches one or `timeout` passes.
pub fn collect_until<T: Clone>(
    rx: &Receiver<T>,
    timeout: Duration,
    mut done: impl FnMut(&T) -> bool,
) -> (Vec<T>, bool) {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(ev) => {
                let stop = done(&ev);
                seen.push(ev);
                if stop {
                    return (seen, true);
                }
            }
            Err(_) => break,
        }
    }
    (seen, false)
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Captures the mix while consuming it at real-time speed, like a device would.
struct PacedCapture {
    clock: NullSink,
    capture: MemorySink,
}

impl AudioSink for PacedCapture {
    fn write(&mut self, interleaved: &[f32]) -> stem_mixer_core::Result<()> {
        self.capture.write(interleaved)?;
        self.clock.write(interleaved)
    }

    fn resume(&mut self) {
        self.clock.resume();
    }
}

pub fn paced_capture(buf: Arc<Mutex<Vec<f32>>>) -> SinkFactory {
    Arc::new(move |rate: u32| -> stem_mixer_core::Result<Box<dyn AudioSink>> {
        buf.lock().unwrap().clear();
        Ok(Box::new(PacedCapture {
            clock: NullSink::realtime(rate),
            capture: MemorySink::new(buf.clone()),
        }))
    })
}

pub fn captured_len(buf: &Mutex<Vec<f32>>) -> usize {
    buf.lock().unwrap().len()
}

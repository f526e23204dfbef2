//! Playback on the default output device through cpal.
//!
//! A cpal `Stream` cannot leave the thread that built it, so a dedicated
//! thread owns it for the sink's lifetime. The mixer pushes frames into a
//! lock-free ring the device callback drains; when the ring runs dry the
//! device plays silence.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    error::{Result, StemError},
    mixer::sink::{AudioSink, SinkFactory},
};

/// Ring capacity in seconds of audio.
const RING_SECONDS: f32 = 0.1;
const FULL_WAIT: Duration = Duration::from_millis(2);

pub struct DeviceSink {
    producer: rtrb::Producer<f32>,
    sample_rate: u32,
    failed: Arc<AtomicBool>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceSink {
    /// Open the default output device at `sample_rate`.
    pub fn open(sample_rate: u32) -> Result<Self> {
        let capacity = ((sample_rate as f32 * RING_SECONDS) as usize).max(256) * 2;
        let (producer, consumer) = rtrb::RingBuffer::<f32>::new(capacity);
        let failed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let flag = failed.clone();
        let thread = thread::Builder::new()
            .name("stem-mixer-device".into())
            .spawn(move || {
                let stream = match start_stream(sample_rate, consumer, flag) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Held until the sink drops its sender.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| StemError::Sink(format!("device thread: {e}")))?;

        let started = ready_rx
            .recv()
            .map_err(|_| StemError::Sink("device thread exited before starting".into()))
            .and_then(|r| r);
        if let Err(e) = started {
            let _ = thread.join();
            return Err(e);
        }
        Ok(Self {
            producer,
            sample_rate,
            failed,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Factory for `MixingPipeline::new` that plays on the default device.
    pub fn factory() -> SinkFactory {
        Arc::new(|rate: u32| -> Result<Box<dyn AudioSink>> { Ok(Box::new(DeviceSink::open(rate)?)) })
    }

    fn check(&self) -> Result<()> {
        let gone = self.thread.as_ref().map(JoinHandle::is_finished).unwrap_or(true);
        if gone || self.failed.load(Ordering::Relaxed) {
            return Err(StemError::Sink("output device stream stopped".into()));
        }
        Ok(())
    }
}

impl AudioSink for DeviceSink {
    fn write(&mut self, interleaved: &[f32]) -> Result<()> {
        let mut rest = interleaved;
        while !rest.is_empty() {
            // whole frames only, so the callback never sees half of one
            let n = (self.producer.slots().min(rest.len())) & !1;
            if n == 0 {
                self.check()?;
                thread::sleep(FULL_WAIT);
                continue;
            }
            for s in &rest[..n] {
                let _ = self.producer.push(*s);
            }
            rest = &rest[n..];
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let capacity = self.producer.buffer().capacity();
        let deadline = Instant::now()
            + Duration::from_secs_f32(capacity as f32 / 2.0 / self.sample_rate.max(1) as f32)
            + Duration::from_millis(500);
        while self.producer.slots() < capacity {
            self.check()?;
            if Instant::now() >= deadline {
                log::warn!("output device did not drain before flush deadline");
                break;
            }
            thread::sleep(FULL_WAIT);
        }
        Ok(())
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                log::error!("device thread panicked");
            }
        }
    }
}

/// Pick a config on the default device and start streaming from `consumer`.
fn start_stream(
    sample_rate: u32,
    mut consumer: rtrb::Consumer<f32>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| StemError::Sink("no default output device".into()))?;
    let name = device.name().unwrap_or_else(|_| "unknown".into());

    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| StemError::Sink(e.to_string()))?
        .filter(|c| c.min_sample_rate().0 <= sample_rate && sample_rate <= c.max_sample_rate().0)
        .collect();
    let best = supported
        .iter()
        .find(|c| c.sample_format() == SampleFormat::F32 && c.channels() >= 2)
        .or_else(|| supported.iter().find(|c| c.sample_format() == SampleFormat::F32))
        .ok_or_else(|| {
            StemError::Sink(format!("{name} has no f32 output configuration at {sample_rate} Hz"))
        })?;

    let config: StreamConfig = best.clone().with_sample_rate(cpal::SampleRate(sample_rate)).config();
    let channels = config.channels as usize;
    log::info!("output device {name}: {channels} channels at {sample_rate} Hz");

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                fill_output(data, channels, &mut consumer);
            },
            move |err| {
                log::error!("output stream error: {err}");
                failed.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| StemError::Sink(e.to_string()))?;
    stream.play().map_err(|e| StemError::Sink(e.to_string()))?;
    Ok(stream)
}

/// Device callback body: stereo frames from `consumer` into a `channels`-wide
/// buffer, silence wherever the ring has no complete frame.
fn fill_output(data: &mut [f32], channels: usize, consumer: &mut rtrb::Consumer<f32>) {
    for frame in data.chunks_mut(channels.max(1)) {
        let pair = if consumer.slots() >= 2 {
            match (consumer.pop(), consumer.pop()) {
                (Ok(l), Ok(r)) => Some((l, r)),
                _ => None,
            }
        } else {
            None
        };
        match (pair, frame) {
            (Some((l, r)), [mono]) => *mono = 0.5 * (l + r),
            (Some((l, r)), [left, right, extra @ ..]) => {
                *left = l;
                *right = r;
                extra.iter_mut().for_each(|s| *s = 0.0);
            }
            (_, frame) => frame.iter_mut().for_each(|s| *s = 0.0),
        }
    }
}

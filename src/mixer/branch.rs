//! One stem branch: source, decode, and normalization to the output format.
//!
//! Each branch runs its own decoder thread. The source format is only known
//! once the stream header has been probed, so the thread announces it through
//! a notification callback; the streaming thread that owns the graph decides
//! what linking means. Decoded audio flows over a bounded channel, tagged with
//! the seek epoch it was decoded in.

use crossbeam_channel::{bounded, unbounded, Receiver, SendTimeoutError, Sender, TryRecvError};
use rubato::{FftFixedInOut, Resampler};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
    units::Time,
};

use crate::error::{Result, StemError};

const CHANNEL_DEPTH: usize = 16;
const RESAMPLE_CHUNK: usize = 1024;
const IDLE_WAIT: Duration = Duration::from_millis(20);
const JOIN_GRACE: Duration = Duration::from_secs(1);

/// Native format of a branch's source, as found in its stream header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchFormat {
    pub sample_rate: u32,
    pub channels: usize,
    /// Total frames at the native rate, when the container declares it.
    pub frames: Option<u64>,
}

impl BranchFormat {
    pub fn duration_ms(&self) -> Option<u64> {
        let frames = self.frames?;
        (self.sample_rate > 0).then(|| frames * 1000 / self.sample_rate as u64)
    }
}

/// Notifications a branch thread posts about itself.
#[derive(Debug)]
pub enum BranchEvent {
    FormatDiscovered { branch: usize, format: BranchFormat },
    Failed { branch: usize, error: StemError },
}

pub type BranchNotify = Box<dyn Fn(BranchEvent) + Send>;

#[derive(Debug)]
pub enum BranchData {
    /// Interleaved stereo at the output rate.
    Audio { epoch: u64, samples: Vec<f32> },
    EndOfStream { epoch: u64 },
}

enum BranchCommand {
    Seek {
        ms: u64,
        epoch: u64,
        done: Sender<bool>,
    },
}

/// Owning handle of a branch thread. Dropping it stops the thread.
pub struct BranchHandle {
    index: usize,
    path: PathBuf,
    data: Receiver<BranchData>,
    commands: Sender<BranchCommand>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl BranchHandle {
    pub fn spawn(index: usize, path: &Path, out_rate: u32, notify: BranchNotify) -> Result<Self> {
        let (data_tx, data_rx) = bounded(CHANNEL_DEPTH);
        let (cmd_tx, cmd_rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = BranchWorker {
            index,
            path: path.to_path_buf(),
            out_rate,
            data: data_tx,
            commands: cmd_rx,
            stop: stop.clone(),
            epoch: 0,
        };
        let thread = thread::Builder::new()
            .name(format!("branch-{index}"))
            .spawn(move || worker.run(notify))
            .map_err(|e| StemError::GraphConstruction(format!("branch {index}: {e}")))?;

        Ok(Self {
            index,
            path: path.to_path_buf(),
            data: data_rx,
            commands: cmd_tx,
            stop,
            thread: Some(thread),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &Receiver<BranchData> {
        &self.data
    }

    /// Reposition the source; audio decoded afterwards carries `epoch`.
    ///
    /// The returned channel yields whether the source actually moved. It is
    /// disconnected without a value if the branch thread is gone.
    pub fn seek(&self, ms: u64, epoch: u64) -> Receiver<bool> {
        let (done, rx) = bounded(1);
        let _ = self.commands.send(BranchCommand::Seek { ms, epoch, done });
        rx
    }
}

impl Drop for BranchHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let Some(thread) = self.thread.take() else {
            return;
        };
        // A named pipe nobody writes to keeps `open` blocked; don't hang teardown on it.
        let deadline = Instant::now() + JOIN_GRACE;
        while !thread.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if thread.is_finished() {
            let _ = thread.join();
        } else {
            log::warn!("branch {} ({}) did not stop; detaching", self.index, self.path.display());
        }
    }
}

struct Source {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: BranchFormat,
}

fn open_source(path: &Path) -> Result<Source> {
    let decode_err = |reason: String| StemError::Decode {
        path: path.to_path_buf(),
        reason,
    };
    let file = File::open(path).map_err(|e| decode_err(format!("failed to open: {e}")))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| decode_err(format!("failed to probe format: {e}")))?;
    let format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| decode_err("no audio track".into()))?;
    let params = track.codec_params.clone();
    let track_id = track.id;

    let decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| decode_err(format!("failed to create decoder: {e}")))?;

    Ok(Source {
        format,
        decoder,
        track_id,
        info: BranchFormat {
            sample_rate: params.sample_rate.unwrap_or(44_100),
            channels: params.channels.map(|c| c.count()).unwrap_or(2),
            frames: params.n_frames,
        },
    })
}

struct BranchWorker {
    index: usize,
    path: PathBuf,
    out_rate: u32,
    data: Sender<BranchData>,
    commands: Receiver<BranchCommand>,
    stop: Arc<AtomicBool>,
    epoch: u64,
}

impl BranchWorker {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn decode_error(&self, reason: String) -> StemError {
        StemError::Decode {
            path: self.path.clone(),
            reason,
        }
    }

    fn run(mut self, notify: BranchNotify) {
        let mut source = match open_source(&self.path) {
            Ok(s) => s,
            Err(error) => {
                if !self.stopped() {
                    notify(BranchEvent::Failed {
                        branch: self.index,
                        error,
                    });
                }
                return;
            }
        };
        log::debug!(
            "branch {} discovered {} Hz x{} ({:?} frames)",
            self.index,
            source.info.sample_rate,
            source.info.channels,
            source.info.frames
        );
        notify(BranchEvent::FormatDiscovered {
            branch: self.index,
            format: source.info,
        });

        let mut normalizer: Option<Normalizer> = None;
        let mut at_end = false;

        while !self.stopped() {
            match self.commands.try_recv() {
                Ok(BranchCommand::Seek { ms, epoch, done }) => {
                    self.epoch = epoch;
                    at_end = false;
                    if let Some(n) = normalizer.as_mut() {
                        n.reset();
                    }
                    let moved = match seek_source(&mut source, ms) {
                        Ok(()) => true,
                        Err(e) => {
                            log::warn!("branch {} seek to {ms} ms failed: {e}", self.index);
                            false
                        }
                    };
                    let _ = done.send(moved);
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            if at_end {
                thread::sleep(IDLE_WAIT);
                continue;
            }

            let packet = match source.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    at_end = self.end_of_stream(normalizer.as_mut());
                    continue;
                }
                Err(SymphoniaError::ResetRequired) => {
                    at_end = self.end_of_stream(normalizer.as_mut());
                    continue;
                }
                Err(e) => {
                    notify(BranchEvent::Failed {
                        branch: self.index,
                        error: self.decode_error(format!("failed to read packet: {e}")),
                    });
                    return;
                }
            };
            if packet.track_id() != source.track_id {
                continue;
            }

            let decoded = match source.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    log::trace!("branch {} skipping corrupt frame: {e}", self.index);
                    continue;
                }
                Err(e) => {
                    notify(BranchEvent::Failed {
                        branch: self.index,
                        error: self.decode_error(format!("decode error: {e}")),
                    });
                    return;
                }
            };

            let spec = *decoded.spec();
            let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            buf.copy_interleaved_ref(decoded);

            if normalizer.is_none() {
                match Normalizer::new(spec.rate, spec.channels.count(), self.out_rate) {
                    Ok(n) => normalizer = Some(n),
                    Err(error) => {
                        notify(BranchEvent::Failed {
                            branch: self.index,
                            error,
                        });
                        return;
                    }
                }
            }
            let Some(n) = normalizer.as_mut() else {
                continue;
            };
            match n.push(buf.samples()) {
                Ok(out) if !out.is_empty() => {
                    if !self.send(BranchData::Audio {
                        epoch: self.epoch,
                        samples: out,
                    }) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    notify(BranchEvent::Failed {
                        branch: self.index,
                        error,
                    });
                    return;
                }
            }
        }
        log::trace!("branch {} stopped", self.index);
    }

    /// Flush buffered audio and mark the end of the stream for the current epoch.
    fn end_of_stream(&mut self, normalizer: Option<&mut Normalizer>) -> bool {
        if let Some(n) = normalizer {
            match n.flush() {
                Ok(tail) if !tail.is_empty() => {
                    let epoch = self.epoch;
                    self.send(BranchData::Audio {
                        epoch,
                        samples: tail,
                    });
                }
                Ok(_) => {}
                Err(e) => log::warn!("branch {} flush failed: {e}", self.index),
            }
        }
        log::debug!("branch {} reached end of stream", self.index);
        let epoch = self.epoch;
        self.send(BranchData::EndOfStream { epoch });
        true
    }

    /// Blocking send that gives up once the branch is stopped or abandoned.
    fn send(&self, mut msg: BranchData) -> bool {
        loop {
            match self.data.send_timeout(msg, IDLE_WAIT) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(m)) => {
                    if self.stopped() {
                        return false;
                    }
                    // A pending seek makes this chunk stale; drop it and go handle the seek.
                    if !self.commands.is_empty() {
                        return true;
                    }
                    msg = m;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

fn seek_source(source: &mut Source, ms: u64) -> std::result::Result<(), SymphoniaError> {
    let time = Time::new(ms / 1000, (ms % 1000) as f64 / 1000.0);
    source.format.seek(
        SeekMode::Accurate,
        SeekTo::Time {
            time,
            track_id: Some(source.track_id),
        },
    )?;
    source.decoder.reset();
    Ok(())
}

/// Maps any channel layout to stereo and resamples to the output rate.
pub struct Normalizer {
    channels: usize,
    in_rate: u32,
    out_rate: u32,
    resampler: Option<FftFixedInOut<f32>>,
    pending: [Vec<f32>; 2],
}

impl Normalizer {
    pub fn new(in_rate: u32, channels: usize, out_rate: u32) -> Result<Self> {
        if in_rate == 0 || channels == 0 {
            return Err(StemError::GraphConstruction(format!(
                "unsupported source format: {in_rate} Hz x{channels}"
            )));
        }
        let mut n = Self {
            channels,
            in_rate,
            out_rate,
            resampler: None,
            pending: [Vec::new(), Vec::new()],
        };
        n.reset();
        if in_rate != out_rate && n.resampler.is_none() {
            return Err(StemError::GraphConstruction(format!(
                "cannot resample {in_rate} Hz to {out_rate} Hz"
            )));
        }
        Ok(n)
    }

    pub fn reset(&mut self) {
        self.pending = [Vec::new(), Vec::new()];
        self.resampler = if self.in_rate == self.out_rate {
            None
        } else {
            match FftFixedInOut::<f32>::new(self.in_rate as usize, self.out_rate as usize, RESAMPLE_CHUNK, 2) {
                Ok(r) => Some(r),
                Err(e) => {
                    log::error!("resampler construction failed: {e}");
                    None
                }
            }
        };
    }

    /// Feed interleaved source samples, get back interleaved stereo at the output rate.
    pub fn push(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        let ch = self.channels;
        let frames = interleaved.len() / ch;
        if self.resampler.is_none() {
            let mut out = Vec::with_capacity(frames * 2);
            for f in interleaved.chunks_exact(ch) {
                let (l, r) = to_stereo(f);
                out.push(l);
                out.push(r);
            }
            return Ok(out);
        }

        for f in interleaved.chunks_exact(ch) {
            let (l, r) = to_stereo(f);
            self.pending[0].push(l);
            self.pending[1].push(r);
        }
        self.drain_chunks()
    }

    /// Resample whatever is left, padding the final chunk with silence.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        let left = self.pending[0].len();
        if left == 0 {
            return Ok(Vec::new());
        }
        let need = resampler.input_frames_next();
        for p in self.pending.iter_mut() {
            p.resize(need, 0.0);
        }
        let keep = (left as u64 * self.out_rate as u64 / self.in_rate as u64) as usize;
        let mut out = self.drain_chunks()?;
        out.truncate(keep * 2);
        Ok(out)
    }

    fn drain_chunks(&mut self) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(out);
        };
        loop {
            let need = resampler.input_frames_next();
            if self.pending[0].len() < need {
                break;
            }
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|p| p.drain(..need).collect())
                .collect();
            let res = resampler
                .process(&chunk, None)
                .map_err(|e| StemError::GraphConstruction(format!("resample failed: {e}")))?;
            for (l, r) in res[0].iter().zip(&res[1]) {
                out.push(*l);
                out.push(*r);
            }
        }
        Ok(out)
    }
}

fn to_stereo(frame: &[f32]) -> (f32, f32) {
    match frame {
        [m] => (*m, *m),
        [l, r, ..] => (*l, *r),
        [] => (0.0, 0.0),
    }
}

//! The running graph: branches, summing stage, sink, and the streaming thread.
//!
//! The streaming thread is the only place per-branch linkage and transport
//! state are mutated. Control calls and branch notifications both arrive on a
//! single queue it consumes, and it publishes a read-only snapshot (state,
//! position, duration) through atomics.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use rayon::prelude::*;
use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    error::{LastError, Result, StemError},
    mixer::{
        branch::{BranchData, BranchEvent, BranchFormat, BranchHandle},
        node::GainStage,
        sink::AudioSink,
    },
    types::{PipelineConfig, PipelineState},
};

const IDLE_POLL: Duration = Duration::from_millis(20);
/// How long a seek waits for every branch to confirm it moved.
const SEEK_CONFIRM: Duration = Duration::from_millis(500);

/// Where the most recent pipeline failure is recorded.
pub type ErrorSlot = Arc<Mutex<Option<LastError>>>;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Position { ms: u64 },
    StateChanged(PipelineState),
    Error(String),
    EndOfStream,
}

/// Fan-out of pipeline events to every subscriber.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<PipelineEvent>>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        let (tx, rx) = unbounded();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Play,
    Pause,
    Stop,
    Seek(u64),
}

enum GraphMessage {
    Command(TransportCommand, Sender<Result<()>>),
    Branch(BranchEvent),
    Shutdown,
}

/// Snapshot the streaming thread publishes for lock-free queries.
#[derive(Default)]
struct GraphStatus {
    state: AtomicU8,
    position_ms: AtomicU64,
    duration_ms: AtomicU64,
    failed: AtomicBool,
}

/// Owning handle of a running graph. Dropping it stops and joins everything.
pub struct Graph {
    control: Sender<GraphMessage>,
    status: Arc<GraphStatus>,
    live: bool,
    thread: Option<JoinHandle<()>>,
}

impl Graph {
    pub fn build(
        paths: Vec<PathBuf>,
        stages: Vec<Arc<GainStage>>,
        sink: Box<dyn AudioSink>,
        config: &PipelineConfig,
        live: bool,
        events: EventBus,
        errors: ErrorSlot,
    ) -> Result<Self> {
        if paths.len() != stages.len() || paths.is_empty() {
            return Err(StemError::GraphConstruction(format!(
                "{} sources for {} gain stages",
                paths.len(),
                stages.len()
            )));
        }
        let (control_tx, control_rx) = unbounded();

        let mut branches = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            let tx = control_tx.clone();
            let notify = Box::new(move |ev: BranchEvent| {
                let _ = tx.send(GraphMessage::Branch(ev));
            });
            branches.push(BranchHandle::spawn(i, path, config.sample_rate, notify)?);
        }

        let initial = if live {
            PipelineState::Playing
        } else {
            PipelineState::Ready
        };
        let status = Arc::new(GraphStatus::default());
        status.state.store(initial.to_u8(), Ordering::SeqCst);

        let slots = branches
            .into_iter()
            .zip(stages)
            .map(|(handle, stage)| {
                let gain = stage.get();
                Slot {
                    handle,
                    stage,
                    gain,
                    format: None,
                    buffer: VecDeque::new(),
                    deficit: 0,
                    eos: false,
                }
            })
            .collect();

        let mut streaming = Streaming {
            slots,
            control: control_rx,
            status: status.clone(),
            events: events.clone(),
            errors,
            sink,
            state: initial,
            epoch: 0,
            position_frames: 0,
            live,
            linked: false,
            sample_rate: config.sample_rate,
            block_frames: config.block_frames.max(1),
            gain_ramp: config.gain_ramp,
            branch_wait: Duration::from_millis(config.branch_wait_ms),
            position_interval: Duration::from_millis(config.position_interval_ms.max(1)),
            last_position: Instant::now(),
        };
        let thread = thread::Builder::new()
            .name("stem-mixer".into())
            .spawn(move || streaming.run())
            .map_err(|e| StemError::GraphConstruction(format!("streaming thread: {e}")))?;

        events.emit(PipelineEvent::StateChanged(initial));
        Ok(Self {
            control: control_tx,
            status,
            live,
            thread: Some(thread),
        })
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// False once a fatal error tore the graph down.
    pub fn is_healthy(&self) -> bool {
        !self.status.failed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PipelineState {
        if !self.is_healthy() {
            return PipelineState::Idle;
        }
        PipelineState::from_u8(self.status.state.load(Ordering::SeqCst))
    }

    pub fn position_ms(&self) -> u64 {
        self.status.position_ms.load(Ordering::SeqCst)
    }

    pub fn duration_ms(&self) -> u64 {
        self.status.duration_ms.load(Ordering::SeqCst)
    }

    /// Ask the streaming thread for a transport change and wait for its verdict.
    pub fn command(&self, cmd: TransportCommand, timeout: Duration) -> Result<()> {
        if !self.is_healthy() {
            return Err(StemError::TransportState(format!(
                "{cmd:?} rejected: the graph failed, load stems again"
            )));
        }
        let (ack_tx, ack_rx) = bounded(1);
        if self.control.send(GraphMessage::Command(cmd, ack_tx)).is_err() {
            return Err(StemError::TransportState(format!(
                "{cmd:?} rejected: streaming thread has stopped"
            )));
        }
        match ack_rx.recv_timeout(timeout) {
            Ok(verdict) => verdict,
            Err(_) => Err(StemError::TransportState(format!(
                "{cmd:?} not acknowledged within {timeout:?}"
            ))),
        }
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        let _ = self.control.send(GraphMessage::Shutdown);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                log::error!("streaming thread panicked");
            }
        }
    }
}

struct Slot {
    handle: BranchHandle,
    stage: Arc<GainStage>,
    /// Gain applied at the end of the previous block.
    gain: f32,
    format: Option<BranchFormat>,
    buffer: VecDeque<f32>,
    /// Frames already played as silence while starved; skipped when they arrive late.
    deficit: usize,
    eos: bool,
}

impl Slot {
    fn frames(&self) -> usize {
        self.buffer.len() / 2
    }

    fn push(&mut self, samples: Vec<f32>) {
        let skip = (self.deficit * 2).min(samples.len());
        self.deficit -= skip / 2;
        self.buffer.extend(samples.into_iter().skip(skip));
    }

    fn flush(&mut self) {
        self.buffer.clear();
        self.deficit = 0;
        self.eos = false;
    }

    /// Take up to `frames` frames scaled by a gain ramp, padding with silence.
    fn render(&mut self, frames: usize, ramp: bool) -> Vec<f32> {
        if !self.eos {
            self.deficit += frames.saturating_sub(self.frames());
        }
        let target = self.stage.get();
        let start = if ramp { self.gain } else { target };
        let step = (target - start) / frames as f32;
        let mut out = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            let g = start + step * (i + 1) as f32;
            for _ in 0..2 {
                out.push(self.buffer.pop_front().unwrap_or(0.0) * g);
            }
        }
        self.gain = target;
        out
    }
}

struct Streaming {
    slots: Vec<Slot>,
    control: Receiver<GraphMessage>,
    status: Arc<GraphStatus>,
    events: EventBus,
    errors: ErrorSlot,
    sink: Box<dyn AudioSink>,
    state: PipelineState,
    epoch: u64,
    position_frames: u64,
    live: bool,
    linked: bool,
    sample_rate: u32,
    block_frames: usize,
    gain_ramp: bool,
    branch_wait: Duration,
    position_interval: Duration,
    last_position: Instant,
}

enum Flow {
    Continue,
    Exit,
}

impl Streaming {
    fn run(&mut self) {
        loop {
            let rendering = self.state == PipelineState::Playing && self.linked;
            let first = if rendering {
                self.control.try_recv().ok()
            } else {
                match self.control.recv_timeout(IDLE_POLL) {
                    Ok(m) => Some(m),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            };
            if let Some(msg) = first {
                if let Flow::Exit = self.handle(msg) {
                    break;
                }
                while let Ok(msg) = self.control.try_recv() {
                    if let Flow::Exit = self.handle(msg) {
                        return self.finish();
                    }
                }
                continue;
            }
            if rendering {
                if let Err(e) = self.render_block() {
                    self.fail(e);
                    break;
                }
            }
        }
        self.finish();
    }

    fn finish(&mut self) {
        if let Err(e) = self.sink.flush() {
            log::warn!("sink flush failed: {e}");
        }
    }

    fn handle(&mut self, msg: GraphMessage) -> Flow {
        match msg {
            GraphMessage::Shutdown => Flow::Exit,
            GraphMessage::Command(cmd, ack) => {
                let verdict = self.apply(cmd);
                if let Err(e) = &verdict {
                    log::warn!("{e}");
                }
                let _ = ack.send(verdict);
                Flow::Continue
            }
            GraphMessage::Branch(BranchEvent::FormatDiscovered { branch, format }) => {
                self.link(branch, format);
                Flow::Continue
            }
            GraphMessage::Branch(BranchEvent::Failed { branch, error }) => {
                log::error!("branch {branch} failed");
                self.fail(error);
                Flow::Exit
            }
        }
    }

    fn link(&mut self, branch: usize, format: BranchFormat) {
        let Some(slot) = self.slots.get_mut(branch) else {
            log::warn!("format notification for unknown branch {branch}");
            return;
        };
        if slot.format.is_some() {
            return;
        }
        slot.format = Some(format);
        log::debug!("linked branch {branch} ({})", slot.handle.path().display());

        if let Some(ms) = format.duration_ms() {
            self.status.duration_ms.fetch_max(ms, Ordering::SeqCst);
        }
        if self.slots.iter().all(|s| s.format.is_some()) {
            self.linked = true;
            log::info!("all {} branches linked", self.slots.len());
        }
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state != state {
            if state == PipelineState::Playing {
                self.sink.resume();
            }
            self.state = state;
            self.status.state.store(state.to_u8(), Ordering::SeqCst);
            self.events.emit(PipelineEvent::StateChanged(state));
        }
    }

    fn apply(&mut self, cmd: TransportCommand) -> Result<()> {
        match cmd {
            TransportCommand::Play => self.set_state(PipelineState::Playing),
            TransportCommand::Pause => self.set_state(PipelineState::Paused),
            TransportCommand::Stop => {
                if !self.live {
                    self.reposition(0);
                }
                self.set_state(PipelineState::Ready);
            }
            TransportCommand::Seek(ms) => self.seek(ms)?,
        }
        Ok(())
    }

    fn position_ms(&self) -> u64 {
        self.position_frames * 1000 / self.sample_rate.max(1) as u64
    }

    /// Move every branch to `ms`, or leave the position where it was.
    fn seek(&mut self, ms: u64) -> Result<()> {
        if self.live {
            return Err(StemError::TransportState("live stems cannot seek".into()));
        }
        let duration = self.status.duration_ms.load(Ordering::SeqCst);
        if duration > 0 && ms >= duration {
            return Err(StemError::TransportState(format!(
                "seek to {ms} ms is past the end ({duration} ms)"
            )));
        }

        self.epoch += 1;
        let pending: Vec<_> = self
            .slots
            .iter()
            .map(|slot| slot.handle.seek(ms, self.epoch))
            .collect();
        let deadline = Instant::now() + SEEK_CONFIRM;
        let failed: Vec<usize> = pending
            .iter()
            .enumerate()
            .filter(|(_, done)| {
                let left = deadline.saturating_duration_since(Instant::now());
                !done.recv_timeout(left).unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect();

        if !failed.is_empty() {
            let here = self.position_ms();
            self.reposition(here);
            return Err(StemError::TransportState(format!(
                "seek to {ms} ms failed on branch {failed:?}"
            )));
        }
        for slot in &mut self.slots {
            slot.flush();
        }
        self.position_frames = ms * self.sample_rate as u64 / 1000;
        self.publish_position(true);
        Ok(())
    }

    /// Flush every branch and restart decoding at `ms` under a fresh epoch.
    fn reposition(&mut self, ms: u64) {
        self.epoch += 1;
        for slot in &mut self.slots {
            slot.flush();
            // Unconfirmed; a source that cannot move reports at its next read.
            let _ = slot.handle.seek(ms, self.epoch);
        }
        self.position_frames = ms * self.sample_rate as u64 / 1000;
        self.publish_position(true);
    }

    fn publish_position(&mut self, force: bool) {
        let ms = self.position_ms();
        self.status.position_ms.store(ms, Ordering::SeqCst);
        if force || self.last_position.elapsed() >= self.position_interval {
            self.last_position = Instant::now();
            self.events.emit(PipelineEvent::Position { ms });
        }
    }

    fn fail(&mut self, error: StemError) {
        log::error!("pipeline error: {error}");
        if let Ok(mut slot) = self.errors.lock() {
            *slot = Some(LastError::from(&error));
        }
        let reason = error.to_string();
        self.status.failed.store(true, Ordering::SeqCst);
        self.state = PipelineState::Idle;
        self.status.state.store(PipelineState::Idle.to_u8(), Ordering::SeqCst);
        self.events.emit(PipelineEvent::Error(reason));
        self.events.emit(PipelineEvent::StateChanged(PipelineState::Idle));
    }

    /// Pull decoded audio until every branch holds a block or has ended.
    /// Returns false when some branch was still short once the wait ran out;
    /// branches after it are still drained of whatever is already queued.
    fn fill(&mut self, frames: usize) -> bool {
        let deadline = Instant::now() + self.branch_wait;
        let epoch = self.epoch;
        let mut complete = true;
        for slot in &mut self.slots {
            while !slot.eos && slot.frames() < frames {
                let wait = deadline.saturating_duration_since(Instant::now());
                match slot.handle.data().recv_timeout(wait) {
                    Ok(BranchData::Audio { epoch: e, samples }) if e == epoch => slot.push(samples),
                    Ok(BranchData::EndOfStream { epoch: e }) if e == epoch => slot.eos = true,
                    Ok(_) => {}
                    Err(RecvTimeoutError::Timeout) => {
                        complete = false;
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => slot.eos = true,
                }
            }
        }
        complete
    }

    fn render_block(&mut self) -> Result<()> {
        let block = self.block_frames;
        let complete = self.fill(block);

        let frames = if self.slots.iter().all(|s| s.eos) {
            self.slots.iter().map(Slot::frames).max().unwrap_or(0).min(block)
        } else if !complete {
            log::debug!("branch starved for {:?}; padding with silence", self.branch_wait);
            block
        } else {
            self.slots
                .iter()
                .filter(|s| !s.eos)
                .map(Slot::frames)
                .min()
                .unwrap_or(0)
                .min(block)
        };
        if frames == 0 {
            self.end_of_stream();
            return Ok(());
        }

        let ramp = self.gain_ramp;
        let rendered: Vec<Vec<f32>> = self
            .slots
            .par_iter_mut()
            .map(|slot| slot.render(frames, ramp))
            .collect();
        let mut mix = vec![0.0f32; frames * 2];
        for branch in &rendered {
            for (m, s) in mix.iter_mut().zip(branch) {
                *m += *s;
            }
        }

        self.sink.write(&mix)?;
        self.position_frames += frames as u64;
        self.publish_position(false);
        Ok(())
    }

    fn end_of_stream(&mut self) {
        log::info!("end of stream at {} ms", self.status.position_ms.load(Ordering::SeqCst));
        if let Err(e) = self.sink.flush() {
            log::warn!("sink flush failed: {e}");
        }
        if !self.live {
            self.reposition(0);
        }
        self.set_state(PipelineState::Ready);
        self.events.emit(PipelineEvent::EndOfStream);
    }
}

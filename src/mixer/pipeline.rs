use crossbeam_channel::Receiver;
use std::{
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::{
    error::{LastError, Result, StemError},
    mixer::{
        graph::{ErrorSlot, EventBus, Graph, PipelineEvent, TransportCommand},
        node::{apply_gains, default_nodes, MixerNode},
        sink::{AudioSink, NullSink, SinkFactory},
    },
    types::{PipelineConfig, PipelineState, StemSet},
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Real-time player and mixer for one set of four stems.
///
/// All methods take `&self` and may be called from any thread. Mixing controls
/// live on the pipeline itself, so they can be set before stems are loaded and
/// survive reloads.
pub struct MixingPipeline {
    config: PipelineConfig,
    sink_factory: SinkFactory,
    nodes: Mutex<Vec<MixerNode>>,
    graph: Mutex<Option<Graph>>,
    current: Mutex<Option<StemSet>>,
    events: EventBus,
    last_error: ErrorSlot,
}

impl MixingPipeline {
    pub fn new(config: PipelineConfig, sink_factory: SinkFactory) -> Self {
        Self {
            config,
            sink_factory,
            nodes: Mutex::new(default_nodes()),
            graph: Mutex::new(None),
            current: Mutex::new(None),
            events: EventBus::default(),
            last_error: ErrorSlot::default(),
        }
    }

    /// Pipeline that consumes audio at real-time speed and discards it.
    pub fn with_null_sink(config: PipelineConfig) -> Self {
        let factory: SinkFactory = Arc::new(|rate: u32| -> Result<Box<dyn AudioSink>> {
            Ok(Box::new(NullSink::realtime(rate)))
        });
        Self::new(config, factory)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Why the most recent rejected call or pipeline failure happened.
    pub fn last_error(&self) -> Option<LastError> {
        lock(&self.last_error).clone()
    }

    fn record(&self, err: &StemError) {
        *lock(&self.last_error) = Some(LastError::from(err));
    }

    /// Build a fresh graph for `stems`, replacing any current one.
    ///
    /// Returns false without touching the current graph when `stems` is invalid.
    /// Live stems start playing as soon as the graph exists.
    pub fn load_stems(&self, stems: &StemSet) -> bool {
        if !stems.is_valid() {
            log::warn!("refusing to load an invalid stem set");
            self.record(&StemError::GraphConstruction("stem set has no usable paths".into()));
            return false;
        }
        let paths: Vec<PathBuf> = stems
            .paths()
            .filter_map(|(_, p)| p.map(|p| p.to_path_buf()))
            .collect();
        let live = stems.is_live();

        let mut graph = lock(&self.graph);
        if graph.take().is_some() {
            log::debug!("tearing down previous graph");
        }
        *lock(&self.current) = None;

        let stages = {
            let nodes = lock(&self.nodes);
            apply_gains(&nodes);
            nodes.iter().map(|n| n.stage()).collect()
        };
        let built = (self.sink_factory)(self.config.sample_rate).and_then(|sink| {
            Graph::build(
                paths,
                stages,
                sink,
                &self.config,
                live,
                self.events.clone(),
                self.last_error.clone(),
            )
        });
        match built {
            Ok(g) => {
                log::info!("stems loaded ({})", if live { "live" } else { "files" });
                *graph = Some(g);
                *lock(&self.current) = Some(stems.clone());
                true
            }
            Err(e) => {
                log::error!("failed to build mixing graph: {e}");
                self.record(&e);
                self.events.emit(PipelineEvent::Error(e.to_string()));
                false
            }
        }
    }

    /// Tear down the graph and return to `Idle`.
    pub fn clear_stems(&self) {
        let had_graph = lock(&self.graph).take().is_some();
        *lock(&self.current) = None;
        if had_graph {
            self.events.emit(PipelineEvent::StateChanged(PipelineState::Idle));
        }
    }

    fn transport(&self, cmd: TransportCommand) -> bool {
        let verdict = match lock(&self.graph).as_ref() {
            Some(g) => g.command(cmd, Duration::from_millis(self.config.command_timeout_ms)),
            None => Err(StemError::TransportState(format!(
                "{cmd:?} rejected: no stems loaded"
            ))),
        };
        match verdict {
            Ok(()) => true,
            Err(e) => {
                log::debug!("{e}");
                self.record(&e);
                false
            }
        }
    }

    pub fn play(&self) -> bool {
        self.transport(TransportCommand::Play)
    }

    /// Valid from `Ready` as well, which arms a paused start.
    pub fn pause(&self) -> bool {
        self.transport(TransportCommand::Pause)
    }

    pub fn stop(&self) -> bool {
        self.transport(TransportCommand::Stop)
    }

    /// Flush and reposition. Not supported for live stems.
    pub fn seek(&self, ms: u64) -> bool {
        self.transport(TransportCommand::Seek(ms))
    }

    pub fn state(&self) -> PipelineState {
        lock(&self.graph)
            .as_ref()
            .map(Graph::state)
            .unwrap_or(PipelineState::Idle)
    }

    pub fn position(&self) -> u64 {
        lock(&self.graph)
            .as_ref()
            .filter(|g| g.is_healthy())
            .map(Graph::position_ms)
            .unwrap_or(0)
    }

    pub fn duration(&self) -> u64 {
        lock(&self.graph)
            .as_ref()
            .filter(|g| g.is_healthy())
            .map(Graph::duration_ms)
            .unwrap_or(0)
    }

    pub fn is_live(&self) -> bool {
        lock(&self.graph).as_ref().map(Graph::is_live).unwrap_or(false)
    }

    pub fn current_stems(&self) -> Option<StemSet> {
        lock(&self.current).clone()
    }

    fn with_node(&self, idx: usize, f: impl FnOnce(&mut MixerNode)) -> bool {
        let mut nodes = lock(&self.nodes);
        let Some(node) = nodes.get_mut(idx) else {
            log::warn!("no mixer node at index {idx}");
            return false;
        };
        f(node);
        apply_gains(&nodes);
        true
    }

    pub fn set_stem_volume(&self, idx: usize, volume: f32) -> bool {
        self.with_node(idx, |n| n.set_gain(volume))
    }

    pub fn set_stem_mute(&self, idx: usize, mute: bool) -> bool {
        self.with_node(idx, |n| n.set_mute(mute))
    }

    pub fn set_stem_solo(&self, idx: usize, solo: bool) -> bool {
        self.with_node(idx, |n| n.set_solo(solo))
    }

    pub fn stem_volume(&self, idx: usize) -> Option<f32> {
        lock(&self.nodes).get(idx).map(MixerNode::gain)
    }

    pub fn is_stem_mute(&self, idx: usize) -> bool {
        lock(&self.nodes).get(idx).map(MixerNode::is_muted).unwrap_or(false)
    }

    pub fn is_stem_solo(&self, idx: usize) -> bool {
        lock(&self.nodes).get(idx).map(MixerNode::is_solo).unwrap_or(false)
    }

    /// Gain the streaming thread currently applies to `idx`.
    pub fn effective_gain(&self, idx: usize) -> Option<f32> {
        lock(&self.nodes).get(idx).map(MixerNode::effective_gain)
    }
}

impl Drop for MixingPipeline {
    fn drop(&mut self) {
        lock(&self.graph).take();
    }
}

//! Per-stem mixing controls and the gain law that combines them.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use crate::types::Stem;

/// Gain multiplier shared between the control side and the streaming thread.
#[derive(Debug)]
pub struct GainStage(AtomicU32);

impl GainStage {
    pub fn new(gain: f32) -> Self {
        GainStage(AtomicU32::new(gain.to_bits()))
    }

    pub fn set(&self, gain: f32) {
        self.0.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// One stem's controls: configured gain plus mute and solo flags.
#[derive(Debug, Clone)]
pub struct MixerNode {
    stem: Stem,
    gain: f32,
    mute: bool,
    solo: bool,
    stage: Arc<GainStage>,
}

impl MixerNode {
    pub fn new(stem: Stem) -> Self {
        Self {
            stem,
            gain: 1.0,
            mute: false,
            solo: false,
            stage: Arc::new(GainStage::new(1.0)),
        }
    }

    pub fn stem(&self) -> Stem {
        self.stem
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn is_muted(&self) -> bool {
        self.mute
    }

    pub fn is_solo(&self) -> bool {
        self.solo
    }

    /// Set the configured gain, clamped to [0, 1]. NaN is treated as silence.
    pub fn set_gain(&mut self, gain: f32) {
        self.gain = if gain.is_nan() { 0.0 } else { gain.clamp(0.0, 1.0) };
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    pub fn set_solo(&mut self, solo: bool) {
        self.solo = solo;
    }

    /// Stage the streaming thread reads this node's effective gain from.
    pub fn stage(&self) -> Arc<GainStage> {
        self.stage.clone()
    }

    pub fn effective_gain(&self) -> f32 {
        self.stage.get()
    }
}

/// The four nodes in mixer index order.
pub fn default_nodes() -> Vec<MixerNode> {
    Stem::all().iter().map(|s| MixerNode::new(*s)).collect()
}

/// Audible gain of every node.
///
/// With any node soloed only nodes that are solo and not muted are heard.
/// Otherwise every unmuted node is heard. Each audible node plays at its own gain.
pub fn effective_gains(nodes: &[MixerNode]) -> Vec<f32> {
    let any_solo = nodes.iter().any(|n| n.solo);
    nodes
        .iter()
        .map(|n| {
            let audible = if any_solo { n.solo && !n.mute } else { !n.mute };
            if audible {
                n.gain
            } else {
                0.0
            }
        })
        .collect()
}

/// Recompute the gain law and write the result into each node's stage.
pub fn apply_gains(nodes: &[MixerNode]) {
    for (node, gain) in nodes.iter().zip(effective_gains(nodes)) {
        node.stage.set(gain);
        log::debug!("{} gain -> {gain:.3}", node.stem);
    }
}

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

use crate::{
    error::{Result, StemError},
    io::paths::{default_cache_dir, default_output_dir},
};

/// Available stem types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stem {
    Vocals,
    Drums,
    Bass,
    Other,
}

impl Stem {
    pub const COUNT: usize = 4;

    /// Get all available stems, in mixer index order
    pub fn all() -> &'static [Stem] {
        &[Stem::Vocals, Stem::Drums, Stem::Bass, Stem::Other]
    }

    /// Get stem name as string
    pub fn name(&self) -> &'static str {
        match self {
            Stem::Vocals => "vocals",
            Stem::Drums => "drums",
            Stem::Bass => "bass",
            Stem::Other => "other",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Stem::Vocals => 0,
            Stem::Drums => 1,
            Stem::Bass => 2,
            Stem::Other => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Stem> {
        Stem::all().get(index).copied()
    }

    /// Case-insensitive substrings identifying this stem in a generated file name.
    pub fn markers(&self) -> &'static [&'static str] {
        match self {
            Stem::Vocals => &["vocals", "voice"],
            Stem::Drums => &["drums"],
            Stem::Bass => &["bass"],
            Stem::Other => &["other", "accomp"],
        }
    }

    /// Classify a generated file name. Checked in index order, first match wins.
    pub fn from_file_name(name: &str) -> Option<Stem> {
        let lower = name.to_lowercase();
        Stem::all()
            .iter()
            .copied()
            .find(|stem| stem.markers().iter().any(|m| lower.contains(m)))
    }
}

impl fmt::Display for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a completed separation: one media reference per stem.
///
/// Immutable once built. `is_valid()` is true only when all four references are
/// present and resolved to an existing file (or named pipe) at construction time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemSet {
    paths: [Option<PathBuf>; Stem::COUNT],
    valid: bool,
    created_at: u64,
}

impl StemSet {
    pub fn new(
        vocals: Option<PathBuf>,
        drums: Option<PathBuf>,
        bass: Option<PathBuf>,
        other: Option<PathBuf>,
    ) -> Self {
        Self::from_paths([vocals, drums, bass, other])
    }

    /// Build from references in mixer index order (vocals, drums, bass, other).
    pub fn from_paths(paths: [Option<PathBuf>; Stem::COUNT]) -> Self {
        let valid = paths
            .iter()
            .all(|p| p.as_deref().map(Path::exists).unwrap_or(false));
        Self {
            paths,
            valid,
            created_at: unix_now(),
        }
    }

    /// An explicitly invalid set (unknown job, mock separation).
    pub fn invalid() -> Self {
        Self {
            created_at: unix_now(),
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn path(&self, stem: Stem) -> Option<&Path> {
        self.paths[stem.index()].as_deref()
    }

    pub fn paths(&self) -> impl Iterator<Item = (Stem, Option<&Path>)> + '_ {
        Stem::all().iter().map(move |s| (*s, self.path(*s)))
    }

    /// True when every reference still resolves on disk.
    pub fn still_resolvable(&self) -> bool {
        self.valid && self.paths.iter().flatten().all(|p| p.exists())
    }

    /// True when the references are continuously-written named pipes.
    pub fn is_live(&self) -> bool {
        self.paths.iter().flatten().any(|p| is_named_pipe(p))
    }
}

pub(crate) fn is_named_pipe(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if let Ok(meta) = fs::metadata(path) {
            if meta.file_type().is_fifo() {
                return true;
            }
        }
    }
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("pipe") | Some("fifo")
    )
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Opaque, globally unique separation job identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        JobId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

/// Orchestrator view of a job, derived from which registry table holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Idle,
    Processing,
    Completed,
}

/// Transport state of the mixing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// No stems loaded.
    #[default]
    Idle,
    /// Stems loaded, stopped.
    Ready,
    Playing,
    Paused,
}

impl PipelineState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            PipelineState::Idle => 0,
            PipelineState::Ready => 1,
            PipelineState::Playing => 2,
            PipelineState::Paused => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => PipelineState::Ready,
            2 => PipelineState::Playing,
            3 => PipelineState::Paused,
            _ => PipelineState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Finite stem files written to the job directory.
    File,
    /// Named pipes continuously written by a long-running process.
    Live,
}

/// Which job-execution strategy the orchestrator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Probe the model runtime at initialization and pick accordingly.
    #[default]
    Auto,
    External,
    Mock,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparatorConfig {
    pub model_name: String,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_enabled: bool,
    pub max_cache_entries: usize,
    /// Program used to run the separation scripts and the runtime probe.
    pub interpreter: PathBuf,
    /// File-mode script. When unset the interpreter is invoked with the arguments directly.
    pub script: Option<PathBuf>,
    /// Live-mode script.
    pub live_script: Option<PathBuf>,
    pub probe_args: Vec<String>,
    pub mode: ExecutionMode,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub heartbeat_ms: u64,
    pub settle_ms: u64,
    pub live_ready_timeout_ms: u64,
    pub completed_retention: usize,
    pub mock_step_ms: u64,
}

impl Default for SeparatorConfig {
    fn default() -> Self {
        Self {
            model_name: "htdemucs".into(),
            output_dir: default_output_dir(),
            cache_dir: default_cache_dir(),
            cache_enabled: true,
            max_cache_entries: 64,
            interpreter: "python3".into(),
            script: None,
            live_script: None,
            probe_args: vec!["-c".into(), "import demucs; print('OK')".into()],
            mode: ExecutionMode::Auto,
            timeout_ms: 15 * 60 * 1000,
            poll_interval_ms: 500,
            heartbeat_ms: 5_000,
            settle_ms: 500,
            live_ready_timeout_ms: 120_000,
            completed_retention: 10,
            mock_step_ms: 300,
        }
    }
}

impl SeparatorConfig {
    /// Load from a JSON file; absent keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let mut cfg: SeparatorConfig = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `STEMSEP_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(p) = std::env::var("STEMSEP_PYTHON") {
            self.interpreter = PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("STEMSEP_SCRIPT") {
            self.script = Some(PathBuf::from(p));
        }
        if let Ok(p) = std::env::var("STEMSEP_LIVE_SCRIPT") {
            self.live_script = Some(PathBuf::from(p));
        }
        if let Ok(m) = std::env::var("STEMSEP_MODEL") {
            if !m.trim().is_empty() {
                self.model_name = m;
            }
        }
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(StemError::Config("model_name must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(StemError::Config("poll_interval_ms must be > 0".into()));
        }
        self.max_cache_entries = self.max_cache_entries.max(1);
        self.completed_retention = self.completed_retention.max(1);
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Output rate every branch is normalized to.
    pub sample_rate: u32,
    pub block_frames: usize,
    pub position_interval_ms: u64,
    /// Ramp gain changes across one block instead of stepping.
    pub gain_ramp: bool,
    /// Upper bound a control call waits for the transport to acknowledge.
    pub command_timeout_ms: u64,
    /// How long the mix waits on a starved branch before filling silence.
    pub branch_wait_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            block_frames: 1024,
            position_interval_ms: 250,
            gain_ramp: true,
            command_timeout_ms: 1000,
            branch_wait_ms: 200,
        }
    }
}

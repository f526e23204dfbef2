mod error;
mod types;

pub mod separation {
    pub mod job;
    pub mod orchestrator;
    pub mod parser;
    pub mod runner;
}

pub mod cache {
    pub mod key;
    pub mod store;
}

pub mod mixer {
    pub mod branch;
    #[cfg(feature = "device-output")]
    pub mod device;
    pub mod graph;
    pub mod node;
    pub mod pipeline;
    pub mod sink;
}

pub mod io {
    pub mod crypto;
    pub mod paths;
    pub mod process;
}

// Public API
pub use crate::cache::{key::CacheKey, store::SeparationCache};
pub use crate::error::{ErrorClass, LastError, Result, StemError};
pub use crate::mixer::{
    graph::PipelineEvent,
    node::{effective_gains, MixerNode},
    pipeline::MixingPipeline,
    sink::{AudioSink, MemorySink, NullSink, SinkFactory, WavSink},
};
#[cfg(feature = "device-output")]
pub use crate::mixer::device::DeviceSink;
pub use crate::separation::{
    job::{JobContext, JobOutput, JobSpec, LiveSession},
    orchestrator::{SeparationEvent, SeparationOrchestrator, AVAILABLE_MODELS},
    parser::{ProgressStreamParser, StreamEvent},
    runner::{ExternalRunner, JobRunner, MockRunner},
};
pub use crate::types::{
    ExecutionMode, JobId, JobKind, PipelineConfig, PipelineState, ProcessingState,
    SeparatorConfig, Stem, StemSet,
};

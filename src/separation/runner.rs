//! Job execution strategies.
//!
//! The orchestrator never decides inline whether a job is real or simulated: it
//! holds one `JobRunner` chosen at initialization and hands every job to it.

use std::{
    process::Command,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crate::{
    error::{Result, StemError},
    io::process::run_with_timeout,
    separation::job::{run_file_job, run_live_job, JobContext, JobOutput, JobSpec, RunnerSettings},
    types::{ExecutionMode, JobKind, SeparatorConfig, StemSet},
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Contract shared by every job-execution strategy.
pub trait JobRunner: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::External
    }

    /// Run one job to a terminal outcome on the calling thread.
    ///
    /// Implementations must check `ctx.cancelled()` at least once per poll
    /// interval and return `StemError::Cancelled` once it is set.
    fn run(&self, spec: &JobSpec, ctx: &JobContext) -> Result<JobOutput>;
}

/// Drives the external separation program.
pub struct ExternalRunner {
    settings: RunnerSettings,
}

impl ExternalRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self { settings }
    }

    pub fn from_config(config: &SeparatorConfig) -> Self {
        Self::new(RunnerSettings::from_config(config))
    }
}

impl JobRunner for ExternalRunner {
    fn name(&self) -> &'static str {
        "external"
    }

    fn run(&self, spec: &JobSpec, ctx: &JobContext) -> Result<JobOutput> {
        match spec.kind {
            JobKind::File => run_file_job(&self.settings, spec, ctx).map(JobOutput::Stems),
            JobKind::Live => run_live_job(&self.settings, spec, ctx).map(JobOutput::Live),
        }
    }
}

/// Simulated separation for environments without the model runtime.
///
/// Walks progress 10, 30, 50, 70, 90 then 100 and yields an explicitly invalid
/// stem set, so callers can exercise their state handling end to end.
pub struct MockRunner {
    step: Duration,
}

impl MockRunner {
    pub fn new(step: Duration) -> Self {
        Self { step }
    }

    fn pause(&self, ctx: &JobContext) -> Result<()> {
        let deadline = Instant::now() + self.step;
        loop {
            if ctx.cancelled() {
                return Err(StemError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(Duration::from_millis(20)));
        }
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(300))
    }
}

impl JobRunner for MockRunner {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Mock
    }

    fn run(&self, spec: &JobSpec, ctx: &JobContext) -> Result<JobOutput> {
        if !spec.source.exists() {
            return Err(StemError::InputMissing {
                path: spec.source.clone(),
            });
        }
        log::warn!("[{}] model runtime unavailable; simulating separation", spec.id);
        for p in (10..=90).step_by(20) {
            self.pause(ctx)?;
            ctx.report_progress(p);
        }
        self.pause(ctx)?;
        ctx.report_progress(100);
        Ok(JobOutput::Stems(StemSet::invalid()))
    }
}

/// True when the configured interpreter can load the separation runtime.
pub fn probe_runtime(config: &SeparatorConfig) -> bool {
    for script in [&config.script, &config.live_script].into_iter().flatten() {
        if !script.exists() {
            log::warn!("separation script {} not found", script.display());
            return false;
        }
    }
    let mut cmd = Command::new(&config.interpreter);
    cmd.args(&config.probe_args);
    match run_with_timeout(cmd, PROBE_TIMEOUT) {
        Ok(Some(status)) if status.success() => true,
        Ok(Some(status)) => {
            log::warn!("runtime probe exited with {status}");
            false
        }
        Ok(None) => {
            log::warn!("runtime probe timed out after {PROBE_TIMEOUT:?}");
            false
        }
        Err(e) => {
            log::warn!("runtime probe failed: {e}");
            false
        }
    }
}

/// Resolve the configured mode to a concrete strategy.
pub fn select_runner(config: &SeparatorConfig) -> Arc<dyn JobRunner> {
    let mock = || -> Arc<dyn JobRunner> {
        Arc::new(MockRunner::new(Duration::from_millis(config.mock_step_ms)))
    };
    let external = || -> Arc<dyn JobRunner> { Arc::new(ExternalRunner::from_config(config)) };

    if cfg!(feature = "engine-mock") {
        return mock();
    }
    match config.mode {
        ExecutionMode::Mock => mock(),
        ExecutionMode::External => external(),
        ExecutionMode::Auto => {
            if probe_runtime(config) {
                log::info!("separation runtime found via {}", config.interpreter.display());
                external()
            } else {
                log::warn!("separation runtime unavailable; jobs will run in mock mode");
                mock()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;
    use std::sync::{
        atomic::{AtomicBool, AtomicU8},
        Mutex,
    };

    fn spec(dir: &std::path::Path) -> JobSpec {
        let source = dir.join("song.wav");
        std::fs::write(&source, b"RIFF").unwrap();
        JobSpec {
            id: JobId::generate(),
            kind: JobKind::File,
            source,
            model: "htdemucs".into(),
            output_dir: dir.join("out"),
        }
    }

    #[test]
    fn mock_walks_progress_and_yields_invalid_set() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = JobContext::new(
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicU8::new(0)),
            Box::new(move |p| sink.lock().unwrap().push(p)),
        );
        let out = MockRunner::new(Duration::from_millis(1))
            .run(&spec(dir.path()), &ctx)
            .unwrap();
        match out {
            JobOutput::Stems(s) => assert!(!s.is_valid()),
            JobOutput::Live(_) => panic!("mock never goes live"),
        }
        assert_eq!(*seen.lock().unwrap(), vec![10, 30, 50, 70, 90, 100]);
    }

    #[test]
    fn mock_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = JobContext::detached();
        ctx.cancel();
        let err = MockRunner::default().run(&spec(dir.path()), &ctx).err().unwrap();
        assert!(matches!(err, StemError::Cancelled));
    }

    #[test]
    fn explicit_modes_skip_the_probe() {
        let cfg = SeparatorConfig {
            mode: ExecutionMode::Mock,
            ..Default::default()
        };
        let runner = select_runner(&cfg);
        assert_eq!(runner.mode(), ExecutionMode::Mock);
        assert_eq!(runner.name(), "mock");
    }

    #[cfg(unix)]
    #[test]
    fn probe_follows_interpreter_exit_status() {
        let ok = SeparatorConfig {
            interpreter: "/bin/sh".into(),
            probe_args: vec!["-c".into(), "exit 0".into()],
            ..Default::default()
        };
        assert!(probe_runtime(&ok));

        let failing = SeparatorConfig {
            probe_args: vec!["-c".into(), "exit 1".into()],
            ..ok.clone()
        };
        assert!(!probe_runtime(&failing));

        let missing_script = SeparatorConfig {
            script: Some("/no/such/separate.py".into()),
            ..ok
        };
        assert!(!probe_runtime(&missing_script));
    }
}

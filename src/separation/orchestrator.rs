//! Public entry point for separation: job registry, cache, and event fan-out.

use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::OnceCell;
use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
};

use crate::{
    cache::store::SeparationCache,
    error::{ErrorClass, LastError, Result, StemError},
    separation::{
        job::{JobContext, JobOutput, JobSpec, LiveSession},
        runner::{select_runner, JobRunner},
    },
    types::{ExecutionMode, JobId, JobKind, ProcessingState, SeparatorConfig, StemSet},
};

/// Models the bundled separation scripts know how to load.
pub const AVAILABLE_MODELS: &[&str] = &["htdemucs", "htdemucs_ft", "htdemucs_6s", "mdx_extra"];

#[derive(Debug, Clone, PartialEq)]
pub enum SeparationEvent {
    Started { job_id: JobId, kind: JobKind },
    Progress { job_id: JobId, progress: u8 },
    Finished { job_id: JobId, stems: StemSet },
    LiveStemsReady { job_id: JobId, stems: StemSet },
    Error { job_id: JobId, message: String, class: ErrorClass },
    Cancelled { job_id: JobId },
    CacheUpdated,
}

struct ActiveJob {
    kind: JobKind,
    source: PathBuf,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    /// Set once the worker has committed to publishing its result.
    finishing: bool,
}

#[derive(Default)]
struct Registry {
    active: HashMap<JobId, ActiveJob>,
    completed: VecDeque<(JobId, StemSet)>,
    live: HashMap<JobId, LiveSession>,
    /// Workers of cancelled jobs, kept so shutdown can join them.
    detached: Vec<JoinHandle<()>>,
}

impl Registry {
    fn push_completed(&mut self, id: JobId, stems: StemSet, retention: usize) {
        self.completed.push_back((id, stems));
        self.trim_completed(retention);
    }

    fn trim_completed(&mut self, retention: usize) {
        while self.completed.len() > retention {
            self.completed.pop_front();
        }
    }
}

struct Shared {
    config: Mutex<SeparatorConfig>,
    registry: Mutex<Registry>,
    cache: OnceCell<SeparationCache>,
    subscribers: Mutex<Vec<Sender<SeparationEvent>>>,
    last_error: Mutex<Option<LastError>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Shared {
    fn config(&self) -> SeparatorConfig {
        lock(&self.config).clone()
    }

    fn broadcast(&self, event: SeparationEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn record_error(&self, err: &StemError) {
        *lock(&self.last_error) = Some(LastError::from(err));
    }

    /// Publish a worker's outcome.
    ///
    /// The job is claimed under the registry lock before anything is cached:
    /// a `cancel_separation` that lands first makes the whole outcome vanish,
    /// one that lands later is refused.
    fn finish_job(&self, spec: &JobSpec, progress: &AtomicU8, outcome: Result<JobOutput>) {
        let config = self.config();
        let id = spec.id.clone();

        let claimed = {
            let mut reg = lock(&self.registry);
            match reg.active.get_mut(&id) {
                Some(job) if !job.cancel.load(Ordering::SeqCst) => {
                    job.finishing = true;
                    true
                }
                _ => {
                    reg.active.remove(&id);
                    false
                }
            }
        };
        if !claimed {
            if let Ok(JobOutput::Live(session)) = outcome {
                session.stop();
            }
            log::info!("[{id}] cancelled");
            self.broadcast(SeparationEvent::Cancelled { job_id: id });
            return;
        }

        if let Ok(JobOutput::Stems(stems)) = &outcome {
            if config.cache_enabled && stems.is_valid() {
                if let Some(cache) = self.cache.get() {
                    match cache.store(&spec.source, &spec.model, stems) {
                        Ok(key) => {
                            log::info!("[{id}] cached stems under {key}");
                            self.broadcast(SeparationEvent::CacheUpdated);
                        }
                        Err(e) => log::warn!("[{id}] failed to cache stems: {e}"),
                    }
                }
            }
        }

        let mut reg = lock(&self.registry);
        reg.active.remove(&id);
        match outcome {
            Ok(JobOutput::Stems(stems)) => {
                reg.push_completed(id.clone(), stems.clone(), config.completed_retention);
                if progress.fetch_max(100, Ordering::SeqCst) < 100 {
                    self.broadcast(SeparationEvent::Progress {
                        job_id: id.clone(),
                        progress: 100,
                    });
                }
                log::info!("[{id}] finished (valid stems: {})", stems.is_valid());
                self.broadcast(SeparationEvent::Finished { job_id: id, stems });
            }
            Ok(JobOutput::Live(session)) => {
                let stems = session.stems().clone();
                reg.live.insert(id.clone(), session);
                reg.push_completed(id.clone(), stems.clone(), config.completed_retention);
                if progress.fetch_max(100, Ordering::SeqCst) < 100 {
                    self.broadcast(SeparationEvent::Progress {
                        job_id: id.clone(),
                        progress: 100,
                    });
                }
                log::info!("[{id}] live stems ready");
                self.broadcast(SeparationEvent::LiveStemsReady { job_id: id, stems });
            }
            Err(StemError::Cancelled) => {
                drop(reg);
                self.broadcast(SeparationEvent::Cancelled { job_id: id });
            }
            Err(e) => {
                drop(reg);
                log::error!("[{id}] separation failed: {e}");
                self.record_error(&e);
                self.broadcast(SeparationEvent::Error {
                    job_id: id,
                    message: e.to_string(),
                    class: e.class(),
                });
            }
        }
    }
}

pub struct SeparationOrchestrator {
    shared: Arc<Shared>,
    runner: OnceCell<Arc<dyn JobRunner>>,
    injected: Option<Arc<dyn JobRunner>>,
}

impl SeparationOrchestrator {
    pub fn new(config: SeparatorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Mutex::new(config),
                registry: Mutex::new(Registry::default()),
                cache: OnceCell::new(),
                subscribers: Mutex::new(Vec::new()),
                last_error: Mutex::new(None),
            }),
            runner: OnceCell::new(),
            injected: None,
        }
    }

    /// Use `runner` for every job instead of probing for the model runtime.
    pub fn with_runner(config: SeparatorConfig, runner: Arc<dyn JobRunner>) -> Self {
        let mut orchestrator = Self::new(config);
        orchestrator.injected = Some(runner);
        orchestrator
    }

    /// Validate the configuration, open the cache, and pick the execution strategy.
    /// Safe to call more than once; later calls return the established mode.
    pub fn initialize(&self) -> Result<ExecutionMode> {
        if let Some(r) = self.runner.get() {
            return Ok(r.mode());
        }
        let config = {
            let mut cfg = lock(&self.shared.config);
            cfg.validate()?;
            cfg.clone()
        };
        fs::create_dir_all(&config.output_dir)?;
        self.shared
            .cache
            .get_or_try_init(|| SeparationCache::open(&config.cache_dir, config.max_cache_entries))?;

        let runner = self
            .runner
            .get_or_init(|| self.injected.clone().unwrap_or_else(|| select_runner(&config)));
        log::info!(
            "stem separator initialized ({} runner, model {})",
            runner.name(),
            config.model_name
        );
        Ok(runner.mode())
    }

    pub fn is_initialized(&self) -> bool {
        self.runner.get().is_some()
    }

    pub fn execution_mode(&self) -> Option<ExecutionMode> {
        self.runner.get().map(|r| r.mode())
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Receiver<SeparationEvent> {
        let (tx, rx) = unbounded();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    pub fn last_error(&self) -> Option<LastError> {
        lock(&self.shared.last_error).clone()
    }

    pub fn start_separation(&self, path: impl AsRef<Path>) -> Result<JobId> {
        self.start(path.as_ref(), JobKind::File)
    }

    pub fn start_live_separation(&self, path: impl AsRef<Path>) -> Result<JobId> {
        self.start(path.as_ref(), JobKind::Live)
    }

    fn start(&self, path: &Path, kind: JobKind) -> Result<JobId> {
        let result = self.try_start(path, kind);
        if let Err(e) = &result {
            log::error!("cannot start separation of {}: {e}", path.display());
            self.shared.record_error(e);
        }
        result
    }

    fn try_start(&self, path: &Path, kind: JobKind) -> Result<JobId> {
        let runner = self.runner.get().cloned().ok_or(StemError::NotInitialized)?;
        if !path.is_file() {
            return Err(StemError::InputMissing {
                path: path.to_path_buf(),
            });
        }
        let config = self.shared.config();
        let id = JobId::generate();

        if kind == JobKind::File && config.cache_enabled {
            if let Some(stems) = self.cached(path, &config.model_name) {
                log::info!("[{id}] cache hit for {}", path.display());
                let mut reg = lock(&self.shared.registry);
                reg.push_completed(id.clone(), stems.clone(), config.completed_retention);
                self.shared.broadcast(SeparationEvent::Started {
                    job_id: id.clone(),
                    kind,
                });
                self.shared.broadcast(SeparationEvent::Progress {
                    job_id: id.clone(),
                    progress: 100,
                });
                self.shared.broadcast(SeparationEvent::Finished {
                    job_id: id.clone(),
                    stems,
                });
                return Ok(id);
            }
        }

        let dir_name = match kind {
            JobKind::File => id.to_string(),
            JobKind::Live => format!("live_{id}"),
        };
        let spec = JobSpec {
            id: id.clone(),
            kind,
            source: path.to_path_buf(),
            model: config.model_name.clone(),
            output_dir: config.output_dir.join(dir_name),
        };
        let cancel = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicU8::new(0));

        let mut reg = lock(&self.shared.registry);
        reg.active.insert(
            id.clone(),
            ActiveJob {
                kind,
                source: spec.source.clone(),
                cancel: cancel.clone(),
                worker: None,
                finishing: false,
            },
        );
        self.shared.broadcast(SeparationEvent::Started {
            job_id: id.clone(),
            kind,
        });

        let shared = self.shared.clone();
        let worker = thread::Builder::new()
            .name(format!("separation-{}", id.as_str().get(..8).unwrap_or(id.as_str())))
            .spawn(move || {
                let events = shared.clone();
                let job_id = spec.id.clone();
                let ctx = JobContext::new(
                    cancel,
                    progress.clone(),
                    Box::new(move |p| {
                        events.broadcast(SeparationEvent::Progress {
                            job_id: job_id.clone(),
                            progress: p,
                        })
                    }),
                );
                log::info!(
                    "[{}] {:?} separation of {} via {} runner",
                    spec.id,
                    spec.kind,
                    spec.source.display(),
                    runner.name()
                );
                let outcome = runner.run(&spec, &ctx);
                shared.finish_job(&spec, &progress, outcome);
            });

        match worker {
            Ok(handle) => {
                if let Some(job) = reg.active.get_mut(&id) {
                    job.worker = Some(handle);
                }
                Ok(id)
            }
            Err(e) => {
                reg.active.remove(&id);
                Err(StemError::Io(e))
            }
        }
    }

    pub fn get_processing_state(&self, id: &JobId) -> ProcessingState {
        let reg = lock(&self.shared.registry);
        if reg.active.contains_key(id) {
            ProcessingState::Processing
        } else if reg.completed.iter().any(|(j, _)| j == id) {
            ProcessingState::Completed
        } else {
            ProcessingState::Idle
        }
    }

    /// Terminal result of `id`, or an invalid set when unknown or still running.
    pub fn get_results(&self, id: &JobId) -> StemSet {
        lock(&self.shared.registry)
            .completed
            .iter()
            .find(|(j, _)| j == id)
            .map(|(_, s)| s.clone())
            .unwrap_or_else(StemSet::invalid)
    }

    /// Ask an active job to stop. Returns false when `id` is not running or
    /// is already publishing its result.
    pub fn cancel_separation(&self, id: &JobId) -> bool {
        let mut reg = lock(&self.shared.registry);
        if reg.active.get(id).map(|j| j.finishing).unwrap_or(true) {
            return false;
        }
        match reg.active.remove(id) {
            Some(mut job) => {
                job.cancel.store(true, Ordering::SeqCst);
                log::info!("[{id}] cancellation requested ({:?} job on {})", job.kind, job.source.display());
                if let Some(worker) = job.worker.take() {
                    reg.detached.push(worker);
                }
                true
            }
            None => false,
        }
    }

    /// Ids of jobs currently running.
    pub fn active_jobs(&self) -> Vec<JobId> {
        lock(&self.shared.registry).active.keys().cloned().collect()
    }

    /// Trim retained results to the configured count and forget finished workers.
    pub fn cleanup_finished_jobs(&self) {
        let retention = lock(&self.shared.config).completed_retention;
        let mut reg = lock(&self.shared.registry);
        reg.trim_completed(retention);
        reg.detached.retain(|h| !h.is_finished());
    }

    fn cached(&self, path: &Path, model: &str) -> Option<StemSet> {
        self.shared.cache.get()?.lookup(path, model)
    }

    pub fn has_cached_stems(&self, path: impl AsRef<Path>) -> bool {
        self.get_cached_stems(path).is_some()
    }

    pub fn get_cached_stems(&self, path: impl AsRef<Path>) -> Option<StemSet> {
        let config = self.shared.config();
        if !config.cache_enabled {
            return None;
        }
        self.cached(path.as_ref(), &config.model_name)
    }

    pub fn clear_cache(&self) -> Result<()> {
        if let Some(cache) = self.shared.cache.get() {
            cache.clear()?;
            self.shared.broadcast(SeparationEvent::CacheUpdated);
        }
        Ok(())
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        lock(&self.shared.config).cache_enabled = enabled;
    }

    pub fn set_max_cache_entries(&self, max_entries: usize) -> Result<()> {
        lock(&self.shared.config).max_cache_entries = max_entries.max(1);
        match self.shared.cache.get() {
            Some(cache) => cache.set_max_entries(max_entries),
            None => Ok(()),
        }
    }

    pub fn set_model_name(&self, model: &str) -> Result<()> {
        let model = model.trim();
        if model.is_empty() {
            return Err(StemError::Config("model_name must not be empty".into()));
        }
        if !AVAILABLE_MODELS.contains(&model) {
            log::warn!("model {model} is not one of the known models");
        }
        lock(&self.shared.config).model_name = model.to_string();
        Ok(())
    }

    pub fn model_name(&self) -> String {
        lock(&self.shared.config).model_name.clone()
    }

    pub fn available_models(&self) -> &'static [&'static str] {
        AVAILABLE_MODELS
    }

    /// Change where new jobs write their outputs, creating the directory.
    pub fn set_output_directory(&self, dir: impl Into<PathBuf>) -> Result<()> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        lock(&self.shared.config).output_dir = dir;
        Ok(())
    }

    pub fn output_directory(&self) -> PathBuf {
        lock(&self.shared.config).output_dir.clone()
    }

    /// End the live process feeding `id`'s pipes.
    pub fn stop_live_session(&self, id: &JobId) -> bool {
        let session = lock(&self.shared.registry).live.remove(id);
        match session {
            Some(s) => {
                s.stop();
                true
            }
            None => false,
        }
    }

    /// Cancel every job, wait for their workers, and stop all live sessions.
    pub fn shutdown(&self) {
        let (workers, sessions) = {
            let mut reg = lock(&self.shared.registry);
            let mut workers: Vec<JoinHandle<()>> = reg.detached.drain(..).collect();
            for job in reg.active.values_mut() {
                job.cancel.store(true, Ordering::SeqCst);
                workers.extend(job.worker.take());
            }
            let sessions: Vec<LiveSession> = reg.live.drain().map(|(_, s)| s).collect();
            (workers, sessions)
        };
        for w in workers {
            if w.join().is_err() {
                log::error!("separation worker panicked");
            }
        }
        for s in sessions {
            s.stop();
        }
    }
}

impl Drop for SeparationOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

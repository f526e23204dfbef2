//! One external-process invocation, from spawn to a verified stem set.

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    error::{truncate_excerpt, Result, StemError, DIAGNOSTIC_EXCERPT_BYTES},
    io::process::{ChildOutput, MonitoredChild, OutputStream},
    separation::parser::{ProgressStreamParser, StreamEvent},
    types::{JobId, JobKind, SeparatorConfig, Stem, StemSet},
};

/// Progress reported as soon as a job starts working.
pub const PROGRESS_STARTED: u8 = 5;
/// Progress reported once the external process is running.
pub const PROGRESS_SPAWNED: u8 = 6;
/// Ceiling for synthetic heartbeat progress.
pub const HEARTBEAT_CAP: u8 = 9;

/// Extensions accepted for generated stem files.
pub const STEM_EXTENSIONS: &[&str] = &["wav", "mp3", "flac"];
/// Suffix of the named pipes a live-mode process creates.
pub const PIPE_SUFFIX: &str = "pipe";

const DRAIN_LIMIT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct JobSpec {
    pub id: JobId,
    pub kind: JobKind,
    pub source: PathBuf,
    pub model: String,
    /// Job-specific destination directory, created if absent.
    pub output_dir: PathBuf,
}

pub type ProgressCallback = Box<dyn Fn(u8) + Send + Sync>;

/// Shared state between a running job and whoever started it.
pub struct JobContext {
    cancel: Arc<AtomicBool>,
    progress: Arc<AtomicU8>,
    on_progress: ProgressCallback,
}

impl JobContext {
    pub fn new(cancel: Arc<AtomicBool>, progress: Arc<AtomicU8>, on_progress: ProgressCallback) -> Self {
        Self {
            cancel,
            progress,
            on_progress,
        }
    }

    /// A context nobody observes. Handy for running a job inline.
    pub fn detached() -> Self {
        Self::new(
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicU8::new(0)),
            Box::new(|_| {}),
        )
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Publish `value` if it moves progress forward. Returns whether it did.
    pub fn report_progress(&self, value: u8) -> bool {
        let value = value.min(100);
        let prev = self.progress.fetch_max(value, Ordering::SeqCst);
        if value > prev {
            (self.on_progress)(value);
            true
        } else {
            false
        }
    }
}

/// What a successful job hands back.
pub enum JobOutput {
    Stems(StemSet),
    Live(LiveSession),
}

/// A live-mode process that keeps writing its pipes until stopped or dropped.
#[derive(Debug)]
pub struct LiveSession {
    job_id: JobId,
    stems: StemSet,
    dir: PathBuf,
    child: MonitoredChild,
}

impl LiveSession {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn stems(&self) -> &StemSet {
        &self.stems
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_running(&mut self) -> bool {
        self.child.is_running()
    }

    pub fn stop(mut self) {
        log::info!("stopping live session {}", self.job_id);
        self.child.kill();
    }
}

/// Timing and invocation settings for externally-run jobs.
#[derive(Clone, Debug)]
pub struct RunnerSettings {
    pub interpreter: PathBuf,
    pub script: Option<PathBuf>,
    pub live_script: Option<PathBuf>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub heartbeat: Duration,
    pub settle: Duration,
    pub live_ready_timeout: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &SeparatorConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            script: config.script.clone(),
            live_script: config.live_script.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            heartbeat: Duration::from_millis(config.heartbeat_ms),
            settle: Duration::from_millis(config.settle_ms),
            live_ready_timeout: Duration::from_millis(config.live_ready_timeout_ms),
        }
    }

    fn command(&self, script: Option<&Path>, spec: &JobSpec) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        if let Some(script) = script {
            cmd.arg(script);
        }
        cmd.arg("--audio")
            .arg(&spec.source)
            .arg("--output")
            .arg(&spec.output_dir)
            .arg("--model")
            .arg(&spec.model);
        cmd
    }
}

/// Keeps the last `cap` bytes written to it.
struct TailBuffer {
    bytes: Vec<u8>,
    cap: usize,
}

impl TailBuffer {
    fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
        if self.bytes.len() > self.cap {
            let excess = self.bytes.len() - self.cap;
            self.bytes.drain(..excess);
        }
    }

    fn excerpt(&self) -> String {
        let text = String::from_utf8_lossy(&self.bytes);
        truncate_excerpt(text.trim(), DIAGNOSTIC_EXCERPT_BYTES).to_string()
    }
}

/// Splits a byte stream into lines on `\n` or `\r`, holding at most `cap`
/// bytes of a line that has not ended yet.
struct LineSplitter {
    pending: Vec<u8>,
    cap: usize,
}

impl LineSplitter {
    fn new(cap: usize) -> Self {
        Self {
            pending: Vec::new(),
            cap,
        }
    }

    fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for piece in data.split_inclusive(|&b| b == b'\n' || b == b'\r') {
            let (body, ended) = match piece.split_last() {
                Some((&last, body)) if last == b'\n' || last == b'\r' => (body, true),
                _ => (piece, false),
            };
            self.pending.extend_from_slice(body);
            if self.pending.len() > self.cap {
                let excess = self.pending.len() - self.cap;
                self.pending.drain(..excess);
            }
            if ended {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                if !line.is_empty() {
                    lines.push(line);
                }
            }
        }
        lines
    }
}

/// Everything observed on the child's streams while it runs.
struct Supervision {
    parser: ProgressStreamParser,
    stdout: TailBuffer,
    stderr: TailBuffer,
    stderr_lines: LineSplitter,
    last_advance: Instant,
    ready: bool,
}

impl Supervision {
    fn new(ctx: &JobContext) -> Self {
        Self {
            parser: ProgressStreamParser::with_progress(ctx.progress()),
            stdout: TailBuffer::new(DIAGNOSTIC_EXCERPT_BYTES),
            stderr: TailBuffer::new(DIAGNOSTIC_EXCERPT_BYTES),
            stderr_lines: LineSplitter::new(DIAGNOSTIC_EXCERPT_BYTES),
            last_advance: Instant::now(),
            ready: false,
        }
    }

    fn absorb(&mut self, spec: &JobSpec, ctx: &JobContext, msg: ChildOutput) {
        match msg {
            ChildOutput::Data(OutputStream::Stdout, data) => {
                self.stdout.push(&data);
                let events = self.parser.feed(&data);
                self.dispatch(spec, ctx, events);
            }
            ChildOutput::Data(OutputStream::Stderr, data) => {
                self.stderr.push(&data);
                for line in self.stderr_lines.feed(&data) {
                    log::debug!("[{}] stderr: {line}", spec.id);
                }
            }
            ChildOutput::Closed(stream) => log::trace!("[{}] {stream:?} closed", spec.id),
        }
    }

    fn finish(&mut self, spec: &JobSpec, ctx: &JobContext) {
        let events = self.parser.finish();
        self.dispatch(spec, ctx, events);
    }

    fn dispatch(&mut self, spec: &JobSpec, ctx: &JobContext, events: Vec<StreamEvent>) {
        for ev in events {
            match ev {
                StreamEvent::Progress(p) => {
                    if ctx.report_progress(p) {
                        self.last_advance = Instant::now();
                    }
                }
                StreamEvent::Ready => self.ready = true,
                StreamEvent::Error(msg) => log::error!("[{}] separation process: {msg}", spec.id),
                StreamEvent::Diagnostic(line) => log::debug!("[{}] {line}", spec.id),
            }
        }
    }

    fn heartbeat(&mut self, spec: &JobSpec, ctx: &JobContext, every: Duration) {
        if self.last_advance.elapsed() < every {
            return;
        }
        self.last_advance = Instant::now();
        if let Some(p) = self.parser.heartbeat(HEARTBEAT_CAP) {
            log::debug!("[{}] heartbeat progress {p}", spec.id);
            ctx.report_progress(p);
        }
    }

    fn exit_error(&self, status: ExitStatus) -> StemError {
        StemError::ProcessExitedNonZero {
            code: status.code(),
            stdout: self.stdout.excerpt(),
            stderr: self.stderr.excerpt(),
        }
    }
}

fn prepare(spec: &JobSpec, ctx: &JobContext) -> Result<()> {
    if !spec.source.is_file() {
        return Err(StemError::InputMissing {
            path: spec.source.clone(),
        });
    }
    fs::create_dir_all(&spec.output_dir)?;
    ctx.report_progress(PROGRESS_STARTED);
    Ok(())
}

/// Run a file-mode separation to completion and verify its four outputs.
pub fn run_file_job(settings: &RunnerSettings, spec: &JobSpec, ctx: &JobContext) -> Result<StemSet> {
    prepare(spec, ctx)?;

    let mut child = MonitoredChild::spawn(settings.command(settings.script.as_deref(), spec))?;
    log::info!("[{}] separation process started (pid {})", spec.id, child.id());
    ctx.report_progress(PROGRESS_SPAWNED);

    let started = Instant::now();
    let mut sup = Supervision::new(ctx);
    let status = loop {
        if ctx.cancelled() {
            child.kill();
            return Err(StemError::Cancelled);
        }
        if started.elapsed() >= settings.timeout {
            child.kill();
            return Err(StemError::ProcessTimeout {
                elapsed_ms: started.elapsed().as_millis(),
            });
        }
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Some(msg) = child.recv_timeout(settings.poll_interval) {
            sup.absorb(spec, ctx, msg);
        }
        sup.heartbeat(spec, ctx, settings.heartbeat);
    };

    for msg in child.drain(DRAIN_LIMIT) {
        sup.absorb(spec, ctx, msg);
    }
    sup.finish(spec, ctx);

    if ctx.cancelled() {
        return Err(StemError::Cancelled);
    }
    if !status.success() {
        return Err(sup.exit_error(status));
    }

    thread::sleep(settings.settle);
    let stems = collect_stems(&spec.output_dir)?;
    log::info!("[{}] separation produced all stems in {}", spec.id, spec.output_dir.display());
    Ok(stems)
}

/// Start a live-mode separation and return once its pipes are ready to be read.
pub fn run_live_job(settings: &RunnerSettings, spec: &JobSpec, ctx: &JobContext) -> Result<LiveSession> {
    prepare(spec, ctx)?;

    let script = settings.live_script.as_deref().or(settings.script.as_deref());
    let mut child = MonitoredChild::spawn(settings.command(script, spec))?;
    log::info!("[{}] live separation process started (pid {})", spec.id, child.id());
    ctx.report_progress(PROGRESS_SPAWNED);

    let pipes = pipe_paths(&spec.output_dir);
    let started = Instant::now();
    let mut sup = Supervision::new(ctx);
    loop {
        if ctx.cancelled() {
            child.kill();
            return Err(StemError::Cancelled);
        }
        if started.elapsed() >= settings.live_ready_timeout {
            child.kill();
            return Err(StemError::ProcessTimeout {
                elapsed_ms: started.elapsed().as_millis(),
            });
        }
        if sup.ready && pipes.iter().all(|p| p.exists()) {
            break;
        }
        if let Some(status) = child.try_wait()? {
            for msg in child.drain(DRAIN_LIMIT) {
                sup.absorb(spec, ctx, msg);
            }
            sup.finish(spec, ctx);
            if !status.success() {
                return Err(sup.exit_error(status));
            }
            return Err(StemError::OutputFilesMissing {
                dir: spec.output_dir.clone(),
                listing: list_dir(&spec.output_dir),
            });
        }
        if let Some(msg) = child.recv_timeout(settings.poll_interval) {
            sup.absorb(spec, ctx, msg);
        }
        sup.heartbeat(spec, ctx, settings.heartbeat);
    }

    child.discard_output();
    let [v, d, b, o] = pipes;
    let stems = StemSet::new(Some(v), Some(d), Some(b), Some(o));
    log::info!("[{}] live stems ready in {}", spec.id, spec.output_dir.display());
    Ok(LiveSession {
        job_id: spec.id.clone(),
        stems,
        dir: spec.output_dir.clone(),
        child,
    })
}

/// `<dir>/<stem>.pipe` for every stem, in mixer index order.
pub fn pipe_paths(dir: &Path) -> [PathBuf; Stem::COUNT] {
    [Stem::Vocals, Stem::Drums, Stem::Bass, Stem::Other]
        .map(|s| dir.join(format!("{}.{PIPE_SUFFIX}", s.name())))
}

/// Match generated media files in `dir` to stems by name.
pub fn collect_stems(dir: &Path) -> Result<StemSet> {
    let mut names = list_dir(dir);
    names.sort();

    let mut slots: [Option<PathBuf>; Stem::COUNT] = Default::default();
    for name in &names {
        let ext_ok = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| STEM_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
            .unwrap_or(false);
        if !ext_ok {
            continue;
        }
        if let Some(stem) = Stem::from_file_name(name) {
            let slot = &mut slots[stem.index()];
            if slot.is_none() {
                *slot = Some(dir.join(name));
            }
        }
    }

    let stems = StemSet::from_paths(slots);
    if stems.is_valid() {
        Ok(stems)
    } else {
        Err(StemError::OutputFilesMissing {
            dir: dir.to_path_buf(),
            listing: names,
        })
    }
}

fn list_dir(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .map(|rd| {
            rd.flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Harness {
        dir: tempfile::TempDir,
        seen: Arc<Mutex<Vec<u8>>>,
        cancel: Arc<AtomicBool>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                seen: Arc::new(Mutex::new(Vec::new())),
                cancel: Arc::new(AtomicBool::new(false)),
            }
        }

        fn script(&self, body: &str) -> RunnerSettings {
            let path = self.dir.path().join("separate.sh");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            RunnerSettings {
                interpreter: "/bin/sh".into(),
                script: Some(path.clone()),
                live_script: Some(path),
                timeout: Duration::from_secs(20),
                poll_interval: Duration::from_millis(50),
                heartbeat: Duration::from_secs(5),
                settle: Duration::from_millis(10),
                live_ready_timeout: Duration::from_secs(20),
            }
        }

        fn spec(&self, kind: JobKind) -> JobSpec {
            let source = self.dir.path().join("song.wav");
            fs::write(&source, b"RIFF").unwrap();
            JobSpec {
                id: JobId::generate(),
                kind,
                source,
                model: "htdemucs".into(),
                output_dir: self.dir.path().join("out"),
            }
        }

        fn ctx(&self) -> JobContext {
            let seen = self.seen.clone();
            JobContext::new(
                self.cancel.clone(),
                Arc::new(AtomicU8::new(0)),
                Box::new(move |p| seen.lock().unwrap().push(p)),
            )
        }

        fn seen(&self) -> Vec<u8> {
            self.seen.lock().unwrap().clone()
        }
    }

    const WRITES_FOUR_STEMS: &str = r#"
out="$4"
echo "PROGRESS:20"
echo "loading model"
echo "PROGRESS:15"
echo "PROGRESS:60"
for s in vocals drums bass other; do echo x > "$out/song_$s.wav"; done
echo "SEPARATION_COMPLETE"
"#;

    #[test]
    fn carriage_return_progress_bars_split_and_stay_bounded() {
        let mut lines = LineSplitter::new(64);
        let mut seen = Vec::new();
        for pct in 0..10_000 {
            seen.extend(lines.feed(format!("\r{:>3}%|####", pct % 100).as_bytes()));
            assert!(lines.pending.len() <= 64);
        }
        assert_eq!(seen.len(), 9_999);
        assert_eq!(seen[0], "0%|####");

        // one unterminated line far longer than the cap keeps only its tail
        assert!(lines.feed(&[b'x'; 10_000]).is_empty());
        assert_eq!(lines.pending.len(), 64);
        assert_eq!(lines.feed(b"end\n"), vec![format!("{}end", "x".repeat(61))]);
    }

    #[test]
    fn stderr_progress_bars_do_not_disturb_the_run() {
        let h = Harness::new();
        let spec = h.spec(JobKind::File);
        let body = format!(
            "i=0; while [ $i -lt 2000 ]; do printf '\\r%3d%%|#####|' $i >&2; i=$((i+1)); done\n{WRITES_FOUR_STEMS}"
        );
        let stems = run_file_job(&h.script(&body), &spec, &h.ctx()).unwrap();
        assert!(stems.is_valid());
    }

    #[test]
    fn successful_run_yields_valid_stems_and_monotonic_progress() {
        let h = Harness::new();
        let spec = h.spec(JobKind::File);
        let stems = run_file_job(&h.script(WRITES_FOUR_STEMS), &spec, &h.ctx()).unwrap();
        assert!(stems.is_valid());
        assert!(stems.path(Stem::Drums).unwrap().ends_with("song_drums.wav"));
        assert_eq!(h.seen(), vec![5, 6, 20, 60, 95]);
    }

    #[test]
    fn missing_outputs_fail_validation_with_listing() {
        let h = Harness::new();
        let spec = h.spec(JobKind::File);
        let body = r#"echo x > "$4/vocals.wav"; echo x > "$4/drums.mp3"; echo x > "$4/bass.txt""#;
        let err = run_file_job(&h.script(body), &spec, &h.ctx()).unwrap_err();
        match err {
            StemError::OutputFilesMissing { listing, .. } => {
                assert!(listing.contains(&"bass.txt".to_string()));
                assert_eq!(listing.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_zero_exit_carries_code_and_stderr() {
        let h = Harness::new();
        let spec = h.spec(JobKind::File);
        let body = "echo 'ERROR: model not found'; echo boom 1>&2; exit 3";
        let err = run_file_job(&h.script(body), &spec, &h.ctx()).unwrap_err();
        match err {
            StemError::ProcessExitedNonZero { code, stderr, stdout } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
                assert!(stdout.contains("model not found"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_source_fails_before_spawning() {
        let h = Harness::new();
        let mut spec = h.spec(JobKind::File);
        spec.source = h.dir.path().join("absent.wav");
        let marker = h.dir.path().join("spawned");
        let body = format!("touch '{}'", marker.display());
        let err = run_file_job(&h.script(&body), &spec, &h.ctx()).unwrap_err();
        assert!(matches!(err, StemError::InputMissing { .. }));
        assert!(!marker.exists());
        assert!(h.seen().is_empty());
    }

    #[test]
    fn wall_clock_timeout_kills_the_process() {
        let h = Harness::new();
        let spec = h.spec(JobKind::File);
        let mut settings = h.script("exec sleep 30");
        settings.timeout = Duration::from_millis(300);
        let started = Instant::now();
        let err = run_file_job(&settings, &spec, &h.ctx()).unwrap_err();
        assert!(matches!(err, StemError::ProcessTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancellation_stops_within_a_poll_interval() {
        let h = Harness::new();
        let spec = h.spec(JobKind::File);
        let settings = h.script("exec sleep 30");
        let cancel = h.cancel.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            cancel.store(true, Ordering::SeqCst);
        });
        let started = Instant::now();
        let err = run_file_job(&settings, &spec, &h.ctx()).unwrap_err();
        t.join().unwrap();
        assert!(matches!(err, StemError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn heartbeat_bumps_progress_but_stays_below_ten() {
        let h = Harness::new();
        let spec = h.spec(JobKind::File);
        let mut settings = h.script("sleep 1; exit 1");
        settings.heartbeat = Duration::from_millis(100);
        let _ = run_file_job(&settings, &spec, &h.ctx());
        let seen = h.seen();
        assert!(seen.len() > 2, "expected heartbeat progress, got {seen:?}");
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(seen.iter().all(|p| *p <= HEARTBEAT_CAP));
    }

    #[test]
    fn live_job_waits_for_ready_and_pipes() {
        let h = Harness::new();
        let spec = h.spec(JobKind::Live);
        let body = r#"
out="$4"
echo "PROGRESS:10"
for s in vocals drums bass other; do mkfifo "$out/$s.pipe"; done
echo "READY"
exec sleep 30
"#;
        let mut session = run_live_job(&h.script(body), &spec, &h.ctx()).unwrap();
        assert!(session.stems().is_valid());
        assert!(session.stems().is_live());
        assert!(session.is_running());
        session.stop();
    }

    #[test]
    fn live_job_that_exits_early_fails() {
        let h = Harness::new();
        let spec = h.spec(JobKind::Live);
        let err = run_live_job(&h.script("echo READY; exit 0"), &spec, &h.ctx()).unwrap_err();
        assert!(matches!(err, StemError::OutputFilesMissing { .. }));
    }
}

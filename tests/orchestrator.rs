mod common;

use common::{collect_until, eventually, init_logging, write_dc_wav};
use crossbeam_channel::{bounded, Receiver, Sender};
use stem_mixer_core::{
    ErrorClass, ExecutionMode, JobContext, JobId, JobOutput, JobRunner, JobSpec, ProcessingState,
    SeparationEvent, SeparationOrchestrator, SeparatorConfig, StemError, StemSet,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(20);

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        init_logging();
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn source(&self) -> PathBuf {
        write_dc_wav(&self.path("song.wav"), 44_100, 2, 0.25, 0.2)
    }

    fn config(&self, script_body: &str) -> SeparatorConfig {
        let script = self.path("separate.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        SeparatorConfig {
            interpreter: "/bin/sh".into(),
            script: Some(script.clone()),
            live_script: Some(script),
            mode: ExecutionMode::External,
            output_dir: self.path("out"),
            cache_dir: self.path("cache"),
            poll_interval_ms: 50,
            settle_ms: 10,
            mock_step_ms: 2,
            ..Default::default()
        }
    }

    fn orchestrator(&self, script_body: &str) -> SeparationOrchestrator {
        let orch = SeparationOrchestrator::new(self.config(script_body));
        orch.initialize().unwrap();
        orch
    }
}

fn finished_for(id: &JobId) -> impl Fn(&SeparationEvent) -> bool + '_ {
    move |ev| match ev {
        SeparationEvent::Finished { job_id, .. }
        | SeparationEvent::Error { job_id, .. }
        | SeparationEvent::Cancelled { job_id } => job_id == id,
        _ => false,
    }
}

fn progress_of(events: &[SeparationEvent], id: &JobId) -> Vec<u8> {
    events
        .iter()
        .filter_map(|ev| match ev {
            SeparationEvent::Progress { job_id, progress } if job_id == id => Some(*progress),
            _ => None,
        })
        .collect()
}

const COPIES_SOURCE: &str = r#"
echo "PROGRESS:30"
for s in vocals drums bass other; do cp "$2" "$4/track_$s.wav"; done
echo "PROGRESS:80"
echo "SEPARATION_COMPLETE"
"#;

#[test]
fn nonexistent_input_is_rejected_with_input_error() {
    let env = Env::new();
    let orch = env.orchestrator(COPIES_SOURCE);
    let err = orch.start_separation(env.path("missing.wav")).unwrap_err();
    assert!(matches!(err, StemError::InputMissing { .. }));
    let last = orch.last_error().unwrap();
    assert_eq!(last.class, ErrorClass::Input);
    assert!(last.message.contains("missing.wav"));
}

#[test]
fn starting_before_initialize_fails() {
    let env = Env::new();
    let orch = SeparationOrchestrator::new(env.config(COPIES_SOURCE));
    assert!(!orch.is_initialized());
    let err = orch.start_separation(env.source()).unwrap_err();
    assert!(matches!(err, StemError::NotInitialized));
}

#[cfg(unix)]
#[test]
fn successful_job_reports_monotonic_progress_and_valid_stems() {
    let env = Env::new();
    let orch = env.orchestrator(COPIES_SOURCE);
    assert_eq!(orch.execution_mode(), Some(ExecutionMode::External));
    let rx = orch.subscribe();
    let src = env.source();

    let id = orch.start_separation(&src).unwrap();
    let (events, done) = collect_until(&rx, WAIT, finished_for(&id));
    assert!(done, "no terminal event: {events:?}");
    assert!(matches!(events.last(), Some(SeparationEvent::Finished { .. })));

    let progress = progress_of(&events, &id);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&100));

    assert_eq!(orch.get_processing_state(&id), ProcessingState::Completed);
    let stems = orch.get_results(&id);
    assert!(stems.is_valid());
    assert!(stems.paths().all(|(_, p)| p.map(|p| p.exists()).unwrap_or(false)));
}

#[cfg(unix)]
#[test]
fn each_start_gets_a_fresh_id() {
    let env = Env::new();
    let orch = env.orchestrator(COPIES_SOURCE);
    orch.set_cache_enabled(false);
    let src = env.source();

    let a = orch.start_separation(&src).unwrap();
    let b = orch.start_separation(&src).unwrap();
    assert_ne!(a, b);
    assert!(!a.as_str().is_empty());

    assert!(eventually(WAIT, || {
        orch.get_processing_state(&a) == ProcessingState::Completed
            && orch.get_processing_state(&b) == ProcessingState::Completed
    }));
    assert!(orch.get_results(&a).is_valid());
    assert!(orch.get_results(&b).is_valid());
    assert_ne!(orch.get_results(&a), orch.get_results(&b));
}

#[cfg(unix)]
#[test]
fn second_run_is_served_from_cache_without_spawning() {
    let env = Env::new();
    let counter = env.path("spawns");
    let body = format!("echo run >> '{}'\n{COPIES_SOURCE}", counter.display());
    let orch = env.orchestrator(&body);
    let rx = orch.subscribe();
    let src = env.source();

    let first = orch.start_separation(&src).unwrap();
    let (_, done) = collect_until(&rx, WAIT, finished_for(&first));
    assert!(done);
    let first_stems = orch.get_results(&first);
    assert!(first_stems.is_valid());
    assert!(orch.has_cached_stems(&src));

    let second = orch.start_separation(&src).unwrap();
    assert_ne!(first, second);
    assert_eq!(orch.get_processing_state(&second), ProcessingState::Completed);
    assert_eq!(orch.get_results(&second), first_stems);
    assert_eq!(orch.get_cached_stems(&src), Some(first_stems));

    let spawns = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(spawns.lines().count(), 1);

    orch.clear_cache().unwrap();
    assert!(!orch.has_cached_stems(&src));
}

#[cfg(unix)]
#[test]
fn cancelled_job_never_finishes() {
    let env = Env::new();
    let orch = env.orchestrator("echo PROGRESS:10\nexec sleep 30");
    let rx = orch.subscribe();
    let id = orch.start_separation(env.source()).unwrap();

    let (_, saw) = collect_until(&rx, WAIT, |ev| {
        matches!(ev, SeparationEvent::Progress { progress: 10, .. })
    });
    assert!(saw);
    assert!(orch.cancel_separation(&id));
    assert_eq!(orch.get_processing_state(&id), ProcessingState::Idle);
    assert!(!orch.cancel_separation(&id));

    let (events, done) = collect_until(&rx, Duration::from_secs(5), finished_for(&id));
    assert!(done);
    assert!(matches!(events.last(), Some(SeparationEvent::Cancelled { .. })));
    let (late, _) = collect_until(&rx, Duration::from_millis(300), |_| false);
    assert!(!late
        .iter()
        .any(|ev| matches!(ev, SeparationEvent::Finished { .. })));
    assert!(!orch.get_results(&id).is_valid());
}

#[cfg(unix)]
#[test]
fn failing_process_surfaces_process_error() {
    let env = Env::new();
    let orch = env.orchestrator("echo 'ERROR: CUDA out of memory'; echo trace 1>&2; exit 2");
    let rx = orch.subscribe();
    let id = orch.start_separation(env.source()).unwrap();

    let (events, done) = collect_until(&rx, WAIT, finished_for(&id));
    assert!(done);
    match events.last() {
        Some(SeparationEvent::Error { class, message, .. }) => {
            assert_eq!(*class, ErrorClass::Process);
            assert!(message.contains("trace"));
        }
        other => panic!("expected an error event, got {other:?}"),
    }
    assert_eq!(orch.get_processing_state(&id), ProcessingState::Idle);
    assert_eq!(orch.last_error().map(|e| e.class), Some(ErrorClass::Process));
}

#[cfg(unix)]
#[test]
fn missing_outputs_surface_validation_error() {
    let env = Env::new();
    let orch = env.orchestrator(r#"cp "$2" "$4/vocals.wav""#);
    let rx = orch.subscribe();
    let id = orch.start_separation(env.source()).unwrap();
    let (events, done) = collect_until(&rx, WAIT, finished_for(&id));
    assert!(done);
    assert!(matches!(
        events.last(),
        Some(SeparationEvent::Error { class: ErrorClass::OutputValidation, .. })
    ));
}

#[test]
fn mock_mode_produces_invalid_stems_after_full_progress() {
    let env = Env::new();
    let cfg = SeparatorConfig {
        mode: ExecutionMode::Mock,
        ..env.config("exit 1")
    };
    let orch = SeparationOrchestrator::new(cfg);
    assert_eq!(orch.initialize().unwrap(), ExecutionMode::Mock);
    let rx = orch.subscribe();

    let id = orch.start_separation(env.source()).unwrap();
    let (events, done) = collect_until(&rx, WAIT, finished_for(&id));
    assert!(done);
    assert_eq!(progress_of(&events, &id), vec![10, 30, 50, 70, 90, 100]);
    match events.last() {
        Some(SeparationEvent::Finished { stems, .. }) => assert!(!stems.is_valid()),
        other => panic!("expected finished, got {other:?}"),
    }
    assert!(!orch.has_cached_stems(env.source()));
}

#[test]
fn completed_table_keeps_only_recent_results() {
    let env = Env::new();
    let cfg = SeparatorConfig {
        mode: ExecutionMode::Mock,
        completed_retention: 2,
        ..env.config("exit 1")
    };
    let orch = SeparationOrchestrator::new(cfg);
    orch.initialize().unwrap();
    let rx = orch.subscribe();
    let src = env.source();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = orch.start_separation(&src).unwrap();
        let (_, done) = collect_until(&rx, WAIT, finished_for(&id));
        assert!(done);
        ids.push(id);
    }
    orch.cleanup_finished_jobs();
    assert_eq!(orch.get_processing_state(&ids[0]), ProcessingState::Idle);
    assert_eq!(orch.get_processing_state(&ids[1]), ProcessingState::Completed);
    assert_eq!(orch.get_processing_state(&ids[2]), ProcessingState::Completed);
}

#[test]
fn configuration_setters() {
    let env = Env::new();
    let orch = env.orchestrator(COPIES_SOURCE);
    assert_eq!(orch.model_name(), "htdemucs");
    orch.set_model_name("htdemucs_ft").unwrap();
    assert_eq!(orch.model_name(), "htdemucs_ft");
    assert!(orch.set_model_name("  ").is_err());
    assert!(orch.available_models().contains(&"mdx_extra"));

    let out = env.path("elsewhere/nested");
    orch.set_output_directory(&out).unwrap();
    assert!(out.is_dir());
    assert_eq!(orch.output_directory(), out);
    orch.set_max_cache_entries(3).unwrap();
}

#[cfg(unix)]
#[test]
fn live_job_hands_over_a_running_session() {
    let env = Env::new();
    let body = r#"
for s in vocals drums bass other; do mkfifo "$4/$s.pipe"; done
echo "READY"
exec sleep 30
"#;
    let orch = env.orchestrator(body);
    let rx = orch.subscribe();
    let id = orch.start_live_separation(env.source()).unwrap();

    let (events, done) = collect_until(&rx, WAIT, |ev| {
        matches!(ev, SeparationEvent::LiveStemsReady { .. } | SeparationEvent::Error { .. })
    });
    assert!(done, "{events:?}");
    match events.last() {
        Some(SeparationEvent::LiveStemsReady { job_id, stems }) => {
            assert_eq!(job_id, &id);
            assert!(stems.is_valid());
            assert!(stems.is_live());
        }
        other => panic!("expected live stems, got {other:?}"),
    }
    assert!(orch.get_results(&id).is_live());
    assert!(!orch.has_cached_stems(env.source()));
    assert!(orch.stop_live_session(&id));
    assert!(!orch.stop_live_session(&id));
}

/// Returns `stems` for each job once released, whatever happened meanwhile.
struct GatedRunner {
    gate: Receiver<()>,
    stems: StemSet,
}

impl JobRunner for GatedRunner {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn run(&self, _spec: &JobSpec, _ctx: &JobContext) -> stem_mixer_core::Result<JobOutput> {
        let _ = self.gate.recv();
        Ok(JobOutput::Stems(self.stems.clone()))
    }
}

fn gated(env: &Env) -> (SeparationOrchestrator, Sender<()>) {
    let stem = |name: &str| Some(write_dc_wav(&env.path(name), 44_100, 2, 0.1, 0.3));
    let stems = StemSet::new(stem("v.wav"), stem("d.wav"), stem("b.wav"), stem("o.wav"));
    let (release, gate) = bounded(16);
    let orch = SeparationOrchestrator::with_runner(
        env.config(""),
        Arc::new(GatedRunner { gate, stems }),
    );
    orch.initialize().unwrap();
    (orch, release)
}

#[test]
fn cancel_before_publication_keeps_stems_out_of_the_cache() {
    let env = Env::new();
    let (orch, release) = gated(&env);
    let rx = orch.subscribe();
    let src = env.source();

    let id = orch.start_separation(&src).unwrap();
    assert!(orch.cancel_separation(&id));
    release.send(()).unwrap();

    let (events, done) = collect_until(&rx, WAIT, finished_for(&id));
    assert!(done, "{events:?}");
    assert!(matches!(events.last(), Some(SeparationEvent::Cancelled { .. })));
    assert!(!events.iter().any(|e| matches!(e, SeparationEvent::CacheUpdated)));
    assert!(!orch.has_cached_stems(&src));
    assert!(!orch.get_results(&id).is_valid());
}

#[test]
fn cancel_racing_completion_is_all_or_nothing() {
    let env = Env::new();
    let (orch, release) = gated(&env);
    let rx = orch.subscribe();

    for i in 0..20 {
        let src = write_dc_wav(&env.path(&format!("song{i}.wav")), 44_100, 2, 0.1, 0.01 * (i + 1) as f32);
        let id = orch.start_separation(&src).unwrap();
        release.send(()).unwrap();
        let cancelled = orch.cancel_separation(&id);

        let (events, done) = collect_until(&rx, WAIT, finished_for(&id));
        assert!(done, "iteration {i}: {events:?}");
        let finished = matches!(events.last(), Some(SeparationEvent::Finished { .. }));
        assert_eq!(finished, !cancelled, "iteration {i}");
        assert_eq!(orch.has_cached_stems(&src), finished, "iteration {i}");
        assert_eq!(orch.get_results(&id).is_valid(), finished, "iteration {i}");
    }
}

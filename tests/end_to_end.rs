#![cfg(unix)]

mod common;

use approx::assert_abs_diff_eq;
use common::{captured_len, collect_until, eventually, init_logging, paced_capture, write_dc_wav};
use stem_mixer_core::{
    ExecutionMode, MixingPipeline, PipelineConfig, SeparationEvent, SeparationOrchestrator,
    SeparatorConfig, Stem,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

const WAIT: Duration = Duration::from_secs(20);

#[test]
fn separated_stems_play_through_the_mixer() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let fixtures = dir.path().join("fixtures");
    std::fs::create_dir_all(&fixtures).unwrap();
    for (stem, level) in Stem::all().iter().zip([0.1, 0.2, 0.3, 0.4]) {
        write_dc_wav(&fixtures.join(format!("{}.wav", stem.name())), 44_100, 2, 3.0, level);
    }

    let script = dir.path().join("separate.sh");
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\necho PROGRESS:50\nfor s in vocals drums bass other; do cp \"{}/$s.wav\" \"$4/song_$s.wav\"; done\necho SEPARATION_COMPLETE\n",
            fixtures.display()
        ),
    )
    .unwrap();
    let orch = SeparationOrchestrator::new(SeparatorConfig {
        interpreter: "/bin/sh".into(),
        script: Some(script.clone()),
        live_script: Some(script),
        mode: ExecutionMode::External,
        output_dir: dir.path().join("out"),
        cache_dir: dir.path().join("cache"),
        poll_interval_ms: 50,
        settle_ms: 10,
        ..Default::default()
    });
    orch.initialize().unwrap();

    let events = orch.subscribe();
    let source = write_dc_wav(&dir.path().join("song.wav"), 44_100, 2, 0.25, 0.5);
    let id = orch.start_separation(&source).unwrap();
    let (seen, done) = collect_until(&events, WAIT, |ev| {
        matches!(ev, SeparationEvent::Finished { .. } | SeparationEvent::Error { .. })
    });
    assert!(done, "{seen:?}");
    let stems = orch.get_results(&id);
    assert!(stems.is_valid());
    assert!(stems.path(Stem::Vocals).unwrap().ends_with("song_vocals.wav"));

    let captured = Arc::new(Mutex::new(Vec::new()));
    let pipeline = MixingPipeline::new(PipelineConfig::default(), paced_capture(captured.clone()));
    assert!(pipeline.load_stems(&stems));
    assert!(eventually(WAIT, || pipeline.duration() > 0));
    assert!((2990..=3010).contains(&pipeline.duration()));
    assert!(pipeline.play());

    assert!(eventually(WAIT, || captured_len(&captured) >= 2 * 22_050));
    assert!(pipeline.set_stem_mute(Stem::Vocals.index(), true));
    let mark = captured_len(&captured);
    let block = 2 * pipeline.config().block_frames;
    assert!(eventually(WAIT, || captured_len(&captured) >= mark + 6 * block));
    assert!(pipeline.position() > 500);

    let mix = captured.lock().unwrap().clone();
    for s in &mix[mark - 3 * block..mark - 2 * block] {
        assert_abs_diff_eq!(*s, 1.0, epsilon = 0.01);
    }
    for s in &mix[mark + 3 * block..mark + 4 * block] {
        assert_abs_diff_eq!(*s, 0.9, epsilon = 0.01);
    }
    pipeline.clear_stems();
    orch.shutdown();
}

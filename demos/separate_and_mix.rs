//! Separate one file and render a karaoke mix (vocals muted) to WAV.
//!
//! Usage: separate_and_mix <input> [mix.wav] [config.json]
//!
//! With the `device-output` feature, pass `-` as the mix path to listen on
//! the default output device instead.

use std::{sync::Arc, time::Duration};

use stem_mixer_core::{
    AudioSink, MixingPipeline, PipelineConfig, PipelineEvent, SeparationEvent,
    SeparationOrchestrator, SeparatorConfig, SinkFactory, Stem, WavSink,
};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let input = args.next().unwrap_or_else(|| "1.mp3".into());
    let mix_path = args.next().unwrap_or_else(|| "./karaoke.wav".into());

    let mut config = match args.next() {
        Some(path) => SeparatorConfig::from_json_file(path)?,
        None => SeparatorConfig::default(),
    };
    config.apply_env_overrides();

    let orch = SeparationOrchestrator::new(config);
    let mode = orch.initialize()?;
    eprintln!("> separating with {} ({mode:?})", orch.model_name());

    let events = orch.subscribe();
    let id = orch.start_separation(&input)?;
    let stems = loop {
        match events.recv()? {
            SeparationEvent::Progress { job_id, progress } if job_id == id => {
                eprint!("\rSplit: {progress:>3}%");
            }
            SeparationEvent::Finished { job_id, stems } if job_id == id => {
                eprintln!();
                break stems;
            }
            SeparationEvent::Error { job_id, message, class } if job_id == id => {
                eprintln!();
                anyhow::bail!("separation failed ({class:?}): {message}");
            }
            _ => {}
        }
    };
    if !stems.is_valid() {
        eprintln!("No stems produced (mock mode?), nothing to mix.");
        return Ok(());
    }
    for (stem, path) in stems.paths() {
        eprintln!("  {:<7} {}", stem.name(), path.map(|p| p.display().to_string()).unwrap_or_default());
    }

    let factory = sink_for(&mix_path);
    let pipeline = MixingPipeline::new(PipelineConfig::default(), factory);
    pipeline.set_stem_mute(Stem::Vocals.index(), true);

    let mixer_events = pipeline.subscribe();
    if !pipeline.load_stems(&stems) || !pipeline.play() {
        anyhow::bail!("could not start the mixing pipeline");
    }
    loop {
        match mixer_events.recv_timeout(Duration::from_secs(30))? {
            PipelineEvent::Position { ms } => eprint!("\rMix: {:.1}s", ms as f64 / 1000.0),
            PipelineEvent::EndOfStream => break,
            PipelineEvent::Error(e) => anyhow::bail!("mixing failed: {e}"),
            PipelineEvent::StateChanged(_) => {}
        }
    }
    pipeline.clear_stems();
    eprintln!("\nDone: {mix_path}");
    Ok(())
}

#[cfg(feature = "device-output")]
fn sink_for(mix_path: &str) -> SinkFactory {
    if mix_path == "-" {
        return stem_mixer_core::DeviceSink::factory();
    }
    wav_factory(mix_path)
}

#[cfg(not(feature = "device-output"))]
fn sink_for(mix_path: &str) -> SinkFactory {
    wav_factory(mix_path)
}

fn wav_factory(mix_path: &str) -> SinkFactory {
    let out = mix_path.to_string();
    Arc::new(move |rate: u32| -> stem_mixer_core::Result<Box<dyn AudioSink>> {
        Ok(Box::new(WavSink::create(&out, rate)?))
    })
}

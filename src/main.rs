mod cli;
mod encode;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use cli::Cli;
use encode::ffmpeg::FfmpegEncoder;
use segue::audio::decode::decode_file;
use segue::config::{self, Config};
use segue::orchestrator::parse_target_duration;
use segue::{CancellationToken, JobRequest, JobStage, MixOrchestrator, Track};

fn find_config(explicit: Option<&PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.clone());
    }
    let local = PathBuf::from("segue.toml");
    if local.exists() {
        return Some(local);
    }
    if let Some(home) = dirs::home_dir() {
        let xdg = home.join(".config").join("segue").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        let platform = config_dir.join("segue").join("config.toml");
        if platform.exists() {
            return Some(platform);
        }
    }
    None
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    // Load config: explicit --config path, or auto-detect segue.toml / global config
    let mut config = match find_config(cli.config.as_ref()) {
        Some(path) => match config::load_config(&path) {
            Ok(cfg) => {
                log::info!("Loaded config from {}", path.display());
                cfg
            }
            Err(err) if cli.config.is_some() => {
                return Err(err).with_context(|| format!("Failed to load config from {}", path.display()));
            }
            Err(err) => {
                log::warn!("Ignoring config at {}: {}", path.display(), err);
                Config::default()
            }
        },
        None => Config::default(),
    };
    cli.apply_to(&mut config);
    config.validate().context("Invalid options")?;

    for input in &cli.inputs {
        if !input.exists() {
            anyhow::bail!("Input file not found: {}", input.display());
        }
    }

    log::info!("segue - beat-synchronised mixer");
    log::info!(
        "Options: sync_beats={} match_tempo={} harmonic_mix={} auto={} bars={} style={:?}",
        config.mix.sync_beats,
        config.mix.match_tempo,
        config.mix.harmonic_mix,
        config.mix.auto_detect_transition,
        config.mix.transition_bars,
        config.mix.style
    );

    // 1. Decode inputs
    let mut tracks = Vec::with_capacity(cli.inputs.len());
    for input in &cli.inputs {
        let buffer = decode_file(input)?;
        tracks.push(Track::new(input.display().to_string(), buffer));
    }

    // 2. Build the job request
    let analyze_only = config.mix.analyze_only;
    let request = if analyze_only {
        JobRequest::Analyze { tracks }
    } else if let Some(ref duration) = cli.extend {
        let target_secs = parse_target_duration(duration)?;
        let mut tracks = tracks.into_iter();
        let (Some(track), None) = (tracks.next(), tracks.next()) else {
            anyhow::bail!("--extend takes exactly one input file");
        };
        JobRequest::Extend { track, target_secs }
    } else if tracks.len() >= 2 {
        JobRequest::Mix { tracks }
    } else {
        anyhow::bail!("Mixing needs at least two input files (use --extend or --analyze-only for one)");
    };
    let output_path = if analyze_only {
        None
    } else {
        Some(cli.output.clone().context("Output file is required unless --analyze-only is set")?)
    };

    // 3. Run the job
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} [{elapsed_precise}] {msg}")
            .context("Invalid progress template")?,
    );
    spinner.enable_steady_tick(Duration::from_millis(120));

    let orchestrator = MixOrchestrator::new(config);
    let on_stage = |stage: &JobStage| spinner.set_message(stage.label());
    let output = orchestrator
        .run_with(request, &CancellationToken::new(), &on_stage)
        .context("Job failed")?;
    spinner.finish_and_clear();

    // 4. Report
    print!("{}", output.report);
    if let Some(ref path) = cli.report {
        output
            .report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        log::info!("Report written to {}", path.display());
    }

    // 5. Encode
    let (Some(buffer), Some(output_path)) = (output.buffer, output_path) else {
        return Ok(());
    };
    log::info!("Starting FFmpeg encoder...");
    let mut encoder = FfmpegEncoder::new(
        &output_path,
        buffer.sample_rate(),
        buffer.channel_count(),
        cli.codec.as_deref(),
        cli.bitrate.as_deref(),
    )?;

    let pb = ProgressBar::new(buffer.frames() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} frames ({eta} remaining)")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );
    encoder.write_buffer(&buffer, |written| pb.set_position(written as u64))?;
    pb.finish_with_message("Encoding complete");

    encoder.finish()?;

    log::info!("Done! Output: {}", output_path.display());
    Ok(())
}

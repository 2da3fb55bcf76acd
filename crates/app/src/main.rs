use std::{f64::consts::PI, path::PathBuf};

use audio_worker_core::{
    AppConfig, AudioWorkerService, BeatDetectionOptions, DownsampleMethod, FftProcessOptions,
    FindPeaksOptions, FrequencyConversionOptions, LevelOptions, SmoothDataOptions,
    SpectrumAnalyser, TimeDomainOptions, WaveformDownsampleOptions,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> audio_worker_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { config, frequency } => {
            run_demo(load_config(config.as_ref())?, frequency).await
        }
        Commands::Stress {
            config,
            requests,
            max_pending,
            timeout_ms,
        } => {
            let mut app = load_config(config.as_ref())?;
            if let Some(max_pending) = max_pending {
                app.worker.max_pending_requests = max_pending;
            }
            if let Some(timeout_ms) = timeout_ms {
                app.worker.timeout_ms = timeout_ms;
            }
            run_stress(app, requests).await
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> audio_worker_core::Result<AppConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            AppConfig::from_path(path)
        }
        None => Ok(AppConfig::default()),
    }
}

async fn run_demo(app: AppConfig, frequency: f64) -> audio_worker_core::Result<()> {
    tracing::info!(frequency, sample_rate = app.audio.sample_rate, "starting demo");

    let service = AudioWorkerService::new(app.worker.clone());
    let sample_rate = f64::from(app.audio.sample_rate);
    let fft_size = app.audio.fft_size;

    let samples = tone(frequency, sample_rate, fft_size);
    let frequency_data = SpectrumAnalyser::new().byte_frequency_data(&samples, fft_size)?;
    let time_domain: Vec<f64> = samples.iter().map(|s| (128.0 + 127.0 * s).round()).collect();

    let fft_options = FftProcessOptions {
        sample_rate,
        fft_size,
        ..FftProcessOptions::new(frequency_data.clone())
    };
    let fft = service.run_with_local_fallback(&fft_options).await?;

    let time = service
        .run_with_local_fallback(&TimeDomainOptions {
            time_domain_data: time_domain.clone(),
            output_samples: Some(64),
        })
        .await?;

    let levels = service
        .run_with_local_fallback(&LevelOptions {
            data: time_domain,
            is_float_data: false,
        })
        .await?;

    let beat = service
        .run_with_local_fallback(&BeatDetectionOptions {
            frequency_data: frequency_data.clone(),
            ..Default::default()
        })
        .await?;

    let waveform = service
        .run_with_local_fallback(&WaveformDownsampleOptions {
            samples: samples.clone(),
            output_length: 32,
            method: DownsampleMethod::MinMax,
        })
        .await?;

    let smoothed = service
        .run_with_local_fallback(&SmoothDataOptions {
            data: fft.processed_data.clone(),
            ..Default::default()
        })
        .await?;

    let peaks = service
        .run_with_local_fallback(&FindPeaksOptions {
            data: frequency_data,
            threshold: 50.0,
            min_distance: 2,
        })
        .await?;

    let hertz = service
        .run_with_local_fallback(&FrequencyConversionOptions {
            bins: peaks.dominant_peaks.iter().map(|p| p.index as f64).collect(),
            sample_rate,
            fft_size,
            to_hz: true,
        })
        .await?;

    let frames = vec![fft_options; 4];
    let batch = match service.process_fft_batch(&frames).await {
        Ok(results) => results.len(),
        Err(err) => {
            tracing::warn!(%err, "batch processing failed");
            0
        }
    };

    let report = json!({
        "processFFT": fft,
        "processTimeDomain": time,
        "calculateLevels": levels,
        "detectBeat": beat,
        "downsampleWaveform": waveform,
        "smoothData": smoothed,
        "findPeaks": peaks,
        "convertFrequencies": hertz,
        "batchFrames": batch,
        "stats": service.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_stress(app: AppConfig, requests: usize) -> audio_worker_core::Result<()> {
    tracing::info!(
        requests,
        max_pending = app.worker.max_pending_requests,
        timeout_ms = app.worker.timeout_ms,
        "starting stress run"
    );

    let service = AudioWorkerService::new(app.worker.clone());
    if !service.is_available() {
        return Err(audio_worker_core::AudioWorkerError::NotInitialized);
    }

    let sample_rate = f64::from(app.audio.sample_rate);
    let samples = tone(440.0, sample_rate, app.audio.fft_size);
    let frame = FftProcessOptions {
        sample_rate,
        fft_size: app.audio.fft_size,
        ..FftProcessOptions::new(
            SpectrumAnalyser::new().byte_frequency_data(&samples, app.audio.fft_size)?,
        )
    };

    let replies: Vec<_> = (0..requests).map(|_| service.process_fft(&frame)).collect();
    let outcomes = futures::future::join_all(replies).await;

    let (mut completed, mut evicted, mut timed_out, mut failed) = (0, 0, 0, 0);
    for outcome in &outcomes {
        match outcome {
            Ok(_) => completed += 1,
            Err(err) if err.is_overflow() => evicted += 1,
            Err(err) if err.is_timeout() => timed_out += 1,
            Err(_) => failed += 1,
        }
    }

    let report = json!({
        "requests": requests,
        "completed": completed,
        "evicted": evicted,
        "timedOut": timed_out,
        "failed": failed,
        "stats": service.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn tone(frequency: f64, sample_rate: f64, len: usize) -> Vec<f64> {
    (0..len)
        .map(|n| 0.5 * (2.0 * PI * frequency * n as f64 / sample_rate).sin())
        .collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio analysis offloaded to a background worker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every analysis operation on a synthesized tone and print the results.
    Demo {
        /// Optional JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Frequency of the test tone in Hz.
        #[arg(short, long, default_value_t = 440.0)]
        frequency: f64,
    },
    /// Fire many concurrent requests and report how they settled.
    Stress {
        /// Optional JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of requests dispatched at once.
        #[arg(short, long, default_value_t = 500)]
        requests: usize,
        /// Overrides the queue ceiling from the configuration.
        #[arg(long)]
        max_pending: Option<usize>,
        /// Overrides the per-request timeout from the configuration.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

//! Background worker dispatch for audio analysis.
//!
//! The crate offloads audio math (FFT post-processing, levels, beat
//! detection, waveform downsampling, smoothing, peak finding, frequency
//! conversion) onto a single background worker. Each module owns one layer:
//! the processing functions, the message contract, the worker runtime and the
//! dispatch service that correlates requests with responses under timeouts and
//! a bounded queue.

pub mod analysis;
pub mod config;
pub mod error;
pub mod protocol;
pub mod service;
pub mod worker;

pub use analysis::{
    byte_frequency_data, BeatDetectionOptions, BeatDetectionResult, DownsampleMethod,
    FftProcessOptions, FftProcessResult, FindPeaksOptions, FindPeaksResult,
    FrequencyConversionOptions, FrequencyConversionResult, LevelOptions, LevelResult, Operation,
    Peak, SmoothDataOptions, SmoothDataResult, SmoothingMethod, SpectrumAnalyser,
    TimeDomainOptions, TimeDomainResult, WaveformDownsampleOptions, WaveformDownsampleResult,
};
pub use config::{AppConfig, AudioConfig, WorkerConfig, WorkerConfigUpdate};
pub use error::{AudioWorkerError, Result};
pub use protocol::{OperationKind, RequestId, WorkerMessage, WorkerResponse};
pub use service::{AudioWorkerService, Reply, WorkerStats};
pub use worker::{ThreadBackend, WorkerBackend, WorkerEvent, WorkerEvents, WorkerHandle};

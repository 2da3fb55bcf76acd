use std::{f64::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex64, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use super::Operation;
use crate::{protocol::OperationKind, AudioWorkerError, Result};

const PEAK_THRESHOLD: f64 = 50.0;
const MAX_ENERGY_HISTORY: usize = 43;
const MIN_DECIBELS: f64 = -100.0;
const MAX_DECIBELS: f64 = -30.0;

/// Options of the `processFFT` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FftProcessOptions {
    /// Byte-scaled magnitudes, one per analyser bin.
    pub frequency_data: Vec<f64>,
    pub smoothing_factor: f64,
    /// Output of the previous frame; blended in when its length matches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<Vec<f64>>,
    pub logarithmic: bool,
    pub output_bins: usize,
    pub min_frequency: f64,
    pub max_frequency: f64,
    pub sample_rate: f64,
    pub fft_size: usize,
}

impl Default for FftProcessOptions {
    fn default() -> Self {
        Self {
            frequency_data: Vec::new(),
            smoothing_factor: 0.8,
            previous_data: None,
            logarithmic: false,
            output_bins: 64,
            min_frequency: 20.0,
            max_frequency: 20_000.0,
            sample_rate: 44_100.0,
            fft_size: 2048,
        }
    }
}

impl FftProcessOptions {
    pub fn new(frequency_data: Vec<f64>) -> Self {
        Self {
            frequency_data,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FftProcessResult {
    pub processed_data: Vec<f64>,
    /// Indices of local maxima louder than the peak threshold.
    pub peaks: Vec<usize>,
    pub average_level: f64,
    pub dominant_frequency: f64,
}

impl Operation for FftProcessOptions {
    const KIND: OperationKind = OperationKind::ProcessFft;
    type Output = FftProcessResult;

    fn run(&self) -> Result<FftProcessResult> {
        let input = &self.frequency_data;
        if input.is_empty() {
            return Err(AudioWorkerError::InvalidInput(
                "processFFT requires frequency data",
            ));
        }
        if self.output_bins == 0 {
            return Err(AudioWorkerError::InvalidInput(
                "processFFT requires at least one output bin",
            ));
        }
        if self.sample_rate <= 0.0 || self.fft_size == 0 {
            return Err(AudioWorkerError::InvalidInput(
                "processFFT requires a positive sample rate and fft size",
            ));
        }
        if self.logarithmic && (self.min_frequency <= 0.0 || self.max_frequency <= 0.0) {
            return Err(AudioWorkerError::InvalidInput(
                "logarithmic scaling requires positive frequency bounds",
            ));
        }

        let bins = self.output_bins;
        let fft_size = self.fft_size as f64;
        let log_min = self.min_frequency.ln();
        let log_range = self.max_frequency.ln() - log_min;

        let mut processed: Vec<f64> = if self.logarithmic {
            (0..bins)
                .map(|i| {
                    let freq = (log_min + (i as f64 / bins as f64) * log_range).exp();
                    let bin = (freq * fft_size / self.sample_rate).round() as usize;
                    input[bin.min(input.len() - 1)]
                })
                .collect()
        } else {
            let step = (input.len() / bins).max(1);
            (0..bins)
                .map(|i| {
                    let start = i * step;
                    let end = (start + step).min(input.len());
                    if start >= end {
                        0.0
                    } else {
                        input[start..end].iter().sum::<f64>() / (end - start) as f64
                    }
                })
                .collect()
        };

        if let Some(previous) = &self.previous_data {
            if previous.len() == processed.len() {
                let s = self.smoothing_factor;
                for (value, prev) in processed.iter_mut().zip(previous) {
                    *value = s * prev + (1.0 - s) * *value;
                }
            }
        }

        let peaks = processed
            .windows(3)
            .enumerate()
            .filter(|(_, w)| w[1] > w[0] && w[1] > w[2] && w[1] > PEAK_THRESHOLD)
            .map(|(i, _)| i + 1)
            .collect();

        let average_level = processed.iter().sum::<f64>() / processed.len() as f64;

        let mut max_value = 0.0;
        let mut dominant_bin = 0;
        for (i, value) in processed.iter().enumerate() {
            if *value > max_value {
                max_value = *value;
                dominant_bin = i;
            }
        }

        let dominant_frequency = if self.logarithmic {
            (log_min + (dominant_bin as f64 / bins as f64) * log_range).exp()
        } else {
            dominant_bin as f64 * self.sample_rate / fft_size
        };

        Ok(FftProcessResult {
            processed_data: processed,
            peaks,
            average_level,
            dominant_frequency,
        })
    }
}

/// Options of the `detectBeat` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BeatDetectionOptions {
    pub frequency_data: Vec<f64>,
    /// Energies of the previous frames, oldest first.
    pub energy_history: Vec<f64>,
    pub sensitivity: f64,
    /// Start (inclusive) and end (exclusive) bin of the bass band.
    pub low_freq_band: (usize, usize),
}

impl Default for BeatDetectionOptions {
    fn default() -> Self {
        Self {
            frequency_data: Vec::new(),
            energy_history: Vec::new(),
            sensitivity: 1.5,
            low_freq_band: (0, 10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeatDetectionResult {
    pub is_beat: bool,
    pub energy: f64,
    pub average_energy: f64,
    /// History including this frame, capped at the last 43 entries.
    pub updated_history: Vec<f64>,
    pub beat_strength: f64,
}

impl Operation for BeatDetectionOptions {
    const KIND: OperationKind = OperationKind::DetectBeat;
    type Output = BeatDetectionResult;

    fn run(&self) -> Result<BeatDetectionResult> {
        let (start, end) = self.low_freq_band;
        let end = end.min(self.frequency_data.len());
        if start >= end {
            return Err(AudioWorkerError::InvalidInput(
                "beat detection band contains no bins",
            ));
        }

        let band = &self.frequency_data[start..end];
        let energy = super::compute_rms(band);

        let average_energy = if self.energy_history.is_empty() {
            energy
        } else {
            self.energy_history.iter().sum::<f64>() / self.energy_history.len() as f64
        };

        let is_beat = energy > average_energy * self.sensitivity;
        let beat_strength = if average_energy > 0.0 {
            energy / average_energy
        } else {
            0.0
        };

        let mut updated_history = self.energy_history.clone();
        updated_history.push(energy);
        if updated_history.len() > MAX_ENERGY_HISTORY {
            let overflow = updated_history.len() - MAX_ENERGY_HISTORY;
            updated_history.drain(0..overflow);
        }

        Ok(BeatDetectionResult {
            is_beat,
            energy,
            average_energy,
            updated_history,
            beat_strength,
        })
    }
}

/// Options of the `convertFrequencies` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencyConversionOptions {
    pub bins: Vec<f64>,
    pub sample_rate: f64,
    pub fft_size: usize,
    /// Bin to Hz when true, Hz to (rounded) bin otherwise.
    #[serde(default = "default_to_hz")]
    pub to_hz: bool,
}

fn default_to_hz() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyConversionResult {
    pub frequencies: Vec<f64>,
}

impl Operation for FrequencyConversionOptions {
    const KIND: OperationKind = OperationKind::ConvertFrequencies;
    type Output = FrequencyConversionResult;

    fn run(&self) -> Result<FrequencyConversionResult> {
        if self.sample_rate <= 0.0 || self.fft_size == 0 {
            return Err(AudioWorkerError::InvalidInput(
                "frequency conversion requires a positive sample rate and fft size",
            ));
        }

        let fft_size = self.fft_size as f64;
        let frequencies = self
            .bins
            .iter()
            .map(|value| {
                if self.to_hz {
                    value * self.sample_rate / fft_size
                } else {
                    (value * fft_size / self.sample_rate).round()
                }
            })
            .collect();

        Ok(FrequencyConversionResult { frequencies })
    }
}

/// Turns raw samples into byte-scaled magnitudes, the input format of
/// `processFFT`, reusing FFT plans between calls of the same size.
pub struct SpectrumAnalyser {
    planner: RealFftPlanner<f64>,
    fft: Option<FftResources>,
}

impl Default for SpectrumAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectrumAnalyser {
    pub fn new() -> Self {
        Self {
            planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Hann-windows the first `fft_size` samples (zero padded when short) and
    /// maps each bin below Nyquist onto 0..=255 over a -100..-30 dB range.
    pub fn byte_frequency_data(&mut self, samples: &[f64], fft_size: usize) -> Result<Vec<f64>> {
        if fft_size < 2 {
            return Err(AudioWorkerError::InvalidInput(
                "spectrum analysis requires an fft size of at least two",
            ));
        }

        let fft = self.prepare_fft(fft_size);
        for (index, slot) in fft.input.iter_mut().enumerate() {
            let sample = samples.get(index).copied().unwrap_or(0.0);
            *slot = sample * hann_value(index, fft_size);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|err| AudioWorkerError::msg(format!("fft failed: {err}")))?;

        let scale = 1.0 / fft_size as f64;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        Ok(fft.spectrum[..fft_size / 2]
            .iter()
            .map(|bin| {
                let magnitude = bin.norm() * scale;
                let db = if magnitude > 0.0 {
                    20.0 * magnitude.log10()
                } else {
                    MIN_DECIBELS
                };
                (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0).floor()
            })
            .collect())
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        if let Some(fft) = self.fft.take().filter(|fft| fft.size == size) {
            return self.fft.insert(fft);
        }

        let plan = self.planner.plan_fft_forward(size);
        let scratch = plan.make_scratch_vec();
        let spectrum = plan.make_output_vec();
        let input = plan.make_input_vec();
        self.fft.insert(FftResources {
            size,
            plan,
            scratch,
            spectrum,
            input,
        })
    }
}

/// One-shot convenience over [`SpectrumAnalyser::byte_frequency_data`].
pub fn byte_frequency_data(samples: &[f64], fft_size: usize) -> Result<Vec<f64>> {
    SpectrumAnalyser::new().byte_frequency_data(samples, fft_size)
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f64>>,
    scratch: Vec<Complex64>,
    spectrum: Vec<Complex64>,
    input: Vec<f64>,
}

impl fmt::Debug for SpectrumAnalyser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyser")
            .field("fft", &self.fft)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f64 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f64) / (len as f64 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_scaling_averages_bins() {
        let options = FftProcessOptions {
            output_bins: 2,
            ..FftProcessOptions::new(vec![10.0, 30.0, 100.0, 200.0])
        };
        let result = options.run().unwrap();

        assert_eq!(result.processed_data, vec![20.0, 150.0]);
        assert_eq!(result.average_level, 85.0);
        // Loudest bin is 1, which is 1 * 44100 / 2048 Hz.
        assert!((result.dominant_frequency - 44_100.0 / 2048.0).abs() < 1e-9);
    }

    #[test]
    fn peaks_require_threshold_and_local_maximum() {
        let result = FftProcessOptions {
            output_bins: 5,
            ..FftProcessOptions::new(vec![0.0, 40.0, 0.0, 120.0, 0.0])
        }
        .run()
        .unwrap();

        assert_eq!(result.peaks, vec![3]);
    }

    #[test]
    fn previous_frame_is_blended_when_lengths_match() {
        let result = FftProcessOptions {
            output_bins: 2,
            smoothing_factor: 0.5,
            previous_data: Some(vec![100.0, 0.0]),
            ..FftProcessOptions::new(vec![0.0, 100.0])
        }
        .run()
        .unwrap();
        assert_eq!(result.processed_data, vec![50.0, 50.0]);

        let ignored = FftProcessOptions {
            output_bins: 2,
            previous_data: Some(vec![1.0, 2.0, 3.0]),
            ..FftProcessOptions::new(vec![0.0, 100.0])
        }
        .run()
        .unwrap();
        assert_eq!(ignored.processed_data, vec![0.0, 100.0]);
    }

    #[test]
    fn logarithmic_scaling_clamps_to_input() {
        let data: Vec<f64> = (0..16).map(f64::from).collect();
        let result = FftProcessOptions {
            logarithmic: true,
            output_bins: 8,
            ..FftProcessOptions::new(data)
        }
        .run()
        .unwrap();

        assert_eq!(result.processed_data.len(), 8);
        assert_eq!(*result.processed_data.last().unwrap(), 15.0);
        assert!(result.dominant_frequency >= 20.0);
    }

    #[test]
    fn rejects_empty_frequency_data() {
        let err = FftProcessOptions::default().run().unwrap_err();
        assert!(matches!(err, AudioWorkerError::InvalidInput(_)));
    }

    #[test]
    fn beat_detected_on_energy_spike() {
        let result = BeatDetectionOptions {
            frequency_data: vec![200.0; 10],
            energy_history: vec![50.0; 4],
            ..Default::default()
        }
        .run()
        .unwrap();

        assert!(result.is_beat);
        assert_eq!(result.energy, 200.0);
        assert_eq!(result.average_energy, 50.0);
        assert_eq!(result.beat_strength, 4.0);
        assert_eq!(result.updated_history.len(), 5);
    }

    #[test]
    fn beat_history_is_capped() {
        let result = BeatDetectionOptions {
            frequency_data: vec![10.0; 4],
            energy_history: vec![1.0; MAX_ENERGY_HISTORY],
            ..Default::default()
        }
        .run()
        .unwrap();

        assert_eq!(result.updated_history.len(), MAX_ENERGY_HISTORY);
        assert_eq!(*result.updated_history.last().unwrap(), 10.0);
    }

    #[test]
    fn first_frame_is_never_a_beat() {
        let result = BeatDetectionOptions {
            frequency_data: vec![255.0; 10],
            ..Default::default()
        }
        .run()
        .unwrap();

        assert!(!result.is_beat);
        assert_eq!(result.beat_strength, 1.0);
    }

    #[test]
    fn converts_bins_and_hertz() {
        let to_hz = FrequencyConversionOptions {
            bins: vec![0.0, 1.0, 512.0],
            sample_rate: 48_000.0,
            fft_size: 1024,
            to_hz: true,
        }
        .run()
        .unwrap();
        assert_eq!(to_hz.frequencies, vec![0.0, 46.875, 24_000.0]);

        let to_bins = FrequencyConversionOptions {
            bins: vec![440.0],
            sample_rate: 48_000.0,
            fft_size: 1024,
            to_hz: false,
        }
        .run()
        .unwrap();
        assert_eq!(to_bins.frequencies, vec![9.0]);
    }

    #[test]
    fn spectrum_peaks_at_tone_frequency() {
        let sample_rate = 8_000.0;
        let fft_size = 256;
        // 1 kHz lands exactly on bin 32; the quiet amplitude keeps the bins
        // below the 255 ceiling.
        let samples: Vec<f64> = (0..fft_size)
            .map(|n| 0.001 * (2.0 * PI * 1_000.0 * n as f64 / sample_rate).sin())
            .collect();

        let mut analyser = SpectrumAnalyser::new();
        let bytes = analyser.byte_frequency_data(&samples, fft_size).unwrap();
        assert_eq!(bytes.len(), fft_size / 2);

        let loudest = bytes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(loudest, 32);
        assert!(bytes.iter().all(|b| (0.0..=255.0).contains(b)));
    }

    #[test]
    fn silence_maps_to_zero_bytes() {
        let bytes = byte_frequency_data(&[0.0; 64], 64).unwrap();
        assert!(bytes.iter().all(|b| *b == 0.0));
        assert!(byte_frequency_data(&[], 1).is_err());
    }
}
